//! Shared helpers for mesh integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshlink_core::{
    EnvelopeStore, HostWeights, MemoryHub, MeshConfig, MeshNode, Role,
};

/// Config with a fixed device id and short timers
pub fn config(id: &str) -> MeshConfig {
    let mut config = MeshConfig {
        device_id: Some(id.to_string()),
        device_name: Some(id.to_uppercase()),
        ..Default::default()
    };
    config.discovery.timeout_ms = 2_000;
    config
}

/// Config whose arbitration always joins a lone visible host
pub fn client_config(id: &str) -> MeshConfig {
    let mut config = config(id);
    config.arbitration.weights = HostWeights {
        single_peer: 0.0,
        small_pool: 0.0,
        large_pool: 0.0,
        small_pool_max: 3,
    };
    config
}

/// Build a node on the hub and start its driver pumps, timers off
pub fn spawn_node(hub: &MemoryHub, config: MeshConfig) -> Arc<MeshNode> {
    let builder = MeshNode::builder(config);
    let driver = hub.driver(builder.identity());
    let node = builder.driver(driver).build().expect("build node");
    node.start_manual().expect("start node");
    node
}

/// Same as [`spawn_node`] with a caller-supplied store
pub fn spawn_node_with_store(
    hub: &MemoryHub,
    config: MeshConfig,
    store: Arc<dyn EnvelopeStore>,
) -> Arc<MeshNode> {
    let builder = MeshNode::builder(config);
    let driver = hub.driver(builder.identity());
    let node = builder.driver(driver).store(store).build().expect("build node");
    node.start_manual().expect("start node");
    node
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `node` has `count` handshaken links
pub async fn wait_linked(node: &MeshNode, count: usize) {
    assert!(
        wait_until(Duration::from_secs(2), || node.links().len() == count).await,
        "{} expected {} links, has {}",
        node.device_id(),
        count,
        node.links().len()
    );
}

/// Link every pair of nodes on the hub and wait for the handshakes
pub async fn full_mesh(hub: &MemoryHub, nodes: &[Arc<MeshNode>]) {
    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            hub.link(a.device_id().as_str(), b.device_id().as_str());
        }
    }
    for node in nodes {
        wait_linked(node, nodes.len() - 1).await;
    }
}

/// Link consecutive nodes into a chain and wait for the handshakes
pub async fn line(hub: &MemoryHub, nodes: &[Arc<MeshNode>]) {
    for pair in nodes.windows(2) {
        hub.link(pair[0].device_id().as_str(), pair[1].device_id().as_str());
    }
    for (i, node) in nodes.iter().enumerate() {
        let expected = if i == 0 || i == nodes.len() - 1 { 1 } else { 2 };
        wait_linked(node, expected.min(nodes.len() - 1)).await;
    }
}

/// A hosting and B joined as client
pub async fn host_and_client(
    hub: &MemoryHub,
    host: MeshConfig,
    client: MeshConfig,
) -> (Arc<MeshNode>, Arc<MeshNode>) {
    let a = spawn_node(hub, host);
    assert_eq!(a.establish().await.expect("host establish"), Role::Host);
    let b = spawn_node(hub, client);
    assert_eq!(b.establish().await.expect("client establish"), Role::Client);
    wait_linked(&a, 1).await;
    wait_linked(&b, 1).await;
    (a, b)
}
