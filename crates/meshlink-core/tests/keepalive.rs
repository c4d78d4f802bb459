//! Keep-alive supervision between a host and a client
//!
//! Links are severed on the hub so frames vanish while both ends still
//! believe the link is up, the way a half-open socket behaves.

mod common;

use std::time::Duration;

use common::{client_config, config, host_and_client, wait_until};
use meshlink_core::{ConnectionPhase, MemoryHub, MeshConfig, Role};

fn fast_pings(mut config: MeshConfig) -> MeshConfig {
    config.connection.ping_timeout_ms = 40;
    config
}

#[tokio::test]
async fn test_missed_pong_counts_exactly_once() {
    let hub = MemoryHub::new();
    let (_a, b) = host_and_client(&hub, config("a"), fast_pings(client_config("b"))).await;
    hub.sever("a", "b");

    b.keepalive_tick().await;
    assert!(
        wait_until(Duration::from_secs(1), || b.status().consecutive_failures == 1).await
    );
    assert_eq!(b.status().phase, ConnectionPhase::Degraded);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(b.status().consecutive_failures, 1);
}

#[tokio::test]
async fn test_three_failures_tear_down() {
    let hub = MemoryHub::new();
    let (a, b) = host_and_client(&hub, config("a"), fast_pings(client_config("b"))).await;
    hub.sever("a", "b");

    for expected in 1..=3 {
        b.keepalive_tick().await;
        assert!(
            wait_until(Duration::from_secs(1), || {
                b.status().consecutive_failures == expected
            })
            .await,
            "failure {} never counted",
            expected
        );
    }

    assert!(
        wait_until(Duration::from_secs(1), || {
            b.status().phase == ConnectionPhase::Idle
        })
        .await
    );
    let status = b.status();
    assert_eq!(status.role, Role::None);
    assert!(!status.connected);
    assert_eq!(status.consecutive_failures, 3);
    assert!(b.links().is_empty());
    assert!(wait_until(Duration::from_secs(1), || a.links().is_empty()).await);
}

#[tokio::test]
async fn test_answered_ping_recovers_degraded_link() {
    let hub = MemoryHub::new();
    let (_a, b) = host_and_client(&hub, config("a"), fast_pings(client_config("b"))).await;
    hub.sever("a", "b");

    b.keepalive_tick().await;
    assert!(
        wait_until(Duration::from_secs(1), || {
            b.status().phase == ConnectionPhase::Degraded
        })
        .await
    );

    hub.heal("a", "b");
    b.keepalive_tick().await;
    assert!(
        wait_until(Duration::from_secs(1), || {
            let s = b.status();
            s.phase == ConnectionPhase::Connected && s.consecutive_failures == 0
        })
        .await
    );
    assert!(b.status().last_keepalive_ok.is_some());
}

#[tokio::test]
async fn test_ping_backlog_forces_immediate_teardown() {
    let hub = MemoryHub::new();
    let mut client = client_config("b");
    client.connection.ping_timeout_ms = 60_000;
    client.connection.ping_backlog_limit = 2;
    let (_a, b) = host_and_client(&hub, config("a"), client).await;
    hub.sever("a", "b");

    b.keepalive_tick().await;
    b.keepalive_tick().await;
    assert_eq!(b.status().phase, ConnectionPhase::Connected);

    b.keepalive_tick().await;
    assert_eq!(b.status().phase, ConnectionPhase::Idle);
    assert_eq!(b.status().role, Role::None);
}
