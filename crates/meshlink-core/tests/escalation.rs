//! Role arbitration outcomes and emergency escalation

mod common;

use std::time::Duration;

use common::{client_config, config, host_and_client, spawn_node, wait_linked, wait_until};
use meshlink_core::{ConnectionPhase, ForcedRole, MemoryHub, RecoveryTier, Role};

#[tokio::test]
async fn test_lone_device_hosts() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, config("a"));
    assert_eq!(a.establish().await.unwrap(), Role::Host);
    assert!(hub.is_hosting("a"));
    assert_eq!(a.status().phase, ConnectionPhase::Connected);
}

#[tokio::test]
async fn test_forced_host_never_attempts_client_connect() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, config("a"));
    a.establish().await.unwrap();

    let mut forced = client_config("b");
    forced.connection.forced_role = Some(ForcedRole::Host);
    let b = spawn_node(&hub, forced);
    b.discover(true).await;
    assert_eq!(b.establish().await.unwrap(), Role::Host);
    assert_eq!(hub.connect_attempts("b"), 0);
    assert_eq!(b.status().forced_role, Some(ForcedRole::Host));
}

#[tokio::test]
async fn test_forcing_host_drops_client_session() {
    let hub = MemoryHub::new();
    let (_a, b) = host_and_client(&hub, config("a"), client_config("b")).await;
    let attempts = hub.connect_attempts("b");

    b.force_role(Some(ForcedRole::Host)).await;
    assert_eq!(b.status().phase, ConnectionPhase::Idle);
    assert_eq!(b.establish().await.unwrap(), Role::Host);
    assert_eq!(hub.connect_attempts("b"), attempts);
}

#[tokio::test]
async fn test_refused_client_falls_back_to_host() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, config("a"));
    a.establish().await.unwrap();

    let b = spawn_node(&hub, client_config("b"));
    hub.refuse("b", "a");
    assert_eq!(b.establish().await.unwrap(), Role::Host);
    assert_eq!(hub.connect_attempts("b"), 1);
    // Hosting counts as connected and clears the refusal
    assert_eq!(b.status().consecutive_failures, 0);
}

#[tokio::test]
async fn test_refused_forced_client_keeps_failure_count() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, config("a"));
    a.establish().await.unwrap();

    let mut forced = client_config("b");
    forced.connection.forced_role = Some(ForcedRole::Client);
    let b = spawn_node(&hub, forced);
    hub.refuse("b", "a");
    assert_eq!(b.establish().await.unwrap(), Role::None);
    assert_eq!(b.status().phase, ConnectionPhase::Idle);
    assert_eq!(b.status().consecutive_failures, 1);
}

#[tokio::test]
async fn test_inbound_link_does_not_demote_forced_host() {
    let hub = MemoryHub::new();
    let mut forced = config("a");
    forced.connection.forced_role = Some(ForcedRole::Host);
    let a = spawn_node(&hub, forced);
    let _b = spawn_node(&hub, config("b"));

    hub.link("a", "b");
    wait_linked(&a, 1).await;
    assert_ne!(a.status().role, Role::Client);
    assert_eq!(a.establish().await.unwrap(), Role::Host);
    assert_eq!(a.status().role, Role::Host);
    assert_eq!(hub.connect_attempts("a"), 0);
}

#[tokio::test]
async fn test_escalation_reaches_last_resort_then_resets() {
    let hub = MemoryHub::new();
    let mut client = client_config("b");
    client.connection.emergency = true;
    client.connection.failure_threshold = 5;
    client.connection.ping_timeout_ms = 30;
    let (_a, b) = host_and_client(&hub, config("a"), client).await;
    let attempts = hub.connect_attempts("b");
    hub.sever("a", "b");

    for expected in 1..=5 {
        b.keepalive_tick().await;
        assert!(
            wait_until(Duration::from_secs(1), || {
                b.status().consecutive_failures == expected
            })
            .await,
            "failure {} never counted",
            expected
        );
        if expected == 3 {
            assert_eq!(b.status().tier, RecoveryTier::Aggressive);
        }
    }
    assert!(
        wait_until(Duration::from_secs(1), || {
            b.status().phase == ConnectionPhase::Idle
        })
        .await
    );
    assert_eq!(b.status().tier, RecoveryTier::LastResort);

    // Last resort: host without trying to join anyone, and beacon
    assert_eq!(b.establish().await.unwrap(), Role::Host);
    assert_eq!(hub.connect_attempts("b"), attempts);
    assert_eq!(b.stats().beacons_sent, 1);
    assert!(wait_until(Duration::from_secs(1), || hub.beacons_sent("b") == 1).await);
    let status = b.status();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.tier, RecoveryTier::Normal);

    // A newcomer can still join the last-resort group
    hub.set_discoverable("a", false);
    let mut newcomer = config("c");
    newcomer.connection.forced_role = Some(ForcedRole::Client);
    let c = spawn_node(&hub, newcomer);
    assert_eq!(c.establish().await.unwrap(), Role::Client);
    assert!(
        wait_until(Duration::from_secs(1), || {
            let s = b.status();
            s.consecutive_failures == 0 && s.tier == RecoveryTier::Normal
        })
        .await
    );
}
