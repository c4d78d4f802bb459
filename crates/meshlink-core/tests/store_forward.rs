//! Store-and-forward queue behavior across links and restarts

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, spawn_node, spawn_node_with_store, wait_linked, wait_until};
use meshlink_core::{
    now_millis, Envelope, EnvelopeOrigin, EnvelopeStore, LocalIdentity, MemoryHub, MemoryStore,
    MessageKind, OutboundMessage, RedbStore,
};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[tokio::test]
async fn test_queued_envelope_delivered_once_target_is_reachable() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, config("a"));

    a.send(OutboundMessage::text("are you safe?").to("c"))
        .await
        .unwrap();
    assert_eq!(a.status().queued_messages, 1);

    let c = spawn_node(&hub, config("c"));
    hub.link("a", "c");
    a.flush_queue().await;

    assert!(wait_until(Duration::from_secs(2), || c.stats().delivered == 1).await);
    assert_eq!(a.status().queued_messages, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(c.stats().delivered, 1);
    assert_eq!(a.stats().flushed, 1);
}

#[tokio::test]
async fn test_queued_envelope_reaches_target_through_a_relay() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, config("a"));
    a.send(OutboundMessage::text("two hops away").to("c"))
        .await
        .unwrap();
    assert_eq!(a.status().queued_messages, 1);

    let b = spawn_node(&hub, config("b"));
    let c = spawn_node(&hub, config("c"));
    hub.link("b", "c");
    wait_linked(&b, 1).await;
    wait_linked(&c, 1).await;
    hub.link("a", "b");
    wait_linked(&a, 1).await;
    a.flush_queue().await;

    assert!(wait_until(Duration::from_secs(2), || c.stats().delivered == 1).await);
    assert_eq!(a.status().queued_messages, 0);
    assert_eq!(b.stats().delivered, 0);
    assert_eq!(b.stats().forwarded, 1);
}

#[tokio::test]
async fn test_broadcast_with_nobody_around_waits_for_any_peer() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub, config("a"));
    a.send(OutboundMessage::text("anyone?")).await.unwrap();
    assert_eq!(a.status().queued_messages, 1);

    let b = spawn_node(&hub, config("b"));
    hub.link("a", "b");
    assert!(wait_until(Duration::from_secs(2), || b.stats().delivered == 1).await);
    assert_eq!(a.status().queued_messages, 0);
}

#[tokio::test]
async fn test_day_old_entries_are_purged_undelivered() {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();
    let mut stale = Envelope::new(
        &LocalIdentity::new("a", "A"),
        "yesterday",
        MessageKind::Text,
        None,
        5,
    );
    stale.timestamp_millis = now_millis() - DAY_MS - 60_000;
    let fresh = Envelope::new(&LocalIdentity::new("a", "A"), "today", MessageKind::Text, None, 5);
    store.save_envelope(&stale, EnvelopeOrigin::Local).unwrap();
    store.save_envelope(&fresh, EnvelopeOrigin::Local).unwrap();

    let a = spawn_node_with_store(&hub, config("a"), Arc::new(store));
    assert_eq!(a.status().queued_messages, 2);

    assert_eq!(a.flush_queue().await, 0);
    assert_eq!(a.status().queued_messages, 1);
    assert_eq!(a.stats().queue_expired, 1);
}

#[tokio::test]
async fn test_new_link_never_carries_expired_entries() {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();
    let mut stale = Envelope::new(
        &LocalIdentity::new("a", "A"),
        "yesterday",
        MessageKind::Text,
        None,
        5,
    );
    stale.timestamp_millis = now_millis() - DAY_MS - 60_000;
    store.save_envelope(&stale, EnvelopeOrigin::Local).unwrap();

    let a = spawn_node_with_store(&hub, config("a"), Arc::new(store));
    assert_eq!(a.status().queued_messages, 1);

    let b = spawn_node(&hub, config("b"));
    hub.link("a", "b");
    wait_linked(&b, 1).await;
    assert!(wait_until(Duration::from_secs(1), || a.stats().queue_expired == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(b.stats().delivered, 0);
    assert_eq!(a.status().queued_messages, 0);
    assert_eq!(a.stats().flushed, 0);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("mesh.redb");

    {
        let hub = MemoryHub::new();
        let store = Arc::new(RedbStore::open(&path).unwrap());
        let a = spawn_node_with_store(&hub, config("a"), store);
        a.send(OutboundMessage::text("before the battery died").to("z"))
            .await
            .unwrap();
        assert_eq!(a.status().queued_messages, 1);
        a.dispose().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let hub = MemoryHub::new();
    let store = Arc::new(RedbStore::open(&path).unwrap());
    let a = spawn_node_with_store(&hub, config("a"), store);
    assert_eq!(a.status().queued_messages, 1);

    let z = spawn_node(&hub, config("z"));
    hub.link("a", "z");
    assert!(wait_until(Duration::from_secs(2), || z.stats().delivered == 1).await);
}
