// Outbox drain behavior: offline queueing, FIFO order, head-of-line blocking
// on transient failures, permanent rejection, and queue recovery.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chatsync::models::{now_ms, Conversation, DeliveryStatus, Message};
use chatsync::remote::memory::MemoryRemote;
use chatsync::remote::MessageEvent;
use chatsync::sync::backoff::RetryPolicy;
use chatsync::sync::engine::{EngineEvent, SyncEngine, DEGRADED_AFTER};
use chatsync::{ConnectivityMonitor, LocalStore, RemoteStore};
use common::{build_client, setup_logging, wait_until};

/// Engine wired straight to a store and remote, with retries fast enough to
/// exercise inside a test. No background loop; tests drive drains by hand.
async fn manual_engine(
    remote: &Arc<MemoryRemote>,
) -> (Arc<LocalStore>, Arc<SyncEngine>, ConnectivityMonitor) {
    setup_logging();
    let store = Arc::new(LocalStore::open_in_memory().expect("in-memory store"));
    let net = ConnectivityMonitor::new(true);
    let policy = RetryPolicy {
        initial_ms: 20,
        max_ms: 100,
    };
    let remote: Arc<dyn RemoteStore> = remote.clone();
    let engine = SyncEngine::new(store.clone(), remote, net.clone(), policy);
    (store, engine, net)
}

fn outgoing(id: &str, conversation_id: &str, sender_id: &str, text: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        text: text.to_string(),
        created_at: now_ms(),
        status: DeliveryStatus::Sending,
        delivered_to: BTreeSet::new(),
        read_by: BTreeSet::new(),
        is_synced: false,
        media: None,
        edited_at: None,
        edit_history: Vec::new(),
    }
}

#[tokio::test]
async fn offline_sends_queue_then_drain_in_order() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let conversation_id = alice.create_or_get_direct("bob").await.unwrap().id;

    // Watch the remote's message stream so arrival order is observable.
    let subscription = remote.subscribe_messages(&conversation_id).await.unwrap();
    let mut remote_events = subscription.events;
    let mut engine_events = alice.subscribe_engine_events();

    alice.connectivity().set_online(false);
    let mut sent_ids = Vec::new();
    for text in ["first", "second", "third"] {
        sent_ids.push(alice.send_message(&conversation_id, text, None).await.unwrap());
    }

    // Everything is queued locally, nothing has left the device.
    for id in &sent_ids {
        let message = alice.store().get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, DeliveryStatus::Sending);
        assert!(!message.is_synced);
        assert!(alice.store().outbox_entry(id).await.unwrap().is_some());
    }
    assert_eq!(remote.message_count(&conversation_id).await, 0);

    alice.connectivity().set_online(true);
    let remote_probe = remote.clone();
    let id_probe = conversation_id.clone();
    wait_until("all three messages reach the remote", 5_000, move || {
        let remote = remote_probe.clone();
        let id = id_probe.clone();
        async move { remote.message_count(&id).await == 3 }
    })
    .await;

    // Arrival order matches send order.
    let mut arrivals = Vec::new();
    while let Ok(event) = remote_events.try_recv() {
        if let MessageEvent::Upserted(message) = event {
            arrivals.push(message.id);
        }
    }
    assert_eq!(arrivals, sent_ids);

    // Local copies settled: sent, synced, queue empty.
    for id in &sent_ids {
        let message = alice.store().get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, DeliveryStatus::Sent);
        assert!(message.is_synced);
        assert!(alice.store().outbox_entry(id).await.unwrap().is_none());
    }

    // The drain pass announced how much it moved.
    let mut drained = None;
    while let Ok(event) = engine_events.try_recv() {
        if let EngineEvent::ConversationDrained {
            conversation_id: c,
            sent,
        } = event
        {
            if c == conversation_id {
                drained = Some(sent);
            }
        }
    }
    assert_eq!(drained, Some(3));

    // Bob's unread ticked once per new message; alice's own never did.
    let on_remote = remote.conversation(&conversation_id).await.unwrap();
    assert_eq!(on_remote.unread_for("bob"), 3);
    assert_eq!(on_remote.unread_for("alice"), 0);

    alice.shutdown().await;
}

#[tokio::test]
async fn redundant_push_is_idempotent_on_the_remote() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let conversation_id = alice.create_or_get_direct("bob").await.unwrap().id;

    let message_id = alice
        .send_message(&conversation_id, "only once", None)
        .await
        .unwrap();
    let remote_probe = remote.clone();
    let id_probe = conversation_id.clone();
    wait_until("message reaches the remote", 5_000, move || {
        let remote = remote_probe.clone();
        let id = id_probe.clone();
        async move { remote.message_count(&id).await == 1 }
    })
    .await;

    // Replay the push, as a crash between the remote write and the local
    // bookkeeping would on restart. The remote merges instead of duplicating.
    let message = alice
        .store()
        .get_message(&message_id)
        .await
        .unwrap()
        .unwrap();
    remote.put_message(&message).await.unwrap();

    assert_eq!(remote.message_count(&conversation_id).await, 1);
    let on_remote = remote.conversation(&conversation_id).await.unwrap();
    // The replay did not double-count bob's unread.
    assert_eq!(on_remote.unread_for("bob"), 1);
    let doc = remote.message(&conversation_id, &message_id).await.unwrap();
    assert_eq!(doc.status, DeliveryStatus::Sent);
    assert!(doc.is_synced);

    alice.shutdown().await;
}

#[tokio::test]
async fn transient_failure_blocks_the_rest_of_the_queue() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine, _net) = manual_engine(&remote).await;

    let conversation = Conversation::direct("alice", "bob");
    store.save_conversation(&conversation).await.unwrap();
    remote.put_conversation(&conversation).await.unwrap();

    store
        .enqueue_message(&outgoing("m1", &conversation.id, "alice", "head"))
        .await
        .unwrap();
    store
        .enqueue_message(&outgoing("m2", &conversation.id, "alice", "behind"))
        .await
        .unwrap();

    remote.fail_next_puts(1).await;
    engine.drain_now().await.unwrap();

    // The head failed transiently and now owns a retry deadline; the second
    // message must not jump the queue.
    assert_eq!(remote.message_count(&conversation.id).await, 0);
    let head = store.outbox_entry("m1").await.unwrap().unwrap();
    assert_eq!(head.attempts, 1);
    let attempted_at = head.last_attempt_at.expect("attempt recorded");
    // First retry deadline: initial delay plus up to half again in jitter.
    assert!(head.next_attempt_at >= attempted_at + 15);
    assert!(head.next_attempt_at <= attempted_at + 40);
    let blocked = store.outbox_entry("m2").await.unwrap().unwrap();
    assert_eq!(blocked.attempts, 0);
    assert_eq!(
        store.get_message("m1").await.unwrap().unwrap().status,
        DeliveryStatus::Sending
    );

    // Once the deadline passes, a drain moves both in order.
    tokio::time::sleep(Duration::from_millis(60)).await;
    engine.drain_now().await.unwrap();
    assert_eq!(remote.message_count(&conversation.id).await, 2);
    assert!(store.outbox_entry("m1").await.unwrap().is_none());
    assert!(store.outbox_entry("m2").await.unwrap().is_none());
}

#[tokio::test]
async fn permanent_rejection_drops_entry_and_frees_the_queue() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let conversation_id = alice.create_or_get_direct("bob").await.unwrap().id;
    let mut engine_events = alice.subscribe_engine_events();

    // Queue while offline so the rejection can be armed before any attempt.
    alice.connectivity().set_online(false);
    let rejected_id = alice
        .send_message(&conversation_id, "against policy", None)
        .await
        .unwrap();
    let ok_id = alice
        .send_message(&conversation_id, "fine", None)
        .await
        .unwrap();
    remote.reject_message(&rejected_id).await;
    alice.connectivity().set_online(true);

    let remote_probe = remote.clone();
    let id_probe = conversation_id.clone();
    wait_until("the acceptable message gets past the reject", 5_000, move || {
        let remote = remote_probe.clone();
        let id = id_probe.clone();
        async move { remote.message_count(&id).await == 1 }
    })
    .await;

    // The rejected message is in `error`, out of the queue, and reported.
    assert!(remote.message(&conversation_id, &rejected_id).await.is_none());
    assert!(remote.message(&conversation_id, &ok_id).await.is_some());
    let failed = alice
        .store()
        .get_message(&rejected_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, DeliveryStatus::Error);
    assert!(alice
        .store()
        .outbox_entry(&rejected_id)
        .await
        .unwrap()
        .is_none());

    let mut failure = None;
    while let Ok(event) = engine_events.try_recv() {
        if let EngineEvent::SendFailed { message_id, .. } = event {
            failure = Some(message_id);
        }
    }
    assert_eq!(failure.as_deref(), Some(rejected_id.as_str()));

    // An explicit retry re-queues it at the tail and it goes through.
    alice.retry_message(&rejected_id).await.unwrap();
    let alice_probe = alice.clone();
    let retry_probe = rejected_id.clone();
    wait_until("the retried message is delivered", 5_000, move || {
        let alice = alice_probe.clone();
        let id = retry_probe.clone();
        async move {
            alice
                .store()
                .get_message(&id)
                .await
                .unwrap()
                .map(|m| m.status == DeliveryStatus::Sent && m.is_synced)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(remote.message(&conversation_id, &rejected_id).await.is_some());

    alice.shutdown().await;
}

#[tokio::test]
async fn missing_remote_conversation_is_restored_during_drain() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine, _net) = manual_engine(&remote).await;

    // Created while offline: the conversation only exists locally.
    let conversation = Conversation::direct("alice", "bob");
    store.save_conversation(&conversation).await.unwrap();
    assert!(remote.conversation(&conversation.id).await.is_none());

    let message = outgoing("m1", &conversation.id, "alice", "start of it all");
    store.enqueue_message(&message).await.unwrap();
    engine.drain_now().await.unwrap();

    let restored = remote.conversation(&conversation.id).await.unwrap();
    assert_eq!(restored.last_message_text.as_deref(), Some("start of it all"));
    assert_eq!(restored.last_message_at, Some(message.created_at));
    assert!(remote.message(&conversation.id, "m1").await.is_some());
}

#[tokio::test]
async fn repeated_transient_failures_flag_degraded_connectivity() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine, _net) = manual_engine(&remote).await;
    let mut events = engine.subscribe_events();

    let conversation = Conversation::direct("alice", "bob");
    store.save_conversation(&conversation).await.unwrap();
    remote.put_conversation(&conversation).await.unwrap();
    store
        .enqueue_message(&outgoing("m1", &conversation.id, "alice", "stuck"))
        .await
        .unwrap();

    remote.fail_next_puts(DEGRADED_AFTER).await;
    for _ in 0..DEGRADED_AFTER {
        engine.drain_now().await.unwrap();
        // Longest deadline under the test policy is max_ms plus half jitter.
        tokio::time::sleep(Duration::from_millis(160)).await;
    }

    let mut degraded = None;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ConnectivityDegraded {
            message_id,
            attempts,
        } = event
        {
            degraded = Some((message_id, attempts));
        }
    }
    assert_eq!(degraded, Some(("m1".to_string(), DEGRADED_AFTER)));

    // The failure budget is spent; the next drain gets it through.
    engine.drain_now().await.unwrap();
    assert_eq!(remote.message_count(&conversation.id).await, 1);
    assert_eq!(
        store.get_message("m1").await.unwrap().unwrap().status,
        DeliveryStatus::Sent
    );
}

#[tokio::test]
async fn drain_skips_entries_that_are_not_due_yet() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine, _net) = manual_engine(&remote).await;

    let conversation = Conversation::direct("alice", "bob");
    store.save_conversation(&conversation).await.unwrap();
    remote.put_conversation(&conversation).await.unwrap();
    store
        .enqueue_message(&outgoing("m1", &conversation.id, "alice", "patience"))
        .await
        .unwrap();

    remote.fail_next_puts(1).await;
    engine.drain_now().await.unwrap();
    assert_eq!(remote.message_count(&conversation.id).await, 0);

    // Immediately draining again is a no-op: the head's deadline is in the
    // future and no attempt is burned.
    engine.drain_now().await.unwrap();
    let head = store.outbox_entry("m1").await.unwrap().unwrap();
    assert_eq!(head.attempts, 1);
    assert_eq!(remote.message_count(&conversation.id).await, 0);

    let deadline = store.earliest_next_attempt().await.unwrap().unwrap();
    assert_eq!(deadline, head.next_attempt_at);
}
