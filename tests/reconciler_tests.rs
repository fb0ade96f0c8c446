// Two-device flows over the shared remote: message fan-out, receipt
// propagation, unread bookkeeping, and remote deletions.

mod common;

use std::sync::Arc;

use chatsync::models::DeliveryStatus;
use chatsync::remote::memory::MemoryRemote;
use common::{build_client, wait_until};

#[tokio::test]
async fn messages_reach_an_open_peer_and_receipts_come_back() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let bob = build_client(&remote, "bob").await;

    let conversation = alice.create_or_get_direct("bob").await.unwrap();
    let conversation_id = conversation.id.clone();

    // Bob's account-wide reconciler picks the conversation up on its own.
    let bob_probe = bob.clone();
    let id_probe = conversation_id.clone();
    wait_until("bob learns about the conversation", 5_000, move || {
        let bob = bob_probe.clone();
        let id = id_probe.clone();
        async move { bob.store().get_conversation(&id).await.unwrap().is_some() }
    })
    .await;

    alice.open_conversation(&conversation_id).await.unwrap();
    bob.open_conversation(&conversation_id).await.unwrap();

    let message_id = alice
        .send_message(&conversation_id, "hi bob", None)
        .await
        .unwrap();

    // The live listener lands the message in bob's store, already confirmed.
    let bob_probe = bob.clone();
    let msg_probe = message_id.clone();
    wait_until("the message lands on bob's device", 5_000, move || {
        let bob = bob_probe.clone();
        let id = msg_probe.clone();
        async move { bob.store().get_message(&id).await.unwrap().is_some() }
    })
    .await;
    let on_bob = bob.store().get_message(&message_id).await.unwrap().unwrap();
    assert_eq!(on_bob.text, "hi bob");
    assert!(on_bob.is_synced);
    assert_eq!(on_bob.status, DeliveryStatus::Sent);

    // Bob reads; the receipt travels back through alice's listener and her
    // copy climbs to `read`.
    bob.mark_read(&conversation_id).await.unwrap();
    let alice_probe = alice.clone();
    let msg_probe = message_id.clone();
    let participants = conversation.participant_ids.clone();
    wait_until("alice sees the read receipt", 5_000, move || {
        let alice = alice_probe.clone();
        let id = msg_probe.clone();
        let participants = participants.clone();
        async move {
            alice
                .store()
                .get_message(&id)
                .await
                .unwrap()
                .map(|m| m.display_status(&participants) == DeliveryStatus::Read)
                .unwrap_or(false)
        }
    })
    .await;
    let on_alice = alice
        .store()
        .get_message(&message_id)
        .await
        .unwrap()
        .unwrap();
    assert!(on_alice.read_by.contains("bob"));
    assert!(on_alice.delivered_to.contains("bob"));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn conversation_stream_is_filtered_by_membership() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let bob = build_client(&remote, "bob").await;

    let foreign = bob.create_or_get_direct("carol").await.unwrap();

    // Sync point: bob has it (he created it), and the remote broadcast has
    // fired by the time carol's copy would exist server-side.
    assert!(remote.conversation(&foreign.id).await.is_some());
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // Alice's reconciler saw the same event and dropped it.
    assert!(alice
        .store()
        .get_conversation(&foreign.id)
        .await
        .unwrap()
        .is_none());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn remote_deletion_cascades_to_every_device() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let bob = build_client(&remote, "bob").await;

    let conversation_id = alice.create_or_get_direct("bob").await.unwrap().id;
    let bob_probe = bob.clone();
    let id_probe = conversation_id.clone();
    wait_until("bob learns about the conversation", 5_000, move || {
        let bob = bob_probe.clone();
        let id = id_probe.clone();
        async move { bob.store().get_conversation(&id).await.unwrap().is_some() }
    })
    .await;

    let message_id = alice
        .send_message(&conversation_id, "short-lived", None)
        .await
        .unwrap();
    let remote_probe = remote.clone();
    let id_probe = conversation_id.clone();
    wait_until("the message reaches the remote", 5_000, move || {
        let remote = remote_probe.clone();
        let id = id_probe.clone();
        async move { remote.message_count(&id).await == 1 }
    })
    .await;

    alice.delete_conversation(&conversation_id).await.unwrap();
    assert!(remote.conversation(&conversation_id).await.is_none());
    assert!(alice
        .store()
        .get_conversation(&conversation_id)
        .await
        .unwrap()
        .is_none());

    // Bob's reconciler sees the removal and clears his cache too.
    let bob_probe = bob.clone();
    let id_probe = conversation_id.clone();
    wait_until("bob's copy is removed", 5_000, move || {
        let bob = bob_probe.clone();
        let id = id_probe.clone();
        async move { bob.store().get_conversation(&id).await.unwrap().is_none() }
    })
    .await;
    assert!(bob
        .store()
        .get_message(&message_id)
        .await
        .unwrap()
        .is_none());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn unread_counts_rise_while_closed_and_clear_on_open() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let bob = build_client(&remote, "bob").await;

    let conversation_id = alice.create_or_get_direct("bob").await.unwrap().id;
    let bob_probe = bob.clone();
    let id_probe = conversation_id.clone();
    wait_until("bob learns about the conversation", 5_000, move || {
        let bob = bob_probe.clone();
        let id = id_probe.clone();
        async move { bob.store().get_conversation(&id).await.unwrap().is_some() }
    })
    .await;

    alice
        .send_message(&conversation_id, "one", None)
        .await
        .unwrap();
    alice
        .send_message(&conversation_id, "two", None)
        .await
        .unwrap();

    // Bob is not viewing; his unread badge climbs via the conversation
    // stream alone.
    let bob_probe = bob.clone();
    let id_probe = conversation_id.clone();
    wait_until("bob's unread badge shows 2", 5_000, move || {
        let bob = bob_probe.clone();
        let id = id_probe.clone();
        async move { bob.directory().unread_count(&id).await.unwrap() == 2 }
    })
    .await;
    assert_eq!(
        remote
            .conversation(&conversation_id)
            .await
            .unwrap()
            .unread_for("bob"),
        2
    );

    // Opening the conversation acknowledges and clears on both sides. The
    // local badge settles once the conversation stream echoes the clear.
    bob.open_conversation(&conversation_id).await.unwrap();
    assert_eq!(
        remote
            .conversation(&conversation_id)
            .await
            .unwrap()
            .unread_for("bob"),
        0
    );
    let bob_probe = bob.clone();
    let id_probe = conversation_id.clone();
    wait_until("bob's unread badge clears", 5_000, move || {
        let bob = bob_probe.clone();
        let id = id_probe.clone();
        async move { bob.directory().unread_count(&id).await.unwrap() == 0 }
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn group_status_tracks_the_slowest_recipient() {
    let remote = Arc::new(MemoryRemote::new());
    let alice = build_client(&remote, "alice").await;
    let bob = build_client(&remote, "bob").await;
    let carol = build_client(&remote, "carol").await;

    let group = alice
        .create_group(
            vec!["alice".into(), "bob".into(), "carol".into()],
            Some("the trio".into()),
        )
        .await
        .unwrap();
    for peer in [&bob, &carol] {
        let probe = peer.clone();
        let id = group.id.clone();
        wait_until("peer learns about the group", 5_000, move || {
            let peer = probe.clone();
            let id = id.clone();
            async move { peer.store().get_conversation(&id).await.unwrap().is_some() }
        })
        .await;
    }

    alice.open_conversation(&group.id).await.unwrap();
    let message_id = alice
        .send_message(&group.id, "everyone here?", None)
        .await
        .unwrap();
    let remote_probe = remote.clone();
    let id_probe = group.id.clone();
    wait_until("the message reaches the remote", 5_000, move || {
        let remote = remote_probe.clone();
        let id = id_probe.clone();
        async move { remote.message_count(&id).await == 1 }
    })
    .await;

    // Bob views the conversation and reads it. One reader out of two
    // recipients leaves alice's aggregate at `sent`.
    bob.open_conversation(&group.id).await.unwrap();
    let alice_probe = alice.clone();
    let msg_probe = message_id.clone();
    wait_until("bob's read receipt reaches alice", 5_000, move || {
        let alice = alice_probe.clone();
        let id = msg_probe.clone();
        async move {
            alice
                .store()
                .get_message(&id)
                .await
                .unwrap()
                .map(|m| m.read_by.contains("bob"))
                .unwrap_or(false)
        }
    })
    .await;
    let on_alice = alice
        .store()
        .get_message(&message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        on_alice.display_status(&group.participant_ids),
        DeliveryStatus::Sent
    );

    // Carol's device stores the message without her viewing it, and
    // acknowledges delivery only. Coverage is now complete at `delivered`.
    let doc = remote.message(&group.id, &message_id).await.unwrap();
    carol.store().save_message(&doc).await.unwrap();
    carol.mark_delivered(&group.id).await.unwrap();
    let alice_probe = alice.clone();
    let msg_probe = message_id.clone();
    let participants = group.participant_ids.clone();
    wait_until("alice's aggregate climbs to delivered", 5_000, move || {
        let alice = alice_probe.clone();
        let id = msg_probe.clone();
        let participants = participants.clone();
        async move {
            alice
                .store()
                .get_message(&id)
                .await
                .unwrap()
                .map(|m| m.display_status(&participants) == DeliveryStatus::Delivered)
                .unwrap_or(false)
        }
    })
    .await;

    // Carol finally reads; only now does the aggregate reach `read`.
    carol.mark_read(&group.id).await.unwrap();
    let alice_probe = alice.clone();
    let msg_probe = message_id.clone();
    let participants = group.participant_ids.clone();
    wait_until("alice's aggregate reaches read", 5_000, move || {
        let alice = alice_probe.clone();
        let id = msg_probe.clone();
        let participants = participants.clone();
        async move {
            alice
                .store()
                .get_message(&id)
                .await
                .unwrap()
                .map(|m| m.display_status(&participants) == DeliveryStatus::Read)
                .unwrap_or(false)
        }
    })
    .await;

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}
