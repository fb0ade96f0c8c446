//! Inbound reconciliation: folds remote listener traffic into the local
//! store. Conversations reconcile for the whole account; messages reconcile
//! per open conversation only, so an account with hundreds of conversations
//! does not hold hundreds of live streams.
//!
//! The local store stays authoritative for anything already persisted, so a
//! lagged or dropped stream is never data loss: the reconciler resubscribes
//! and replays the fresh snapshot, and the store's merge rules make the
//! replay idempotent.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::backoff::RetryPolicy;
use super::engine::{EngineEvent, DEGRADED_AFTER};
use crate::models::{Conversation, Message};
use crate::remote::{ConversationEvent, MessageEvent, RemoteStore};
use crate::storage::LocalStore;

enum PumpOutcome {
    /// The stream lagged; a fresh snapshot is needed to close the gap.
    Resubscribe,
    /// The stream's sender is gone for good.
    Closed,
}

/// Keeps the local conversation list in step with the remote one for a user.
/// Runs until the remote conversation stream closes or the handle is aborted.
pub fn spawn_conversation_reconciler(
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    user_id: String,
    events: broadcast::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let policy = RetryPolicy::default();
        let mut failures = 0u32;
        loop {
            let subscription = match remote.subscribe_conversations(&user_id).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    failures += 1;
                    report_subscribe_failure("conversations", failures, &err, &events);
                    tokio::time::sleep(Duration::from_millis(policy.delay_ms(failures) as u64))
                        .await;
                    continue;
                }
            };
            failures = 0;

            for conversation in &subscription.snapshot {
                apply_conversation(&store, &user_id, conversation).await;
            }

            match pump_conversations(&store, &user_id, subscription.events).await {
                PumpOutcome::Resubscribe => continue,
                PumpOutcome::Closed => break,
            }
        }
        debug!("conversation reconciler for {user_id} stopped");
    })
}

/// Keeps one conversation's local messages in step with the remote document
/// set. Spawned when the conversation is opened, aborted when it is closed;
/// exits on its own if the conversation is deleted remotely (its stream
/// closes).
pub fn spawn_message_reconciler(
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    conversation_id: String,
    events: broadcast::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let policy = RetryPolicy::default();
        let mut failures = 0u32;
        loop {
            let subscription = match remote.subscribe_messages(&conversation_id).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    failures += 1;
                    report_subscribe_failure(
                        &format!("messages:{conversation_id}"),
                        failures,
                        &err,
                        &events,
                    );
                    tokio::time::sleep(Duration::from_millis(policy.delay_ms(failures) as u64))
                        .await;
                    continue;
                }
            };
            failures = 0;

            for message in &subscription.snapshot {
                apply_message(&store, message).await;
            }

            match pump_messages(&store, subscription.events).await {
                PumpOutcome::Resubscribe => continue,
                PumpOutcome::Closed => break,
            }
        }
        debug!("message reconciler for {conversation_id} stopped");
    })
}

async fn pump_conversations(
    store: &LocalStore,
    user_id: &str,
    mut events: broadcast::Receiver<ConversationEvent>,
) -> PumpOutcome {
    loop {
        match events.recv().await {
            Ok(ConversationEvent::Upserted(conversation)) => {
                apply_conversation(store, user_id, &conversation).await;
            }
            Ok(ConversationEvent::Removed { conversation_id }) => {
                debug!("conversation {conversation_id} removed remotely, cascading locally");
                if let Err(err) = store.delete_conversation_cascade(&conversation_id).await {
                    warn!("local cascade for {conversation_id} failed: {err}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("conversation stream lagged by {skipped} events, resnapshotting");
                return PumpOutcome::Resubscribe;
            }
            Err(RecvError::Closed) => return PumpOutcome::Closed,
        }
    }
}

async fn pump_messages(
    store: &LocalStore,
    mut events: broadcast::Receiver<MessageEvent>,
) -> PumpOutcome {
    loop {
        match events.recv().await {
            Ok(MessageEvent::Upserted(message)) => {
                apply_message(store, &message).await;
            }
            Ok(MessageEvent::ReceiptAdded {
                message_id,
                user_id,
                kind,
            }) => {
                // A receipt may arrive before its message document; the store
                // keeps the row either way and folds it in later.
                if let Err(err) = store.add_receipt(&message_id, &user_id, kind).await {
                    warn!("receipt for {message_id} not applied: {err}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("message stream lagged by {skipped} events, resnapshotting");
                return PumpOutcome::Resubscribe;
            }
            Err(RecvError::Closed) => return PumpOutcome::Closed,
        }
    }
}

/// The remote stream is unfiltered; drop conversations this user is not a
/// participant of.
async fn apply_conversation(store: &LocalStore, user_id: &str, conversation: &Conversation) {
    if !conversation.participant_ids.iter().any(|p| p == user_id) {
        return;
    }
    if let Err(err) = store.save_conversation(conversation).await {
        warn!("conversation {} not saved: {err}", conversation.id);
    }
}

async fn apply_message(store: &LocalStore, message: &Message) {
    // The store's merge keeps this idempotent: status can only rise, receipt
    // sets only grow, and the newer edit wins.
    if let Err(err) = store.save_message(message).await {
        warn!("message {} not saved: {err}", message.id);
    }
}

fn report_subscribe_failure(
    stream: &str,
    attempts: u32,
    err: &crate::error::SyncError,
    events: &broadcast::Sender<EngineEvent>,
) {
    warn!("subscribe to {stream} failed (attempt {attempts}): {err}");
    if attempts >= DEGRADED_AFTER {
        let _ = events.send(EngineEvent::ListenerDegraded {
            stream: stream.to_string(),
            attempts,
        });
    }
}
