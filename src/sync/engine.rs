//! Outbound drain loop. Each conversation's outbox is consumed strictly in
//! sequence order under a per-conversation lock; a head entry that is not yet
//! due, or that fails transiently, blocks everything behind it until its
//! backoff elapses. Permanent rejections drop the entry, flip the message to
//! `error`, and let the rest of the queue proceed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use super::backoff::RetryPolicy;
use crate::connectivity::{wait_for_online, ConnectivityMonitor};
use crate::error::SyncError;
use crate::models::{now_ms, Message};
use crate::remote::RemoteStore;
use crate::storage::LocalStore;

/// Consecutive transient failures on one message before the engine reports
/// connectivity as degraded.
pub const DEGRADED_AFTER: u32 = 5;

/// Safety-net wakeup period when nothing is due.
const IDLE_SWEEP_MS: i64 = 60_000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A message was permanently rejected and flipped to `error`.
    SendFailed {
        conversation_id: String,
        message_id: String,
        reason: String,
    },
    /// The head of a queue keeps failing transiently; the link is likely bad
    /// even though the platform reports us online.
    ConnectivityDegraded { message_id: String, attempts: u32 },
    /// A remote listener cannot resubscribe; updates for that stream are
    /// stalled until it recovers.
    ListenerDegraded { stream: String, attempts: u32 },
    /// A drain pass pushed at least one message out of this conversation.
    ConversationDrained {
        conversation_id: String,
        sent: usize,
    },
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    policy: RetryPolicy,
    events: broadcast::Sender<EngineEvent>,
    kick_tx: mpsc::Sender<()>,
    kick_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let (kick_tx, kick_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(SyncEngine {
            store,
            remote,
            connectivity,
            policy,
            events,
            kick_tx,
            kick_rx: std::sync::Mutex::new(Some(kick_rx)),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Handle for sibling components (the reconcilers) that publish on the
    /// same event stream.
    pub fn events_handle(&self) -> broadcast::Sender<EngineEvent> {
        self.events.clone()
    }

    /// Nudges the background loop to run a drain pass soon. A full channel
    /// means a pass is already scheduled, which is just as good.
    pub fn kick(&self) {
        let _ = self.kick_tx.try_send(());
    }

    /// Runs the drain loop until the engine is dropped. Call at most once.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let taken = match self.kick_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(kick_rx) = taken else {
            warn!("sync engine loop already running");
            return tokio::spawn(async {});
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run(kick_rx).await })
    }

    async fn run(self: Arc<Self>, mut kick_rx: mpsc::Receiver<()>) {
        let mut connectivity_rx = self.connectivity.watch();
        info!("sync engine loop started");

        // Launch pass picks up anything queued before we existed.
        if self.connectivity.is_online() {
            if let Err(err) = self.drain_now().await {
                warn!("initial drain pass failed: {err}");
            }
        }

        loop {
            // While offline the deadlines do not matter; only a kick or the
            // online edge can make progress.
            let wait_ms = if !self.connectivity.is_online() {
                IDLE_SWEEP_MS
            } else {
                match self.store.earliest_next_attempt().await {
                    Ok(Some(at)) => (at - now_ms()).clamp(0, IDLE_SWEEP_MS),
                    Ok(None) => IDLE_SWEEP_MS,
                    Err(err) => {
                        warn!("cannot inspect outbox deadlines: {err}");
                        IDLE_SWEEP_MS
                    }
                }
            };

            tokio::select! {
                kicked = kick_rx.recv() => {
                    if kicked.is_none() {
                        break;
                    }
                }
                _ = wait_for_online(&mut connectivity_rx) => {
                    debug!("connectivity restored, draining outbox");
                }
                _ = tokio::time::sleep(Duration::from_millis(wait_ms as u64)) => {}
            }

            if !self.connectivity.is_online() {
                continue;
            }
            if let Err(err) = self.drain_now().await {
                warn!("drain pass failed: {err}");
            }
        }
        debug!("sync engine loop stopped");
    }

    /// One full pass: every conversation with queued messages is drained
    /// concurrently, each under its own lock.
    pub async fn drain_now(&self) -> Result<(), SyncError> {
        if !self.connectivity.is_online() {
            return Ok(());
        }
        let conversations = self.store.conversations_with_pending().await?;
        if conversations.is_empty() {
            return Ok(());
        }
        debug!("draining {} conversation queue(s)", conversations.len());

        let passes = conversations.iter().map(|id| self.drain_conversation(id));
        for (conversation_id, result) in conversations.iter().zip(join_all(passes).await) {
            match result {
                Ok(sent) if sent > 0 => {
                    self.emit(EngineEvent::ConversationDrained {
                        conversation_id: conversation_id.clone(),
                        sent,
                    });
                }
                Ok(_) => {}
                Err(err) => warn!("drain failed for conversation {conversation_id}: {err}"),
            }
        }
        Ok(())
    }

    async fn drain_conversation(&self, conversation_id: &str) -> Result<usize, SyncError> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let mut sent = 0usize;
        loop {
            // Refetch each round so entries enqueued mid-drain keep their
            // place in the order.
            let Some(entry) = self
                .store
                .pending_for_conversation(conversation_id)
                .await?
                .into_iter()
                .next()
            else {
                break;
            };
            if entry.next_attempt_at > now_ms() {
                break;
            }
            if !self.connectivity.is_online() {
                break;
            }

            let Some(message) = self.store.get_message(&entry.message_id).await? else {
                warn!(
                    "outbox entry {} has no stored message, dropping it",
                    entry.message_id
                );
                self.store.remove_outbox_entry(&entry.message_id).await?;
                continue;
            };

            match self.remote.put_message(&message).await {
                Ok(()) => {
                    self.store.mark_sent(&message.id).await?;
                    self.store.remove_outbox_entry(&message.id).await?;
                    self.touch_remote_conversation(conversation_id, &message).await;
                    sent += 1;
                }
                Err(err) if err.is_transient() => {
                    let next_at = self.policy.next_attempt_at(entry.attempts + 1, now_ms());
                    let attempts = self.store.bump_retry(&message.id, next_at).await?;
                    debug!(
                        "transient send failure for {} (attempt {attempts}): {err}",
                        message.id
                    );
                    if attempts >= DEGRADED_AFTER {
                        self.emit(EngineEvent::ConnectivityDegraded {
                            message_id: message.id.clone(),
                            attempts,
                        });
                    }
                    // Head of line holds its slot; everything behind waits.
                    break;
                }
                Err(err) => {
                    warn!("message {} rejected by remote: {err}", message.id);
                    self.store.mark_failed(&message.id).await?;
                    self.store.remove_outbox_entry(&message.id).await?;
                    self.emit(EngineEvent::SendFailed {
                        conversation_id: conversation_id.to_string(),
                        message_id: message.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(sent)
    }

    /// Best-effort update of the conversation's denormalized preview after a
    /// successful send. A missing remote conversation (created while offline,
    /// or deleted out from under us) is restored from the local copy and the
    /// touch retried once.
    async fn touch_remote_conversation(&self, conversation_id: &str, message: &Message) {
        let preview = message.preview();
        match self
            .remote
            .touch_conversation(conversation_id, &preview, message.created_at)
            .await
        {
            Ok(()) => {}
            Err(SyncError::NotFound(_)) => match self.store.get_conversation(conversation_id).await
            {
                Ok(Some(conversation)) => {
                    debug!("restoring conversation {conversation_id} on the remote store");
                    if let Err(err) = self.remote.put_conversation(&conversation).await {
                        warn!("could not restore conversation {conversation_id}: {err}");
                        return;
                    }
                    if let Err(err) = self
                        .remote
                        .touch_conversation(conversation_id, &preview, message.created_at)
                        .await
                    {
                        warn!("conversation touch failed after restore: {err}");
                    }
                }
                Ok(None) => {
                    warn!("no local copy of conversation {conversation_id} to restore")
                }
                Err(err) => warn!("cannot load conversation {conversation_id}: {err}"),
            },
            Err(err) => debug!("conversation touch failed for {conversation_id}: {err}"),
        }
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}
