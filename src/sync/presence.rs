//! Presence and typing state. Everything here is ephemeral: nothing touches
//! the local store, and a crashed peer's stale entries expire by observer
//! clocks (typing) or the remote disconnect hook (presence) rather than by
//! any cleanup job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::backoff::RetryPolicy;
use crate::error::SyncError;
use crate::models::{now_ms, Presence, TimestampMs, TypingStatus};
use crate::remote::RemoteStore;

/// Keep-alive period for the remote `last_seen` field while presence
/// tracking is active.
pub const HEARTBEAT_INTERVAL_MS: i64 = 60_000;

/// Minimum spacing between remote typing writes per conversation. Keystrokes
/// arrive far faster than observers need updates.
pub const TYPING_THROTTLE_MS: i64 = 2_000;

pub struct PresenceTracker {
    remote: Arc<dyn RemoteStore>,
    user_id: String,
    observed_presence: Arc<RwLock<HashMap<String, Presence>>>,
    observed_typing: Arc<RwLock<HashMap<String, HashMap<String, TypingStatus>>>>,
    typing_throttle: Mutex<HashMap<String, TimestampMs>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    presence_listener: Mutex<Option<JoinHandle<()>>>,
    typing_listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PresenceTracker {
    pub fn new(remote: Arc<dyn RemoteStore>, user_id: &str) -> Self {
        PresenceTracker {
            remote,
            user_id: user_id.to_string(),
            observed_presence: Arc::new(RwLock::new(HashMap::new())),
            observed_typing: Arc::new(RwLock::new(HashMap::new())),
            typing_throttle: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            presence_listener: Mutex::new(None),
            typing_listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Goes online: writes the presence record, arms the remote disconnect
    /// hook so an abnormal termination still flips us offline, and starts
    /// the keep-alive heartbeat.
    pub async fn start_presence(&self) -> Result<(), SyncError> {
        self.remote
            .set_presence(&Presence::online(&self.user_id))
            .await?;
        self.remote
            .install_disconnect_presence(&Presence::offline(&self.user_id, now_ms()))
            .await?;

        let remote = Arc::clone(&self.remote);
        let user_id = self.user_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64));
            ticker.tick().await; // first tick is immediate; start already wrote
            loop {
                ticker.tick().await;
                let beat = Presence {
                    user_id: user_id.clone(),
                    is_online: true,
                    last_seen: Some(now_ms()),
                };
                if let Err(err) = remote.set_presence(&beat).await {
                    debug!("presence heartbeat failed: {err}");
                }
            }
        });
        if let Some(previous) = self.heartbeat.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Goes offline gracefully: stops the heartbeat and records `last_seen`.
    pub async fn stop_presence(&self) -> Result<(), SyncError> {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
        self.remote
            .set_presence(&Presence::offline(&self.user_id, now_ms()))
            .await
    }

    /// Announces typing in a conversation. Remote writes are throttled per
    /// conversation; a suppressed call is not an error, the previous write's
    /// `last_typing_at` is still within the observers' liveness window.
    pub async fn start_typing(&self, conversation_id: &str) -> Result<(), SyncError> {
        let now = now_ms();
        {
            let mut throttle = self.typing_throttle.lock().await;
            if let Some(last) = throttle.get(conversation_id) {
                if now - last < TYPING_THROTTLE_MS {
                    return Ok(());
                }
            }
            throttle.insert(conversation_id.to_string(), now);
        }
        self.remote
            .set_typing(&TypingStatus {
                user_id: self.user_id.clone(),
                conversation_id: conversation_id.to_string(),
                is_typing: true,
                last_typing_at: now,
            })
            .await
    }

    /// Clears the typing flag. Never throttled, so observers see the stop
    /// promptly instead of waiting out the TTL.
    pub async fn stop_typing(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.typing_throttle.lock().await.remove(conversation_id);
        self.remote
            .set_typing(&TypingStatus {
                user_id: self.user_id.clone(),
                conversation_id: conversation_id.to_string(),
                is_typing: false,
                last_typing_at: now_ms(),
            })
            .await
    }

    /// Starts mirroring everyone's presence into the local registry.
    pub async fn observe_presence(&self) {
        let remote = Arc::clone(&self.remote);
        let registry = Arc::clone(&self.observed_presence);
        let handle = tokio::spawn(async move {
            let policy = RetryPolicy::default();
            let mut failures = 0u32;
            loop {
                let subscription = match remote.subscribe_presence().await {
                    Ok(subscription) => subscription,
                    Err(err) => {
                        failures += 1;
                        warn!("presence subscribe failed (attempt {failures}): {err}");
                        tokio::time::sleep(Duration::from_millis(
                            policy.delay_ms(failures) as u64
                        ))
                        .await;
                        continue;
                    }
                };
                failures = 0;
                {
                    let mut map = registry.write().await;
                    for presence in subscription.snapshot {
                        map.insert(presence.user_id.clone(), presence);
                    }
                }
                let mut events = subscription.events;
                loop {
                    match events.recv().await {
                        Ok(presence) => {
                            registry
                                .write()
                                .await
                                .insert(presence.user_id.clone(), presence);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("presence stream lagged by {skipped}, resnapshotting");
                            break;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });
        if let Some(previous) = self.presence_listener.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_observing_presence(&self) {
        if let Some(handle) = self.presence_listener.lock().await.take() {
            handle.abort();
        }
        self.observed_presence.write().await.clear();
    }

    /// Starts mirroring typing state for one conversation.
    pub async fn observe_typing(&self, conversation_id: &str) {
        let remote = Arc::clone(&self.remote);
        let registry = Arc::clone(&self.observed_typing);
        let conversation = conversation_id.to_string();
        let key = conversation.clone();
        let handle = tokio::spawn(async move {
            let policy = RetryPolicy::default();
            let mut failures = 0u32;
            loop {
                let subscription = match remote.subscribe_typing(&conversation).await {
                    Ok(subscription) => subscription,
                    Err(err) => {
                        failures += 1;
                        warn!("typing subscribe failed (attempt {failures}): {err}");
                        tokio::time::sleep(Duration::from_millis(
                            policy.delay_ms(failures) as u64
                        ))
                        .await;
                        continue;
                    }
                };
                failures = 0;
                {
                    let mut map = registry.write().await;
                    let slot = map.entry(conversation.clone()).or_default();
                    for typing in subscription.snapshot {
                        slot.insert(typing.user_id.clone(), typing);
                    }
                }
                let mut events = subscription.events;
                loop {
                    match events.recv().await {
                        Ok(typing) => {
                            registry
                                .write()
                                .await
                                .entry(conversation.clone())
                                .or_default()
                                .insert(typing.user_id.clone(), typing);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("typing stream lagged by {skipped}, resnapshotting");
                            break;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });
        let mut listeners = self.typing_listeners.lock().await;
        if let Some(previous) = listeners.insert(key, handle) {
            previous.abort();
        }
    }

    pub async fn stop_observing_typing(&self, conversation_id: &str) {
        if let Some(handle) = self.typing_listeners.lock().await.remove(conversation_id) {
            handle.abort();
        }
        self.observed_typing.write().await.remove(conversation_id);
    }

    /// Last observed presence for a user, if any has been seen.
    pub async fn presence_of(&self, user_id: &str) -> Option<Presence> {
        self.observed_presence.read().await.get(user_id).cloned()
    }

    /// Users actively typing in a conversation as of `now`, excluding
    /// ourselves. Staleness is judged against the caller's clock.
    pub async fn typing_users(&self, conversation_id: &str, now: TimestampMs) -> Vec<String> {
        let map = self.observed_typing.read().await;
        let Some(slot) = map.get(conversation_id) else {
            return Vec::new();
        };
        let mut users: Vec<String> = slot
            .values()
            .filter(|t| t.user_id != self.user_id && t.is_actively_typing(now))
            .map(|t| t.user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// Aborts every background task without touching remote state. The
    /// disconnect hook covers the offline write if the process dies before
    /// `stop_presence` ran.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.presence_listener.lock().await.take() {
            handle.abort();
        }
        for (_, handle) in self.typing_listeners.lock().await.drain() {
            handle.abort();
        }
    }
}
