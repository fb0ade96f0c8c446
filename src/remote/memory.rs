//! In-memory remote store: one document tree behind an async mutex, with
//! broadcast streams standing in for realtime listeners. Used by the demo
//! driver and the test suites, which also script faults through it
//! (offline mode, transient put failures, per-message permanent rejection,
//! simulated abnormal disconnects).

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use log::debug;
use tokio::sync::{broadcast, Mutex};

use super::{ConversationEvent, MessageEvent, ProfileDirectory, RemoteStore, Subscription};
use crate::error::SyncError;
use crate::models::{
    now_ms, Conversation, DeliveryStatus, Message, Presence, ReceiptKind, TimestampMs,
    TypingStatus,
};

const STREAM_CAPACITY: usize = 64;

struct RemoteState {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, BTreeMap<String, Message>>,
    presence: HashMap<String, Presence>,
    typing: HashMap<String, HashMap<String, TypingStatus>>,
    disconnect_hooks: HashMap<String, Presence>,
    message_streams: HashMap<String, broadcast::Sender<MessageEvent>>,
    typing_streams: HashMap<String, broadcast::Sender<TypingStatus>>,
    online: bool,
    fail_puts_remaining: u32,
    rejected_messages: HashSet<String>,
}

impl RemoteState {
    fn new() -> Self {
        RemoteState {
            conversations: HashMap::new(),
            messages: HashMap::new(),
            presence: HashMap::new(),
            typing: HashMap::new(),
            disconnect_hooks: HashMap::new(),
            message_streams: HashMap::new(),
            typing_streams: HashMap::new(),
            online: true,
            fail_puts_remaining: 0,
            rejected_messages: HashSet::new(),
        }
    }

    fn check_online(&self) -> Result<(), SyncError> {
        if self.online {
            Ok(())
        } else {
            Err(SyncError::TransientNetwork(
                "remote store unreachable".to_string(),
            ))
        }
    }

    fn message_stream(&mut self, conversation_id: &str) -> &broadcast::Sender<MessageEvent> {
        self.message_streams
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_CAPACITY).0)
    }

    fn typing_stream(&mut self, conversation_id: &str) -> &broadcast::Sender<TypingStatus> {
        self.typing_streams
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_CAPACITY).0)
    }

    fn publish_message(&mut self, conversation_id: &str, event: MessageEvent) {
        if let Some(tx) = self.message_streams.get(conversation_id) {
            let _ = tx.send(event);
        }
    }
}

pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    conversation_events: broadcast::Sender<ConversationEvent>,
    presence_events: broadcast::Sender<Presence>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        MemoryRemote {
            state: Mutex::new(RemoteState::new()),
            conversation_events: broadcast::channel(STREAM_CAPACITY).0,
            presence_events: broadcast::channel(STREAM_CAPACITY).0,
        }
    }

    /// Flips reachability. While offline every write and fetch fails
    /// transiently; existing listeners simply go quiet.
    pub async fn set_online(&self, online: bool) {
        self.state.lock().await.online = online;
        debug!("remote store now {}", if online { "online" } else { "offline" });
    }

    /// The next `n` message puts fail with a transient error.
    pub async fn fail_next_puts(&self, n: u32) {
        self.state.lock().await.fail_puts_remaining = n;
    }

    /// Marks a message id as permanently rejected (policy denial).
    pub async fn reject_message(&self, message_id: &str) {
        self.state
            .lock()
            .await
            .rejected_messages
            .insert(message_id.to_string());
    }

    /// Server-side disconnect detection: applies the user's registered
    /// last-resort presence write, as the backend would after a dropped
    /// connection.
    pub async fn simulate_disconnect(&self, user_id: &str) {
        let applied = {
            let mut state = self.state.lock().await;
            match state.disconnect_hooks.remove(user_id) {
                Some(mut presence) => {
                    // Stamped server-side when the hook actually fires, not
                    // when it was registered.
                    presence.last_seen = Some(now_ms());
                    state
                        .presence
                        .insert(presence.user_id.clone(), presence.clone());
                    Some(presence)
                }
                None => None,
            }
        };
        if let Some(presence) = applied {
            debug!("disconnect hook fired for {}", presence.user_id);
            let _ = self.presence_events.send(presence);
        }
    }

    /// Test inspection: the stored message document, if any.
    pub async fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.state
            .lock()
            .await
            .messages
            .get(conversation_id)
            .and_then(|docs| docs.get(message_id))
            .cloned()
    }

    pub async fn message_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .await
            .messages
            .get(conversation_id)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state
            .lock()
            .await
            .conversations
            .get(conversation_id)
            .cloned()
    }

    pub async fn presence_of(&self, user_id: &str) -> Option<Presence> {
        self.state.lock().await.presence.get(user_id).cloned()
    }

    pub async fn typing_of(&self, conversation_id: &str, user_id: &str) -> Option<TypingStatus> {
        self.state
            .lock()
            .await
            .typing
            .get(conversation_id)
            .and_then(|slot| slot.get(user_id))
            .cloned()
    }

    pub async fn has_disconnect_hook(&self, user_id: &str) -> bool {
        self.state
            .lock()
            .await
            .disconnect_hooks
            .contains_key(user_id)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn put_message(&self, message: &Message) -> Result<(), SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_online()?;
        if state.fail_puts_remaining > 0 {
            state.fail_puts_remaining -= 1;
            return Err(SyncError::TransientNetwork("injected put fault".to_string()));
        }
        if state.rejected_messages.contains(&message.id) {
            return Err(SyncError::PermanentRejection(format!(
                "message {} rejected by server policy",
                message.id
            )));
        }

        let conversation_id = message.conversation_id.clone();
        let docs = state.messages.entry(conversation_id.clone()).or_default();
        let existing = docs.get(&message.id).cloned();
        let is_new = existing.is_none();
        let stored = match existing {
            None => {
                // Acknowledged: the document exists now, so it is at least sent.
                let mut doc = message.clone();
                doc.status = DeliveryStatus::merge(doc.status, DeliveryStatus::Sent);
                doc.is_synced = true;
                docs.insert(doc.id.clone(), doc.clone());
                doc
            }
            Some(existing) => {
                // Idempotent re-put: merge, never lose server-side receipt state.
                let mut doc = existing;
                doc.status = DeliveryStatus::merge(doc.status, message.status);
                doc.status = DeliveryStatus::merge(doc.status, DeliveryStatus::Sent);
                if message.edited_at.unwrap_or(0) > doc.edited_at.unwrap_or(0) {
                    doc.text = message.text.clone();
                    doc.media = message.media.clone();
                    doc.edited_at = message.edited_at;
                    doc.edit_history = message.edit_history.clone();
                }
                doc.delivered_to
                    .extend(message.delivered_to.iter().cloned());
                doc.read_by.extend(message.read_by.iter().cloned());
                docs.insert(doc.id.clone(), doc.clone());
                doc
            }
        };

        let mut conversation_update = None;
        if is_new {
            if let Some(conv) = state.conversations.get_mut(&conversation_id) {
                for participant in &conv.participant_ids {
                    if participant != &message.sender_id {
                        *conv.unread_counts.entry(participant.clone()).or_insert(0) += 1;
                    }
                }
                conversation_update = Some(ConversationEvent::Upserted(conv.clone()));
            }
        }

        state.publish_message(&conversation_id, MessageEvent::Upserted(stored));
        if let Some(event) = conversation_update {
            let _ = self.conversation_events.send(event);
        }
        Ok(())
    }

    async fn add_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
        kind: ReceiptKind,
    ) -> Result<(), SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_online()?;

        let doc = state
            .messages
            .get_mut(conversation_id)
            .and_then(|docs| docs.get_mut(message_id))
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
        doc.delivered_to.insert(user_id.to_string());
        if kind == ReceiptKind::Read {
            doc.read_by.insert(user_id.to_string());
        }

        state.publish_message(
            conversation_id,
            MessageEvent::ReceiptAdded {
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
                kind,
            },
        );
        Ok(())
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        new_text: &str,
        edited_at: TimestampMs,
        edit_history: &[String],
    ) -> Result<(), SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_online()?;

        let doc = state
            .messages
            .get_mut(conversation_id)
            .and_then(|docs| docs.get_mut(message_id))
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
        doc.text = new_text.to_string();
        doc.edited_at = Some(edited_at);
        doc.edit_history = edit_history.to_vec();
        let updated = doc.clone();

        state.publish_message(conversation_id, MessageEvent::Upserted(updated));
        Ok(())
    }

    async fn put_conversation(&self, conversation: &Conversation) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        drop(state);
        let _ = self
            .conversation_events
            .send(ConversationEvent::Upserted(conversation.clone()));
        Ok(())
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message_text: &str,
        last_message_at: TimestampMs,
    ) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        let conv = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {conversation_id}")))?;
        conv.last_message_text = Some(last_message_text.to_string());
        conv.last_message_at = Some(last_message_at);
        let updated = conv.clone();
        drop(state);
        let _ = self
            .conversation_events
            .send(ConversationEvent::Upserted(updated));
        Ok(())
    }

    async fn clear_unread(&self, conversation_id: &str, user_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        let conv = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {conversation_id}")))?;
        conv.unread_counts.remove(user_id);
        let updated = conv.clone();
        drop(state);
        let _ = self
            .conversation_events
            .send(ConversationEvent::Upserted(updated));
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        state.conversations.remove(conversation_id);
        state.messages.remove(conversation_id);
        state.typing.remove(conversation_id);
        // Dropping the stream senders closes any attached listeners.
        state.message_streams.remove(conversation_id);
        state.typing_streams.remove(conversation_id);
        drop(state);
        let _ = self
            .conversation_events
            .send(ConversationEvent::Removed {
                conversation_id: conversation_id.to_string(),
            });
        Ok(())
    }

    async fn set_presence(&self, presence: &Presence) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        state
            .presence
            .insert(presence.user_id.clone(), presence.clone());
        drop(state);
        let _ = self.presence_events.send(presence.clone());
        Ok(())
    }

    async fn set_typing(&self, typing: &TypingStatus) -> Result<(), SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.check_online()?;
        state
            .typing
            .entry(typing.conversation_id.clone())
            .or_default()
            .insert(typing.user_id.clone(), typing.clone());
        let tx = state.typing_stream(&typing.conversation_id).clone();
        drop(guard);
        let _ = tx.send(typing.clone());
        Ok(())
    }

    async fn install_disconnect_presence(&self, presence: &Presence) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        state.check_online()?;
        state
            .disconnect_hooks
            .insert(presence.user_id.clone(), presence.clone());
        Ok(())
    }

    async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, SyncError> {
        let state = self.state.lock().await;
        state.check_online()?;
        Ok(state.conversations.get(conversation_id).cloned())
    }

    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        let state = self.state.lock().await;
        state.check_online()?;
        Ok(sorted_messages(&state, conversation_id))
    }

    async fn server_now_ms(&self) -> Result<TimestampMs, SyncError> {
        self.state.lock().await.check_online()?;
        Ok(now_ms())
    }

    async fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> Result<Subscription<Vec<Conversation>, ConversationEvent>, SyncError> {
        let state = self.state.lock().await;
        let mut snapshot: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.participant_ids.iter().any(|p| p == user_id))
            .cloned()
            .collect();
        snapshot.sort_by_key(|c| std::cmp::Reverse(c.last_message_at.unwrap_or(c.created_at)));
        Ok(Subscription {
            snapshot,
            events: self.conversation_events.subscribe(),
        })
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Subscription<Vec<Message>, MessageEvent>, SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let snapshot = sorted_messages(state, conversation_id);
        let events = state.message_stream(conversation_id).subscribe();
        Ok(Subscription { snapshot, events })
    }

    async fn subscribe_presence(
        &self,
    ) -> Result<Subscription<Vec<Presence>, Presence>, SyncError> {
        let state = self.state.lock().await;
        let snapshot = state.presence.values().cloned().collect();
        Ok(Subscription {
            snapshot,
            events: self.presence_events.subscribe(),
        })
    }

    async fn subscribe_typing(
        &self,
        conversation_id: &str,
    ) -> Result<Subscription<Vec<TypingStatus>, TypingStatus>, SyncError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let snapshot = state
            .typing
            .get(conversation_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        let events = state.typing_stream(conversation_id).subscribe();
        Ok(Subscription { snapshot, events })
    }
}

fn sorted_messages(state: &RemoteState, conversation_id: &str) -> Vec<Message> {
    let mut messages: Vec<Message> = state
        .messages
        .get(conversation_id)
        .map(|docs| docs.values().cloned().collect())
        .unwrap_or_default();
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    messages
}

/// Fixed user-id → display-name table; the profile collaborator used by the
/// demo driver and tests.
pub struct StaticProfiles {
    names: HashMap<String, String>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        StaticProfiles {
            names: HashMap::new(),
        }
    }

    pub fn with(mut self, user_id: &str, display_name: &str) -> Self {
        self.names
            .insert(user_id.to_string(), display_name.to_string());
        self
    }
}

impl Default for StaticProfiles {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfiles {
    async fn display_name(&self, user_id: &str) -> Option<String> {
        self.names.get(user_id).cloned()
    }
}
