//! The client facade: one object per signed-in user that wires the local
//! store, the sync engine, the reconcilers, and the presence tracker
//! together, and exposes the message/conversation intents a UI calls.
//!
//! Every collaborator is constructor-injected, so tests assemble a client
//! around an in-memory store and a scripted remote with no global state to
//! reset between cases.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::models::{
    direct_conversation_id, now_ms, Conversation, MediaDescriptor, Message, Presence,
    ReceiptKind, TimestampMs, EDIT_WINDOW_MS, MAX_MESSAGE_LEN,
};
use crate::remote::{ProfileDirectory, RemoteStore};
use crate::storage::{LocalStore, StoreEvent, DEFAULT_PAGE_SIZE, DEFAULT_RETENTION_DAYS};
use crate::sync::backoff::RetryPolicy;
use crate::sync::directory::ConversationDirectory;
use crate::sync::engine::{EngineEvent, SyncEngine};
use crate::sync::presence::PresenceTracker;
use crate::sync::reconciler::{spawn_conversation_reconciler, spawn_message_reconciler};

struct OpenConversation {
    conversation_id: String,
    listener: JoinHandle<()>,
}

pub struct ChatClient {
    user_id: String,
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    engine: Arc<SyncEngine>,
    presence: PresenceTracker,
    directory: ConversationDirectory,
    engine_task: Mutex<Option<JoinHandle<()>>>,
    conversation_task: Mutex<Option<JoinHandle<()>>>,
    open_conversation: Mutex<Option<OpenConversation>>,
}

impl ChatClient {
    pub fn new(
        user_id: &str,
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        profiles: Arc<dyn ProfileDirectory>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let engine = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            connectivity.clone(),
            RetryPolicy::default(),
        );
        let presence = PresenceTracker::new(Arc::clone(&remote), user_id);
        let directory = ConversationDirectory::new(Arc::clone(&store), profiles, user_id);
        ChatClient {
            user_id: user_id.to_string(),
            store,
            remote,
            connectivity,
            engine,
            presence,
            directory,
            engine_task: Mutex::new(None),
            conversation_task: Mutex::new(None),
            open_conversation: Mutex::new(None),
        }
    }

    /// Starts the background machinery: the outbox drain loop, the
    /// account-wide conversation reconciler, and presence observation.
    pub async fn start(&self) {
        let engine_handle = self.engine.spawn();
        if let Some(previous) = self.engine_task.lock().await.replace(engine_handle) {
            previous.abort();
        }
        let conversation_handle = spawn_conversation_reconciler(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            self.user_id.clone(),
            self.engine.events_handle(),
        );
        if let Some(previous) = self
            .conversation_task
            .lock()
            .await
            .replace(conversation_handle)
        {
            previous.abort();
        }
        self.presence.observe_presence().await;
        info!("chat client for {} started", self.user_id);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn subscribe_engine_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe_events()
    }

    pub fn subscribe_store_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    // ------------------------------------------------------------------
    // Message intents
    // ------------------------------------------------------------------

    /// Optimistic send: validates, persists the message as `sending` and
    /// queues it in one transaction, bumps the conversation preview, and
    /// nudges the drain loop. Returns the new message's id immediately;
    /// delivery happens in the background.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        media: Option<MediaDescriptor>,
    ) -> Result<String, SyncError> {
        let body = validate_body(text, media.is_some())?;
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conversation {conversation_id}")))?;
        if !conversation.participant_ids.iter().any(|p| p == &self.user_id) {
            return Err(SyncError::Validation(
                "sender is not a participant of this conversation".to_string(),
            ));
        }

        let message = Message::new_outgoing(conversation_id, &self.user_id, body, media);
        self.store.enqueue_message(&message).await?;
        self.store
            .touch_conversation(conversation_id, &message.preview(), message.created_at)
            .await?;
        debug!("queued message {} in {conversation_id}", message.id);
        self.engine.kick();
        Ok(message.id)
    }

    /// Re-queues a failed message at the tail of its conversation's outbox.
    /// Only valid for messages in `error`.
    pub async fn retry_message(&self, message_id: &str) -> Result<(), SyncError> {
        let entry = self.store.requeue_at_tail(message_id).await?;
        debug!(
            "message {message_id} requeued at sequence {}",
            entry.sequence
        );
        self.engine.kick();
        Ok(())
    }

    /// Edits one of our own messages within the edit window. The old body is
    /// archived locally; if the message already reached the remote store the
    /// document is updated there too, otherwise the pending send simply
    /// carries the new body.
    pub async fn edit_message(&self, message_id: &str, new_text: &str) -> Result<(), SyncError> {
        let body = validate_body(new_text, false)?;
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
        if message.sender_id != self.user_id {
            return Err(SyncError::Validation(
                "only the sender can edit a message".to_string(),
            ));
        }
        let now = now_ms();
        if now.saturating_sub(message.created_at) > EDIT_WINDOW_MS {
            return Err(SyncError::Validation(
                "the edit window for this message has closed".to_string(),
            ));
        }

        let updated = self.store.apply_edit(message_id, &body, now).await?;
        if updated.is_synced {
            self.remote
                .edit_message(
                    &updated.conversation_id,
                    message_id,
                    &body,
                    now,
                    &updated.edit_history,
                )
                .await?;
        }
        Ok(())
    }

    /// Sends a copy of an existing message into another conversation.
    pub async fn forward_message(
        &self,
        message_id: &str,
        target_conversation_id: &str,
    ) -> Result<String, SyncError> {
        let source = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
        let body = format!("Forwarded: {}", source.text);
        self.send_message(target_conversation_id, &body, source.media.clone())
            .await
    }

    /// Acknowledges receipt of every message in the conversation we have not
    /// yet acknowledged. Receipts go to the remote store first and are only
    /// recorded locally once that write succeeds, so an offline attempt is
    /// retried in full on the next call.
    pub async fn mark_delivered(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.acknowledge(conversation_id, ReceiptKind::Delivered)
            .await
    }

    /// Read acknowledgement: implies delivery, and clears our unread count
    /// on both sides.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.store
            .clear_unread(conversation_id, &self.user_id)
            .await?;
        self.acknowledge(conversation_id, ReceiptKind::Read).await?;
        self.remote
            .clear_unread(conversation_id, &self.user_id)
            .await?;
        Ok(())
    }

    async fn acknowledge(
        &self,
        conversation_id: &str,
        kind: ReceiptKind,
    ) -> Result<(), SyncError> {
        let messages = self.store.get_messages(conversation_id).await?;
        for message in &messages {
            if message.sender_id == self.user_id {
                continue;
            }
            let already = match kind {
                ReceiptKind::Delivered => message.delivered_to.contains(&self.user_id),
                ReceiptKind::Read => message.read_by.contains(&self.user_id),
            };
            if already {
                continue;
            }
            self.remote
                .add_receipt(conversation_id, &message.id, &self.user_id, kind)
                .await?;
            self.store
                .add_receipt(&message.id, &self.user_id, kind)
                .await?;
        }
        Ok(())
    }

    /// Messages of a conversation from the local cache, oldest first.
    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        self.store.get_messages(conversation_id).await
    }

    /// One page of history, newest first, strictly older than `before`
    /// (`None` starts from the latest message). For scroll-back loading.
    pub async fn messages_before(
        &self,
        conversation_id: &str,
        before: Option<TimestampMs>,
    ) -> Result<Vec<Message>, SyncError> {
        self.store
            .get_messages_page(conversation_id, DEFAULT_PAGE_SIZE, before)
            .await
    }

    // ------------------------------------------------------------------
    // Conversation intents
    // ------------------------------------------------------------------

    /// Finds or creates the direct conversation with another user. The id is
    /// canonical, so both sides arrive at the same document no matter who
    /// creates it first. Created conversations are persisted locally before
    /// the remote write; if that write fails transiently the conversation
    /// still exists locally and is restored remotely by the first send.
    pub async fn create_or_get_direct(
        &self,
        other_user_id: &str,
    ) -> Result<Conversation, SyncError> {
        if other_user_id == self.user_id {
            return Err(SyncError::Validation(
                "cannot open a direct conversation with yourself".to_string(),
            ));
        }
        let id = direct_conversation_id(&self.user_id, other_user_id);
        if let Some(existing) = self.store.get_conversation(&id).await? {
            return Ok(existing);
        }
        match self.remote.fetch_conversation(&id).await {
            Ok(Some(remote_copy)) => {
                self.store.save_conversation(&remote_copy).await?;
                return Ok(remote_copy);
            }
            Ok(None) => {}
            Err(err) if err.is_transient() => {
                debug!("remote conversation lookup deferred: {err}")
            }
            Err(err) => return Err(err),
        }

        let conversation = Conversation::direct(&self.user_id, other_user_id);
        self.persist_new_conversation(&conversation).await?;
        Ok(conversation)
    }

    /// Creates a group conversation with us as the sole admin. We are added
    /// to the participant list if the caller left us out.
    pub async fn create_group(
        &self,
        participant_ids: Vec<String>,
        name: Option<String>,
    ) -> Result<Conversation, SyncError> {
        let mut participants = participant_ids;
        if !participants.iter().any(|p| p == &self.user_id) {
            participants.push(self.user_id.clone());
        }
        participants.sort();
        participants.dedup();
        if participants.len() < 2 {
            return Err(SyncError::Validation(
                "a group conversation needs at least two participants".to_string(),
            ));
        }

        let conversation = Conversation::group(&self.user_id, participants, name);
        self.persist_new_conversation(&conversation).await?;
        Ok(conversation)
    }

    async fn persist_new_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), SyncError> {
        self.store.save_conversation(conversation).await?;
        match self.remote.put_conversation(conversation).await {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                debug!(
                    "conversation {} created locally, remote write deferred: {err}",
                    conversation.id
                );
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Opens a conversation for viewing: catches up on its remote messages,
    /// attaches the live message listener and typing observer, records the
    /// viewing marker, and acknowledges everything as read. Only one
    /// conversation is open at a time.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        if self.store.get_conversation(conversation_id).await?.is_none() {
            return Err(SyncError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        self.close_conversation().await;

        // One-shot catch-up before the listener attaches; while we were not
        // looking, no message reconciler was running for this conversation.
        match self.remote.fetch_messages(conversation_id).await {
            Ok(messages) => {
                for message in &messages {
                    self.store.save_message(message).await?;
                }
            }
            Err(err) if err.is_transient() => {
                debug!("catch-up fetch skipped while offline: {err}")
            }
            Err(err) => return Err(err),
        }

        let listener = spawn_message_reconciler(
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            conversation_id.to_string(),
            self.engine.events_handle(),
        );
        self.presence.observe_typing(conversation_id).await;
        *self.open_conversation.lock().await = Some(OpenConversation {
            conversation_id: conversation_id.to_string(),
            listener,
        });

        if let Err(err) = self.mark_read(conversation_id).await {
            debug!("read acknowledgement deferred: {err}");
        }
        Ok(())
    }

    /// Tears down the open conversation's listener and viewing marker.
    /// Draining of its outbox continues regardless.
    pub async fn close_conversation(&self) {
        if let Some(open) = self.open_conversation.lock().await.take() {
            open.listener.abort();
            self.presence
                .stop_observing_typing(&open.conversation_id)
                .await;
            if let Err(err) = self.presence.stop_typing(&open.conversation_id).await {
                debug!("typing clear failed on close: {err}");
            }
            debug!("closed conversation {}", open.conversation_id);
        }
    }

    /// The conversation currently on screen, if any. Hosts consult this to
    /// suppress notifications for messages the user is already looking at.
    pub async fn currently_viewing(&self) -> Option<String> {
        self.open_conversation
            .lock()
            .await
            .as_ref()
            .map(|open| open.conversation_id.clone())
    }

    /// Deletes a conversation everywhere: remote document tree first, local
    /// cascade second. Requires connectivity; there is no queued tombstone.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), SyncError> {
        let viewing = self
            .currently_viewing()
            .await
            .is_some_and(|open| open == conversation_id);
        if viewing {
            self.close_conversation().await;
        }
        self.remote.delete_conversation(conversation_id).await?;
        self.store
            .delete_conversation_cascade(conversation_id)
            .await?;
        Ok(())
    }

    /// Drops synced messages older than the retention window. Hosts call
    /// this on their own maintenance schedule.
    pub async fn prune_history(&self) -> Result<usize, SyncError> {
        self.store
            .prune_synced_messages(DEFAULT_RETENTION_DAYS)
            .await
    }

    // ------------------------------------------------------------------
    // Presence, typing, lifecycle
    // ------------------------------------------------------------------

    pub async fn start_typing(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.presence.start_typing(conversation_id).await
    }

    pub async fn stop_typing(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.presence.stop_typing(conversation_id).await
    }

    /// Users typing in a conversation right now, judged by our clock.
    pub async fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        self.presence.typing_users(conversation_id, now_ms()).await
    }

    pub async fn presence_of(&self, user_id: &str) -> Option<Presence> {
        self.presence.presence_of(user_id).await
    }

    /// App came to the foreground: go online and drain anything queued.
    pub async fn handle_app_foreground(&self) {
        if let Err(err) = self.presence.start_presence().await {
            debug!("presence start deferred: {err}");
        }
        self.engine.kick();
    }

    /// App left the foreground: record ourselves offline.
    pub async fn handle_app_background(&self) {
        if let Err(err) = self.presence.stop_presence().await {
            debug!("presence stop deferred: {err}");
        }
    }

    /// Stops every background task this client owns. The store and remote
    /// handles stay usable; a new client can be built over them.
    pub async fn shutdown(&self) {
        self.close_conversation().await;
        if let Err(err) = self.presence.stop_presence().await {
            debug!("presence stop deferred during shutdown: {err}");
        }
        self.presence.shutdown().await;
        if let Some(handle) = self.conversation_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.engine_task.lock().await.take() {
            handle.abort();
        }
        info!("chat client for {} shut down", self.user_id);
    }
}

/// Shared body validation for send and edit: trimmed, non-empty unless a
/// media attachment carries the message, and within the length cap.
fn validate_body(text: &str, has_media: bool) -> Result<String, SyncError> {
    let body = text.trim();
    if body.is_empty() && !has_media {
        return Err(SyncError::Validation("message text is empty".to_string()));
    }
    if body.chars().count() > MAX_MESSAGE_LEN {
        return Err(SyncError::Validation(format!(
            "message exceeds {MAX_MESSAGE_LEN} characters"
        )));
    }
    Ok(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_validation_trims_and_bounds() {
        assert_eq!(validate_body("  hello  ", false).unwrap(), "hello");
        assert!(validate_body("   ", false).is_err());
        assert!(validate_body("", true).is_ok());
        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        assert!(validate_body(&long, false).is_err());
        let exact = "x".repeat(MAX_MESSAGE_LEN);
        assert!(validate_body(&exact, false).is_ok());
    }
}
