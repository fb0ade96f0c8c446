//! Remote store boundary. The engine treats the backend abstractly as a
//! document store with realtime listeners; everything it needs is the four
//! primitives (upsert-by-id, subscribe-with-snapshot, atomic field update,
//! server timestamp) plus the presence disconnect hook, expressed here as
//! typed operations.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::SyncError;
use crate::models::{
    Conversation, Message, Presence, ReceiptKind, TimestampMs, TypingStatus,
};

/// Change to one user's conversation list.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Upserted(Conversation),
    Removed { conversation_id: String },
}

/// Change inside one conversation's message collection.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// Full document snapshot (new message, edit, or idempotent re-put).
    Upserted(Message),
    /// One recipient acknowledgement.
    ReceiptAdded {
        message_id: String,
        user_id: String,
        kind: ReceiptKind,
    },
}

/// A live listener: the state as of subscribe time, then the event stream.
/// A receiver that reports `Lagged` missed events and should re-read the
/// snapshot; `Closed` means the stream itself went away.
pub struct Subscription<S, E> {
    pub snapshot: S,
    pub events: broadcast::Receiver<E>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Idempotent upsert keyed by the message's client-generated id. The
    /// store merges rather than blindly overwriting, so a retried push never
    /// erases receipt state that accrued server-side in the meantime.
    async fn put_message(&self, message: &Message) -> Result<(), SyncError>;

    /// Records a recipient acknowledgement on a message document.
    async fn add_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
        kind: ReceiptKind,
    ) -> Result<(), SyncError>;

    /// Atomic multi-field body update for an edit.
    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        new_text: &str,
        edited_at: TimestampMs,
        edit_history: &[String],
    ) -> Result<(), SyncError>;

    async fn put_conversation(&self, conversation: &Conversation) -> Result<(), SyncError>;

    /// Atomic update of the conversation's latest-message cache fields.
    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message_text: &str,
        last_message_at: TimestampMs,
    ) -> Result<(), SyncError>;

    /// Zeroes one user's unread counter.
    async fn clear_unread(&self, conversation_id: &str, user_id: &str) -> Result<(), SyncError>;

    /// Deletes the conversation document tree (messages included).
    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), SyncError>;

    async fn set_presence(&self, presence: &Presence) -> Result<(), SyncError>;

    async fn set_typing(&self, typing: &TypingStatus) -> Result<(), SyncError>;

    /// Registers the write the backend must apply on this user's behalf if
    /// the connection drops without a clean goodbye.
    async fn install_disconnect_presence(&self, presence: &Presence) -> Result<(), SyncError>;

    async fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, SyncError>;

    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError>;

    /// Server-assigned timestamp, for writes that must not trust the local
    /// clock.
    async fn server_now_ms(&self) -> Result<TimestampMs, SyncError>;

    /// Conversation-list listener. The stream is not pre-filtered; callers
    /// check participant membership on each event.
    async fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> Result<Subscription<Vec<Conversation>, ConversationEvent>, SyncError>;

    async fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Subscription<Vec<Message>, MessageEvent>, SyncError>;

    async fn subscribe_presence(
        &self,
    ) -> Result<Subscription<Vec<Presence>, Presence>, SyncError>;

    async fn subscribe_typing(
        &self,
        conversation_id: &str,
    ) -> Result<Subscription<Vec<TypingStatus>, TypingStatus>, SyncError>;
}

/// External collaborator resolving user ids to display names; only the
/// conversation directory's search path consults it.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Option<String>;
}
