use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch. All persisted and wire timestamps use this.
pub type TimestampMs = i64;

pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Maximum accepted message body length, in characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// A typing indicator older than this is stale for every observer.
pub const TYPING_TTL_MS: i64 = 3_000;

/// Senders may edit their own messages this long after creation.
pub const EDIT_WINDOW_MS: i64 = 15 * 60 * 1_000;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending = 0,   // Persisted locally, not yet acknowledged by the remote store
    Sent = 1,      // Remote store acknowledged the write
    Delivered = 2, // Every non-sender participant has the message on-device
    Read = 3,      // Every non-sender participant has read it
    Error = 4,     // Terminal send failure; cleared only by an explicit retry
}

impl DeliveryStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DeliveryStatus::Sending),
            1 => Some(DeliveryStatus::Sent),
            2 => Some(DeliveryStatus::Delivered),
            3 => Some(DeliveryStatus::Read),
            4 => Some(DeliveryStatus::Error),
            _ => None,
        }
    }

    /// Position in the forward order `sending < sent < delivered < read`.
    /// `Error` sits outside the order (side branch), so it has no rank.
    fn rank(self) -> Option<u8> {
        match self {
            DeliveryStatus::Sending => Some(0),
            DeliveryStatus::Sent => Some(1),
            DeliveryStatus::Delivered => Some(2),
            DeliveryStatus::Read => Some(3),
            DeliveryStatus::Error => None,
        }
    }

    /// Forward-only merge: the result never regresses below `current`.
    ///
    /// `Error` never propagates in through here (terminal failure is a local
    /// verdict, applied via [`DeliveryStatus::after_failure`]); a held `Error`
    /// is superseded by an incoming `Sent` or higher, because a remote
    /// acknowledgement proves the push actually landed.
    pub fn merge(current: Self, incoming: Self) -> Self {
        match (current.rank(), incoming.rank()) {
            (Some(c), Some(i)) => {
                if i > c {
                    incoming
                } else {
                    current
                }
            }
            // current == Error: only a remote ack (Sent or higher) clears it.
            (None, Some(i)) if i >= 1 => incoming,
            (None, _) => current,
            // incoming == Error: ignored, keep whatever we hold.
            (Some(_), None) => current,
        }
    }

    /// Terminal-failure transition. Only unacknowledged statuses can fail;
    /// anything the remote store already confirmed stays as it is.
    pub fn after_failure(current: Self) -> Self {
        match current {
            DeliveryStatus::Sending | DeliveryStatus::Sent => DeliveryStatus::Error,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub media_type: String, // "image", "video", "audio"; opaque to the engine
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: TimestampMs,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub delivered_to: BTreeSet<String>,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default)]
    pub is_synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_history: Vec<String>,
}

impl Message {
    /// Builds a freshly composed outgoing message: client-minted id,
    /// `sending`, not yet synced.
    pub fn new_outgoing(
        conversation_id: &str,
        sender_id: &str,
        text: String,
        media: Option<MediaDescriptor>,
    ) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text,
            created_at: now_ms(),
            status: DeliveryStatus::Sending,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
            is_synced: false,
            media: None,
            edited_at: None,
            edit_history: Vec::new(),
        }
        .with_media(media)
    }

    fn with_media(mut self, media: Option<MediaDescriptor>) -> Self {
        self.media = media;
        self
    }

    /// Conversation-list preview line for this message.
    pub fn preview(&self) -> String {
        if !self.text.is_empty() {
            self.text.clone()
        } else if let Some(media) = &self.media {
            format!("[{}]", media.media_type)
        } else {
            String::new()
        }
    }

    /// Externally visible status: the aggregate minimum across all non-sender
    /// participants. `read` only once everyone has read, `delivered` only once
    /// everyone has it; local-only states pass through unchanged.
    pub fn display_status(&self, participant_ids: &[String]) -> DeliveryStatus {
        match self.status {
            DeliveryStatus::Sending | DeliveryStatus::Error => return self.status,
            _ => {}
        }
        let recipients: Vec<&String> = participant_ids
            .iter()
            .filter(|p| **p != self.sender_id)
            .collect();
        if recipients.is_empty() {
            return self.status;
        }
        if recipients.iter().all(|p| self.read_by.contains(p.as_str())) {
            DeliveryStatus::Read
        } else if recipients
            .iter()
            .all(|p| self.delivered_to.contains(p.as_str()))
        {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::merge(self.status, DeliveryStatus::Sent)
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            _ => None,
        }
    }
}

/// Canonical id for a direct chat: both participant ids sorted and joined
/// with `_`, so create-or-get resolves to the same document from either side.
pub fn direct_conversation_id(a: &str, b: &str) -> String {
    let mut ids = [a, b];
    ids.sort();
    format!("{}_{}", ids[0], ids[1])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub last_message_text: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<TimestampMs>,
    #[serde(default)]
    pub unread_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub group_avatar_url: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<String>,
    pub created_at: TimestampMs,
}

impl Conversation {
    pub fn direct(a: &str, b: &str) -> Self {
        let mut participants = vec![a.to_string(), b.to_string()];
        participants.sort();
        Conversation {
            id: direct_conversation_id(a, b),
            kind: ConversationKind::Direct,
            participant_ids: participants,
            last_message_text: None,
            last_message_at: None,
            unread_counts: BTreeMap::new(),
            group_name: None,
            group_avatar_url: None,
            admin_ids: Vec::new(),
            created_at: now_ms(),
        }
    }

    /// New group chat: fresh id, creator becomes the sole admin.
    pub fn group(creator_id: &str, participant_ids: Vec<String>, name: Option<String>) -> Self {
        Conversation {
            id: Uuid::new_v4().to_string(),
            kind: ConversationKind::Group,
            participant_ids,
            last_message_text: None,
            last_message_at: None,
            unread_counts: BTreeMap::new(),
            group_name: name,
            group_avatar_url: None,
            admin_ids: vec![creator_id.to_string()],
            created_at: now_ms(),
        }
    }

    /// The peer in a direct chat, from `user_id`'s point of view.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.kind != ConversationKind::Direct {
            return None;
        }
        self.participant_ids
            .iter()
            .find(|p| p.as_str() != user_id)
            .map(|p| p.as_str())
    }

    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread_counts.get(user_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: Option<TimestampMs>,
}

impl Presence {
    pub fn online(user_id: &str) -> Self {
        Presence {
            user_id: user_id.to_string(),
            is_online: true,
            last_seen: None,
        }
    }

    pub fn offline(user_id: &str, last_seen: TimestampMs) -> Self {
        Presence {
            user_id: user_id.to_string(),
            is_online: false,
            last_seen: Some(last_seen),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStatus {
    pub user_id: String,
    pub conversation_id: String,
    pub is_typing: bool,
    pub last_typing_at: TimestampMs,
}

impl TypingStatus {
    /// Observer-side liveness check. Expiry is purely clock-based, so a
    /// crashed client's stale entry goes quiet without any further write.
    pub fn is_actively_typing(&self, now: TimestampMs) -> bool {
        self.is_typing && now.saturating_sub(self.last_typing_at) <= TYPING_TTL_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

impl ReceiptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptKind::Delivered => "delivered",
            ReceiptKind::Read => "read",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(ReceiptKind::Delivered),
            "read" => Some(ReceiptKind::Read),
            _ => None,
        }
    }
}

/// One queued outgoing message. Sequence numbers are per-conversation and
/// assigned at enqueue time; the drain order is strictly by sequence.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub message_id: String,
    pub conversation_id: String,
    pub sequence: i64,
    pub enqueued_at: TimestampMs,
    pub attempts: u32,
    pub last_attempt_at: Option<TimestampMs>,
    pub next_attempt_at: TimestampMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_merge_never_regresses() {
        use DeliveryStatus::*;
        assert_eq!(DeliveryStatus::merge(Read, Sent), Read);
        assert_eq!(DeliveryStatus::merge(Sent, Delivered), Delivered);
        assert_eq!(DeliveryStatus::merge(Sending, Read), Read);
        assert_eq!(DeliveryStatus::merge(Delivered, Delivered), Delivered);
    }

    #[test]
    fn error_is_a_side_branch() {
        use DeliveryStatus::*;
        // Only unacknowledged sends can fail.
        assert_eq!(DeliveryStatus::after_failure(Sending), Error);
        assert_eq!(DeliveryStatus::after_failure(Sent), Error);
        assert_eq!(DeliveryStatus::after_failure(Delivered), Delivered);
        assert_eq!(DeliveryStatus::after_failure(Read), Read);
        // A remote ack supersedes a stale local failure verdict.
        assert_eq!(DeliveryStatus::merge(Error, Sent), Sent);
        assert_eq!(DeliveryStatus::merge(Error, Read), Read);
        assert_eq!(DeliveryStatus::merge(Error, Sending), Error);
        // Error never arrives through merge.
        assert_eq!(DeliveryStatus::merge(Delivered, Error), Delivered);
        assert_eq!(DeliveryStatus::merge(Sending, Error), Sending);
    }

    #[test]
    fn display_status_is_minimum_across_recipients() {
        let participants = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut msg = Message::new_outgoing("conv", "a", "hi".to_string(), None);
        msg.status = DeliveryStatus::Sent;

        assert_eq!(msg.display_status(&participants), DeliveryStatus::Sent);

        msg.delivered_to.insert("b".to_string());
        assert_eq!(msg.display_status(&participants), DeliveryStatus::Sent);

        msg.delivered_to.insert("c".to_string());
        assert_eq!(msg.display_status(&participants), DeliveryStatus::Delivered);

        msg.read_by.insert("b".to_string());
        // One of two recipients read it: still delivered overall.
        assert_eq!(msg.display_status(&participants), DeliveryStatus::Delivered);

        msg.read_by.insert("c".to_string());
        assert_eq!(msg.display_status(&participants), DeliveryStatus::Read);
    }

    #[test]
    fn display_status_passes_local_states_through() {
        let participants = vec!["a".to_string(), "b".to_string()];
        let mut msg = Message::new_outgoing("conv", "a", "hi".to_string(), None);
        assert_eq!(msg.display_status(&participants), DeliveryStatus::Sending);
        msg.status = DeliveryStatus::Error;
        assert_eq!(msg.display_status(&participants), DeliveryStatus::Error);
    }

    #[test]
    fn direct_id_is_order_independent() {
        assert_eq!(direct_conversation_id("u2", "u1"), "u1_u2");
        assert_eq!(direct_conversation_id("u1", "u2"), "u1_u2");
        let c = Conversation::direct("u2", "u1");
        assert_eq!(c.id, "u1_u2");
        assert_eq!(c.participant_ids, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(c.other_participant("u1"), Some("u2"));
    }

    #[test]
    fn typing_expires_by_clock_alone() {
        let t = TypingStatus {
            user_id: "u1".to_string(),
            conversation_id: "c1".to_string(),
            is_typing: true,
            last_typing_at: 10_000,
        };
        assert!(t.is_actively_typing(10_000 + TYPING_TTL_MS));
        assert!(!t.is_actively_typing(10_000 + TYPING_TTL_MS + 1));
        let stopped = TypingStatus {
            is_typing: false,
            ..t.clone()
        };
        assert!(!stopped.is_actively_typing(10_001));
    }
}
