// Re-export needed modules for testing
pub mod client;
pub mod connectivity;
pub mod error;
pub mod models;
pub mod remote; // Remote store boundary and the bundled in-memory implementation
pub mod storage; // SQLite-backed local store
pub mod sync; // Drain engine, reconcilers, presence tracking

// Re-export main types for convenience
pub use client::ChatClient;
pub use connectivity::ConnectivityMonitor;
pub use error::SyncError;
pub use models::*;
pub use remote::{ProfileDirectory, RemoteStore};
pub use storage::LocalStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification_drives_retry_policy() {
        assert!(SyncError::TransientNetwork("socket reset".to_string()).is_transient());
        assert!(SyncError::ListenerDisconnected("stream ended".to_string()).is_transient());
        assert!(!SyncError::PermanentRejection("blocked".to_string()).is_transient());
        assert!(!SyncError::Validation("empty".to_string()).is_transient());
        assert!(!SyncError::NotFound("conversation x".to_string()).is_transient());
    }

    #[test]
    fn outgoing_messages_start_unsynced_and_sending() {
        let message = Message::new_outgoing("conv1", "alice", "hello".to_string(), None);
        assert_eq!(message.status, DeliveryStatus::Sending);
        assert!(!message.is_synced);
        assert!(message.delivered_to.is_empty());
        assert!(message.read_by.is_empty());
        assert!(!message.id.is_empty());
    }

    #[test]
    fn media_only_messages_preview_their_kind() {
        let media = MediaDescriptor {
            media_type: "image".to_string(),
            url: "https://cdn.example/img.png".to_string(),
            thumbnail_url: None,
            duration_secs: None,
        };
        let message = Message::new_outgoing("conv1", "alice", String::new(), Some(media));
        assert_eq!(message.preview(), "[image]");
    }
}
