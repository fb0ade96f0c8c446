use thiserror::Error;

/// Engine-wide error taxonomy. The transient/permanent split is what the
/// sync engine's retry logic keys on; everything else propagates to the
/// caller unclassified.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote store unreachable or timed out. The outbox entry stays queued
    /// and is retried with backoff.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Remote store rejected the write outright (authorization denial,
    /// server-side validation). Never retried automatically.
    #[error("rejected by remote store: {0}")]
    PermanentRejection(String),

    /// Local persistence unavailable or corrupt. Fatal to the triggering
    /// operation; callers surface degraded-mode behavior.
    #[error("local persistence failure: {0}")]
    LocalPersistence(#[from] rusqlite::Error),

    /// A persisted or wire payload failed to encode/decode.
    #[error("payload encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Filesystem trouble while locating or creating the database.
    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A remote change stream dropped. The reconciler resubscribes on its
    /// own; this only surfaces once resubscription is exhausted.
    #[error("listener disconnected: {0}")]
    ListenerDisconnected(String),

    /// User input rejected before anything was persisted or enqueued.
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl SyncError {
    /// Unclassified failures count as transient: over-retrying a send is
    /// recoverable, silently dropping one is not.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::PermanentRejection(_)
            | SyncError::Validation(_)
            | SyncError::NotFound(_)
            | SyncError::LocalPersistence(_)
            | SyncError::Encoding(_)
            | SyncError::Io(_) => false,
            _ => true,
        }
    }
}
