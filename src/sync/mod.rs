//! The synchronization half of the crate: the outbound drain loop over the
//! outbox, the inbound reconcilers that fold remote listener traffic into the
//! local store, and the trackers for ephemeral presence/typing state.

pub mod backoff;
pub mod directory;
pub mod engine;
pub mod presence;
pub mod reconciler;
