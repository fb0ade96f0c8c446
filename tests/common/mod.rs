// Common test utilities for integration tests
// Shared harness code: logging setup, client assembly, wait helpers

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use log::LevelFilter;

use std::sync::Arc;

use chatsync::remote::memory::{MemoryRemote, StaticProfiles};
use chatsync::{ChatClient, ConnectivityMonitor, LocalStore, RemoteStore};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Profile table shared by all test users.
pub fn test_profiles() -> Arc<StaticProfiles> {
    Arc::new(
        StaticProfiles::new()
            .with("alice", "Alice Park")
            .with("bob", "Bob Ortiz")
            .with("carol", "Carol Ngai"),
    )
}

/// Builds a started client over its own in-memory store, attached to the
/// shared remote. Connectivity starts online.
pub async fn build_client(remote: &Arc<MemoryRemote>, user_id: &str) -> Arc<ChatClient> {
    setup_logging();
    let store = Arc::new(LocalStore::open_in_memory().expect("in-memory store"));
    let net = ConnectivityMonitor::new(true);
    let remote: Arc<dyn RemoteStore> = remote.clone();
    let client = Arc::new(ChatClient::new(
        user_id,
        store,
        remote,
        test_profiles(),
        net,
    ));
    client.start().await;
    client
}

/// Polls `check` until it returns true or the timeout elapses. Panics with
/// `what` on timeout so the failing condition is named in the test output.
pub async fn wait_until<F, Fut>(what: &str, timeout_ms: u64, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out after {timeout_ms}ms waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
