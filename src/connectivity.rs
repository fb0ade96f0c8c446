use std::sync::Arc;

use log::debug;
use tokio::sync::watch;

/// Binary online/offline signal at the host boundary. The host application
/// (or a test harness) flips it; the engine watches for the offline→online
/// edge to re-trigger outbox drains.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        ConnectivityMonitor { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            debug!(
                "connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves on the next transition to online. Edge-triggered: being online
/// already does not resolve it, only a fresh offline→online flip does.
pub async fn wait_for_online(rx: &mut watch::Receiver<bool>) {
    loop {
        if rx.changed().await.is_err() {
            // Monitor dropped: no further transitions can happen.
            std::future::pending::<()>().await;
        }
        if *rx.borrow_and_update() {
            return;
        }
    }
}
