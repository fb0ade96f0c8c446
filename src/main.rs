use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, LevelFilter};

use chatsync::remote::memory::{MemoryRemote, StaticProfiles};
use chatsync::{ChatClient, ConnectivityMonitor, DeliveryStatus, LocalStore};

/// Command line arguments for the chatsync demo driver
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: offline-first conversation sync engine demo.",
    long_about = "Runs two chat clients against the bundled in-memory remote store and\n\
    walks through the offline send path: messages queued while disconnected,\n\
    drained in order on reconnect, then acknowledged as delivered and read by\n\
    the peer.\n\n\
    Optional parameters:\n\
    --db <PATH>    Persist the first client's local store to a SQLite file\n\
    Use -h or --help to see all options."
)]
struct Args {
    /// SQLite file for the first client's local store (in-memory if omitted)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    info!("chatsync demo starting up");

    let remote = Arc::new(MemoryRemote::new());
    let profiles = Arc::new(
        StaticProfiles::new()
            .with("alice", "Alice Park")
            .with("bob", "Bob Ortiz"),
    );

    let alice_store = Arc::new(match &args.db {
        Some(path) => LocalStore::open(Some(path.clone()))?,
        None => LocalStore::open_in_memory()?,
    });
    let alice_net = ConnectivityMonitor::new(true);
    let alice = ChatClient::new(
        "alice",
        alice_store,
        remote.clone(),
        profiles.clone(),
        alice_net.clone(),
    );
    alice.start().await;
    alice.handle_app_foreground().await;

    let bob_store = Arc::new(LocalStore::open_in_memory()?);
    let bob = ChatClient::new(
        "bob",
        bob_store,
        remote.clone(),
        profiles.clone(),
        ConnectivityMonitor::new(true),
    );
    bob.start().await;
    bob.handle_app_foreground().await;

    // Set up the conversation while connected, then cut Alice off.
    let conversation = alice.create_or_get_direct("bob").await?;
    info!(
        "conversation {} created ({})",
        conversation.id,
        alice.directory().display_title(&conversation).await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice_net.set_online(false);
    info!("alice went offline; composing messages anyway");
    let mut sent_ids = Vec::new();
    for text in ["First while offline", "Second while offline", "Third one"] {
        let id = alice.send_message(&conversation.id, text, None).await?;
        sent_ids.push(id);
    }
    for message in alice.messages(&conversation.id).await? {
        info!(
            "  queued: {:?} '{}' (synced: {})",
            message.status, message.text, message.is_synced
        );
        assert_eq!(message.status, DeliveryStatus::Sending);
    }

    info!("alice back online; the engine drains the queue in order");
    alice_net.set_online(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    for message in alice.messages(&conversation.id).await? {
        info!(
            "  drained: {:?} '{}' (synced: {})",
            message.status, message.text, message.is_synced
        );
    }
    info!(
        "remote store now holds {} message(s)",
        remote.message_count(&conversation.id).await
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(
        "bob's unread count before opening: {}",
        bob.directory().unread_count(&conversation.id).await?
    );
    bob.open_conversation(&conversation.id).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!(
        "bob opened the conversation; unread count now: {}",
        bob.directory().unread_count(&conversation.id).await?
    );

    // Alice opens the thread and sees bob's read receipts come back.
    alice.open_conversation(&conversation.id).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    for message in alice.messages(&conversation.id).await? {
        info!(
            "  alice sees: '{}' display status {:?}",
            message.text,
            message.display_status(&conversation.participant_ids)
        );
    }

    // Editing within the window propagates to the open peer.
    if let Some(last_id) = sent_ids.last() {
        alice.edit_message(last_id, "Third one (edited)").await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Some(message) = bob.store().get_message(last_id).await? {
            info!(
                "bob sees the edit: '{}' (history: {:?})",
                message.text, message.edit_history
            );
        }
    }

    // Ephemeral state: typing indicator and presence.
    bob.start_typing(&conversation.id).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!(
        "alice sees typing from: {:?}",
        alice.typing_users(&conversation.id).await
    );
    bob.stop_typing(&conversation.id).await?;

    if let Some(presence) = alice.presence_of("bob").await {
        info!(
            "bob's presence: online={} last_seen={:?}",
            presence.is_online, presence.last_seen
        );
    }
    bob.handle_app_background().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(presence) = alice.presence_of("bob").await {
        info!(
            "bob went to background: online={} last_seen={:?}",
            presence.is_online, presence.last_seen
        );
    }

    alice.shutdown().await;
    bob.shutdown().await;
    info!("chatsync demo finished");
    Ok(())
}
