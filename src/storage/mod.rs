//! Durable local persistence: conversations, messages, receipts, and the
//! pending outbox, on SQLite. Single source of truth while offline.
//!
//! Every logical mutation runs inside one SQLite transaction, which is what
//! serializes concurrent writers per entity and keeps the merge invariants
//! (status never regresses, receipt sets only grow) intact. Change events go
//! out on a broadcast channel after the write lock is released, so slow
//! observers never stall a writer.

mod messages;
mod outbox;

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Mutex};

use crate::error::SyncError;
use crate::models::{Conversation, ConversationKind, TimestampMs};

/// Default retention horizon for [`LocalStore::prune_synced_messages`].
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Default page size for [`LocalStore::get_messages_page`].
pub const DEFAULT_PAGE_SIZE: usize = 50;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notification published after each mutating store operation.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    MessageSaved {
        conversation_id: String,
        message_id: String,
    },
    ConversationSaved {
        conversation_id: String,
    },
    ConversationDeleted {
        conversation_id: String,
    },
    /// Outbox bookkeeping changed (retry scheduled, entry drained) without
    /// the message document itself changing.
    OutboxChanged {
        conversation_id: String,
    },
    HistoryPruned {
        removed: usize,
    },
}

pub struct LocalStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Opens (or creates) the store at `path`; `None` resolves the platform
    /// data directory.
    pub fn open(path: Option<PathBuf>) -> Result<Self, SyncError> {
        let path = match path {
            Some(p) => p,
            None => {
                let mut dir = dirs::data_dir().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "could not determine platform data directory",
                    )
                })?;
                dir.push("chatsync");
                std::fs::create_dir_all(&dir)?;
                dir.push("chatsync.db");
                dir
            }
        };
        debug!("opening local store at {}", path.display());
        let conn = Connection::open(&path)?;
        Self::from_connection(conn)
    }

    /// Ephemeral store, for the demo driver and tests.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        Self::create_tables(&conn)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(LocalStore {
            conn: Mutex::new(conn),
            events,
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), SyncError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                participant_ids TEXT NOT NULL,
                last_message_text TEXT,
                last_message_at INTEGER,
                unread_counts TEXT NOT NULL DEFAULT '{}',
                group_name TEXT,
                group_avatar_url TEXT,
                admin_ids TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                status INTEGER NOT NULL,
                is_synced INTEGER NOT NULL DEFAULT 0,
                media TEXT,
                edited_at INTEGER,
                edit_history TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages (conversation_id, created_at)",
            [],
        )?;

        // Receipt sets live as rows, one per (message, user, kind), so a
        // union merge is INSERT OR IGNORE and membership can never be lost
        // by an overwrite.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS receipts (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id, kind)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbox (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                next_attempt_at INTEGER NOT NULL DEFAULT 0,
                UNIQUE (conversation_id, sequence)
            )",
            [],
        )?;

        Ok(())
    }

    /// Subscribe to change notifications. Delivery is asynchronous; a slow
    /// subscriber that lags past the channel capacity misses events and
    /// should re-read the store.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: StoreEvent) {
        // No receivers is fine; the store does not care who listens.
        let _ = self.events.send(event);
    }

    /// Upsert a conversation document. Denormalized scalar fields
    /// (`last_message_text`, `unread_counts`, group metadata) are plain
    /// last-writer-wins overwrites, deliberately unlike the message merge.
    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<(), SyncError> {
        let participant_ids = serde_json::to_string(&conversation.participant_ids)?;
        let admin_ids = serde_json::to_string(&conversation.admin_ids)?;
        let unread_counts = serde_json::to_string(&conversation.unread_counts)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO conversations (
                id, kind, participant_ids, last_message_text, last_message_at,
                unread_counts, group_name, group_avatar_url, admin_ids, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                conversation.id,
                conversation.kind.as_str(),
                participant_ids,
                conversation.last_message_text,
                conversation.last_message_at,
                unread_counts,
                conversation.group_name,
                conversation.group_avatar_url,
                admin_ids,
                conversation.created_at,
            ],
        )?;
        drop(conn);

        self.emit(StoreEvent::ConversationSaved {
            conversation_id: conversation.id.clone(),
        });
        Ok(())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, SyncError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, kind, participant_ids, last_message_text, last_message_at,
                    unread_counts, group_name, group_avatar_url, admin_ids, created_at
             FROM conversations WHERE id = ?",
            params![id],
            row_to_conversation,
        )
        .optional()
        .map_err(SyncError::from)
    }

    /// Conversations the user participates in, most recent activity first.
    pub async fn get_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, SyncError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, kind, participant_ids, last_message_text, last_message_at,
                    unread_counts, group_name, group_avatar_url, admin_ids, created_at
             FROM conversations
             ORDER BY last_message_at IS NULL, last_message_at DESC, created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            let conversation = row?;
            if conversation.participant_ids.iter().any(|p| p == user_id) {
                conversations.push(conversation);
            }
        }
        Ok(conversations)
    }

    /// Overwrites just the latest-message cache fields.
    pub async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message_text: &str,
        last_message_at: TimestampMs,
    ) -> Result<(), SyncError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE conversations SET last_message_text = ?, last_message_at = ? WHERE id = ?",
            params![last_message_text, last_message_at, conversation_id],
        )?;
        drop(conn);

        self.emit(StoreEvent::ConversationSaved {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Zeroes one user's unread counter on a conversation.
    pub async fn clear_unread(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<(), SyncError> {
        let mut changed = false;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let raw: Option<String> = tx
                .query_row(
                    "SELECT unread_counts FROM conversations WHERE id = ?",
                    params![conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(raw) = raw {
                let mut counts: BTreeMap<String, u32> = serde_json::from_str(&raw)?;
                if counts.remove(user_id).unwrap_or(0) > 0 {
                    tx.execute(
                        "UPDATE conversations SET unread_counts = ? WHERE id = ?",
                        params![serde_json::to_string(&counts)?, conversation_id],
                    )?;
                    changed = true;
                }
            }
            tx.commit()?;
        }

        if changed {
            self.emit(StoreEvent::ConversationSaved {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    /// Removes a conversation along with its messages, receipts, and outbox
    /// entries, all-or-nothing.
    pub async fn delete_conversation_cascade(
        &self,
        conversation_id: &str,
    ) -> Result<(), SyncError> {
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM receipts WHERE message_id IN
                     (SELECT id FROM messages WHERE conversation_id = ?)",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM outbox WHERE conversation_id = ?",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?",
                params![conversation_id],
            )?;
            tx.execute(
                "DELETE FROM conversations WHERE id = ?",
                params![conversation_id],
            )?;
            tx.commit()?;
        }

        info!("deleted conversation {} and its history", conversation_id);
        self.emit(StoreEvent::ConversationDeleted {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Cache-retention sweep: drops synced messages older than the cutoff.
    /// Pending (unsynced or queued) messages are never touched. Host-invoked
    /// maintenance; the engine itself never deletes messages outside the
    /// conversation cascade.
    pub async fn prune_synced_messages(&self, older_than_days: i64) -> Result<usize, SyncError> {
        let cutoff = crate::models::now_ms() - older_than_days * 24 * 60 * 60 * 1_000;
        let removed;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM receipts WHERE message_id IN
                     (SELECT id FROM messages
                      WHERE created_at < ? AND is_synced = 1
                        AND id NOT IN (SELECT message_id FROM outbox))",
                params![cutoff],
            )?;
            removed = tx.execute(
                "DELETE FROM messages
                 WHERE created_at < ? AND is_synced = 1
                   AND id NOT IN (SELECT message_id FROM outbox)",
                params![cutoff],
            )?;
            tx.commit()?;
        }

        if removed > 0 {
            info!("pruned {} messages older than {} days", removed, older_than_days);
            self.emit(StoreEvent::HistoryPruned { removed });
        }
        Ok(removed)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let kind_raw: String = row.get(1)?;
    let participant_raw: String = row.get(2)?;
    let unread_raw: String = row.get(5)?;
    let admin_raw: String = row.get(8)?;

    Ok(Conversation {
        id: row.get(0)?,
        kind: ConversationKind::from_str(&kind_raw).ok_or_else(|| bad_column(1, &kind_raw))?,
        participant_ids: parse_json_column(2, &participant_raw)?,
        last_message_text: row.get(3)?,
        last_message_at: row.get(4)?,
        unread_counts: parse_json_column(5, &unread_raw)?,
        group_name: row.get(6)?,
        group_avatar_url: row.get(7)?,
        admin_ids: parse_json_column(8, &admin_raw)?,
        created_at: row.get(9)?,
    })
}

pub(crate) fn parse_json_column<T: serde::de::DeserializeOwned>(
    index: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn bad_column(index: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unexpected value {raw:?}").into(),
    )
}
