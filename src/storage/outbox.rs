//! Outbox bookkeeping. Sequence numbers are assigned per conversation at
//! enqueue time, inside the same transaction that persists the message, and
//! the drain consumes entries strictly in that order.

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use super::messages::{insert_message, read_message};
use super::{LocalStore, StoreEvent};
use crate::error::SyncError;
use crate::models::{now_ms, DeliveryStatus, Message, OutboxEntry, TimestampMs};

impl LocalStore {
    /// Persists a freshly composed message and queues it for delivery, as
    /// one atomic step. The message is expected to be new (`sending`, not
    /// synced); a duplicate id is a caller bug surfaced as a constraint
    /// error.
    pub async fn enqueue_message(&self, message: &Message) -> Result<OutboxEntry, SyncError> {
        let entry;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            insert_message(&tx, message)?;
            entry = insert_outbox_entry(&tx, &message.id, &message.conversation_id)?;
            tx.commit()?;
        }

        debug!(
            "enqueued message {} as #{} for {}",
            entry.message_id, entry.sequence, entry.conversation_id
        );
        self.emit(StoreEvent::MessageSaved {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
        });
        Ok(entry)
    }

    /// All pending entries, ordered by (conversation, sequence).
    pub async fn pending_entries(&self) -> Result<Vec<OutboxEntry>, SyncError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT message_id, conversation_id, sequence, enqueued_at,
                    attempts, last_attempt_at, next_attempt_at
             FROM outbox ORDER BY conversation_id ASC, sequence ASC",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;
        collect_entries(rows)
    }

    /// Pending entries for one conversation, in drain order.
    pub async fn pending_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<OutboxEntry>, SyncError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT message_id, conversation_id, sequence, enqueued_at,
                    attempts, last_attempt_at, next_attempt_at
             FROM outbox WHERE conversation_id = ? ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], row_to_entry)?;
        collect_entries(rows)
    }

    /// The soonest `next_attempt_at` across the whole outbox, if anything is
    /// queued. Drives the drain loop's wakeup timer.
    pub async fn earliest_next_attempt(&self) -> Result<Option<TimestampMs>, SyncError> {
        let conn = self.conn.lock().await;
        let earliest = conn.query_row("SELECT MIN(next_attempt_at) FROM outbox", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        Ok(earliest)
    }

    /// Conversations that currently have queued messages.
    pub async fn conversations_with_pending(&self) -> Result<Vec<String>, SyncError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT DISTINCT conversation_id FROM outbox ORDER BY conversation_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub async fn outbox_entry(&self, message_id: &str) -> Result<Option<OutboxEntry>, SyncError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT message_id, conversation_id, sequence, enqueued_at,
                    attempts, last_attempt_at, next_attempt_at
             FROM outbox WHERE message_id = ?",
            params![message_id],
            row_to_entry,
        )
        .optional()
        .map_err(SyncError::from)
    }

    /// Drops an entry after the remote store acknowledged (or terminally
    /// rejected) that exact message id.
    pub async fn remove_outbox_entry(&self, message_id: &str) -> Result<(), SyncError> {
        let conversation_id;
        {
            let conn = self.conn.lock().await;
            conversation_id = conn
                .query_row(
                    "SELECT conversation_id FROM outbox WHERE message_id = ?",
                    params![message_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            conn.execute(
                "DELETE FROM outbox WHERE message_id = ?",
                params![message_id],
            )?;
        }
        if let Some(conversation_id) = conversation_id {
            self.emit(StoreEvent::OutboxChanged { conversation_id });
        }
        Ok(())
    }

    /// Transient failure: count the attempt and push the entry's next try
    /// out to `next_attempt_at`. Returns the new attempt count.
    pub async fn bump_retry(
        &self,
        message_id: &str,
        next_attempt_at: TimestampMs,
    ) -> Result<u32, SyncError> {
        let attempts;
        let conversation_id;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE outbox
                 SET attempts = attempts + 1, last_attempt_at = ?, next_attempt_at = ?
                 WHERE message_id = ?",
                params![now_ms(), next_attempt_at, message_id],
            )?;
            let row: Option<(u32, String)> = tx
                .query_row(
                    "SELECT attempts, conversation_id FROM outbox WHERE message_id = ?",
                    params![message_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            tx.commit()?;
            let Some((a, c)) = row else {
                return Err(SyncError::NotFound(format!("outbox entry {message_id}")));
            };
            attempts = a;
            conversation_id = c;
        }
        self.emit(StoreEvent::OutboxChanged { conversation_id });
        Ok(attempts)
    }

    /// Explicit user retry of a failed message: resets `error` back to
    /// `sending` and re-enqueues at the tail of the conversation's queue
    /// with a fresh attempt counter. Rejected for messages in any other
    /// status, and a message already queued is left alone.
    pub async fn requeue_at_tail(&self, message_id: &str) -> Result<OutboxEntry, SyncError> {
        let entry;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let message = read_message(&tx, message_id)?
                .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;
            if message.status != DeliveryStatus::Error {
                return Err(SyncError::Validation(
                    "retry is only valid for failed messages".to_string(),
                ));
            }
            let already_queued: Option<i64> = tx
                .query_row(
                    "SELECT sequence FROM outbox WHERE message_id = ?",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            if already_queued.is_some() {
                return Err(SyncError::Validation(
                    "message is already queued for send".to_string(),
                ));
            }

            // The one sanctioned backward transition in the lattice.
            tx.execute(
                "UPDATE messages SET status = ? WHERE id = ?",
                params![DeliveryStatus::Sending.code(), message_id],
            )?;
            entry = insert_outbox_entry(&tx, message_id, &message.conversation_id)?;
            tx.commit()?;
        }

        debug!(
            "requeued failed message {} as #{} for {}",
            entry.message_id, entry.sequence, entry.conversation_id
        );
        self.emit(StoreEvent::MessageSaved {
            conversation_id: entry.conversation_id.clone(),
            message_id: message_id.to_string(),
        });
        Ok(entry)
    }
}

fn insert_outbox_entry(
    conn: &Connection,
    message_id: &str,
    conversation_id: &str,
) -> Result<OutboxEntry, SyncError> {
    let sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM outbox WHERE conversation_id = ?",
        params![conversation_id],
        |row| row.get(0),
    )?;
    let enqueued_at = now_ms();
    conn.execute(
        "INSERT INTO outbox (
            message_id, conversation_id, sequence, enqueued_at,
            attempts, last_attempt_at, next_attempt_at
        ) VALUES (?, ?, ?, ?, 0, NULL, 0)",
        params![message_id, conversation_id, sequence, enqueued_at],
    )?;
    Ok(OutboxEntry {
        message_id: message_id.to_string(),
        conversation_id: conversation_id.to_string(),
        sequence,
        enqueued_at,
        attempts: 0,
        last_attempt_at: None,
        next_attempt_at: 0,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence: row.get(2)?,
        enqueued_at: row.get(3)?,
        attempts: row.get(4)?,
        last_attempt_at: row.get(5)?,
        next_attempt_at: row.get(6)?,
    })
}

fn collect_entries(
    rows: impl Iterator<Item = rusqlite::Result<OutboxEntry>>,
) -> Result<Vec<OutboxEntry>, SyncError> {
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}
