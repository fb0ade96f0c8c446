//! Message and receipt operations. The upsert here is a merge, never an
//! overwrite: status goes through the delivery lattice, receipt sets union,
//! and the body follows last-writer-wins by edit time.

use std::collections::{BTreeSet, HashMap};

use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_json_column, LocalStore, StoreEvent};
use crate::error::SyncError;
use crate::models::{DeliveryStatus, Message, ReceiptKind, TimestampMs};

impl LocalStore {
    /// Upsert by message id. For an existing row, field-wise merge: status is
    /// forward-only per the lattice, `is_synced` is sticky once true,
    /// `deliveredTo`/`readBy` union in, and `created_at` stays immutable.
    /// Returns the merged message as now persisted.
    pub async fn save_message(&self, incoming: &Message) -> Result<Message, SyncError> {
        let merged;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            match read_message(&tx, &incoming.id)? {
                None => insert_message(&tx, incoming)?,
                Some(current) => {
                    let status = DeliveryStatus::merge(current.status, incoming.status);
                    let is_synced = current.is_synced || incoming.is_synced;
                    // Last-writer-wins on the body: a newer edit replaces
                    // text, media, and history together.
                    let incoming_newer =
                        incoming.edited_at.unwrap_or(0) > current.edited_at.unwrap_or(0);
                    let winner = if incoming_newer { incoming } else { &current };
                    let media_json = encode_media(&winner.media)?;
                    let history_json = serde_json::to_string(&winner.edit_history)?;
                    tx.execute(
                        "UPDATE messages
                         SET body = ?, status = ?, is_synced = ?, media = ?,
                             edited_at = ?, edit_history = ?
                         WHERE id = ?",
                        params![
                            winner.text,
                            status.code(),
                            is_synced,
                            media_json,
                            winner.edited_at,
                            history_json,
                            incoming.id,
                        ],
                    )?;
                }
            }

            for user in &incoming.delivered_to {
                insert_receipt(&tx, &incoming.id, user, ReceiptKind::Delivered)?;
            }
            for user in &incoming.read_by {
                insert_receipt(&tx, &incoming.id, user, ReceiptKind::Delivered)?;
                insert_receipt(&tx, &incoming.id, user, ReceiptKind::Read)?;
            }

            merged = read_message(&tx, &incoming.id)?
                .ok_or_else(|| SyncError::NotFound(format!("message {}", incoming.id)))?;
            tx.commit()?;
        }

        self.emit(StoreEvent::MessageSaved {
            conversation_id: merged.conversation_id.clone(),
            message_id: merged.id.clone(),
        });
        Ok(merged)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, SyncError> {
        let conn = self.conn.lock().await;
        Ok(read_message(&conn, id)?)
    }

    /// Full history for a conversation, oldest first.
    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_id, body, created_at, status,
                    is_synced, media, edited_at, edit_history
             FROM messages WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        attach_receipts(&conn, conversation_id, &mut messages)?;
        Ok(messages)
    }

    /// Newest-first page of at most `limit` messages, strictly older than
    /// `before` when given. For incremental history display.
    pub async fn get_messages_page(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<TimestampMs>,
    ) -> Result<Vec<Message>, SyncError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender_id, body, created_at, status,
                    is_synced, media, edited_at, edit_history
             FROM messages
             WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![conversation_id, before, limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        attach_receipts(&conn, conversation_id, &mut messages)?;
        Ok(messages)
    }

    /// Records one recipient acknowledgement. A read receipt implies a
    /// delivered one. After the union, the aggregate status across all
    /// non-sender participants is re-evaluated and merged in, so a direct
    /// chat's single ack can raise `sending` straight to `delivered`.
    ///
    /// Receipts may outrun their message (listener races); the row is kept
    /// either way and folds in once the message document arrives.
    pub async fn add_receipt(
        &self,
        message_id: &str,
        user_id: &str,
        kind: ReceiptKind,
    ) -> Result<Option<Message>, SyncError> {
        let mut changed = false;
        let updated;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;

            changed |= insert_receipt(&tx, message_id, user_id, ReceiptKind::Delivered)?;
            if kind == ReceiptKind::Read {
                changed |= insert_receipt(&tx, message_id, user_id, ReceiptKind::Read)?;
            }

            updated = match read_message(&tx, message_id)? {
                None => None,
                Some(mut message) => {
                    let participants: Option<String> = tx
                        .query_row(
                            "SELECT participant_ids FROM conversations WHERE id = ?",
                            params![message.conversation_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(raw) = participants {
                        let participant_ids: Vec<String> = serde_json::from_str(&raw)?;
                        if let Some(aggregate) = receipt_aggregate(&message, &participant_ids) {
                            let next = DeliveryStatus::merge(message.status, aggregate);
                            if next != message.status {
                                tx.execute(
                                    "UPDATE messages SET status = ? WHERE id = ?",
                                    params![next.code(), message_id],
                                )?;
                                message.status = next;
                                changed = true;
                            }
                        }
                    }
                    Some(message)
                }
            };
            tx.commit()?;
        }

        if changed {
            if let Some(message) = &updated {
                self.emit(StoreEvent::MessageSaved {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.id.clone(),
                });
            }
        }
        Ok(updated)
    }

    /// Push acknowledged: raise to `sent` (lattice-merged) and flag synced,
    /// in one transaction.
    pub async fn mark_sent(&self, message_id: &str) -> Result<(), SyncError> {
        let event;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT conversation_id, status FROM messages WHERE id = ?",
                    params![message_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((conversation_id, code)) = row else {
                warn!("sent acknowledgement for unknown message {message_id}");
                return Ok(());
            };
            let current = DeliveryStatus::from_code(code)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, code))?;
            let target = DeliveryStatus::merge(current, DeliveryStatus::Sent);
            tx.execute(
                "UPDATE messages SET status = ?, is_synced = 1 WHERE id = ?",
                params![target.code(), message_id],
            )?;
            tx.commit()?;
            event = StoreEvent::MessageSaved {
                conversation_id,
                message_id: message_id.to_string(),
            };
        }
        self.emit(event);
        Ok(())
    }

    /// Terminal send failure: `sending`/`sent` drop to `error`, anything the
    /// remote already confirmed is left alone.
    pub async fn mark_failed(&self, message_id: &str) -> Result<(), SyncError> {
        self.transition(message_id, DeliveryStatus::after_failure).await
    }

    /// Merge an externally supplied status through the lattice.
    pub async fn update_message_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<(), SyncError> {
        self.transition(message_id, move |current| {
            DeliveryStatus::merge(current, status)
        })
        .await
    }

    pub async fn mark_synced(&self, message_id: &str) -> Result<(), SyncError> {
        let conversation_id;
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE messages SET is_synced = 1 WHERE id = ?",
                params![message_id],
            )?;
            conversation_id = conn
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?",
                    params![message_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
        }
        if let Some(conversation_id) = conversation_id {
            self.emit(StoreEvent::MessageSaved {
                conversation_id,
                message_id: message_id.to_string(),
            });
        }
        Ok(())
    }

    /// Replaces the body, archiving the previous one. Caller enforces the
    /// sender-only and edit-window rules.
    pub async fn apply_edit(
        &self,
        message_id: &str,
        new_text: &str,
        edited_at: TimestampMs,
    ) -> Result<Message, SyncError> {
        let updated;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let mut message = read_message(&tx, message_id)?
                .ok_or_else(|| SyncError::NotFound(format!("message {message_id}")))?;

            message.edit_history.push(message.text.clone());
            message.text = new_text.to_string();
            message.edited_at = Some(edited_at);
            tx.execute(
                "UPDATE messages SET body = ?, edited_at = ?, edit_history = ? WHERE id = ?",
                params![
                    message.text,
                    message.edited_at,
                    serde_json::to_string(&message.edit_history)?,
                    message_id,
                ],
            )?;
            tx.commit()?;
            updated = message;
        }

        self.emit(StoreEvent::MessageSaved {
            conversation_id: updated.conversation_id.clone(),
            message_id: updated.id.clone(),
        });
        Ok(updated)
    }

    async fn transition<F>(&self, message_id: &str, next: F) -> Result<(), SyncError>
    where
        F: FnOnce(DeliveryStatus) -> DeliveryStatus,
    {
        let event;
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let row: Option<(String, i64)> = tx
                .query_row(
                    "SELECT conversation_id, status FROM messages WHERE id = ?",
                    params![message_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((conversation_id, code)) = row else {
                // Can happen when a cascade delete races a drain; nothing to do.
                warn!("status transition for unknown message {message_id}");
                return Ok(());
            };
            let current = DeliveryStatus::from_code(code)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, code))?;
            let target = next(current);
            if target != current {
                tx.execute(
                    "UPDATE messages SET status = ? WHERE id = ?",
                    params![target.code(), message_id],
                )?;
            }
            tx.commit()?;
            event = StoreEvent::MessageSaved {
                conversation_id,
                message_id: message_id.to_string(),
            };
        }
        self.emit(event);
        Ok(())
    }
}

/// Aggregate receipt coverage across all non-sender participants: `read`
/// once everyone has read, `delivered` once everyone has it, else nothing
/// to conclude. The caller merges the result so status only ever rises.
fn receipt_aggregate(message: &Message, participant_ids: &[String]) -> Option<DeliveryStatus> {
    let recipients: Vec<&String> = participant_ids
        .iter()
        .filter(|p| **p != message.sender_id)
        .collect();
    if recipients.is_empty() {
        return None;
    }
    if recipients.iter().all(|p| message.read_by.contains(p.as_str())) {
        Some(DeliveryStatus::Read)
    } else if recipients
        .iter()
        .all(|p| message.delivered_to.contains(p.as_str()))
    {
        Some(DeliveryStatus::Delivered)
    } else {
        None
    }
}

fn encode_media(
    media: &Option<crate::models::MediaDescriptor>,
) -> Result<Option<String>, SyncError> {
    Ok(match media {
        Some(m) => Some(serde_json::to_string(m)?),
        None => None,
    })
}

pub(super) fn insert_message(conn: &Connection, message: &Message) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO messages (
            id, conversation_id, sender_id, body, created_at, status,
            is_synced, media, edited_at, edit_history
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            message.id,
            message.conversation_id,
            message.sender_id,
            message.text,
            message.created_at,
            message.status.code(),
            message.is_synced,
            encode_media(&message.media)?,
            message.edited_at,
            serde_json::to_string(&message.edit_history)?,
        ],
    )?;
    Ok(())
}

fn insert_receipt(
    conn: &Connection,
    message_id: &str,
    user_id: &str,
    kind: ReceiptKind,
) -> Result<bool, SyncError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO receipts (message_id, user_id, kind) VALUES (?, ?, ?)",
        params![message_id, user_id, kind.as_str()],
    )?;
    Ok(inserted > 0)
}

pub(super) fn read_message(
    conn: &Connection,
    id: &str,
) -> Result<Option<Message>, SyncError> {
    let message = conn
        .query_row(
            "SELECT id, conversation_id, sender_id, body, created_at, status,
                    is_synced, media, edited_at, edit_history
             FROM messages WHERE id = ?",
            params![id],
            row_to_message,
        )
        .optional()?;

    let Some(mut message) = message else {
        return Ok(None);
    };
    let mut stmt = conn.prepare("SELECT user_id, kind FROM receipts WHERE message_id = ?")?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (user_id, kind) = row?;
        match ReceiptKind::from_str(&kind) {
            Some(ReceiptKind::Delivered) => {
                message.delivered_to.insert(user_id);
            }
            Some(ReceiptKind::Read) => {
                message.read_by.insert(user_id);
            }
            None => warn!("ignoring receipt with unknown kind {kind:?}"),
        }
    }
    Ok(Some(message))
}

/// Bulk-loads the receipt sets for every message in `messages`.
fn attach_receipts(
    conn: &Connection,
    conversation_id: &str,
    messages: &mut [Message],
) -> Result<(), SyncError> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut delivered: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut read: HashMap<String, BTreeSet<String>> = HashMap::new();

    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id, r.kind
         FROM receipts r
         JOIN messages m ON m.id = r.message_id
         WHERE m.conversation_id = ?",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    for row in rows {
        let (message_id, user_id, kind) = row?;
        match ReceiptKind::from_str(&kind) {
            Some(ReceiptKind::Delivered) => {
                delivered.entry(message_id).or_default().insert(user_id);
            }
            Some(ReceiptKind::Read) => {
                read.entry(message_id).or_default().insert(user_id);
            }
            None => warn!("ignoring receipt with unknown kind {kind:?}"),
        }
    }

    for message in messages {
        if let Some(set) = delivered.remove(&message.id) {
            message.delivered_to = set;
        }
        if let Some(set) = read.remove(&message.id) {
            message.read_by = set;
        }
    }
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let status_code: i64 = row.get(5)?;
    let media_raw: Option<String> = row.get(7)?;
    let history_raw: String = row.get(9)?;

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
        status: DeliveryStatus::from_code(status_code)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, status_code))?,
        delivered_to: BTreeSet::new(),
        read_by: BTreeSet::new(),
        is_synced: row.get(6)?,
        media: match media_raw {
            Some(raw) => Some(parse_json_column(7, &raw)?),
            None => None,
        },
        edited_at: row.get(8)?,
        edit_history: parse_json_column(9, &history_raw)?,
    })
}
