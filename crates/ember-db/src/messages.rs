use rusqlite::{Connection, OptionalExtension};

use ember_types::models::{ConversationId, MessageId, UserId};

use crate::conversations::participant_access;
use crate::error::StoreError;
use crate::models::{MessageRow, encode_ts, now, ts_column};
use crate::users::query_user_by_id;
use crate::Database;

pub const MAX_MESSAGE_CHARS: usize = 4000;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, u.username, u.display_name, m.content, m.created_at
     FROM messages m
     JOIN users u ON u.id = m.sender_id";

/// Forward cursor over a conversation's messages, oldest first.
#[derive(Debug, Clone, Copy)]
pub struct MessagePage {
    /// Only messages with an id greater than this one.
    pub after: Option<MessageId>,
    pub limit: u32,
}

impl MessagePage {
    pub fn new(after: Option<MessageId>, limit: Option<u32>) -> Self {
        Self {
            after,
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }
}

impl Default for MessagePage {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl Database {
    /// Append a message and bump the conversation's `updated_at`.
    ///
    /// `created_at` never goes backwards within a conversation: if the clock
    /// reads earlier than the newest stored message, that message's
    /// timestamp is reused and the id breaks the tie.
    pub fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessageRow, StoreError> {
        validate_content(content)?;

        self.with_tx(|tx| {
            participant_access(tx, conversation_id, sender_id)?;

            let latest = tx
                .query_row(
                    "SELECT created_at FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    [conversation_id],
                    |row| ts_column(row, 0),
                )
                .optional()?;
            let clock = now();
            let created_at = latest.filter(|latest| *latest > clock).unwrap_or(clock);
            let stamp = encode_ts(created_at);

            tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![conversation_id, sender_id, content, stamp],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                rusqlite::params![conversation_id, stamp],
            )?;

            let sender = query_user_by_id(tx, sender_id)?.ok_or(StoreError::NotFound("user"))?;

            Ok(MessageRow {
                id,
                conversation_id,
                sender_id,
                sender_username: sender.username,
                sender_display_name: sender.display_name,
                content: content.to_string(),
                created_at,
            })
        })
    }

    /// Messages oldest first. `NotFound` for an unknown conversation,
    /// `Forbidden` if `requester_id` is not a participant.
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        requester_id: UserId,
        page: MessagePage,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.with_conn(|conn| {
            participant_access(conn, conversation_id, requester_id)?;

            let sql = format!(
                "{} WHERE m.conversation_id = ?1 AND m.id > ?2 ORDER BY m.created_at ASC, m.id ASC LIMIT ?3",
                MESSAGE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![conversation_id, page.after.unwrap_or(0), page.limit],
                    message_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn query_last_message(
    conn: &Connection,
    conversation_id: ConversationId,
) -> Result<Option<MessageRow>, StoreError> {
    let sql = format!(
        "{} WHERE m.conversation_id = ?1 ORDER BY m.created_at DESC, m.id DESC LIMIT 1",
        MESSAGE_SELECT
    );
    Ok(conn.query_row(&sql, [conversation_id], message_from_row).optional()?)
}

fn validate_content(content: &str) -> Result<(), StoreError> {
    if content.trim().is_empty() {
        return Err(StoreError::InvalidInput("message content must not be empty".into()));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(StoreError::InvalidInput(format!(
            "message content exceeds {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(())
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row.get(3)?,
        sender_display_name: row.get(4)?,
        content: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}
