use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use ember_types::models::{CanonicalPair, ConversationId, UserId};

use crate::error::StoreError;
use crate::messages::query_last_message;
use crate::models::{ConversationRow, ConversationSummaryRow, encode_ts, now, ts_column};
use crate::users::user_exists;
use crate::Database;

impl Database {
    /// Fetch the conversation for `{user_a, user_b}`, creating it if none
    /// exists. The bool is `true` when this call created it.
    pub fn get_or_create_for_pair(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<(ConversationRow, bool), StoreError> {
        let pair = canonical(user_a, user_b)?;
        self.with_tx(|tx| get_or_create_in(tx, pair))
    }

    /// Direct conversation without a prior match. Whether this is allowed at
    /// all is product policy and is decided by the caller.
    pub fn open_direct_conversation(
        &self,
        user_id: UserId,
        other_id: UserId,
    ) -> Result<(ConversationRow, bool), StoreError> {
        let pair = canonical(user_id, other_id)?;
        self.with_tx(|tx| {
            if !user_exists(tx, other_id)? {
                return Err(StoreError::NotFound("user"));
            }
            get_or_create_in(tx, pair)
        })
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationRow>, StoreError> {
        self.with_conn(|conn| load_conversation(conn, id))
    }

    /// `NotFound` when the conversation does not exist, `Forbidden` when it
    /// does but `user_id` is not in it.
    pub fn get_for_participant(
        &self,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<ConversationSummaryRow, StoreError> {
        self.with_conn(|conn| {
            let conversation = participant_access(conn, id, user_id)?;
            let last_message = query_last_message(conn, id)?;
            Ok(ConversationSummaryRow {
                conversation,
                last_message,
            })
        })
    }

    /// All conversations `user_id` takes part in, most recently active first.
    pub fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationSummaryRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC, c.id DESC",
            )?;

            let heads = stmt
                .query_map([user_id], |row| {
                    Ok((row.get::<_, ConversationId>(0)?, ts_column(row, 1)?, ts_column(row, 2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut summaries = Vec::with_capacity(heads.len());
            for (id, created_at, updated_at) in heads {
                summaries.push(ConversationSummaryRow {
                    conversation: ConversationRow {
                        id,
                        participant_ids: query_participants(conn, id)?,
                        created_at,
                        updated_at,
                    },
                    last_message: query_last_message(conn, id)?,
                });
            }
            Ok(summaries)
        })
    }
}

pub(crate) fn canonical(user_a: UserId, user_b: UserId) -> Result<CanonicalPair, StoreError> {
    CanonicalPair::new(user_a, user_b)
        .ok_or_else(|| StoreError::InvalidInput("a conversation needs two distinct users".into()))
}

/// Caller must hold a write transaction; the lookup and the insert are only
/// race-free because nothing else can write in between.
pub(crate) fn get_or_create_in(
    conn: &Connection,
    pair: CanonicalPair,
) -> Result<(ConversationRow, bool), StoreError> {
    if let Some(id) = find_for_pair(conn, pair)? {
        let existing = load_conversation(conn, id)?.ok_or(StoreError::NotFound("conversation"))?;
        return Ok((existing, false));
    }

    let ts = now();
    conn.execute(
        "INSERT INTO conversations (created_at, updated_at) VALUES (?1, ?1)",
        [encode_ts(ts)],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare(
        "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
    )?;
    stmt.execute([id, pair.low()])?;
    stmt.execute([id, pair.high()])?;

    debug!("Created conversation {} for pair {}", id, pair);
    Ok((
        ConversationRow {
            id,
            participant_ids: vec![pair.low(), pair.high()],
            created_at: ts,
            updated_at: ts,
        },
        true,
    ))
}

/// Exact participant-set match: contains both users and has exactly two
/// participants, so a larger thread containing both never qualifies.
pub(crate) fn find_for_pair(
    conn: &Connection,
    pair: CanonicalPair,
) -> Result<Option<ConversationId>, StoreError> {
    let id = conn
        .query_row(
            "SELECT p.conversation_id
             FROM conversation_participants p
             WHERE p.conversation_id IN (
                 SELECT conversation_id FROM conversation_participants WHERE user_id = ?1
             )
             GROUP BY p.conversation_id
             HAVING COUNT(*) = 2
                AND SUM(p.user_id = ?1) = 1
                AND SUM(p.user_id = ?2) = 1
             ORDER BY p.conversation_id
             LIMIT 1",
            [pair.low(), pair.high()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn load_conversation(
    conn: &Connection,
    id: ConversationId,
) -> Result<Option<ConversationRow>, StoreError> {
    let head = conn
        .query_row(
            "SELECT created_at, updated_at FROM conversations WHERE id = ?1",
            [id],
            |row| Ok((ts_column(row, 0)?, ts_column(row, 1)?)),
        )
        .optional()?;

    let Some((created_at, updated_at)) = head else {
        return Ok(None);
    };

    Ok(Some(ConversationRow {
        id,
        participant_ids: query_participants(conn, id)?,
        created_at,
        updated_at,
    }))
}

pub(crate) fn participant_access(
    conn: &Connection,
    id: ConversationId,
    user_id: UserId,
) -> Result<ConversationRow, StoreError> {
    let conversation = load_conversation(conn, id)?.ok_or(StoreError::NotFound("conversation"))?;
    if !conversation.has_participant(user_id) {
        return Err(StoreError::Forbidden);
    }
    Ok(conversation)
}

fn query_participants(conn: &Connection, id: ConversationId) -> Result<Vec<UserId>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<Result<Vec<UserId>, _>>()?;
    Ok(ids)
}
