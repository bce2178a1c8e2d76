use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use ember_types::models::{CanonicalPair, ConversationId, MatchId, UserId};

use crate::conversations::{canonical, get_or_create_in};
use crate::error::{StoreError, is_unique_violation};
use crate::models::{MatchRow, encode_ts, now, ts_column};
use crate::Database;

const MATCH_COLUMNS: &str = "id, user_low, user_high, conversation_id, created_at";

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub record: MatchRow,
    /// `false` when the pair had already matched.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchOutcome {
    pub match_id: MatchId,
    pub conversation_id: ConversationId,
    pub messages_deleted: usize,
    pub swipes_deleted: usize,
}

impl Database {
    /// Idempotent: returns the existing match for the pair, or creates the
    /// match together with its conversation in one transaction.
    pub fn ensure_match(&self, user_a: UserId, user_b: UserId) -> Result<MatchOutcome, StoreError> {
        let pair = canonical(user_a, user_b)?;
        self.with_tx(|tx| ensure_match_in(tx, pair))
    }

    pub fn find_match(&self, user_a: UserId, user_b: UserId) -> Result<Option<MatchRow>, StoreError> {
        let pair = canonical(user_a, user_b)?;
        self.with_conn(|conn| query_match(conn, pair))
    }

    /// Newest first.
    pub fn list_matches_for_user(&self, user_id: UserId) -> Result<Vec<MatchRow>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM matches WHERE user_low = ?1 OR user_high = ?1 ORDER BY created_at DESC, id DESC",
                MATCH_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], match_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Remove the match between `user_id` and `other_id` along with its
    /// conversation and every message in it. Swipe history for the pair is
    /// purged too, so the two users can match again later.
    pub fn unmatch(&self, user_id: UserId, other_id: UserId) -> Result<UnmatchOutcome, StoreError> {
        let pair = canonical(user_id, other_id)?;
        self.with_tx(|tx| {
            let record = query_match(tx, pair)?.ok_or(StoreError::NotFound("match"))?;

            tx.execute("DELETE FROM matches WHERE id = ?1", [record.id])?;
            let messages_deleted = tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [record.conversation_id],
            )?;
            tx.execute(
                "DELETE FROM conversation_participants WHERE conversation_id = ?1",
                [record.conversation_id],
            )?;
            tx.execute("DELETE FROM conversations WHERE id = ?1", [record.conversation_id])?;
            let swipes_deleted = tx.execute(
                "DELETE FROM swipes
                 WHERE (actor_id = ?1 AND target_id = ?2) OR (actor_id = ?2 AND target_id = ?1)",
                [pair.low(), pair.high()],
            )?;

            info!(
                "Unmatched {} (match {}, conversation {}, {} messages)",
                pair, record.id, record.conversation_id, messages_deleted
            );
            Ok(UnmatchOutcome {
                match_id: record.id,
                conversation_id: record.conversation_id,
                messages_deleted,
                swipes_deleted,
            })
        })
    }
}

/// Caller must hold a write transaction.
pub(crate) fn ensure_match_in(conn: &Connection, pair: CanonicalPair) -> Result<MatchOutcome, StoreError> {
    if let Some(existing) = query_match(conn, pair)? {
        return Ok(MatchOutcome {
            record: existing,
            created: false,
        });
    }

    let (conversation, _) = get_or_create_in(conn, pair)?;
    insert_match(conn, pair, conversation.id)
}

/// A unique violation here means another writer matched the pair first;
/// the existing row is returned instead of an error.
fn insert_match(
    conn: &Connection,
    pair: CanonicalPair,
    conversation_id: ConversationId,
) -> Result<MatchOutcome, StoreError> {
    let created_at = now();
    let inserted = conn.execute(
        "INSERT INTO matches (user_low, user_high, conversation_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![pair.low(), pair.high(), conversation_id, encode_ts(created_at)],
    );

    match inserted {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            info!("New match {} for {} (conversation {})", id, pair, conversation_id);
            Ok(MatchOutcome {
                record: MatchRow {
                    id,
                    user_low: pair.low(),
                    user_high: pair.high(),
                    conversation_id,
                    created_at,
                },
                created: true,
            })
        }
        Err(e) if is_unique_violation(&e) => {
            debug!("Match for {} already exists, re-reading", pair);
            let existing = query_match(conn, pair)?.ok_or(StoreError::NotFound("match"))?;
            Ok(MatchOutcome {
                record: existing,
                created: false,
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn query_match(conn: &Connection, pair: CanonicalPair) -> Result<Option<MatchRow>, StoreError> {
    let sql = format!(
        "SELECT {} FROM matches WHERE user_low = ?1 AND user_high = ?2",
        MATCH_COLUMNS
    );
    Ok(conn
        .query_row(&sql, [pair.low(), pair.high()], match_from_row)
        .optional()?)
}

fn match_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchRow> {
    Ok(MatchRow {
        id: row.get(0)?,
        user_low: row.get(1)?,
        user_high: row.get(2)?,
        conversation_id: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::messages::MessagePage;
    use crate::testutil;

    fn count(db: &Database, table: &str) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn ensure_match_is_idempotent() {
        let db = testutil::db();
        let a = testutil::user(&db, "alice");
        let b = testutil::user(&db, "bob");

        let first = db.ensure_match(b, a).unwrap();
        assert!(first.created);
        assert_eq!(first.record.user_low, a);
        assert_eq!(first.record.user_high, b);

        let second = db.ensure_match(a, b).unwrap();
        assert!(!second.created);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.conversation_id, first.record.conversation_id);
        assert_eq!(count(&db, "matches"), 1);
        assert_eq!(count(&db, "conversations"), 1);
    }

    #[test]
    fn concurrent_ensure_match_creates_once() {
        let db = Arc::new(testutil::db());
        let a = testutil::user(&db, "alice");
        let b = testutil::user(&db, "bob");

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let db = db.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if i % 2 == 0 {
                        db.ensure_match(a, b).unwrap()
                    } else {
                        db.ensure_match(b, a).unwrap()
                    }
                })
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
        let id = outcomes[0].record.id;
        assert!(outcomes.iter().all(|o| o.record.id == id));
        assert_eq!(count(&db, "matches"), 1);
        assert_eq!(count(&db, "conversations"), 1);
    }

    #[test]
    fn losing_insert_falls_back_to_existing_row() {
        let db = testutil::db();
        let a = testutil::user(&db, "alice");
        let b = testutil::user(&db, "bob");
        let winner = db.ensure_match(a, b).unwrap();

        // Replay the insert step of a writer that checked before the winner committed.
        let pair = CanonicalPair::new(a, b).unwrap();
        let loser = db
            .with_tx(|tx| insert_match(tx, pair, winner.record.conversation_id))
            .unwrap();
        assert!(!loser.created);
        assert_eq!(loser.record.id, winner.record.id);
        assert_eq!(count(&db, "matches"), 1);
    }

    #[test]
    fn match_reuses_direct_conversation() {
        let db = testutil::db();
        let a = testutil::user(&db, "alice");
        let b = testutil::user(&db, "bob");
        let (direct, _) = db.open_direct_conversation(a, b).unwrap();

        let outcome = db.ensure_match(a, b).unwrap();
        assert_eq!(outcome.record.conversation_id, direct.id);
        assert_eq!(count(&db, "conversations"), 1);
    }

    #[test]
    fn unmatch_cascades() {
        let db = testutil::db();
        let a = testutil::user(&db, "alice");
        let b = testutil::user(&db, "bob");
        db.record_swipe(a, b, ember_types::models::SwipeAction::Like).unwrap();
        let matched = db
            .record_swipe(b, a, ember_types::models::SwipeAction::Like)
            .unwrap()
            .matched
            .unwrap();
        let conversation_id = matched.record.conversation_id;
        for text in ["one", "two", "three"] {
            db.append_message(conversation_id, a, text).unwrap();
        }

        let outcome = db.unmatch(b, a).unwrap();
        assert_eq!(outcome.match_id, matched.record.id);
        assert_eq!(outcome.conversation_id, conversation_id);
        assert_eq!(outcome.messages_deleted, 3);
        assert_eq!(outcome.swipes_deleted, 2);

        assert_eq!(count(&db, "matches"), 0);
        assert_eq!(count(&db, "conversations"), 0);
        assert_eq!(count(&db, "messages"), 0);
        assert_eq!(count(&db, "conversation_participants"), 0);
        assert!(matches!(
            db.list_messages(conversation_id, a, MessagePage::default()),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(db.unmatch(a, b), Err(StoreError::NotFound("match"))));
    }

    #[test]
    fn list_matches_covers_both_sides() {
        let db = testutil::db();
        let a = testutil::user(&db, "alice");
        let b = testutil::user(&db, "bob");
        let c = testutil::user(&db, "carol");
        db.ensure_match(a, b).unwrap();
        db.ensure_match(c, b).unwrap();

        let for_b = db.list_matches_for_user(b).unwrap();
        assert_eq!(for_b.len(), 2);
        let others: Vec<_> = for_b.iter().map(|m| m.other_user(b)).collect();
        assert!(others.contains(&a) && others.contains(&c));
        assert_eq!(db.list_matches_for_user(a).unwrap().len(), 1);
    }
}
