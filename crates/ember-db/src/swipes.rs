use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use ember_types::models::{CanonicalPair, SwipeAction, UserId};

use crate::error::StoreError;
use crate::matches::{MatchOutcome, ensure_match_in};
use crate::models::{SwipeRow, encode_ts, now, swipe_action_column, ts_column};
use crate::users::user_exists;
use crate::Database;

#[derive(Debug, Clone)]
pub struct SwipeOutcome {
    pub swipe: SwipeRow,
    /// Set when this swipe completed a mutual like.
    pub matched: Option<MatchOutcome>,
}

impl Database {
    /// Upsert the actor's swipe on the target. A LIKE that meets an existing
    /// LIKE in the other direction creates (or returns) the pair's match in
    /// the same transaction.
    pub fn record_swipe(
        &self,
        actor_id: UserId,
        target_id: UserId,
        action: SwipeAction,
    ) -> Result<SwipeOutcome, StoreError> {
        let Some(pair) = CanonicalPair::new(actor_id, target_id) else {
            return Err(StoreError::InvalidInput("cannot swipe on self".into()));
        };

        self.with_tx(|tx| {
            if !user_exists(tx, target_id)? || !user_exists(tx, actor_id)? {
                return Err(StoreError::NotFound("user"));
            }

            let timestamp = now();
            tx.execute(
                "INSERT INTO swipes (actor_id, target_id, action, timestamp) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (actor_id, target_id)
                 DO UPDATE SET action = excluded.action, timestamp = excluded.timestamp",
                rusqlite::params![actor_id, target_id, action.as_str(), encode_ts(timestamp)],
            )?;

            let matched = if action == SwipeAction::Like && likes(tx, target_id, actor_id)? {
                debug!("Mutual like between {} and {}", actor_id, target_id);
                Some(ensure_match_in(tx, pair)?)
            } else {
                None
            };

            Ok(SwipeOutcome {
                swipe: SwipeRow {
                    actor_id,
                    target_id,
                    action,
                    timestamp,
                },
                matched,
            })
        })
    }

    pub fn get_swipe(&self, actor_id: UserId, target_id: UserId) -> Result<Option<SwipeRow>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT actor_id, target_id, action, timestamp FROM swipes
                     WHERE actor_id = ?1 AND target_id = ?2",
                    [actor_id, target_id],
                    |row| {
                        Ok(SwipeRow {
                            actor_id: row.get(0)?,
                            target_id: row.get(1)?,
                            action: swipe_action_column(row, 2)?,
                            timestamp: ts_column(row, 3)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

fn likes(conn: &Connection, actor_id: UserId, target_id: UserId) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM swipes WHERE actor_id = ?1 AND target_id = ?2 AND action = 'LIKE'",
            [actor_id, target_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
