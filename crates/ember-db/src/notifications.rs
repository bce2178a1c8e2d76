use ember_types::models::UserId;

use crate::error::StoreError;
use crate::models::{NotificationRow, encode_ts, now, ts_column};
use crate::Database;

impl Database {
    pub fn insert_notification(
        &self,
        user_id: UserId,
        kind: &str,
        title: &str,
        body: &str,
        link: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (user_id, kind, title, body, link, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![user_id, kind, title, body, link, encode_ts(now())],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Newest first.
    pub fn list_notifications(&self, user_id: UserId, limit: u32) -> Result<Vec<NotificationRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, title, body, link, is_read, created_at
                 FROM notifications
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], |row| {
                    Ok(NotificationRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        kind: row.get(2)?,
                        title: row.get(3)?,
                        body: row.get(4)?,
                        link: row.get(5)?,
                        is_read: row.get(6)?,
                        created_at: ts_column(row, 7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
