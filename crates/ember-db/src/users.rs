use rusqlite::{Connection, OptionalExtension};

use ember_types::models::UserId;

use crate::error::{StoreError, is_unique_violation};
use crate::models::{UserRow, encode_ts, now, ts_column};
use crate::Database;

const USER_COLUMNS: &str = "id, username, display_name, password, created_at";

impl Database {
    /// Insert a user and return the assigned id. A taken username comes back
    /// as `InvalidInput`.
    pub fn create_user(
        &self,
        username: &str,
        display_name: Option<&str>,
        password_hash: &str,
    ) -> Result<UserId, StoreError> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, display_name, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![username, display_name, password_hash, encode_ts(now())],
            );
            match inserted {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::InvalidInput(format!(
                    "username '{}' is taken",
                    username
                ))),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
            Ok(conn.query_row(&sql, [username], user_from_row).optional()?)
        })
    }

    pub fn get_user_by_id(&self, id: UserId) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }
}

pub(crate) fn query_user_by_id(conn: &Connection, id: UserId) -> Result<Option<UserRow>, StoreError> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id], user_from_row).optional()?)
}

pub(crate) fn user_exists(conn: &Connection, id: UserId) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        password: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}
