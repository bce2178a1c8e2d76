//! Database row types. Distinct from the ember-types API shapes so the
//! storage schema can move independently of the wire format.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;

use ember_types::models::{ConversationId, MatchId, MessageId, SwipeAction, UserId};

pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

impl UserRow {
    pub fn name_for_display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone)]
pub struct SwipeRow {
    pub actor_id: UserId,
    pub target_id: UserId,
    pub action: SwipeAction,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MatchRow {
    pub id: MatchId,
    pub user_low: UserId,
    pub user_high: UserId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
}

impl MatchRow {
    pub fn other_user(&self, user: UserId) -> UserId {
        if user == self.user_low { self.user_high } else { self.user_low }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: ConversationId,
    /// Always two ids, ascending.
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participant_ids.contains(&user)
    }
}

#[derive(Debug, Clone)]
pub struct ConversationSummaryRow {
    pub conversation: ConversationRow,
    pub last_message: Option<MessageRow>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub sender_display_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn sender_name(&self) -> &str {
        self.sender_display_name.as_deref().unwrap_or(&self.sender_username)
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// -- Timestamps --

/// Fixed-width RFC 3339 with microseconds, so text order is time order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn swipe_action_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<SwipeAction> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Current time truncated to the stored precision, so a value handed back to
/// callers compares equal to the value read back later.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    let micros = now.timestamp_micros();
    DateTime::from_timestamp_micros(micros).unwrap_or(now)
}
