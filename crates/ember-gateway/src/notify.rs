use std::sync::Arc;

use tracing::{info, warn};

use ember_db::Database;
use ember_types::models::{ConversationId, UserId};

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    NewMatch,
    NewMessage,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMatch => "new_match",
            Self::NewMessage => "new_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
}

impl Notification {
    pub fn new_message(
        recipient: UserId,
        sender_name: &str,
        conversation_id: ConversationId,
        content: &str,
    ) -> Self {
        Self {
            user_id: recipient,
            kind: NotificationKind::NewMessage,
            title: format!("New message from {}", sender_name),
            body: preview(content),
            link: Some(chat_link(conversation_id)),
        }
    }

    pub fn new_match(recipient: UserId, other_name: &str, conversation_id: ConversationId) -> Self {
        Self {
            user_id: recipient,
            kind: NotificationKind::NewMatch,
            title: "It's a match!".to_string(),
            body: format!("You and {} liked each other", other_name),
            link: Some(chat_link(conversation_id)),
        }
    }
}

/// Outbound alerts. Delivery is someone else's problem; implementations only
/// hand the notification over. An `Err` is logged and otherwise ignored.
pub trait Notifier: Send + Sync {
    fn emit(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Persists notifications so clients can list them.
pub struct StoreNotifier {
    db: Arc<Database>,
}

impl StoreNotifier {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl Notifier for StoreNotifier {
    fn emit(&self, n: &Notification) -> anyhow::Result<()> {
        self.db.insert_notification(
            n.user_id,
            n.kind.as_str(),
            &n.title,
            &n.body,
            n.link.as_deref(),
        )?;
        Ok(())
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn emit(&self, n: &Notification) -> anyhow::Result<()> {
        info!("notify user {} [{}]: {}", n.user_id, n.kind.as_str(), n.title);
        Ok(())
    }
}

/// Fire-and-forget on the blocking pool; the caller never waits on it.
pub fn emit_detached(notifier: Arc<dyn Notifier>, notifications: Vec<Notification>) {
    if notifications.is_empty() {
        return;
    }
    tokio::task::spawn_blocking(move || {
        for n in &notifications {
            if let Err(e) = notifier.emit(n) {
                warn!("Notification to user {} failed: {:#}", n.user_id, e);
            }
        }
    });
}

fn chat_link(conversation_id: ConversationId) -> String {
    format!("/chat/{}/", conversation_id)
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
