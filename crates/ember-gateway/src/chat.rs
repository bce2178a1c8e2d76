use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use ember_db::models::{MatchRow, MessageRow};
use ember_db::{Database, StoreError};
use ember_types::events::MessageEvent;
use ember_types::models::{ConversationId, UserId};

use crate::dispatcher::{Dispatcher, Frame, GroupGuard};
use crate::notify::{Notification, Notifier, emit_detached};

/// The one write path for chat messages, shared by the socket loop and the
/// REST handler so both observe the same ordering.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
}

impl ChatService {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            db,
            dispatcher,
            notifier,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Membership check against the store. `NotFound` when the conversation
    /// is gone, `Forbidden` when the user is not in it.
    pub async fn authorize(&self, conversation_id: ConversationId, user_id: UserId) -> Result<(), StoreError> {
        let db = self.db.clone();
        run_blocking(move || {
            let conversation = db
                .get_conversation(conversation_id)?
                .ok_or(StoreError::NotFound("conversation"))?;
            if conversation.has_participant(user_id) {
                Ok(())
            } else {
                Err(StoreError::Forbidden)
            }
        })
        .await
    }

    /// Join the conversation's broadcast group, then confirm membership.
    /// An unmatch committed before the join fails the check; one committed
    /// after it evicts this connection. The guard is dropped on failure.
    pub async fn join_authorized(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(GroupGuard, mpsc::UnboundedReceiver<Frame>), StoreError> {
        let (guard, frames) = self.dispatcher.join(conversation_id, user_id);
        self.authorize(conversation_id, user_id).await?;
        Ok((guard, frames))
    }

    /// Persist, then broadcast, then notify the other participant.
    ///
    /// The conversation lock is held from before the append until the
    /// broadcast is queued, so persisted order, `created_at` order and
    /// delivery order agree.
    pub async fn post_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: String,
    ) -> Result<MessageRow, StoreError> {
        let lock = self.dispatcher.conversation_lock(conversation_id);
        let guard = lock.lock().await;

        let db = self.db.clone();
        let (message, participants) = run_blocking(move || {
            let message = db.append_message(conversation_id, sender_id, &content)?;
            let participants = db
                .get_conversation(conversation_id)?
                .map(|c| c.participant_ids)
                .unwrap_or_default();
            Ok((message, participants))
        })
        .await?;

        let delivered = self.dispatcher.broadcast(conversation_id, &message_event(&message));
        drop(guard);

        debug!(
            "Message {} in conversation {} delivered to {} connections",
            message.id, conversation_id, delivered
        );

        let notifications = participants
            .into_iter()
            .filter(|&user| user != sender_id)
            .map(|user| {
                Notification::new_message(user, message.sender_name(), conversation_id, &message.content)
            })
            .collect();
        emit_detached(self.notifier.clone(), notifications);

        Ok(message)
    }

    /// Tell both users about a freshly created match. Runs detached.
    pub fn announce_match(&self, record: &MatchRow) {
        let db = self.db.clone();
        let notifier = self.notifier.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let name = |id: UserId| -> String {
                match db.get_user_by_id(id) {
                    Ok(Some(user)) => user.name_for_display().to_string(),
                    _ => "someone".to_string(),
                }
            };
            let notifications = vec![
                Notification::new_match(record.user_low, &name(record.user_high), record.conversation_id),
                Notification::new_match(record.user_high, &name(record.user_low), record.conversation_id),
            ];
            emit_detached(notifier, notifications);
        });
    }

    /// Disconnect every live socket of a conversation that no longer exists.
    pub fn close_conversation(&self, conversation_id: ConversationId) -> usize {
        self.dispatcher.evict(conversation_id)
    }
}

pub fn message_event(message: &MessageRow) -> MessageEvent {
    MessageEvent {
        message_id: message.id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        sender_username: message.sender_username.clone(),
        sender_name: message.sender_name().to_string(),
        content: message.content.clone(),
        timestamp: message.created_at,
    }
}

/// Run blocking database work off the async runtime.
pub async fn run_blocking<F, T>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StoreError::Internal(anyhow::anyhow!("blocking task failed: {}", e))
    })?
}
