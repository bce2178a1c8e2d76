use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, error};
use uuid::Uuid;

use ember_types::events::MessageEvent;
use ember_types::models::{ConversationId, UserId};

/// A pre-serialized outbound text frame, shared by every receiver.
pub type Frame = Utf8Bytes;

/// Process-wide registry of live chat connections, grouped by conversation.
///
/// Lifecycle: a connection is added by [`Dispatcher::join`] once it has been
/// authorized for the conversation, and removed when the returned
/// [`GroupGuard`] is dropped, whichever way the connection ends. The registry
/// never caches membership; authorization always goes to the database.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// conversation_id -> (conn_id -> member)
    groups: RwLock<HashMap<ConversationId, HashMap<Uuid, Member>>>,

    /// Per-conversation write locks. Held weakly so idle conversations do
    /// not accumulate entries.
    write_locks: Mutex<HashMap<ConversationId, Weak<AsyncMutex<()>>>>,
}

struct Member {
    user_id: UserId,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Removes its connection from the broadcast group on drop.
pub struct GroupGuard {
    dispatcher: Dispatcher,
    conversation_id: ConversationId,
    conn_id: Uuid,
}

impl GroupGuard {
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.dispatcher.leave(self.conversation_id, self.conn_id);
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection in the conversation's group. Frames broadcast to
    /// the conversation arrive on the returned receiver until the guard is
    /// dropped or the conversation is evicted.
    pub fn join(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> (GroupGuard, mpsc::UnboundedReceiver<Frame>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id)
            .or_default()
            .insert(conn_id, Member { user_id, tx });

        debug!("Connection {} (user {}) joined conversation {}", conn_id, user_id, conversation_id);
        let guard = GroupGuard {
            dispatcher: self.clone(),
            conversation_id,
            conn_id,
        };
        (guard, rx)
    }

    /// Removing a connection that is not registered is a no-op.
    fn leave(&self, conversation_id: ConversationId, conn_id: Uuid) {
        let mut groups = self.inner.groups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(members) = groups.get_mut(&conversation_id) {
            if members.remove(&conn_id).is_some() {
                debug!("Connection {} left conversation {}", conn_id, conversation_id);
            }
            if members.is_empty() {
                groups.remove(&conversation_id);
            }
        }
    }

    /// Send `event` to every connection in the conversation, the sender's own
    /// included. Returns how many connections it was queued for.
    pub fn broadcast(&self, conversation_id: ConversationId, event: &MessageEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize message event {}: {}", event.message_id, e);
                return 0;
            }
        };
        self.broadcast_frame(conversation_id, Frame::from(json))
    }

    fn broadcast_frame(&self, conversation_id: ConversationId, frame: Frame) -> usize {
        let groups = self.inner.groups.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = groups.get(&conversation_id) else {
            return 0;
        };

        members
            .values()
            .filter(|member| member.tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Drop every connection of a conversation, e.g. after an unmatch. Their
    /// receivers close, which ends the socket loops. Returns how many
    /// connections were evicted.
    pub fn evict(&self, conversation_id: ConversationId) -> usize {
        let removed = self
            .inner
            .groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conversation_id);

        let count = removed.map_or(0, |members| members.len());
        if count > 0 {
            debug!("Evicted {} connections from conversation {}", count, conversation_id);
        }
        count
    }

    pub fn group_size(&self, conversation_id: ConversationId) -> usize {
        self.inner
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation_id)
            .map_or(0, HashMap::len)
    }

    /// Users with at least one live connection in the conversation.
    pub fn connected_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let groups = self.inner.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut users: Vec<UserId> = groups
            .get(&conversation_id)
            .map(|members| members.values().map(|m| m.user_id).collect())
            .unwrap_or_default();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// The lock that serializes append + broadcast for one conversation.
    pub fn conversation_lock(&self, conversation_id: ConversationId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.write_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(&conversation_id).and_then(Weak::upgrade) {
            return lock;
        }

        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(conversation_id, Arc::downgrade(&lock));
        lock
    }
}
