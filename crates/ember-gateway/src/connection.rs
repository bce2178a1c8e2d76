use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use ember_db::StoreError;
use ember_types::api::Claims;
use ember_types::events::ClientFrame;
use ember_types::models::{ConversationId, UserId};

use crate::chat::ChatService;
use crate::dispatcher::{Frame, GroupGuard};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Lifecycle of one chat socket. A connection only ever moves forward;
/// any failure before `Open` goes straight to `Closed` and the WebSocket
/// upgrade is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authorized,
    Open,
    Closed,
}

/// Why a connection was refused before it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unauthenticated,
    MalformedConversationId,
    ConversationNotFound,
    NotAParticipant,
    Internal,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::MalformedConversationId => StatusCode::BAD_REQUEST,
            Self::ConversationNotFound => StatusCode::NOT_FOUND,
            Self::NotAParticipant => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::ConversationNotFound,
            StoreError::Forbidden => Self::NotAParticipant,
            StoreError::InvalidInput(_) => Self::MalformedConversationId,
            StoreError::Internal(_) => Self::Internal,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        self.status().into_response()
    }
}

/// What the transport pulls out of an upgrade request.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub token: Option<&'a str>,
    pub conversation_id: &'a str,
}

/// A connection whose identity is known but whose membership is not yet
/// checked.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub user_id: UserId,
    pub username: String,
    pub conversation_id: ConversationId,
}

/// A connection registered in its conversation's broadcast group.
pub struct OpenSession {
    user_id: UserId,
    username: String,
    conversation_id: ConversationId,
    guard: GroupGuard,
    frames: mpsc::UnboundedReceiver<Frame>,
}

pub fn verify_token(jwt_secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

pub fn parse_conversation_id(raw: &str) -> Option<ConversationId> {
    raw.parse::<ConversationId>().ok().filter(|id| *id > 0)
}

/// `Connecting -> Authorized`.
pub fn authenticate(req: ConnectRequest<'_>, jwt_secret: &str) -> Result<Authorized, Rejection> {
    let claims = req
        .token
        .and_then(|token| verify_token(jwt_secret, token))
        .ok_or_else(|| {
            warn!("Chat connection without valid credentials, closing");
            Rejection::Unauthenticated
        })?;

    let conversation_id = parse_conversation_id(req.conversation_id).ok_or_else(|| {
        warn!(
            "{} ({}) sent malformed conversation id '{}', closing",
            claims.username,
            claims.sub,
            req.conversation_id.chars().take(40).collect::<String>()
        );
        Rejection::MalformedConversationId
    })?;

    log_transition(claims.sub, conversation_id, ConnectionState::Connecting, ConnectionState::Authorized);
    Ok(Authorized {
        user_id: claims.sub,
        username: claims.username,
        conversation_id,
    })
}

impl Authorized {
    /// `Authorized -> Open`: confirm membership, join the group, then
    /// confirm again so an unmatch racing the join cannot leave a
    /// connection in a group that was already evicted.
    pub async fn admit(self, chat: &ChatService) -> Result<OpenSession, Rejection> {
        let joined = match chat.authorize(self.conversation_id, self.user_id).await {
            Ok(()) => chat.join_authorized(self.conversation_id, self.user_id).await,
            Err(e) => Err(e),
        };
        let (guard, frames) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                warn!(
                    "{} ({}) refused for conversation {}: {}",
                    self.username, self.user_id, self.conversation_id, e
                );
                log_transition(self.user_id, self.conversation_id, ConnectionState::Authorized, ConnectionState::Closed);
                return Err(e.into());
            }
        };

        log_transition(self.user_id, self.conversation_id, ConnectionState::Authorized, ConnectionState::Open);
        Ok(OpenSession {
            user_id: self.user_id,
            username: self.username,
            conversation_id: self.conversation_id,
            guard,
            frames,
        })
    }
}

impl OpenSession {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::Open
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Drive the socket until either side goes away. Group membership is
    /// released when this returns, on every path.
    pub async fn run(self, socket: WebSocket, chat: ChatService) -> ConnectionState {
        let OpenSession {
            user_id,
            username,
            conversation_id,
            guard,
            mut frames,
        } = self;

        info!(
            "{} ({}) connected to conversation {} [conn {}]",
            username,
            user_id,
            conversation_id,
            guard.conn_id()
        );

        let (mut sender, mut receiver) = socket.split();

        let pong_received = Arc::new(AtomicBool::new(true));
        let pong_flag_send = pong_received.clone();
        let pong_flag_recv = pong_received.clone();

        // Forward group frames -> client, with heartbeat
        let mut send_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut missed_heartbeats: u8 = 0;

            loop {
                tokio::select! {
                    frame = frames.recv() => {
                        let Some(frame) = frame else {
                            // Evicted from the group: the conversation is gone.
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        };
                        if sender.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if pong_flag_send.swap(false, Ordering::Acquire) {
                            missed_heartbeats = 0;
                        } else {
                            missed_heartbeats += 1;
                            if missed_heartbeats >= 2 {
                                warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                                break;
                            }
                        }
                        if sender.send(Message::Ping(Default::default())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Read frames from client
        let username_recv = username.clone();
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Text(text) => {
                        let Some(frame) = ClientFrame::parse(text.as_str()) else {
                            trace!(
                                "{} ({}) dropped invalid frame: {}",
                                username_recv,
                                user_id,
                                text.as_str().chars().take(200).collect::<String>()
                            );
                            continue;
                        };

                        // Detached so that tearing down this loop never
                        // interrupts a message between append and broadcast.
                        let chat = chat.clone();
                        let posted = tokio::spawn(async move {
                            chat.post_message(conversation_id, user_id, frame.message).await
                        })
                        .await;

                        match posted {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => debug!("{} ({}) frame dropped: {}", username_recv, user_id, e),
                            Err(e) => warn!("post_message task failed: {}", e),
                        }
                    }
                    Message::Pong(_) => {
                        pong_flag_recv.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        // Wait for either task to finish
        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        drop(guard);
        log_transition(user_id, conversation_id, ConnectionState::Open, ConnectionState::Closed);
        info!("{} ({}) disconnected from conversation {}", username, user_id, conversation_id);
        ConnectionState::Closed
    }
}

fn log_transition(user_id: UserId, conversation_id: ConversationId, from: ConnectionState, to: ConnectionState) {
    debug!(
        "user {} conversation {}: {:?} -> {:?}",
        user_id, conversation_id, from, to
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use ember_db::Database;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use crate::dispatcher::Dispatcher;
    use crate::notify::LogNotifier;

    const SECRET: &str = "test-secret";

    fn token(user_id: UserId, username: &str) -> String {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    #[test]
    fn missing_or_bad_token_is_unauthenticated() {
        let req = ConnectRequest {
            token: None,
            conversation_id: "1",
        };
        assert_eq!(authenticate(req, SECRET).unwrap_err(), Rejection::Unauthenticated);

        let forged = token(1, "alice");
        let req = ConnectRequest {
            token: Some(&forged),
            conversation_id: "1",
        };
        assert_eq!(authenticate(req, "other-secret").unwrap_err(), Rejection::Unauthenticated);
    }

    #[test]
    fn malformed_conversation_id_is_rejected() {
        let t = token(1, "alice");
        for raw in ["abc", "0", "-4", "", "1.5"] {
            let req = ConnectRequest {
                token: Some(&t),
                conversation_id: raw,
            };
            assert_eq!(
                authenticate(req, SECRET).unwrap_err(),
                Rejection::MalformedConversationId,
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn valid_request_is_authorized() {
        let t = token(42, "alice");
        let req = ConnectRequest {
            token: Some(&t),
            conversation_id: "7",
        };
        let authorized = authenticate(req, SECRET).unwrap();
        assert_eq!(authorized.user_id, 42);
        assert_eq!(authorized.username, "alice");
        assert_eq!(authorized.conversation_id, 7);
    }

    #[tokio::test]
    async fn admit_checks_membership_and_joins_group() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = db.create_user("alice", None, "hash").unwrap();
        let bob = db.create_user("bob", None, "hash").unwrap();
        let carol = db.create_user("carol", None, "hash").unwrap();
        let conversation_id = db.ensure_match(alice, bob).unwrap().record.conversation_id;
        let chat = ChatService::new(db, Dispatcher::new(), Arc::new(LogNotifier));

        let outsider = Authorized {
            user_id: carol,
            username: "carol".into(),
            conversation_id,
        };
        assert!(matches!(outsider.admit(&chat).await, Err(Rejection::NotAParticipant)));

        let missing = Authorized {
            user_id: alice,
            username: "alice".into(),
            conversation_id: conversation_id + 10,
        };
        assert!(matches!(missing.admit(&chat).await, Err(Rejection::ConversationNotFound)));
        assert_eq!(chat.dispatcher().group_size(conversation_id), 0);

        let member = Authorized {
            user_id: alice,
            username: "alice".into(),
            conversation_id,
        };
        let session = member.admit(&chat).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(chat.dispatcher().group_size(conversation_id), 1);

        // A session dropped before the socket ever ran still leaves the group.
        drop(session);
        assert_eq!(chat.dispatcher().group_size(conversation_id), 0);
    }

    #[tokio::test]
    async fn admit_after_unmatch_is_refused() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = db.create_user("alice", None, "hash").unwrap();
        let bob = db.create_user("bob", None, "hash").unwrap();
        let conversation_id = db.ensure_match(alice, bob).unwrap().record.conversation_id;
        let chat = ChatService::new(db, Dispatcher::new(), Arc::new(LogNotifier));

        chat.db().unmatch(alice, bob).unwrap();
        chat.close_conversation(conversation_id);

        let member = Authorized {
            user_id: alice,
            username: "alice".into(),
            conversation_id,
        };
        assert!(matches!(member.admit(&chat).await, Err(Rejection::ConversationNotFound)));
        assert_eq!(chat.dispatcher().group_size(conversation_id), 0);
    }

    #[test]
    fn rejection_status_codes() {
        assert_eq!(Rejection::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Rejection::NotAParticipant.status(), StatusCode::FORBIDDEN);
        assert_eq!(Rejection::ConversationNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(Rejection::MalformedConversationId.status(), StatusCode::BAD_REQUEST);
    }
}
