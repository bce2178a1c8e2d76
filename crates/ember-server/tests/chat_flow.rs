use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ember_db::Database;
use ember_server::config::Config;
use ember_server::{build_state, router};
use ember_types::api::{
    ConversationSummary, ErrorBody, MatchSummary, MessageResponse, NotificationResponse, RegisterResponse,
    StartConversationResponse, SwipeResponse,
};
use ember_types::events::MessageEvent;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: String,
    http: reqwest::Client,
}

struct User {
    id: i64,
    token: String,
}

async fn spawn_server(allow_direct: bool) -> TestServer {
    let config = Config::from_lookup(|key| match key {
        "EMBER_JWT_SECRET" => Some("chat-flow-test-secret".to_string()),
        "EMBER_ALLOW_DIRECT_CONVERSATIONS" => Some(allow_direct.to_string()),
        _ => None,
    })
    .unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let app = router(build_state(&config, db));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn register(&self, username: &str) -> User {
        let resp = self
            .http
            .post(self.url("/auth/register"))
            .json(&json!({ "username": username, "password": "correct-horse" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: RegisterResponse = resp.json().await.unwrap();
        User {
            id: body.user_id,
            token: body.token,
        }
    }

    async fn swipe(&self, actor: &User, target: &User, action: &str) -> SwipeResponse {
        let resp = self
            .http
            .post(self.url("/swipes"))
            .bearer_auth(&actor.token)
            .json(&json!({ "target_user_id": target.id, "action": action }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        resp.json().await.unwrap()
    }

    /// Mutual like; returns the conversation id.
    async fn match_pair(&self, a: &User, b: &User) -> i64 {
        let first = self.swipe(a, b, "LIKE").await;
        assert!(!first.matched);
        let second = self.swipe(b, a, "like").await;
        assert!(second.matched);
        second.conversation_id.unwrap()
    }

    async fn connect(&self, user: &User, conversation_id: i64) -> Result<Socket, tungstenite::Error> {
        let url = format!(
            "ws://{}/ws/conversations/{}?token={}",
            self.addr, conversation_id, user.token
        );
        tokio_tungstenite::connect_async(url).await.map(|(socket, _)| socket)
    }

    async fn get_messages(&self, user: &User, conversation_id: i64) -> reqwest::Response {
        self.http
            .get(self.url(&format!("/conversations/{}/messages", conversation_id)))
            .bearer_auth(&user.token)
            .send()
            .await
            .unwrap()
    }
}

/// Next chat event on the socket, skipping heartbeats.
async fn next_event(socket: &mut Socket) -> MessageEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// True once the server closes the socket.
async fn wait_closed(socket: &mut Socket) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

fn rejected_with(result: Result<Socket, tungstenite::Error>) -> u16 {
    match result {
        Err(tungstenite::Error::Http(resp)) => resp.status().as_u16(),
        Err(e) => panic!("unexpected handshake error: {}", e),
        Ok(_) => panic!("handshake should have been refused"),
    }
}

#[tokio::test]
async fn health_is_public() {
    let server = spawn_server(false).await;
    let resp = server.http.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = server.http.get(server.url("/matches")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_and_login() {
    let server = spawn_server(false).await;
    server.register("alice").await;

    let dup = server
        .http
        .post(server.url("/auth/register"))
        .json(&json!({ "username": "alice", "password": "another-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), StatusCode::CONFLICT);

    let bad = server
        .http
        .post(server.url("/auth/login"))
        .json(&json!({ "username": "alice", "password": "wrong-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);

    let good = server
        .http
        .post(server.url("/auth/login"))
        .json(&json!({ "username": "alice", "password": "correct-horse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(good.status(), StatusCode::OK);
}

#[tokio::test]
async fn swipe_validation() {
    let server = spawn_server(false).await;
    let alice = server.register("alice").await;

    let resp = server
        .http
        .post(server.url("/swipes"))
        .bearer_auth(&alice.token)
        .json(&json!({ "target_user_id": alice.id, "action": "LIKE" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .http
        .post(server.url("/swipes"))
        .bearer_auth(&alice.token)
        .json(&json!({ "target_user_id": 9999, "action": "SUPERLIKE" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: ErrorBody = resp.json().await.unwrap();
    assert_eq!(body.error, "invalid_input");

    let resp = server
        .http
        .post(server.url("/swipes"))
        .bearer_auth(&alice.token)
        .json(&json!({ "target_user_id": 9999, "action": "LIKE" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mutual_like_opens_a_conversation() {
    let server = spawn_server(false).await;
    let alice = server.register("alice").await;
    let bob = server.register("bob").await;

    let conversation_id = server.match_pair(&alice, &bob).await;

    // Repeating the like does not create a second match.
    let again = server.swipe(&alice, &bob, "LIKE").await;
    assert!(again.matched);
    assert_eq!(again.conversation_id, Some(conversation_id));

    let matches: Vec<MatchSummary> = server
        .http
        .get(server.url("/matches"))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].other_user_id, bob.id);

    let conversations: Vec<ConversationSummary> = server
        .http
        .get(server.url("/conversations"))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].conversation_id, conversation_id);
    assert!(conversations[0].last_message_preview.is_none());
}

#[tokio::test]
async fn chat_reaches_both_participants() {
    let server = spawn_server(false).await;
    let alice = server.register("alice").await;
    let bob = server.register("bob").await;
    let conversation_id = server.match_pair(&alice, &bob).await;

    let mut alice_ws = server.connect(&alice, conversation_id).await.unwrap();
    let mut bob_ws = server.connect(&bob, conversation_id).await.unwrap();

    // Garbage and blank frames are dropped without closing the socket.
    alice_ws.send(Message::text("not json")).await.unwrap();
    alice_ws.send(Message::text(r#"{"message":"   "}"#)).await.unwrap();
    alice_ws.send(Message::text(r#"{"message":"hi bob"}"#)).await.unwrap();

    let seen_by_alice = next_event(&mut alice_ws).await;
    let seen_by_bob = next_event(&mut bob_ws).await;
    assert_eq!(seen_by_alice.message_id, seen_by_bob.message_id);
    assert_eq!(seen_by_bob.content, "hi bob");
    assert_eq!(seen_by_bob.sender_id, alice.id);
    assert_eq!(seen_by_bob.sender_name, "alice");

    // REST posts go out over the socket too.
    let resp = server
        .http
        .post(server.url(&format!("/conversations/{}/messages", conversation_id)))
        .bearer_auth(&bob.token)
        .json(&json!({ "content": "hey alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let posted: MessageResponse = resp.json().await.unwrap();
    assert_eq!(next_event(&mut alice_ws).await.message_id, posted.id);
    assert_eq!(next_event(&mut bob_ws).await.message_id, posted.id);

    let history: Vec<MessageResponse> = server
        .get_messages(&alice, conversation_id)
        .await
        .json()
        .await
        .unwrap();
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["hi bob", "hey alice"]);

    let page: Vec<MessageResponse> = server
        .http
        .get(server.url(&format!(
            "/conversations/{}/messages?after={}",
            conversation_id, history[0].id
        )))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content, "hey alice");

    // Notifications are written off the request path; give them a moment.
    let mut kinds = Vec::new();
    for _ in 0..50 {
        let notifications: Vec<NotificationResponse> = server
            .http
            .get(server.url("/notifications"))
            .bearer_auth(&bob.token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        kinds = notifications.into_iter().map(|n| n.kind).collect();
        if kinds.iter().any(|k| k == "new_message") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(kinds.iter().any(|k| k == "new_message"));
    assert!(kinds.iter().any(|k| k == "new_match"));
}

#[tokio::test]
async fn outsiders_are_refused() {
    let server = spawn_server(false).await;
    let alice = server.register("alice").await;
    let bob = server.register("bob").await;
    let carol = server.register("carol").await;
    let conversation_id = server.match_pair(&alice, &bob).await;

    assert_eq!(rejected_with(server.connect(&carol, conversation_id).await), 403);
    assert_eq!(rejected_with(server.connect(&carol, conversation_id + 100).await), 404);

    let anonymous = tokio_tungstenite::connect_async(format!(
        "ws://{}/ws/conversations/{}",
        server.addr, conversation_id
    ))
    .await
    .map(|(socket, _)| socket);
    assert_eq!(rejected_with(anonymous), 401);

    let forged = User {
        id: alice.id,
        token: "not-a-jwt".into(),
    };
    assert_eq!(rejected_with(server.connect(&forged, conversation_id).await), 401);

    let resp = server.get_messages(&carol, conversation_id).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = server.get_messages(&carol, conversation_id + 100).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unmatch_closes_the_conversation() {
    let server = spawn_server(false).await;
    let alice = server.register("alice").await;
    let bob = server.register("bob").await;
    let conversation_id = server.match_pair(&alice, &bob).await;

    let mut bob_ws = server.connect(&bob, conversation_id).await.unwrap();

    let resp = server
        .http
        .post(server.url(&format!("/matches/{}/unmatch", bob.id)))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert!(wait_closed(&mut bob_ws).await);
    let resp = server.get_messages(&alice, conversation_id).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(rejected_with(server.connect(&bob, conversation_id).await), 404);

    // Swipes were cleared, so the pair can match again.
    let rematch = server.match_pair(&alice, &bob).await;
    assert_ne!(rematch, conversation_id);
}

#[tokio::test]
async fn direct_conversations_follow_policy() {
    let closed = spawn_server(false).await;
    let alice = closed.register("alice").await;
    let bob = closed.register("bob").await;
    let resp = closed
        .http
        .post(closed.url(&format!("/conversations/with/{}", bob.id)))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let open = spawn_server(true).await;
    let alice = open.register("alice").await;
    let bob = open.register("bob").await;
    let resp = open
        .http
        .post(open.url(&format!("/conversations/with/{}", bob.id)))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let first: StartConversationResponse = resp.json().await.unwrap();
    assert!(first.created);

    let resp = open
        .http
        .post(open.url(&format!("/conversations/with/{}", alice.id)))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let second: StartConversationResponse = resp.json().await.unwrap();
    assert!(!second.created);
    assert_eq!(second.conversation_id, first.conversation_id);

    // A later match reuses the same conversation.
    assert_eq!(open.match_pair(&alice, &bob).await, first.conversation_id);
}
