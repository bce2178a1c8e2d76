pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ember_api::auth::{self, AppState, AppStateInner};
use ember_api::middleware::{bearer_token, require_auth};
use ember_api::{conversations, matches, messages, notifications, swipes};
use ember_db::Database;
use ember_gateway::chat::ChatService;
use ember_gateway::connection::{self, ConnectRequest};
use ember_gateway::dispatcher::Dispatcher;
use ember_gateway::notify::{Notifier, StoreNotifier};

use crate::config::Config;

/// Wire up shared state: one database, one connection registry, one chat
/// write path.
pub fn build_state(config: &Config, db: Arc<Database>) -> AppState {
    let notifier: Arc<dyn Notifier> = Arc::new(StoreNotifier::new(db.clone()));
    let chat = ChatService::new(db.clone(), Dispatcher::new(), notifier);
    Arc::new(AppStateInner {
        db,
        chat,
        jwt_secret: config.jwt_secret.clone(),
        allow_direct_conversations: config.allow_direct_conversations,
    })
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/swipes", post(swipes::record_swipe))
        .route("/matches", get(matches::list_matches))
        .route("/matches/{other_user_id}/unmatch", post(matches::unmatch))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route("/conversations/with/{user_id}", post(conversations::start_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/notifications", get(notifications::list_notifications))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/ws/conversations/{conversation_id}", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also arrive as `?token=`. Authentication and the membership check both
/// happen before the upgrade; a refused connection is never accepted.
async fn ws_upgrade(
    State(state): State<AppState>,
    Path(raw_conversation_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.token.as_deref().or_else(|| bearer_token(&headers));
    let request = ConnectRequest {
        token,
        conversation_id: &raw_conversation_id,
    };

    let authorized = match connection::authenticate(request, &state.jwt_secret) {
        Ok(authorized) => authorized,
        Err(rejection) => return rejection.into_response(),
    };
    let session = match authorized.admit(&state.chat).await {
        Ok(session) => session,
        Err(rejection) => return rejection.into_response(),
    };

    let chat = state.chat.clone();
    ws.on_upgrade(move |socket| async move {
        session.run(socket, chat).await;
    })
}
