use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use ember_db::messages::MessagePage;
use ember_db::models::MessageRow;
use ember_gateway::chat::run_blocking;
use ember_types::api::{Claims, MessageResponse, SendMessageRequest};
use ember_types::models::{ConversationId, MessageId};

use crate::auth::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Cursor: id of the newest message from the previous page.
    pub after: Option<MessageId>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let db = state.db.clone();
    let requester = claims.sub;
    let page = MessagePage::new(query.after, query.limit);
    let rows = run_blocking(move || db.list_messages(conversation_id, requester, page)).await?;
    Ok(Json(rows.into_iter().map(response_from_row).collect()))
}

/// Goes through the same path as socket frames, so live connections see
/// REST-posted messages in order.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state
        .chat
        .post_message(conversation_id, claims.sub, req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(response_from_row(row))))
}

fn response_from_row(row: MessageRow) -> MessageResponse {
    MessageResponse {
        id: row.id,
        conversation_id: row.conversation_id,
        sender_id: row.sender_id,
        sender_username: row.sender_username,
        content: row.content,
        created_at: row.created_at,
    }
}
