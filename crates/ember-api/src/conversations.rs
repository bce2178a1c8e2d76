use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use ember_db::models::ConversationSummaryRow;
use ember_gateway::chat::run_blocking;
use ember_types::api::{Claims, ConversationSummary, MessagePreview, StartConversationResponse};
use ember_types::models::{ConversationId, UserId};

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let rows = run_blocking(move || db.list_conversations_for_user(user_id)).await?;
    Ok(Json(rows.into_iter().map(summary_from_row).collect()))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ConversationSummary>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let row = run_blocking(move || db.get_for_participant(conversation_id, user_id)).await?;
    Ok(Json(summary_from_row(row)))
}

/// Open a conversation without a match. Off unless the server is configured
/// to allow it.
pub async fn start_conversation(
    State(state): State<AppState>,
    Path(other_user_id): Path<UserId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.allow_direct_conversations {
        return Err(ApiError::Forbidden(
            "conversations can only be started by a mutual like".into(),
        ));
    }

    let db = state.db.clone();
    let user_id = claims.sub;
    let (conversation, created) =
        run_blocking(move || db.open_direct_conversation(user_id, other_user_id)).await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(StartConversationResponse {
            conversation_id: conversation.id,
            created,
        }),
    ))
}

fn summary_from_row(row: ConversationSummaryRow) -> ConversationSummary {
    ConversationSummary {
        conversation_id: row.conversation.id,
        participant_ids: row.conversation.participant_ids,
        updated_at: row.conversation.updated_at,
        last_message_preview: row.last_message.map(|m| MessagePreview {
            message_id: m.id,
            sender_id: m.sender_id,
            content: m.content,
            created_at: m.created_at,
        }),
    }
}
