use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::info;

use ember_gateway::chat::run_blocking;
use ember_types::api::{Claims, MatchSummary, UnmatchResponse};
use ember_types::models::UserId;

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn list_matches(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MatchSummary>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let rows = run_blocking(move || db.list_matches_for_user(user_id)).await?;

    let matches = rows
        .into_iter()
        .map(|row| MatchSummary {
            match_id: row.id,
            other_user_id: row.other_user(user_id),
            conversation_id: row.conversation_id,
            created_at: row.created_at,
        })
        .collect();

    Ok(Json(matches))
}

/// Deletes the match, its conversation and all messages, then closes any
/// sockets still open on that conversation.
pub async fn unmatch(
    State(state): State<AppState>,
    Path(other_user_id): Path<UserId>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UnmatchResponse>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let outcome = run_blocking(move || db.unmatch(user_id, other_user_id)).await?;

    let evicted = state.chat.close_conversation(outcome.conversation_id);
    info!(
        "{} ({}) unmatched {}; closed {} live connections",
        claims.username, user_id, other_user_id, evicted
    );

    Ok(Json(UnmatchResponse {
        match_id: outcome.match_id,
        conversation_id: outcome.conversation_id,
        messages_deleted: outcome.messages_deleted,
    }))
}
