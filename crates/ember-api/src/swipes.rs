use axum::{Extension, Json, extract::State};
use tracing::info;

use ember_gateway::chat::run_blocking;
use ember_types::api::{Claims, SwipeRequest, SwipeResponse};
use ember_types::models::SwipeAction;

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn record_swipe(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SwipeRequest>,
) -> Result<Json<SwipeResponse>, ApiError> {
    let action: SwipeAction = req
        .action
        .parse()
        .map_err(|e: ember_types::models::UnknownSwipeAction| ApiError::BadRequest(e.to_string()))?;

    let db = state.db.clone();
    let actor_id = claims.sub;
    let target_id = req.target_user_id;
    let outcome = run_blocking(move || db.record_swipe(actor_id, target_id, action)).await?;

    if let Some(matched) = &outcome.matched {
        if matched.created {
            info!(
                "{} ({}) matched with {} (conversation {})",
                claims.username, actor_id, target_id, matched.record.conversation_id
            );
            state.chat.announce_match(&matched.record);
        }
    }

    Ok(Json(SwipeResponse {
        action: outcome.swipe.action,
        matched: outcome.matched.is_some(),
        match_id: outcome.matched.as_ref().map(|m| m.record.id),
        conversation_id: outcome.matched.as_ref().map(|m| m.record.conversation_id),
    }))
}
