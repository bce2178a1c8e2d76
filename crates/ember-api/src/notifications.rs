use axum::{
    Extension, Json,
    extract::{Query, State},
};
use serde::Deserialize;

use ember_gateway::chat::run_blocking;
use ember_types::api::{Claims, NotificationResponse};

use crate::auth::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<NotificationResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let limit = query.limit.clamp(1, 200);
    let rows = run_blocking(move || db.list_notifications(user_id, limit)).await?;

    Ok(Json(
        rows.into_iter()
            .map(|row| NotificationResponse {
                id: row.id,
                kind: row.kind,
                title: row.title,
                body: row.body,
                link: row.link,
                is_read: row.is_read,
                created_at: row.created_at,
            })
            .collect(),
    ))
}
