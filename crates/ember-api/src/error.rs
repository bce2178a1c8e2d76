use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use ember_db::StoreError;
use ember_types::api::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated", None),
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, "invalid_input", Some(detail.clone())),
            Self::Forbidden(detail) => (StatusCode::FORBIDDEN, "forbidden", Some(detail.clone())),
            Self::Conflict(detail) => (StatusCode::CONFLICT, "conflict", Some(detail.clone())),
            Self::Store(StoreError::InvalidInput(detail)) => {
                (StatusCode::BAD_REQUEST, "invalid_input", Some(detail.clone()))
            }
            Self::Store(err @ StoreError::Forbidden) => {
                (StatusCode::FORBIDDEN, "forbidden", Some(err.to_string()))
            }
            Self::Store(err @ StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found", Some(err.to_string()))
            }
            Self::Store(StoreError::Internal(_)) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Store(StoreError::Internal(e)) = &self {
            error!("Internal error: {:#}", e);
        }
        let (status, code, detail) = self.parts();
        (
            status,
            Json(ErrorBody {
                error: code.to_string(),
                detail,
            }),
        )
            .into_response()
    }
}
