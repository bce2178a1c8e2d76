use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info};

use ember_db::Database;
use ember_gateway::chat::{ChatService, run_blocking};
use ember_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use ember_types::models::UserId;

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub chat: ChatService,
    pub jwt_secret: String,
    /// Allow opening a conversation without a prior mutual like.
    pub allow_direct_conversations: bool,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_string();
    if username.len() < 3 || username.len() > 32 {
        return Err(ApiError::BadRequest("username must be 3-32 characters".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest("password must be at least 8 characters".into()));
    }
    let display_name = req
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    // Check if username is taken
    let db = state.db.clone();
    let lookup = username.clone();
    if run_blocking(move || db.get_user_by_username(&lookup)).await?.is_some() {
        return Err(ApiError::Conflict(format!("username '{}' is taken", username)));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| {
            error!("Password hashing failed: {}", e);
            ApiError::Store(ember_db::StoreError::Internal(anyhow::anyhow!("password hashing failed")))
        })?
        .to_string();

    let db = state.db.clone();
    let name = username.clone();
    let user_id = run_blocking(move || db.create_user(&name, display_name.as_deref(), &password_hash))
        .await
        .map_err(taken_as_conflict)?;

    let token = create_token(&state.jwt_secret, user_id, &username)?;
    info!("Registered user {} ({})", username, user_id);

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = run_blocking(move || db.get_user_by_username(&username))
        .await?
        .ok_or(ApiError::Unauthenticated)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password).map_err(|e| {
        error!("Stored password hash for user {} is unreadable: {}", user.id, e);
        ApiError::Unauthenticated
    })?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthenticated)?;

    let token = create_token(&state.jwt_secret, user.id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id: user.id,
        username: user.username,
        token,
    }))
}

/// The only `InvalidInput` from `create_user` is a taken username, which
/// can still happen if another registration wins between check and insert.
fn taken_as_conflict(err: ember_db::StoreError) -> ApiError {
    match err {
        ember_db::StoreError::InvalidInput(detail) => ApiError::Conflict(detail),
        other => ApiError::Store(other),
    }
}

pub fn create_token(secret: &str, user_id: UserId, username: &str) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Store(ember_db::StoreError::Internal(e.into())))
}
