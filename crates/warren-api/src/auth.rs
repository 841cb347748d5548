use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::WithRejection;
use chrono::{DateTime, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::info;
use uuid::Uuid;

use warren_db::Database;
use warren_db::models::ProfileRow;
use warren_gateway::router::ConversationRouter;
use warren_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub router: ConversationRouter,
}

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RegisterRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.trim().to_lowercase();

    // Validate input
    if username.len() < 3 || username.len() > 32 {
        return Err(ApiError::BadRequest("username must be 3-32 characters".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest("password must be at least 8 characters".into()));
    }

    // Check if username is taken
    if state.db.get_user_by_username(&username)?.is_some() {
        return Err(ApiError::Conflict("username taken".into()));
    }

    let password_hash = hash_password(&req.password)?;
    let user_id = Uuid::new_v4();

    state
        .db
        .create_user(&user_id.to_string(), &username, &password_hash, false)?;

    let token = create_token(&state.jwt_secret, user_id, &username)?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<LoginRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .get_user_by_username(&req.username)?
        .ok_or_else(|| ApiError::Unauthorized("invalid credentials".into()))?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| anyhow::anyhow!("Corrupt password hash for {}: {}", user.username, e))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized("invalid credentials".into()))?;

    // Moderation gate: a blocked account cannot obtain a token until the
    // block expires.
    if let Some(profile) = state.db.get_profile(&user.id)? {
        if block_active(&profile, Utc::now()) {
            return Err(ApiError::Forbidden("account blocked".into()));
        }
    }

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| anyhow::anyhow!("Corrupt user id '{}': {}", user.id, e))?;

    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

/// A block applies while its expiry is absent or in the future. An expiry
/// that fails to parse keeps the block in force.
pub fn block_active(profile: &ProfileRow, now: DateTime<Utc>) -> bool {
    if !profile.is_blocked {
        return false;
    }
    match profile.block_until.as_deref() {
        None => true,
        Some(until) => match DateTime::parse_from_rfc3339(until) {
            Ok(until) => until > now,
            Err(_) => true,
        },
    }
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Create the admin account on first startup if it does not exist yet.
/// Returns true when a fresh account was created.
pub fn ensure_admin(db: &Database, username: &str, password: &str) -> anyhow::Result<bool> {
    if db.get_user_by_username(username)?.is_some() {
        return Ok(false);
    }

    let user_id = Uuid::new_v4();
    let password_hash = hash_password(password)?;
    db.create_user(&user_id.to_string(), username, &password_hash, true)?;

    info!("Created admin account '{}'", username);
    Ok(true)
}
