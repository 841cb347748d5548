use axum::{
    extract::Request,
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use warren_types::api::Claims;

use crate::error::ApiError;

pub fn jwt_secret() -> String {
    std::env::var("WARREN_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into())
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized("invalid token".into()))
}

/// Extract and validate JWT from Authorization header.
pub async fn require_auth(mut req: Request, next: Next) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

    let claims = decode_token(&jwt_secret(), token)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
