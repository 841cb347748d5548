use axum::{
    Extension, Json,
    extract::{Path, State},
};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use tracing::info;

use warren_types::api::{BlockUserRequest, Claims};

use crate::auth::AppState;
use crate::error::ApiError;

/// Block a user, permanently or for `days`. Admin only.
pub async fn block_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<BlockUserRequest>, ApiError>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &claims)?;

    let target = state
        .db
        .get_user_by_username(&username)?
        .ok_or_else(|| ApiError::NotFound("not found".into()))?;

    let reason = req.reason.unwrap_or_else(|| "Blocked by admin".into());
    let until = req
        .days
        .map(|days| (Utc::now() + chrono::Duration::days(i64::from(days))).to_rfc3339());

    state.db.set_block(&target.id, true, &reason, until.as_deref())?;

    info!(
        "{} blocked {} ({})",
        claims.username,
        username,
        until.as_deref().unwrap_or("permanent")
    );
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn unblock_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &claims)?;

    let target = state
        .db
        .get_user_by_username(&username)?
        .ok_or_else(|| ApiError::NotFound("not found".into()))?;

    state.db.set_block(&target.id, false, "", None)?;

    info!("{} unblocked {}", claims.username, username);
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// The admin flag is read from the store on every call, so revoking it
/// takes effect without waiting out token expiry.
fn require_admin(state: &AppState, claims: &Claims) -> Result<(), ApiError> {
    let user = state
        .db
        .get_user_by_id(&claims.sub.to_string())?
        .ok_or_else(|| ApiError::Forbidden("admin only".into()))?;
    if !user.is_admin {
        return Err(ApiError::Forbidden("admin only".into()));
    }
    Ok(())
}
