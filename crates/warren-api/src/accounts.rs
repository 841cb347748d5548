use axum::{
    Extension, Json,
    extract::{Query, State},
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;

use warren_types::api::{
    Claims, MeResponse, SettingsPayload, Theme, UpdateSettingsRequest, UserEntry,
};

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MeResponse>, ApiError> {
    let user_id = claims.sub.to_string();
    let user = state
        .db
        .get_user_by_id(&user_id)?
        .ok_or_else(|| ApiError::NotFound("user not found".into()))?;
    let profile = state
        .db
        .get_profile(&user_id)?
        .ok_or_else(|| ApiError::NotFound("profile not found".into()))?;

    Ok(Json(MeResponse {
        username: user.username,
        is_admin: user.is_admin,
        settings: SettingsPayload {
            theme: theme_from_str(&profile.theme),
            avatar_url: profile.avatar_url,
        },
    }))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<UpdateSettingsRequest>, ApiError>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.db.update_settings(
        &claims.sub.to_string(),
        req.theme.map(|t| t.as_str()),
        req.avatar_url.as_deref(),
    )?;

    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<Json<Vec<UserEntry>>, ApiError> {
    let q = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty());
    let rows = state.db.search_users(q, 50)?;

    let entries = rows
        .into_iter()
        .map(|user| UserEntry {
            username: user.username,
            is_admin: user.is_admin,
        })
        .collect();

    Ok(Json(entries))
}

fn theme_from_str(theme: &str) -> Theme {
    match theme {
        "dark" => Theme::Dark,
        _ => Theme::Light,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AppStateInner;
    use std::marker::PhantomData;
    use std::sync::Arc;
    use uuid::Uuid;
    use warren_db::Database;
    use warren_gateway::router::ConversationRouter;

    fn test_state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            jwt_secret: "test-secret".into(),
            router: ConversationRouter::new(),
        })
    }

    fn seed_user(state: &AppState, username: &str) -> Claims {
        let id = Uuid::new_v4();
        state
            .db
            .create_user(&id.to_string(), username, "hash", false)
            .unwrap();
        Claims {
            sub: id,
            username: username.to_string(),
            exp: 0,
        }
    }

    #[tokio::test]
    async fn me_reflects_settings_updates() {
        let state = test_state();
        let claims = seed_user(&state, "alice");

        update_settings(
            State(state.clone()),
            Extension(claims.clone()),
            WithRejection(
                Json(UpdateSettingsRequest {
                    theme: Some(Theme::Dark),
                    avatar_url: Some("https://example.com/a.png".into()),
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap();

        let Json(me) = me(State(state), Extension(claims)).await.unwrap();
        assert_eq!(me.username, "alice");
        assert!(!me.is_admin);
        assert_eq!(me.settings.theme, Theme::Dark);
        assert_eq!(me.settings.avatar_url.as_deref(), Some("https://example.com/a.png"));
    }

    #[tokio::test]
    async fn search_filters_by_substring() {
        let state = test_state();
        let claims = seed_user(&state, "alice");
        seed_user(&state, "bob");

        let Json(hits) = search_users(
            State(state),
            Query(SearchQuery { q: Some("ali".into()) }),
            Extension(claims),
        )
        .await
        .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].username, "alice");
    }
}
