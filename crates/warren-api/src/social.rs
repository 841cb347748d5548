use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use warren_db::models::{PostRow, UserRow};
use warren_types::api::{
    Claims, CreatePostRequest, DecideFriendRequest, FriendRequestAction, FriendRequestCreated,
    PostResponse, RecordViewResponse, TargetUserRequest, Visibility,
};

use crate::auth::AppState;
use crate::chat::parse_db_timestamp;
use crate::error::ApiError;

// -- Follow graph --

pub async fn follow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<TargetUserRequest>, ApiError>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target = lookup_user(&state, &req.username)?;
    if target.id == claims.sub.to_string() {
        return Err(ApiError::BadRequest("cannot follow self".into()));
    }

    state.db.add_follow(&claims.sub.to_string(), &target.id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn unfollow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<TargetUserRequest>, ApiError>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let target = lookup_user(&state, &req.username)?;
    state.db.remove_follow(&claims.sub.to_string(), &target.id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// -- Friend requests --

pub async fn send_friend_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<TargetUserRequest>, ApiError>,
) -> Result<Json<FriendRequestCreated>, ApiError> {
    let target = lookup_user(&state, &req.username)?;
    if target.id == claims.sub.to_string() {
        return Err(ApiError::BadRequest("cannot request self".into()));
    }

    let candidate = Uuid::new_v4().to_string();
    let (id, _created) =
        state
            .db
            .create_friend_request(&candidate, &claims.sub.to_string(), &target.id)?;

    let id = id
        .parse()
        .map_err(|e| anyhow::anyhow!("Corrupt friend request id '{}': {}", id, e))?;
    Ok(Json(FriendRequestCreated { id, ok: true }))
}

/// Only the recipient may decide a request; accepting creates the mutual
/// follow pair.
pub async fn decide_friend_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<DecideFriendRequest>, ApiError>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = state
        .db
        .get_friend_request(&request_id.to_string())?
        .filter(|r| r.recipient_id == claims.sub.to_string())
        .ok_or_else(|| ApiError::NotFound("not found".into()))?;

    let accept = req.action == FriendRequestAction::Accept;
    state.db.decide_friend_request(&request.id, accept)?;

    Ok(Json(serde_json::json!({ "ok": true })))
}

// -- Posts --

pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<CreatePostRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let post_id = Uuid::new_v4().to_string();
    state.db.create_post(
        &post_id,
        &claims.sub.to_string(),
        &req.body,
        req.image_url.as_deref(),
        req.visibility.as_str(),
    )?;

    let row = state
        .db
        .get_post(&post_id)?
        .ok_or_else(|| anyhow::anyhow!("Post vanished after insert"))?;

    Ok((StatusCode::CREATED, Json(post_response(row)?)))
}

/// Posts visible to the caller, newest first.
pub async fn list_posts(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<PostResponse>>, ApiError> {
    let rows = state.db.visible_posts(&claims.sub.to_string(), 100)?;
    let posts = rows
        .into_iter()
        .map(post_response)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(posts))
}

/// Explicit reach recording, separated from the read path so GET stays
/// idempotent. Counts a view only for non-owners who can see the post.
pub async fn record_view(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<RecordViewResponse>, ApiError> {
    let row = state
        .db
        .get_post(&post_id.to_string())?
        .ok_or_else(|| ApiError::NotFound("post not found".into()))?;

    let viewer_id = claims.sub.to_string();
    if row.author_id == viewer_id {
        return Ok(Json(RecordViewResponse {
            reach_count: row.reach_count,
        }));
    }

    // An invisible post is indistinguishable from an absent one.
    let visible = match row.visibility.as_str() {
        "public" => true,
        "followers" => state.db.is_following(&viewer_id, &row.author_id)?,
        _ => false,
    };
    if !visible {
        return Err(ApiError::NotFound("post not found".into()));
    }

    let reach_count = state.db.increment_reach(&row.id)?;
    Ok(Json(RecordViewResponse { reach_count }))
}

fn lookup_user(state: &AppState, username: &str) -> Result<UserRow, ApiError> {
    state
        .db
        .get_user_by_username(username)?
        .ok_or_else(|| ApiError::NotFound("not found".into()))
}

fn post_response(row: PostRow) -> Result<PostResponse, ApiError> {
    Ok(PostResponse {
        id: row
            .id
            .parse()
            .map_err(|e| anyhow::anyhow!("Corrupt post id '{}': {}", row.id, e))?,
        author: row.author_username,
        body: row.body,
        image_url: row.image_url,
        visibility: visibility_from_str(&row.visibility),
        reach_count: row.reach_count,
        created_at: parse_db_timestamp(&row.created_at),
    })
}

fn visibility_from_str(visibility: &str) -> Visibility {
    match visibility {
        "followers" => Visibility::Followers,
        "private" => Visibility::Private,
        _ => Visibility::Public,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AppStateInner;
    use std::marker::PhantomData;
    use std::sync::Arc;
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

    fn target(username: &str) -> WithRejection<Json<TargetUserRequest>, ApiError> {
        WithRejection(
            Json(TargetUserRequest {
                username: username.into(),
            }),
            PhantomData,
        )
    }

    #[tokio::test]
    async fn follow_rejects_self_and_unknown() {
        let state = test_state();
        let alice = seed_user(&state, "alice");

        let err = follow(State(state.clone()), Extension(alice.clone()), target("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = follow(State(state), Extension(alice), target("nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn accepted_request_follows_both_ways() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        let bob = seed_user(&state, "bob");

        let Json(created) = send_friend_request(
            State(state.clone()),
            Extension(alice.clone()),
            target("bob"),
        )
        .await
        .unwrap();

        // The sender cannot decide their own request
        let err = decide_friend_request(
            State(state.clone()),
            Path(created.id),
            Extension(alice.clone()),
            WithRejection(
                Json(DecideFriendRequest {
                    action: FriendRequestAction::Accept,
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        decide_friend_request(
            State(state.clone()),
            Path(created.id),
            Extension(bob),
            WithRejection(
                Json(DecideFriendRequest {
                    action: FriendRequestAction::Accept,
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap();

        let db = &state.db;
        let alice_id = alice.sub.to_string();
        let bob_id = db.get_user_by_username("bob").unwrap().unwrap().id;
        assert!(db.is_following(&alice_id, &bob_id).unwrap());
        assert!(db.is_following(&bob_id, &alice_id).unwrap());
    }

    #[tokio::test]
    async fn record_view_counts_only_visible_non_owner_views() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        let carol = seed_user(&state, "carol");

        let resp = create_post(
            State(state.clone()),
            Extension(alice.clone()),
            WithRejection(
                Json(CreatePostRequest {
                    body: "hello".into(),
                    image_url: None,
                    visibility: Visibility::Public,
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let Json(posts) = list_posts(State(state.clone()), Extension(carol.clone()))
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
        let post_id = posts[0].id;

        // Owner views do not count
        let Json(view) = record_view(State(state.clone()), Path(post_id), Extension(alice))
            .await
            .unwrap();
        assert_eq!(view.reach_count, 0);

        let Json(view) = record_view(State(state), Path(post_id), Extension(carol))
            .await
            .unwrap();
        assert_eq!(view.reach_count, 1);
    }

    #[tokio::test]
    async fn followers_post_is_hidden_from_strangers() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        let carol = seed_user(&state, "carol");

        create_post(
            State(state.clone()),
            Extension(alice.clone()),
            WithRejection(
                Json(CreatePostRequest {
                    body: "followers only".into(),
                    image_url: None,
                    visibility: Visibility::Followers,
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap();

        let Json(posts) = list_posts(State(state.clone()), Extension(carol.clone()))
            .await
            .unwrap();
        assert!(posts.is_empty());

        // The author still sees it, and a stranger's record-view is a 404
        let Json(own) = list_posts(State(state.clone()), Extension(alice)).await.unwrap();
        assert_eq!(own.len(), 1);

        let err = record_view(State(state), Path(own[0].id), Extension(carol))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
