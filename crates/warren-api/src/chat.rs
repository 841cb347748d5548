use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use warren_gateway::session::publish_message;
use warren_types::api::{
    Claims, ConversationResponse, CreateConversationRequest, MessageResponse, SendMessageRequest,
};

use crate::auth::AppState;
use crate::error::ApiError;

/// Create-or-fetch the conversation between exactly two users. Repeat calls
/// with the same pair (in either order) return the identical conversation.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<CreateConversationRequest>, ApiError>,
) -> Result<Json<ConversationResponse>, ApiError> {
    if req.usernames.len() != 2 {
        return Err(ApiError::BadRequest("provide two usernames".into()));
    }

    let user_a = state.db.get_user_by_username(&req.usernames[0])?;
    let user_b = state.db.get_user_by_username(&req.usernames[1])?;
    let (user_a, user_b) = match (user_a, user_b) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(ApiError::NotFound("users not found".into())),
    };

    if user_a.id == user_b.id {
        return Err(ApiError::BadRequest("conversation requires two distinct users".into()));
    }

    // Run blocking DB work off the async runtime
    let db = state.db.clone();
    let candidate = Uuid::new_v4().to_string();
    let (id_a, id_b) = (user_a.id.clone(), user_b.id.clone());
    let (row, _created) =
        tokio::task::spawn_blocking(move || db.get_or_create_conversation(&candidate, &id_a, &id_b))
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    // Participants in storage order
    let participants = if row.user_lo == user_a.id {
        vec![user_a.username, user_b.username]
    } else {
        vec![user_b.username, user_a.username]
    };

    Ok(Json(ConversationResponse {
        id: parse_uuid(&row.id, "conversation id")?,
        participants,
        created_at: parse_db_timestamp(&row.created_at),
    }))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || {
        if db.get_conversation(&cid)?.is_none() {
            return Err(ApiError::NotFound("conversation not found".into()));
        }
        if !db.is_participant(&cid, &uid)? {
            return Err(ApiError::Forbidden("forbidden".into()));
        }
        Ok(db.list_messages(&cid)?)
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    let messages = rows
        .into_iter()
        .map(|row| {
            Ok(MessageResponse {
                id: parse_uuid(&row.id, "message id")?,
                conversation_id,
                sender: row.sender_username,
                ciphertext: row.ciphertext,
                created_at: parse_db_timestamp(&row.created_at),
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(messages))
}

/// Append one encrypted message over REST. Delivery to live WebSocket
/// subscribers happens only after the durable append.
pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<SendMessageRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();

    tokio::task::spawn_blocking(move || {
        if db.get_conversation(&cid)?.is_none() {
            return Err(ApiError::NotFound("conversation not found".into()));
        }
        if !db.is_participant(&cid, &uid)? {
            return Err(ApiError::Forbidden("forbidden".into()));
        }
        Ok(())
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    let push = publish_message(
        &state.router,
        &state.db,
        conversation_id,
        claims.sub,
        &claims.username,
        req.ciphertext,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            id: push.id,
            conversation_id,
            sender: push.sender,
            ciphertext: push.ciphertext,
            created_at: push.created_at,
        }),
    ))
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid, ApiError> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Corrupt {} '{}': {}", what, value, e).into())
}

/// Timestamps come back from SQLite either as RFC 3339 (written by us) or
/// as "YYYY-MM-DD HH:MM:SS" (column defaults). Parse both; a corrupt value
/// degrades to the epoch rather than failing the whole response.
pub(crate) fn parse_db_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", value, e);
            DateTime::default()
        })
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

    fn pair_request(a: &str, b: &str) -> WithRejection<Json<CreateConversationRequest>, ApiError> {
        WithRejection(
            Json(CreateConversationRequest {
                usernames: vec![a.into(), b.into()],
            }),
            PhantomData,
        )
    }

    async fn create(state: &AppState, claims: &Claims, a: &str, b: &str) -> ConversationResponse {
        let Json(resp) = create_conversation(
            State(state.clone()),
            Extension(claims.clone()),
            pair_request(a, b),
        )
        .await
        .unwrap();
        resp
    }

    #[tokio::test]
    async fn repeat_creates_return_the_identical_conversation() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        seed_user(&state, "bob");

        let first = create(&state, &alice, "alice", "bob").await;
        let second = create(&state, &alice, "alice", "bob").await;
        let reversed = create(&state, &alice, "bob", "alice").await;

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, reversed.id);
        assert_eq!(first.participants.len(), 2);
    }

    #[tokio::test]
    async fn create_rejects_bad_pairs() {
        let state = test_state();
        let alice = seed_user(&state, "alice");

        let err = create_conversation(
            State(state.clone()),
            Extension(alice.clone()),
            WithRejection(
                Json(CreateConversationRequest {
                    usernames: vec!["alice".into()],
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = create_conversation(
            State(state.clone()),
            Extension(alice.clone()),
            pair_request("alice", "nobody"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err = create_conversation(
            State(state),
            Extension(alice),
            pair_request("alice", "alice"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn posted_message_shows_up_in_the_list() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        seed_user(&state, "bob");
        let conv = create(&state, &alice, "alice", "bob").await;

        let resp = post_message(
            State(state.clone()),
            Path(conv.id),
            Extension(alice.clone()),
            WithRejection(
                Json(SendMessageRequest {
                    ciphertext: "Zm9v".into(),
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let Json(messages) = list_messages(State(state), Path(conv.id), Extension(alice))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "alice");
        assert_eq!(messages[0].ciphertext, "Zm9v");
    }

    #[tokio::test]
    async fn non_participant_is_forbidden() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        seed_user(&state, "bob");
        let carol = seed_user(&state, "carol");
        let conv = create(&state, &alice, "alice", "bob").await;

        let err = list_messages(State(state.clone()), Path(conv.id), Extension(carol.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let err = post_message(
            State(state),
            Path(conv.id),
            Extension(carol),
            WithRejection(
                Json(SendMessageRequest {
                    ciphertext: "Zm9v".into(),
                }),
                PhantomData,
            ),
        )
        .await
        .err().unwrap();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let state = test_state();
        let alice = seed_user(&state, "alice");

        let err = list_messages(State(state), Path(Uuid::new_v4()), Extension(alice))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn rest_post_fans_out_to_live_subscribers() {
        let state = test_state();
        let alice = seed_user(&state, "alice");
        seed_user(&state, "bob");
        let conv = create(&state, &alice, "alice", "bob").await;

        let mut rx = state.router.subscribe(conv.id).await;

        post_message(
            State(state),
            Path(conv.id),
            Extension(alice),
            WithRejection(
                Json(SendMessageRequest {
                    ciphertext: "Zm9v".into(),
                }),
                PhantomData,
            ),
        )
        .await
        .unwrap();

        let push = rx.recv().await.unwrap();
        assert_eq!(push.sender, "alice");
        assert_eq!(push.ciphertext, "Zm9v");
    }
}
