use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use rand::{Rng, distr::Alphanumeric};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use warren_api::auth::{self, AppState, AppStateInner};
use warren_api::error::ApiError;
use warren_api::middleware::{decode_token, require_auth};
use warren_api::{accounts, admin, chat, social};
use warren_gateway::router::ConversationRouter;
use warren_gateway::session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warren=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("WARREN_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("WARREN_DB_PATH").unwrap_or_else(|_| "warren.db".into());
    let host = std::env::var("WARREN_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("WARREN_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(warren_db::Database::open(&PathBuf::from(&db_path))?);

    // Bootstrap the admin account
    let admin_username =
        std::env::var("WARREN_ADMIN_USERNAME").unwrap_or_else(|_| "admin".into());
    match std::env::var("WARREN_ADMIN_PASSWORD") {
        Ok(password) => {
            auth::ensure_admin(&db, &admin_username, &password)?;
        }
        Err(_) => {
            let password: String = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(20)
                .map(char::from)
                .collect();
            if auth::ensure_admin(&db, &admin_username, &password)? {
                info!("Generated admin password for '{}': {}", admin_username, password);
            }
        }
    }

    // Shared state
    let router = ConversationRouter::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret,
        router,
    });

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/me", get(accounts::me))
        .route("/settings", post(accounts::update_settings))
        .route("/users", get(accounts::search_users))
        .route("/social/follow", post(social::follow))
        .route("/social/unfollow", post(social::unfollow))
        .route("/social/friend-requests", post(social::send_friend_request))
        .route("/social/friend-requests/{request_id}", post(social::decide_friend_request))
        .route("/posts", get(social::list_posts))
        .route("/posts", post(social::create_post))
        .route("/posts/{post_id}/view", post(social::record_view))
        .route("/conversations", post(chat::create_conversation))
        .route("/conversations/{conversation_id}/messages", get(chat::list_messages))
        .route("/conversations/{conversation_id}/messages", post(chat::post_message))
        .route("/admin/users/{username}/block", post(admin::block_user))
        .route("/admin/users/{username}/unblock", post(admin::unblock_user))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state.clone());

    let ws_routes = Router::new()
        .route("/ws/chat/{conversation_id}", get(chat_ws_upgrade))
        .with_state(app_state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Warren server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsAuthQuery {
    token: Option<String>,
}

/// Authenticate and authorize before the upgrade: a malformed conversation
/// id never matches the route, and a bad token, blocked account or
/// non-participant is rejected here — the session handler only ever sees
/// vetted connections.
async fn chat_ws_upgrade(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    // Browser WebSocket clients cannot set headers, so the token may come
    // in the query string instead.
    let token = query
        .token
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .ok_or_else(|| ApiError::Unauthorized("missing token".into()))?;

    let claims = decode_token(&state.jwt_secret, &token)?;

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
        if let Some(profile) = db.get_profile(&uid)? {
            if auth::block_active(&profile, chrono::Utc::now()) {
                return Err(ApiError::Forbidden("account blocked".into()));
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))??;

    let router = state.router.clone();
    let db = state.db.clone();
    Ok(ws.on_upgrade(move |socket| {
        session::handle_connection(socket, router, db, conversation_id, claims.sub, claims.username)
    }))
}
