use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use warren_db::Database;
use warren_types::events::{ChatAction, MessagePush};

use crate::router::ConversationRouter;

/// Handle one chat WebSocket for its whole lifetime.
///
/// The caller (the upgrade handler) has already authenticated the user and
/// verified conversation membership, so this session only relays: inbound
/// send actions are appended to the log and fanned out; everything arriving
/// on the conversation's group is forwarded to the socket. Malformed frames
/// are dropped without closing the connection.
pub async fn handle_connection(
    socket: WebSocket,
    router: ConversationRouter,
    db: Arc<Database>,
    conversation_id: Uuid,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let mut rx = router.subscribe(conversation_id).await;
    info!("{} ({}) joined conversation {}", username, user_id, conversation_id);

    // Forward group broadcasts -> client
    let mut send_task = tokio::spawn(async move {
        loop {
            let push = match rx.recv().await {
                Ok(push) => push,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Chat receiver lagged by {} messages", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let text = serde_json::to_string(&push).unwrap();
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Read send actions from the client
    let router_recv = router.clone();
    let db_recv = db.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let action = match serde_json::from_str::<ChatAction>(&text) {
                        Ok(action) => action,
                        Err(e) => {
                            warn!(
                                "{} dropped malformed chat frame: {} -- raw: {}",
                                username_recv,
                                e,
                                &text[..text.len().min(200)]
                            );
                            continue;
                        }
                    };

                    let ChatAction::Send { sender, ciphertext } = action;

                    // The declared sender must be the authenticated user;
                    // anything else is dropped like a malformed frame.
                    if sender != username_recv {
                        warn!(
                            "{} dropped frame declaring sender '{}'",
                            username_recv, sender
                        );
                        continue;
                    }

                    match publish_message(
                        &router_recv,
                        &db_recv,
                        conversation_id,
                        user_id,
                        &username_recv,
                        ciphertext,
                    )
                    .await
                    {
                        Ok(_) => {}
                        Err(e) => {
                            // Persistence failure: close rather than ack a
                            // message that was never made durable.
                            error!(
                                "Failed to persist message from {} in {}: {}",
                                username_recv, conversation_id, e
                            );
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever task exits first takes the other down with it.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Every disconnect path funnels through here.
    router.unsubscribe(conversation_id).await;
    info!("{} ({}) left conversation {}", username, user_id, conversation_id);
}

/// Append one message to the conversation's log and fan it out.
///
/// The group's publish lock is held across both steps so broadcast order
/// matches append order within the conversation, and the broadcast only
/// happens once the append is durable. Shared by the WebSocket session and
/// the REST post-message handler.
pub async fn publish_message(
    router: &ConversationRouter,
    db: &Arc<Database>,
    conversation_id: Uuid,
    sender_id: Uuid,
    sender_username: &str,
    ciphertext: String,
) -> anyhow::Result<MessagePush> {
    let _guard = router.publish_lock(conversation_id).await;

    let message_id = Uuid::new_v4();
    let created_at = Utc::now();

    // Fixed-width stamp keeps lexicographic order == time order in the log.
    let stamp = created_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    let db = db.clone();
    let mid = message_id.to_string();
    let cid = conversation_id.to_string();
    let sid = sender_id.to_string();
    let text = ciphertext.clone();
    tokio::task::spawn_blocking(move || db.insert_message(&mid, &cid, &sid, &text, &stamp))
        .await??;

    let push = MessagePush {
        id: message_id,
        ciphertext,
        sender: sender_username.to_string(),
        created_at,
    };
    router.broadcast(conversation_id, push.clone()).await;
    Ok(push)
}
