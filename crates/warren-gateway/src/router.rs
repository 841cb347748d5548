use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

use warren_types::events::MessagePush;

/// Capacity of each conversation's broadcast channel. A receiver that falls
/// this far behind skips messages (RecvError::Lagged).
const GROUP_CAPACITY: usize = 256;

struct Group {
    tx: broadcast::Sender<MessagePush>,
    /// Serializes append-then-broadcast for this conversation so messages
    /// are fanned out in the same order they were persisted.
    publish_lock: Arc<Mutex<()>>,
}

impl Group {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(GROUP_CAPACITY);
        Self {
            tx,
            publish_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Per-conversation fan-out registry: conversation id → group of live
/// connections. Constructed once at server start and handed to every
/// session; the registry is a derived cache of who is currently listening,
/// never authoritative for membership.
///
/// Each group is its own broadcast channel, so subscribe/unsubscribe/
/// broadcast for one conversation never contend with another beyond the
/// brief map access.
#[derive(Clone)]
pub struct ConversationRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    groups: RwLock<HashMap<Uuid, Group>>,
}

impl ConversationRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Join a conversation's group, creating it on first use.
    pub async fn subscribe(&self, conversation_id: Uuid) -> broadcast::Receiver<MessagePush> {
        let mut groups = self.inner.groups.write().await;
        groups
            .entry(conversation_id)
            .or_insert_with(Group::new)
            .tx
            .subscribe()
    }

    /// Drop the group once its last receiver is gone. Sessions call this on
    /// every disconnect path, after releasing their receiver.
    pub async fn unsubscribe(&self, conversation_id: Uuid) {
        let mut groups = self.inner.groups.write().await;
        if let Some(group) = groups.get(&conversation_id) {
            if group.tx.receiver_count() == 0 {
                groups.remove(&conversation_id);
                debug!("Pruned empty group for conversation {}", conversation_id);
            }
        }
    }

    /// Deliver a message to every live subscriber of the conversation,
    /// including the sender's own connection. Returns the number of
    /// receivers the message reached at call time.
    pub async fn broadcast(&self, conversation_id: Uuid, push: MessagePush) -> usize {
        let tx = {
            let groups = self.inner.groups.read().await;
            match groups.get(&conversation_id) {
                Some(group) => group.tx.clone(),
                None => return 0,
            }
        };
        tx.send(push).unwrap_or(0)
    }

    /// Acquire the conversation's publish lock. Held across the
    /// append-then-broadcast sequence; unrelated conversations never
    /// contend on it.
    pub async fn publish_lock(&self, conversation_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut groups = self.inner.groups.write().await;
            groups
                .entry(conversation_id)
                .or_insert_with(Group::new)
                .publish_lock
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        let groups = self.inner.groups.read().await;
        groups
            .get(&conversation_id)
            .map_or(0, |group| group.tx.receiver_count())
    }

    pub async fn group_count(&self) -> usize {
        self.inner.groups.read().await.len()
    }
}

impl Default for ConversationRouter {
    fn default() -> Self {
        Self::new()
    }
}
