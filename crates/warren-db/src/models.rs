/// Database row types — these map directly to SQLite rows.
/// Distinct from warren-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub is_admin: bool,
    pub created_at: String,
}

pub struct ProfileRow {
    pub user_id: String,
    pub theme: String,
    pub avatar_url: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub visibility: String,
    pub is_blocked: bool,
    pub block_reason: String,
    pub block_until: Option<String>,
}

pub struct FriendRequestRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub status: String,
    pub created_at: String,
}

pub struct PostRow {
    pub id: String,
    pub author_id: String,
    pub author_username: String,
    pub body: String,
    pub image_url: Option<String>,
    pub visibility: String,
    pub reach_count: u64,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub user_lo: String,
    pub user_hi: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub ciphertext: String,
    pub created_at: String,
}
