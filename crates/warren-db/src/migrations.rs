use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            is_admin    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS profiles (
            user_id      TEXT PRIMARY KEY REFERENCES users(id),
            theme        TEXT NOT NULL DEFAULT 'light',
            avatar_url   TEXT,
            first_name   TEXT NOT NULL DEFAULT '',
            last_name    TEXT NOT NULL DEFAULT '',
            visibility   TEXT NOT NULL DEFAULT 'public',
            is_blocked   INTEGER NOT NULL DEFAULT 0,
            block_reason TEXT NOT NULL DEFAULT '',
            block_until  TEXT
        );

        CREATE TABLE IF NOT EXISTS follows (
            follower_id  TEXT NOT NULL REFERENCES users(id),
            following_id TEXT NOT NULL REFERENCES users(id),
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (follower_id, following_id)
        );

        CREATE TABLE IF NOT EXISTS friend_requests (
            id           TEXT PRIMARY KEY,
            sender_id    TEXT NOT NULL REFERENCES users(id),
            recipient_id TEXT NOT NULL REFERENCES users(id),
            status       TEXT NOT NULL DEFAULT 'pending',
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_friend_requests_pending
            ON friend_requests(sender_id, recipient_id) WHERE status = 'pending';

        CREATE TABLE IF NOT EXISTS posts (
            id          TEXT PRIMARY KEY,
            author_id   TEXT NOT NULL REFERENCES users(id),
            body        TEXT NOT NULL DEFAULT '',
            image_url   TEXT,
            visibility  TEXT NOT NULL DEFAULT 'public',
            reach_count INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_posts_author
            ON posts(author_id, created_at);

        -- Two-party conversations. Participants are stored as a canonically
        -- ordered pair (user_lo < user_hi) so the UNIQUE constraint enforces
        -- at most one conversation per unordered pair, even under a
        -- concurrent create race.
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            user_lo     TEXT NOT NULL REFERENCES users(id),
            user_hi     TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_lo, user_hi)
        );

        -- Append-only message log. created_at is stored as fixed-width
        -- RFC 3339 (microseconds, Z) so lexicographic order is time order;
        -- rowid breaks ties in insertion order.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            ciphertext      TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
