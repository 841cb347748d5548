use crate::Database;
use crate::models::{FriendRequestRow, PostRow, ProfileRow, UserRow};
use anyhow::{Result, anyhow};
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Create a user and its profile row in one transaction.
    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO users (id, username, password, is_admin) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, username, password_hash, is_admin],
            )?;
            tx.execute("INSERT INTO profiles (user_id) VALUES (?1)", [id])?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|_| anyhow!("User not found: {}", id))
        })
    }

    pub fn search_users(&self, query: Option<&str>, limit: u32) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let pattern = format!("%{}%", query.unwrap_or(""));
            let mut stmt = conn.prepare(
                "SELECT id, username, password, is_admin, created_at FROM users
                 WHERE username LIKE ?1 ORDER BY username LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![pattern, limit], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Profiles --

    pub fn get_profile(&self, user_id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, theme, avatar_url, first_name, last_name, visibility,
                        is_blocked, block_reason, block_until
                 FROM profiles WHERE user_id = ?1",
            )?;
            let row = stmt
                .query_row([user_id], |row| {
                    Ok(ProfileRow {
                        user_id: row.get(0)?,
                        theme: row.get(1)?,
                        avatar_url: row.get(2)?,
                        first_name: row.get(3)?,
                        last_name: row.get(4)?,
                        visibility: row.get(5)?,
                        is_blocked: row.get(6)?,
                        block_reason: row.get(7)?,
                        block_until: row.get(8)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    /// Apply a partial settings update; `None` fields are left untouched.
    pub fn update_settings(
        &self,
        user_id: &str,
        theme: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            if let Some(theme) = theme {
                conn.execute(
                    "UPDATE profiles SET theme = ?1 WHERE user_id = ?2",
                    [theme, user_id],
                )?;
            }
            if let Some(avatar_url) = avatar_url {
                conn.execute(
                    "UPDATE profiles SET avatar_url = ?1 WHERE user_id = ?2",
                    [avatar_url, user_id],
                )?;
            }
            Ok(())
        })
    }

    pub fn set_block(
        &self,
        user_id: &str,
        blocked: bool,
        reason: &str,
        until: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE profiles SET is_blocked = ?1, block_reason = ?2, block_until = ?3
                 WHERE user_id = ?4",
                rusqlite::params![blocked, reason, until, user_id],
            )?;
            if changed == 0 {
                return Err(anyhow!("No profile for user {}", user_id));
            }
            Ok(())
        })
    }

    // -- Follows --

    pub fn add_follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO follows (follower_id, following_id) VALUES (?1, ?2)",
                [follower_id, following_id],
            )?;
            Ok(())
        })
    }

    pub fn remove_follow(&self, follower_id: &str, following_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM follows WHERE follower_id = ?1 AND following_id = ?2",
                [follower_id, following_id],
            )?;
            Ok(())
        })
    }

    pub fn is_following(&self, follower_id: &str, following_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = ?1 AND following_id = ?2)",
                [follower_id, following_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    // -- Friend requests --

    /// Get-or-create the pending request for (sender, recipient).
    /// Returns (request id, created).
    pub fn create_friend_request(
        &self,
        id: &str,
        sender_id: &str,
        recipient_id: &str,
    ) -> Result<(String, bool)> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM friend_requests
                     WHERE sender_id = ?1 AND recipient_id = ?2 AND status = 'pending'",
                    [sender_id, recipient_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                return Ok((existing_id, false));
            }

            conn.execute(
                "INSERT INTO friend_requests (id, sender_id, recipient_id) VALUES (?1, ?2, ?3)",
                [id, sender_id, recipient_id],
            )?;
            Ok((id.to_string(), true))
        })
    }

    pub fn get_friend_request(&self, id: &str) -> Result<Option<FriendRequestRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, recipient_id, status, created_at
                 FROM friend_requests WHERE id = ?1",
            )?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(FriendRequestRow {
                        id: row.get(0)?,
                        sender_id: row.get(1)?,
                        recipient_id: row.get(2)?,
                        status: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    /// Accepting creates the mutual follow pair in the same transaction.
    pub fn decide_friend_request(&self, id: &str, accept: bool) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let status = if accept { "accepted" } else { "rejected" };
            tx.execute(
                "UPDATE friend_requests SET status = ?1 WHERE id = ?2",
                [status, id],
            )?;
            if accept {
                let (sender_id, recipient_id): (String, String) = tx.query_row(
                    "SELECT sender_id, recipient_id FROM friend_requests WHERE id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO follows (follower_id, following_id) VALUES (?1, ?2)",
                    [&sender_id, &recipient_id],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO follows (follower_id, following_id) VALUES (?1, ?2)",
                    [&recipient_id, &sender_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // -- Posts --

    pub fn create_post(
        &self,
        id: &str,
        author_id: &str,
        body: &str,
        image_url: Option<&str>,
        visibility: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, author_id, body, image_url, visibility)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, author_id, body, image_url, visibility],
            )?;
            Ok(())
        })
    }

    pub fn get_post(&self, id: &str) -> Result<Option<PostRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE p.id = ?1", POST_SELECT))?;
            let row = stmt.query_row([id], map_post_row).optional()?;
            Ok(row)
        })
    }

    /// Posts the viewer may see: their own, public ones, and followers-only
    /// posts from authors the viewer follows. Newest first.
    pub fn visible_posts(&self, viewer_id: &str, limit: u32) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE p.author_id = ?1
                    OR p.visibility = 'public'
                    OR (p.visibility = 'followers' AND EXISTS (
                        SELECT 1 FROM follows f
                        WHERE f.follower_id = ?1 AND f.following_id = p.author_id))
                 ORDER BY p.created_at DESC, p.rowid DESC
                 LIMIT ?2",
                POST_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![viewer_id, limit], map_post_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Bump a post's reach counter, returning the new value.
    pub fn increment_reach(&self, post_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE posts SET reach_count = reach_count + 1 WHERE id = ?1",
                [post_id],
            )?;
            let count: u64 = conn.query_row(
                "SELECT reach_count FROM posts WHERE id = ?1",
                [post_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

const POST_SELECT: &str =
    "SELECT p.id, p.author_id, u.username, p.body, p.image_url, p.visibility,
            p.reach_count, p.created_at
     FROM posts p
     JOIN users u ON p.author_id = u.id";

fn map_post_row(row: &rusqlite::Row<'_>) -> std::result::Result<PostRow, rusqlite::Error> {
    Ok(PostRow {
        id: row.get(0)?,
        author_id: row.get(1)?,
        author_username: row.get(2)?,
        body: row.get(3)?,
        image_url: row.get(4)?,
        visibility: row.get(5)?,
        reach_count: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_user_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        is_admin: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, is_admin, created_at FROM users WHERE {} = ?1",
        column
    ))?;

    let row = stmt.query_row([value], map_user_row).optional()?;

    Ok(row)
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
