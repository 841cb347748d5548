//! Conversation membership and the append-only message log.

use crate::Database;
use crate::models::{ConversationRow, MessageRow};
use crate::queries::OptionalExt;
use anyhow::Result;
use rusqlite::Connection;

/// Canonical storage order for a participant pair. Conversations are keyed
/// by the unordered pair, so both orderings must map to the same row.
fn canonical_pair<'a>(user_a: &'a str, user_b: &'a str) -> (&'a str, &'a str) {
    if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    }
}

impl Database {
    /// Return the conversation for the unordered pair {user_a, user_b},
    /// creating it if none exists. `id` is used only when a new row is
    /// inserted. The UNIQUE(user_lo, user_hi) constraint plus the
    /// insert-then-reselect sequence make this safe under a concurrent
    /// create race: the loser's insert is ignored and both callers read
    /// back the same row.
    pub fn get_or_create_conversation(
        &self,
        id: &str,
        user_a: &str,
        user_b: &str,
    ) -> Result<(ConversationRow, bool)> {
        let (lo, hi) = canonical_pair(user_a, user_b);
        self.with_conn(|conn| {
            if let Some(row) = query_conversation_by_pair(conn, lo, hi)? {
                return Ok((row, false));
            }

            let inserted = conn.execute(
                "INSERT OR IGNORE INTO conversations (id, user_lo, user_hi) VALUES (?1, ?2, ?3)",
                [id, lo, hi],
            )?;

            let row = query_conversation_by_pair(conn, lo, hi)?
                .ok_or_else(|| anyhow::anyhow!("Conversation vanished after insert"))?;
            Ok((row, inserted == 1))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_lo, user_hi, created_at FROM conversations WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_conversation_row).optional()?;
            Ok(row)
        })
    }

    /// Membership check consulted on every conversation read/write.
    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations
                 WHERE id = ?1 AND (user_lo = ?2 OR user_hi = ?2))",
                [conversation_id, user_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    /// Append one message. The caller is responsible for the participant
    /// check and for broadcasting only after this returns.
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        ciphertext: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, ciphertext, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                [id, conversation_id, sender_id, ciphertext, created_at],
            )?;
            Ok(())
        })
    }

    /// Full snapshot of a conversation's log in append order. Sender
    /// usernames are joined in the same query (no N+1).
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.ciphertext, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at ASC, m.rowid ASC",
            )?;
            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        sender_id: row.get(2)?,
                        sender_username: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        ciphertext: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn map_conversation_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user_lo: row.get(1)?,
        user_hi: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn query_conversation_by_pair(
    conn: &Connection,
    lo: &str,
    hi: &str,
) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_lo, user_hi, created_at FROM conversations
         WHERE user_lo = ?1 AND user_hi = ?2",
    )?;
    let row = stmt.query_row([lo, hi], map_conversation_row).optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn seed_user(db: &Database, username: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        db.create_user(&id, username, "hash", false).unwrap();
        id
    }

    fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[test]
    fn get_or_create_is_idempotent_and_symmetric() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");

        let (first, created) = db.get_or_create_conversation(&new_id(), &alice, &bob).unwrap();
        assert!(created);

        let (second, created) = db.get_or_create_conversation(&new_id(), &alice, &bob).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        // Reversed pair resolves to the same conversation
        let (reversed, created) = db.get_or_create_conversation(&new_id(), &bob, &alice).unwrap();
        assert!(!created);
        assert_eq!(first.id, reversed.id);
    }

    #[test]
    fn distinct_pairs_get_distinct_conversations() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let (ab, _) = db.get_or_create_conversation(&new_id(), &alice, &bob).unwrap();
        let (ac, _) = db.get_or_create_conversation(&new_id(), &alice, &carol).unwrap();
        assert_ne!(ab.id, ac.id);
    }

    #[test]
    fn is_participant_covers_both_members_only() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let (conv, _) = db.get_or_create_conversation(&new_id(), &alice, &bob).unwrap();

        assert!(db.is_participant(&conv.id, &alice).unwrap());
        assert!(db.is_participant(&conv.id, &bob).unwrap());
        assert!(!db.is_participant(&conv.id, &carol).unwrap());
        assert!(!db.is_participant("no-such-conversation", &alice).unwrap());
    }

    #[test]
    fn messages_listed_in_append_order() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let (conv, _) = db.get_or_create_conversation(&new_id(), &alice, &bob).unwrap();

        // Identical timestamps: rowid must break the tie in insertion order.
        let stamp = "2026-01-01T00:00:00.000000Z";
        db.insert_message("m1", &conv.id, &alice, "Zm9v", stamp).unwrap();
        db.insert_message("m2", &conv.id, &bob, "YmFy", stamp).unwrap();
        db.insert_message("m3", &conv.id, &alice, "YmF6", "2026-01-01T00:00:01.000000Z")
            .unwrap();

        let log = db.list_messages(&conv.id).unwrap();
        let ids: Vec<&str> = log.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(log[0].sender_username, "alice");
        assert_eq!(log[0].ciphertext, "Zm9v");
    }

    #[test]
    fn list_messages_is_scoped_to_the_conversation() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let (ab, _) = db.get_or_create_conversation(&new_id(), &alice, &bob).unwrap();
        let (ac, _) = db.get_or_create_conversation(&new_id(), &alice, &carol).unwrap();

        db.insert_message("m1", &ab.id, &alice, "Zm9v", "2026-01-01T00:00:00.000000Z")
            .unwrap();
        db.insert_message("m2", &ac.id, &alice, "YmFy", "2026-01-01T00:00:00.000000Z")
            .unwrap();

        assert_eq!(db.list_messages(&ab.id).unwrap().len(), 1);
        assert_eq!(db.list_messages(&ac.id).unwrap().len(), 1);
        assert!(db.list_messages("no-such-conversation").unwrap().is_empty());
    }
}
