//! Minimal social surface: posts, chat, moderation.
//!
//! Agents post, comment, and message; NPC context reads the top-K of each.
//! Feed ranking is out of scope — queries are recency-ordered only.

use rusqlite::{params, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, ChatMessage, Post};

fn row_to_post(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        author_id: row.get(1)?,
        body: row.get(2)?,
        reply_to: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        body: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[derive(Clone)]
pub struct SocialStore {
    db: Db,
}

impl SocialStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create_post(&self, author_id: i64, body: &str) -> EngineResult<i64> {
        let body = body.trim();
        if body.is_empty() {
            return Err(EngineError::InvariantViolation("empty post body".into()));
        }
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO posts (author_id, body, created_at) VALUES (?1, ?2, ?3)",
            params![author_id, body, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_comment(
        &self,
        author_id: i64,
        parent_post_id: i64,
        body: &str,
    ) -> EngineResult<i64> {
        let conn = self.db.lock().await;
        let parent_exists: bool = conn
            .query_row("SELECT 1 FROM posts WHERE id = ?1", params![parent_post_id], |_| {
                Ok(true)
            })
            .unwrap_or(false);
        if !parent_exists {
            return Err(EngineError::NotFound(format!("post {parent_post_id}")));
        }
        conn.execute(
            "INSERT INTO posts (author_id, body, reply_to, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![author_id, body.trim(), parent_post_id, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn send_message(
        &self,
        sender_id: i64,
        recipient_id: Option<i64>,
        body: &str,
    ) -> EngineResult<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO chat_messages (sender_id, recipient_id, body, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![sender_id, recipient_id, body.trim(), now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn recent_posts(&self, limit: usize) -> EngineResult<Vec<Post>> {
        let limit = limit.clamp(1, 500) as i64;
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, author_id, body, reply_to, created_at FROM posts \
             ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_post)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// Recent messages in the shared group channel.
    pub async fn recent_group_messages(&self, limit: usize) -> EngineResult<Vec<ChatMessage>> {
        let limit = limit.clamp(1, 500) as i64;
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, sender_id, recipient_id, body, created_at FROM chat_messages \
             WHERE recipient_id IS NULL ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_message)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// Comment + reply volume on a user's posts, used by the reward scorer.
    pub async fn engagement_count(&self, author_id: i64, since: i64) -> EngineResult<i64> {
        let conn = self.db.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM posts replies \
             JOIN posts parents ON replies.reply_to = parents.id \
             WHERE parents.author_id = ?1 AND replies.created_at >= ?2 \
               AND replies.author_id != ?1",
            params![author_id, since],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub async fn record_moderation(
        &self,
        actor_id: i64,
        kind: &str,
        target_user_id: Option<i64>,
        target_post_id: Option<i64>,
        reason: Option<&str>,
    ) -> EngineResult<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO moderation_actions \
             (actor_id, kind, target_user_id, target_post_id, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![actor_id, kind, target_user_id, target_post_id, reason, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn posts_and_comments() {
        let db = Db::open_in_memory().unwrap();
        let store = SocialStore::new(db);
        let post = store.create_post(1, "markets look frothy").await.unwrap();
        store.create_comment(2, post, "agreed").await.unwrap();
        store.create_comment(3, post, "disagree").await.unwrap();

        let posts = store.recent_posts(10).await.unwrap();
        assert_eq!(posts.len(), 3);
        assert_eq!(store.engagement_count(1, 0).await.unwrap(), 2);

        assert!(store.create_comment(2, 999, "orphan").await.is_err());
        assert!(store.create_post(1, "   ").await.is_err());
    }

    #[tokio::test]
    async fn group_channel_filters_dms() {
        let db = Db::open_in_memory().unwrap();
        let store = SocialStore::new(db);
        store.send_message(1, None, "hello all").await.unwrap();
        store.send_message(1, Some(2), "psst").await.unwrap();
        let group = store.recent_group_messages(10).await.unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].body, "hello all");
    }
}
