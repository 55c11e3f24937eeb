use chrono::{DateTime, Utc};
use sqlx::Row;

use trove_core::domain::message::Role;

use super::{ConversationStore, RepositoryError, StoredMessage};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn append(&self, chat_id: &str, messages: &[StoredMessage]) -> Result<(), RepositoryError> {
        if messages.is_empty() {
            return Ok(());
        }

        // Sequence numbers are per-chat and assigned inside the transaction,
        // so interleaved appends from two turns cannot collide.
        let mut tx = self.pool.begin().await?;
        let last_seq: i64 =
            sqlx::query_scalar("SELECT IFNULL(MAX(seq), 0) FROM chat_message WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_one(&mut *tx)
                .await?;

        for (offset, message) in messages.iter().enumerate() {
            let items_json = match &message.items {
                Some(items) => Some(
                    serde_json::to_string(items)
                        .map_err(|err| RepositoryError::Decode(err.to_string()))?,
                ),
                None => None,
            };
            sqlx::query(
                "INSERT INTO chat_message
                     (id, chat_id, seq, role, body_text, image_ref, items_json, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&message.id)
            .bind(chat_id)
            .bind(last_seq + 1 + offset as i64)
            .bind(message.role.as_str())
            .bind(&message.text)
            .bind(&message.image_ref)
            .bind(items_json)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, chat_id: &str) -> Result<Vec<StoredMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, role, body_text, image_ref, items_json, created_at
             FROM chat_message WHERE chat_id = ? ORDER BY seq ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_message_row).collect()
    }
}

fn map_message_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, RepositoryError> {
    let role_text: String = row.try_get("role")?;
    let role = Role::parse(&role_text)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role '{role_text}'")))?;

    let items = match row.try_get::<Option<String>, _>("items_json")? {
        Some(raw) => Some(
            serde_json::from_str(&raw).map_err(|err| RepositoryError::Decode(err.to_string()))?,
        ),
        None => None,
    };

    let created_raw: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map_err(|err| RepositoryError::Decode(format!("bad created_at: {err}")))?
        .with_timezone(&Utc);

    Ok(StoredMessage {
        id: row.try_get("id")?,
        role,
        text: row.try_get("body_text")?,
        image_ref: row.try_get("image_ref")?,
        items,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use trove_core::domain::message::{Role, SelectedItem};

    use super::SqlConversationStore;
    use crate::repositories::{ConversationStore, StoredMessage};
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlConversationStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        SqlConversationStore::new(pool)
    }

    fn user(id: &str, text: &str) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            role: Role::User,
            text: text.to_string(),
            image_ref: None,
            items: None,
            created_at: Utc::now(),
        }
    }

    fn assistant_with_items(id: &str, text: &str) -> StoredMessage {
        let item = SelectedItem {
            id: "m-1".to_string(),
            title: "Cast iron skillet".to_string(),
            shop_name: "Hearth & Home".to_string(),
            price: "32.00".to_string(),
            url: "https://market.example/items/m-1".to_string(),
            image_url: None,
            description: "Pre-seasoned, 10 inch".to_string(),
            tags: vec!["kitchen".to_string()],
            reason: Some("Matches the budget".to_string()),
        };
        StoredMessage {
            id: id.to_string(),
            role: Role::Assistant,
            text: text.to_string(),
            image_ref: None,
            items: Some(vec![item]),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn history_preserves_append_order_across_batches() {
        let store = store().await;

        store.append("chat-1", &[user("m1", "hello"), assistant_with_items("m2", "options")])
            .await
            .expect("append");
        store.append("chat-1", &[user("m3", "cheaper ones?")]).await.expect("append");

        let history = store.history("chat-1").await.expect("history");
        let ids: Vec<&str> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn items_survive_the_round_trip() {
        let store = store().await;
        store.append("chat-1", &[assistant_with_items("m1", "picked")]).await.expect("append");

        let history = store.history("chat-1").await.expect("history");
        let items = history[0].items.as_ref().expect("items present");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "m-1");
        assert_eq!(items[0].tags, vec!["kitchen"]);
    }

    #[tokio::test]
    async fn chats_do_not_leak_into_each_other() {
        let store = store().await;
        store.append("chat-1", &[user("m1", "hello")]).await.expect("append");
        store.append("chat-2", &[user("m2", "hi there")]).await.expect("append");

        let history = store.history("chat-1").await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "m1");
    }

    #[tokio::test]
    async fn empty_append_is_a_no_op() {
        let store = store().await;
        store.append("chat-1", &[]).await.expect("append");
        assert!(store.history("chat-1").await.expect("history").is_empty());
    }
}
