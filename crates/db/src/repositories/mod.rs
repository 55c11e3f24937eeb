use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use trove_core::domain::message::{ChatMessage, Role, SelectedItem};
use trove_core::domain::quota::{Identity, QuotaDecision, QuotaLimits};

pub mod conversation;
pub mod memory;
pub mod quota;

pub use conversation::SqlConversationStore;
pub use memory::{InMemoryConversationStore, InMemoryTurnQuota};
pub use quota::SqlTurnQuota;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// The admission gate's storage contract: one atomic check-and-increment.
/// A denial must never increment, and two sequential allowed calls must
/// observe strictly increasing counts.
#[async_trait]
pub trait TurnQuota: Send + Sync {
    async fn consume(
        &self,
        identity: &Identity,
        chat_id: &str,
        limits: QuotaLimits,
        today: NaiveDate,
    ) -> Result<QuotaDecision, RepositoryError>;
}

/// Append-only transcript persistence. Messages are only written once a
/// turn completed normally; cancelled turns leave no rows.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(
        &self,
        chat_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), RepositoryError>;

    async fn history(&self, chat_id: &str) -> Result<Vec<StoredMessage>, RepositoryError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub image_ref: Option<String>,
    pub items: Option<Vec<SelectedItem>>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn into_chat_message(self) -> ChatMessage {
        ChatMessage {
            id: Some(self.id),
            role: self.role,
            text: Some(self.text),
            image_ref: self.image_ref,
            items: self.items,
        }
    }
}
