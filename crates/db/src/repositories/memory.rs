use std::collections::HashMap;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use trove_core::domain::quota::{
    valid_visitor_fingerprint, Identity, QuotaDecision, QuotaDenyReason, QuotaLimits,
};

use super::{ConversationStore, RepositoryError, StoredMessage, TurnQuota};

#[derive(Default)]
pub struct InMemoryConversationStore {
    chats: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, chat_id: &str, messages: &[StoredMessage]) -> Result<(), RepositoryError> {
        let mut chats = self.chats.write().await;
        chats.entry(chat_id.to_string()).or_default().extend_from_slice(messages);
        Ok(())
    }

    async fn history(&self, chat_id: &str) -> Result<Vec<StoredMessage>, RepositoryError> {
        let chats = self.chats.read().await;
        Ok(chats.get(chat_id).cloned().unwrap_or_default())
    }
}

/// Keyed the same way the tables are: account usage by
/// (account, chat, day) and visitors by fingerprint alone.
#[derive(Default)]
pub struct InMemoryTurnQuota {
    account_turns: RwLock<HashMap<(String, String, String), u32>>,
    visitor_turns: RwLock<HashMap<String, u32>>,
}

#[async_trait::async_trait]
impl TurnQuota for InMemoryTurnQuota {
    async fn consume(
        &self,
        identity: &Identity,
        chat_id: &str,
        limits: QuotaLimits,
        today: NaiveDate,
    ) -> Result<QuotaDecision, RepositoryError> {
        match identity {
            Identity::Account { account_id } => {
                let used_on = today.format("%Y-%m-%d").to_string();
                let mut turns = self.account_turns.write().await;

                let session_count: u32 = turns
                    .iter()
                    .filter(|((account, chat, _), _)| account == account_id && chat == chat_id)
                    .map(|(_, count)| count)
                    .sum();
                let daily_count: u32 = turns
                    .iter()
                    .filter(|((account, _, day), _)| account == account_id && *day == used_on)
                    .map(|(_, count)| count)
                    .sum();

                if session_count >= limits.session_limit {
                    return Ok(QuotaDecision::denied(QuotaDenyReason::SessionLimit).with_counts(
                        session_count,
                        daily_count,
                        limits.session_limit,
                        limits.daily_limit,
                    ));
                }
                if daily_count >= limits.daily_limit {
                    return Ok(QuotaDecision::denied(QuotaDenyReason::DailyLimit).with_counts(
                        session_count,
                        daily_count,
                        limits.session_limit,
                        limits.daily_limit,
                    ));
                }

                *turns.entry((account_id.clone(), chat_id.to_string(), used_on)).or_insert(0) += 1;
                Ok(QuotaDecision::allowed(
                    session_count + 1,
                    daily_count + 1,
                    limits.session_limit,
                    limits.daily_limit,
                ))
            }
            Identity::Visitor { visitor_id } => {
                if !valid_visitor_fingerprint(visitor_id) {
                    return Ok(QuotaDecision::denied(QuotaDenyReason::InvalidVisitorId));
                }
                let mut turns = self.visitor_turns.write().await;
                let used = turns.get(visitor_id).copied().unwrap_or(0);
                if used >= limits.visitor_limit {
                    return Ok(QuotaDecision::denied(QuotaDenyReason::LimitReached).with_counts(
                        used,
                        used,
                        limits.visitor_limit,
                        limits.visitor_limit,
                    ));
                }
                turns.insert(visitor_id.clone(), used + 1);
                Ok(QuotaDecision::allowed(
                    used + 1,
                    used + 1,
                    limits.visitor_limit,
                    limits.visitor_limit,
                ))
            }
        }
    }
}
