use chrono::{NaiveDate, Utc};

use trove_core::domain::quota::{
    valid_visitor_fingerprint, Identity, QuotaDecision, QuotaDenyReason, QuotaLimits,
};

use super::{RepositoryError, TurnQuota};
use crate::DbPool;

pub struct SqlTurnQuota {
    pool: DbPool,
}

impl SqlTurnQuota {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn consume_account(
        &self,
        account_id: &str,
        chat_id: &str,
        limits: QuotaLimits,
        today: NaiveDate,
    ) -> Result<QuotaDecision, RepositoryError> {
        // The counts and the increment must agree, so both run in one
        // transaction; WAL plus busy_timeout covers writer contention.
        let mut tx = self.pool.begin().await?;
        let used_on = today.format("%Y-%m-%d").to_string();

        let session_count: i64 = sqlx::query_scalar(
            "SELECT IFNULL(SUM(turns), 0) FROM turn_usage
             WHERE account_id = ? AND chat_id = ?",
        )
        .bind(account_id)
        .bind(chat_id)
        .fetch_one(&mut *tx)
        .await?;

        let daily_count: i64 = sqlx::query_scalar(
            "SELECT IFNULL(SUM(turns), 0) FROM turn_usage
             WHERE account_id = ? AND used_on = ?",
        )
        .bind(account_id)
        .bind(&used_on)
        .fetch_one(&mut *tx)
        .await?;

        let session_count = saturating_u32(session_count);
        let daily_count = saturating_u32(daily_count);

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

        sqlx::query(
            "INSERT INTO turn_usage (account_id, chat_id, used_on, turns, updated_at)
             VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(account_id, chat_id, used_on)
             DO UPDATE SET turns = turns + 1, updated_at = excluded.updated_at",
        )
        .bind(account_id)
        .bind(chat_id)
        .bind(&used_on)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(QuotaDecision::allowed(
            session_count + 1,
            daily_count + 1,
            limits.session_limit,
            limits.daily_limit,
        ))
    }

    async fn consume_visitor(
        &self,
        visitor_id: &str,
        limits: QuotaLimits,
    ) -> Result<QuotaDecision, RepositoryError> {
        if !valid_visitor_fingerprint(visitor_id) {
            return Ok(QuotaDecision::denied(QuotaDenyReason::InvalidVisitorId));
        }

        let mut tx = self.pool.begin().await?;

        let turns: i64 = sqlx::query_scalar(
            "SELECT IFNULL((SELECT turns FROM visitor_usage WHERE visitor_id = ?), 0)",
        )
        .bind(visitor_id)
        .fetch_one(&mut *tx)
        .await?;
        let turns = saturating_u32(turns);

        if turns >= limits.visitor_limit {
            // Visitors have one rolling counter; report it on both axes.
            return Ok(QuotaDecision::denied(QuotaDenyReason::LimitReached).with_counts(
                turns,
                turns,
                limits.visitor_limit,
                limits.visitor_limit,
            ));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO visitor_usage (visitor_id, turns, first_seen_at, last_seen_at)
             VALUES (?, 1, ?, ?)
             ON CONFLICT(visitor_id)
             DO UPDATE SET turns = turns + 1, last_seen_at = excluded.last_seen_at",
        )
        .bind(visitor_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(QuotaDecision::allowed(
            turns + 1,
            turns + 1,
            limits.visitor_limit,
            limits.visitor_limit,
        ))
    }
}

#[async_trait::async_trait]
impl TurnQuota for SqlTurnQuota {
    async fn consume(
        &self,
        identity: &Identity,
        chat_id: &str,
        limits: QuotaLimits,
        today: NaiveDate,
    ) -> Result<QuotaDecision, RepositoryError> {
        match identity {
            Identity::Account { account_id } => {
                self.consume_account(account_id, chat_id, limits, today).await
            }
            Identity::Visitor { visitor_id } => self.consume_visitor(visitor_id, limits).await,
        }
    }
}

fn saturating_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(if value < 0 { 0 } else { u32::MAX })
}
