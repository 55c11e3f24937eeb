use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use trove_agent::{AgentRuntime, HttpLlmClient, LlmClient};
use trove_core::config::{AppConfig, ConfigError, LoadOptions};
use trove_core::TokenVerifier;
use trove_db::{connect_with_settings, migrations, DbPool, SqlConversationStore, SqlTurnQuota};
use trove_market::{ItemSearch, SearchExecutor};

use crate::chat::{BackendEndpoints, ChatState};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub chat_state: ChatState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Entry for callers that already loaded (and logged against) the config.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let chat_state = build_chat_state(&config, &db_pool);
    info!(
        event_name = "system.bootstrap.ready",
        model = %config.llm.model,
        semantic = config.semantic.enabled,
        "turn pipeline assembled"
    );

    Ok(Application { config, db_pool, chat_state })
}

/// Wires the turn pipeline out of config: model client, marketplace search,
/// token verifier, and the sqlite-backed quota gate and transcript store.
pub fn build_chat_state(config: &AppConfig, db_pool: &DbPool) -> ChatState {
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&config.llm));
    let search: Arc<dyn ItemSearch> =
        Arc::new(SearchExecutor::new(&config.market, &config.semantic));
    let runtime = AgentRuntime::new(Arc::clone(&llm), search, &config.llm, &config.agent);

    ChatState {
        verifier: TokenVerifier::new(
            config.auth.token_secret.clone(),
            config.auth.token_max_age_secs,
        ),
        limits: config.quota.limits(),
        quota: Arc::new(SqlTurnQuota::new(db_pool.clone())),
        store: Arc::new(SqlConversationStore::new(db_pool.clone())),
        runtime: Arc::new(runtime),
        endpoints: BackendEndpoints {
            llm_base_url: config.llm.base_url.clone(),
            market_base_url: config.market.base_url.clone(),
            semantic_enabled: config.semantic.enabled
                && !config.semantic.search_url.trim().is_empty(),
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use trove_core::config::{ConfigOverrides, LoadOptions};
    use trove_core::{Identity, Role};
    use trove_db::{ConversationStore, StoredMessage, TurnQuota};

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_fails_fast_on_an_unusable_token_secret() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                market_base_url: Some("http://market.test".to_string()),
                auth_token_secret: Some("short".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(result.is_err());
        let message = result.err().expect("error").to_string();
        assert!(message.contains("auth.token_secret"));
    }

    #[tokio::test]
    async fn integration_smoke_covers_startup_migrations_and_the_turn_data_path() {
        let app = bootstrap(valid_overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('chat_message', 'turn_usage', 'visitor_usage')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected foundation tables to be available after bootstrap");
        assert_eq!(table_count, 3, "bootstrap should expose the turn-path tables");

        // The wired state reaches the same database: a consumed turn and an
        // appended transcript round-trip through the handles it carries.
        let identity = Identity::Account { account_id: "acct-boot".to_string() };
        let decision = app
            .chat_state
            .quota
            .consume(&identity, "chat-boot", app.chat_state.limits, Utc::now().date_naive())
            .await
            .expect("quota consume");
        assert!(decision.allowed);
        assert_eq!(decision.session_count, Some(1));

        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            text: "smoke".to_string(),
            image_ref: None,
            items: None,
            created_at: Utc::now(),
        };
        app.chat_state.store.append("chat-boot", &[message]).await.expect("append");
        let history = app.chat_state.store.history("chat-boot").await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "smoke");

        app.db_pool.close().await;
    }

    fn valid_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                market_base_url: Some("http://market.test".to_string()),
                auth_token_secret: Some("a-test-secret-of-reasonable-length".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }
}
