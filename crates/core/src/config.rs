use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::quota::QuotaLimits;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub semantic: SemanticConfig,
    pub market: MarketConfig,
    pub agent: AgentConfig,
    pub quota: QuotaConfig,
    pub auth: AuthConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Embedding + vector-search pair. Optional: when disabled, every search
/// goes through the listing-page scrape path.
#[derive(Clone, Debug)]
pub struct SemanticConfig {
    pub enabled: bool,
    pub embedding_url: String,
    pub embedding_model: String,
    pub search_url: String,
    pub collection: String,
    pub api_key: Option<SecretString>,
    pub min_score: f32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MarketConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub detail_timeout_secs: u64,
    pub page_size: u32,
    pub enrich_batch_size: usize,
    /// Raw listing count at or above which a scraped page is considered
    /// full, i.e. another page probably exists. Marketplace-specific.
    pub full_page_threshold: usize,
    pub prefer_semantic: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct AgentConfig {
    /// Search/select cycles allowed per request.
    pub max_steps: u32,
    /// Picks at which the loop stops searching and answers.
    pub need_min: usize,
    /// Hard cap on picks accepted from a single select decision.
    pub max_pick: usize,
    /// Transcript turns kept when building decision context.
    pub history_window: usize,
    /// Candidates shown to the model per decision.
    pub max_candidate_payload: usize,
    /// Exclusion/picked ids serialized into a prompt.
    pub max_id_payload: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct QuotaConfig {
    pub session_limit: u32,
    pub daily_limit: u32,
    pub visitor_limit: u32,
}

impl QuotaConfig {
    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            session_limit: self.session_limit,
            daily_limit: self.daily_limit,
            visitor_limit: self.visitor_limit,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub token_secret: SecretString,
    pub token_max_age_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub market_base_url: Option<String>,
    pub semantic_enabled: Option<bool>,
    pub auth_token_secret: Option<String>,
    pub quota_session_limit: Option<u32>,
    pub quota_daily_limit: Option<u32>,
    pub quota_visitor_limit: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://trove.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                base_url: "http://localhost:11434/v1".to_string(),
                api_key: None,
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 3,
            },
            semantic: SemanticConfig {
                enabled: false,
                embedding_url: String::new(),
                embedding_model: "text-embedding-3-small".to_string(),
                search_url: String::new(),
                collection: "listings".to_string(),
                api_key: None,
                min_score: 0.45,
                timeout_secs: 12,
            },
            market: MarketConfig {
                base_url: String::new(),
                timeout_secs: 15,
                detail_timeout_secs: 12,
                page_size: 40,
                enrich_batch_size: 15,
                full_page_threshold: 60,
                prefer_semantic: true,
            },
            agent: AgentConfig {
                max_steps: 4,
                need_min: 5,
                max_pick: 15,
                history_window: 18,
                max_candidate_payload: 80,
                max_id_payload: 200,
            },
            quota: QuotaConfig { session_limit: 30, daily_limit: 100, visitor_limit: 15 },
            auth: AuthConfig {
                token_secret: String::new().into(),
                token_max_age_secs: 2_592_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("trove.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(semantic) = patch.semantic {
            if let Some(enabled) = semantic.enabled {
                self.semantic.enabled = enabled;
            }
            if let Some(embedding_url) = semantic.embedding_url {
                self.semantic.embedding_url = embedding_url;
            }
            if let Some(embedding_model) = semantic.embedding_model {
                self.semantic.embedding_model = embedding_model;
            }
            if let Some(search_url) = semantic.search_url {
                self.semantic.search_url = search_url;
            }
            if let Some(collection) = semantic.collection {
                self.semantic.collection = collection;
            }
            if let Some(semantic_api_key_value) = semantic.api_key {
                self.semantic.api_key = Some(secret_value(semantic_api_key_value));
            }
            if let Some(min_score) = semantic.min_score {
                self.semantic.min_score = min_score;
            }
            if let Some(timeout_secs) = semantic.timeout_secs {
                self.semantic.timeout_secs = timeout_secs;
            }
        }

        if let Some(market) = patch.market {
            if let Some(base_url) = market.base_url {
                self.market.base_url = base_url;
            }
            if let Some(timeout_secs) = market.timeout_secs {
                self.market.timeout_secs = timeout_secs;
            }
            if let Some(detail_timeout_secs) = market.detail_timeout_secs {
                self.market.detail_timeout_secs = detail_timeout_secs;
            }
            if let Some(page_size) = market.page_size {
                self.market.page_size = page_size;
            }
            if let Some(enrich_batch_size) = market.enrich_batch_size {
                self.market.enrich_batch_size = enrich_batch_size;
            }
            if let Some(full_page_threshold) = market.full_page_threshold {
                self.market.full_page_threshold = full_page_threshold;
            }
            if let Some(prefer_semantic) = market.prefer_semantic {
                self.market.prefer_semantic = prefer_semantic;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_steps) = agent.max_steps {
                self.agent.max_steps = max_steps;
            }
            if let Some(need_min) = agent.need_min {
                self.agent.need_min = need_min;
            }
            if let Some(max_pick) = agent.max_pick {
                self.agent.max_pick = max_pick;
            }
            if let Some(history_window) = agent.history_window {
                self.agent.history_window = history_window;
            }
            if let Some(max_candidate_payload) = agent.max_candidate_payload {
                self.agent.max_candidate_payload = max_candidate_payload;
            }
            if let Some(max_id_payload) = agent.max_id_payload {
                self.agent.max_id_payload = max_id_payload;
            }
        }

        if let Some(quota) = patch.quota {
            if let Some(session_limit) = quota.session_limit {
                self.quota.session_limit = session_limit;
            }
            if let Some(daily_limit) = quota.daily_limit {
                self.quota.daily_limit = daily_limit;
            }
            if let Some(visitor_limit) = quota.visitor_limit {
                self.quota.visitor_limit = visitor_limit;
            }
        }

        if let Some(auth) = patch.auth {
            if let Some(token_secret_value) = auth.token_secret {
                self.auth.token_secret = secret_value(token_secret_value);
            }
            if let Some(token_max_age_secs) = auth.token_max_age_secs {
                self.auth.token_max_age_secs = token_max_age_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TROVE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TROVE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("TROVE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TROVE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TROVE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TROVE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("TROVE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TROVE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("TROVE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("TROVE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TROVE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("TROVE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("TROVE_SEMANTIC_ENABLED") {
            self.semantic.enabled = parse_bool("TROVE_SEMANTIC_ENABLED", &value)?;
        }
        if let Some(value) = read_env("TROVE_SEMANTIC_EMBEDDING_URL") {
            self.semantic.embedding_url = value;
        }
        if let Some(value) = read_env("TROVE_SEMANTIC_EMBEDDING_MODEL") {
            self.semantic.embedding_model = value;
        }
        if let Some(value) = read_env("TROVE_SEMANTIC_SEARCH_URL") {
            self.semantic.search_url = value;
        }
        if let Some(value) = read_env("TROVE_SEMANTIC_COLLECTION") {
            self.semantic.collection = value;
        }
        if let Some(value) = read_env("TROVE_SEMANTIC_API_KEY") {
            self.semantic.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TROVE_SEMANTIC_MIN_SCORE") {
            self.semantic.min_score = parse_f32("TROVE_SEMANTIC_MIN_SCORE", &value)?;
        }
        if let Some(value) = read_env("TROVE_SEMANTIC_TIMEOUT_SECS") {
            self.semantic.timeout_secs = parse_u64("TROVE_SEMANTIC_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TROVE_MARKET_BASE_URL") {
            self.market.base_url = value;
        }
        if let Some(value) = read_env("TROVE_MARKET_TIMEOUT_SECS") {
            self.market.timeout_secs = parse_u64("TROVE_MARKET_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TROVE_MARKET_DETAIL_TIMEOUT_SECS") {
            self.market.detail_timeout_secs =
                parse_u64("TROVE_MARKET_DETAIL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TROVE_MARKET_PAGE_SIZE") {
            self.market.page_size = parse_u32("TROVE_MARKET_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("TROVE_MARKET_ENRICH_BATCH_SIZE") {
            self.market.enrich_batch_size = parse_usize("TROVE_MARKET_ENRICH_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("TROVE_MARKET_FULL_PAGE_THRESHOLD") {
            self.market.full_page_threshold =
                parse_usize("TROVE_MARKET_FULL_PAGE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("TROVE_MARKET_PREFER_SEMANTIC") {
            self.market.prefer_semantic = parse_bool("TROVE_MARKET_PREFER_SEMANTIC", &value)?;
        }

        if let Some(value) = read_env("TROVE_AGENT_MAX_STEPS") {
            self.agent.max_steps = parse_u32("TROVE_AGENT_MAX_STEPS", &value)?;
        }
        if let Some(value) = read_env("TROVE_AGENT_NEED_MIN") {
            self.agent.need_min = parse_usize("TROVE_AGENT_NEED_MIN", &value)?;
        }
        if let Some(value) = read_env("TROVE_AGENT_MAX_PICK") {
            self.agent.max_pick = parse_usize("TROVE_AGENT_MAX_PICK", &value)?;
        }
        if let Some(value) = read_env("TROVE_AGENT_HISTORY_WINDOW") {
            self.agent.history_window = parse_usize("TROVE_AGENT_HISTORY_WINDOW", &value)?;
        }
        if let Some(value) = read_env("TROVE_AGENT_MAX_CANDIDATE_PAYLOAD") {
            self.agent.max_candidate_payload =
                parse_usize("TROVE_AGENT_MAX_CANDIDATE_PAYLOAD", &value)?;
        }
        if let Some(value) = read_env("TROVE_AGENT_MAX_ID_PAYLOAD") {
            self.agent.max_id_payload = parse_usize("TROVE_AGENT_MAX_ID_PAYLOAD", &value)?;
        }

        if let Some(value) = read_env("TROVE_QUOTA_SESSION_LIMIT") {
            self.quota.session_limit = parse_u32("TROVE_QUOTA_SESSION_LIMIT", &value)?;
        }
        if let Some(value) = read_env("TROVE_QUOTA_DAILY_LIMIT") {
            self.quota.daily_limit = parse_u32("TROVE_QUOTA_DAILY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("TROVE_QUOTA_VISITOR_LIMIT") {
            self.quota.visitor_limit = parse_u32("TROVE_QUOTA_VISITOR_LIMIT", &value)?;
        }

        if let Some(value) = read_env("TROVE_AUTH_TOKEN_SECRET") {
            self.auth.token_secret = secret_value(value);
        }
        if let Some(value) = read_env("TROVE_AUTH_TOKEN_MAX_AGE_SECS") {
            self.auth.token_max_age_secs = parse_u64("TROVE_AUTH_TOKEN_MAX_AGE_SECS", &value)?;
        }

        if let Some(value) = read_env("TROVE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TROVE_SERVER_PORT") {
            self.server.port = parse_u16("TROVE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("TROVE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TROVE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("TROVE_LOGGING_LEVEL").or_else(|| read_env("TROVE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("TROVE_LOGGING_FORMAT").or_else(|| read_env("TROVE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = llm_base_url;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(market_base_url) = overrides.market_base_url {
            self.market.base_url = market_base_url;
        }
        if let Some(semantic_enabled) = overrides.semantic_enabled {
            self.semantic.enabled = semantic_enabled;
        }
        if let Some(auth_token_secret) = overrides.auth_token_secret {
            self.auth.token_secret = secret_value(auth_token_secret);
        }
        if let Some(session_limit) = overrides.quota_session_limit {
            self.quota.session_limit = session_limit;
        }
        if let Some(daily_limit) = overrides.quota_daily_limit {
            self.quota.daily_limit = daily_limit;
        }
        if let Some(visitor_limit) = overrides.quota_visitor_limit {
            self.quota.visitor_limit = visitor_limit;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_semantic(&self.semantic)?;
        validate_market(&self.market)?;
        validate_agent(&self.agent)?;
        validate_quota(&self.quota)?;
        validate_auth(&self.auth)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("trove.toml"), PathBuf::from("config/trove.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if !is_http_url(&llm.base_url) {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }
    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if llm.max_retries == 0 || llm.max_retries > 10 {
        return Err(ConfigError::Validation("llm.max_retries must be in range 1..=10".to_string()));
    }

    Ok(())
}

fn validate_semantic(semantic: &SemanticConfig) -> Result<(), ConfigError> {
    if !semantic.enabled {
        return Ok(());
    }

    if !is_http_url(&semantic.embedding_url) {
        return Err(ConfigError::Validation(
            "semantic.embedding_url must start with http:// or https:// when semantic.enabled"
                .to_string(),
        ));
    }
    if !is_http_url(&semantic.search_url) {
        return Err(ConfigError::Validation(
            "semantic.search_url must start with http:// or https:// when semantic.enabled"
                .to_string(),
        ));
    }
    if semantic.collection.trim().is_empty() {
        return Err(ConfigError::Validation(
            "semantic.collection must not be empty when semantic.enabled".to_string(),
        ));
    }
    if semantic.embedding_model.trim().is_empty() {
        return Err(ConfigError::Validation(
            "semantic.embedding_model must not be empty when semantic.enabled".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&semantic.min_score) {
        return Err(ConfigError::Validation(
            "semantic.min_score must be in range 0.0..=1.0".to_string(),
        ));
    }
    if semantic.timeout_secs == 0 || semantic.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "semantic.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_market(market: &MarketConfig) -> Result<(), ConfigError> {
    if !is_http_url(&market.base_url) {
        return Err(ConfigError::Validation(
            "market.base_url is required and must start with http:// or https://".to_string(),
        ));
    }
    if market.timeout_secs == 0 || market.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "market.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if market.detail_timeout_secs == 0 || market.detail_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "market.detail_timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if market.page_size == 0 || market.page_size > 200 {
        return Err(ConfigError::Validation(
            "market.page_size must be in range 1..=200".to_string(),
        ));
    }
    if market.enrich_batch_size == 0 || market.enrich_batch_size > 64 {
        return Err(ConfigError::Validation(
            "market.enrich_batch_size must be in range 1..=64".to_string(),
        ));
    }
    if market.full_page_threshold == 0 {
        return Err(ConfigError::Validation(
            "market.full_page_threshold must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_steps == 0 || agent.max_steps > 16 {
        return Err(ConfigError::Validation("agent.max_steps must be in range 1..=16".to_string()));
    }
    if agent.need_min == 0 {
        return Err(ConfigError::Validation(
            "agent.need_min must be greater than zero".to_string(),
        ));
    }
    if agent.max_pick < agent.need_min {
        return Err(ConfigError::Validation(
            "agent.max_pick must be at least agent.need_min".to_string(),
        ));
    }
    if agent.history_window < 2 {
        return Err(ConfigError::Validation(
            "agent.history_window must be at least 2".to_string(),
        ));
    }
    if agent.max_candidate_payload < agent.max_pick {
        return Err(ConfigError::Validation(
            "agent.max_candidate_payload must be at least agent.max_pick".to_string(),
        ));
    }
    if agent.max_id_payload == 0 {
        return Err(ConfigError::Validation(
            "agent.max_id_payload must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_quota(quota: &QuotaConfig) -> Result<(), ConfigError> {
    if quota.session_limit == 0 {
        return Err(ConfigError::Validation(
            "quota.session_limit must be greater than zero".to_string(),
        ));
    }
    if quota.daily_limit < quota.session_limit {
        return Err(ConfigError::Validation(
            "quota.daily_limit must be at least quota.session_limit".to_string(),
        ));
    }
    if quota.visitor_limit == 0 {
        return Err(ConfigError::Validation(
            "quota.visitor_limit must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_auth(auth: &AuthConfig) -> Result<(), ConfigError> {
    let secret = auth.token_secret.expose_secret();
    if secret.trim().is_empty() {
        return Err(ConfigError::Validation(
            "auth.token_secret is required. Use the same secret the account system signs bearer tokens with".to_string(),
        ));
    }
    if secret.len() < 16 {
        return Err(ConfigError::Validation(
            "auth.token_secret must be at least 16 characters".to_string(),
        ));
    }
    if auth.token_max_age_secs == 0 {
        return Err(ConfigError::Validation(
            "auth.token_max_age_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn is_http_url(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("http://") || value.starts_with("https://")
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    semantic: Option<SemanticPatch>,
    market: Option<MarketPatch>,
    agent: Option<AgentPatch>,
    quota: Option<QuotaPatch>,
    auth: Option<AuthPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SemanticPatch {
    enabled: Option<bool>,
    embedding_url: Option<String>,
    embedding_model: Option<String>,
    search_url: Option<String>,
    collection: Option<String>,
    api_key: Option<String>,
    min_score: Option<f32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MarketPatch {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    detail_timeout_secs: Option<u64>,
    page_size: Option<u32>,
    enrich_batch_size: Option<usize>,
    full_page_threshold: Option<usize>,
    prefer_semantic: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_steps: Option<u32>,
    need_min: Option<usize>,
    max_pick: Option<usize>,
    history_window: Option<usize>,
    max_candidate_payload: Option<usize>,
    max_id_payload: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct QuotaPatch {
    session_limit: Option<u32>,
    daily_limit: Option<u32>,
    visitor_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthPatch {
    token_secret: Option<String>,
    token_max_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
