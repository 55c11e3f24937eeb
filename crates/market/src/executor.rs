//! The one search entry point the conversation loop sees. Prefers the
//! semantic path when it is configured and falls back to scraping listing
//! pages; infrastructure trouble degrades to an empty page instead of
//! failing the turn.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trove_core::config::{MarketConfig, SemanticConfig};
use trove_core::Candidate;

use crate::client::MarketClient;
use crate::errors::MarketError;
use crate::listing::{parse_listing_page, parse_vector_rows};
use crate::retry::{retry_with_timeout, RetryError};
use crate::semantic::SemanticClient;

/// One page of results in uniform candidate shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchPage {
    pub candidates: Vec<Candidate>,
    pub has_next_page: bool,
}

/// Candidate lookup by keyword. Tests script this directly; production uses
/// [`SearchExecutor`].
#[async_trait]
pub trait ItemSearch: Send + Sync {
    async fn search(
        &self,
        keyword: &str,
        page: u32,
        token: &CancellationToken,
    ) -> Result<SearchPage, MarketError>;
}

pub struct SearchExecutor {
    market: MarketClient,
    semantic: Option<SemanticClient>,
    page_size: u32,
    min_score: f32,
    full_page_threshold: usize,
    prefer_semantic: bool,
    base_url: String,
    listing_timeout: Duration,
}

impl SearchExecutor {
    pub fn new(market_config: &MarketConfig, semantic_config: &SemanticConfig) -> Self {
        let semantic = if semantic_config.enabled {
            Some(SemanticClient::new(semantic_config))
        } else {
            None
        };

        Self {
            market: MarketClient::new(market_config),
            semantic,
            page_size: market_config.page_size,
            min_score: semantic_config.min_score,
            full_page_threshold: market_config.full_page_threshold,
            prefer_semantic: market_config.prefer_semantic,
            base_url: market_config.base_url.trim_end_matches('/').to_string(),
            listing_timeout: Duration::from_secs(market_config.timeout_secs),
        }
    }

    /// `Ok(None)` means the vector store had nothing for this query, which
    /// sends the caller to the scrape path.
    async fn semantic_page(
        &self,
        semantic: &SemanticClient,
        keyword: &str,
        page: u32,
        token: &CancellationToken,
    ) -> Result<Option<SearchPage>, MarketError> {
        let vector = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(MarketError::Cancelled),
            vector = semantic.embed(keyword) => vector?,
        };
        if vector.is_empty() {
            return Err(MarketError::Malformed("embedding vector was empty".to_string()));
        }

        let offset = u64::from(page - 1) * u64::from(self.page_size);
        let rows = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(MarketError::Cancelled),
            rows = semantic.search(&vector, self.page_size, offset, self.min_score) => rows?,
        };
        if rows.is_empty() {
            return Ok(None);
        }

        let has_next_page = rows.len() >= self.page_size as usize;
        let candidates = parse_vector_rows(&rows, &self.base_url);
        Ok(Some(SearchPage { candidates, has_next_page }))
    }

    async fn scrape_page(
        &self,
        keyword: &str,
        page: u32,
        token: &CancellationToken,
    ) -> Result<SearchPage, MarketError> {
        let html = match retry_with_timeout("listing_scrape", 1, self.listing_timeout, token, || {
            self.market.fetch_listing_page(keyword, page)
        })
        .await
        {
            Ok(html) => html,
            Err(RetryError::Cancelled) => return Err(MarketError::Cancelled),
            Err(RetryError::Exhausted { .. }) => {
                warn!(keyword, page, "listing scrape failed, returning an empty page");
                return Ok(SearchPage::default());
            }
        };

        let candidates = parse_listing_page(&html, &self.base_url);
        // Raw card count decides paging; enrichment may not change it but
        // the original scrape is what reflects a full page.
        let raw_count = candidates.len();
        let candidates = self.market.enrich_all(candidates, token).await;
        if token.is_cancelled() {
            return Err(MarketError::Cancelled);
        }

        Ok(SearchPage { candidates, has_next_page: raw_count >= self.full_page_threshold })
    }
}

#[async_trait]
impl ItemSearch for SearchExecutor {
    async fn search(
        &self,
        keyword: &str,
        page: u32,
        token: &CancellationToken,
    ) -> Result<SearchPage, MarketError> {
        let page = page.max(1);

        if self.prefer_semantic {
            if let Some(semantic) = &self.semantic {
                match self.semantic_page(semantic, keyword, page, token).await {
                    Ok(Some(found)) => return Ok(found),
                    Ok(None) => {
                        debug!(keyword, "semantic search had no rows, scraping instead");
                    }
                    Err(MarketError::Cancelled) => return Err(MarketError::Cancelled),
                    Err(error) => {
                        warn!(keyword, error = %error, "semantic search failed, scraping instead");
                    }
                }
            }
        }

        self.scrape_page(keyword, page, token).await
    }
}
