use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use trove_core::config::MarketConfig;
use trove_core::{Candidate, PriceVariation};

use crate::batch::run_batches;
use crate::errors::MarketError;

/// Detail-endpoint payload. Every field is optional; a sparse detail page
/// still merges cleanly into its listing candidate.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDetail {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub variations: Vec<PriceVariation>,
}

/// HTTP access to the marketplace itself: listing-search pages as HTML and
/// the per-item detail endpoint as JSON.
#[derive(Clone)]
pub struct MarketClient {
    http: Client,
    base_url: String,
    listing_timeout: Duration,
    detail_timeout: Duration,
    enrich_batch_size: usize,
}

impl MarketClient {
    pub fn new(config: &MarketConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            listing_timeout: Duration::from_secs(config.timeout_secs),
            detail_timeout: Duration::from_secs(config.detail_timeout_secs),
            enrich_batch_size: config.enrich_batch_size,
        }
    }

    /// Raw HTML of one listing-search page. Pages are 1-based.
    pub async fn fetch_listing_page(
        &self,
        keyword: &str,
        page: u32,
    ) -> Result<String, MarketError> {
        let url = format!(
            "{}/search?q={}&page={}",
            self.base_url,
            urlencoding::encode(keyword),
            page.max(1)
        );
        let response = self.http.get(&url).timeout(self.listing_timeout).send().await?;
        if !response.status().is_success() {
            return Err(MarketError::Status { status: response.status().as_u16() });
        }
        Ok(response.text().await?)
    }

    pub async fn fetch_detail(&self, id: &str) -> Result<ItemDetail, MarketError> {
        let url = format!("{}/api/items/{}", self.base_url, urlencoding::encode(id));
        let response = self.http.get(&url).timeout(self.detail_timeout).send().await?;
        if !response.status().is_success() {
            return Err(MarketError::Status { status: response.status().as_u16() });
        }
        Ok(response.json().await?)
    }

    /// Enriches scraped candidates with detail-page data,
    /// `enrich_batch_size` fetches at a time. A failed or cancelled fetch
    /// leaves that candidate as scraped; enrichment never fails a search.
    pub async fn enrich_all(
        &self,
        candidates: Vec<Candidate>,
        token: &CancellationToken,
    ) -> Vec<Candidate> {
        let batch_size = self.enrich_batch_size;
        let client = self.clone();
        let token = token.clone();
        run_batches(candidates, batch_size, move |candidate| {
            let client = client.clone();
            let token = token.clone();
            async move { client.enrich(candidate, &token).await }
        })
        .await
    }

    async fn enrich(&self, mut candidate: Candidate, token: &CancellationToken) -> Candidate {
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => return candidate,
            fetched = self.fetch_detail(&candidate.id) => fetched,
        };
        match fetched {
            Ok(detail) => {
                candidate.merge_detail(detail.description, detail.tags, detail.variations);
            }
            Err(error) => {
                debug!(item = %candidate.id, error = %error, "detail fetch failed");
            }
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use trove_core::config::MarketConfig;
    use trove_core::Candidate;

    use super::MarketClient;
    use crate::errors::MarketError;
    use crate::fixtures::FixtureServer;

    fn market_config(base_url: &str) -> MarketConfig {
        MarketConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            detail_timeout_secs: 5,
            page_size: 40,
            enrich_batch_size: 4,
            full_page_threshold: 60,
            prefer_semantic: false,
        }
    }

    fn listing_candidate(id: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            title: format!("Item {id}"),
            shop_name: "FixtureShop".to_string(),
            price: "10.00".to_string(),
            url: format!("https://market.example/item/{id}"),
            image_url: None,
            description: String::new(),
            tags: Vec::new(),
            variations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn listing_fetch_encodes_the_query_and_clamps_the_page() {
        let server =
            FixtureServer::start(|path, _| (200, "text/html".to_string(), path.to_string())).await;
        let client = MarketClient::new(&market_config(server.base_url()));

        let html = client.fetch_listing_page("ceramic mug", 0).await.expect("listing fetch");
        assert_eq!(html, "/search?q=ceramic%20mug&page=1");
    }

    #[tokio::test]
    async fn listing_fetch_surfaces_error_statuses() {
        let server =
            FixtureServer::start(|_, _| (503, "text/html".to_string(), "down".to_string())).await;
        let client = MarketClient::new(&market_config(server.base_url()));

        let error = client.fetch_listing_page("mug", 1).await.expect_err("non-success status");
        assert!(matches!(error, MarketError::Status { status: 503 }));
    }

    #[tokio::test]
    async fn enrichment_merges_details_and_tolerates_failures() {
        let server = FixtureServer::start(|path, _| match path {
            "/api/items/itm-1" => (
                200,
                "application/json".to_string(),
                concat!(
                    r#"{"description":"Hand thrown in small batches.","tags":["ceramic"],"#,
                    r#""variations":[{"name":"Small","price":"10.00"},{"name":"Large","price":"14.00"}]}"#,
                )
                .to_string(),
            ),
            _ => (500, "application/json".to_string(), "{}".to_string()),
        })
        .await;

        let client = MarketClient::new(&market_config(server.base_url()));
        let token = CancellationToken::new();
        let enriched = client
            .enrich_all(vec![listing_candidate("itm-1"), listing_candidate("itm-2")], &token)
            .await;

        assert_eq!(enriched.len(), 2);
        assert_eq!(enriched[0].description, "Hand thrown in small batches.");
        assert_eq!(enriched[0].price, "10.00 ~ 14.00");
        assert_eq!(enriched[1].description, "");
        assert_eq!(enriched[1].price, "10.00");
    }

    #[tokio::test]
    async fn cancelled_enrichment_returns_candidates_as_scraped() {
        let server = FixtureServer::start(|_, _| {
            (200, "application/json".to_string(), r#"{"description":"late"}"#.to_string())
        })
        .await;

        let client = MarketClient::new(&market_config(server.base_url()));
        let token = CancellationToken::new();
        token.cancel();

        let enriched = client.enrich_all(vec![listing_candidate("itm-9")], &token).await;
        assert_eq!(enriched[0].description, "");
    }
}
