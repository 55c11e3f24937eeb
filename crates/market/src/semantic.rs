use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use trove_core::config::SemanticConfig;

use crate::errors::MarketError;

/// The embedding endpoint plus the vector store it pairs with. Both calls
/// share one timeout and one optional bearer key.
#[derive(Clone)]
pub struct SemanticClient {
    http: Client,
    embedding_url: String,
    embedding_model: String,
    search_url: String,
    collection: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl SemanticClient {
    pub fn new(config: &SemanticConfig) -> Self {
        Self {
            http: Client::new(),
            embedding_url: config.embedding_url.trim_end_matches('/').to_string(),
            embedding_model: config.embedding_model.clone(),
            search_url: config.search_url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Embeds a search phrase into the collection's vector space.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, MarketError> {
        let mut request = self
            .http
            .post(&self.embedding_url)
            .timeout(self.timeout)
            .json(&json!({ "model": self.embedding_model, "input": text }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(MarketError::Status { status: response.status().as_u16() });
        }

        let payload: Value = response.json().await?;
        let embedding = payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.first())
            .and_then(|entry| entry.get("embedding"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                MarketError::Malformed("embedding response had no data[0].embedding".to_string())
            })?;

        Ok(embedding.iter().filter_map(Value::as_f64).map(|value| value as f32).collect())
    }

    /// Scored rows at or above `min_score`, paged by offset. Rows come back
    /// raw; normalization into candidates happens elsewhere.
    pub async fn search(
        &self,
        vector: &[f32],
        limit: u32,
        offset: u64,
        min_score: f32,
    ) -> Result<Vec<Value>, MarketError> {
        let url = format!("{}/collections/{}/points/search", self.search_url, self.collection);
        let mut request = self.http.post(&url).timeout(self.timeout).json(&json!({
            "vector": vector,
            "limit": limit,
            "offset": offset,
            "score_threshold": min_score,
            "with_payload": true,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(MarketError::Status { status: response.status().as_u16() });
        }

        let payload: Value = response.json().await?;
        match payload.get("result").and_then(Value::as_array) {
            Some(rows) => Ok(rows.clone()),
            None => {
                Err(MarketError::Malformed("vector search response had no result array".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::Value;
    use trove_core::config::SemanticConfig;

    use super::SemanticClient;
    use crate::errors::MarketError;
    use crate::fixtures::FixtureServer;

    fn semantic_config(base_url: &str) -> SemanticConfig {
        SemanticConfig {
            enabled: true,
            embedding_url: format!("{base_url}/v1/embeddings"),
            embedding_model: "test-embed".to_string(),
            search_url: base_url.to_string(),
            collection: "listings".to_string(),
            api_key: None,
            min_score: 0.45,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn embed_parses_the_first_embedding() {
        let server = FixtureServer::start(|path, _| match path {
            "/v1/embeddings" => (
                200,
                "application/json".to_string(),
                r#"{"data":[{"embedding":[0.25,-0.5,1.0]}]}"#.to_string(),
            ),
            _ => (404, "application/json".to_string(), "{}".to_string()),
        })
        .await;

        let client = SemanticClient::new(&semantic_config(server.base_url()));
        let vector = client.embed("stoneware mug").await.expect("embedding");
        assert_eq!(vector, vec![0.25_f32, -0.5, 1.0]);
    }

    #[tokio::test]
    async fn embed_rejects_a_payload_without_embeddings() {
        let server = FixtureServer::start(|_, _| {
            (200, "application/json".to_string(), r#"{"data":[]}"#.to_string())
        })
        .await;

        let client = SemanticClient::new(&semantic_config(server.base_url()));
        let error = client.embed("mug").await.expect_err("malformed payload");
        assert!(matches!(error, MarketError::Malformed(_)));
    }

    #[tokio::test]
    async fn search_sends_paging_and_threshold_and_unwraps_rows() {
        let captured = Arc::new(Mutex::new(String::new()));
        let server = FixtureServer::start({
            let captured = Arc::clone(&captured);
            move |path, body| {
                if path == "/collections/listings/points/search" {
                    *captured.lock().expect("capture lock") = body.to_string();
                    (
                        200,
                        "application/json".to_string(),
                        r#"{"result":[{"score":0.9,"payload":{"id":"itm-7"}}]}"#.to_string(),
                    )
                } else {
                    (404, "application/json".to_string(), "{}".to_string())
                }
            }
        })
        .await;

        let client = SemanticClient::new(&semantic_config(server.base_url()));
        let rows = client.search(&[0.1, 0.2], 40, 40, 0.45).await.expect("search rows");
        assert_eq!(rows.len(), 1);

        let body: Value = serde_json::from_str(&captured.lock().expect("capture lock"))
            .expect("captured body parses");
        assert_eq!(body["limit"], 40);
        assert_eq!(body["offset"], 40);
        assert_eq!(body["with_payload"], true);
        let threshold = body["score_threshold"].as_f64().expect("threshold present");
        assert!((threshold - 0.45).abs() < 1e-3);
    }

    #[tokio::test]
    async fn search_rejects_a_payload_without_result_rows() {
        let server = FixtureServer::start(|_, _| {
            (200, "application/json".to_string(), r#"{"status":"ok"}"#.to_string())
        })
        .await;

        let client = SemanticClient::new(&semantic_config(server.base_url()));
        let error = client.search(&[0.1], 10, 0, 0.5).await.expect_err("malformed payload");
        assert!(matches!(error, MarketError::Malformed(_)));
    }
}
