//! Model backend access. One trait with a buffered call for decisions and a
//! chunked call for narrative replies, plus the OpenAI-compatible HTTP
//! implementation used in production.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use trove_core::config::LlmConfig;

/// One model invocation. `user` is the rendered prompt body; `image_ref` is
/// attached as multimodal content when present.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub image_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Http(reqwest::Error),
    #[error("model endpoint returned status {status}")]
    Status { status: u16 },
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("model call cancelled")]
    Cancelled,
    #[error("model call timed out")]
    Timeout,
}

/// The conversation loop's view of the model. `complete` returns the whole
/// answer at once; `stream` delivers narrative chunks through the channel in
/// generation order and returns once the model is done.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        request: ChatRequest,
        token: &CancellationToken,
    ) -> Result<String, LlmError>;

    async fn stream(
        &self,
        request: ChatRequest,
        token: &CancellationToken,
        chunks: mpsc::Sender<String>,
    ) -> Result<(), LlmError>;
}

/// OpenAI-compatible chat-completions client. The streaming path parses
/// `data:` SSE lines incrementally off the byte stream, carrying partial
/// lines across chunk boundaries.
pub struct HttpLlmClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn request_payload(&self, request: &ChatRequest, stream: bool) -> Value {
        let user_content = match &request.image_ref {
            Some(image) => json!([
                { "type": "text", "text": request.user },
                { "type": "image_url", "image_url": { "url": image } },
            ]),
            None => Value::String(request.user.clone()),
        };
        json!({
            "model": self.model,
            "stream": stream,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content },
            ],
        })
    }

    async fn send(
        &self,
        payload: &Value,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.http.post(&url).timeout(self.timeout).json(payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(LlmError::Cancelled),
            response = builder.send() => response.map_err(transport_error)?,
        };
        if !response.status().is_success() {
            return Err(LlmError::Status { status: response.status().as_u16() });
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(
        &self,
        request: ChatRequest,
        token: &CancellationToken,
    ) -> Result<String, LlmError> {
        let payload = self.request_payload(&request, false);
        let response = self.send(&payload, token).await?;

        let body: Value = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(LlmError::Cancelled),
            body = response.json() => body.map_err(transport_error)?,
        };
        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LlmError::Malformed("completion had no choices[0].message.content".to_string())
            })?;
        Ok(content.to_string())
    }

    async fn stream(
        &self,
        request: ChatRequest,
        token: &CancellationToken,
        chunks: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        let payload = self.request_payload(&request, true);
        let response = self.send(&payload, token).await?;

        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(LlmError::Cancelled),
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk.map_err(transport_error)?));

            while let Some(end) = buffer.find('\n') {
                let line: String = buffer[..end].to_string();
                buffer.drain(..=end);
                match parse_sse_line(line.trim())? {
                    SseLine::Done => return Ok(()),
                    SseLine::Delta(text) => {
                        if chunks.send(text).await.is_err() {
                            // The forwarder hung up, nobody wants the rest.
                            return Err(LlmError::Cancelled);
                        }
                    }
                    SseLine::Skip => {}
                }
            }
        }

        Ok(())
    }
}

enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let event: Value = serde_json::from_str(data)
        .map_err(|error| LlmError::Malformed(format!("bad stream event: {error}")))?;
    let delta = event
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if delta.is_empty() {
        // Role announcements and finish markers carry no text.
        return Ok(SseLine::Skip);
    }
    Ok(SseLine::Delta(delta.to_string()))
}

fn transport_error(error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Http(error)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use trove_core::config::LlmConfig;
    use trove_market::fixtures::FixtureServer;

    use super::{ChatRequest, HttpLlmClient, LlmClient, LlmError};

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            base_url: base_url.to_string(),
            api_key: None,
            model: "test-model".to_string(),
            timeout_secs: 5,
            max_retries: 3,
        }
    }

    fn request(user: &str) -> ChatRequest {
        ChatRequest {
            system: "You pick marketplace items.".to_string(),
            user: user.to_string(),
            image_ref: None,
        }
    }

    #[tokio::test]
    async fn complete_extracts_the_first_choice() {
        let server = FixtureServer::start(|path, body| {
            if path != "/chat/completions" || !body.contains("\"model\":\"test-model\"") {
                return (404, "application/json".to_string(), "{}".to_string());
            }
            (
                200,
                "application/json".to_string(),
                r#"{"choices":[{"message":{"role":"assistant","content":"{\"action\":\"reply\"}"}}]}"#
                    .to_string(),
            )
        })
        .await;

        let client = HttpLlmClient::new(&config(server.base_url()));
        let answer = client
            .complete(request("find mugs"), &CancellationToken::new())
            .await
            .expect("completion");
        assert_eq!(answer, r#"{"action":"reply"}"#);
    }

    #[tokio::test]
    async fn image_refs_become_multimodal_content() {
        let server = FixtureServer::start(|_, body| {
            if !body.contains("image_url") || !body.contains("https://img.example/ref-1.jpg") {
                return (400, "application/json".to_string(), "{}".to_string());
            }
            (
                200,
                "application/json".to_string(),
                r#"{"choices":[{"message":{"content":"seen"}}]}"#.to_string(),
            )
        })
        .await;

        let client = HttpLlmClient::new(&config(server.base_url()));
        let mut req = request("items like this");
        req.image_ref = Some("https://img.example/ref-1.jpg".to_string());
        let answer = client.complete(req, &CancellationToken::new()).await.expect("completion");
        assert_eq!(answer, "seen");
    }

    #[tokio::test]
    async fn non_success_statuses_surface_as_errors() {
        let server =
            FixtureServer::start(|_, _| (429, "application/json".to_string(), "{}".to_string()))
                .await;

        let client = HttpLlmClient::new(&config(server.base_url()));
        let error =
            client.complete(request("mugs"), &CancellationToken::new()).await.expect_err("status");
        assert!(matches!(error, LlmError::Status { status: 429 }));
    }

    #[tokio::test]
    async fn a_response_without_choices_is_malformed() {
        let server = FixtureServer::start(|_, _| {
            (200, "application/json".to_string(), r#"{"usage":{}}"#.to_string())
        })
        .await;

        let client = HttpLlmClient::new(&config(server.base_url()));
        let error = client
            .complete(request("mugs"), &CancellationToken::new())
            .await
            .expect_err("malformed");
        assert!(matches!(error, LlmError::Malformed(_)));
    }

    #[tokio::test]
    async fn stream_delivers_deltas_in_order_and_stops_at_done() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Here \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"you go.\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let server = FixtureServer::start(move |_, _| {
            (200, "text/event-stream".to_string(), sse.to_string())
        })
        .await;

        let client = HttpLlmClient::new(&config(server.base_url()));
        let (tx, mut rx) = mpsc::channel(16);
        client
            .stream(request("mugs"), &CancellationToken::new(), tx)
            .await
            .expect("streamed reply");

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.push(chunk);
        }
        assert_eq!(collected, vec!["Here ".to_string(), "you go.".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_the_request() {
        let server = FixtureServer::start(|_, _| {
            (200, "application/json".to_string(), "{}".to_string())
        })
        .await;
        let token = CancellationToken::new();
        token.cancel();

        let client = HttpLlmClient::new(&config(server.base_url()));
        let error = client.complete(request("mugs"), &token).await.expect_err("cancelled");
        assert!(matches!(error, LlmError::Cancelled));
    }
}
