//! The chat endpoint: admission checks up front, then one assistant turn
//! streamed as plain text.
//!
//! Routes:
//! - `POST /chat` runs one turn; the response is a byte stream
//! - `GET /chat/{chat_id}/messages` returns the stored transcript as JSON
//!
//! Every way a request can be refused (shape, identity, configuration,
//! quota) is decided before the stream opens and returns structured JSON.
//! Once bytes are flowing the turn ends either normally or by client
//! disconnect; nothing in between surfaces as a protocol error.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use trove_agent::{AgentRuntime, ReplyStream, RuntimeError};
use trove_core::{
    ChatError, ChatMessage, ChatRequestError, Identity, IdentityError, QuotaDecision, QuotaLimits,
    Role, TokenVerifier,
};
use trove_db::{ConversationStore, StoredMessage, TurnQuota};

const VISITOR_HEADER: &str = "x-visitor-id";
const SESSION_COUNT_HEADER: &str = "x-session-turn-count";
const DAILY_COUNT_HEADER: &str = "x-daily-turn-count";
const SESSION_LIMIT_HEADER: &str = "x-session-turn-limit";
const DAILY_LIMIT_HEADER: &str = "x-daily-turn-limit";

/// Backpressure window between the agent loop and the HTTP response body.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Endpoints a turn cannot run without. Boot validation covers these for
/// the real server; re-checking per request keeps a hand-assembled state
/// from streaming against nothing.
#[derive(Clone)]
pub struct BackendEndpoints {
    pub llm_base_url: String,
    pub market_base_url: String,
    pub semantic_enabled: bool,
}

#[derive(Clone)]
pub struct ChatState {
    pub verifier: TokenVerifier,
    pub limits: QuotaLimits,
    pub quota: Arc<dyn TurnQuota>,
    pub store: Arc<dyn ConversationStore>,
    pub runtime: Arc<AgentRuntime>,
    pub endpoints: BackendEndpoints,
}

impl ChatState {
    fn ensure_configured(&self) -> Result<(), ChatError> {
        if !self.endpoints.llm_base_url.trim().starts_with("http") {
            return Err(ChatError::NotConfigured("llm.base_url".to_string()));
        }
        let market_ready = self.endpoints.market_base_url.trim().starts_with("http");
        if !market_ready && !self.endpoints.semantic_enabled {
            return Err(ChatError::NotConfigured(
                "market.base_url or semantic search".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/{chat_id}/messages", get(chat_history))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub chat_identifier: String,
    #[serde(default)]
    pub language_preference: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryResponse {
    pub chat_id: String,
    pub messages: Vec<ChatMessage>,
}

/// JSON body shared by every pre-stream rejection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u32>,
}

/// A request that never opened its stream. Renders as JSON with quota
/// telemetry headers whenever the gate produced counts.
#[derive(Debug)]
pub struct ChatRejection(pub ChatError);

impl ChatRejection {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ChatError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::NotConfigured(_) | ChatError::Dependency(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn body(&self) -> ChatErrorBody {
        let decision = match &self.0 {
            ChatError::QuotaExceeded { decision } => Some(decision),
            _ => None,
        };
        ChatErrorBody {
            error: self.0.user_message().to_string(),
            reason: Some(self.0.reason_code()),
            session_count: decision.and_then(|d| d.session_count),
            daily_count: decision.and_then(|d| d.daily_count),
            session_limit: decision.and_then(|d| d.session_limit),
            daily_limit: decision.and_then(|d| d.daily_limit),
        }
    }
}

impl IntoResponse for ChatRejection {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        if let ChatError::QuotaExceeded { decision } = self.0 {
            append_quota_headers(response.headers_mut(), &decision);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn chat(
    State(state): State<ChatState>,
    headers: HeaderMap,
    Json(request): Json<ChatTurnRequest>,
) -> Result<Response, ChatRejection> {
    let instruction = validate_request(&request)
        .map_err(|error| ChatRejection(ChatError::from(error)))?;

    let identity = resolve_identity(&headers, &state.verifier)
        .map_err(|error| ChatRejection(ChatError::from(error)))?;

    state.ensure_configured().map_err(ChatRejection)?;

    // One atomic check-and-increment per turn, before any model or market
    // work. A denial therefore costs this request nothing downstream.
    let chat_id = request.chat_identifier.trim().to_string();
    let decision = state
        .quota
        .consume(&identity, &chat_id, state.limits, Utc::now().date_naive())
        .await
        .map_err(|repo_error| {
            error!(
                event_name = "chat.quota.check_failed",
                chat_id = %chat_id,
                error = %repo_error,
                "quota check failed"
            );
            ChatRejection(ChatError::Dependency("turn quota store".to_string()))
        })?;
    if !decision.allowed {
        info!(
            event_name = "chat.turn.quota_denied",
            chat_id = %chat_id,
            identity = identity.kind(),
            reason = decision.reason.map(|r| r.as_str()).unwrap_or("limit_reached"),
            "turn denied by quota gate"
        );
        return Err(ChatRejection(ChatError::QuotaExceeded { decision }));
    }

    info!(
        event_name = "chat.turn.accepted",
        chat_id = %chat_id,
        identity = identity.kind(),
        "turn admitted, opening stream"
    );

    let user_message = StoredMessage {
        id: Uuid::new_v4().to_string(),
        role: Role::User,
        text: instruction.text.clone().unwrap_or_default(),
        image_ref: instruction.image_ref.clone(),
        items: None,
        created_at: Utc::now(),
    };
    let language = request.language_preference.clone().unwrap_or_default();
    let messages = request.messages;

    let (bytes_tx, bytes_rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
    let token = CancellationToken::new();
    let mut sink = ReplyStream::new(bytes_tx, token.clone());

    let runtime = Arc::clone(&state.runtime);
    let store = Arc::clone(&state.store);
    let task_token = token.clone();
    tokio::spawn(async move {
        match runtime.run(&messages, &language, &mut sink, &task_token).await {
            Ok(outcome) => {
                // Persist while the sink is still open: the client sees end
                // of stream only after the transcript write settled.
                let assistant_message = StoredMessage {
                    id: Uuid::new_v4().to_string(),
                    role: Role::Assistant,
                    text: outcome.reply_text,
                    image_ref: None,
                    items: if outcome.items.is_empty() { None } else { Some(outcome.items) },
                    created_at: Utc::now(),
                };
                if let Err(repo_error) =
                    store.append(&chat_id, &[user_message, assistant_message]).await
                {
                    error!(
                        event_name = "chat.turn.persist_failed",
                        chat_id = %chat_id,
                        error = %repo_error,
                        "completed turn could not be persisted"
                    );
                }
            }
            Err(RuntimeError::Cancelled) => {
                debug!(
                    event_name = "chat.turn.cancelled",
                    chat_id = %chat_id,
                    "turn cancelled, nothing persisted"
                );
            }
        }
        sink.finish();
    });

    let body = Body::from_stream(TurnBody { frames: ReceiverStream::new(bytes_rx), token });
    let mut response = Response::new(body);
    let response_headers = response.headers_mut();
    response_headers
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response_headers
        .insert(HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"));
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    append_quota_headers(response_headers, &decision);
    Ok(response)
}

pub async fn chat_history(
    Path(chat_id): Path<String>,
    State(state): State<ChatState>,
) -> Result<Json<ChatHistoryResponse>, ChatRejection> {
    let stored = state.store.history(&chat_id).await.map_err(|repo_error| {
        error!(
            event_name = "chat.history.load_failed",
            chat_id = %chat_id,
            error = %repo_error,
            "chat history could not be loaded"
        );
        ChatRejection(ChatError::Dependency("conversation store".to_string()))
    })?;

    let messages = stored.into_iter().map(StoredMessage::into_chat_message).collect();
    Ok(Json(ChatHistoryResponse { chat_id, messages }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_request(request: &ChatTurnRequest) -> Result<&ChatMessage, ChatRequestError> {
    let latest = request.messages.last().ok_or(ChatRequestError::EmptyMessages)?;
    if latest.role != Role::User || !latest.has_payload() {
        return Err(ChatRequestError::MissingInstruction);
    }
    if request.chat_identifier.trim().is_empty() {
        return Err(ChatRequestError::MissingChatIdentifier);
    }
    Ok(latest)
}

/// Bearer credentials win over the anonymous fingerprint when both appear.
fn resolve_identity(
    headers: &HeaderMap,
    verifier: &TokenVerifier,
) -> Result<Identity, IdentityError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        let account_id = verifier.verify(token.trim(), Utc::now())?;
        return Ok(Identity::Account { account_id });
    }

    let visitor = headers
        .get(VISITOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(visitor_id) = visitor {
        return Ok(Identity::Visitor { visitor_id: visitor_id.to_string() });
    }

    Err(IdentityError::MissingCredentials)
}

fn append_quota_headers(headers: &mut HeaderMap, decision: &QuotaDecision) {
    let pairs = [
        (SESSION_COUNT_HEADER, decision.session_count),
        (DAILY_COUNT_HEADER, decision.daily_count),
        (SESSION_LIMIT_HEADER, decision.session_limit),
        (DAILY_LIMIT_HEADER, decision.daily_limit),
    ];
    for (name, value) in pairs {
        if let Some(value) = value {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        }
    }
}

/// Response body stream that cancels the turn when dropped. Hyper drops the
/// body on client disconnect, and that drop is the only disconnect signal
/// the server gets; a drop after normal completion cancels a token nobody
/// is watching anymore.
struct TurnBody {
    frames: ReceiverStream<Bytes>,
    token: CancellationToken,
}

impl Stream for TurnBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().frames).poll_next(cx).map(|frame| frame.map(Ok))
    }
}

impl Drop for TurnBody {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
