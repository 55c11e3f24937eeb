//! The parse-then-validate boundary around the model. Raw completions come
//! in as text; what leaves this module is always one of the three
//! [`AgentDecision`] shapes, already filtered against the request's exclusion
//! and pick state. Model trouble of any kind degrades to a safe reply; only
//! cancellation surfaces as an error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trove_core::config::{AgentConfig, LlmConfig};
use trove_core::{AgentDecision, Candidate};
use trove_market::retry::{retry_with_timeout, RetryError};

use crate::llm::{ChatRequest, LlmClient};
use crate::prompt::{PromptBuilder, PromptError, TurnContext};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decision cancelled")]
    Cancelled,
}

pub struct DecisionEngine {
    llm: Arc<dyn LlmClient>,
    prompts: PromptBuilder,
    max_retries: u32,
    attempt_timeout: Duration,
    max_pick: usize,
}

impl DecisionEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        llm_config: &LlmConfig,
        agent_config: &AgentConfig,
    ) -> Self {
        Self {
            llm,
            prompts: PromptBuilder::new(agent_config),
            max_retries: llm_config.max_retries,
            attempt_timeout: Duration::from_secs(llm_config.timeout_secs),
            max_pick: agent_config.max_pick,
        }
    }

    /// One decision step. Never fails except on cancellation: render
    /// failures, transport failures, and unusable model output all come back
    /// as a language-appropriate apologetic `Reply`.
    pub async fn decide(
        &self,
        ctx: &TurnContext,
        candidates: Option<&[Candidate]>,
        token: &CancellationToken,
    ) -> Result<AgentDecision, EngineError> {
        let request = match self.build_request(ctx, candidates) {
            Ok(request) => request,
            Err(error) => {
                warn!(error = %error, "decision prompt failed to render");
                return Ok(safe_reply(&ctx.language));
            }
        };

        let raw = retry_with_timeout(
            "decision",
            self.max_retries,
            self.attempt_timeout,
            token,
            || self.llm.complete(request.clone(), token),
        )
        .await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(RetryError::Cancelled) => return Err(EngineError::Cancelled),
            Err(error @ RetryError::Exhausted { .. }) => {
                warn!(error = %error, "decision retries exhausted, replying safely");
                return Ok(safe_reply(&ctx.language));
            }
        };

        let Some(decision) = parse_decision(&raw) else {
            debug!(raw_len = raw.len(), "model output held no usable decision");
            return Ok(safe_reply(&ctx.language));
        };
        Ok(self.validate(decision, ctx, candidates))
    }

    fn build_request(
        &self,
        ctx: &TurnContext,
        candidates: Option<&[Candidate]>,
    ) -> Result<ChatRequest, PromptError> {
        Ok(ChatRequest {
            system: self.prompts.system(ctx)?,
            user: self.prompts.decide(ctx, candidates)?,
            image_ref: ctx.image_ref.clone(),
        })
    }

    fn validate(
        &self,
        decision: AgentDecision,
        ctx: &TurnContext,
        candidates: Option<&[Candidate]>,
    ) -> AgentDecision {
        match decision {
            AgentDecision::Reply { text } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    safe_reply(&ctx.language)
                } else {
                    AgentDecision::Reply { text }
                }
            }
            AgentDecision::Search { keyword, summary, page } => {
                let keyword = keyword.trim().to_string();
                let keyword = if keyword.is_empty() {
                    match fallback_keyword(&summary, &ctx.instruction) {
                        Some(keyword) => keyword,
                        None => return safe_reply(&ctx.language),
                    }
                } else {
                    keyword
                };
                AgentDecision::Search { keyword, summary, page: page.max(1) }
            }
            AgentDecision::Select { items, done } => {
                let batch_ids: BTreeSet<&str> = candidates
                    .map(|batch| batch.iter().map(|candidate| candidate.id.as_str()).collect())
                    .unwrap_or_default();
                let mut seen = BTreeSet::new();
                let mut accepted = Vec::new();
                for mut pick in items {
                    let id = pick.id.trim().to_string();
                    if id.is_empty()
                        || ctx.excluded_ids.contains(&id)
                        || ctx.picked_ids.contains(&id)
                        || !batch_ids.contains(id.as_str())
                        || !seen.insert(id.clone())
                    {
                        continue;
                    }
                    pick.id = id;
                    accepted.push(pick);
                    if accepted.len() == self.max_pick {
                        break;
                    }
                }
                AgentDecision::Select { items: accepted, done }
            }
        }
    }
}

/// Strict parse first, then fence stripping, then the first balanced JSON
/// segment. Returns `None` only when no route yields a recognizable
/// decision.
fn parse_decision(raw: &str) -> Option<AgentDecision> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(decision) = serde_json::from_str::<AgentDecision>(trimmed) {
        return Some(decision);
    }
    if let Some(stripped) = strip_code_fences(trimmed) {
        if let Ok(decision) = serde_json::from_str::<AgentDecision>(&stripped) {
            return Some(decision);
        }
        if let Some(segment) = extract_json_segment(&stripped) {
            if let Ok(decision) = serde_json::from_str::<AgentDecision>(&segment) {
                return Some(decision);
            }
        }
    }
    extract_json_segment(trimmed).and_then(|segment| serde_json::from_str(&segment).ok())
}

fn strip_code_fences(text: &str) -> Option<String> {
    if !text.contains("```") {
        return None;
    }
    let kept: Vec<&str> =
        text.lines().filter(|line| !line.trim_start().starts_with("```")).collect();
    let stripped = kept.join("\n");
    let stripped = stripped.trim();
    (!stripped.is_empty()).then(|| stripped.to_string())
}

fn extract_json_segment(text: &str) -> Option<String> {
    extract_balanced(text, '{', '}').or_else(|| extract_balanced(text, '[', ']'))
}

fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    for (offset, ch) in text[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(text[start..start + offset + ch.len_utf8()].to_string());
            }
        }
    }
    None
}

fn fallback_keyword(summary: &str, instruction: &str) -> Option<String> {
    let summary = summary.trim();
    if !summary.is_empty() {
        return Some(summary.to_string());
    }
    let instruction = instruction.trim();
    if instruction.is_empty() {
        return None;
    }
    Some(instruction.chars().take(40).collect())
}

pub(crate) fn safe_reply(language: &str) -> AgentDecision {
    AgentDecision::Reply { text: apology(language).to_string() }
}

fn apology(language: &str) -> &'static str {
    if prefers_chinese(language) {
        "抱歉，我这边出了点小问题，请稍后再试一次。"
    } else {
        "Sorry, something went wrong on my side. Please try again in a moment."
    }
}

pub(crate) fn prefers_chinese(language: &str) -> bool {
    let lowered = language.trim().to_ascii_lowercase();
    lowered.starts_with("zh") || language.contains("中文")
}
