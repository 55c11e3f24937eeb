//! The conversation loop. One `run` call owns a whole turn: decide, fetch,
//! select, repeat under a step budget, then narrate what was picked. All
//! progress and reply text leaves through the caller's [`ReplyStream`];
//! the returned [`TurnOutcome`] is what the caller persists.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trove_core::config::{AgentConfig, LlmConfig};
use trove_core::{AgentDecision, Candidate, ChatMessage, SelectedItem};
use trove_market::{ItemSearch, MarketError};

use crate::engine::{prefers_chinese, DecisionEngine, EngineError};
use crate::llm::{ChatRequest, LlmClient};
use crate::prompt::{PromptBuilder, PromptError, TurnContext};
use crate::stream::ReplyStream;

/// What one completed turn produced: the narrative text and the structured
/// picks behind the fenced block. Empty `items` on the direct-reply path.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub reply_text: String,
    pub items: Vec<SelectedItem>,
}

/// Cancellation is the loop's only hard failure. Everything else degrades
/// into reply text before it gets here.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("request cancelled")]
    Cancelled,
}

pub struct AgentRuntime {
    engine: DecisionEngine,
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn ItemSearch>,
    prompts: PromptBuilder,
    max_steps: u32,
    need_min: usize,
    max_pick: usize,
}

impl AgentRuntime {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn ItemSearch>,
        llm_config: &LlmConfig,
        agent_config: &AgentConfig,
    ) -> Self {
        Self {
            engine: DecisionEngine::new(Arc::clone(&llm), llm_config, agent_config),
            llm,
            search,
            prompts: PromptBuilder::new(agent_config),
            max_steps: agent_config.max_steps,
            need_min: agent_config.need_min,
            max_pick: agent_config.max_pick,
        }
    }

    /// Runs the loop for one request. A `Reply` decision ends the turn with
    /// that text alone; otherwise search/select cycles accumulate picks until
    /// enough are held, the model says it is done, a selection stalls, or the
    /// step budget runs out, and the turn closes with a streamed narrative
    /// plus the fenced items block.
    pub async fn run(
        &self,
        history: &[ChatMessage],
        language: &str,
        sink: &mut ReplyStream,
        token: &CancellationToken,
    ) -> Result<TurnOutcome, RuntimeError> {
        let mut ctx = TurnContext::from_history(history, language);
        let mut picked: Vec<SelectedItem> = Vec::new();
        let mut fetched: Option<Vec<Candidate>> = None;
        let mut steps: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if sink.status("thinking").await.is_err() {
                return Err(RuntimeError::Cancelled);
            }

            let decision = match self.engine.decide(&ctx, fetched.as_deref(), token).await {
                Ok(decision) => decision,
                Err(EngineError::Cancelled) => return Err(RuntimeError::Cancelled),
            };

            match decision {
                AgentDecision::Reply { text } => {
                    debug!(steps, "closing the turn with a direct reply");
                    if sink.body(&text).await.is_err() {
                        return Err(RuntimeError::Cancelled);
                    }
                    return Ok(TurnOutcome { reply_text: text, items: Vec::new() });
                }
                AgentDecision::Search { keyword, summary, page } => {
                    steps += 1;
                    ctx.record_keyword(&keyword);
                    if sink.status(&search_status(&summary, &keyword)).await.is_err() {
                        return Err(RuntimeError::Cancelled);
                    }

                    match self.search.search(&keyword, page, token).await {
                        Ok(found) => {
                            debug!(keyword, page, count = found.candidates.len(), "fetched a page");
                            fetched = Some(found.candidates);
                        }
                        Err(MarketError::Cancelled) => return Err(RuntimeError::Cancelled),
                        Err(error) => {
                            warn!(keyword, error = %error, "search failed, wrapping up early");
                            break;
                        }
                    }
                }
                AgentDecision::Select { items, done } => {
                    steps += 1;
                    if sink.status("selecting").await.is_err() {
                        return Err(RuntimeError::Cancelled);
                    }

                    let batch = fetched.as_deref().unwrap_or(&[]);
                    let mut new_picks = 0usize;
                    for pick in &items {
                        if picked.len() >= self.max_pick {
                            break;
                        }
                        let Some(candidate) =
                            batch.iter().find(|candidate| candidate.id == pick.id)
                        else {
                            continue;
                        };
                        ctx.picked_ids.insert(pick.id.clone());
                        picked.push(SelectedItem::from_candidate(candidate, pick));
                        new_picks += 1;
                    }

                    // Zero new picks over a batch we already hold means the
                    // model is circling; stop rather than spend the budget.
                    let stalled = new_picks == 0 && !picked.is_empty();
                    if done || stalled || picked.len() >= self.need_min {
                        debug!(picked = picked.len(), done, stalled, "selection finished");
                        break;
                    }
                }
            }

            if steps >= self.max_steps {
                debug!(steps, picked = picked.len(), "step budget spent");
                break;
            }
        }

        self.final_reply(&ctx, &picked, sink, token).await
    }

    /// Streams the closing narrative, then the fenced items block when
    /// anything was picked. The fenced payload is byte-for-byte the
    /// serialization of the accumulated picks, never model output.
    async fn final_reply(
        &self,
        ctx: &TurnContext,
        picked: &[SelectedItem],
        sink: &mut ReplyStream,
        token: &CancellationToken,
    ) -> Result<TurnOutcome, RuntimeError> {
        if sink.status("replying").await.is_err() {
            return Err(RuntimeError::Cancelled);
        }

        let narrative = self.stream_narrative(ctx, picked, sink, token).await?;
        let reply_text = if narrative.is_empty() {
            let canned = canned_summary(&ctx.language, picked.len());
            if sink.body(&canned).await.is_err() {
                return Err(RuntimeError::Cancelled);
            }
            canned
        } else {
            narrative
        };

        if !picked.is_empty() {
            match serde_json::to_string(picked) {
                Ok(payload) => {
                    let mut fence = String::with_capacity(payload.len() + 16);
                    if !sink.at_line_start() {
                        fence.push('\n');
                    }
                    fence.push_str("```json\n");
                    fence.push_str(&payload);
                    fence.push_str("\n```");
                    if sink.body(&fence).await.is_err() {
                        return Err(RuntimeError::Cancelled);
                    }
                }
                Err(error) => warn!(error = %error, "items payload failed to serialize"),
            }
        }

        Ok(TurnOutcome { reply_text, items: picked.to_vec() })
    }

    /// Forwards model chunks into the sink while collecting them, in one
    /// task: the model call and the forwarding loop are joined, so a closed
    /// sink stops the model (dropped receiver) and a finished model stops
    /// the forwarding (dropped sender). Returns the collected text; an empty
    /// string means the caller should fall back to a canned line.
    async fn stream_narrative(
        &self,
        ctx: &TurnContext,
        picked: &[SelectedItem],
        sink: &mut ReplyStream,
        token: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let request = match self.reply_request(ctx, picked) {
            Ok(request) => request,
            Err(error) => {
                warn!(error = %error, "reply prompt failed to render");
                return Ok(String::new());
            }
        };

        let (tx, mut rx) = mpsc::channel::<String>(16);
        let (model, (text, sink_closed)) =
            tokio::join!(self.llm.stream(request, token, tx), async {
                let mut text = String::new();
                while let Some(chunk) = rx.recv().await {
                    if sink.body(&chunk).await.is_err() {
                        return (text, true);
                    }
                    text.push_str(&chunk);
                }
                (text, false)
            });

        if sink_closed || token.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if let Err(error) = model {
            warn!(error = %error, "narrative stream failed midway");
        }
        Ok(text)
    }

    fn reply_request(
        &self,
        ctx: &TurnContext,
        picked: &[SelectedItem],
    ) -> Result<ChatRequest, PromptError> {
        // No image here: attachments ride only on decision calls.
        Ok(ChatRequest {
            system: self.prompts.system(ctx)?,
            user: self.prompts.reply(ctx, picked)?,
            image_ref: None,
        })
    }
}

fn search_status(summary: &str, keyword: &str) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        format!("searching: {keyword}")
    } else {
        summary.to_string()
    }
}

fn canned_summary(language: &str, picked: usize) -> String {
    let line = match (prefers_chinese(language), picked == 0) {
        (true, true) => "这次没有找到合适的结果，换个说法再试一次？",
        (true, false) => "给你挑好了几件，清单在下面。",
        (false, true) => {
            "I could not find anything that fits this time. Try wording it differently?"
        }
        (false, false) => "I picked out a few finds for you; the list is below.",
    };
    line.to_string()
}
