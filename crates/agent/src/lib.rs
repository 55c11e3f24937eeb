//! The conversational half of trove: everything between an authorized chat
//! request and the bytes of its streamed answer.
//!
//! One turn flows through four layers:
//! 1. **Prompt assembly** (`prompt`) - transcript compaction, id-set capping,
//!    candidate digests, Tera templates.
//! 2. **Decision engine** (`engine`) - model output repaired and validated
//!    into the closed `AgentDecision` set.
//! 3. **Loop runtime** (`runtime`) - the decide/fetch/select state machine
//!    with its step budget and stall detection.
//! 4. **Stream protocol** (`stream`) - padded status lines and body text
//!    multiplexed onto one byte stream, plus the matching parser.
//!
//! The model itself sits behind the `LlmClient` trait (`llm`); tests script
//! it, production uses the OpenAI-compatible HTTP client.

pub mod engine;
pub mod llm;
pub mod prompt;
pub mod runtime;
pub mod stream;

pub use engine::{DecisionEngine, EngineError};
pub use llm::{ChatRequest, HttpLlmClient, LlmClient, LlmError};
pub use prompt::{PromptBuilder, TurnContext};
pub use runtime::{AgentRuntime, RuntimeError, TurnOutcome};
pub use stream::{
    ReplyStream, ReplyStreamParser, StreamClosed, StreamEvent, STATUS_LINE_MIN_BYTES,
    STATUS_PREFIX,
};
