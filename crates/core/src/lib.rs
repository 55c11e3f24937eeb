pub mod auth;
pub mod config;
pub mod domain;
pub mod errors;

pub use auth::{TokenError, TokenVerifier};
pub use domain::candidate::{Candidate, PriceVariation, MAX_TAGS};
pub use domain::decision::{AgentDecision, ItemPick};
pub use domain::message::{ChatMessage, Role, SelectedItem};
pub use domain::quota::{Identity, QuotaDecision, QuotaDenyReason, QuotaLimits};
pub use errors::{ChatError, ChatRequestError, IdentityError};
