use thiserror::Error;

use crate::auth::TokenError;
use crate::domain::quota::QuotaDecision;

/// Request-shape problems caught before any identity or quota work.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChatRequestError {
    #[error("messages must not be empty")]
    EmptyMessages,
    #[error("the latest message must come from the user and carry text or an image")]
    MissingInstruction,
    #[error("chat identifier must not be empty")]
    MissingChatIdentifier,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no bearer token or visitor fingerprint was provided")]
    MissingCredentials,
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Everything that can stop a chat request before its stream opens. Once
/// bytes are flowing, failures degrade into assistant text instead.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ChatError {
    #[error(transparent)]
    InvalidRequest(#[from] ChatRequestError),
    #[error(transparent)]
    Unauthorized(#[from] IdentityError),
    #[error("turn quota exhausted")]
    QuotaExceeded { decision: QuotaDecision },
    #[error("service is not configured: {0}")]
    NotConfigured(String),
    #[error("dependency unavailable: {0}")]
    Dependency(String),
}

impl ChatError {
    /// Stable machine-readable code carried in error response bodies.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::QuotaExceeded { decision } => {
                decision.reason.map(|reason| reason.as_str()).unwrap_or("limit_reached")
            }
            Self::NotConfigured(_) => "not_configured",
            Self::Dependency(_) => "dependency_unavailable",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Unauthorized(_) => "Sign in or enable browser identification to continue.",
            Self::QuotaExceeded { .. } => {
                "You have reached the turn limit for now. Please come back later."
            }
            Self::NotConfigured(_) => "The assistant is not fully configured yet.",
            Self::Dependency(_) => "Something went wrong on our side. Please try again shortly.",
        }
    }
}
