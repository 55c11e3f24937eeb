use serde::{Deserialize, Serialize};

/// Who is asking: a signed-in account or an anonymous browser fingerprint.
/// The two are metered differently; see `QuotaLimits`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Account { account_id: String },
    Visitor { visitor_id: String },
}

impl Identity {
    pub fn key(&self) -> &str {
        match self {
            Self::Account { account_id } => account_id,
            Self::Visitor { visitor_id } => visitor_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Account { .. } => "account",
            Self::Visitor { .. } => "visitor",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Turns an account may spend inside one chat.
    pub session_limit: u32,
    /// Turns an account may spend across all chats in one calendar day.
    pub daily_limit: u32,
    /// Lifetime turns for an anonymous visitor fingerprint.
    pub visitor_limit: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDenyReason {
    SessionLimit,
    DailyLimit,
    LimitReached,
    InvalidVisitorId,
}

impl QuotaDenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionLimit => "session_limit",
            Self::DailyLimit => "daily_limit",
            Self::LimitReached => "limit_reached",
            Self::InvalidVisitorId => "invalid_visitor_id",
        }
    }
}

/// Outcome of the single check-and-increment the gate performs per request.
/// Counts are post-increment when allowed and at-limit when denied, so the
/// client can always render "N of M used" telemetry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<QuotaDenyReason>,
    #[serde(default)]
    pub session_count: Option<u32>,
    #[serde(default)]
    pub daily_count: Option<u32>,
    #[serde(default)]
    pub session_limit: Option<u32>,
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

impl QuotaDecision {
    pub fn allowed(
        session_count: u32,
        daily_count: u32,
        session_limit: u32,
        daily_limit: u32,
    ) -> Self {
        Self {
            allowed: true,
            reason: None,
            session_count: Some(session_count),
            daily_count: Some(daily_count),
            session_limit: Some(session_limit),
            daily_limit: Some(daily_limit),
        }
    }

    pub fn denied(reason: QuotaDenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            session_count: None,
            daily_count: None,
            session_limit: None,
            daily_limit: None,
        }
    }

    pub fn with_counts(
        mut self,
        session_count: u32,
        daily_count: u32,
        session_limit: u32,
        daily_limit: u32,
    ) -> Self {
        self.session_count = Some(session_count);
        self.daily_count = Some(daily_count);
        self.session_limit = Some(session_limit);
        self.daily_limit = Some(daily_limit);
        self
    }
}

/// Visitor fingerprints are client-generated; anything outside a conservative
/// shape is treated as forgery rather than metered.
pub fn valid_visitor_fingerprint(value: &str) -> bool {
    let length_ok = (8..=64).contains(&value.len());
    length_ok
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[cfg(test)]
mod tests {
    use super::{valid_visitor_fingerprint, QuotaDecision, QuotaDenyReason};

    #[test]
    fn deny_reasons_have_stable_wire_names() {
        assert_eq!(QuotaDenyReason::SessionLimit.as_str(), "session_limit");
        assert_eq!(QuotaDenyReason::DailyLimit.as_str(), "daily_limit");
        assert_eq!(QuotaDenyReason::LimitReached.as_str(), "limit_reached");
        assert_eq!(QuotaDenyReason::InvalidVisitorId.as_str(), "invalid_visitor_id");
    }

    #[test]
    fn denied_decision_carries_no_counts_by_default() {
        let decision = QuotaDecision::denied(QuotaDenyReason::DailyLimit);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(QuotaDenyReason::DailyLimit));
        assert_eq!(decision.session_count, None);
    }

    #[test]
    fn fingerprint_shape_is_enforced() {
        assert!(valid_visitor_fingerprint("f9a8b7c6d5e4"));
        assert!(valid_visitor_fingerprint("Visitor_0001-abc"));
        assert!(!valid_visitor_fingerprint("short"));
        assert!(!valid_visitor_fingerprint("has spaces in it"));
        assert!(!valid_visitor_fingerprint(&"x".repeat(65)));
    }
}
