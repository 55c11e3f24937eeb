use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("bearer token is malformed (expected `account.issued_at.signature`)")]
    Malformed,
    #[error("bearer token issued_at is not a unix timestamp")]
    BadTimestamp,
    #[error("bearer token signature mismatch")]
    BadSignature,
    #[error("bearer token is older than the allowed window")]
    Expired,
}

/// Verifies bearer tokens minted by the account system. The token is
/// `account_id.issued_at.signature` where the signature is hex
/// HMAC-SHA256 over `account_id.issued_at` under the shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: SecretString,
    max_age_secs: u64,
}

impl TokenVerifier {
    pub fn new(secret: SecretString, max_age_secs: u64) -> Self {
        Self { secret, max_age_secs }
    }

    /// Returns the account id for a structurally valid, correctly signed,
    /// unexpired token. Tokens "from the future" get a small allowance for
    /// clock skew between issuer and verifier.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<String, TokenError> {
        let mut parts = token.rsplitn(3, '.');
        let signature = parts.next().ok_or(TokenError::Malformed)?;
        let issued_at_raw = parts.next().ok_or(TokenError::Malformed)?;
        let account_id = parts.next().ok_or(TokenError::Malformed)?;
        if account_id.is_empty() || issued_at_raw.is_empty() || signature.is_empty() {
            return Err(TokenError::Malformed);
        }

        let expected = self.signature(account_id, issued_at_raw);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(TokenError::BadSignature);
        }

        let issued_at = issued_at_raw.parse::<i64>().map_err(|_| TokenError::BadTimestamp)?;
        let age_secs = now.timestamp() - issued_at;
        const SKEW_ALLOWANCE_SECS: i64 = 60;
        if age_secs < -SKEW_ALLOWANCE_SECS {
            return Err(TokenError::BadTimestamp);
        }
        if age_secs > self.max_age_secs as i64 {
            return Err(TokenError::Expired);
        }

        Ok(account_id.to_string())
    }

    /// Mints a token. Production tokens come from the account system; this
    /// exists for operator tooling and tests.
    pub fn issue(&self, account_id: &str, issued_at: DateTime<Utc>) -> String {
        let issued_at = issued_at.timestamp().to_string();
        let signature = self.signature(account_id, &issued_at);
        format!("{account_id}.{issued_at}.{signature}")
    }

    fn signature(&self, account_id: &str, issued_at: &str) -> String {
        hmac_hex(
            self.secret.expose_secret().as_bytes(),
            format!("{account_id}.{issued_at}").as_bytes(),
        )
    }
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

// Comparison must not short-circuit on the first differing byte.
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut difference = 0u8;
    for (a, b) in left.iter().zip(right.iter()) {
        difference |= a ^ b;
    }
    difference == 0
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use secrecy::SecretString;

    use super::{TokenError, TokenVerifier};

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(SecretString::from("a-test-secret-of-reasonable-length"), 3600)
    }

    #[test]
    fn issued_tokens_verify_back_to_the_account() {
        let verifier = verifier();
        let now = Utc::now();
        let token = verifier.issue("acct-42", now);

        let account = verifier.verify(&token, now).expect("verify");
        assert_eq!(account, "acct-42");
    }

    #[test]
    fn account_ids_containing_dots_survive_the_round_trip() {
        let verifier = verifier();
        let now = Utc::now();
        let token = verifier.issue("org.team.user", now);

        assert_eq!(verifier.verify(&token, now).expect("verify"), "org.team.user");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let verifier = verifier();
        let now = Utc::now();
        let token = verifier.issue("acct-42", now);
        let tampered = token.replacen("acct-42", "acct-43", 1);

        assert_eq!(verifier.verify(&tampered, now), Err(TokenError::BadSignature));
    }

    #[test]
    fn stale_tokens_expire() {
        let verifier = verifier();
        let issued = Utc::now() - Duration::seconds(7200);
        let token = verifier.issue("acct-42", issued);

        assert_eq!(verifier.verify(&token, Utc::now()), Err(TokenError::Expired));
    }

    #[test]
    fn malformed_shapes_are_rejected_before_crypto() {
        let verifier = verifier();
        let now = Utc::now();
        assert_eq!(verifier.verify("", now), Err(TokenError::Malformed));
        assert_eq!(verifier.verify("no-dots-at-all", now), Err(TokenError::Malformed));
        assert_eq!(verifier.verify("just.one", now), Err(TokenError::Malformed));
    }

    #[test]
    fn signature_check_runs_before_timestamp_parse() {
        // An attacker should not learn timestamp validity from an unsigned token.
        let verifier = verifier();
        let result = verifier.verify("acct-42.not-a-number.deadbeef", Utc::now());
        assert_eq!(result, Err(TokenError::BadSignature));
    }
}
