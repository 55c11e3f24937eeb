use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("market request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("market endpoint returned status {status}")]
    Status { status: u16 },
    #[error("malformed market payload: {0}")]
    Malformed(String),
    #[error("market call cancelled")]
    Cancelled,
}
