//! Marketplace access for the assistant: a scraping client for listing
//! pages, an optional embedding + vector-search pair, and the executor that
//! folds both into a single keyword-to-candidates call. Also home to the
//! bounded retry and batching primitives the rest of the workspace reuses
//! for outbound work.

pub mod batch;
pub mod client;
pub mod errors;
pub mod executor;
pub mod fixtures;
pub mod listing;
pub mod retry;
pub mod semantic;

pub use client::{ItemDetail, MarketClient};
pub use errors::MarketError;
pub use executor::{ItemSearch, SearchExecutor, SearchPage};
pub use retry::{retry_with_timeout, RetryError};
pub use semantic::SemanticClient;
