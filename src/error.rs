//! Search error taxonomy.

use thiserror::Error;

/// Errors that can terminate or suspend a search run.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The long-term point budget cannot cover the next call. Raised before
    /// any network traffic; not retryable until the budget clock advances.
    #[error("point budget exhausted, resets in ~{minutes_until_reset} min")]
    QuotaExceeded { minutes_until_reset: i64 },

    /// The search was cancelled by an external signal.
    #[error("search cancelled")]
    Cancelled,

    /// A batch exhausted its retries. Fatal for the whole search: a silently
    /// missing page would corrupt the range and cache invariants.
    #[error("data request failed: {0}")]
    DataRequestFailed(String),

    /// The remote service answered but the payload was unusable.
    #[error("unexpected api response: {0}")]
    Api(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SearchError {
    /// True for the cancellation outcome, which must unwind without
    /// being mistaken for a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SearchError::Cancelled)
    }
}
