//! System configuration: rate limits, search thresholds, and
//! environment variable parsing.

/// OAuth token endpoint of the ranking service
pub const TOKEN_URL: &str = "https://www.loganalytics.io/oauth/token";

/// GraphQL API endpoint of the ranking service
pub const API_URL: &str = "https://www.loganalytics.io/api/v2/client";

/// Short-term rate window length (2 minutes)
pub const RATE_WINDOW_MS: i64 = 120_000;

/// Maximum network calls allowed inside one rate window
pub const MAX_REQUESTS_PER_WINDOW: u32 = 40;

/// Safety margin added to every predicted throttle wait
pub const WAIT_SAFETY_MARGIN_MS: i64 = 1_000;

/// Estimated long-term point cost of one logical page request
pub const POINTS_PER_REQUEST: f64 = 1.5;

/// Upper bound on the page-range binary search
pub const MAX_PAGES: u32 = 1_600;

/// Maximum pages merged into one aliased network call
pub const MAX_BATCH_PAGES: u32 = 8;

/// Failed batches are retried this many times before the search aborts
pub const FETCH_RETRY_LIMIT: u32 = 3;

/// Delay between batch retries
pub const FETCH_RETRY_DELAY_MS: u64 = 2_000;

/// A session marker older than this is treated as an unclean shutdown
pub const SESSION_STALE_AFTER_MS: i64 = 10 * 60 * 1_000;

/// Heuristic bound applied to the candidate's *duration* delta.
/// Note: the crossed pairing with `DURATION_DIFF_THRESHOLD_MS` below is
/// intentional; see `matching::MatchEngine::heuristic_match`.
pub const TIME_DIFF_THRESHOLD_MS: i64 = 5_000;

/// Heuristic bound applied to the candidate's *start-time* delta.
pub const DURATION_DIFF_THRESHOLD_MS: i64 = 10_000;

/// Pairwise relative tolerance for cross-fight performance comparison
pub const VERIFY_RELATIVE_TOLERANCE: f64 = 0.02;

/// Name prefix the ranking service assigns to anonymized players
pub const ANONYMOUS_NAME_PREFIX: &str = "Anonymous";

/// Default on-disk store location
pub const DEFAULT_STORE_PATH: &str = "logsleuth.db";

/// Verbose cache tracing (set CACHE_DEBUG=1 to enable)
pub fn cache_debug_enabled() -> bool {
    static CACHED: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *CACHED.get_or_init(|| {
        std::env::var("CACHE_DEBUG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false)
    })
}
