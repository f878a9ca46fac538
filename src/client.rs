//! Quota-aware client for the ranking service's GraphQL API.
//!
//! Every remote call passes two gates before any traffic is sent: the
//! long-term point budget the service reports back on each response, and
//! the short-term sliding-window ceiling tracked locally. The first gate
//! fails fast (a call known to exceed the hourly budget must not burn a
//! window slot); the second suspends the caller in a cancellable countdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{API_URL, POINTS_PER_REQUEST, TOKEN_URL};
use crate::error::SearchError;
use crate::rate_window::RateWindowTracker;
use crate::status::{ApiCredentials, StatusSink};
use crate::types::{QuotaState, SearchCoordinate};

// === Query Builders ===

const RATE_LIMIT_FIELDS: &str =
    "rateLimitData { limitPerHour pointsSpentThisHour pointsResetIn }";

/// One aliased `characterRankings` block per requested page, so a whole
/// batch of pages costs a single network call. Quota fields ride along on
/// every ranking query so the budget snapshot stays current.
pub fn ranking_pages_query(coord: &SearchCoordinate, pages: &[u32]) -> String {
    let mut aliases = String::new();
    for page in pages {
        let partition = match coord.partition {
            Some(p) => format!(", partition: {p}"),
            None => String::new(),
        };
        aliases.push_str(&format!(
            "p{page}: characterRankings(page: {page}, difficulty: {}, size: {}, serverRegion: \"{}\"{partition}) ",
            coord.difficulty, coord.size, coord.region
        ));
    }
    format!(
        "{{ worldData {{ encounter(id: {}) {{ name {aliases}}} }} {RATE_LIMIT_FIELDS} }}",
        coord.encounter_id
    )
}

/// Per-player performance values of one fight, for cross-validation.
pub fn fight_values_query(report_code: &str, fight_id: u32) -> String {
    format!(
        "{{ reportData {{ report(code: \"{report_code}\") {{ rankings(fightIDs: [{fight_id}]) }} }} {RATE_LIMIT_FIELDS} }}"
    )
}

/// Fights of the anonymized report, with the timing and encounter fields
/// needed to build search coordinates.
pub fn report_fights_query(report_code: &str) -> String {
    format!(
        "{{ reportData {{ report(code: \"{report_code}\") {{ startTime \
         fights(killType: Kills) {{ id startTime endTime encounterID difficulty size }} }} }} {RATE_LIMIT_FIELDS} }}"
    )
}

/// Quota snapshot only.
pub fn rate_limit_query() -> String {
    format!("{{ {RATE_LIMIT_FIELDS} }}")
}

// === Transport ===

/// Executes one GraphQL document and returns the parsed response body.
#[async_trait]
pub trait GraphQlTransport: Send + Sync {
    async fn execute(&self, query: &str) -> Result<Value>;
}

/// HTTPS transport with OAuth2 client-credentials authentication.
pub struct HttpTransport {
    http: reqwest::Client,
    credentials: ApiCredentials,
    token_url: String,
    api_url: String,
    token: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self::with_endpoints(credentials, TOKEN_URL, API_URL)
    }

    pub fn with_endpoints(credentials: ApiCredentials, token_url: &str, api_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            credentials,
            token_url: token_url.to_string(),
            api_url: api_url.to_string(),
            token: Mutex::new(None),
        }
    }

    async fn fetch_token(&self) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.credentials.id, Some(&self.credentials.secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .context("token request failed")?;

        if !resp.status().is_success() {
            return Err(anyhow!("token endpoint returned {}", resp.status()));
        }
        let token: TokenResponse = resp.json().await.context("unreadable token response")?;
        Ok(token.access_token)
    }

    async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.token.lock().expect("token mutex poisoned").clone() {
            return Ok(token);
        }
        let token = self.fetch_token().await?;
        *self.token.lock().expect("token mutex poisoned") = Some(token.clone());
        info!("[CLIENT] obtained API token");
        Ok(token)
    }

    async fn post_query(&self, token: &str, query: &str) -> Result<reqwest::Response> {
        Ok(self
            .http
            .post(&self.api_url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?)
    }
}

#[async_trait]
impl GraphQlTransport for HttpTransport {
    async fn execute(&self, query: &str) -> Result<Value> {
        let token = self.bearer().await?;
        let mut resp = self.post_query(&token, query).await?;

        // One re-auth attempt on an expired token
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("[CLIENT] token rejected, re-authenticating");
            *self.token.lock().expect("token mutex poisoned") = None;
            let token = self.bearer().await?;
            resp = self.post_query(&token, query).await?;
        }

        if !resp.status().is_success() {
            return Err(anyhow!("api returned {}", resp.status()));
        }

        let body: Value = resp.json().await.context("unreadable api response")?;
        if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
            let first = errors
                .first()
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown graphql error");
            return Err(anyhow!("graphql error: {first}"));
        }
        Ok(body)
    }
}

// === Quota-Aware Client ===

pub struct QuotaAwareClient<T> {
    transport: T,
    tracker: Arc<RateWindowTracker>,
    status: Arc<dyn StatusSink>,
    quota: Mutex<Option<QuotaState>>,
    waiting: AtomicBool,
}

impl<T: GraphQlTransport> QuotaAwareClient<T> {
    pub fn new(transport: T, tracker: Arc<RateWindowTracker>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            transport,
            tracker,
            status,
            quota: Mutex::new(None),
            waiting: AtomicBool::new(false),
        }
    }

    /// Latest server-reported quota snapshot, if any response carried one.
    pub fn quota(&self) -> Option<QuotaState> {
        *self.quota.lock().expect("quota mutex poisoned")
    }

    /// Estimated remaining point budget, or `None` before the first response.
    pub fn estimated_remaining_points(&self) -> Option<f64> {
        self.quota().map(|q| q.remaining())
    }

    /// A throttle countdown is in progress; periodic status refresh must
    /// stay quiet so it does not clobber the countdown display.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// Execute one GraphQL document containing `estimated_cost` logical
    /// requests. Short-term accounting is per network call (exactly one unit
    /// recorded however many pages were aliased in); long-term accounting is
    /// per logical request and is checked before any traffic is sent.
    pub async fn query(
        &self,
        query: &str,
        estimated_cost: u32,
        cancel: &CancellationToken,
    ) -> Result<Value, SearchError> {
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let estimated_points = estimated_cost as f64 * POINTS_PER_REQUEST;
        if let Some(quota) = self.quota() {
            if quota.remaining() < estimated_points {
                return Err(SearchError::QuotaExceeded {
                    minutes_until_reset: quota.minutes_until_reset(),
                });
            }
        }

        if self.tracker.available_slots()? < 1 {
            let wait = self.tracker.wait_time_for(1)?;
            self.waiting.store(true, Ordering::Release);
            let waited = self.countdown(wait, cancel).await;
            self.waiting.store(false, Ordering::Release);
            waited?;
        }

        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let body = self
            .transport
            .execute(query)
            .await
            .map_err(|e| SearchError::Api(e.to_string()))?;

        // One window unit per network call, independent of aliasing.
        self.tracker.record(1)?;
        self.absorb_quota(&body);

        body.get("data")
            .cloned()
            .ok_or_else(|| SearchError::Api("response missing data".into()))
    }

    /// Opportunistic quota refresh for the status display. Suppressed while
    /// a countdown wait is active; skipped when no window slot is free.
    pub async fn refresh_quota(&self, cancel: &CancellationToken) -> Result<(), SearchError> {
        if self.is_waiting() || cancel.is_cancelled() {
            return Ok(());
        }
        if self.tracker.available_slots()? < 1 {
            return Ok(());
        }

        let body = self
            .transport
            .execute(&rate_limit_query())
            .await
            .map_err(|e| SearchError::Api(e.to_string()))?;
        self.tracker.record(1)?;
        self.absorb_quota(&body);
        Ok(())
    }

    async fn countdown(&self, wait: Duration, cancel: &CancellationToken) -> Result<(), SearchError> {
        let deadline = tokio::time::Instant::now() + wait;
        info!("[RATE] request window full, waiting {}s", wait.as_secs());

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            self.status.waiting(remaining.as_secs());

            let tick = remaining.min(Duration::from_secs(1));
            tokio::select! {
                _ = cancel.cancelled() => return Err(SearchError::Cancelled),
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    fn absorb_quota(&self, body: &Value) {
        let Some(data) = body.get("data").and_then(|d| d.get("rateLimitData")) else {
            return;
        };
        let (Some(limit), Some(spent), Some(reset)) = (
            data.get("limitPerHour").and_then(Value::as_f64),
            data.get("pointsSpentThisHour").and_then(Value::as_f64),
            data.get("pointsResetIn").and_then(Value::as_i64),
        ) else {
            debug!("[CLIENT] response carried malformed rateLimitData");
            return;
        };

        let state = QuotaState {
            limit_per_hour: limit,
            points_spent: spent,
            reset_in_secs: reset,
        };
        debug!("[CLIENT] quota update: {}", state);
        *self.quota.lock().expect("quota mutex poisoned") = Some(state);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Store;
    use crate::status::LogStatusSink;
    use std::sync::atomic::AtomicUsize;

    fn coord() -> SearchCoordinate {
        SearchCoordinate {
            encounter_id: 1069,
            difficulty: 101,
            size: 8,
            region: "EU".into(),
            partition: Some(13),
        }
    }

    #[test]
    fn test_ranking_query_aliases_every_page() {
        let q = ranking_pages_query(&coord(), &[3, 4, 7]);
        for alias in ["p3: characterRankings(page: 3", "p4:", "p7:"] {
            assert!(q.contains(alias), "missing {alias} in {q}");
        }
        assert!(q.contains("partition: 13"));
        assert!(q.contains("rateLimitData"));
        assert!(q.contains("encounter(id: 1069)"));
    }

    #[test]
    fn test_ranking_query_omits_default_partition() {
        let c = SearchCoordinate {
            partition: None,
            ..coord()
        };
        let q = ranking_pages_query(&c, &[1]);
        assert!(!q.contains("partition"));
    }

    #[test]
    fn test_fight_values_query_carries_quota_fields() {
        let q = fight_values_query("abc123", 7);
        assert!(q.contains("report(code: \"abc123\")"));
        assert!(q.contains("fightIDs: [7]"));
        assert!(q.contains("rateLimitData"));
    }

    /// Transport stub returning a fixed body, counting calls.
    struct StubTransport {
        body: Value,
        calls: AtomicUsize,
    }

    impl StubTransport {
        fn new(body: Value) -> Self {
            Self {
                body,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GraphQlTransport for StubTransport {
        async fn execute(&self, _query: &str) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    fn client_with(body: Value) -> QuotaAwareClient<StubTransport> {
        let store = Store::open_in_memory().unwrap();
        QuotaAwareClient::new(
            StubTransport::new(body),
            Arc::new(RateWindowTracker::new(store)),
            Arc::new(LogStatusSink),
        )
    }

    fn exhausted_quota_body() -> Value {
        serde_json::json!({
            "data": {
                "rateLimitData": {
                    "limitPerHour": 3600.0,
                    "pointsSpentThisHour": 3600.0,
                    "pointsResetIn": 900
                }
            }
        })
    }

    #[tokio::test]
    async fn test_query_records_one_unit_per_network_call() {
        let client = client_with(serde_json::json!({ "data": {} }));
        let cancel = CancellationToken::new();

        // 8 aliased pages still cost one short-term unit
        client.query("{}", 8, &cancel).await.unwrap();
        assert_eq!(client.tracker.recent_usage().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_quota_fail_fast_without_network_call() {
        let client = client_with(exhausted_quota_body());
        let cancel = CancellationToken::new();

        // First call teaches the client the budget is gone
        client.query("{}", 1, &cancel).await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);

        // Second call must fail before touching the transport
        let err = client.query("{}", 1, &cancel).await.unwrap_err();
        match err {
            SearchError::QuotaExceeded { minutes_until_reset } => {
                assert_eq!(minutes_until_reset, 15)
            }
            other => panic!("expected quota error, got {other}"),
        }
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
        // And no short-term slot was spent on it
        assert_eq!(client.tracker.recent_usage().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_network() {
        let client = client_with(serde_json::json!({ "data": {} }));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client.query("{}", 1, &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quota_snapshot_updates_from_response() {
        let client = client_with(exhausted_quota_body());
        let cancel = CancellationToken::new();
        assert!(client.quota().is_none());

        client.query("{}", 1, &cancel).await.unwrap();
        let quota = client.quota().expect("quota absorbed");
        assert_eq!(quota.remaining(), 0.0);
        assert_eq!(quota.reset_in_secs, 900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_exhaustion_triggers_countdown_wait() {
        let client = client_with(serde_json::json!({ "data": {} }));
        // Fill the whole window so the next call must sit out the countdown
        client
            .tracker
            .record(crate::config::MAX_REQUESTS_PER_WINDOW)
            .unwrap();

        let cancel = CancellationToken::new();
        client.query("{}", 1, &cancel).await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_countdown_interrupted_by_cancellation() {
        let client = client_with(serde_json::json!({ "data": {} }));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .countdown(Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_refresh_suppressed_while_waiting() {
        let client = client_with(exhausted_quota_body());
        client.waiting.store(true, Ordering::Release);

        let cancel = CancellationToken::new();
        client.refresh_quota(&cancel).await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 0);
    }
}
