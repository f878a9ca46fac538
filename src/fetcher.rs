//! Batched page fetching with bounded retry.
//!
//! A fetch round partitions its page range into already-cached pages (read
//! directly, no traffic) and missing pages, which are merged into a single
//! aliased GraphQL call. A failed batch is retried a fixed number of times
//! and then aborts the whole search: letting a page silently drop out would
//! corrupt the continuation and range bookkeeping the search relies on.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::RankingCache;
use crate::client::{ranking_pages_query, GraphQlTransport, QuotaAwareClient};
use crate::config::{FETCH_RETRY_DELAY_MS, FETCH_RETRY_LIMIT, POINTS_PER_REQUEST};
use crate::discovery::PageProbe;
use crate::error::SearchError;
use crate::types::{CacheEntry, RankingRow, SearchCoordinate};

/// Pages delivered by one fetch round, in page order, plus whether the
/// last page of the range advertises further pages.
#[derive(Debug)]
pub struct FetchRound {
    pub pages: Vec<(u32, CacheEntry)>,
    pub continue_pagination: bool,
}

/// Number of pages the next round may request: the minimum of the fixed
/// cap, the pages the point budget still covers, the remainder of the
/// known range, and the truly uncached remainder. Zero is the stop
/// sentinel.
pub fn next_batch_size(
    cap: u32,
    budget_pages: Option<u32>,
    known_remaining: u32,
    uncached_remaining: u32,
) -> u32 {
    let mut size = cap.min(known_remaining).min(uncached_remaining);
    if let Some(budget) = budget_pages {
        size = size.min(budget);
    }
    size
}

/// Pages the current point budget can still pay for.
pub fn budget_pages(remaining_points: Option<f64>) -> Option<u32> {
    remaining_points.map(|points| (points / POINTS_PER_REQUEST).floor().max(0.0) as u32)
}

pub struct BatchFetcher<'a, T> {
    client: &'a QuotaAwareClient<T>,
    cache: &'a RankingCache,
}

impl<'a, T: GraphQlTransport> BatchFetcher<'a, T> {
    pub fn new(client: &'a QuotaAwareClient<T>, cache: &'a RankingCache) -> Self {
        Self { client, cache }
    }

    /// Fetch the inclusive page range `[first, last]` of `coord`.
    pub async fn fetch_pages(
        &self,
        coord: &SearchCoordinate,
        first: u32,
        last: u32,
        cancel: &CancellationToken,
    ) -> Result<FetchRound, SearchError> {
        let mut found: FxHashMap<u32, CacheEntry> = FxHashMap::default();
        let mut missing: Vec<u32> = Vec::new();

        for page in first..=last {
            match self.cache.get(coord, page)? {
                Some(entry) => {
                    found.insert(page, entry);
                }
                None => missing.push(page),
            }
        }

        if missing.is_empty() {
            debug!(
                "[SEARCH] pages {}..={} of {} fully cached, skipping network",
                first, last, coord
            );
        } else {
            let fetched = self.fetch_missing(coord, &missing, cancel).await?;
            for (page, entry) in fetched {
                found.insert(page, entry);
            }
        }

        let mut pages: Vec<(u32, CacheEntry)> = found.into_iter().collect();
        pages.sort_by_key(|(page, _)| *page);

        // The flag of the last page in the range decides whether the outer
        // pagination loop keeps going; an absent last page means the range
        // ran past the end of the result set.
        let continue_pagination = pages
            .iter()
            .find(|(page, _)| *page == last)
            .map(|(_, entry)| entry.has_more_pages)
            .unwrap_or(false);

        Ok(FetchRound {
            pages,
            continue_pagination,
        })
    }

    /// One aliased network call for all missing pages, with bounded retry.
    async fn fetch_missing(
        &self,
        coord: &SearchCoordinate,
        missing: &[u32],
        cancel: &CancellationToken,
    ) -> Result<Vec<(u32, CacheEntry)>, SearchError> {
        let query = ranking_pages_query(coord, missing);
        let cost = missing.len() as u32;

        let mut attempt = 0;
        let data = loop {
            attempt += 1;
            match self.client.query(&query, cost, cancel).await {
                Ok(data) => break data,
                // Not retryable: waiting out the budget clock or the user
                // is someone else's decision.
                Err(e @ (SearchError::Cancelled | SearchError::QuotaExceeded { .. })) => {
                    return Err(e)
                }
                Err(e) if attempt < FETCH_RETRY_LIMIT => {
                    warn!(
                        "[SEARCH] batch fetch attempt {}/{} failed: {}",
                        attempt, FETCH_RETRY_LIMIT, e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SearchError::Cancelled),
                        _ = tokio::time::sleep(std::time::Duration::from_millis(FETCH_RETRY_DELAY_MS)) => {}
                    }
                }
                Err(e) => {
                    return Err(SearchError::DataRequestFailed(format!(
                        "pages {:?} of {} after {} attempts: {}",
                        missing, coord, attempt, e
                    )))
                }
            }
        };

        let parsed = parse_ranking_pages(&data, coord, missing);
        info!(
            "[SEARCH] fetched {} of {} requested pages for {}",
            parsed.len(),
            missing.len(),
            coord
        );

        // Cancellation observed after the call still means: no more writes.
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        for (page, entry) in &parsed {
            self.cache.set(coord, *page, entry)?;
        }
        Ok(parsed)
    }
}

#[async_trait]
impl<T: GraphQlTransport> PageProbe for BatchFetcher<'_, T> {
    /// Single-attempt probe used by range discovery. Cached pages answer
    /// without traffic; fetched non-empty pages are persisted on the spot.
    async fn page_has_rankings(
        &self,
        coord: &SearchCoordinate,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<bool, SearchError> {
        if self.cache.get(coord, page)?.is_some() {
            return Ok(true);
        }

        let query = ranking_pages_query(coord, &[page]);
        let data = self.client.query(&query, 1, cancel).await?;
        let parsed = parse_ranking_pages(&data, coord, &[page]);

        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        for (page, entry) in &parsed {
            self.cache.set(coord, *page, entry)?;
        }
        Ok(!parsed.is_empty())
    }
}

/// Decode the aliased pages out of a `worldData.encounter` response.
/// Pages that are absent, malformed, or empty simply do not appear in the
/// result; rows that fail to decode are skipped individually.
fn parse_ranking_pages(
    data: &Value,
    coord: &SearchCoordinate,
    pages: &[u32],
) -> Vec<(u32, CacheEntry)> {
    let Some(encounter) = data.get("worldData").and_then(|w| w.get("encounter")) else {
        return Vec::new();
    };

    let encounter_name = encounter
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unknown encounter");
    let label = match coord.partition {
        Some(p) => format!("{encounter_name} (partition {p})"),
        None => encounter_name.to_string(),
    };
    let now = chrono::Utc::now().timestamp_millis();

    let mut out = Vec::new();
    for &page in pages {
        let Some(block) = encounter.get(format!("p{page}")) else {
            continue;
        };
        let rows: Vec<RankingRow> = block
            .get("rankings")
            .and_then(Value::as_array)
            .map(|rankings| rankings.iter().filter_map(parse_row).collect())
            .unwrap_or_default();
        if rows.is_empty() {
            continue;
        }

        let has_more_pages = block
            .get("hasMorePages")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        out.push((
            page,
            CacheEntry {
                rows,
                has_more_pages,
                label: label.clone(),
                created_at_ms: now,
            },
        ));
    }
    out
}

fn parse_row(value: &Value) -> Option<RankingRow> {
    Some(RankingRow {
        name: value.get("name")?.as_str()?.to_string(),
        start_time_ms: value.get("startTime")?.as_i64()?,
        duration_ms: value.get("duration")?.as_i64()?,
        amount: value.get("amount")?.as_f64()?,
        server: value
            .get("server")?
            .get("name")?
            .as_str()?
            .to_string(),
        region: value
            .get("server")?
            .get("region")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        report_code: value.get("report")?.get("code")?.as_str()?.to_string(),
        fight_id: value.get("report")?.get("fightID")?.as_u64()? as u32,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Store;
    use crate::rate_window::RateWindowTracker;
    use crate::status::LogStatusSink;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn coord() -> SearchCoordinate {
        SearchCoordinate {
            encounter_id: 1069,
            difficulty: 101,
            size: 8,
            region: "EU".into(),
            partition: None,
        }
    }

    // --- next_batch_size ---

    #[test]
    fn test_batch_size_takes_minimum_of_bounds() {
        assert_eq!(next_batch_size(8, Some(100), 50, 50), 8);
        assert_eq!(next_batch_size(8, Some(3), 50, 50), 3);
        assert_eq!(next_batch_size(8, Some(100), 2, 50), 2);
        assert_eq!(next_batch_size(8, Some(100), 50, 5), 5);
    }

    #[test]
    fn test_batch_size_unknown_budget_is_unbounded() {
        assert_eq!(next_batch_size(8, None, 50, 50), 8);
    }

    #[test]
    fn test_batch_size_stop_sentinel() {
        assert_eq!(next_batch_size(8, Some(0), 50, 50), 0);
        assert_eq!(next_batch_size(8, Some(100), 0, 50), 0);
        assert_eq!(next_batch_size(8, Some(100), 50, 0), 0);
    }

    #[test]
    fn test_budget_pages_floors() {
        // 10 points at 1.5 points/request pay for 6 pages
        assert_eq!(budget_pages(Some(10.0)), Some(6));
        assert_eq!(budget_pages(Some(0.5)), Some(0));
        assert_eq!(budget_pages(None), None);
    }

    // --- fetch rounds over a scripted transport ---

    struct SeqTransport {
        responses: Mutex<VecDeque<anyhow::Result<Value>>>,
        queries: Mutex<Vec<String>>,
    }

    impl SeqTransport {
        fn new(responses: Vec<anyhow::Result<Value>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GraphQlTransport for Arc<SeqTransport> {
        async fn execute(&self, query: &str) -> anyhow::Result<Value> {
            self.queries.lock().unwrap().push(query.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no scripted response left")))
        }
    }

    fn ranking_body(pages: &[(u32, &[&str], bool)]) -> Value {
        let mut encounter = serde_json::json!({ "name": "Test Encounter" });
        for (page, names, has_more) in pages {
            let rankings: Vec<Value> = names
                .iter()
                .map(|n| {
                    serde_json::json!({
                        "name": n,
                        "startTime": 1_000,
                        "duration": 5_000,
                        "amount": 9_000.5,
                        "server": { "name": "Shiva", "region": "EU" },
                        "report": { "code": "pub123", "fightID": 4 }
                    })
                })
                .collect();
            encounter[format!("p{page}")] = serde_json::json!({
                "page": page,
                "hasMorePages": has_more,
                "rankings": rankings,
            });
        }
        serde_json::json!({ "data": { "worldData": { "encounter": encounter } } })
    }

    fn harness(
        responses: Vec<anyhow::Result<Value>>,
    ) -> (
        QuotaAwareClient<Arc<SeqTransport>>,
        RankingCache,
        Arc<SeqTransport>,
    ) {
        let store = Store::open_in_memory().unwrap();
        let transport = Arc::new(SeqTransport::new(responses));
        let client = QuotaAwareClient::new(
            transport.clone(),
            Arc::new(RateWindowTracker::new(store.clone())),
            Arc::new(LogStatusSink),
        );
        (client, RankingCache::new(store), transport)
    }

    fn seed_cache(cache: &RankingCache, pages: &[u32]) {
        for &page in pages {
            let entry = CacheEntry {
                rows: vec![RankingRow {
                    name: format!("Cached {page}"),
                    start_time_ms: 1_000,
                    duration_ms: 5_000,
                    amount: 1.0,
                    server: "Shiva".into(),
                    region: "EU".into(),
                    report_code: "old".into(),
                    fight_id: 1,
                }],
                has_more_pages: true,
                label: "Test Encounter".into(),
                created_at_ms: 100,
            };
            cache.set(&coord(), page, &entry).unwrap();
        }
    }

    #[tokio::test]
    async fn test_only_missing_pages_go_over_the_wire() {
        // Pages 1..=10 requested, 6 already cached: one call for the 4 others
        let body = ranking_body(&[
            (3, &["A"], true),
            (6, &["B"], true),
            (8, &["C"], true),
            (10, &["D"], false),
        ]);
        let (client, cache, transport) = harness(vec![Ok(body)]);
        seed_cache(&cache, &[1, 2, 4, 5, 7, 9]);

        let fetcher = BatchFetcher::new(&client, &cache);
        let cancel = CancellationToken::new();
        let round = fetcher.fetch_pages(&coord(), 1, 10, &cancel).await.unwrap();

        assert_eq!(transport.calls(), 1);
        let query = &transport.queries.lock().unwrap()[0];
        for present in ["p3:", "p6:", "p8:", "p10:"] {
            assert!(query.contains(present), "expected {present} in {query}");
        }
        for absent in ["p1:", "p2:", "p4:", "p5:", "p7:", "p9:"] {
            assert!(!query.contains(absent), "unexpected {absent} in {query}");
        }

        assert_eq!(round.pages.len(), 10);
        assert!(!round.continue_pagination, "last page said no more");
    }

    #[tokio::test]
    async fn test_fully_cached_range_skips_network() {
        let (client, cache, transport) = harness(vec![]);
        seed_cache(&cache, &[1, 2, 3]);

        let fetcher = BatchFetcher::new(&client, &cache);
        let cancel = CancellationToken::new();
        let round = fetcher.fetch_pages(&coord(), 1, 3, &cancel).await.unwrap();

        assert_eq!(transport.calls(), 0);
        assert_eq!(round.pages.len(), 3);
        assert!(round.continue_pagination, "cached page 3 advertised more");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_fatal_error() {
        let (client, cache, transport) = harness(vec![
            Err(anyhow!("flaky")),
            Err(anyhow!("flaky")),
            Err(anyhow!("flaky")),
        ]);
        let fetcher = BatchFetcher::new(&client, &cache);
        let cancel = CancellationToken::new();

        let err = fetcher
            .fetch_pages(&coord(), 1, 2, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::DataRequestFailed(_)));
        assert_eq!(transport.calls(), FETCH_RETRY_LIMIT as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let body = ranking_body(&[(1, &["A"], true)]);
        let (client, cache, transport) = harness(vec![Err(anyhow!("flaky")), Ok(body)]);
        let fetcher = BatchFetcher::new(&client, &cache);
        let cancel = CancellationToken::new();

        let round = fetcher.fetch_pages(&coord(), 1, 1, &cancel).await.unwrap();
        assert_eq!(transport.calls(), 2);
        assert_eq!(round.pages.len(), 1);
        assert!(round.continue_pagination);
    }

    #[tokio::test]
    async fn test_fetched_pages_are_persisted_empty_ones_not() {
        // Page 2 comes back with rows, page 3 empty
        let body = ranking_body(&[(2, &["A"], true), (3, &[], false)]);
        let (client, cache, _transport) = harness(vec![Ok(body)]);
        let fetcher = BatchFetcher::new(&client, &cache);
        let cancel = CancellationToken::new();

        let round = fetcher.fetch_pages(&coord(), 2, 3, &cancel).await.unwrap();
        assert_eq!(round.pages.len(), 1);
        assert!(!round.continue_pagination, "missing last page ends pagination");

        assert!(cache.get(&coord(), 2).unwrap().is_some());
        assert!(cache.get(&coord(), 3).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_uses_cache_before_network() {
        let (client, cache, transport) = harness(vec![]);
        seed_cache(&cache, &[5]);
        let fetcher = BatchFetcher::new(&client, &cache);
        let cancel = CancellationToken::new();

        assert!(fetcher
            .page_has_rankings(&coord(), 5, &cancel)
            .await
            .unwrap());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_probe_fetches_and_persists_populated_page() {
        let body = ranking_body(&[(9, &["A"], true)]);
        let (client, cache, _transport) = harness(vec![Ok(body)]);
        let fetcher = BatchFetcher::new(&client, &cache);
        let cancel = CancellationToken::new();

        assert!(fetcher
            .page_has_rankings(&coord(), 9, &cancel)
            .await
            .unwrap());
        assert!(cache.get(&coord(), 9).unwrap().is_some());

        // An empty page reports false and is not persisted
        let body = ranking_body(&[]);
        let (client, cache, _transport) = harness(vec![Ok(body)]);
        let fetcher = BatchFetcher::new(&client, &cache);
        assert!(!fetcher
            .page_has_rankings(&coord(), 9, &cancel)
            .await
            .unwrap());
        assert!(cache.get(&coord(), 9).unwrap().is_none());
    }
}
