//! Adaptive discovery of the remote result-set size.
//!
//! The service never advertises how many ranking pages a coordinate has,
//! so the last page is found by binary search: a non-empty probe becomes
//! the new best-known page and the search moves up, an empty probe moves
//! it down. A probe error shrinks the range the same way an empty page
//! does — underestimating the range is safe, aborting the whole search
//! over one transient failure is not.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MAX_PAGES;
use crate::error::SearchError;
use crate::types::SearchCoordinate;

/// Fetches one page and reports whether it holds any ranking rows.
#[async_trait]
pub trait PageProbe: Send + Sync {
    async fn page_has_rankings(
        &self,
        coord: &SearchCoordinate,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<bool, SearchError>;
}

/// Highest page of `coord` with at least one ranking row, or `None` when
/// even page 1 comes back empty. Only cancellation aborts early.
pub async fn discover_max_page(
    probe: &dyn PageProbe,
    coord: &SearchCoordinate,
    cancel: &CancellationToken,
) -> Result<Option<u32>, SearchError> {
    let mut low = 1u32;
    let mut high = MAX_PAGES;
    let mut best: Option<u32> = None;
    let mut probes = 0u32;

    while low <= high {
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let mid = low + (high - low) / 2;
        probes += 1;

        let populated = match probe.page_has_rankings(coord, mid, cancel).await {
            Ok(populated) => populated,
            Err(SearchError::Cancelled) => return Err(SearchError::Cancelled),
            Err(e) => {
                // Treat like an empty page; a false negative only shrinks
                // the estimated range.
                warn!("[SEARCH] probe of page {} failed ({}), narrowing down", mid, e);
                false
            }
        };

        debug!("[SEARCH] probe page {} -> populated={}", mid, populated);
        if populated {
            best = Some(mid);
            low = mid + 1;
        } else {
            // mid == 1 drives high to 0, which terminates the loop
            high = mid.saturating_sub(1);
        }
    }

    info!(
        "[SEARCH] range discovery for {} finished: max page {:?} in {} probes",
        coord, best, probes
    );
    Ok(best)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coord() -> SearchCoordinate {
        SearchCoordinate {
            encounter_id: 1069,
            difficulty: 101,
            size: 8,
            region: "EU".into(),
            partition: None,
        }
    }

    /// Pages 1..=max_populated are non-empty; counts probes; optionally
    /// errors on a specific page.
    struct StubProbe {
        max_populated: u32,
        error_on: Option<u32>,
        probes: AtomicU32,
    }

    impl StubProbe {
        fn new(max_populated: u32) -> Self {
            Self {
                max_populated,
                error_on: None,
                probes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PageProbe for StubProbe {
        async fn page_has_rankings(
            &self,
            _coord: &SearchCoordinate,
            page: u32,
            _cancel: &CancellationToken,
        ) -> Result<bool, SearchError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.error_on == Some(page) {
                return Err(SearchError::Api("boom".into()));
            }
            Ok(page <= self.max_populated)
        }
    }

    #[tokio::test]
    async fn test_converges_to_last_populated_page() {
        let probe = StubProbe::new(47);
        let cancel = CancellationToken::new();

        let max = discover_max_page(&probe, &coord(), &cancel).await.unwrap();
        assert_eq!(max, Some(47));

        // O(log 1600): the bisection never needs more than 11 probes
        assert!(
            probe.probes.load(Ordering::SeqCst) <= 11,
            "took {} probes",
            probe.probes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_empty_result_set_yields_none() {
        let probe = StubProbe::new(0);
        let cancel = CancellationToken::new();

        let max = discover_max_page(&probe, &coord(), &cancel).await.unwrap();
        assert_eq!(max, None);
    }

    #[tokio::test]
    async fn test_single_page_result_set() {
        let probe = StubProbe::new(1);
        let cancel = CancellationToken::new();

        let max = discover_max_page(&probe, &coord(), &cancel).await.unwrap();
        assert_eq!(max, Some(1));
    }

    #[tokio::test]
    async fn test_full_range_result_set() {
        let probe = StubProbe::new(MAX_PAGES);
        let cancel = CancellationToken::new();

        let max = discover_max_page(&probe, &coord(), &cancel).await.unwrap();
        assert_eq!(max, Some(MAX_PAGES));
    }

    #[tokio::test]
    async fn test_probe_error_narrows_instead_of_aborting() {
        // First probe (page 800) errors; discovery must keep going and
        // still converge inside the lower half.
        let probe = StubProbe {
            error_on: Some(800),
            ..StubProbe::new(47)
        };
        let cancel = CancellationToken::new();

        let max = discover_max_page(&probe, &coord(), &cancel).await.unwrap();
        assert_eq!(max, Some(47));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_immediately() {
        let probe = StubProbe::new(47);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = discover_max_page(&probe, &coord(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(probe.probes.load(Ordering::SeqCst), 0);
    }
}
