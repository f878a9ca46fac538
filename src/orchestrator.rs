//! Search orchestration across one or more anonymized fights.
//!
//! One run brackets one cache session. Fights with existing cache go
//! first (they may finish without a single network call), each fight walks
//! discovery → batched fetch rounds → heuristic match → verification, and
//! everything happens strictly sequentially: the two rate budgets are
//! shared, so concurrency would only steal from itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::RankingCache;
use crate::client::{GraphQlTransport, QuotaAwareClient};
use crate::config::MAX_BATCH_PAGES;
use crate::discovery::discover_max_page;
use crate::error::SearchError;
use crate::fetcher::{budget_pages, next_batch_size, BatchFetcher};
use crate::matching::MatchEngine;
use crate::status::StatusSink;
use crate::types::{AnonymizedFight, SearchCoordinate, VerifiedMatch};

/// One fight plus the ranking list it must be searched in.
#[derive(Debug, Clone)]
pub struct SearchTarget {
    pub fight: AnonymizedFight,
    pub coord: SearchCoordinate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Return as soon as one fight produces a verified match.
    SingleFight,
    /// Process every fight, reporting each outcome incrementally.
    MultiFight,
}

/// Result of searching one fight.
#[derive(Debug)]
pub struct FightOutcome {
    pub fight_id: u32,
    pub matches: Vec<VerifiedMatch>,
    pub candidates_considered: usize,
    pub pages_scanned: usize,
}

/// Aggregate result of a completed run.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub fights: Vec<FightOutcome>,
}

impl SearchOutcome {
    pub fn all_matches(&self) -> impl Iterator<Item = &VerifiedMatch> {
        self.fights.iter().flat_map(|f| f.matches.iter())
    }
}

pub struct SearchOrchestrator<'a, T> {
    client: &'a QuotaAwareClient<T>,
    cache: &'a RankingCache,
    status: Arc<dyn StatusSink>,
}

impl<'a, T: GraphQlTransport> SearchOrchestrator<'a, T> {
    pub fn new(
        client: &'a QuotaAwareClient<T>,
        cache: &'a RankingCache,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            client,
            cache,
            status,
        }
    }

    /// Run one search. Terminal states: `Ok` (completed, possibly without a
    /// match), `Err(Cancelled)` (session rolled back), or a fatal error
    /// (session closed, fetched data kept — it is valid).
    pub async fn run(
        &self,
        targets: Vec<SearchTarget>,
        mode: SearchMode,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&FightOutcome),
    ) -> Result<SearchOutcome, SearchError> {
        self.cache.start_search()?;
        let result = self.run_inner(targets, mode, cancel, progress).await;

        match &result {
            Err(SearchError::Cancelled) => {
                let removed = self.cache.abort_search()?;
                info!("[SEARCH] cancelled, rolled back {} cache entries", removed);
            }
            _ => {
                // Completed or fatal: what was fetched is real data, keep it.
                self.cache.finish_search()?;
            }
        }
        result
    }

    async fn run_inner(
        &self,
        targets: Vec<SearchTarget>,
        mode: SearchMode,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&FightOutcome),
    ) -> Result<SearchOutcome, SearchError> {
        let targets = self.order_cached_first(targets)?;
        let mut outcome = SearchOutcome::default();

        for target in targets {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }

            let fight_outcome = self.search_fight(&target, cancel).await?;
            let found = !fight_outcome.matches.is_empty();
            progress(&fight_outcome);
            outcome.fights.push(fight_outcome);

            if found && mode == SearchMode::SingleFight {
                return Ok(outcome);
            }
        }
        Ok(outcome)
    }

    /// Fights that already have cache come first; their search may complete
    /// without spending any budget at all.
    fn order_cached_first(
        &self,
        targets: Vec<SearchTarget>,
    ) -> Result<Vec<SearchTarget>, SearchError> {
        let mut keyed: Vec<(bool, SearchTarget)> = Vec::with_capacity(targets.len());
        for target in targets {
            let cached = self.cache.has_cache_for(&target.coord)?;
            keyed.push((cached, target));
        }
        keyed.sort_by_key(|(cached, _)| !*cached);
        Ok(keyed.into_iter().map(|(_, t)| t).collect())
    }

    async fn search_fight(
        &self,
        target: &SearchTarget,
        cancel: &CancellationToken,
    ) -> Result<FightOutcome, SearchError> {
        let fight = &target.fight;
        let coord = &target.coord;
        let fetcher = BatchFetcher::new(self.client, self.cache);
        let engine = MatchEngine::new(fight.clone());

        self.status
            .status("Searching", &format!("fight {} in {}", fight.id, coord));

        // Known end of the result set: the cache's word if it has one,
        // otherwise adaptive probing.
        let max_page = match self.cache.cached_max_page(coord)? {
            Some(page) => Some(page),
            None => discover_max_page(&fetcher, coord, cancel).await?,
        };
        let Some(max_page) = max_page else {
            info!("[SEARCH] {} has no rankings at all", coord);
            return Ok(FightOutcome {
                fight_id: fight.id,
                matches: Vec::new(),
                candidates_considered: 0,
                pages_scanned: 0,
            });
        };

        // Fetch rounds
        let cached: BTreeSet<u32> = self.cache.cached_pages(coord)?.into_iter().collect();
        let mut collected = Vec::new();
        let mut pages_scanned = 0usize;
        let mut current = 1u32;
        let mut keep_going = true;

        while keep_going && current <= max_page {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }

            // Drain a contiguous cached run without touching the sizing
            // bounds; those pages are free.
            let mut run_end = current;
            while run_end <= max_page && cached.contains(&run_end) {
                run_end += 1;
            }

            let last = if run_end > current {
                run_end - 1
            } else {
                let known_remaining = max_page - current + 1;
                let uncached_remaining =
                    (current..=max_page).filter(|p| !cached.contains(p)).count() as u32;
                let size = next_batch_size(
                    MAX_BATCH_PAGES,
                    budget_pages(self.client.estimated_remaining_points()),
                    known_remaining,
                    uncached_remaining,
                );
                if size == 0 {
                    // Only the point budget can zero this out here; fail the
                    // same way a speculative call would have.
                    let minutes = self
                        .client
                        .quota()
                        .map(|q| q.minutes_until_reset())
                        .unwrap_or(60);
                    return Err(SearchError::QuotaExceeded {
                        minutes_until_reset: minutes,
                    });
                }
                current + size - 1
            };

            let round = fetcher.fetch_pages(coord, current, last, cancel).await?;
            pages_scanned += round.pages.len();
            keep_going = round.continue_pagination;
            current = last + 1;
            collected.extend(round.pages);
        }

        // Heuristic pass over everything fetched
        let mut candidates = Vec::new();
        let mut label = String::new();
        for (_, entry) in &collected {
            if label.is_empty() {
                label = entry.label.clone();
            }
            for row in &entry.rows {
                if let Some(candidate) = engine.heuristic_match(row) {
                    candidates.push(candidate);
                }
            }
        }
        info!(
            "[SEARCH] fight {}: {} pages scanned, {} heuristic candidate(s)",
            fight.id,
            pages_scanned,
            candidates.len()
        );

        // Verification pass; failures only demote
        let candidates_considered = candidates.len();
        let mut matches = Vec::new();
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            if engine.verify(self.client, &candidate, cancel).await {
                self.status.status(
                    "Match verified",
                    &format!("{} for fight {}", candidate.row.name, fight.id),
                );
                matches.push(VerifiedMatch {
                    fight_id: fight.id,
                    candidate,
                    label: label.clone(),
                });
            } else {
                warn!(
                    "[SEARCH] candidate {} matched on timing but failed verification",
                    candidate.row.name
                );
            }
        }

        Ok(FightOutcome {
            fight_id: fight.id,
            matches,
            candidates_considered,
            pages_scanned,
        })
    }
}
