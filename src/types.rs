//! Core type definitions and data structures for the search engine.
//!
//! This module provides the foundational types for search coordinates,
//! cached ranking pages, quota accounting, and match results.

use serde::{Deserialize, Serialize};

// === Search Coordinates ===

/// Identifies one logically distinct ranking list on the remote service.
///
/// Stable for the lifetime of a boss/difficulty/region/partition combination,
/// so cache entries keyed by a coordinate never go stale relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchCoordinate {
    pub encounter_id: u32,
    pub difficulty: u32,
    pub size: u32,
    /// Region short code (e.g. "EU", "NA")
    pub region: String,
    /// Ranking partition; `None` selects the service default
    pub partition: Option<u32>,
}

impl SearchCoordinate {
    /// Key prefix shared by every page of this coordinate.
    pub fn key_prefix(&self) -> String {
        format!(
            "enc:{}:d{}:s{}:{}",
            self.encounter_id, self.difficulty, self.size, self.region
        )
    }

    /// Full store key for one page of this coordinate.
    pub fn cache_key(&self, page: u32) -> String {
        let partition = match self.partition {
            Some(p) => p.to_string(),
            None => "default".to_string(),
        };
        format!("{}:p{}:{}", self.key_prefix(), page, partition)
    }
}

impl std::fmt::Display for SearchCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "encounter {} (difficulty {}, size {}, {})",
            self.encounter_id, self.difficulty, self.size, self.region
        )
    }
}

// === Cached Ranking Data ===

/// One minimized ranking record as stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRow {
    pub name: String,
    /// Absolute fight start time, unix milliseconds
    pub start_time_ms: i64,
    pub duration_ms: i64,
    /// Performance value reported by the ranking (e.g. damage per second)
    pub amount: f64,
    pub server: String,
    pub region: String,
    /// Public report owning this ranking
    pub report_code: String,
    pub fight_id: u32,
}

/// One cached page of ranking results.
///
/// Invariant: an entry with empty `rows` is never persisted — an empty page
/// must stay indistinguishable from an unfetched one so range discovery is
/// free to re-probe it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub rows: Vec<RankingRow>,
    /// More pages exist beyond this one
    pub has_more_pages: bool,
    /// Human-readable encounter/partition label
    pub label: String,
    /// Creation timestamp, unix milliseconds
    pub created_at_ms: i64,
}

// === Quota Accounting ===

/// One appended record of short-term request usage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestRecord {
    pub timestamp_ms: i64,
    pub count: u32,
}

/// Long-term point budget as reported by the remote service.
///
/// Supplied exclusively by the service on each response; never synthesized
/// locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaState {
    pub limit_per_hour: f64,
    pub points_spent: f64,
    pub reset_in_secs: i64,
}

impl QuotaState {
    /// Estimated remaining point budget, floored at zero.
    pub fn remaining(&self) -> f64 {
        (self.limit_per_hour - self.points_spent).max(0.0)
    }

    /// Whole minutes until the hourly budget resets, rounded up.
    pub fn minutes_until_reset(&self) -> i64 {
        (self.reset_in_secs + 59) / 60
    }
}

impl std::fmt::Display for QuotaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.0}/{:.0} points spent, reset in {}s",
            self.points_spent, self.limit_per_hour, self.reset_in_secs
        )
    }
}

// === Search Targets and Results ===

/// The anonymized fight being identified. Immutable for one search run.
#[derive(Debug, Clone)]
pub struct AnonymizedFight {
    pub id: u32,
    /// Code of the anonymized report this fight belongs to
    pub report_code: String,
    /// Absolute fight start time, unix milliseconds
    pub start_time_ms: i64,
    pub duration_ms: i64,
}

/// A ranking row that passed the heuristic time/duration comparison.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub row: RankingRow,
    pub time_delta_ms: i64,
    pub duration_delta_ms: i64,
}

/// A candidate that additionally passed cross-fight value verification.
#[derive(Debug, Clone)]
pub struct VerifiedMatch {
    pub fight_id: u32,
    pub candidate: MatchCandidate,
    /// Encounter/partition label carried over from the cache entry
    pub label: String,
}

impl std::fmt::Display for VerifiedMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = &self.candidate;
        write!(
            f,
            "{} ({}-{}) report {} fight {} [dt {}ms, dd {}ms]",
            c.row.name,
            c.row.server,
            c.row.region,
            c.row.report_code,
            c.row.fight_id,
            c.time_delta_ms,
            c.duration_delta_ms
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================
