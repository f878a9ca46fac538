//! Sliding-window tracker of short-term request usage.
//!
//! The remote service enforces a per-window call ceiling independently of
//! its hourly point budget. This tracker is the local source of truth for
//! that ceiling: it persists one record per network call and predicts how
//! long a caller must wait for a slot to free up. State lives in the shared
//! store so it survives restarts and is shared by every client instance
//! bound to the same store — the tracker itself is always an injected
//! dependency, never a global.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rusqlite::params;
use tracing::debug;

use crate::cache::Store;
use crate::config::{MAX_REQUESTS_PER_WINDOW, RATE_WINDOW_MS, WAIT_SAFETY_MARGIN_MS};
use crate::types::RequestRecord;

pub struct RateWindowTracker {
    store: Arc<Store>,
    window_ms: i64,
    max_requests: u32,
    safety_margin_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RateWindowTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_limits(store, RATE_WINDOW_MS, MAX_REQUESTS_PER_WINDOW, WAIT_SAFETY_MARGIN_MS)
    }

    pub fn with_limits(
        store: Arc<Store>,
        window_ms: i64,
        max_requests: u32,
        safety_margin_ms: i64,
    ) -> Self {
        Self {
            store,
            window_ms,
            max_requests,
            safety_margin_ms,
        }
    }

    /// Append a usage record stamped "now".
    pub fn record(&self, count: u32) -> Result<()> {
        self.record_at(now_ms(), count)
    }

    /// Sum of counts still inside the window. Expired records are purged
    /// from the store as a side effect.
    pub fn recent_usage(&self) -> Result<u32> {
        self.recent_usage_at(now_ms())
    }

    pub fn available_slots(&self) -> Result<u32> {
        self.available_slots_at(now_ms())
    }

    /// How long until `needed` slots are simultaneously free, plus a safety
    /// margin. Zero if they already are.
    pub fn wait_time_for(&self, needed: u32) -> Result<Duration> {
        self.wait_time_for_at(now_ms(), needed)
    }

    fn record_at(&self, now: i64, count: u32) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO request_history (timestamp, count) VALUES (?1, ?2)",
                params![now, count],
            )
        })?;
        Ok(())
    }

    fn recent_usage_at(&self, now: i64) -> Result<u32> {
        // A record aged exactly one window no longer counts.
        let cutoff = now - self.window_ms;
        let usage: i64 = self.store.with_conn(|conn| {
            conn.execute("DELETE FROM request_history WHERE timestamp <= ?1", [cutoff])?;
            conn.query_row(
                "SELECT COALESCE(SUM(count), 0) FROM request_history WHERE timestamp > ?1",
                [cutoff],
                |row| row.get(0),
            )
        })?;
        Ok(usage as u32)
    }

    fn available_slots_at(&self, now: i64) -> Result<u32> {
        let usage = self.recent_usage_at(now)?;
        Ok(self.max_requests.saturating_sub(usage))
    }

    fn wait_time_for_at(&self, now: i64, needed: u32) -> Result<Duration> {
        let available = self.available_slots_at(now)?;
        if available >= needed {
            return Ok(Duration::ZERO);
        }
        let deficit = needed - available;

        let cutoff = now - self.window_ms;
        let records: Vec<RequestRecord> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, count FROM request_history
                 WHERE timestamp > ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map([cutoff], |row| {
                Ok(RequestRecord {
                    timestamp_ms: row.get(0)?,
                    count: row.get(1)?,
                })
            })?;
            rows.collect()
        })?;

        // Walk oldest-first until enough old records fall out of the window.
        let mut freed: u32 = 0;
        let mut wait_ms: i64 = 0;
        for record in &records {
            freed += record.count;
            wait_ms = (record.timestamp_ms + self.window_ms - now).max(0);
            if freed >= deficit {
                break;
            }
        }

        let total = wait_ms + self.safety_margin_ms;
        debug!(
            "[RATE] need {} slot(s), {} free, predicted wait {}ms",
            needed, available, total
        );
        Ok(Duration::from_millis(total as u64))
    }
}

// =============================================================================
// TESTS
// =============================================================================
