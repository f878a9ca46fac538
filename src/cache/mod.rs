//! SQLite-backed ranking cache with crash-safe search sessions.
//!
//! The store is the single shared resource of the engine: it holds fetched
//! ranking pages, the short-term request history, and the marker used to
//! roll back searches that died mid-run. Every entry write is one atomic
//! statement, so concurrent readers never observe a half-written entry.

pub mod schema;

use std::collections::{BTreeSet, HashSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ANONYMOUS_NAME_PREFIX, SESSION_STALE_AFTER_MS};
use crate::types::{CacheEntry, SearchCoordinate};

/// Shared handle to the SQLite store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open store at {}", path.as_ref().display()))?;
        schema::create_tables(&conn).context("failed to create store tables")?;
        info!("[CACHE] store ready at {}", path.as_ref().display());
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        schema::create_tables(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Splits a cache key back into (coordinate prefix, page).
fn parse_key(key: &str) -> Option<(String, u32)> {
    let mut it = key.rsplitn(3, ':');
    let _partition = it.next()?;
    let page = it.next()?.strip_prefix('p')?.parse().ok()?;
    let prefix = it.next()?;
    Some((prefix.to_string(), page))
}

/// In-memory state of the active search session.
struct SessionState {
    started_at_ms: i64,
    keys: HashSet<String>,
}

/// One exported `{key, entry}` pair.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportRecord {
    pub key: String,
    pub entry: CacheEntry,
}

/// Outcome of an import merge.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: usize,
    pub skipped: usize,
}

/// Durable cache of fetched ranking pages, bracketed by search sessions.
pub struct RankingCache {
    store: Arc<Store>,
    session: Mutex<Option<SessionState>>,
}

impl RankingCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            session: Mutex::new(None),
        }
    }

    // === Entry access ===

    pub fn get(&self, coord: &SearchCoordinate, page: u32) -> Result<Option<CacheEntry>> {
        let key = coord.cache_key(page);
        let raw: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT entry FROM ranking_cache WHERE key = ?1",
                [&key],
                |row| row.get(0),
            )
            .optional()
        })?;
        match raw {
            Some(json) => {
                let entry = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt cache entry under {key}"))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Persist one page. Silently refuses empty result lists so a falsely
    /// "confirmed empty" page can never poison range discovery.
    /// Returns whether the entry was written.
    pub fn set(&self, coord: &SearchCoordinate, page: u32, entry: &CacheEntry) -> Result<bool> {
        if entry.rows.is_empty() {
            debug!("[CACHE] refusing empty page {} for {}", page, coord);
            return Ok(false);
        }

        let key = coord.cache_key(page);
        let json = serde_json::to_string(entry)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO ranking_cache (key, coord_prefix, page, created_at, entry)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key, coord.key_prefix(), page, entry.created_at_ms, json],
            )
        })?;

        if let Some(session) = self.session.lock().expect("session mutex poisoned").as_mut() {
            session.keys.insert(key.clone());
        }

        if crate::config::cache_debug_enabled() {
            debug!(
                "[CACHE] stored {} ({} rows, more={})",
                key,
                entry.rows.len(),
                entry.has_more_pages
            );
        }
        Ok(true)
    }

    pub fn has_cache_for(&self, coord: &SearchCoordinate) -> Result<bool> {
        let prefix = coord.key_prefix();
        let count: i64 = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM ranking_cache WHERE coord_prefix = ?1",
                [&prefix],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }

    /// Highest cached page for a coordinate, if any.
    pub fn cached_max_page(&self, coord: &SearchCoordinate) -> Result<Option<u32>> {
        let prefix = coord.key_prefix();
        let max: Option<u32> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT MAX(page) FROM ranking_cache WHERE coord_prefix = ?1",
                [&prefix],
                |row| row.get(0),
            )
        })?;
        Ok(max)
    }

    /// All cached page numbers of a coordinate, ascending.
    pub fn cached_pages(&self, coord: &SearchCoordinate) -> Result<Vec<u32>> {
        let prefix = coord.key_prefix();
        let pages: Vec<u32> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT page FROM ranking_cache WHERE coord_prefix = ?1 ORDER BY page",
            )?;
            let rows = stmt.query_map([&prefix], |row| row.get(0))?;
            rows.collect()
        })?;
        Ok(pages)
    }

    /// Union of player names across all cached pages of a coordinate,
    /// anonymized placeholders excluded.
    pub fn cached_player_names(&self, coord: &SearchCoordinate) -> Result<BTreeSet<String>> {
        let prefix = coord.key_prefix();
        let entries: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT entry FROM ranking_cache WHERE coord_prefix = ?1")?;
            let rows = stmt.query_map([&prefix], |row| row.get::<_, String>(0))?;
            rows.collect()
        })?;

        let mut names = BTreeSet::new();
        for json in entries {
            let entry: CacheEntry = match serde_json::from_str(&json) {
                Ok(e) => e,
                Err(e) => {
                    warn!("[CACHE] skipping corrupt entry during name scan: {}", e);
                    continue;
                }
            };
            for row in entry.rows {
                if !row.name.starts_with(ANONYMOUS_NAME_PREFIX) {
                    names.insert(row.name);
                }
            }
        }
        Ok(names)
    }

    pub fn entry_count(&self) -> Result<usize> {
        let count: i64 = self
            .store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM ranking_cache", [], |r| r.get(0)))?;
        Ok(count as usize)
    }

    // === Search sessions ===

    /// Begin a search session. A leftover marker from a still-recent run is
    /// overwritten with a warning: the store assumes a single active search
    /// context, and the stale case is handled by the startup sweep.
    pub fn start_search(&self) -> Result<()> {
        self.start_search_at(now_ms())
    }

    fn start_search_at(&self, now: i64) -> Result<()> {
        let existing: Option<i64> = self.store.with_conn(|conn| {
            conn.query_row("SELECT started_at FROM search_session WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()
        })?;
        if let Some(started) = existing {
            warn!(
                "[CACHE] replacing leftover session marker ({}s old)",
                (now - started) / 1_000
            );
        }

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO search_session (id, started_at) VALUES (1, ?1)",
                [now],
            )
        })?;
        *self.session.lock().expect("session mutex poisoned") = Some(SessionState {
            started_at_ms: now,
            keys: HashSet::new(),
        });
        Ok(())
    }

    /// Complete the session, keeping everything it wrote.
    pub fn finish_search(&self) -> Result<()> {
        self.store
            .with_conn(|conn| conn.execute("DELETE FROM search_session WHERE id = 1", []))?;
        let taken = self.session.lock().expect("session mutex poisoned").take();
        if let Some(s) = taken {
            debug!("[CACHE] session finished, {} keys kept", s.keys.len());
        }
        Ok(())
    }

    /// Roll back the session: delete every key written since it started,
    /// and nothing else.
    pub fn abort_search(&self) -> Result<usize> {
        let taken = self.session.lock().expect("session mutex poisoned").take();
        let Some(session) = taken else {
            return Ok(0);
        };

        let mut deleted = 0;
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare("DELETE FROM ranking_cache WHERE key = ?1")?;
            for key in &session.keys {
                deleted += stmt.execute([key])?;
            }
            conn.execute("DELETE FROM search_session WHERE id = 1", [])?;
            Ok(())
        })?;

        info!(
            "[CACHE] aborted session from {}ms, removed {} entries",
            session.started_at_ms, deleted
        );
        Ok(deleted)
    }

    /// Startup sweep: a session marker that survived a process death is
    /// detected by age. Entries written at or after the marker are removed;
    /// entries from earlier, completed searches are preserved.
    pub fn cleanup_incomplete_searches(&self) -> Result<usize> {
        self.cleanup_incomplete_searches_at(now_ms())
    }

    fn cleanup_incomplete_searches_at(&self, now: i64) -> Result<usize> {
        let marker: Option<i64> = self.store.with_conn(|conn| {
            conn.query_row("SELECT started_at FROM search_session WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()
        })?;
        let Some(started) = marker else {
            return Ok(0);
        };

        if now - started <= SESSION_STALE_AFTER_MS {
            // The previous run may legitimately still be working.
            debug!("[CACHE] session marker is fresh, leaving it alone");
            return Ok(0);
        }

        let deleted = self.store.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM ranking_cache WHERE created_at >= ?1",
                [started],
            )?;
            conn.execute("DELETE FROM search_session WHERE id = 1", [])?;
            Ok(n)
        })?;
        warn!(
            "[CACHE] unclean shutdown detected, removed {} entries from crashed session",
            deleted
        );
        Ok(deleted)
    }

    // === Export / import ===

    /// Flat ordered sequence of `{key, entry}` pairs as JSON text.
    pub fn export(&self) -> Result<String> {
        let pairs: Vec<(String, String)> = self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, entry FROM ranking_cache ORDER BY key")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;

        let mut records = Vec::with_capacity(pairs.len());
        for (key, json) in pairs {
            let entry: CacheEntry = serde_json::from_str(&json)
                .with_context(|| format!("corrupt cache entry under {key}"))?;
            records.push(ExportRecord { key, entry });
        }
        Ok(serde_json::to_string(&records)?)
    }

    /// Gzipped variant of [`export`](Self::export).
    pub fn export_compressed(&self) -> Result<Vec<u8>> {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let text = self.export()?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes())?;
        Ok(encoder.finish()?)
    }

    /// Keyed merge-by-timestamp: a record replaces an existing entry only if
    /// strictly newer, so replaying the same export is a no-op.
    pub fn import(&self, text: &str) -> Result<ImportStats> {
        let records: Vec<ExportRecord> =
            serde_json::from_str(text).context("unreadable cache export")?;

        let mut stats = ImportStats::default();
        for record in records {
            let Some((prefix, page)) = parse_key(&record.key) else {
                warn!("[CACHE] skipping export record with malformed key {}", record.key);
                stats.skipped += 1;
                continue;
            };
            if record.entry.rows.is_empty() {
                stats.skipped += 1;
                continue;
            }

            let existing: Option<i64> = self.store.with_conn(|conn| {
                conn.query_row(
                    "SELECT created_at FROM ranking_cache WHERE key = ?1",
                    [&record.key],
                    |r| r.get(0),
                )
                .optional()
            })?;
            if let Some(current) = existing {
                if record.entry.created_at_ms <= current {
                    stats.skipped += 1;
                    continue;
                }
            }

            let json = serde_json::to_string(&record.entry)?;
            self.store.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO ranking_cache (key, coord_prefix, page, created_at, entry)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![record.key, prefix, page, record.entry.created_at_ms, json],
                )
            })?;
            stats.imported += 1;
        }

        info!(
            "[CACHE] import merged {} entries, skipped {}",
            stats.imported, stats.skipped
        );
        Ok(stats)
    }

    pub fn import_compressed(&self, data: &[u8]) -> Result<ImportStats> {
        use flate2::read::GzDecoder;

        let mut text = String::new();
        GzDecoder::new(data)
            .read_to_string(&mut text)
            .context("unreadable compressed cache export")?;
        self.import(&text)
    }

    // === User cache management ===

    pub fn clear_coordinate(&self, coord: &SearchCoordinate) -> Result<usize> {
        let prefix = coord.key_prefix();
        let deleted = self.store.with_conn(|conn| {
            conn.execute("DELETE FROM ranking_cache WHERE coord_prefix = ?1", [&prefix])
        })?;
        info!("[CACHE] cleared {} entries for {}", deleted, coord);
        Ok(deleted)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let deleted = self
            .store
            .with_conn(|conn| conn.execute("DELETE FROM ranking_cache", []))?;
        info!("[CACHE] cleared all {} entries", deleted);
        Ok(deleted)
    }
}

// =============================================================================
// TESTS
// =============================================================================
