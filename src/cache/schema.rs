//! Database schema creation.

use rusqlite::{Connection, Result};

/// Create all store tables and indexes.
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Ranking cache: one row per coordinate+page
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ranking_cache (
            key TEXT PRIMARY KEY,
            coord_prefix TEXT NOT NULL,
            page INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            entry TEXT NOT NULL
        )",
        [],
    )?;

    // Request history: short-term window usage, one row per network call
    conn.execute(
        "CREATE TABLE IF NOT EXISTS request_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            count INTEGER NOT NULL
        )",
        [],
    )?;

    // Single-row marker of the active search session
    conn.execute(
        "CREATE TABLE IF NOT EXISTS search_session (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            started_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Prefix scans stay proportional to one coordinate's cache
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cache_prefix ON ranking_cache(coord_prefix, page)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cache_created ON ranking_cache(created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_requests_time ON request_history(timestamp)",
        [],
    )?;

    Ok(())
}
