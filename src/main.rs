//! Anonymized Report Identification CLI
//!
//! Resolves the fights of an anonymized combat-log report, then searches
//! the ranking service for public records whose timing and performance
//! fingerprint match, staying inside the service's dual rate budgets.
//!
//! ## Usage
//!
//! ```text
//! logsleuth <report-code> [fight-id]   search one report (optionally one fight)
//! logsleuth cache-export <file>        export the ranking cache (.gz compresses)
//! logsleuth cache-import <file>        merge a previously exported cache
//! logsleuth cache-clear                drop every cached ranking page
//! ```

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use logsleuth::cache::{RankingCache, Store};
use logsleuth::client::{report_fights_query, HttpTransport, QuotaAwareClient};
use logsleuth::config::DEFAULT_STORE_PATH;
use logsleuth::error::SearchError;
use logsleuth::orchestrator::{FightOutcome, SearchMode, SearchOrchestrator, SearchTarget};
use logsleuth::rate_window::RateWindowTracker;
use logsleuth::status::{ConfirmSink, CredentialsProvider, EnvCredentials, LogStatusSink};
use logsleuth::types::{AnonymizedFight, SearchCoordinate};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging to both stdout and a file
    let file_appender = tracing_appender::rolling::never(".", "logsleuth.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("logsleuth=info".parse().unwrap());

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let store_path =
        std::env::var("LOGSLEUTH_STORE").unwrap_or_else(|_| DEFAULT_STORE_PATH.to_string());
    let store = Store::open(&store_path)?;
    let cache = RankingCache::new(store.clone());

    // Sweep up after any run that died mid-search before touching the cache
    let swept = cache.cleanup_incomplete_searches()?;
    if swept > 0 {
        warn!("[CACHE] removed {} entries left by an unfinished search", swept);
    }

    match args.first().map(String::as_str) {
        Some("cache-export") => {
            let path = args
                .get(1)
                .ok_or_else(|| anyhow!("cache-export needs a file path"))?;
            cmd_cache_export(&cache, path)
        }
        Some("cache-import") => {
            let path = args
                .get(1)
                .ok_or_else(|| anyhow!("cache-import needs a file path"))?;
            cmd_cache_import(&cache, path)
        }
        Some("cache-clear") => cmd_cache_clear(&cache),
        Some(report_code) => {
            let fight_id = match args.get(1) {
                Some(raw) => Some(raw.parse::<u32>().context("fight id must be a number")?),
                None => None,
            };
            cmd_search(store, &cache, report_code, fight_id).await
        }
        None => {
            eprintln!(
                "usage: logsleuth <report-code> [fight-id] | cache-export <file> | cache-import <file> | cache-clear"
            );
            Ok(())
        }
    }
}

async fn cmd_search(
    store: Arc<Store>,
    cache: &RankingCache,
    report_code: &str,
    fight_id: Option<u32>,
) -> Result<()> {
    info!("logsleuth starting");
    info!("   report: {}", report_code);
    info!("   store:  {} cached pages", cache.entry_count()?);

    let credentials = EnvCredentials.credentials()?;
    let tracker = Arc::new(RateWindowTracker::new(store));
    let client = QuotaAwareClient::new(
        HttpTransport::new(credentials),
        tracker,
        Arc::new(LogStatusSink),
    );

    // Cancellation is cooperative: Ctrl-C flips the token, every suspension
    // point observes it.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling search");
                cancel.cancel();
            }
        });
    }

    // Resolve the fights of the anonymized report
    let data = client
        .query(&report_fights_query(report_code), 1, &cancel)
        .await
        .map_err(|e| anyhow!("failed to load report: {e}"))?;
    let mut targets = parse_report_targets(&data, report_code)?;
    if let Some(id) = fight_id {
        targets.retain(|t| t.fight.id == id);
        if targets.is_empty() {
            return Err(anyhow!("report has no ranked kill with fight id {id}"));
        }
    }
    info!("   fights: {}", targets.len());

    let mode = if targets.len() == 1 {
        SearchMode::SingleFight
    } else {
        SearchMode::MultiFight
    };

    let orchestrator = SearchOrchestrator::new(&client, cache, Arc::new(LogStatusSink));
    let mut progress = |outcome: &FightOutcome| {
        for m in &outcome.matches {
            println!("fight {}: {}", outcome.fight_id, m);
        }
    };

    match orchestrator.run(targets, mode, &cancel, &mut progress).await {
        Ok(outcome) => {
            let total = outcome.all_matches().count();
            if total == 0 {
                println!("no verified match found — the log may not be ranked");
            } else {
                println!("{total} verified match(es) found");
            }
            if let Some(quota) = client.quota() {
                info!("   budget: {}", quota);
            }
            Ok(())
        }
        Err(SearchError::Cancelled) => {
            println!("search cancelled");
            Ok(())
        }
        Err(SearchError::QuotaExceeded { minutes_until_reset }) => {
            error!("point budget exhausted, try again in ~{minutes_until_reset} min");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Build one search target per kill in the anonymized report. The region
/// and partition of the ranking list are not derivable from an anonymized
/// report, so they come from the environment.
fn parse_report_targets(data: &Value, report_code: &str) -> Result<Vec<SearchTarget>> {
    let report = data
        .get("reportData")
        .and_then(|d| d.get("report"))
        .filter(|r| !r.is_null())
        .ok_or_else(|| anyhow!("report {report_code} not found"))?;
    let report_start = report
        .get("startTime")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("report has no start time"))?;
    let fights = report
        .get("fights")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("report has no fights"))?;

    let region = std::env::var("LOGSLEUTH_REGION").unwrap_or_else(|_| "EU".to_string());
    let partition = std::env::var("LOGSLEUTH_PARTITION")
        .ok()
        .and_then(|p| p.parse().ok());

    let mut targets = Vec::new();
    for fight in fights {
        let (Some(id), Some(start), Some(end), Some(encounter_id)) = (
            fight.get("id").and_then(Value::as_u64),
            fight.get("startTime").and_then(Value::as_i64),
            fight.get("endTime").and_then(Value::as_i64),
            fight.get("encounterID").and_then(Value::as_u64),
        ) else {
            continue;
        };
        if encounter_id == 0 {
            // Trash pull, not a ranked encounter
            continue;
        }

        targets.push(SearchTarget {
            fight: AnonymizedFight {
                id: id as u32,
                report_code: report_code.to_string(),
                start_time_ms: report_start + start,
                duration_ms: end - start,
            },
            coord: SearchCoordinate {
                encounter_id: encounter_id as u32,
                difficulty: fight.get("difficulty").and_then(Value::as_u64).unwrap_or(100) as u32,
                size: fight.get("size").and_then(Value::as_u64).unwrap_or(8) as u32,
                region: region.clone(),
                partition,
            },
        });
    }

    if targets.is_empty() {
        return Err(anyhow!("report {report_code} contains no ranked kills"));
    }
    Ok(targets)
}

fn cmd_cache_export(cache: &RankingCache, path: &str) -> Result<()> {
    let bytes = if path.ends_with(".gz") {
        cache.export_compressed()?
    } else {
        cache.export()?.into_bytes()
    };
    std::fs::write(path, bytes).with_context(|| format!("failed to write {path}"))?;
    info!("[CACHE] exported {} entries to {}", cache.entry_count()?, path);
    Ok(())
}

fn cmd_cache_import(cache: &RankingCache, path: &str) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
    let stats = if path.ends_with(".gz") {
        cache.import_compressed(&bytes)?
    } else {
        cache.import(std::str::from_utf8(&bytes).context("export file is not UTF-8")?)?
    };
    println!("imported {}, skipped {}", stats.imported, stats.skipped);
    Ok(())
}

fn cmd_cache_clear(cache: &RankingCache) -> Result<()> {
    let count = cache.entry_count()?;
    if count == 0 {
        println!("cache is already empty");
        return Ok(());
    }
    if !StdinConfirm.confirm(&format!("delete all {count} cached pages?")) {
        println!("aborted");
        return Ok(());
    }
    cache.clear_all()?;
    println!("cache cleared");
    Ok(())
}

/// Interactive y/N prompt on stdin.
struct StdinConfirm;

impl ConfirmSink for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{prompt} [y/N] ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}
