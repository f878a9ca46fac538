//! Candidate matching: a cheap time/duration heuristic followed by an
//! independent cross-validation of the two fights' performance values.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{fight_values_query, GraphQlTransport, QuotaAwareClient};
use crate::config::{DURATION_DIFF_THRESHOLD_MS, TIME_DIFF_THRESHOLD_MS, VERIFY_RELATIVE_TOLERANCE};
use crate::error::SearchError;
use crate::types::{AnonymizedFight, MatchCandidate, RankingRow};

pub struct MatchEngine {
    fight: AnonymizedFight,
}

impl MatchEngine {
    pub fn new(fight: AnonymizedFight) -> Self {
        Self { fight }
    }

    /// Stage one: both deltas must be strictly inside their bound.
    ///
    /// The crossed pairing is deliberate: start-time deltas are bounded by
    /// `DURATION_DIFF_THRESHOLD_MS` and duration deltas by
    /// `TIME_DIFF_THRESHOLD_MS`.
    /// TODO: confirm with product whether the constant names or the
    /// effective numbers are authoritative before renaming anything.
    pub fn heuristic_match(&self, row: &RankingRow) -> Option<MatchCandidate> {
        let time_delta_ms = (row.start_time_ms - self.fight.start_time_ms).abs();
        let duration_delta_ms = (row.duration_ms - self.fight.duration_ms).abs();

        if time_delta_ms < DURATION_DIFF_THRESHOLD_MS && duration_delta_ms < TIME_DIFF_THRESHOLD_MS
        {
            Some(MatchCandidate {
                row: row.clone(),
                time_delta_ms,
                duration_delta_ms,
            })
        } else {
            None
        }
    }

    /// Stage two: compare the full sorted performance-value multisets of the
    /// anonymized fight and the candidate's public fight. A pure filter —
    /// any fetch failure or mismatch demotes the candidate, nothing here
    /// ever escalates or upgrades.
    pub async fn verify<T: GraphQlTransport>(
        &self,
        client: &QuotaAwareClient<T>,
        candidate: &MatchCandidate,
        cancel: &CancellationToken,
    ) -> bool {
        let own = match fetch_fight_values(client, &self.fight.report_code, self.fight.id, cancel)
            .await
        {
            Ok(values) => values,
            Err(e) => {
                debug!("[SEARCH] verification fetch (anonymized side) failed: {}", e);
                return false;
            }
        };

        let public = match fetch_fight_values(
            client,
            &candidate.row.report_code,
            candidate.row.fight_id,
            cancel,
        )
        .await
        {
            Ok(values) => values,
            Err(e) => {
                debug!("[SEARCH] verification fetch (candidate side) failed: {}", e);
                return false;
            }
        };

        let verified = values_match(&own, &public);
        if !verified {
            debug!(
                "[SEARCH] candidate {} failed value cross-check ({} vs {} players)",
                candidate.row.name,
                own.len(),
                public.len()
            );
        }
        verified
    }
}

async fn fetch_fight_values<T: GraphQlTransport>(
    client: &QuotaAwareClient<T>,
    report_code: &str,
    fight_id: u32,
    cancel: &CancellationToken,
) -> Result<Vec<f64>, SearchError> {
    let query = fight_values_query(report_code, fight_id);
    let data = client.query(&query, 1, cancel).await?;
    parse_fight_values(&data)
        .ok_or_else(|| SearchError::Api(format!("no rankings for {report_code}#{fight_id}")))
}

fn parse_fight_values(data: &Value) -> Option<Vec<f64>> {
    let characters = data
        .get("reportData")?
        .get("report")?
        .get("rankings")?
        .get("data")?
        .as_array()?
        .first()?
        .get("characters")?
        .as_array()?;

    let values = characters
        .iter()
        .filter_map(|c| c.get("amount").and_then(Value::as_f64))
        .collect::<Vec<_>>();
    (!values.is_empty()).then_some(values)
}

/// Sorted-descending pairwise comparison under a relative tolerance.
fn values_match(a: &[f64], b: &[f64]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(|x, y| y.total_cmp(x));
    b.sort_by(|x, y| y.total_cmp(x));

    a.iter().zip(&b).all(|(x, y)| {
        let scale = x.abs().max(y.abs()).max(f64::EPSILON);
        (x - y).abs() / scale <= VERIFY_RELATIVE_TOLERANCE
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
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn fight() -> AnonymizedFight {
        AnonymizedFight {
            id: 3,
            report_code: "anon01".into(),
            start_time_ms: 1_000,
            duration_ms: 5_000,
        }
    }

    fn row(start_time_ms: i64, duration_ms: i64) -> RankingRow {
        RankingRow {
            name: "Aza Lin".into(),
            start_time_ms,
            duration_ms,
            amount: 9_000.0,
            server: "Shiva".into(),
            region: "EU".into(),
            report_code: "pub123".into(),
            fight_id: 4,
        }
    }

    #[test]
    fn test_identical_fight_always_matches() {
        let engine = MatchEngine::new(fight());
        let candidate = engine.heuristic_match(&row(1_000, 5_000)).unwrap();
        assert_eq!(candidate.time_delta_ms, 0);
        assert_eq!(candidate.duration_delta_ms, 0);
    }

    #[test]
    fn test_near_fight_matches_inside_both_bounds() {
        // dt 2000 < 10000 and dd 100 < 5000
        let engine = MatchEngine::new(fight());
        let candidate = engine.heuristic_match(&row(3_000, 5_100)).unwrap();
        assert_eq!(candidate.time_delta_ms, 2_000);
        assert_eq!(candidate.duration_delta_ms, 100);
    }

    #[test]
    fn test_time_delta_checked_against_duration_threshold() {
        let engine = MatchEngine::new(fight());

        // dt 19000 exceeds the 10000 bound even with a tiny duration delta
        assert!(engine.heuristic_match(&row(20_000, 5_100)).is_none());

        // dt 9999 is still inside it
        assert!(engine.heuristic_match(&row(1_000 + 9_999, 5_000)).is_some());
        // dt exactly 10000 is not (strict bound)
        assert!(engine.heuristic_match(&row(1_000 + 10_000, 5_000)).is_none());
    }

    #[test]
    fn test_duration_delta_checked_against_time_threshold() {
        let engine = MatchEngine::new(fight());

        // dd 6000 exceeds the 5000 bound even with a zero time delta
        assert!(engine.heuristic_match(&row(1_000, 11_000)).is_none());

        // dd 4999 is still inside it
        assert!(engine.heuristic_match(&row(1_000, 5_000 + 4_999)).is_some());
        // dd exactly 5000 is not
        assert!(engine.heuristic_match(&row(1_000, 5_000 + 5_000)).is_none());
    }

    #[test]
    fn test_values_match_ignores_order() {
        let a = [9_000.0, 8_000.0, 7_000.0];
        let b = [7_000.0, 9_000.0, 8_000.0];
        assert!(values_match(&a, &b));
    }

    #[test]
    fn test_values_match_length_mismatch_fails() {
        assert!(!values_match(&[1.0, 2.0], &[1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_values_match_tolerance_edges() {
        // 100 vs 102: 2/102 is under the 2% tolerance
        assert!(values_match(&[100.0], &[102.0]));
        // 100 vs 103: over it
        assert!(!values_match(&[100.0], &[103.0]));
    }

    // --- verify over a scripted transport ---

    struct SeqTransport {
        responses: Mutex<VecDeque<anyhow::Result<Value>>>,
    }

    #[async_trait]
    impl GraphQlTransport for SeqTransport {
        async fn execute(&self, _query: &str) -> anyhow::Result<Value> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted response left")))
        }
    }

    fn client_with(
        responses: Vec<anyhow::Result<Value>>,
    ) -> QuotaAwareClient<SeqTransport> {
        QuotaAwareClient::new(
            SeqTransport {
                responses: Mutex::new(responses.into()),
            },
            Arc::new(RateWindowTracker::new(Store::open_in_memory().unwrap())),
            Arc::new(LogStatusSink),
        )
    }

    fn values_body(amounts: &[f64]) -> Value {
        let characters: Vec<Value> = amounts
            .iter()
            .map(|a| serde_json::json!({ "name": "p", "amount": a }))
            .collect();
        serde_json::json!({
            "data": { "reportData": { "report": { "rankings": {
                "data": [ { "fightID": 3, "characters": characters } ]
            } } } }
        })
    }

    fn candidate() -> MatchCandidate {
        MatchCandidate {
            row: row(1_000, 5_000),
            time_delta_ms: 0,
            duration_delta_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_verify_passes_on_matching_value_sets() {
        let client = client_with(vec![
            Ok(values_body(&[9_000.0, 8_000.0])),
            Ok(values_body(&[8_000.0, 9_000.0])),
        ]);
        let engine = MatchEngine::new(fight());
        let cancel = CancellationToken::new();

        assert!(engine.verify(&client, &candidate(), &cancel).await);
    }

    #[tokio::test]
    async fn test_verify_demotes_on_value_mismatch() {
        let client = client_with(vec![
            Ok(values_body(&[9_000.0, 8_000.0])),
            Ok(values_body(&[9_000.0, 4_000.0])),
        ]);
        let engine = MatchEngine::new(fight());
        let cancel = CancellationToken::new();

        assert!(!engine.verify(&client, &candidate(), &cancel).await);
    }

    #[tokio::test]
    async fn test_verify_absorbs_fetch_failure() {
        let client = client_with(vec![Err(anyhow::anyhow!("down"))]);
        let engine = MatchEngine::new(fight());
        let cancel = CancellationToken::new();

        // Never throws past this boundary, only demotes
        assert!(!engine.verify(&client, &candidate(), &cancel).await);
    }
}
