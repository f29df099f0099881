//! Worker selection. Pure functions over a registry snapshot so the policy
//! is testable without a cluster: lowest recent score wins, ties broken by
//! fewest in-flight assignments, then by address. Shards pending past the
//! starvation threshold jump the queue.

use std::time::{Duration, Instant};

use crate::master::job::{Shard, ShardStatus};
use crate::registry::NodeRecord;
use crate::scorer::NEUTRAL_SCORE;

/// Score used for ordering, with stale reports bucketed as neutral.
fn effective_score(record: &NodeRecord, now: Instant, score_ttl: Duration) -> f64 {
    match &record.score {
        Some(report) if now.saturating_duration_since(report.reported_at) < score_ttl => {
            report.score
        }
        _ => NEUTRAL_SCORE,
    }
}

/// Pick the best worker from `candidates`, excluding `exclude` (the worker a
/// failed attempt ran on). `candidates` should already be filtered to alive
/// workers.
pub fn choose_worker(
    candidates: &[NodeRecord],
    now: Instant,
    score_ttl: Duration,
    exclude: Option<&str>,
) -> Option<String> {
    candidates
        .iter()
        .filter(|c| Some(c.address.as_str()) != exclude)
        .min_by(|a, b| {
            let score_a = effective_score(a, now, score_ttl);
            let score_b = effective_score(b, now, score_ttl);
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.in_flight.cmp(&b.in_flight))
                .then(a.address.cmp(&b.address))
        })
        .map(|c| c.address.clone())
}

/// Order pending shard indices for dispatch: starving shards first (oldest
/// starvation first), then segmentation order.
pub fn next_pending(shards: &[Shard], now: Instant, starvation_threshold: Duration) -> Option<u32> {
    let pending = shards.iter().filter(|s| s.status == ShardStatus::Pending);

    let mut best: Option<&Shard> = None;
    for shard in pending {
        let starving =
            now.saturating_duration_since(shard.pending_since) >= starvation_threshold;
        best = match best {
            None => Some(shard),
            Some(current) => {
                let current_starving =
                    now.saturating_duration_since(current.pending_since) >= starvation_threshold;
                let replace = match (starving, current_starving) {
                    (true, false) => true,
                    (false, true) => false,
                    (true, true) => shard.pending_since < current.pending_since,
                    (false, false) => shard.index < current.index,
                };
                if replace {
                    Some(shard)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.map(|s| s.index)
}
