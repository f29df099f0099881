use std::path::PathBuf;
use std::time::{Duration, Instant};

use vidshard::master::job::{Shard, ShardStatus};
use vidshard::master::scheduler::{choose_worker, next_pending};
use vidshard::registry::{NodeRecord, PeerRole, ScoreReport};

const SCORE_TTL: Duration = Duration::from_secs(10);

fn worker(address: &str, score: Option<f64>, in_flight: u32) -> NodeRecord {
    let now = Instant::now();
    NodeRecord {
        address: address.to_string(),
        role: PeerRole::Worker,
        registered_at: now,
        last_seen: now,
        score: score.map(|s| ScoreReport {
            score: s,
            reported_at: now,
        }),
        in_flight,
    }
}

#[test]
fn test_lowest_score_wins() {
    let candidates = vec![
        worker("10.0.0.1:50051", Some(0.9), 0),
        worker("10.0.0.2:50052", Some(0.1), 5),
    ];

    let chosen = choose_worker(&candidates, Instant::now(), SCORE_TTL, None);
    assert_eq!(chosen.as_deref(), Some("10.0.0.2:50052"));
}

#[test]
fn test_tie_broken_by_in_flight_then_address() {
    let candidates = vec![
        worker("10.0.0.3:50053", Some(0.5), 2),
        worker("10.0.0.1:50051", Some(0.5), 1),
        worker("10.0.0.2:50052", Some(0.5), 1),
    ];

    // Equal scores: fewest in-flight wins, then the lexicographically
    // smaller address.
    let chosen = choose_worker(&candidates, Instant::now(), SCORE_TTL, None);
    assert_eq!(chosen.as_deref(), Some("10.0.0.1:50051"));
}

#[test]
fn test_stale_score_buckets_as_neutral() {
    let now = Instant::now();
    let mut stale = worker("10.0.0.1:50051", Some(0.05), 0);
    stale.score = Some(ScoreReport {
        score: 0.05,
        reported_at: now - Duration::from_secs(30),
    });
    // 0.3 is better than the neutral 0.5 that the stale report decays to.
    let fresh = worker("10.0.0.2:50052", Some(0.3), 0);

    let chosen = choose_worker(&[stale, fresh], now, SCORE_TTL, None);
    assert_eq!(chosen.as_deref(), Some("10.0.0.2:50052"));
}

#[test]
fn test_unknown_score_is_neutral() {
    let candidates = vec![
        worker("10.0.0.1:50051", None, 0),
        worker("10.0.0.2:50052", Some(0.7), 0),
    ];

    // No report is neutral (0.5), which beats 0.7.
    let chosen = choose_worker(&candidates, Instant::now(), SCORE_TTL, None);
    assert_eq!(chosen.as_deref(), Some("10.0.0.1:50051"));
}

#[test]
fn test_exclude_rotates_away_from_failed_worker() {
    let candidates = vec![
        worker("10.0.0.1:50051", Some(0.1), 0),
        worker("10.0.0.2:50052", Some(0.9), 0),
    ];

    let chosen = choose_worker(
        &candidates,
        Instant::now(),
        SCORE_TTL,
        Some("10.0.0.1:50051"),
    );
    assert_eq!(chosen.as_deref(), Some("10.0.0.2:50052"));
}

#[test]
fn test_exclude_with_single_candidate_yields_none() {
    let candidates = vec![worker("10.0.0.1:50051", Some(0.1), 0)];
    let chosen = choose_worker(
        &candidates,
        Instant::now(),
        SCORE_TTL,
        Some("10.0.0.1:50051"),
    );
    assert!(chosen.is_none());
}

#[test]
fn test_pending_ordered_by_index() {
    let shards: Vec<Shard> = (0..4)
        .map(|i| Shard::new(i, PathBuf::from(format!("/tmp/{i:04}.mp4"))))
        .collect();

    let next = next_pending(&shards, Instant::now(), Duration::from_secs(30));
    assert_eq!(next, Some(0));
}

#[test]
fn test_non_pending_shards_skipped() {
    let mut shards: Vec<Shard> = (0..3)
        .map(|i| Shard::new(i, PathBuf::from(format!("/tmp/{i:04}.mp4"))))
        .collect();
    shards[0].status = ShardStatus::Ready;
    shards[1].status = ShardStatus::Processing;

    let next = next_pending(&shards, Instant::now(), Duration::from_secs(30));
    assert_eq!(next, Some(2));

    shards[2].status = ShardStatus::Assigned;
    let next = next_pending(&shards, Instant::now(), Duration::from_secs(30));
    assert_eq!(next, None);
}

#[test]
fn test_starving_shard_hoisted() {
    let now = Instant::now();
    let mut shards: Vec<Shard> = (0..3)
        .map(|i| Shard::new(i, PathBuf::from(format!("/tmp/{i:04}.mp4"))))
        .collect();
    // Shard 2 has been waiting past the threshold; it jumps ahead of the
    // index ordering.
    shards[2].pending_since = now - Duration::from_secs(40);

    let next = next_pending(&shards, now, Duration::from_secs(30));
    assert_eq!(next, Some(2));
}

#[test]
fn test_oldest_starving_shard_first() {
    let now = Instant::now();
    let mut shards: Vec<Shard> = (0..3)
        .map(|i| Shard::new(i, PathBuf::from(format!("/tmp/{i:04}.mp4"))))
        .collect();
    shards[1].pending_since = now - Duration::from_secs(60);
    shards[2].pending_since = now - Duration::from_secs(90);

    let next = next_pending(&shards, now, Duration::from_secs(30));
    assert_eq!(next, Some(2));
}

/// With two workers at static scores 0.1 and 0.9 and no failures, the
/// lower-score worker must receive at least half of the assignments.
#[test]
fn test_low_score_worker_gets_majority_of_shards() {
    let shard_count = 7u32;
    let now = Instant::now();
    let mut candidates = vec![
        worker("10.0.0.1:50051", Some(0.1), 0),
        worker("10.0.0.2:50052", Some(0.9), 0),
    ];

    let mut low_score_assignments = 0;
    for _ in 0..shard_count {
        let chosen = choose_worker(&candidates, now, SCORE_TTL, None).unwrap();
        if chosen == "10.0.0.1:50051" {
            low_score_assignments += 1;
        }
        for c in candidates.iter_mut() {
            if c.address == chosen {
                c.in_flight += 1;
            }
        }
    }

    assert!(low_score_assignments >= shard_count.div_ceil(2));
}
