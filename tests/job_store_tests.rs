use std::path::PathBuf;

use vidshard::master::job::{FailureReason, Job, JobId, JobParams, JobStatus, Shard, ShardStatus};
use vidshard::master::store::JobStore;

fn make_job(name: &str) -> Job {
    let id = JobId::from_filename(&format!("{name}.mp4")).unwrap();
    let params = JobParams::validate(640, 480, "mp4").unwrap();
    Job::new(id, params, format!("{name}.mp4"), PathBuf::from("/tmp/src.mp4"))
}

fn make_shards(n: u32) -> Vec<Shard> {
    (0..n)
        .map(|i| Shard::new(i, PathBuf::from(format!("/tmp/{i:04}.mp4"))))
        .collect()
}

#[test]
fn test_create_and_status_snapshot() {
    let mut store = JobStore::new();
    let job = make_job("wedding");
    let id = job.id.clone();

    store.create(job).unwrap();
    let (status, _) = store.status_of(&id).unwrap();
    assert_eq!(status, "uploading");

    store.set_status(&id, JobStatus::Segmenting);
    let (status, _) = store.status_of(&id).unwrap();
    assert_eq!(status, "segmenting");
}

#[test]
fn test_active_job_cannot_be_replaced() {
    let mut store = JobStore::new();
    store.create(make_job("wedding")).unwrap();

    // Same id while the first is still active is refused.
    assert!(store.create(make_job("wedding")).is_err());

    // Once terminal, the id may be reused.
    let id = JobId::from_filename("wedding.mp4").unwrap();
    store.fail(&id, FailureReason::MediaError, "segment failed");
    assert!(store.create(make_job("wedding")).is_ok());
}

#[test]
fn test_completed_job_can_be_replaced() {
    let mut store = JobStore::new();
    let job = make_job("talk");
    let id = job.id.clone();
    store.create(job).unwrap();
    store.set_status(&id, JobStatus::Completed);

    assert!(store.create(make_job("talk")).is_ok());
}

#[test]
fn test_fail_cancels_and_is_sticky() {
    let mut store = JobStore::new();
    let job = make_job("demo");
    let id = job.id.clone();
    let token = store.create(job).unwrap();

    store.fail(&id, FailureReason::ShardExhausted, "3 attempts");
    assert!(token.is_cancelled());
    let (status, message) = store.status_of(&id).unwrap();
    assert_eq!(status, "failed:shard-exhausted");
    assert_eq!(message, "3 attempts");

    // A later failure does not overwrite the terminal state.
    store.fail(&id, FailureReason::StorageError, "other");
    let (status, _) = store.status_of(&id).unwrap();
    assert_eq!(status, "failed:shard-exhausted");
}

#[test]
fn test_shard_report_idempotence() {
    let mut store = JobStore::new();
    let job = make_job("clip");
    let id = job.id.clone();
    store.create(job).unwrap();
    store.set_shards(&id, make_shards(2));

    assert!(store.apply_shard_report(&id, 0, 0, ShardStatus::Processing, "w1:1"));
    // The identical report is a no-op.
    assert!(!store.apply_shard_report(&id, 0, 0, ShardStatus::Processing, "w1:1"));
    // Progress within the attempt applies.
    assert!(store.apply_shard_report(&id, 0, 0, ShardStatus::Ready, "w1:1"));
    // Regression within the attempt is ignored.
    assert!(!store.apply_shard_report(&id, 0, 0, ShardStatus::Processing, "w1:1"));
}

#[test]
fn test_stale_attempt_report_ignored() {
    let mut store = JobStore::new();
    let job = make_job("clip");
    let id = job.id.clone();
    store.create(job).unwrap();

    let mut shards = make_shards(1);
    shards[0].attempt = 2;
    store.set_shards(&id, shards);

    // A report from attempt 1 arrives after attempt 2 started.
    assert!(!store.apply_shard_report(&id, 0, 1, ShardStatus::Ready, "w1:1"));
    // The current attempt's report applies.
    assert!(store.apply_shard_report(&id, 0, 2, ShardStatus::Ready, "w1:1"));
}

#[test]
fn test_unknown_job_or_shard_report() {
    let mut store = JobStore::new();
    let unknown = JobId::from_filename("ghost.mp4").unwrap();
    assert!(!store.apply_shard_report(&unknown, 0, 0, ShardStatus::Ready, "w1:1"));

    let job = make_job("real");
    let id = job.id.clone();
    store.create(job).unwrap();
    store.set_shards(&id, make_shards(1));
    assert!(!store.apply_shard_report(&id, 9, 0, ShardStatus::Ready, "w1:1"));
}

#[test]
fn test_collected_paths_require_every_shard() {
    let mut store = JobStore::new();
    let job = make_job("movie");
    let id = job.id.clone();
    store.create(job).unwrap();
    store.set_shards(&id, make_shards(3));

    store.set_collected(&id, 0, PathBuf::from("/m/processed_0000.mp4"));
    store.set_collected(&id, 2, PathBuf::from("/m/processed_0002.mp4"));
    assert!(store.collected_paths(&id).is_none());

    store.set_collected(&id, 1, PathBuf::from("/m/processed_0001.mp4"));
    let paths = store.collected_paths(&id).unwrap();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("/m/processed_0000.mp4"),
            PathBuf::from("/m/processed_0001.mp4"),
            PathBuf::from("/m/processed_0002.mp4"),
        ]
    );
}

#[test]
fn test_collected_paths_in_segmentation_order() {
    let mut store = JobStore::new();
    let job = make_job("ordered");
    let id = job.id.clone();
    store.create(job).unwrap();

    // Shards stored out of order must still concatenate by index.
    let mut shards = make_shards(3);
    shards.reverse();
    store.set_shards(&id, shards);

    for i in [2u32, 0, 1] {
        store.set_collected(&id, i, PathBuf::from(format!("/m/processed_{i:04}.mp4")));
    }

    let paths = store.collected_paths(&id).unwrap();
    assert_eq!(paths[0], PathBuf::from("/m/processed_0000.mp4"));
    assert_eq!(paths[2], PathBuf::from("/m/processed_0002.mp4"));
}

#[test]
fn test_fail_all_active_spares_terminal_jobs() {
    let mut store = JobStore::new();
    let done = make_job("done");
    let done_id = done.id.clone();
    store.create(done).unwrap();
    store.set_status(&done_id, JobStatus::Completed);

    let running = make_job("running");
    let running_id = running.id.clone();
    store.create(running).unwrap();
    store.set_status(&running_id, JobStatus::Processing);

    let abandoned = store.fail_all_active(FailureReason::MasterFailover, "failover");
    assert_eq!(abandoned, vec![running_id.clone()]);

    let (status, _) = store.status_of(&done_id).unwrap();
    assert_eq!(status, "completed");
    let (status, _) = store.status_of(&running_id).unwrap();
    assert_eq!(status, "failed:master-failover");
}

#[test]
fn test_restored_job_is_completed_and_durable() {
    let mut store = JobStore::new();
    let id = JobId::parse("recovered").unwrap();
    store.insert_restored(id.clone(), "mkv".parse().unwrap());

    let job = store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.durable);

    // Restoring over an existing record is a no-op.
    store.insert_restored(id.clone(), "mp4".parse().unwrap());
    assert_eq!(
        store.get(&id).unwrap().params.format.extension(),
        "mkv"
    );
}
