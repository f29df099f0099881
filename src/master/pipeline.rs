//! Per-job orchestration: segment → dispatch/collect → concatenate →
//! replicate. Each accepted job runs as one task, bounded by the job
//! concurrency semaphore; shard attempts run as child tasks feeding results
//! back over a channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{Result, VidshardError};
use crate::master::job::{FailureReason, JobId, JobStatus, Shard, ShardStatus};
use crate::master::scheduler::{choose_worker, next_pending};
use crate::master::store::JobStore;
use crate::master::transport::ShardTransport;
use crate::media::{self, ContainerFormat, MediaExecutor};
use crate::proto::ShardMeta;
use crate::registry::NodeRegistry;

/// How long the dispatcher sleeps when no worker is available before
/// re-reading the registry.
const DISPATCH_RETRY_MS: u64 = 500;

/// Everything a job task needs. Cheap to clone behind an Arc.
pub struct PipelineContext {
    pub config: NodeConfig,
    pub store: Arc<RwLock<JobStore>>,
    pub registry: Arc<RwLock<NodeRegistry>>,
    pub transport: Arc<dyn ShardTransport>,
    pub media: MediaExecutor,
    pub job_slots: Arc<Semaphore>,
}

struct AttemptOutcome {
    index: u32,
    attempt: u32,
    worker: String,
    result: Result<PathBuf>,
}

/// Entry point for one job. Takes a slot, drives the pipeline, and records
/// the failure reason if any stage errors out.
pub async fn run_job(ctx: Arc<PipelineContext>, id: JobId, cancel: CancellationToken) {
    let _slot = match ctx.job_slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    if let Err(e) = drive(&ctx, &id, &cancel).await {
        let mut store = ctx.store.write().await;
        match &e {
            VidshardError::Media(msg) => {
                store.fail(&id, FailureReason::MediaError, msg.clone());
            }
            VidshardError::Storage(io) => {
                store.fail(&id, FailureReason::StorageError, io.to_string());
            }
            VidshardError::NoWorkersAvailable => {
                store.fail(&id, FailureReason::NoWorkers, "no workers available");
            }
            // Shard exhaustion already recorded its own status.
            _ => {
                if store
                    .get(&id)
                    .map(|j| !j.status.is_terminal())
                    .unwrap_or(false)
                {
                    store.fail(&id, FailureReason::StorageError, e.to_string());
                }
            }
        }
    }
}

async fn drive(ctx: &PipelineContext, id: &JobId, cancel: &CancellationToken) -> Result<()> {
    let (source_path, params) = {
        let store = ctx.store.read().await;
        let job = store
            .get(id)
            .ok_or_else(|| VidshardError::JobNotFound(id.to_string()))?;
        (job.source_path.clone(), job.params)
    };

    // Segment on the master. Shards land under video_shards/<job_id>/.
    set_status(ctx, id, JobStatus::Segmenting).await;
    let shard_dir = ctx.config.shards_dir().join(id.as_str());
    let shard_files = media::segment(
        &ctx.media,
        &source_path,
        &shard_dir,
        params.format,
        ctx.config.segment_seconds,
        cancel,
    )
    .await?;

    let shards: Vec<Shard> = shard_files
        .into_iter()
        .enumerate()
        .map(|(i, path)| Shard::new(i as u32, path))
        .collect();
    let total = shards.len();
    tracing::info!(job_id = %id, shards = total, "Segmentation complete");
    ctx.store.write().await.set_shards(id, shards);

    set_status(ctx, id, JobStatus::Dispatching).await;
    dispatch_and_collect(ctx, id, params, total, cancel).await?;

    // All shards collected; stitch them back together in order.
    set_status(ctx, id, JobStatus::Concatenating).await;
    let inputs = ctx
        .store
        .read()
        .await
        .collected_paths(id)
        .ok_or_else(|| VidshardError::Internal("collected shard missing".to_string()))?;

    let job_dir = ctx.config.master_data_dir().join(id.as_str());
    tokio::fs::create_dir_all(&job_dir).await?;
    let ext = params.format.extension();
    let tmp_path = job_dir.join(format!("final.{ext}.tmp"));
    let final_path = job_dir.join(format!("final.{ext}"));

    media::concatenate(&ctx.media, &inputs, &tmp_path, params.format, cancel).await?;
    publish_atomically(&tmp_path, &final_path).await?;

    {
        let mut store = ctx.store.write().await;
        store.set_status(id, JobStatus::Completed);
    }
    tracing::info!(job_id = %id, path = %final_path.display(), "Job completed");

    replicate_artifact(ctx, id, params.format, &final_path).await;
    Ok(())
}

/// fsync the temp file, then atomically rename it into place.
async fn publish_atomically(tmp: &Path, dest: &Path) -> Result<()> {
    let file = tokio::fs::File::open(tmp).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, dest).await?;
    Ok(())
}

async fn set_status(ctx: &PipelineContext, id: &JobId, status: JobStatus) {
    ctx.store.write().await.set_status(id, status);
}

/// Dispatch every shard to a worker, retrying failures on different workers,
/// and pull each processed shard back as it becomes ready. Returns once all
/// shards are collected.
async fn dispatch_and_collect(
    ctx: &PipelineContext,
    id: &JobId,
    params: crate::master::job::JobParams,
    total: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let (done_tx, mut done_rx) = mpsc::channel::<AttemptOutcome>(total.max(1));
    let mut collected = 0usize;
    let mut in_flight = 0usize;
    let mut dispatched_once = false;
    // Worker each shard last ran on, to rotate retries away from it.
    let mut last_worker: HashMap<u32, String> = HashMap::new();
    let mut workerless_since: Option<Instant> = None;

    while collected < total {
        // Dispatch as many pending shards as workers will take.
        loop {
            let now = Instant::now();
            let next = {
                let store = ctx.store.read().await;
                let job = store
                    .get(id)
                    .ok_or_else(|| VidshardError::JobNotFound(id.to_string()))?;
                next_pending(&job.shards, now, ctx.config.starvation_threshold)
            };
            let Some(index) = next else { break };

            let candidates = ctx.registry.read().await.alive_workers();
            if candidates.is_empty() {
                // Tolerate a registration gap, but not an empty cluster forever.
                let since = workerless_since.get_or_insert(now);
                if now.duration_since(*since) >= ctx.config.dead_timeout {
                    return Err(VidshardError::NoWorkersAvailable);
                }
                break;
            }
            workerless_since = None;

            let exclude = last_worker.get(&index).map(String::as_str);
            let Some(worker) = choose_worker(&candidates, now, ctx.config.score_ttl, exclude)
            else {
                if exclude.is_some()
                    && choose_worker(&candidates, now, ctx.config.score_ttl, None).is_some()
                {
                    // Rotation is impossible with a single live worker; let
                    // the retry run there rather than stall the job.
                    last_worker.remove(&index);
                    continue;
                }
                break;
            };

            let (attempt, source) = {
                let mut store = ctx.store.write().await;
                let job = store
                    .get_mut(id)
                    .ok_or_else(|| VidshardError::JobNotFound(id.to_string()))?;
                let shard = job
                    .shards
                    .iter_mut()
                    .find(|s| s.index == index)
                    .ok_or_else(|| VidshardError::Internal(format!("shard {index} missing")))?;
                shard.status = ShardStatus::Assigned;
                shard.assigned_worker = Some(worker.clone());
                (shard.attempt, shard.source_path.clone())
            };

            ctx.registry.write().await.shard_started(&worker);
            last_worker.insert(index, worker.clone());
            in_flight += 1;

            spawn_attempt(
                ctx, id, index, attempt, params, worker, source,
                done_tx.clone(),
                cancel.child_token(),
            );
        }

        if !dispatched_once && in_flight > 0 {
            dispatched_once = true;
            set_status(ctx, id, JobStatus::Processing).await;
        }

        if collected >= total {
            break;
        }

        tokio::select! {
            Some(outcome) = done_rx.recv() => {
                in_flight -= 1;
                ctx.registry.write().await.shard_finished(&outcome.worker);

                match outcome.result {
                    Ok(path) => {
                        let mut store = ctx.store.write().await;
                        store.set_collected(id, outcome.index, path);
                        collected += 1;
                        if collected == 1 {
                            store.set_status(id, JobStatus::Collecting);
                        }
                        tracing::debug!(
                            job_id = %id,
                            shard = outcome.index,
                            collected,
                            total,
                            "Shard collected"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = %id,
                            shard = outcome.index,
                            attempt = outcome.attempt,
                            worker = %outcome.worker,
                            error = %e,
                            "Shard attempt failed"
                        );
                        let exhausted = outcome.attempt + 1 >= ctx.config.max_attempts;
                        let mut store = ctx.store.write().await;
                        if exhausted {
                            store.fail(
                                id,
                                FailureReason::ShardExhausted,
                                format!("shard {} failed after {} attempts: {e}", outcome.index, outcome.attempt + 1),
                            );
                            return Err(VidshardError::Internal("shard attempts exhausted".to_string()));
                        }
                        if let Some(job) = store.get_mut(id) {
                            if let Some(shard) =
                                job.shards.iter_mut().find(|s| s.index == outcome.index)
                            {
                                shard.status = ShardStatus::Failed;
                                shard.reset_for_retry();
                            }
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                return Err(VidshardError::Internal("job aborted".to_string()));
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(DISPATCH_RETRY_MS)) => {}
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_attempt(
    ctx: &PipelineContext,
    id: &JobId,
    index: u32,
    attempt: u32,
    params: crate::master::job::JobParams,
    worker: String,
    source: PathBuf,
    done_tx: mpsc::Sender<AttemptOutcome>,
    cancel: CancellationToken,
) {
    let transport = ctx.transport.clone();
    let store = ctx.store.clone();
    let deadline = ctx.config.effective_shard_timeout();
    let dest_dir = ctx.config.master_data_dir().join(id.as_str());
    let id = id.clone();
    let ext = params.format.extension();
    let dest = dest_dir.join(format!("processed_{index:04}.{ext}"));

    tokio::spawn(async move {
        let meta = ShardMeta {
            job_id: id.to_string(),
            shard_index: index,
            attempt,
            target_width: params.width,
            target_height: params.height,
            output_format: ext.to_string(),
        };

        {
            let mut store = store.write().await;
            store.apply_shard_report(&id, index, attempt, ShardStatus::Processing, &worker);
        }

        let work = async {
            transport.process_shard(&worker, meta, &source).await?;
            transport
                .fetch_shard(&worker, id.as_str(), index, &dest)
                .await?;
            Ok::<PathBuf, VidshardError>(dest)
        };

        let result = tokio::select! {
            result = tokio::time::timeout(deadline, work) => match result {
                Ok(inner) => inner,
                Err(_) => Err(VidshardError::PeerUnavailable(format!(
                    "{worker}: shard {index} attempt {attempt} exceeded deadline"
                ))),
            },
            _ = cancel.cancelled() => Err(VidshardError::Internal("attempt cancelled".to_string())),
        };

        let _ = done_tx
            .send(AttemptOutcome {
                index,
                attempt,
                worker,
                result,
            })
            .await;
    });
}

/// Fan the final artifact out to the configured backups. The job is durable
/// after the first successful replica, or immediately when the local store
/// is the configured durability target (no backups).
pub async fn replicate_artifact(
    ctx: &PipelineContext,
    id: &JobId,
    format: ContainerFormat,
    artifact: &Path,
) {
    if ctx.config.backups.is_empty() {
        ctx.store.write().await.mark_durable(id);
        return;
    }

    let mut replicas = 0usize;
    for backup in &ctx.config.backups {
        match ctx
            .transport
            .replicate(backup, id.as_str(), format.extension(), artifact)
            .await
        {
            Ok(()) => {
                replicas += 1;
                tracing::info!(job_id = %id, backup = %backup, "Artifact replicated");
            }
            Err(e) => {
                tracing::warn!(job_id = %id, backup = %backup, error = %e, "Replication failed");
            }
        }
    }

    if replicas > 0 {
        ctx.store.write().await.mark_durable(id);
    }
}

/// Failover restore: pull artifacts this node lacks from every reachable
/// backup, then abandon whatever was mid-flight under the previous master.
pub async fn restore_from_backups(ctx: &PipelineContext) {
    for backup in &ctx.config.backups {
        let entries = match ctx.transport.list_backups(backup).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(backup = %backup, error = %e, "Backup unreachable during restore");
                continue;
            }
        };

        for (job_id, container) in entries {
            let Ok(id) = JobId::parse(&job_id) else {
                tracing::warn!(job_id = %job_id, "Skipping backup with malformed job id");
                continue;
            };
            let Ok(format) = container.parse::<ContainerFormat>() else {
                tracing::warn!(job_id = %job_id, container = %container, "Skipping backup with unknown container");
                continue;
            };

            if ctx.store.read().await.contains(&id) {
                continue;
            }

            let dest = ctx
                .config
                .master_data_dir()
                .join(id.as_str())
                .join(format!("final.{}", format.extension()));
            match ctx.transport.fetch_backup(backup, id.as_str(), &dest).await {
                Ok(()) => {
                    ctx.store.write().await.insert_restored(id.clone(), format);
                    tracing::info!(job_id = %id, backup = %backup, "Artifact restored from backup");
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, backup = %backup, error = %e, "Restore fetch failed");
                }
            }
        }
    }

    let abandoned = ctx
        .store
        .write()
        .await
        .fail_all_active(FailureReason::MasterFailover, "abandoned at master failover");
    if !abandoned.is_empty() {
        tracing::warn!(count = abandoned.len(), "Abandoned in-flight jobs after failover");
    }
}
