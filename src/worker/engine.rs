//! Shard processing on a worker node. Shards of the same job are processed
//! sequentially; across jobs the engine parallelizes up to its declared
//! capacity. Repeating an attempt replaces any prior output for the same
//! (job, shard, attempt) tuple.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{Result, VidshardError};
use crate::grpc::ClientPool;
use crate::media::{self, ContainerFormat, MediaExecutor};
use crate::proto::{ReportShardStatusRequest, ShardMeta};

/// A shard result the master has not acknowledged yet. Re-reported when a
/// new master announces itself.
#[derive(Debug, Clone)]
struct UnreportedShard {
    job_id: String,
    shard_index: u32,
    attempt: u32,
    status: String,
    message: String,
}

pub struct WorkerEngine {
    config: NodeConfig,
    media: MediaExecutor,
    clients: ClientPool,
    /// Serializes shards of the same job.
    job_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Cross-job parallelism bound.
    capacity: Arc<Semaphore>,
    /// Master address to report shard status to.
    master: RwLock<Option<String>>,
    unreported: Mutex<Vec<UnreportedShard>>,
}

impl WorkerEngine {
    pub fn new(config: NodeConfig, clients: ClientPool) -> Self {
        let capacity = Arc::new(Semaphore::new(config.worker_capacity.max(1)));
        let master = RwLock::new(config.master_addr.clone());
        Self {
            config,
            media: MediaExecutor::new(),
            clients,
            job_locks: Mutex::new(HashMap::new()),
            capacity,
            master,
            unreported: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_master(&self, address: Option<String>) {
        *self.master.write().await = address;
    }

    fn shard_dir(&self, job_id: &str) -> PathBuf {
        self.config.shards_dir().join(job_id)
    }

    /// Path of the stored processed shard. Attempt-independent: a retry for
    /// the same shard replaces the previous output.
    pub fn processed_path(&self, job_id: &str, shard_index: u32, ext: &str) -> PathBuf {
        self.shard_dir(job_id)
            .join(format!("processed_{shard_index:04}.{ext}"))
    }

    async fn job_lock(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.job_locks.lock().await;
        locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Transcode a received shard. `input` is the already-written scratch
    /// file; returns the size of the stored output in bytes.
    pub async fn process_shard(&self, meta: &ShardMeta, input: PathBuf) -> Result<u64> {
        let format: ContainerFormat = meta
            .output_format
            .parse()
            .map_err(VidshardError::InvalidParams)?;

        let permit = self
            .capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VidshardError::Internal("worker shutting down".to_string()))?;
        let lock = self.job_lock(&meta.job_id).await;
        let _job_guard = lock.lock().await;

        let output = self.processed_path(&meta.job_id, meta.shard_index, format.extension());
        let result = self.transcode_to(meta, &input, &output, format).await;
        drop(permit);

        let _ = tokio::fs::remove_file(&input).await;

        match &result {
            Ok(bytes) => {
                tracing::info!(
                    job_id = %meta.job_id,
                    shard = meta.shard_index,
                    attempt = meta.attempt,
                    bytes,
                    "Shard processed"
                );
                self.report_status(meta, "ready", String::new()).await;
            }
            Err(e) => {
                tracing::error!(
                    job_id = %meta.job_id,
                    shard = meta.shard_index,
                    attempt = meta.attempt,
                    error = %e,
                    "Shard processing failed"
                );
                self.report_status(meta, "failed", e.to_string()).await;
            }
        }

        result
    }

    async fn transcode_to(
        &self,
        meta: &ShardMeta,
        input: &PathBuf,
        output: &PathBuf,
        format: ContainerFormat,
    ) -> Result<u64> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a temp name first so a prior good output for this shard
        // survives a failed retry.
        let tmp = output.with_extension(format!("a{}.tmp", meta.attempt));
        let cancel = CancellationToken::new();
        media::transcode(
            &self.media,
            input,
            &tmp,
            meta.target_width,
            meta.target_height,
            format,
            &cancel,
        )
        .await?;

        let file = tokio::fs::File::open(&tmp).await?;
        file.sync_all().await?;
        let bytes = file.metadata().await?.len();
        drop(file);
        tokio::fs::rename(&tmp, output).await?;
        Ok(bytes)
    }

    /// Open a stored processed shard for streaming back to the master.
    pub async fn open_processed(&self, job_id: &str, shard_index: u32) -> Result<PathBuf> {
        // The extension is not part of the request; probe the known formats.
        for ext in ["mp4", "mkv", "webm", "mov"] {
            let path = self.processed_path(job_id, shard_index, ext);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }
        }
        Err(VidshardError::JobNotFound(format!(
            "processed shard {shard_index} of {job_id}"
        )))
    }

    /// Best-effort status report to the current master. Failures are queued
    /// and retried when a (new) master announces itself.
    async fn report_status(&self, meta: &ShardMeta, status: &str, message: String) {
        let request = ReportShardStatusRequest {
            worker_address: self.config.advertise_addr.clone(),
            job_id: meta.job_id.clone(),
            shard_index: meta.shard_index,
            attempt: meta.attempt,
            status: status.to_string(),
            message: message.clone(),
        };

        if !self.try_report(request.clone()).await {
            tracing::warn!(
                job_id = %meta.job_id,
                shard = meta.shard_index,
                "Master unreachable, queueing shard report"
            );
            self.unreported.lock().await.push(UnreportedShard {
                job_id: meta.job_id.clone(),
                shard_index: meta.shard_index,
                attempt: meta.attempt,
                status: status.to_string(),
                message,
            });
        }
    }

    async fn try_report(&self, request: ReportShardStatusRequest) -> bool {
        let Some(master) = self.master.read().await.clone() else {
            return false;
        };
        let Ok(mut client) = self.clients.cluster(&master).await else {
            return false;
        };
        client.report_shard_status(request).await.is_ok()
    }

    /// Flush queued reports, typically after a master change.
    pub async fn report_unreported(&self) {
        let queued: Vec<UnreportedShard> = {
            let mut unreported = self.unreported.lock().await;
            std::mem::take(&mut *unreported)
        };
        if queued.is_empty() {
            return;
        }
        tracing::info!(count = queued.len(), "Re-reporting shard results");
        for entry in queued {
            let request = ReportShardStatusRequest {
                worker_address: self.config.advertise_addr.clone(),
                job_id: entry.job_id.clone(),
                shard_index: entry.shard_index,
                attempt: entry.attempt,
                status: entry.status.clone(),
                message: entry.message.clone(),
            };
            if !self.try_report(request).await {
                self.unreported.lock().await.push(entry);
            }
        }
    }

    /// Scratch path for an incoming shard stream.
    pub fn scratch_path(&self, meta: &ShardMeta) -> PathBuf {
        self.shard_dir(&meta.job_id).join(format!(
            "{:04}.a{}.{}.in",
            meta.shard_index, meta.attempt, meta.output_format
        ))
    }
}
