//! Owned job map. The master engine is the only writer; readers get cloned
//! snapshots. Holds the per-job cancellation tokens used for job abort.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VidshardError};
use crate::master::job::{FailureReason, Job, JobId, JobStatus, Shard, ShardStatus};
use crate::media::ContainerFormat;

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
    cancels: HashMap<JobId, CancellationToken>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new job. An existing job with the same id may only be
    /// replaced once it has reached a terminal status.
    pub fn create(&mut self, job: Job) -> Result<CancellationToken> {
        if let Some(existing) = self.jobs.get(&job.id) {
            if !existing.status.is_terminal() {
                return Err(VidshardError::AlreadyRunning(job.id.to_string()));
            }
        }
        let token = CancellationToken::new();
        self.cancels.insert(job.id.clone(), token.clone());
        self.jobs.insert(job.id.clone(), job);
        Ok(token)
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn cancel_token(&self, id: &JobId) -> Option<CancellationToken> {
        self.cancels.get(id).cloned()
    }

    /// Status snapshot as the client sees it: `(status, message)`.
    pub fn status_of(&self, id: &JobId) -> Option<(String, String)> {
        self.jobs
            .get(id)
            .map(|job| (job.status.to_string(), job.message.clone()))
    }

    pub fn set_status(&mut self, id: &JobId, status: JobStatus) {
        if let Some(job) = self.jobs.get_mut(id) {
            tracing::debug!(job_id = %id, from = %job.status, to = %status, "Job status");
            job.status = status;
            if status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
        }
    }

    pub fn fail(&mut self, id: &JobId, reason: FailureReason, message: impl Into<String>) {
        if let Some(job) = self.jobs.get_mut(id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Failed(reason);
            job.message = message.into();
            job.completed_at = Some(Utc::now());
            tracing::warn!(job_id = %id, reason = reason.as_str(), message = %job.message, "Job failed");
        }
        if let Some(token) = self.cancels.get(id) {
            token.cancel();
        }
    }

    pub fn set_shards(&mut self, id: &JobId, shards: Vec<Shard>) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.shards = shards;
        }
    }

    pub fn mark_durable(&mut self, id: &JobId) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.durable = true;
        }
    }

    /// Apply a shard status report. Idempotent: stale attempts and regressive
    /// transitions within the current attempt are ignored. Returns whether
    /// the report was applied.
    pub fn apply_shard_report(
        &mut self,
        id: &JobId,
        shard_index: u32,
        attempt: u32,
        status: ShardStatus,
        worker: &str,
    ) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        let Some(shard) = job.shards.iter_mut().find(|s| s.index == shard_index) else {
            return false;
        };

        if attempt < shard.attempt {
            // A newer attempt supersedes this report.
            return false;
        }
        if attempt == shard.attempt && !shard.status.can_advance_to(status) {
            return false;
        }
        if status == shard.status && shard.assigned_worker.as_deref() == Some(worker) {
            // Repeat of what we already know.
            return false;
        }

        shard.status = status;
        shard.assigned_worker = Some(worker.to_string());
        true
    }

    /// Record the collected artifact path for a ready shard.
    pub fn set_collected(&mut self, id: &JobId, shard_index: u32, path: PathBuf) {
        if let Some(job) = self.jobs.get_mut(id) {
            if let Some(shard) = job.shards.iter_mut().find(|s| s.index == shard_index) {
                shard.status = ShardStatus::Ready;
                shard.collected_path = Some(path);
            }
        }
    }

    /// All shards collected, in segmentation order.
    pub fn collected_paths(&self, id: &JobId) -> Option<Vec<PathBuf>> {
        let job = self.jobs.get(id)?;
        let mut shards: Vec<&Shard> = job.shards.iter().collect();
        shards.sort_by_key(|s| s.index);
        shards
            .iter()
            .map(|s| s.collected_path.clone())
            .collect::<Option<Vec<_>>>()
    }

    /// Jobs that are mid-flight. Used to abandon work on master transitions.
    pub fn fail_all_active(&mut self, reason: FailureReason, message: &str) -> Vec<JobId> {
        let active: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.id.clone())
            .collect();
        for id in &active {
            self.fail(id, reason, message.to_string());
        }
        active
    }

    /// Insert a job restored from a backup replica.
    pub fn insert_restored(&mut self, id: JobId, format: ContainerFormat) {
        if self.jobs.contains_key(&id) {
            return;
        }
        let params = crate::master::job::JobParams {
            width: 0,
            height: 0,
            format,
        };
        let job = Job::restored(id.clone(), params, true);
        self.jobs.insert(id, job);
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.jobs.values().filter(|j| !j.status.is_terminal()).count()
    }

    pub fn all_ids(&self) -> Vec<JobId> {
        self.jobs.keys().cloned().collect()
    }
}
