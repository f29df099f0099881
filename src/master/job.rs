//! Job and shard records owned by the master engine. Statuses are sum types
//! internally and strings on the wire.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::{Result, VidshardError};
use crate::media::ContainerFormat;

pub const MAX_WIDTH: u32 = 7680;
pub const MAX_HEIGHT: u32 = 4320;

/// Stable job identifier derived from the uploaded filename. One job per id
/// at a time; a finished job may be replaced by a fresh upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    /// Derive from a filename: the stem, lowercased, with anything outside
    /// `[a-z0-9._-]` replaced by `_`.
    pub fn from_filename(filename: &str) -> Result<Self> {
        let stem = std::path::Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        let cleaned: String = stem
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            return Err(VidshardError::InvalidParams(format!(
                "filename '{filename}' yields an empty job id"
            )));
        }
        Ok(Self(cleaned))
    }

    /// Accept an id that is already in derived form (as received on the wire).
    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(VidshardError::InvalidParams(format!("malformed job id '{s}'")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested transcode parameters.
#[derive(Debug, Clone, Copy)]
pub struct JobParams {
    pub width: u32,
    pub height: u32,
    pub format: ContainerFormat,
}

impl JobParams {
    pub fn validate(width: u32, height: u32, format: &str) -> Result<Self> {
        if width == 0 || width > MAX_WIDTH {
            return Err(VidshardError::InvalidParams(format!(
                "width {width} out of range (1..={MAX_WIDTH})"
            )));
        }
        if height == 0 || height > MAX_HEIGHT {
            return Err(VidshardError::InvalidParams(format!(
                "height {height} out of range (1..={MAX_HEIGHT})"
            )));
        }
        let format: ContainerFormat = format
            .parse()
            .map_err(VidshardError::InvalidParams)?;
        Ok(Self {
            width,
            height,
            format,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Pending,
    Assigned,
    Processing,
    Ready,
    Failed,
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardStatus::Pending => write!(f, "pending"),
            ShardStatus::Assigned => write!(f, "assigned"),
            ShardStatus::Processing => write!(f, "processing"),
            ShardStatus::Ready => write!(f, "ready"),
            ShardStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ShardStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ShardStatus::Pending),
            "assigned" => Ok(ShardStatus::Assigned),
            "processing" => Ok(ShardStatus::Processing),
            "ready" => Ok(ShardStatus::Ready),
            "failed" => Ok(ShardStatus::Failed),
            other => Err(format!("unknown shard status '{other}'")),
        }
    }
}

impl ShardStatus {
    /// Rank in the pending → assigned → processing → ready progression.
    /// Failed sits outside the ladder.
    fn rank(&self) -> Option<u8> {
        match self {
            ShardStatus::Pending => Some(0),
            ShardStatus::Assigned => Some(1),
            ShardStatus::Processing => Some(2),
            ShardStatus::Ready => Some(3),
            ShardStatus::Failed => None,
        }
    }

    /// Whether moving to `next` within the same attempt preserves monotonic
    /// progress. Any state may move to Failed.
    pub fn can_advance_to(&self, next: ShardStatus) -> bool {
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (None, _) => false,
            (Some(a), Some(b)) => b >= a,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Shard {
    pub index: u32,
    /// Source segment path on the master.
    pub source_path: PathBuf,
    pub assigned_worker: Option<String>,
    pub status: ShardStatus,
    pub attempt: u32,
    /// Where the collected processed shard lives on the master, once pulled.
    pub collected_path: Option<PathBuf>,
    /// When the shard last entered the pending state, for starvation checks.
    pub pending_since: Instant,
}

impl Shard {
    pub fn new(index: u32, source_path: PathBuf) -> Self {
        Self {
            index,
            source_path,
            assigned_worker: None,
            status: ShardStatus::Pending,
            attempt: 0,
            collected_path: None,
            pending_since: Instant::now(),
        }
    }

    /// Reset for another attempt on a different worker.
    pub fn reset_for_retry(&mut self) {
        self.attempt += 1;
        self.status = ShardStatus::Pending;
        self.assigned_worker = None;
        self.pending_since = Instant::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ShardExhausted,
    MediaError,
    StorageError,
    MasterFailover,
    NoWorkers,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ShardExhausted => "shard-exhausted",
            FailureReason::MediaError => "media-error",
            FailureReason::StorageError => "storage-error",
            FailureReason::MasterFailover => "master-failover",
            FailureReason::NoWorkers => "no-workers",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Uploading,
    Segmenting,
    Dispatching,
    Processing,
    Collecting,
    Concatenating,
    Completed,
    Failed(FailureReason),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed(_))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Uploading => write!(f, "uploading"),
            JobStatus::Segmenting => write!(f, "segmenting"),
            JobStatus::Dispatching => write!(f, "dispatching"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Collecting => write!(f, "collecting"),
            JobStatus::Concatenating => write!(f, "concatenating"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed(reason) => write!(f, "failed:{}", reason.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub params: JobParams,
    pub original_filename: String,
    /// Uploaded source on the master's disk.
    pub source_path: PathBuf,
    pub shards: Vec<Shard>,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once the final artifact is replicated (or the local store is the
    /// configured durability target).
    pub durable: bool,
}

impl Job {
    pub fn new(id: JobId, params: JobParams, original_filename: String, source_path: PathBuf) -> Self {
        Self {
            id,
            params,
            original_filename,
            source_path,
            shards: Vec::new(),
            status: JobStatus::Uploading,
            message: String::new(),
            created_at: Utc::now(),
            completed_at: None,
            durable: false,
        }
    }

    /// A restored job: artifact pulled from a backup after failover.
    pub fn restored(id: JobId, params: JobParams, final_available: bool) -> Self {
        let mut job = Self::new(id, params, String::new(), PathBuf::new());
        if final_available {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.durable = true;
        }
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_from_filename() {
        let id = JobId::from_filename("My Holiday Video.mp4").unwrap();
        assert_eq!(id.as_str(), "my_holiday_video");

        let id = JobId::from_filename("clip-01.final.mkv").unwrap();
        assert_eq!(id.as_str(), "clip-01.final");

        assert!(JobId::from_filename("").is_err());
    }

    #[test]
    fn test_param_validation() {
        assert!(JobParams::validate(640, 480, "mp4").is_ok());
        assert!(JobParams::validate(0, 480, "mp4").is_err());
        assert!(JobParams::validate(640, 0, "mp4").is_err());
        assert!(JobParams::validate(7681, 480, "mp4").is_err());
        assert!(JobParams::validate(640, 4321, "mp4").is_err());
        assert!(JobParams::validate(640, 480, "avi").is_err());
    }

    #[test]
    fn test_shard_status_ladder() {
        assert!(ShardStatus::Pending.can_advance_to(ShardStatus::Assigned));
        assert!(ShardStatus::Assigned.can_advance_to(ShardStatus::Processing));
        assert!(ShardStatus::Processing.can_advance_to(ShardStatus::Ready));
        assert!(ShardStatus::Processing.can_advance_to(ShardStatus::Failed));
        assert!(!ShardStatus::Ready.can_advance_to(ShardStatus::Processing));
        assert!(!ShardStatus::Failed.can_advance_to(ShardStatus::Ready));
    }

    #[test]
    fn test_shard_retry_resets() {
        let mut shard = Shard::new(3, PathBuf::from("/tmp/0003.mp4"));
        shard.status = ShardStatus::Failed;
        shard.assigned_worker = Some("10.0.0.5:50055".to_string());

        shard.reset_for_retry();
        assert_eq!(shard.attempt, 1);
        assert_eq!(shard.status, ShardStatus::Pending);
        assert!(shard.assigned_worker.is_none());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(
            JobStatus::Failed(FailureReason::ShardExhausted).to_string(),
            "failed:shard-exhausted"
        );
        assert_eq!(
            JobStatus::Failed(FailureReason::MasterFailover).to_string(),
            "failed:master-failover"
        );
        assert!(JobStatus::Failed(FailureReason::MediaError).is_terminal());
        assert!(!JobStatus::Collecting.is_terminal());
    }
}
