//! Durable store for replicated final artifacts, indexed by job id.
//! Artifacts are written to a temp file, fsynced, and renamed into place so
//! a partially received replica is never served.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::{Result, VidshardError};

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn artifact_path(&self, job_id: &str, container: &str) -> PathBuf {
        self.job_dir(job_id).join(format!("final.{container}"))
    }

    /// Open a writer for an incoming replica. Call [`BackupWriter::commit`]
    /// once the stream ends.
    pub async fn begin_receive(&self, job_id: &str, container: &str) -> Result<BackupWriter> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = self.artifact_path(job_id, container);
        let tmp = dest.with_extension(format!("{container}.tmp"));
        let file = tokio::fs::File::create(&tmp).await?;
        Ok(BackupWriter { file, tmp, dest })
    }

    /// Locate a stored artifact for streaming back.
    pub async fn find(&self, job_id: &str) -> Result<PathBuf> {
        for container in ["mp4", "mkv", "webm", "mov"] {
            let path = self.artifact_path(job_id, container);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }
        }
        Err(VidshardError::JobNotFound(job_id.to_string()))
    }

    /// Enumerate stored `(job_id, container)` pairs.
    pub async fn list(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let Some(job_id) = dir.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(container) = name.strip_prefix("final.") {
                    if !container.ends_with(".tmp") {
                        entries.push((job_id.clone(), container.to_string()));
                    }
                }
            }
        }
        Ok(entries)
    }
}

/// In-progress replica write. Dropping without committing leaves only the
/// temp file behind.
pub struct BackupWriter {
    file: tokio::fs::File,
    tmp: PathBuf,
    dest: PathBuf,
}

impl BackupWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.tmp, &self.dest).await?;
        Ok(self.dest)
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }
}
