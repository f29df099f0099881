//! Client-side transport the master uses to move shard and artifact bytes.
//! A trait seam so the pipeline is testable with an in-memory fake; the real
//! implementation streams over the pooled gRPC channels.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Result, VidshardError};
use crate::grpc::ClientPool;
use crate::proto::{
    shard_chunk, BackupChunk, BackupMeta, BackupRequest, ListBackupsRequest, ShardChunk,
    ShardMeta, ShardRequest,
};
use crate::STREAM_CHUNK_SIZE;

#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Stream a source shard to `worker` and wait for the processed ack.
    async fn process_shard(&self, worker: &str, meta: ShardMeta, source: &Path) -> Result<u64>;

    /// Pull a processed shard from `worker` into `dest`.
    async fn fetch_shard(
        &self,
        worker: &str,
        job_id: &str,
        shard_index: u32,
        dest: &Path,
    ) -> Result<()>;

    /// Stream a final artifact to a backup node.
    async fn replicate(
        &self,
        backup: &str,
        job_id: &str,
        container: &str,
        artifact: &Path,
    ) -> Result<()>;

    /// Enumerate `(job_id, container)` pairs a backup node holds.
    async fn list_backups(&self, backup: &str) -> Result<Vec<(String, String)>>;

    /// Pull a replicated artifact from a backup node into `dest`.
    async fn fetch_backup(&self, backup: &str, job_id: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GrpcShardTransport {
    clients: ClientPool,
}

impl GrpcShardTransport {
    pub fn new(clients: ClientPool) -> Self {
        Self { clients }
    }
}

/// Feed a file into a channel of chunked messages.
async fn stream_file<T, F>(path: &Path, tx: mpsc::Sender<T>, wrap: F) -> Result<()>
where
    F: Fn(Vec<u8>) -> T,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
            return Err(VidshardError::Internal(
                "chunk receiver dropped mid-stream".to_string(),
            ));
        }
    }
    Ok(())
}

/// Write an incoming chunk stream to `dest`, then fsync.
async fn sink_chunks<S>(mut stream: S, dest: &Path) -> Result<()>
where
    S: tokio_stream::Stream<Item = std::result::Result<Vec<u8>, tonic::Status>> + Unpin,
{
    use tokio_stream::StreamExt;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl ShardTransport for GrpcShardTransport {
    async fn process_shard(&self, worker: &str, meta: ShardMeta, source: &Path) -> Result<u64> {
        let mut client = self.clients.shard(worker).await?;

        let (tx, rx) = mpsc::channel::<ShardChunk>(8);
        let source = source.to_path_buf();
        let feeder = tokio::spawn(async move {
            if tx
                .send(ShardChunk {
                    payload: Some(shard_chunk::Payload::Meta(meta)),
                })
                .await
                .is_err()
            {
                return Ok(());
            }
            stream_file(&source, tx, |data| ShardChunk {
                payload: Some(shard_chunk::Payload::Data(data)),
            })
            .await
        });

        let response = client
            .process_shard(ReceiverStream::new(rx))
            .await
            .map_err(|e| {
                VidshardError::PeerUnavailable(format!("{worker}: {e}"))
            })?
            .into_inner();

        feeder
            .await
            .map_err(|e| VidshardError::Internal(e.to_string()))??;

        if response.success {
            Ok(response.output_bytes)
        } else {
            Err(VidshardError::Media(response.message))
        }
    }

    async fn fetch_shard(
        &self,
        worker: &str,
        job_id: &str,
        shard_index: u32,
        dest: &Path,
    ) -> Result<()> {
        let mut client = self.clients.shard(worker).await?;
        let stream = client
            .request_shard(ShardRequest {
                job_id: job_id.to_string(),
                shard_index,
            })
            .await
            .map_err(|e| VidshardError::PeerUnavailable(format!("{worker}: {e}")))?
            .into_inner();

        use tokio_stream::StreamExt;
        let bytes = stream.map(|chunk| {
            chunk.map(|c| match c.payload {
                Some(shard_chunk::Payload::Data(data)) => data,
                _ => Vec::new(),
            })
        });
        tokio::pin!(bytes);
        sink_chunks(bytes, dest).await
    }

    async fn replicate(
        &self,
        backup: &str,
        job_id: &str,
        container: &str,
        artifact: &Path,
    ) -> Result<()> {
        let mut client = self.clients.shard(backup).await?;

        let (tx, rx) = mpsc::channel::<BackupChunk>(8);
        let artifact = artifact.to_path_buf();
        let meta = BackupMeta {
            job_id: job_id.to_string(),
            container: container.to_string(),
        };
        let feeder = tokio::spawn(async move {
            if tx
                .send(BackupChunk {
                    payload: Some(crate::proto::backup_chunk::Payload::Meta(meta)),
                })
                .await
                .is_err()
            {
                return Ok(());
            }
            stream_file(&artifact, tx, |data| BackupChunk {
                payload: Some(crate::proto::backup_chunk::Payload::Data(data)),
            })
            .await
        });

        let response = client
            .receive_backup(ReceiverStream::new(rx))
            .await
            .map_err(|e| VidshardError::PeerUnavailable(format!("{backup}: {e}")))?
            .into_inner();

        feeder
            .await
            .map_err(|e| VidshardError::Internal(e.to_string()))??;

        if response.success {
            Ok(())
        } else {
            Err(VidshardError::PeerUnavailable(format!(
                "{backup}: {}",
                response.message
            )))
        }
    }

    async fn list_backups(&self, backup: &str) -> Result<Vec<(String, String)>> {
        let mut client = self.clients.shard(backup).await?;
        let response = client
            .list_backups(ListBackupsRequest {})
            .await
            .map_err(|e| VidshardError::PeerUnavailable(format!("{backup}: {e}")))?
            .into_inner();
        Ok(response
            .entries
            .into_iter()
            .map(|e| (e.job_id, e.container))
            .collect())
    }

    async fn fetch_backup(&self, backup: &str, job_id: &str, dest: &Path) -> Result<()> {
        let mut client = self.clients.shard(backup).await?;
        let stream = client
            .send_backup(BackupRequest {
                job_id: job_id.to_string(),
            })
            .await
            .map_err(|e| VidshardError::PeerUnavailable(format!("{backup}: {e}")))?
            .into_inner();

        use tokio_stream::StreamExt;
        let bytes = stream.map(|chunk| {
            chunk.map(|c| match c.payload {
                Some(crate::proto::backup_chunk::Payload::Data(data)) => data,
                _ => Vec::new(),
            })
        });
        tokio::pin!(bytes);
        sink_chunks(bytes, dest).await
    }
}
