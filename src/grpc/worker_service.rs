//! Node-to-node byte movement: shard processing, shard pull, and the backup
//! store. Served by every node; the master calls these on workers and
//! backups.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::proto::shard_service_server::ShardService;
use crate::proto::{
    backup_chunk, shard_chunk, BackupChunk, BackupRequest, BackupResponse, ListBackupsRequest,
    ListBackupsResponse, ProcessShardResponse, ShardChunk, ShardRequest,
};
use crate::worker::{BackupStore, WorkerEngine};
use crate::STREAM_CHUNK_SIZE;

pub struct ShardServiceImpl {
    engine: Arc<WorkerEngine>,
    backups: Arc<BackupStore>,
}

impl ShardServiceImpl {
    pub fn new(engine: Arc<WorkerEngine>, backups: Arc<BackupStore>) -> Self {
        Self { engine, backups }
    }
}

/// Stream a file into chunked responses through a bounded channel.
fn spawn_file_stream<T, F>(path: std::path::PathBuf, wrap: F) -> ReceiverStream<Result<T, Status>>
where
    T: Send + 'static,
    F: Fn(Vec<u8>) -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<T, Status>>(8);
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tx
                    .send(Err(Status::internal(format!("open {}: {e}", path.display()))))
                    .await;
                return;
            }
        };
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(wrap(buf[..n].to_vec()))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(Status::internal(format!("read: {e}")))).await;
                    break;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

#[tonic::async_trait]
impl ShardService for ShardServiceImpl {
    async fn process_shard(
        &self,
        request: Request<Streaming<ShardChunk>>,
    ) -> Result<Response<ProcessShardResponse>, Status> {
        let mut stream = request.into_inner();

        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty shard stream"))?;
        let meta = match first.payload {
            Some(shard_chunk::Payload::Meta(meta)) => meta,
            _ => {
                return Err(Status::invalid_argument(
                    "first shard chunk must carry metadata",
                ))
            }
        };

        let input = self.engine.scratch_path(&meta);
        if let Some(parent) = input.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Status::internal(format!("scratch dir: {e}")))?;
        }
        let mut file = tokio::fs::File::create(&input)
            .await
            .map_err(|e| Status::internal(format!("scratch file: {e}")))?;

        while let Some(chunk) = stream.message().await? {
            if let Some(shard_chunk::Payload::Data(data)) = chunk.payload {
                file.write_all(&data)
                    .await
                    .map_err(|e| Status::internal(format!("write: {e}")))?;
            }
        }
        file.flush()
            .await
            .map_err(|e| Status::internal(format!("flush: {e}")))?;
        drop(file);

        tracing::info!(
            job_id = %meta.job_id,
            shard = meta.shard_index,
            attempt = meta.attempt,
            "Shard received"
        );

        let response = match self.engine.process_shard(&meta, input).await {
            Ok(bytes) => ProcessShardResponse {
                job_id: meta.job_id,
                shard_index: meta.shard_index,
                attempt: meta.attempt,
                success: true,
                output_bytes: bytes,
                message: String::new(),
            },
            Err(e) => ProcessShardResponse {
                job_id: meta.job_id,
                shard_index: meta.shard_index,
                attempt: meta.attempt,
                success: false,
                output_bytes: 0,
                message: e.to_string(),
            },
        };

        Ok(Response::new(response))
    }

    type RequestShardStream = ReceiverStream<Result<ShardChunk, Status>>;

    async fn request_shard(
        &self,
        request: Request<ShardRequest>,
    ) -> Result<Response<Self::RequestShardStream>, Status> {
        let req = request.into_inner();
        let path = self
            .engine
            .open_processed(&req.job_id, req.shard_index)
            .await
            .map_err(|e| Status::not_found(e.to_string()))?;

        Ok(Response::new(spawn_file_stream(path, |data| ShardChunk {
            payload: Some(shard_chunk::Payload::Data(data)),
        })))
    }

    async fn receive_backup(
        &self,
        request: Request<Streaming<BackupChunk>>,
    ) -> Result<Response<BackupResponse>, Status> {
        let mut stream = request.into_inner();

        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty backup stream"))?;
        let meta = match first.payload {
            Some(backup_chunk::Payload::Meta(meta)) => meta,
            _ => {
                return Err(Status::invalid_argument(
                    "first backup chunk must carry metadata",
                ))
            }
        };

        let mut writer = self
            .backups
            .begin_receive(&meta.job_id, &meta.container)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        while let Some(chunk) = stream.message().await? {
            if let Some(backup_chunk::Payload::Data(data)) = chunk.payload {
                writer
                    .write(&data)
                    .await
                    .map_err(|e| Status::internal(e.to_string()))?;
            }
        }

        let dest = writer
            .commit()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        tracing::info!(job_id = %meta.job_id, path = %dest.display(), "Backup stored");
        Ok(Response::new(BackupResponse {
            job_id: meta.job_id,
            success: true,
            message: String::new(),
        }))
    }

    type SendBackupStream = ReceiverStream<Result<BackupChunk, Status>>;

    async fn send_backup(
        &self,
        request: Request<BackupRequest>,
    ) -> Result<Response<Self::SendBackupStream>, Status> {
        let req = request.into_inner();
        let path = self
            .backups
            .find(&req.job_id)
            .await
            .map_err(|e| Status::not_found(e.to_string()))?;

        Ok(Response::new(spawn_file_stream(path, |data| BackupChunk {
            payload: Some(backup_chunk::Payload::Data(data)),
        })))
    }

    async fn list_backups(
        &self,
        _request: Request<ListBackupsRequest>,
    ) -> Result<Response<ListBackupsResponse>, Status> {
        let entries = self
            .backups
            .list()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(ListBackupsResponse {
            entries: entries
                .into_iter()
                .map(|(job_id, container)| crate::proto::BackupEntry { job_id, container })
                .collect(),
        }))
    }
}
