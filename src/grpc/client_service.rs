//! Client-facing RPC surface: streamed upload, streamed retrieval, and
//! status snapshots. Only the current master accepts these.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::election::ElectionManager;
use crate::master::job::{Job, JobId, JobParams, JobStatus};
use crate::master::pipeline::{self, PipelineContext};
use crate::master::store::JobStore;
use crate::proto::transcode_service_server::TranscodeService;
use crate::proto::{
    upload_chunk, RetrieveRequest, StatusRequest, StatusResponse, UploadChunk, UploadResponse,
    VideoChunk,
};
use crate::STREAM_CHUNK_SIZE;

pub struct ClientService {
    election: Arc<ElectionManager>,
    store: Arc<RwLock<JobStore>>,
    pipeline: Arc<PipelineContext>,
}

impl ClientService {
    pub fn new(
        election: Arc<ElectionManager>,
        store: Arc<RwLock<JobStore>>,
        pipeline: Arc<PipelineContext>,
    ) -> Self {
        Self {
            election,
            store,
            pipeline,
        }
    }

    async fn require_master(&self) -> Result<(), Status> {
        if self.election.is_master().await {
            return Ok(());
        }
        let message = match self.election.current_master().await {
            Some(addr) => format!("Not the master. Current master is {addr}"),
            None => "Not the master. Master unknown, retry later".to_string(),
        };
        Err(Status::failed_precondition(message))
    }

    /// Receive the upload body into a temp file, enforcing the idle timeout
    /// on chunk arrival, then rename it into place.
    async fn receive_source(
        &self,
        id: &JobId,
        ext: &str,
        stream: &mut Streaming<UploadChunk>,
    ) -> Result<std::path::PathBuf, Status> {
        let job_dir = self.pipeline.config.master_data_dir().join(id.as_str());
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(|e| Status::internal(format!("scratch dir: {e}")))?;
        let tmp = job_dir.join(format!("source.{ext}.tmp"));
        let dest = job_dir.join(format!("source.{ext}"));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Status::internal(format!("scratch file: {e}")))?;

        loop {
            let next = tokio::time::timeout(self.pipeline.config.idle_timeout, stream.message())
                .await
                .map_err(|_| Status::deadline_exceeded("upload idle timeout"))?;
            match next? {
                Some(chunk) => match chunk.payload {
                    Some(upload_chunk::Payload::Data(data)) => {
                        file.write_all(&data)
                            .await
                            .map_err(|e| Status::internal(format!("write: {e}")))?;
                    }
                    Some(upload_chunk::Payload::Meta(_)) => {
                        return Err(Status::invalid_argument(
                            "metadata chunk repeated mid-stream",
                        ));
                    }
                    None => {}
                },
                None => break,
            }
        }

        file.flush()
            .await
            .map_err(|e| Status::internal(format!("flush: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| Status::internal(format!("fsync: {e}")))?;
        drop(file);
        tokio::fs::rename(&tmp, &dest)
            .await
            .map_err(|e| Status::internal(format!("rename: {e}")))?;
        Ok(dest)
    }
}

#[tonic::async_trait]
impl TranscodeService for ClientService {
    async fn upload(
        &self,
        request: Request<Streaming<UploadChunk>>,
    ) -> Result<Response<UploadResponse>, Status> {
        self.require_master().await?;

        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty upload stream"))?;
        let meta = match first.payload {
            Some(upload_chunk::Payload::Meta(meta)) => meta,
            _ => {
                return Err(Status::invalid_argument(
                    "first upload chunk must carry metadata",
                ))
            }
        };

        // Parameters are checked before any job record exists.
        let params =
            JobParams::validate(meta.target_width, meta.target_height, &meta.output_format)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let id = JobId::from_filename(&meta.filename)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let source_ext = std::path::Path::new(&meta.filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();

        // Reserve the id. Replacing a previous job is only allowed once it
        // reached a terminal status.
        let placeholder = Job::new(
            id.clone(),
            params,
            meta.filename.clone(),
            std::path::PathBuf::new(),
        );
        let cancel = {
            let mut store = self.store.write().await;
            store
                .create(placeholder)
                .map_err(|e| Status::already_exists(e.to_string()))?
        };

        tracing::info!(job_id = %id, filename = %meta.filename, "Upload started");

        let source_path = match self.receive_source(&id, &source_ext, &mut stream).await {
            Ok(path) => path,
            Err(status) => {
                self.store.write().await.fail(
                    &id,
                    crate::master::job::FailureReason::StorageError,
                    format!("upload stream failed: {}", status.message()),
                );
                return Err(status);
            }
        };

        {
            let mut store = self.store.write().await;
            if let Some(job) = store.get_mut(&id) {
                job.source_path = source_path;
            }
        }

        let ctx = self.pipeline.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            pipeline::run_job(ctx, job_id, cancel).await;
        });

        Ok(Response::new(UploadResponse {
            job_id: id.to_string(),
            accepted: true,
            message: "upload accepted".to_string(),
        }))
    }

    type RetrieveStream = ReceiverStream<Result<VideoChunk, Status>>;

    async fn retrieve(
        &self,
        request: Request<RetrieveRequest>,
    ) -> Result<Response<Self::RetrieveStream>, Status> {
        self.require_master().await?;

        let req = request.into_inner();
        let id = JobId::parse(&req.job_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let (status, format) = {
            let store = self.store.read().await;
            let job = store
                .get(&id)
                .ok_or_else(|| Status::not_found(format!("job {id} not found")))?;
            (job.status, job.params.format)
        };

        if status != JobStatus::Completed {
            return Err(Status::failed_precondition(format!(
                "job {id} not ready: {status}"
            )));
        }

        let path = self
            .pipeline
            .config
            .master_data_dir()
            .join(id.as_str())
            .join(format!("final.{}", format.extension()));

        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Status::internal(format!("final artifact missing: {e}")))?;

        let idle_timeout = self.pipeline.config.idle_timeout;
        let (tx, rx) = mpsc::channel::<Result<VideoChunk, Status>>(8);
        tokio::spawn(async move {
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Ok(VideoChunk {
                            data: buf[..n].to_vec(),
                        });
                        // A client that stops draining the stream for the
                        // idle window gets disconnected.
                        match tokio::time::timeout(idle_timeout, tx.send(chunk)).await {
                            Ok(Ok(())) => {}
                            _ => break,
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Status::internal(format!("read: {e}")))).await;
                        break;
                    }
                }
            }
        });

        tracing::info!(job_id = %id, "Streaming final artifact");
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let Ok(id) = JobId::parse(&req.job_id) else {
            return Ok(Response::new(StatusResponse {
                job_id: req.job_id,
                status: "not_found".to_string(),
                message: "malformed job id".to_string(),
            }));
        };

        let snapshot = self.store.read().await.status_of(&id);
        let (status, message) = snapshot.unwrap_or_else(|| {
            ("not_found".to_string(), "job not found".to_string())
        });

        Ok(Response::new(StatusResponse {
            job_id: req.job_id,
            status,
            message,
        }))
    }
}
