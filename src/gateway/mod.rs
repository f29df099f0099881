//! Thin HTTP bridge for browser clients: upload, status and retrieval over
//! plain HTTP, translated onto the local node's client RPC surface.

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::grpc::ClientPool;
use crate::proto::{upload_chunk, RetrieveRequest, StatusRequest, UploadChunk, UploadMeta};
use crate::STREAM_CHUNK_SIZE;

#[derive(Clone)]
pub struct GatewayState {
    clients: ClientPool,
    /// Address of the co-located node's gRPC endpoint.
    local_addr: String,
}

#[derive(Deserialize)]
struct UploadQuery {
    width: u32,
    height: u32,
    format: String,
    filename: String,
}

#[derive(Serialize)]
struct UploadReply {
    job_id: String,
    accepted: bool,
    message: String,
}

#[derive(Serialize)]
struct StatusReply {
    job_id: String,
    status: String,
    message: String,
}

pub async fn run_gateway(addr: SocketAddr, clients: ClientPool, local_addr: String) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = GatewayState {
        clients,
        local_addr,
    };

    let app = Router::new()
        .route("/upload", post(upload_handler))
        .route("/status/:id", get(status_handler))
        .route("/retrieve/:id", get(retrieve_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Starting HTTP gateway");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP gateway");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "HTTP gateway failed");
    }
}

async fn upload_handler(
    State(state): State<GatewayState>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let mut client = match state.clients.transcode(&state.local_addr).await {
        Ok(client) => client,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(UploadReply {
                    job_id: String::new(),
                    accepted: false,
                    message: e.to_string(),
                }),
            )
        }
    };

    let meta = UploadMeta {
        filename: query.filename,
        target_width: query.width,
        target_height: query.height,
        output_format: query.format,
    };

    let (tx, rx) = mpsc::channel::<UploadChunk>(8);
    tokio::spawn(async move {
        if tx
            .send(UploadChunk {
                payload: Some(upload_chunk::Payload::Meta(meta)),
            })
            .await
            .is_err()
        {
            return;
        }
        for chunk in body.chunks(STREAM_CHUNK_SIZE) {
            if tx
                .send(UploadChunk {
                    payload: Some(upload_chunk::Payload::Data(chunk.to_vec())),
                })
                .await
                .is_err()
            {
                return;
            }
        }
    });

    match client.upload(ReceiverStream::new(rx)).await {
        Ok(response) => {
            let response = response.into_inner();
            (
                StatusCode::OK,
                Json(UploadReply {
                    job_id: response.job_id,
                    accepted: response.accepted,
                    message: response.message,
                }),
            )
        }
        Err(status) => (
            grpc_to_http(&status),
            Json(UploadReply {
                job_id: String::new(),
                accepted: false,
                message: status.message().to_string(),
            }),
        ),
    }
}

async fn status_handler(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut client = match state.clients.transcode(&state.local_addr).await {
        Ok(client) => client,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(StatusReply {
                    job_id: id,
                    status: "unknown".to_string(),
                    message: e.to_string(),
                }),
            )
        }
    };

    match client.get_status(StatusRequest { job_id: id.clone() }).await {
        Ok(response) => {
            let response = response.into_inner();
            (
                StatusCode::OK,
                Json(StatusReply {
                    job_id: response.job_id,
                    status: response.status,
                    message: response.message,
                }),
            )
        }
        Err(status) => (
            grpc_to_http(&status),
            Json(StatusReply {
                job_id: id,
                status: "unknown".to_string(),
                message: status.message().to_string(),
            }),
        ),
    }
}

async fn retrieve_handler(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut client = match state.clients.transcode(&state.local_addr).await {
        Ok(client) => client,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };

    let stream = match client.retrieve(RetrieveRequest { job_id: id }).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            return (grpc_to_http(&status), status.message().to_string()).into_response()
        }
    };

    use tokio_stream::StreamExt;
    let body = Body::from_stream(stream.map(|chunk| {
        chunk
            .map(|c| c.data)
            .map_err(|e| std::io::Error::other(e.message().to_string()))
    }));

    (StatusCode::OK, body).into_response()
}

fn grpc_to_http(status: &tonic::Status) -> StatusCode {
    match status.code() {
        tonic::Code::NotFound => StatusCode::NOT_FOUND,
        tonic::Code::InvalidArgument => StatusCode::BAD_REQUEST,
        tonic::Code::AlreadyExists => StatusCode::CONFLICT,
        tonic::Code::FailedPrecondition => StatusCode::CONFLICT,
        tonic::Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
