use thiserror::Error;

#[derive(Error, Debug)]
pub enum VidshardError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} not ready: {1}")]
    NotReady(String, String),

    #[error("Job {0} is still active and cannot be replaced")]
    AlreadyRunning(String),

    #[error("Not the master, current master is {0:?}")]
    NotMaster(Option<String>),

    #[error("No workers available")]
    NoWorkersAvailable,

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Media tool failed: {0}")]
    Media(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Quorum unreachable: {got} of {needed} votes")]
    Quorum { got: usize, needed: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VidshardError>;
