pub mod config;
pub mod election;
pub mod error;
pub mod gateway;
pub mod grpc;
pub mod master;
pub mod media;
pub mod node;
pub mod registry;
pub mod scorer;
pub mod shutdown;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("vidshard");
}

/// Chunk size for all streamed byte transfers (upload, retrieve, shards, backups).
pub const STREAM_CHUNK_SIZE: usize = 1024 * 1024;
