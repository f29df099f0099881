pub mod client_service;
pub mod clients;
pub mod cluster_service;
pub mod server;
pub mod worker_service;

pub use clients::ClientPool;
pub use server::GrpcServer;
