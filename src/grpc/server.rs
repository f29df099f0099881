use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterServiceImpl;
use crate::grpc::worker_service::ShardServiceImpl;
use crate::proto::cluster_service_server::ClusterServiceServer;
use crate::proto::shard_service_server::ShardServiceServer;
use crate::proto::transcode_service_server::TranscodeServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    client_service: ClientService,
    shard_service: ShardServiceImpl,
    cluster_service: ClusterServiceImpl,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        client_service: ClientService,
        shard_service: ShardServiceImpl,
        cluster_service: ClusterServiceImpl,
    ) -> Self {
        Self {
            addr,
            client_service,
            shard_service,
            cluster_service,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(TranscodeServiceServer::new(self.client_service))
            .add_service(ShardServiceServer::new(self.shard_service))
            .add_service(ClusterServiceServer::new(self.cluster_service))
            .serve_with_shutdown(self.addr, shutdown.cancelled())
            .await
    }
}
