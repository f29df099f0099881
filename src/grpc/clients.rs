//! Lazy, pooled connections to peers. Peers are referenced by address only;
//! channels are created on first use and reused until dropped on failure.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::error::{Result, VidshardError};
use crate::proto::cluster_service_client::ClusterServiceClient;
use crate::proto::shard_service_client::ShardServiceClient;
use crate::proto::transcode_service_client::TranscodeServiceClient;

#[derive(Debug, Clone, Default)]
pub struct ClientPool {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel(&self, address: &str) -> Result<Channel> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(address) {
            return Ok(channel.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| VidshardError::PeerUnavailable(format!("{address}: {e}")))?;
        let channel = endpoint.connect_lazy();
        channels.insert(address.to_string(), channel.clone());
        Ok(channel)
    }

    pub async fn cluster(&self, address: &str) -> Result<ClusterServiceClient<Channel>> {
        Ok(ClusterServiceClient::new(self.channel(address).await?))
    }

    pub async fn shard(&self, address: &str) -> Result<ShardServiceClient<Channel>> {
        Ok(ShardServiceClient::new(self.channel(address).await?))
    }

    pub async fn transcode(&self, address: &str) -> Result<TranscodeServiceClient<Channel>> {
        Ok(TranscodeServiceClient::new(self.channel(address).await?))
    }

    /// Drop a cached channel after a peer failure so the next call redials.
    pub async fn evict(&self, address: &str) {
        self.channels.lock().await.remove(address);
    }
}
