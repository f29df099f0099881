use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Role a node starts with. Election may promote a worker to master later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(NodeRole::Master),
            "worker" => Ok(NodeRole::Worker),
            other => Err(format!("unknown role '{other}', expected master or worker")),
        }
    }
}

/// Weights for the resource score. Must sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub load: f64,
    pub io_wait: f64,
    pub net: f64,
    pub mem: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            load: 0.4,
            io_wait: 0.2,
            net: 0.2,
            mem: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: NodeRole,
    pub listen_addr: SocketAddr,
    /// Address peers use to reach this node (host:port).
    pub advertise_addr: String,
    /// Initial master address. Required for workers, ignored for the master.
    pub master_addr: Option<String>,
    /// Other nodes in the cluster (host:port).
    pub peers: Vec<String>,
    /// Nodes that receive replicated final artifacts.
    pub backups: Vec<String>,
    /// Root for all on-disk state (video_shards/, master_data/).
    pub data_dir: PathBuf,

    pub segment_seconds: u32,
    pub job_concurrency: usize,
    pub worker_capacity: usize,
    pub max_attempts: u32,
    pub shard_timeout: Duration,
    pub starvation_threshold: Duration,
    pub idle_timeout: Duration,

    pub score_cadence: Duration,
    pub score_ttl: Duration,
    pub score_weights: ScoreWeights,

    pub suspect_timeout: Duration,
    pub dead_timeout: Duration,
    pub master_silence: Duration,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Worker,
            listen_addr: "127.0.0.1:50051".parse().unwrap(),
            advertise_addr: "127.0.0.1:50051".to_string(),
            master_addr: None,
            peers: Vec::new(),
            backups: Vec::new(),
            data_dir: PathBuf::from("."),
            segment_seconds: 10,
            job_concurrency: 4,
            worker_capacity: 2,
            max_attempts: 3,
            shard_timeout: Duration::from_secs(120),
            starvation_threshold: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            score_cadence: Duration::from_secs(2),
            score_ttl: Duration::from_secs(10),
            score_weights: ScoreWeights::default(),
            suspect_timeout: Duration::from_secs(6),
            dead_timeout: Duration::from_secs(15),
            master_silence: Duration::from_secs(10),
            // The classic [150, 300] ms window scaled up so the minimum is one
            // second; shard transfers make sub-second timeouts too twitchy.
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
        }
    }
}

impl NodeConfig {
    pub fn new(role: NodeRole, listen_addr: SocketAddr) -> Self {
        Self {
            role,
            listen_addr,
            advertise_addr: listen_addr.to_string(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        self.peers.push(addr.into());
        self
    }

    pub fn with_backup(mut self, addr: impl Into<String>) -> Self {
        self.backups.push(addr.into());
        self
    }

    /// Effective deadline for one shard attempt: three times the expected
    /// transcode wall-time for a segment, floored at the configured timeout.
    pub fn effective_shard_timeout(&self) -> Duration {
        let expected = Duration::from_secs(u64::from(self.segment_seconds) * 3);
        self.shard_timeout.max(expected)
    }

    /// Directory holding shard scratch files (worker side).
    pub fn shards_dir(&self) -> PathBuf {
        self.data_dir.join("video_shards")
    }

    /// Directory holding collected shards and final artifacts (master side).
    pub fn master_data_dir(&self) -> PathBuf {
        self.data_dir.join("master_data")
    }

    /// Directory holding replicated artifacts (backup store).
    pub fn backup_dir(&self) -> PathBuf {
        self.master_data_dir().join("backup")
    }
}
