//! Top-level node wiring. Builds the shared state, spawns the background
//! loops (election, score reporting, master probing, registry pruning), and
//! blocks on the gRPC server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::election::{ElectionEvent, ElectionManager, ElectionMessage};
use crate::gateway;
use crate::grpc::client_service::ClientService;
use crate::grpc::cluster_service::ClusterServiceImpl;
use crate::grpc::worker_service::ShardServiceImpl;
use crate::grpc::{ClientPool, GrpcServer};
use crate::master::pipeline::{self, PipelineContext};
use crate::master::store::JobStore;
use crate::master::transport::GrpcShardTransport;
use crate::media::MediaExecutor;
use crate::proto::{NodeStatsRequest, RegisterWorkerRequest, ReportScoreRequest, ScoreBreakdown};
use crate::registry::{NodeRegistry, PeerRole};
use crate::scorer::ResourceScorer;
use crate::worker::{BackupStore, WorkerEngine};

const PROBE_RPC_TIMEOUT: Duration = Duration::from_secs(2);
const REGISTER_RETRY: Duration = Duration::from_secs(5);
/// Peers silent for this long are dropped from the registry entirely.
const PEER_AGE_OUT: Duration = Duration::from_secs(120);

/// Main node that owns all components.
pub struct Node {
    config: NodeConfig,
    gateway_addr: Option<SocketAddr>,
}

impl Node {
    pub fn new(config: NodeConfig, gateway_addr: Option<SocketAddr>) -> Self {
        Self {
            config,
            gateway_addr,
        }
    }

    /// Run the node until the shutdown token fires. Spawns:
    /// 1. the election event loop and its event handler,
    /// 2. the score sampling/reporting loop,
    /// 3. the master liveness probe (non-masters),
    /// 4. the registry pruner,
    /// 5. the optional HTTP gateway,
    /// then blocks on the gRPC server.
    pub async fn run(self, shutdown: CancellationToken) -> crate::error::Result<()> {
        let config = self.config.clone();
        tokio::fs::create_dir_all(config.shards_dir()).await?;
        tokio::fs::create_dir_all(config.master_data_dir()).await?;
        tokio::fs::create_dir_all(config.backup_dir()).await?;

        if let Err(e) = MediaExecutor::check_available() {
            tracing::warn!(error = %e, "Media tool missing; transcode operations will fail");
        }

        let clients = ClientPool::new();
        let store = Arc::new(RwLock::new(JobStore::new()));
        let registry = Arc::new(RwLock::new(NodeRegistry::new(
            config.suspect_timeout,
            config.dead_timeout,
        )));

        let (events_tx, events_rx) = mpsc::channel::<ElectionEvent>(16);
        let (election, election_rx) =
            ElectionManager::new(config.clone(), clients.clone(), events_tx);
        let election = Arc::new(election);

        let pipeline = Arc::new(PipelineContext {
            config: config.clone(),
            store: store.clone(),
            registry: registry.clone(),
            transport: Arc::new(GrpcShardTransport::new(clients.clone())),
            media: MediaExecutor::new(),
            job_slots: Arc::new(Semaphore::new(config.job_concurrency.max(1))),
        });

        let engine = Arc::new(WorkerEngine::new(config.clone(), clients.clone()));
        let backups = Arc::new(BackupStore::new(config.backup_dir()));

        let (score_tx, score_rx) = watch::channel(crate::scorer::NEUTRAL_SCORE);

        // Election loop.
        {
            let election = election.clone();
            tokio::spawn(async move {
                election.assume_initial_role().await;
                election.run(election_rx).await;
            });
        }

        // Election event handler: master transitions drive restore/abandon
        // on this node and retarget the worker engine's reporting.
        {
            let pipeline = pipeline.clone();
            let engine = engine.clone();
            let clients = clients.clone();
            tokio::spawn(async move {
                Self::handle_election_events(events_rx, pipeline, engine, clients).await;
            });
        }

        // Score sampling and reporting.
        {
            let config = config.clone();
            let clients = clients.clone();
            let election = election.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                Self::score_loop(config, clients, election, registry, score_tx).await;
            });
        }

        // Master liveness probe and registration (non-masters).
        {
            let config = config.clone();
            let clients = clients.clone();
            let election = election.clone();
            tokio::spawn(async move {
                Self::probe_master_loop(config, clients, election).await;
            });
        }

        // Registry pruning.
        {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(10));
                loop {
                    interval.tick().await;
                    registry.write().await.prune(PEER_AGE_OUT);
                }
            });
        }

        // Optional HTTP gateway.
        if let Some(addr) = self.gateway_addr {
            let clients = clients.clone();
            let local = config.advertise_addr.clone();
            tokio::spawn(async move {
                gateway::run_gateway(addr, clients, local).await;
            });
        }

        let client_service = ClientService::new(election.clone(), store.clone(), pipeline.clone());
        let shard_service = ShardServiceImpl::new(engine.clone(), backups.clone());
        let cluster_service = ClusterServiceImpl::new(
            config.advertise_addr.clone(),
            election.clone(),
            registry.clone(),
            store.clone(),
            score_rx,
        );

        tracing::info!(
            role = %config.role,
            addr = %config.listen_addr,
            advertise = %config.advertise_addr,
            peers = config.peers.len(),
            backups = config.backups.len(),
            "Starting node"
        );

        let server = GrpcServer::new(
            config.listen_addr,
            client_service,
            shard_service,
            cluster_service,
        );
        server.run(shutdown).await?;
        Ok(())
    }

    async fn handle_election_events(
        mut events_rx: mpsc::Receiver<ElectionEvent>,
        pipeline: Arc<PipelineContext>,
        engine: Arc<WorkerEngine>,
        clients: ClientPool,
    ) {
        while let Some(event) = events_rx.recv().await {
            match event {
                ElectionEvent::WonTerm(term) => {
                    tracing::info!(term, "Elected master, restoring from backups");
                    engine
                        .set_master(Some(pipeline.config.advertise_addr.clone()))
                        .await;
                    pipeline::restore_from_backups(&pipeline).await;
                }
                ElectionEvent::NewMaster { address, term } => {
                    tracing::info!(master = %address, term, "Adopted new master");
                    engine.set_master(Some(address.clone())).await;
                    engine.report_unreported().await;
                    Self::register_with(&pipeline.config, &clients, &address).await;
                }
                ElectionEvent::Demoted { new_master, term } => {
                    tracing::warn!(master = %new_master, term, "Demoted from master");
                    engine.set_master(Some(new_master.clone())).await;
                    // Jobs this node was orchestrating are lost to the new
                    // master; record that locally for status queries.
                    pipeline.store.write().await.fail_all_active(
                        crate::master::job::FailureReason::MasterFailover,
                        "abandoned at master failover",
                    );
                    Self::register_with(&pipeline.config, &clients, &new_master).await;
                }
            }
        }
    }

    async fn register_with(config: &NodeConfig, clients: &ClientPool, master: &str) {
        if config.advertise_addr == master {
            return;
        }
        let request = RegisterWorkerRequest {
            address: config.advertise_addr.clone(),
            capacity: config.worker_capacity as u32,
        };
        match clients.cluster(master).await {
            Ok(mut client) => {
                if let Err(e) = client.register_worker(request).await {
                    tracing::warn!(master, error = %e, "Registration failed");
                }
            }
            Err(e) => tracing::warn!(master, error = %e, "Registration failed"),
        }
    }

    /// Sample the local score on the configured cadence, publish it for
    /// stats queries, and push it to the master (workers only; the report
    /// doubles as the heartbeat).
    async fn score_loop(
        config: NodeConfig,
        clients: ClientPool,
        election: Arc<ElectionManager>,
        registry: Arc<RwLock<NodeRegistry>>,
        score_tx: watch::Sender<f64>,
    ) {
        let mut scorer = ResourceScorer::new(config.score_weights);
        let mut interval = tokio::time::interval(config.score_cadence);

        loop {
            interval.tick().await;
            let sample = scorer.sample();
            let _ = score_tx.send(sample.score);

            if election.is_master().await {
                // The master scores itself for stats queries but is never an
                // assignment candidate; the Master role keeps it out of the
                // eligible set.
                let mut registry = registry.write().await;
                registry.register(&config.advertise_addr, PeerRole::Master);
                registry.record_score(&config.advertise_addr, sample.score);
                continue;
            }

            let Some(master) = election.current_master().await else {
                continue;
            };
            let request = ReportScoreRequest {
                address: config.advertise_addr.clone(),
                score: Some(ScoreBreakdown {
                    score: sample.score,
                    load_norm: sample.load_norm,
                    io_wait: sample.io_wait,
                    net_util: sample.net_util,
                    mem_util: sample.mem_util,
                }),
                sampled_at_ms: chrono::Utc::now().timestamp_millis(),
            };

            let Ok(mut client) = clients.cluster(&master).await else {
                continue;
            };
            match timeout(PROBE_RPC_TIMEOUT, client.report_score(request)).await {
                Ok(Ok(_)) => {
                    let _ = election
                        .message_sender()
                        .send(ElectionMessage::MasterSeen)
                        .await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(master = %master, error = %e, "Score report failed");
                    clients.evict(&master).await;
                }
                Err(_) => {
                    tracing::debug!(master = %master, "Score report timed out");
                    clients.evict(&master).await;
                }
            }
        }
    }

    /// Probe the master with stats requests on the score cadence. Successful
    /// probes feed the election silence clock; registration is retried until
    /// the master acknowledges this worker.
    async fn probe_master_loop(
        config: NodeConfig,
        clients: ClientPool,
        election: Arc<ElectionManager>,
    ) {
        let mut registered = false;
        let mut interval = tokio::time::interval(config.score_cadence);

        loop {
            interval.tick().await;
            if election.is_master().await {
                registered = false;
                continue;
            }

            let Some(master) = election.current_master().await else {
                continue;
            };

            if !registered {
                let request = RegisterWorkerRequest {
                    address: config.advertise_addr.clone(),
                    capacity: config.worker_capacity as u32,
                };
                if let Ok(mut client) = clients.cluster(&master).await {
                    match timeout(REGISTER_RETRY, client.register_worker(request)).await {
                        Ok(Ok(response)) => {
                            registered = response.into_inner().accepted;
                            tracing::info!(master = %master, "Registered with master");
                        }
                        _ => {
                            tracing::debug!(master = %master, "Registration attempt failed");
                        }
                    }
                }
            }

            let Ok(mut client) = clients.cluster(&master).await else {
                continue;
            };
            match timeout(PROBE_RPC_TIMEOUT, client.get_node_stats(NodeStatsRequest {})).await {
                Ok(Ok(_)) => {
                    let _ = election
                        .message_sender()
                        .send(ElectionMessage::MasterSeen)
                        .await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(master = %master, error = %e, "Master probe failed");
                    clients.evict(&master).await;
                }
                Err(_) => {
                    tracing::debug!(master = %master, "Master probe timed out");
                    clients.evict(&master).await;
                }
            }
        }
    }
}
