//! Membership, score, shard-report and election RPCs between nodes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{watch, RwLock};
use tonic::{Request, Response, Status};

use crate::election::ElectionManager;
use crate::master::job::{JobId, ShardStatus};
use crate::master::store::JobStore;
use crate::proto::cluster_service_server::ClusterService;
use crate::proto::{
    GetCurrentMasterRequest, GetCurrentMasterResponse, MasterAnnouncement,
    MasterAnnouncementResponse, NodeStatsRequest, NodeStatsResponse, RegisterWorkerRequest,
    RegisterWorkerResponse, ReportScoreRequest, ReportScoreResponse, ReportShardStatusRequest,
    ReportShardStatusResponse, VoteRequest, VoteResponse,
};
use crate::registry::{NodeRegistry, PeerRole};

pub struct ClusterServiceImpl {
    advertise_addr: String,
    election: Arc<ElectionManager>,
    registry: Arc<RwLock<NodeRegistry>>,
    store: Arc<RwLock<JobStore>>,
    latest_score: watch::Receiver<f64>,
}

impl ClusterServiceImpl {
    pub fn new(
        advertise_addr: String,
        election: Arc<ElectionManager>,
        registry: Arc<RwLock<NodeRegistry>>,
        store: Arc<RwLock<JobStore>>,
        latest_score: watch::Receiver<f64>,
    ) -> Self {
        Self {
            advertise_addr,
            election,
            registry,
            store,
            latest_score,
        }
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterServiceImpl {
    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        if req.address.is_empty() {
            return Err(Status::invalid_argument("worker address required"));
        }

        self.registry
            .write()
            .await
            .register(&req.address, PeerRole::Worker);

        Ok(Response::new(RegisterWorkerResponse {
            accepted: true,
            master_address: self.election.current_master().await.unwrap_or_default(),
        }))
    }

    async fn report_score(
        &self,
        request: Request<ReportScoreRequest>,
    ) -> Result<Response<ReportScoreResponse>, Status> {
        let req = request.into_inner();
        let Some(score) = req.score else {
            return Err(Status::invalid_argument("score breakdown required"));
        };

        self.registry
            .write()
            .await
            .record_score(&req.address, score.score);

        Ok(Response::new(ReportScoreResponse { accepted: true }))
    }

    async fn report_shard_status(
        &self,
        request: Request<ReportShardStatusRequest>,
    ) -> Result<Response<ReportShardStatusResponse>, Status> {
        let req = request.into_inner();

        let id = JobId::parse(&req.job_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let status: ShardStatus = req
            .status
            .parse()
            .map_err(|e: String| Status::invalid_argument(e))?;

        self.registry.write().await.touch(&req.worker_address);
        let applied = self.store.write().await.apply_shard_report(
            &id,
            req.shard_index,
            req.attempt,
            status,
            &req.worker_address,
        );

        tracing::debug!(
            job_id = %id,
            shard = req.shard_index,
            attempt = req.attempt,
            status = %req.status,
            applied,
            "Shard report"
        );

        // Duplicate or superseded reports are acknowledged all the same.
        Ok(Response::new(ReportShardStatusResponse { accepted: true }))
    }

    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(candidate = %req.candidate_address, term = req.term, "Received vote request");

        let election = self.election.clone();
        let result = AssertUnwindSafe(async {
            election
                .handle_vote_request(req.term, &req.candidate_address)
                .await
        })
        .catch_unwind()
        .await;

        match result {
            Ok((granted, term)) => Ok(Response::new(VoteResponse {
                term,
                vote_granted: granted,
                voter_address: self.advertise_addr.clone(),
            })),
            Err(_) => {
                tracing::error!("Panic in RequestVote handler");
                Err(Status::internal("Internal error in RequestVote handler"))
            }
        }
    }

    async fn announce_master(
        &self,
        request: Request<MasterAnnouncement>,
    ) -> Result<Response<MasterAnnouncementResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(master = %req.master_address, term = req.term, "Received master announcement");

        let election = self.election.clone();
        let master_address = req.master_address.clone();
        let result = AssertUnwindSafe(async {
            election
                .handle_announcement(req.term, &master_address)
                .await
        })
        .catch_unwind()
        .await;

        let (acknowledged, term) = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("Panic in AnnounceMaster handler");
                return Err(Status::internal("Internal error in AnnounceMaster handler"));
            }
        };

        if acknowledged {
            self.registry
                .write()
                .await
                .register(&req.master_address, PeerRole::Master);
        }

        Ok(Response::new(MasterAnnouncementResponse {
            acknowledged,
            term,
        }))
    }

    async fn get_current_master(
        &self,
        _request: Request<GetCurrentMasterRequest>,
    ) -> Result<Response<GetCurrentMasterResponse>, Status> {
        let master = self.election.current_master().await;
        Ok(Response::new(GetCurrentMasterResponse {
            known: master.is_some(),
            master_address: master.unwrap_or_default(),
            term: self.election.current_term().await,
        }))
    }

    async fn get_node_stats(
        &self,
        _request: Request<NodeStatsRequest>,
    ) -> Result<Response<NodeStatsResponse>, Status> {
        let state = self.election.state();
        let (role, term, master) = {
            let state = state.read().await;
            (
                state.role.to_string(),
                state.current_term,
                state.master_address.clone().unwrap_or_default(),
            )
        };

        Ok(Response::new(NodeStatsResponse {
            address: self.advertise_addr.clone(),
            role,
            term,
            active_jobs: self.store.read().await.active_count() as u32,
            score: *self.latest_score.borrow(),
            master_address: master,
        }))
    }
}
