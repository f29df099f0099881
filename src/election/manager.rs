//! Election driver: watches for master silence, runs candidate rounds, and
//! announces mastership. Runs as one event loop per node.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};

use crate::config::NodeConfig;
use crate::election::state::{AnnouncementOutcome, ElectionRole, ElectionState};
use crate::election::timer::random_election_timeout;
use crate::grpc::ClientPool;
use crate::proto::{MasterAnnouncement, VoteRequest};

const VOTE_RPC_TIMEOUT: Duration = Duration::from_secs(1);
const ANNOUNCE_RPC_TIMEOUT: Duration = Duration::from_secs(2);
/// How often an acting master re-announces itself.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// Messages into the election event loop.
#[derive(Debug)]
pub enum ElectionMessage {
    /// The master responded to a probe or sent traffic; reset the silence clock.
    MasterSeen,
    /// Force an election round (used when a probe hard-fails).
    TriggerElection,
}

/// Events the rest of the node reacts to.
#[derive(Debug, Clone)]
pub enum ElectionEvent {
    /// This node won the given term and is now master.
    WonTerm(u64),
    /// Another node announced itself master.
    NewMaster { address: String, term: u64 },
    /// This node was demoted by a higher-term announcement.
    Demoted { new_master: String, term: u64 },
}

pub struct ElectionManager {
    config: NodeConfig,
    state: Arc<RwLock<ElectionState>>,
    clients: ClientPool,
    message_tx: mpsc::Sender<ElectionMessage>,
    events_tx: mpsc::Sender<ElectionEvent>,
    last_master_contact: Arc<RwLock<Instant>>,
}

impl ElectionManager {
    pub fn new(
        config: NodeConfig,
        clients: ClientPool,
        events_tx: mpsc::Sender<ElectionEvent>,
    ) -> (Self, mpsc::Receiver<ElectionMessage>) {
        let (message_tx, message_rx) = mpsc::channel(64);
        let initial_master = config.master_addr.clone();

        let manager = Self {
            config,
            state: Arc::new(RwLock::new(ElectionState::new(initial_master))),
            clients,
            message_tx,
            events_tx,
            last_master_contact: Arc::new(RwLock::new(Instant::now())),
        };

        (manager, message_rx)
    }

    pub fn state(&self) -> Arc<RwLock<ElectionState>> {
        self.state.clone()
    }

    pub fn message_sender(&self) -> mpsc::Sender<ElectionMessage> {
        self.message_tx.clone()
    }

    pub async fn is_master(&self) -> bool {
        self.state.read().await.is_master()
    }

    pub async fn current_master(&self) -> Option<String> {
        self.state.read().await.master_address.clone()
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    /// Adopt the configured role at startup. The configured master asserts
    /// itself in term 0 and announces; workers wait to hear from it.
    pub async fn assume_initial_role(&self) {
        if self.config.role == crate::config::NodeRole::Master {
            let mut state = self.state.write().await;
            state.become_master(&self.config.advertise_addr);
            drop(state);
            self.broadcast_announcement().await;
        }
    }

    /// Main event loop. Followers arm a silence timer; the master re-announces
    /// on a fixed cadence.
    pub async fn run(&self, mut message_rx: mpsc::Receiver<ElectionMessage>) {
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                Some(msg) = message_rx.recv() => {
                    match msg {
                        ElectionMessage::MasterSeen => {
                            *self.last_master_contact.write().await = Instant::now();
                        }
                        ElectionMessage::TriggerElection => {
                            self.run_election_round().await;
                        }
                    }
                }

                // Master silence check (followers and candidates).
                _ = tokio::time::sleep(election_timeout), if role != ElectionRole::Master => {
                    let silent_for = self.last_master_contact.read().await.elapsed();
                    if silent_for >= self.config.master_silence {
                        tracing::info!(
                            silent_ms = silent_for.as_millis() as u64,
                            "Master silent past threshold, starting election"
                        );
                        self.run_election_round().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                // Periodic self-announcement (master only).
                _ = tokio::time::sleep(ANNOUNCE_INTERVAL), if role == ElectionRole::Master => {
                    self.broadcast_announcement().await;
                }
            }
        }
    }

    /// One candidate round: bump the term, vote for self, fan out vote
    /// requests, and either win (majority) or fall back to follower.
    async fn run_election_round(&self) {
        let (term, majority) = {
            let mut state = self.state.write().await;
            if state.role == ElectionRole::Master {
                return;
            }
            state.become_candidate(&self.config.advertise_addr);
            (
                state.current_term,
                ElectionState::majority(self.config.peers.len()),
            )
        };

        tracing::info!(term, majority, "Starting election");

        let request = VoteRequest {
            term,
            candidate_address: self.config.advertise_addr.clone(),
        };

        let mut votes: usize = 1; // Self-vote
        for peer in &self.config.peers {
            match self.request_vote_from(peer, request.clone()).await {
                Some(response) => {
                    if response.term > term {
                        tracing::info!(
                            peer = %peer,
                            their_term = response.term,
                            "Peer has a higher term, standing down"
                        );
                        self.state.write().await.become_follower(response.term);
                        return;
                    }
                    if response.vote_granted {
                        votes += 1;
                        tracing::debug!(peer = %peer, votes, "Vote granted");
                    }
                }
                None => {
                    tracing::warn!(peer = %peer, "Vote request failed or timed out");
                }
            }
        }

        let mut state = self.state.write().await;
        if state.role != ElectionRole::Candidate || state.current_term != term {
            // A concurrent announcement resolved this round already.
            return;
        }
        state.votes_received = votes;

        if votes >= majority {
            state.become_master(&self.config.advertise_addr);
            drop(state);
            tracing::info!(term, votes, "Won election, announcing mastership");
            self.broadcast_announcement().await;
            let _ = self.events_tx.send(ElectionEvent::WonTerm(term)).await;
        } else {
            state.become_follower(term);
            drop(state);
            tracing::info!(term, votes, needed = majority, "Election failed, staying follower");
        }
    }

    async fn request_vote_from(
        &self,
        peer: &str,
        request: VoteRequest,
    ) -> Option<crate::proto::VoteResponse> {
        let mut client = self.clients.cluster(peer).await.ok()?;
        match timeout(VOTE_RPC_TIMEOUT, client.request_vote(request)).await {
            Ok(Ok(response)) => Some(response.into_inner()),
            Ok(Err(_)) | Err(_) => {
                self.clients.evict(peer).await;
                None
            }
        }
    }

    /// Send `AnnounceMaster` to every peer. Failures are logged and skipped;
    /// the next announcement cycle retries.
    pub async fn broadcast_announcement(&self) {
        let (term, master) = {
            let state = self.state.read().await;
            if !state.is_master() {
                return;
            }
            (state.current_term, self.config.advertise_addr.clone())
        };

        let announcement = MasterAnnouncement {
            term,
            master_address: master,
        };

        for peer in &self.config.peers {
            let Ok(mut client) = self.clients.cluster(peer).await else {
                continue;
            };
            match timeout(
                ANNOUNCE_RPC_TIMEOUT,
                client.announce_master(announcement.clone()),
            )
            .await
            {
                Ok(Ok(response)) => {
                    let response = response.into_inner();
                    if !response.acknowledged && response.term > term {
                        tracing::info!(
                            peer = %peer,
                            their_term = response.term,
                            "Announcement rejected by higher term, demoting"
                        );
                        self.state.write().await.become_follower(response.term);
                        return;
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer, error = %e, "Announcement failed");
                    self.clients.evict(peer).await;
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, "Announcement timed out");
                    self.clients.evict(peer).await;
                }
            }
        }
    }

    /// Handle an incoming vote request (called by the gRPC service).
    pub async fn handle_vote_request(&self, term: u64, candidate: &str) -> (bool, u64) {
        let (granted, current_term) = {
            let mut state = self.state.write().await;
            state.handle_vote_request(term, candidate)
        };
        if granted {
            // Granting a vote counts as hearing from a viable master-to-be.
            *self.last_master_contact.write().await = Instant::now();
        }
        (granted, current_term)
    }

    /// Handle an incoming master announcement (called by the gRPC service).
    /// Returns `(acknowledged, current_term)`.
    pub async fn handle_announcement(&self, term: u64, master: &str) -> (bool, u64) {
        let (outcome, current_term) = {
            let mut state = self.state.write().await;
            let outcome = state.handle_announcement(term, master, &self.config.advertise_addr);
            (outcome, state.current_term)
        };

        match outcome {
            AnnouncementOutcome::Adopted { demoted } => {
                *self.last_master_contact.write().await = Instant::now();
                let event = if demoted {
                    tracing::info!(master, term, "Demoted by announcement");
                    ElectionEvent::Demoted {
                        new_master: master.to_string(),
                        term,
                    }
                } else {
                    ElectionEvent::NewMaster {
                        address: master.to_string(),
                        term,
                    }
                };
                let _ = self.events_tx.send(event).await;
                (true, current_term)
            }
            AnnouncementOutcome::RejectedStaleTerm => (false, current_term),
        }
    }
}
