//! Address-keyed view of cluster peers: role, liveness, last reported score
//! and in-flight shard assignments. A single writer mutates the registry;
//! readers (the scheduler in particular) work from cloned snapshots.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Last role a peer was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Master,
    Worker,
    Backup,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Master => write!(f, "master"),
            PeerRole::Worker => write!(f, "worker"),
            PeerRole::Backup => write!(f, "backup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreReport {
    pub score: f64,
    pub reported_at: Instant,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub address: String,
    pub role: PeerRole,
    pub registered_at: Instant,
    pub last_seen: Instant,
    pub score: Option<ScoreReport>,
    pub in_flight: u32,
}

impl NodeRecord {
    fn new(address: String, role: PeerRole) -> Self {
        let now = Instant::now();
        Self {
            address,
            role,
            registered_at: now,
            last_seen: now,
            score: None,
            in_flight: 0,
        }
    }

    pub fn liveness(&self, now: Instant, suspect: Duration, dead: Duration) -> Liveness {
        let silence = now.saturating_duration_since(self.last_seen);
        if silence >= dead {
            Liveness::Dead
        } else if silence >= suspect {
            Liveness::Suspect
        } else {
            Liveness::Alive
        }
    }
}

#[derive(Debug)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeRecord>,
    suspect_timeout: Duration,
    dead_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(suspect_timeout: Duration, dead_timeout: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            suspect_timeout,
            dead_timeout,
        }
    }

    /// Register a peer, or refresh its last-seen if already known.
    pub fn register(&mut self, address: &str, role: PeerRole) {
        match self.nodes.get_mut(address) {
            Some(record) => {
                record.role = role;
                record.last_seen = Instant::now();
            }
            None => {
                tracing::info!(address, role = %role, "Peer registered");
                self.nodes
                    .insert(address.to_string(), NodeRecord::new(address.to_string(), role));
            }
        }
    }

    /// Refresh a peer's last-seen. Unknown peers are registered as workers,
    /// matching first-contact semantics.
    pub fn touch(&mut self, address: &str) {
        match self.nodes.get_mut(address) {
            Some(record) => record.last_seen = Instant::now(),
            None => self.register(address, PeerRole::Worker),
        }
    }

    /// Record a score report. Last writer wins per reporting address; the
    /// report also counts as a heartbeat.
    pub fn record_score(&mut self, address: &str, score: f64) {
        self.touch(address);
        if let Some(record) = self.nodes.get_mut(address) {
            record.score = Some(ScoreReport {
                score,
                reported_at: Instant::now(),
            });
        }
    }

    pub fn shard_started(&mut self, address: &str) {
        if let Some(record) = self.nodes.get_mut(address) {
            record.in_flight += 1;
        }
    }

    pub fn shard_finished(&mut self, address: &str) {
        if let Some(record) = self.nodes.get_mut(address) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
    }

    pub fn get(&self, address: &str) -> Option<&NodeRecord> {
        self.nodes.get(address)
    }

    /// Cloned view for scheduling decisions.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.nodes.values().cloned().collect()
    }

    /// Workers currently considered alive.
    pub fn alive_workers(&self) -> Vec<NodeRecord> {
        let now = Instant::now();
        self.nodes
            .values()
            .filter(|n| n.role == PeerRole::Worker)
            .filter(|n| n.liveness(now, self.suspect_timeout, self.dead_timeout) == Liveness::Alive)
            .cloned()
            .collect()
    }

    pub fn liveness_of(&self, address: &str) -> Option<Liveness> {
        let now = Instant::now();
        self.nodes
            .get(address)
            .map(|n| n.liveness(now, self.suspect_timeout, self.dead_timeout))
    }

    /// Drop peers silent past the age-out window. Returns removed addresses.
    pub fn prune(&mut self, max_silence: Duration) -> Vec<String> {
        let now = Instant::now();
        let removed: Vec<String> = self
            .nodes
            .values()
            .filter(|n| now.saturating_duration_since(n.last_seen) >= max_silence)
            .map(|n| n.address.clone())
            .collect();
        for address in &removed {
            tracing::info!(address = %address, "Pruning silent peer");
            self.nodes.remove(address);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
