//! Election state machine. Terms are monotonic; a node acts as master only
//! while it holds the current term and has heard no higher one.

/// Role in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionRole {
    Follower,
    Candidate,
    Master,
}

impl std::fmt::Display for ElectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionRole::Follower => write!(f, "follower"),
            ElectionRole::Candidate => write!(f, "candidate"),
            ElectionRole::Master => write!(f, "master"),
        }
    }
}

/// Outcome of processing a master announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnouncementOutcome {
    /// Adopted the announced master (possibly demoting ourselves).
    Adopted { demoted: bool },
    /// Rejected: the announcement carried a stale term.
    RejectedStaleTerm,
}

#[derive(Debug)]
pub struct ElectionState {
    pub current_term: u64,
    /// Vote cast in the current term, if any. Held for the process lifetime.
    pub voted_for: Option<String>,
    pub role: ElectionRole,
    /// Address this node believes to be master.
    pub master_address: Option<String>,
    /// Votes received while candidate in the current term.
    pub votes_received: usize,
}

impl ElectionState {
    pub fn new(initial_master: Option<String>) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: ElectionRole::Follower,
            master_address: initial_master,
            votes_received: 0,
        }
    }

    /// Majority of a cluster with `peer_count` peers plus this node.
    pub fn majority(peer_count: usize) -> usize {
        (peer_count + 1) / 2 + 1
    }

    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.voted_for = None;
        }
        self.role = ElectionRole::Follower;
        self.current_term = term;
        self.votes_received = 0;
    }

    pub fn become_candidate(&mut self, self_address: &str) {
        self.role = ElectionRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self_address.to_string());
        self.votes_received = 1; // Vote for self
        self.master_address = None;
    }

    pub fn become_master(&mut self, self_address: &str) {
        self.role = ElectionRole::Master;
        self.master_address = Some(self_address.to_string());
    }

    /// Voting rule: grant iff we have not voted in this term (or voted for
    /// the same candidate) and the candidate's term is at least ours.
    /// A higher candidate term first moves us to follower in that term.
    pub fn handle_vote_request(&mut self, term: u64, candidate: &str) -> (bool, u64) {
        if term > self.current_term {
            self.become_follower(term);
        }

        if term < self.current_term {
            return (false, self.current_term);
        }

        let granted = match &self.voted_for {
            None => true,
            Some(prior) => prior == candidate,
        };

        if granted {
            self.voted_for = Some(candidate.to_string());
        }
        (granted, self.current_term)
    }

    /// Process an `AnnounceMaster`. Higher terms always win; equal terms are
    /// accepted from the declared master (the winner announcing to voters);
    /// lower terms are rejected so the announcer can demote itself.
    pub fn handle_announcement(&mut self, term: u64, master: &str, self_address: &str) -> AnnouncementOutcome {
        if term < self.current_term {
            return AnnouncementOutcome::RejectedStaleTerm;
        }

        let was_master = self.role == ElectionRole::Master && master != self_address;

        if term > self.current_term {
            self.become_follower(term);
        } else if self.role == ElectionRole::Candidate {
            self.become_follower(term);
        } else if was_master {
            // Same term, different claimant: the announcer won the vote we
            // did not; step down rather than split the cluster.
            self.role = ElectionRole::Follower;
            self.votes_received = 0;
        }

        self.master_address = Some(master.to_string());
        if master == self_address {
            self.role = ElectionRole::Master;
        }

        AnnouncementOutcome::Adopted { demoted: was_master }
    }

    pub fn is_master(&self) -> bool {
        self.role == ElectionRole::Master
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_follower() {
        let state = ElectionState::new(None);
        assert_eq!(state.role, ElectionRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn test_become_candidate() {
        let mut state = ElectionState::new(Some("10.0.0.1:50051".to_string()));
        state.become_candidate("10.0.0.2:50052");

        assert_eq!(state.role, ElectionRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("10.0.0.2:50052"));
        assert_eq!(state.votes_received, 1); // Self-vote
        assert_eq!(state.master_address, None);
    }

    #[test]
    fn test_single_vote_per_term() {
        let mut state = ElectionState::new(None);

        let (granted, term) = state.handle_vote_request(1, "10.0.0.2:50052");
        assert!(granted);
        assert_eq!(term, 1);

        // Second candidate in the same term is refused.
        let (granted, _) = state.handle_vote_request(1, "10.0.0.3:50053");
        assert!(!granted);

        // The same candidate asking again is granted (idempotent).
        let (granted, _) = state.handle_vote_request(1, "10.0.0.2:50052");
        assert!(granted);
    }

    #[test]
    fn test_stale_term_vote_rejected() {
        let mut state = ElectionState::new(None);
        state.become_follower(5);

        let (granted, term) = state.handle_vote_request(3, "10.0.0.2:50052");
        assert!(!granted);
        assert_eq!(term, 5);
    }

    #[test]
    fn test_higher_term_vote_resets_prior_vote() {
        let mut state = ElectionState::new(None);
        let (granted, _) = state.handle_vote_request(1, "10.0.0.2:50052");
        assert!(granted);

        // A new term clears voted_for, so a different candidate can win it.
        let (granted, term) = state.handle_vote_request(2, "10.0.0.3:50053");
        assert!(granted);
        assert_eq!(term, 2);
    }

    #[test]
    fn test_candidate_steps_down_on_announcement() {
        let mut state = ElectionState::new(None);
        state.become_candidate("10.0.0.2:50052");

        let outcome = state.handle_announcement(1, "10.0.0.3:50053", "10.0.0.2:50052");
        assert_eq!(outcome, AnnouncementOutcome::Adopted { demoted: false });
        assert_eq!(state.role, ElectionRole::Follower);
        assert_eq!(state.master_address.as_deref(), Some("10.0.0.3:50053"));
    }

    #[test]
    fn test_master_demotes_on_higher_term() {
        let mut state = ElectionState::new(None);
        state.become_candidate("10.0.0.2:50052");
        state.become_master("10.0.0.2:50052");
        assert!(state.is_master());

        let outcome = state.handle_announcement(7, "10.0.0.3:50053", "10.0.0.2:50052");
        assert_eq!(outcome, AnnouncementOutcome::Adopted { demoted: true });
        assert_eq!(state.role, ElectionRole::Follower);
        assert_eq!(state.current_term, 7);
    }

    #[test]
    fn test_master_rejects_stale_announcement() {
        let mut state = ElectionState::new(None);
        state.become_follower(9);
        state.become_candidate("10.0.0.2:50052");
        state.become_master("10.0.0.2:50052");

        let outcome = state.handle_announcement(4, "10.0.0.3:50053", "10.0.0.2:50052");
        assert_eq!(outcome, AnnouncementOutcome::RejectedStaleTerm);
        assert!(state.is_master());
        assert_eq!(state.current_term, 10);
    }

    #[test]
    fn test_own_announcement_keeps_mastership() {
        let mut state = ElectionState::new(None);
        state.become_candidate("10.0.0.2:50052");
        state.become_master("10.0.0.2:50052");

        let outcome = state.handle_announcement(1, "10.0.0.2:50052", "10.0.0.2:50052");
        assert_eq!(outcome, AnnouncementOutcome::Adopted { demoted: false });
        assert!(state.is_master());
    }

    #[test]
    fn test_majority_math() {
        assert_eq!(ElectionState::majority(0), 1); // solo cluster
        assert_eq!(ElectionState::majority(1), 2);
        assert_eq!(ElectionState::majority(2), 2);
        assert_eq!(ElectionState::majority(4), 3);
    }
}
