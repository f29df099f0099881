use vidshard::election::state::AnnouncementOutcome;
use vidshard::election::{ElectionRole, ElectionState};

const A: &str = "10.0.0.1:50051";
const B: &str = "10.0.0.2:50052";
const C: &str = "10.0.0.3:50053";

#[test]
fn test_full_election_round() {
    // B times out waiting for the master and becomes candidate.
    let mut b = ElectionState::new(Some(A.to_string()));
    b.become_candidate(B);
    assert_eq!(b.current_term, 1);

    // C grants its vote for term 1.
    let mut c = ElectionState::new(Some(A.to_string()));
    let (granted, term) = c.handle_vote_request(b.current_term, B);
    assert!(granted);
    assert_eq!(term, 1);

    // Two votes of three nodes is a majority; B announces.
    b.votes_received += 1;
    assert!(b.votes_received >= ElectionState::majority(2));
    b.become_master(B);

    let outcome = c.handle_announcement(b.current_term, B, C);
    assert_eq!(outcome, AnnouncementOutcome::Adopted { demoted: false });
    assert_eq!(c.master_address.as_deref(), Some(B));
    assert_eq!(c.role, ElectionRole::Follower);
}

#[test]
fn test_no_double_vote_in_one_term() {
    let mut voter = ElectionState::new(None);

    let (granted_b, _) = voter.handle_vote_request(1, B);
    let (granted_c, _) = voter.handle_vote_request(1, C);

    // Exactly one of two same-term candidates gets the vote.
    assert!(granted_b);
    assert!(!granted_c);
}

#[test]
fn test_split_brain_resolved_by_higher_term() {
    // Both B and C believe they are master, B in term 2, C in term 5.
    let mut b = ElectionState::new(None);
    b.become_follower(1);
    b.become_candidate(B);
    b.become_master(B);
    assert_eq!(b.current_term, 2);

    let mut c = ElectionState::new(None);
    c.become_follower(4);
    c.become_candidate(C);
    c.become_master(C);
    assert_eq!(c.current_term, 5);

    // C's announcement reaches B: higher term wins, B demotes.
    let outcome = b.handle_announcement(c.current_term, C, B);
    assert_eq!(outcome, AnnouncementOutcome::Adopted { demoted: true });
    assert_eq!(b.role, ElectionRole::Follower);
    assert_eq!(b.current_term, 5);
    assert_eq!(b.master_address.as_deref(), Some(C));

    // B's stale announcement reaches C: rejected, C stays master.
    let outcome = c.handle_announcement(2, B, C);
    assert_eq!(outcome, AnnouncementOutcome::RejectedStaleTerm);
    assert!(c.is_master());
}

#[test]
fn test_vote_for_higher_term_demotes_master() {
    let mut master = ElectionState::new(None);
    master.become_candidate(A);
    master.become_master(A);
    assert!(master.is_master());

    // A vote request from a future term means this node's reign is over.
    let (granted, term) = master.handle_vote_request(3, B);
    assert!(granted);
    assert_eq!(term, 3);
    assert_eq!(master.role, ElectionRole::Follower);
}

#[test]
fn test_majority_never_met_stays_follower() {
    // Candidate in a 5-node cluster hears from nobody: only the self-vote.
    let mut candidate = ElectionState::new(None);
    candidate.become_candidate(A);

    assert!(candidate.votes_received < ElectionState::majority(4));
    // The caller falls back to follower in the same term and retries later.
    let term = candidate.current_term;
    candidate.become_follower(term);
    assert_eq!(candidate.role, ElectionRole::Follower);
    assert_eq!(candidate.current_term, term);
}

#[test]
fn test_terms_monotonic_across_rounds() {
    let mut state = ElectionState::new(None);
    let mut last_term = state.current_term;

    for _ in 0..5 {
        state.become_candidate(A);
        assert!(state.current_term > last_term);
        last_term = state.current_term;
        state.become_follower(state.current_term);
    }
}

#[test]
fn test_equal_term_dual_masters_converge() {
    // Pathological case: two masters in the same term. Each one's
    // announcement demotes the other, so at most one claimant survives a
    // full exchange.
    let mut b = ElectionState::new(None);
    b.become_candidate(B);
    b.become_master(B);

    let mut c = ElectionState::new(None);
    c.become_candidate(C);
    c.become_master(C);

    assert_eq!(b.current_term, c.current_term);

    let outcome = b.handle_announcement(c.current_term, C, B);
    assert_eq!(outcome, AnnouncementOutcome::Adopted { demoted: true });
    assert!(!b.is_master());
}
