use std::time::Duration;

use vidshard::registry::{Liveness, NodeRegistry, PeerRole};

fn short_windows() -> NodeRegistry {
    // Compressed silence windows so liveness tests run fast.
    NodeRegistry::new(Duration::from_millis(60), Duration::from_millis(150))
}

#[test]
fn test_register_and_snapshot() {
    let mut registry = short_windows();
    registry.register("10.0.0.1:50051", PeerRole::Worker);
    registry.register("10.0.0.2:50052", PeerRole::Backup);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(registry.alive_workers().len(), 1);
}

#[test]
fn test_duplicate_registration_refreshes() {
    let mut registry = short_windows();
    registry.register("10.0.0.1:50051", PeerRole::Worker);

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(
        registry.liveness_of("10.0.0.1:50051"),
        Some(Liveness::Suspect)
    );

    registry.register("10.0.0.1:50051", PeerRole::Worker);
    assert_eq!(
        registry.liveness_of("10.0.0.1:50051"),
        Some(Liveness::Alive)
    );
}

#[test]
fn test_liveness_windows() {
    let mut registry = short_windows();
    registry.register("10.0.0.1:50051", PeerRole::Worker);
    assert_eq!(
        registry.liveness_of("10.0.0.1:50051"),
        Some(Liveness::Alive)
    );

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(
        registry.liveness_of("10.0.0.1:50051"),
        Some(Liveness::Suspect)
    );
    // Suspect nodes leave the eligible set.
    assert!(registry.alive_workers().is_empty());

    std::thread::sleep(Duration::from_millis(90));
    assert_eq!(registry.liveness_of("10.0.0.1:50051"), Some(Liveness::Dead));
}

#[test]
fn test_score_report_is_heartbeat() {
    let mut registry = short_windows();
    registry.register("10.0.0.1:50051", PeerRole::Worker);

    std::thread::sleep(Duration::from_millis(80));
    registry.record_score("10.0.0.1:50051", 0.4);

    assert_eq!(
        registry.liveness_of("10.0.0.1:50051"),
        Some(Liveness::Alive)
    );
    let record = registry.get("10.0.0.1:50051").unwrap();
    assert_eq!(record.score.unwrap().score, 0.4);
}

#[test]
fn test_score_last_writer_wins() {
    let mut registry = short_windows();
    registry.record_score("10.0.0.1:50051", 0.8);
    registry.record_score("10.0.0.1:50051", 0.2);

    let record = registry.get("10.0.0.1:50051").unwrap();
    assert_eq!(record.score.unwrap().score, 0.2);
}

#[test]
fn test_first_contact_registers_as_worker() {
    let mut registry = short_windows();
    registry.touch("10.0.0.9:50059");

    let record = registry.get("10.0.0.9:50059").unwrap();
    assert_eq!(record.role, PeerRole::Worker);
}

#[test]
fn test_in_flight_tracking_saturates() {
    let mut registry = short_windows();
    registry.register("10.0.0.1:50051", PeerRole::Worker);

    registry.shard_started("10.0.0.1:50051");
    registry.shard_started("10.0.0.1:50051");
    assert_eq!(registry.get("10.0.0.1:50051").unwrap().in_flight, 2);

    registry.shard_finished("10.0.0.1:50051");
    registry.shard_finished("10.0.0.1:50051");
    registry.shard_finished("10.0.0.1:50051");
    assert_eq!(registry.get("10.0.0.1:50051").unwrap().in_flight, 0);
}

#[test]
fn test_prune_drops_silent_peers() {
    let mut registry = short_windows();
    registry.register("10.0.0.1:50051", PeerRole::Worker);
    registry.register("10.0.0.2:50052", PeerRole::Worker);

    std::thread::sleep(Duration::from_millis(50));
    registry.touch("10.0.0.2:50052");

    let removed = registry.prune(Duration::from_millis(40));
    assert_eq!(removed, vec!["10.0.0.1:50051".to_string()]);
    assert_eq!(registry.len(), 1);
    assert!(registry.get("10.0.0.2:50052").is_some());
}
