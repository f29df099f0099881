//! Worker-side execution: receiving shard streams, transcoding them with the
//! media tool, serving processed shards back to the master, and acting as a
//! durable backup store for final artifacts.

pub mod backup;
pub mod engine;

pub use backup::BackupStore;
pub use engine::WorkerEngine;
