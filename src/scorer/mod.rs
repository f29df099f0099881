//! Per-node resource sampler. Produces a scalar score from load average,
//! I/O wait, network throughput and memory pressure; lower means more
//! capacity. Only the ordering of scores is meaningful.

use std::time::Instant;

use sysinfo::{Networks, System};

use crate::config::ScoreWeights;

/// Normalization ceiling for network throughput: 1 Gbit/s in bytes.
const REFERENCE_NET_BYTES_PER_SEC: f64 = 125_000_000.0;

/// Score used for nodes whose reports have gone stale.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// One sample of local resource pressure. Each term is clamped to [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct ScoreSample {
    pub score: f64,
    pub load_norm: f64,
    pub io_wait: f64,
    pub net_util: f64,
    pub mem_util: f64,
}

/// Combine normalized terms into the scalar score.
pub fn blend(weights: &ScoreWeights, load: f64, io_wait: f64, net: f64, mem: f64) -> f64 {
    weights.load * load.clamp(0.0, 1.0)
        + weights.io_wait * io_wait.clamp(0.0, 1.0)
        + weights.net * net.clamp(0.0, 1.0)
        + weights.mem * mem.clamp(0.0, 1.0)
}

pub struct ResourceScorer {
    weights: ScoreWeights,
    system: System,
    networks: Networks,
    cores: usize,
    last_sample_at: Instant,
    last_cpu_counters: Option<CpuCounters>,
}

impl ResourceScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        let cores = system.cpus().len().max(1);

        Self {
            weights,
            system,
            networks: Networks::new_with_refreshed_list(),
            cores,
            last_sample_at: Instant::now(),
            last_cpu_counters: read_cpu_counters(),
        }
    }

    /// Take a fresh sample. Network utilization and iowait are computed as
    /// deltas since the previous call, so the first sample reports them as 0.
    pub fn sample(&mut self) -> ScoreSample {
        self.system.refresh_memory();
        self.networks.refresh();

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample_at).as_secs_f64();
        self.last_sample_at = now;

        let load_norm = System::load_average().one / self.cores as f64;

        let mem_util = if self.system.total_memory() > 0 {
            self.system.used_memory() as f64 / self.system.total_memory() as f64
        } else {
            0.0
        };

        let net_util = if elapsed > 0.0 {
            let bytes: u64 = self
                .networks
                .iter()
                .map(|(_, data)| data.received() + data.transmitted())
                .sum();
            (bytes as f64 / elapsed) / REFERENCE_NET_BYTES_PER_SEC
        } else {
            0.0
        };

        let io_wait = {
            let current = read_cpu_counters();
            let fraction = match (&self.last_cpu_counters, &current) {
                (Some(prev), Some(cur)) => cur.io_wait_fraction_since(prev),
                _ => 0.0,
            };
            self.last_cpu_counters = current;
            fraction
        };

        let score = blend(&self.weights, load_norm, io_wait, net_util, mem_util);

        ScoreSample {
            score,
            load_norm: load_norm.clamp(0.0, 1.0),
            io_wait: io_wait.clamp(0.0, 1.0),
            net_util: net_util.clamp(0.0, 1.0),
            mem_util: mem_util.clamp(0.0, 1.0),
        }
    }
}

/// Aggregate CPU jiffies from /proc/stat. iowait is not exposed by the
/// sysinfo API, so it is read directly on Linux and reported as 0 elsewhere.
#[derive(Debug, Clone, Copy)]
struct CpuCounters {
    io_wait: u64,
    total: u64,
}

impl CpuCounters {
    fn io_wait_fraction_since(&self, prev: &CpuCounters) -> f64 {
        let total = self.total.saturating_sub(prev.total);
        if total == 0 {
            return 0.0;
        }
        self.io_wait.saturating_sub(prev.io_wait) as f64 / total as f64
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_counters() -> Option<CpuCounters> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    Some(CpuCounters {
        io_wait: fields[4],
        total: fields.iter().sum(),
    })
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_counters() -> Option<CpuCounters> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_weighting() {
        let weights = ScoreWeights::default();
        assert!((blend(&weights, 0.0, 0.0, 0.0, 0.0)).abs() < f64::EPSILON);
        assert!((blend(&weights, 1.0, 1.0, 1.0, 1.0) - 1.0).abs() < 1e-9);
        // Load carries the largest weight.
        assert!(blend(&weights, 1.0, 0.0, 0.0, 0.0) > blend(&weights, 0.0, 1.0, 0.0, 0.0));
    }

    #[test]
    fn test_blend_clamps_inputs() {
        let weights = ScoreWeights::default();
        let score = blend(&weights, 50.0, -3.0, 2.0, 0.5);
        assert!(score <= 1.0);
        assert!(score >= 0.0);
    }

    #[test]
    fn test_io_wait_fraction() {
        let prev = CpuCounters {
            io_wait: 100,
            total: 1000,
        };
        let cur = CpuCounters {
            io_wait: 150,
            total: 2000,
        };
        assert!((cur.io_wait_fraction_since(&prev) - 0.05).abs() < 1e-9);
        // No elapsed jiffies is not a division by zero.
        assert_eq!(cur.io_wait_fraction_since(&cur), 0.0);
    }

    #[test]
    fn test_sampler_produces_bounded_terms() {
        let mut scorer = ResourceScorer::new(ScoreWeights::default());
        let sample = scorer.sample();
        assert!(sample.mem_util >= 0.0 && sample.mem_util <= 1.0);
        assert!(sample.io_wait >= 0.0 && sample.io_wait <= 1.0);
        assert!(sample.net_util >= 0.0 && sample.net_util <= 1.0);
    }
}
