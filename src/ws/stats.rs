//! Resource statistics sampling for live sessions.
//!
//! Each session's sampler keeps its own rate state; CPU and network figures
//! are deltas against the previous 2-second sample.

use std::time::Instant;

use bollard::container::Stats;

use crate::websocket_models::{MemoryStats, NetworkStats, StatsPayload};

/// The numbers one engine stats snapshot reduces to.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub cpu_total: u64,
    pub system_total: u64,
    pub online_cpus: u64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub fn extract_sample(stats: &Stats) -> Sample {
    let (rx_bytes, tx_bytes) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), stats| {
                (rx + stats.rx_bytes, tx + stats.tx_bytes)
            })
        })
        .unwrap_or((0, 0));

    Sample {
        cpu_total: stats.cpu_stats.cpu_usage.total_usage,
        system_total: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1).max(1),
        memory_used: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        rx_bytes,
        tx_bytes,
    }
}

/// Per-session rate state across samples.
#[derive(Debug, Default)]
pub struct StatsTracker {
    previous: Option<(Sample, Instant)>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a new sample in and produces the stats frame. The first sample
    /// has nothing to delta against and reports zero rates.
    pub fn update(&mut self, state: &str, sample: Sample, now: Instant) -> StatsPayload {
        let (cpu_percent, rx_rate, tx_rate) = match self.previous {
            Some((prev, prev_at)) => {
                let cpu_delta = sample.cpu_total.saturating_sub(prev.cpu_total) as f64;
                let system_delta = sample.system_total.saturating_sub(prev.system_total) as f64;
                let cpu_percent = if system_delta > 0.0 {
                    (cpu_delta / system_delta * sample.online_cpus as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };

                let elapsed = now.duration_since(prev_at).as_secs_f64();
                let (rx_rate, tx_rate) = if elapsed > 0.0 {
                    (
                        (sample.rx_bytes.saturating_sub(prev.rx_bytes) as f64 / elapsed) as u64,
                        (sample.tx_bytes.saturating_sub(prev.tx_bytes) as f64 / elapsed) as u64,
                    )
                } else {
                    (0, 0)
                };
                (cpu_percent, rx_rate, tx_rate)
            }
            None => (0.0, 0, 0),
        };
        self.previous = Some((sample, now));

        let memory_percent = if sample.memory_limit > 0 {
            sample.memory_used as f64 / sample.memory_limit as f64 * 100.0
        } else {
            0.0
        };

        StatsPayload {
            state: state.to_string(),
            cpu_percent: Some((cpu_percent * 100.0).round() / 100.0),
            memory: Some(MemoryStats {
                used: sample.memory_used,
                limit: sample.memory_limit,
                percent: (memory_percent * 100.0).round() / 100.0,
            }),
            network: Some(NetworkStats {
                rx_bytes: sample.rx_bytes,
                tx_bytes: sample.tx_bytes,
                rx_rate,
                tx_rate,
            }),
        }
    }

    /// Drops rate state; called when the container instance changes.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(cpu: u64, system: u64, cpus: u64, rx: u64, tx: u64) -> Sample {
        Sample {
            cpu_total: cpu,
            system_total: system,
            online_cpus: cpus,
            memory_used: 512 * 1024 * 1024,
            memory_limit: 1024 * 1024 * 1024,
            rx_bytes: rx,
            tx_bytes: tx,
        }
    }

    #[test]
    fn test_first_sample_reports_zero_rates() {
        let mut tracker = StatsTracker::new();
        let frame = tracker.update("running", sample(1000, 10_000, 2, 100, 200), Instant::now());
        assert_eq!(frame.cpu_percent, Some(0.0));
        let network = frame.network.unwrap();
        assert_eq!(network.rx_rate, 0);
        assert_eq!(network.rx_bytes, 100);
    }

    #[test]
    fn test_cpu_percent_from_deltas() {
        let mut tracker = StatsTracker::new();
        let start = Instant::now();
        tracker.update("running", sample(1000, 10_000, 2, 0, 0), start);
        let frame = tracker.update(
            "running",
            sample(1500, 12_000, 2, 0, 0),
            start + Duration::from_secs(2),
        );
        // 500 / 2000 * 2 cpus * 100 = 50%
        assert_eq!(frame.cpu_percent, Some(50.0));
    }

    #[test]
    fn test_cpu_percent_clamped_to_100() {
        let mut tracker = StatsTracker::new();
        let start = Instant::now();
        tracker.update("running", sample(0, 1000, 8, 0, 0), start);
        let frame = tracker.update(
            "running",
            sample(5000, 2000, 8, 0, 0),
            start + Duration::from_secs(2),
        );
        assert_eq!(frame.cpu_percent, Some(100.0));
    }

    #[test]
    fn test_network_rates_per_second() {
        let mut tracker = StatsTracker::new();
        let start = Instant::now();
        tracker.update("running", sample(0, 0, 1, 1000, 500), start);
        let frame = tracker.update(
            "running",
            sample(0, 0, 1, 5000, 2500),
            start + Duration::from_secs(2),
        );
        let network = frame.network.unwrap();
        assert_eq!(network.rx_rate, 2000);
        assert_eq!(network.tx_rate, 1000);
        assert_eq!(network.rx_bytes, 5000);
    }

    #[test]
    fn test_memory_percent() {
        let mut tracker = StatsTracker::new();
        let frame = tracker.update("running", sample(0, 0, 1, 0, 0), Instant::now());
        let memory = frame.memory.unwrap();
        assert_eq!(memory.percent, 50.0);
        assert_eq!(memory.used, 512 * 1024 * 1024);
    }

    #[test]
    fn test_reset_clears_rate_state() {
        let mut tracker = StatsTracker::new();
        let start = Instant::now();
        tracker.update("running", sample(1000, 10_000, 1, 9000, 0), start);
        tracker.reset();
        let frame = tracker.update(
            "running",
            sample(2000, 20_000, 1, 10_000, 0),
            start + Duration::from_secs(2),
        );
        assert_eq!(frame.cpu_percent, Some(0.0));
        assert_eq!(frame.network.unwrap().rx_rate, 0);
    }
}
