//! Mixing statistics, rolled up into the periodic stream-stats datagram.

use network::protocol::StreamStats;

use crate::throttle::ThrottleController;

/// Counters accumulated by the scheduler. The per-window counters reset
/// every time a stream-stats datagram goes out; `bad_packets` and
/// `overrun_ticks` run for the life of the process.
#[derive(Debug, Default)]
pub struct MixStatistics {
    pub sum_listeners: u64,
    pub sum_mixes: u64,
    pub num_stat_frames: u64,
    pub bad_packets: u64,
    pub overrun_ticks: u64,
}

impl MixStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, throttle: &ThrottleController) -> StreamStats {
        let average_listeners_per_frame = if self.num_stat_frames > 0 {
            self.sum_listeners as f32 / self.num_stat_frames as f32
        } else {
            0.0
        };
        let average_mixes_per_listener = if self.sum_listeners > 0 {
            self.sum_mixes as f32 / self.sum_listeners as f32
        } else {
            0.0
        };
        StreamStats {
            trailing_sleep_percentage: throttle.trailing_sleep_ratio() * 100.0,
            performance_throttling_ratio: throttle.performance_throttling_ratio(),
            average_listeners_per_frame,
            average_mixes_per_listener,
            overrun_ticks: self.overrun_ticks,
            bad_packets: self.bad_packets,
        }
    }

    /// Reset the windowed counters after a stats emission.
    pub fn reset_window(&mut self) {
        self.sum_listeners = 0;
        self.sum_mixes = 0;
        self.num_stat_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_guard_against_empty_windows() {
        let stats = MixStatistics::new();
        let throttle = ThrottleController::new();
        let snapshot = stats.snapshot(&throttle);
        assert_eq!(snapshot.average_listeners_per_frame, 0.0);
        assert_eq!(snapshot.average_mixes_per_listener, 0.0);
    }

    #[test]
    fn snapshot_computes_per_window_averages() {
        let mut stats = MixStatistics::new();
        stats.num_stat_frames = 100;
        stats.sum_listeners = 200;
        stats.sum_mixes = 600;
        stats.bad_packets = 3;

        let throttle = ThrottleController::new();
        let snapshot = stats.snapshot(&throttle);
        assert_eq!(snapshot.average_listeners_per_frame, 2.0);
        assert_eq!(snapshot.average_mixes_per_listener, 3.0);
        assert_eq!(snapshot.bad_packets, 3);

        stats.reset_window();
        assert_eq!(stats.num_stat_frames, 0);
        // Lifetime counters survive the window reset.
        assert_eq!(stats.bad_packets, 3);
    }
}
