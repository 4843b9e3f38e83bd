//! Load-shedding feedback for the frame scheduler.
//!
//! The controller watches how much of each tick the scheduler spends
//! asleep. When the trailing average collapses, the mixer is not keeping
//! up, so the minimum audibility threshold climbs and quiet distant
//! sources stop being mixed. When slack returns the threshold retreats,
//! gently.

use log::debug;
use mixer_core::{BUFFER_SEND_INTERVAL_USECS, LOUDNESS_TO_DISTANCE_RATIO};

/// Window of the trailing sleep-ratio average, in frames.
pub const TRAILING_AVERAGE_FRAMES: u32 = 100;

/// Sleeping less than this fraction of the frame means we're struggling.
const STRUGGLE_TRIGGER_SLEEP_RATIO: f32 = 0.10;

/// Sleeping at least this fraction again means we've recovered.
const BACK_OFF_TRIGGER_SLEEP_RATIO: f32 = 0.20;

const RATIO_BACK_OFF: f32 = 0.02;

#[derive(Debug)]
pub struct ThrottleController {
    trailing_sleep_ratio: f32,
    performance_throttling_ratio: f32,
    frames_since_event: u32,
    min_audibility_threshold: f32,
}

impl Default for ThrottleController {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleController {
    pub fn new() -> Self {
        Self {
            trailing_sleep_ratio: 0.0,
            performance_throttling_ratio: 0.0,
            frames_since_event: 0,
            min_audibility_threshold: LOUDNESS_TO_DISTANCE_RATIO / 2.0,
        }
    }

    /// Feed one tick's realized sleep. At most one threshold adjustment
    /// happens per trailing window, so a single slow frame cannot whip
    /// the threshold around.
    pub fn record_sleep(&mut self, sleep_usecs: u64) {
        let current_frame_ratio = 1.0 / TRAILING_AVERAGE_FRAMES as f32;
        let previous_frames_ratio = 1.0 - current_frame_ratio;

        self.trailing_sleep_ratio = previous_frames_ratio * self.trailing_sleep_ratio
            + (sleep_usecs as f32 * current_frame_ratio) / BUFFER_SEND_INTERVAL_USECS as f32;

        self.frames_since_event += 1;
        if self.frames_since_event < TRAILING_AVERAGE_FRAMES {
            return;
        }

        let last_ratio = self.performance_throttling_ratio;
        let mut changed = false;

        if self.trailing_sleep_ratio <= STRUGGLE_TRIGGER_SLEEP_RATIO {
            // Struggling: raise the bar to shed some load.
            self.performance_throttling_ratio += 0.5 * (1.0 - self.performance_throttling_ratio);
            debug!(
                "mixer struggling, sleeping {:.1}% of frame time; throttle {} -> {}",
                self.trailing_sleep_ratio * 100.0,
                last_ratio,
                self.performance_throttling_ratio
            );
            changed = true;
        } else if self.trailing_sleep_ratio >= BACK_OFF_TRIGGER_SLEEP_RATIO
            && self.performance_throttling_ratio > 0.0
        {
            self.performance_throttling_ratio =
                (self.performance_throttling_ratio - RATIO_BACK_OFF).max(0.0);
            debug!(
                "mixer recovering, sleeping {:.1}% of frame time; throttle {} -> {}",
                self.trailing_sleep_ratio * 100.0,
                last_ratio,
                self.performance_throttling_ratio
            );
            changed = true;
        }

        if changed {
            self.min_audibility_threshold =
                LOUDNESS_TO_DISTANCE_RATIO / (2.0 * (1.0 - self.performance_throttling_ratio));
            self.frames_since_event = 0;
            debug!(
                "minimum audibility to be mixed is now {}",
                self.min_audibility_threshold
            );
        }
    }

    pub fn min_audibility_threshold(&self) -> f32 {
        self.min_audibility_threshold
    }

    pub fn performance_throttling_ratio(&self) -> f32 {
        self.performance_throttling_ratio
    }

    pub fn trailing_sleep_ratio(&self) -> f32 {
        self.trailing_sleep_ratio
    }
}
