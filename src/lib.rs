//! soundstage: a per-listener spatial audio mixer for virtual worlds.
//!
//! Clients stream short positional audio frames over UDP; every 10 ms
//! the mixer produces one personalized stereo frame per listener, with
//! every other audible source attenuated and panned from that listener's
//! point of view, and returns it as a datagram. A sleep-ratio feedback
//! loop raises the audibility bar when mixing stops fitting in the tick.

pub mod ingest;
pub mod scheduler;
pub mod stats;
pub mod throttle;

use mixer_core::Error;
use settings_manager::Settings;
use spatial::ZonePair;

/// Startup configuration threaded into the scheduler.
#[derive(Debug, Clone, Default)]
pub struct MixerConfig {
    /// Hold back the first frame of a new stream one extra tick.
    pub dynamic_jitter_buffers: bool,
    /// Optional unattenuated zone pair.
    pub zones: Option<ZonePair>,
}

impl MixerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, Error> {
        let zones = settings
            .unattenuated_zone_floats()?
            .map(ZonePair::from_floats);
        Ok(Self {
            dynamic_jitter_buffers: settings.dynamic_jitter_buffers,
            zones,
        })
    }
}
