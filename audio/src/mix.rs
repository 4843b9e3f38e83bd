//! Saturating stereo accumulation and the per-listener mix walk.

use mixer_core::{PeerId, FRAME_SAMPLES, FRAME_SAMPLES_STEREO};
use spatial::{plan_mix, DelayedChannel, MixPlan, ZonePair};

use crate::registry::{PositionalStream, Registry, StreamRole};

/// One listener's stereo scratch frame for one tick. All accumulation
/// saturates at the i16 rails.
#[derive(Debug)]
pub struct MixFrame {
    samples: [i16; FRAME_SAMPLES_STEREO],
}

impl Default for MixFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl MixFrame {
    pub fn new() -> Self {
        Self {
            samples: [0; FRAME_SAMPLES_STEREO],
        }
    }

    pub fn clear(&mut self) {
        self.samples.fill(0);
    }

    pub fn samples(&self) -> &[i16; FRAME_SAMPLES_STEREO] {
        &self.samples
    }

    fn add(&mut self, index: usize, value: i16) {
        self.samples[index] = self.samples[index].saturating_add(value);
    }
}

/// Scale a sample by a coefficient in [0, 1]; the float-to-int cast
/// saturates at the rails.
fn scale(sample: i16, coefficient: f32) -> i16 {
    (sample as f32 * coefficient) as i16
}

/// Fold one source stream into the frame according to its plan.
pub fn accumulate(frame: &mut MixFrame, stream: &PositionalStream, plan: &MixPlan) {
    let attenuation = plan.attenuation;

    if plan.skip_spatial {
        if stream.stereo() {
            for (i, sample) in stream.next_output().iter().enumerate() {
                frame.add(i, scale(sample, attenuation));
            }
        } else {
            // Mono without spatial cues lands identically in both ears.
            for (j, sample) in stream.next_output().iter().enumerate() {
                let scaled = scale(sample, attenuation);
                frame.add(2 * j, scaled);
                frame.add(2 * j + 1, scaled);
            }
        }
        return;
    }

    let delay = plan.delay_samples as usize;
    let delayed_offset = match plan.delayed_channel {
        DelayedChannel::Left => 0,
        DelayedChannel::Right => 1,
    };
    let good_offset = 1 - delayed_offset;
    let weak = attenuation * plan.weak_ratio;

    for (j, sample) in stream.next_output().iter().enumerate() {
        frame.add(2 * j + good_offset, scale(sample, attenuation));

        // The weak ear hears the same sample `delay` frames later;
        // whatever shifts past the end of the frame is discarded.
        let delayed_index = j + delay;
        if delayed_index < FRAME_SAMPLES {
            frame.add(2 * delayed_index + delayed_offset, scale(sample, weak));
        }
    }

    if delay > 0 {
        // The first `delay` frames of the weak ear come from the samples
        // just before this tick's frame, so the delayed channel starts
        // mid-stream instead of from silence.
        for (k, sample) in stream.tail(delay).iter().enumerate() {
            frame.add(2 * k + delayed_offset, scale(sample, weak));
        }
    }
}

/// Produce the mix one listener hears this tick. Walks every ready
/// stream in registry order, plans it against the listener's pose and
/// accumulates the survivors. Returns the number of foreign sources
/// mixed in (loopback of the listener's own stream is not counted).
pub fn mix_for_listener(
    registry: &Registry,
    listener: PeerId,
    min_audibility_threshold: f32,
    zones: Option<&ZonePair>,
    frame: &mut MixFrame,
) -> u32 {
    frame.clear();

    let Some(pose) = registry.listener_pose(listener) else {
        return 0;
    };

    let mut mixes = 0;
    for (peer, client) in registry.iter_clients() {
        for (role, stream) in client.streams() {
            if !stream.ready() || stream.trailing_loudness() <= 0.0 {
                continue;
            }
            let is_self = *peer == listener && role == StreamRole::Microphone;
            if is_self && !stream.loopback() {
                continue;
            }

            let plan = plan_mix(
                &stream.voice(),
                &pose,
                is_self,
                min_audibility_threshold,
                zones,
            );
            if plan.drop {
                continue;
            }
            if !is_self {
                mixes += 1;
            }
            accumulate(frame, stream, &plan);
        }
    }
    mixes
}
