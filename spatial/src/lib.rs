//! Spatial audio math for soundstage.
//!
//! Maps a (source, listener) pose pair plus source properties to a
//! [`MixPlan`]: how loud the source is for this listener, which ear hears
//! it late, and by how many samples. The mix engine executes the plan
//! against sample buffers; nothing here touches audio data.
//!
//! Conventions: right-handed coordinates, forward is -Z, up is +Y.

use glam::{Quat, Vec3};
use mixer_core::SAMPLE_PHASE_DELAY_AT_90;

/// Distances below this are treated as coincident.
pub const DISTANCE_EPSILON: f32 = 1e-6;

const FORWARD: Vec3 = Vec3::new(0.0, 0.0, -1.0);

// Off-axis lobe: a source heard from directly behind keeps 20% of its
// amplitude, rising linearly with the delivery angle to unity in front.
const MAX_OFF_AXIS_ATTENUATION: f32 = 0.2;
const OFF_AXIS_ATTENUATION_STEP: f32 = (1.0 - MAX_OFF_AXIS_ATTENUATION) / 2.0;

// Distance curve: power law tuned so that doubling the distance scales
// amplitude by GEOMETRIC_AMPLITUDE_SCALAR^(log 2 / log DISTANCE_LOG_BASE).
const DISTANCE_SCALE: f32 = 2.5;
const GEOMETRIC_AMPLITUDE_SCALAR: f32 = 0.3;
const DISTANCE_LOG_BASE: f32 = 2.5;

/// Amplitude ratio of the weak (far-ear) channel for a source at 90
/// degrees off axis.
const PHASE_AMPLITUDE_RATIO_AT_90: f32 = 0.5;

/// Axis-aligned box described by its minimum corner and edge lengths.
/// Containment is half-open: the minimum faces are inside, the maximum
/// faces are not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisAlignedBox {
    corner: Vec3,
    dimensions: Vec3,
}

impl AxisAlignedBox {
    pub fn new(corner: Vec3, dimensions: Vec3) -> Self {
        Self { corner, dimensions }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        let max = self.corner + self.dimensions;
        point.x >= self.corner.x
            && point.y >= self.corner.y
            && point.z >= self.corner.z
            && point.x < max.x
            && point.y < max.y
            && point.z < max.z
    }

    pub fn center(&self) -> Vec3 {
        self.corner + self.dimensions * 0.5
    }
}

/// The configured pair of unattenuated zones. A source standing in the
/// source box is delivered at full amplitude to any listener standing in
/// the listener box, bypassing distance and off-axis attenuation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZonePair {
    pub source: AxisAlignedBox,
    pub listener: AxisAlignedBox,
}

impl ZonePair {
    /// Build from the flat 12-float tuple used in configuration:
    /// source corner, source dimensions, listener corner, listener
    /// dimensions.
    pub fn from_floats(values: [f32; 12]) -> Self {
        Self {
            source: AxisAlignedBox::new(
                Vec3::new(values[0], values[1], values[2]),
                Vec3::new(values[3], values[4], values[5]),
            ),
            listener: AxisAlignedBox::new(
                Vec3::new(values[6], values[7], values[8]),
                Vec3::new(values[9], values[10], values[11]),
            ),
        }
    }

    pub fn exempts(&self, source_position: Vec3, listener_position: Vec3) -> bool {
        self.source.contains(source_position) && self.listener.contains(listener_position)
    }
}

/// What kind of emitter a stream is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Emitter {
    /// An avatar's microphone: point source, unity gain.
    Microphone,
    /// A world-audio injector. `radius > 0` models a sphere that emits
    /// from its surface; `attenuation_ratio` is the injector's own gain.
    Injector { radius: f32, attenuation_ratio: f32 },
}

/// Spatial description of one audible stream for a single tick.
#[derive(Debug, Clone, Copy)]
pub struct SourceVoice {
    pub position: Vec3,
    pub orientation: Quat,
    pub trailing_loudness: f32,
    pub stereo: bool,
    pub emitter: Emitter,
}

/// The listener's head pose.
#[derive(Debug, Clone, Copy)]
pub struct ListenerPose {
    pub position: Vec3,
    pub orientation: Quat,
}

/// Which output channel receives the delayed, weaker signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedChannel {
    Left,
    Right,
}

/// Instructions for folding one source into one listener's mix.
#[derive(Debug, Clone, Copy)]
pub struct MixPlan {
    /// Overall amplitude coefficient, in [0, 1].
    pub attenuation: f32,
    /// Interaural delay applied to the weak channel, in samples.
    pub delay_samples: u32,
    /// Amplitude ratio of the weak channel relative to the near ear.
    pub weak_ratio: f32,
    pub delayed_channel: DelayedChannel,
    /// When set, the source is copied to both channels without panning
    /// or delay (stereo sources, zone-exempt sources, self loopback,
    /// enveloping spherical sources).
    pub skip_spatial: bool,
    /// When set, the source is inaudible this tick and contributes
    /// nothing.
    pub drop: bool,
}

impl MixPlan {
    fn unspatialized(attenuation: f32) -> Self {
        Self {
            attenuation,
            delay_samples: 0,
            weak_ratio: 1.0,
            delayed_channel: DelayedChannel::Left,
            skip_spatial: true,
            drop: false,
        }
    }

    fn dropped() -> Self {
        Self {
            drop: true,
            ..Self::unspatialized(0.0)
        }
    }
}

/// Compute the mix plan for one source heard by one listener.
///
/// `is_self` marks the listener's own microphone stream; it is passed
/// through at full scale so clients can monitor themselves when echo is
/// requested. Everything else runs the audibility gate first, then the
/// attenuation chain, then the interaural math.
pub fn plan_mix(
    source: &SourceVoice,
    listener: &ListenerPose,
    is_self: bool,
    min_audibility_threshold: f32,
    zones: Option<&ZonePair>,
) -> MixPlan {
    if is_self {
        return MixPlan::unspatialized(1.0);
    }

    let relative = source.position - listener.position;
    let distance = relative.length().max(DISTANCE_EPSILON);

    // Audibility gate: too quiet for this distance under the current
    // throttling threshold, so it does not get to be mixed in.
    if source.trailing_loudness / distance <= min_audibility_threshold {
        return MixPlan::dropped();
    }

    // Zone-exempt pairs and stereo content are delivered as-is.
    let exempt = zones.map_or(false, |z| z.exempts(source.position, listener.position));
    if exempt || source.stereo {
        return MixPlan::unspatialized(1.0);
    }

    let mut attenuation = 1.0;
    let mut radius = 0.0;

    if let Emitter::Injector {
        radius: r,
        attenuation_ratio,
    } = source.emitter
    {
        attenuation *= attenuation_ratio;
        radius = r;
    }

    let mut distance_squared = relative.length_squared();

    if radius > 0.0 {
        if distance_squared <= radius * radius {
            // The listener stands inside the emitting sphere; the sound
            // envelops them with no distance falloff and no bearing.
            return MixPlan::unspatialized(attenuation);
        }
        // Attenuate from the nearest point on the sphere's surface
        // rather than its center.
        distance_squared -= radius * radius;
    } else {
        attenuation *= off_axis_coefficient(source, relative);
    }

    attenuation *= distance_coefficient(distance_squared);

    let (delay_samples, weak_ratio, delayed_channel) = interaural(listener, relative);

    MixPlan {
        attenuation,
        delay_samples,
        weak_ratio,
        delayed_channel,
        skip_spatial: false,
        drop: false,
    }
}

/// Directional lobe of a point source. The angle of delivery is measured
/// in the source's frame between its forward axis and the line to the
/// listener; a listener dead ahead hears full amplitude, one directly
/// behind hears `MAX_OFF_AXIS_ATTENUATION`.
fn off_axis_coefficient(source: &SourceVoice, relative: Vec3) -> f32 {
    let in_source_frame = source.orientation.conjugate() * relative;
    let cos_angle = FORWARD
        .dot(in_source_frame.normalize_or_zero())
        .clamp(-1.0, 1.0);
    let angle_of_delivery = cos_angle.acos();

    MAX_OFF_AXIS_ATTENUATION
        + OFF_AXIS_ATTENUATION_STEP * (angle_of_delivery / std::f32::consts::FRAC_PI_2)
}

/// Power-law distance falloff, clamped at unity so near-field sources
/// never get boosted.
fn distance_coefficient(distance_squared: f32) -> f32 {
    let distance_scale_log = DISTANCE_SCALE.ln() / DISTANCE_LOG_BASE.ln();
    let coefficient = GEOMETRIC_AMPLITUDE_SCALAR.powf(
        distance_scale_log + 0.5 * distance_squared.ln() / DISTANCE_LOG_BASE.ln() - 1.0,
    );
    coefficient.min(1.0)
}

/// Interaural cues: project the source direction onto the listener's
/// horizontal plane and take the oriented bearing about +Y from forward.
/// A source off to one side reaches the far ear later and quieter.
fn interaural(listener: &ListenerPose, relative: Vec3) -> (u32, f32, DelayedChannel) {
    let mut in_listener_frame = listener.orientation.conjugate() * relative;
    in_listener_frame.y = 0.0;

    if in_listener_frame.length_squared() <= DISTANCE_EPSILON {
        // Directly above or below: no lateral bearing to speak of.
        return (0, 1.0, DelayedChannel::Left);
    }

    let direction = in_listener_frame.normalize();
    let angle = FORWARD.dot(direction).clamp(-1.0, 1.0).acos();
    let bearing = if FORWARD.cross(direction).dot(Vec3::Y) < 0.0 {
        -angle
    } else {
        angle
    };

    let sin_ratio = bearing.sin().abs();
    let delay_samples = (SAMPLE_PHASE_DELAY_AT_90 as f32 * sin_ratio).round() as u32;
    let weak_ratio = 1.0 - PHASE_AMPLITUDE_RATIO_AT_90 * sin_ratio;
    let delayed_channel = if bearing > 0.0 {
        DelayedChannel::Right
    } else {
        DelayedChannel::Left
    };

    (delay_samples, weak_ratio, delayed_channel)
}
