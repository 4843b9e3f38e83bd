//! Per-client stream registry.
//!
//! Each registered peer owns one microphone stream and any number of
//! injector streams, keyed by [`StreamId`]. The registry is walked in
//! `PeerId` order (microphone before injectors within a client) so every
//! tick mixes sources in one stable order.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use log::debug;
use mixer_core::{PeerId, StreamId, FRAME_SAMPLES, FRAME_SAMPLES_STEREO, MAX_SAMPLE_VALUE};
use spatial::{Emitter, ListenerPose, SourceVoice};

use crate::ring::{RingView, SampleRing, RING_FRAMES};

/// Frames of smoothing applied when trailing loudness decays.
const TRAILING_LOUDNESS_FRAMES: u32 = 100;

/// Trailing loudness below this snaps to zero so the audibility gate can
/// close completely.
const LOUDNESS_EPSILON: f32 = 1e-6;

/// Injector streams that stay starved this many consecutive ticks are
/// dropped from their client.
const INJECTOR_DRY_FRAMES: u32 = 100;

/// Distinguishes a client's streams during a mix walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Microphone,
    Injector(StreamId),
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Microphone { loopback: bool },
    Injector { radius: f32, attenuation_ratio: f32 },
}

/// One positional audio stream: ring storage plus the pose and loudness
/// state the spatializer reads.
#[derive(Debug)]
pub struct PositionalStream {
    ring: SampleRing,
    kind: StreamKind,
    stereo: bool,
    position: Vec3,
    orientation: Quat,
    trailing_loudness: f32,
    ready: bool,
    primed: bool,
    prime_frames: usize,
    last_sequence: Option<u16>,
    dry_ticks: u32,
}

impl PositionalStream {
    fn new(kind: StreamKind, stereo: bool, prime_frames: usize) -> Self {
        let frame_len = if stereo {
            FRAME_SAMPLES_STEREO
        } else {
            FRAME_SAMPLES
        };
        Self {
            ring: SampleRing::new(frame_len * RING_FRAMES),
            kind,
            stereo,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            trailing_loudness: 0.0,
            ready: false,
            primed: false,
            prime_frames,
            last_sequence: None,
            dry_ticks: 0,
        }
    }

    /// Samples in one network frame for this stream's channel layout.
    pub fn frame_len(&self) -> usize {
        if self.stereo {
            FRAME_SAMPLES_STEREO
        } else {
            FRAME_SAMPLES
        }
    }

    pub fn stereo(&self) -> bool {
        self.stereo
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn trailing_loudness(&self) -> f32 {
        self.trailing_loudness
    }

    pub fn loopback(&self) -> bool {
        matches!(self.kind, StreamKind::Microphone { loopback: true })
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// This tick's output frame.
    pub fn next_output(&self) -> RingView<'_> {
        self.ring.next_output(self.frame_len())
    }

    /// The `count` samples preceding this tick's frame, for delay fill.
    pub fn tail(&self, count: usize) -> RingView<'_> {
        self.ring.tail(count)
    }

    /// Spatial view of this stream for the current tick.
    pub fn voice(&self) -> SourceVoice {
        let emitter = match self.kind {
            StreamKind::Microphone { .. } => Emitter::Microphone,
            StreamKind::Injector {
                radius,
                attenuation_ratio,
            } => Emitter::Injector {
                radius,
                attenuation_ratio,
            },
        };
        SourceVoice {
            position: self.position,
            orientation: self.orientation,
            trailing_loudness: self.trailing_loudness,
            stereo: self.stereo,
            emitter,
        }
    }

    fn accept_sequence(&mut self, sequence: u16) -> bool {
        let newer = match self.last_sequence {
            None => true,
            // Wrapping comparison: treat half the sequence space as "newer".
            Some(last) => sequence.wrapping_sub(last) as i16 > 0,
        };
        if newer {
            self.last_sequence = Some(sequence);
        }
        newer
    }

    fn ingest(
        &mut self,
        sequence: u16,
        position: Vec3,
        orientation: Quat,
        samples: &[i16],
    ) -> bool {
        if !self.accept_sequence(sequence) {
            return false;
        }
        self.position = position;
        self.orientation = orientation;
        let dropped = self.ring.push(samples);
        if dropped > 0 {
            debug!("stream ring overflow, discarded {} samples", dropped);
        }
        true
    }

    fn ingest_silence(
        &mut self,
        sequence: u16,
        position: Vec3,
        orientation: Quat,
        count: usize,
    ) -> bool {
        if !self.accept_sequence(sequence) {
            return false;
        }
        self.position = position;
        self.orientation = orientation;
        self.ring.push_silence(count);
        true
    }

    /// Align this stream for the coming tick: decide readiness and fold
    /// this tick's frame into the trailing loudness envelope.
    fn pre_frame(&mut self) {
        let frame_len = self.frame_len();
        let wanted = if self.primed {
            frame_len
        } else {
            frame_len * self.prime_frames
        };
        self.ready = self.ring.readable() >= wanted;

        if self.ready {
            self.primed = true;
            self.dry_ticks = 0;
            self.update_trailing_loudness();
        } else {
            self.dry_ticks += 1;
        }
    }

    /// Consume this tick's frame. Called exactly once per tick, after
    /// every listener has sampled the stream.
    fn post_frame(&mut self) {
        if self.ready {
            let frame_len = self.frame_len();
            self.ring.advance(frame_len);
            self.ready = false;
        }
    }

    fn update_trailing_loudness(&mut self) {
        let view = self.next_output();
        let sum: f32 = view.iter().map(|s| (s as f32).abs()).sum();
        let frame_loudness = sum / view.len() as f32 / MAX_SAMPLE_VALUE as f32;

        // Rise instantly to louder frames, decay smoothly toward
        // quieter ones.
        if frame_loudness > self.trailing_loudness {
            self.trailing_loudness = frame_loudness;
        } else {
            let current = 1.0 / TRAILING_LOUDNESS_FRAMES as f32;
            self.trailing_loudness =
                (1.0 - current) * self.trailing_loudness + current * frame_loudness;
        }
        if self.trailing_loudness < LOUDNESS_EPSILON {
            self.trailing_loudness = 0.0;
        }
    }
}

/// All streams owned by one peer.
#[derive(Debug)]
pub struct ClientStreams {
    microphone: Option<PositionalStream>,
    injectors: BTreeMap<StreamId, PositionalStream>,
    prime_frames: usize,
}

impl ClientStreams {
    fn new(prime_frames: usize) -> Self {
        Self {
            microphone: None,
            injectors: BTreeMap::new(),
            prime_frames,
        }
    }

    pub fn microphone(&self) -> Option<&PositionalStream> {
        self.microphone.as_ref()
    }

    pub fn injector_count(&self) -> usize {
        self.injectors.len()
    }

    /// Microphone first, then injectors in `StreamId` order.
    pub fn streams(&self) -> impl Iterator<Item = (StreamRole, &PositionalStream)> {
        self.microphone
            .iter()
            .map(|s| (StreamRole::Microphone, s))
            .chain(
                self.injectors
                    .iter()
                    .map(|(id, s)| (StreamRole::Injector(*id), s)),
            )
    }

    pub fn ingest_microphone(
        &mut self,
        sequence: u16,
        stereo: bool,
        loopback: bool,
        position: Vec3,
        orientation: Quat,
        samples: &[i16],
    ) -> bool {
        let prime_frames = self.prime_frames;
        if self
            .microphone
            .as_ref()
            .is_some_and(|mic| mic.stereo != stereo)
        {
            debug!("microphone channel layout changed, resetting stream");
            self.microphone = None;
        }
        let mic = self.microphone.get_or_insert_with(|| {
            PositionalStream::new(StreamKind::Microphone { loopback }, stereo, prime_frames)
        });
        mic.kind = StreamKind::Microphone { loopback };
        mic.ingest(sequence, position, orientation, samples)
    }

    pub fn ingest_microphone_silence(
        &mut self,
        sequence: u16,
        position: Vec3,
        orientation: Quat,
        count: usize,
    ) -> bool {
        let prime_frames = self.prime_frames;
        let mic = self.microphone.get_or_insert_with(|| {
            PositionalStream::new(
                StreamKind::Microphone { loopback: false },
                false,
                prime_frames,
            )
        });
        mic.ingest_silence(sequence, position, orientation, count)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn ingest_injector(
        &mut self,
        stream_id: StreamId,
        sequence: u16,
        radius: f32,
        attenuation_ratio: f32,
        position: Vec3,
        orientation: Quat,
        samples: &[i16],
    ) -> bool {
        let prime_frames = self.prime_frames;
        let stream = self.injectors.entry(stream_id).or_insert_with(|| {
            PositionalStream::new(
                StreamKind::Injector {
                    radius,
                    attenuation_ratio,
                },
                false,
                prime_frames,
            )
        });
        stream.kind = StreamKind::Injector {
            radius,
            attenuation_ratio,
        };
        stream.ingest(sequence, position, orientation, samples)
    }

    fn pre_frame(&mut self) {
        if let Some(mic) = self.microphone.as_mut() {
            mic.pre_frame();
        }
        for stream in self.injectors.values_mut() {
            stream.pre_frame();
        }
        self.injectors.retain(|id, stream| {
            let keep = stream.dry_ticks < INJECTOR_DRY_FRAMES;
            if !keep {
                debug!("injector {} ran dry, dropping stream", id);
            }
            keep
        });
    }

    fn post_frame(&mut self) {
        if let Some(mic) = self.microphone.as_mut() {
            mic.post_frame();
        }
        for stream in self.injectors.values_mut() {
            stream.post_frame();
        }
    }
}

/// Every client's audio state, mutated only by ingest between ticks.
#[derive(Debug)]
pub struct Registry {
    clients: BTreeMap<PeerId, ClientStreams>,
    prime_frames: usize,
}

impl Registry {
    /// With dynamic jitter buffering the first frame of a new stream is
    /// held back one extra tick so a late second packet does not starve
    /// it immediately.
    pub fn new(dynamic_jitter_buffers: bool) -> Self {
        Self {
            clients: BTreeMap::new(),
            prime_frames: if dynamic_jitter_buffers { 2 } else { 1 },
        }
    }

    pub fn ensure_client(&mut self, peer: PeerId) -> &mut ClientStreams {
        let prime_frames = self.prime_frames;
        self.clients
            .entry(peer)
            .or_insert_with(|| ClientStreams::new(prime_frames))
    }

    pub fn client(&self, peer: PeerId) -> Option<&ClientStreams> {
        self.clients.get(&peer)
    }

    pub fn remove_client(&mut self, peer: PeerId) -> bool {
        self.clients.remove(&peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.clients.keys().copied()
    }

    pub fn iter_clients(&self) -> impl Iterator<Item = (&PeerId, &ClientStreams)> {
        self.clients.iter()
    }

    /// The head pose a peer listens from, if it has sent any audio.
    pub fn listener_pose(&self, peer: PeerId) -> Option<ListenerPose> {
        let mic = self.clients.get(&peer)?.microphone.as_ref()?;
        Some(ListenerPose {
            position: mic.position,
            orientation: mic.orientation,
        })
    }

    /// Whether a peer is eligible to receive a mix this tick.
    pub fn listener_ready(&self, peer: PeerId) -> bool {
        self.clients
            .get(&peer)
            .and_then(|c| c.microphone.as_ref())
            .is_some_and(|mic| mic.ready)
    }

    /// Tick bookkeeping before mixing: realign every stream's cursor and
    /// refresh loudness envelopes.
    pub fn pre_frame(&mut self) {
        for client in self.clients.values_mut() {
            client.pre_frame();
        }
    }

    /// Tick bookkeeping after mixing: consume every frame that was read.
    pub fn post_frame(&mut self) {
        for client in self.clients.values_mut() {
            client.post_frame();
        }
    }
}
