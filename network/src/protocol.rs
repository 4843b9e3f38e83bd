//! Datagram formats for the mixer.
//!
//! Every packet opens with a fixed three-byte header: magic, protocol
//! version, packet type. Audio payloads are hand-encoded little-endian
//! since their layout is part of the client contract; the stream-stats
//! payload is opaque to clients and rides as bincode.

use glam::{Quat, Vec3};
use mixer_core::{Error, PeerId, StreamId, FRAME_SAMPLES, FRAME_SAMPLES_STEREO};
use serde::{Deserialize, Serialize};

/// First byte of every datagram.
pub const PACKET_MAGIC: u8 = 0xC6;

/// Protocol version; bumped on any wire-format change.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header length for every packet type.
pub const HEADER_LEN: usize = 3;

/// Maximum size of a UDP payload we expect to handle.
pub const MAX_UDP_PAYLOAD_SIZE: usize = 1400;

/// Packet types understood by the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Avatar microphone audio, not mixed back to its sender.
    MicrophoneAudioNoEcho = 0,
    /// Avatar microphone audio, echoed into the sender's own mix.
    MicrophoneAudioWithEcho = 1,
    /// World audio from an injector stream.
    InjectAudio = 2,
    /// A pose update carrying only silence.
    SilentAudioFrame = 3,
    /// Broadcast request to mute the environment; relayed verbatim.
    MuteEnvironment = 4,
    /// A mixed stereo frame from the mixer to a listener.
    MixedAudio = 5,
    /// Periodic mixer statistics for a listener.
    StreamStats = 6,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::MicrophoneAudioNoEcho),
            1 => Ok(Self::MicrophoneAudioWithEcho),
            2 => Ok(Self::InjectAudio),
            3 => Ok(Self::SilentAudioFrame),
            4 => Ok(Self::MuteEnvironment),
            5 => Ok(Self::MixedAudio),
            6 => Ok(Self::StreamStats),
            _ => Err(Error::BadPacket("unknown packet type")),
        }
    }
}

/// Validate the fixed header and return the packet type.
pub fn parse_header(datagram: &[u8]) -> Result<PacketType, Error> {
    if datagram.len() < HEADER_LEN {
        return Err(Error::BadPacket("truncated header"));
    }
    if datagram[0] != PACKET_MAGIC {
        return Err(Error::BadPacket("bad magic"));
    }
    if datagram[1] != PROTOCOL_VERSION {
        return Err(Error::BadPacket("protocol version mismatch"));
    }
    PacketType::try_from(datagram[2])
}

fn write_header(buf: &mut Vec<u8>, packet_type: PacketType) {
    buf.push(PACKET_MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.push(packet_type as u8);
}

/// Little-endian cursor over a packet payload.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes.len() < len {
            return Err(Error::BadPacket("truncated payload"));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn f32(&mut self) -> Result<f32, Error> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn uuid(&mut self) -> Result<[u8; 16], Error> {
        let bytes = self.take(16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn vec3(&mut self) -> Result<Vec3, Error> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    fn quat(&mut self) -> Result<Quat, Error> {
        Ok(Quat::from_xyzw(
            self.f32()?,
            self.f32()?,
            self.f32()?,
            self.f32()?,
        ))
    }

    /// Consume the rest of the payload as exactly `count` samples.
    fn samples(&mut self, count: usize) -> Result<Vec<i16>, Error> {
        if self.bytes.len() != count * 2 {
            return Err(Error::BadPacket("sample payload length mismatch"));
        }
        let samples = self
            .bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.bytes = &[];
        Ok(samples)
    }
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_vec3(buf: &mut Vec<u8>, value: Vec3) {
    push_f32(buf, value.x);
    push_f32(buf, value.y);
    push_f32(buf, value.z);
}

fn push_quat(buf: &mut Vec<u8>, value: Quat) {
    push_f32(buf, value.x);
    push_f32(buf, value.y);
    push_f32(buf, value.z);
    push_f32(buf, value.w);
}

fn push_samples(buf: &mut Vec<u8>, samples: &[i16]) {
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
}

const FLAG_STEREO: u8 = 0b0000_0001;

/// One microphone audio frame with its sender pose.
#[derive(Debug, Clone, PartialEq)]
pub struct MicrophoneFrame {
    pub sequence: u16,
    pub stereo: bool,
    pub position: Vec3,
    pub orientation: Quat,
    pub samples: Vec<i16>,
}

impl MicrophoneFrame {
    pub fn encode(&self, echo: bool) -> Vec<u8> {
        let packet_type = if echo {
            PacketType::MicrophoneAudioWithEcho
        } else {
            PacketType::MicrophoneAudioNoEcho
        };
        let mut buf = Vec::with_capacity(HEADER_LEN + 35 + self.samples.len() * 2);
        write_header(&mut buf, packet_type);
        push_u16(&mut buf, self.sequence);
        buf.push(if self.stereo { FLAG_STEREO } else { 0 });
        push_vec3(&mut buf, self.position);
        push_quat(&mut buf, self.orientation);
        push_samples(&mut buf, &self.samples);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);
        let sequence = reader.u16()?;
        let flags = reader.u8()?;
        let stereo = flags & FLAG_STEREO != 0;
        let position = reader.vec3()?;
        let orientation = reader.quat()?;
        let count = if stereo {
            FRAME_SAMPLES_STEREO
        } else {
            FRAME_SAMPLES
        };
        let samples = reader.samples(count)?;
        Ok(Self {
            sequence,
            stereo,
            position,
            orientation,
            samples,
        })
    }
}

/// One injector audio frame. Injectors are mono; a positive radius makes
/// the stream a spherical emitter.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectFrame {
    pub sequence: u16,
    pub stream_id: StreamId,
    pub position: Vec3,
    pub orientation: Quat,
    pub radius: f32,
    pub attenuation_ratio: f32,
    pub samples: Vec<i16>,
}

impl InjectFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 54 + self.samples.len() * 2);
        write_header(&mut buf, PacketType::InjectAudio);
        push_u16(&mut buf, self.sequence);
        buf.extend_from_slice(&self.stream_id.into_bytes());
        push_vec3(&mut buf, self.position);
        push_quat(&mut buf, self.orientation);
        push_f32(&mut buf, self.radius);
        push_f32(&mut buf, self.attenuation_ratio);
        push_samples(&mut buf, &self.samples);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);
        let sequence = reader.u16()?;
        let stream_id = StreamId::from_bytes(reader.uuid()?);
        let position = reader.vec3()?;
        let orientation = reader.quat()?;
        let radius = reader.f32()?;
        let attenuation_ratio = reader.f32()?;
        let samples = reader.samples(FRAME_SAMPLES)?;
        Ok(Self {
            sequence,
            stream_id,
            position,
            orientation,
            radius,
            attenuation_ratio,
            samples,
        })
    }
}

/// A pose update with no audible content.
#[derive(Debug, Clone, PartialEq)]
pub struct SilentFrame {
    pub sequence: u16,
    pub position: Vec3,
    pub orientation: Quat,
    pub num_silent_samples: u16,
}

impl SilentFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 32);
        write_header(&mut buf, PacketType::SilentAudioFrame);
        push_u16(&mut buf, self.sequence);
        push_vec3(&mut buf, self.position);
        push_quat(&mut buf, self.orientation);
        push_u16(&mut buf, self.num_silent_samples);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(payload);
        let frame = Self {
            sequence: reader.u16()?,
            position: reader.vec3()?,
            orientation: reader.quat()?,
            num_silent_samples: reader.u16()?,
        };
        if !reader.bytes.is_empty() {
            return Err(Error::BadPacket("trailing bytes"));
        }
        Ok(frame)
    }
}

/// Encode a mixed stereo frame into `buf`, reusing its allocation.
pub fn encode_mixed_audio(buf: &mut Vec<u8>, sequence: u16, samples: &[i16; FRAME_SAMPLES_STEREO]) {
    buf.clear();
    write_header(buf, PacketType::MixedAudio);
    push_u16(buf, sequence);
    push_samples(buf, samples);
}

/// Decode a mixed-audio payload back into sequence and samples. The
/// client-side counterpart of [`encode_mixed_audio`].
pub fn decode_mixed_audio(payload: &[u8]) -> Result<(u16, Vec<i16>), Error> {
    let mut reader = Reader::new(payload);
    let sequence = reader.u16()?;
    let samples = reader.samples(FRAME_SAMPLES_STEREO)?;
    Ok((sequence, samples))
}

/// Periodic per-listener mixer statistics. Layout is internal, so this
/// one travels as bincode rather than a fixed wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub trailing_sleep_percentage: f32,
    pub performance_throttling_ratio: f32,
    pub average_listeners_per_frame: f32,
    pub average_mixes_per_listener: f32,
    pub overrun_ticks: u64,
    pub bad_packets: u64,
}

impl StreamStats {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 32);
        write_header(&mut buf, PacketType::StreamStats);
        let body = bincode::serialize(self)
            .map_err(|e| Error::Network(format!("failed to serialize stream stats: {}", e)))?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(payload)
            .map_err(|e| Error::Network(format!("failed to deserialize stream stats: {}", e)))
    }
}

/// Sender identity attached to every received datagram.
pub type Datagram = (PeerId, Vec<u8>);
