use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a peer (avatar client or injector host) known to
/// the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn into_bytes(self) -> [u8; 16] {
        self.0.into_bytes()
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only the first 8 characters for brevity
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a single audio stream within a peer. A peer owns
/// one microphone stream and any number of injector streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn into_bytes(self) -> [u8; 16] {
        self.0.into_bytes()
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Unified error type for the mixer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed packet: {0}")]
    BadPacket(&'static str),

    #[error("datagram from unregistered source {0}")]
    UnknownSource(SocketAddr),

    #[error("transport backpressure sending to {0}")]
    Backpressure(PeerId),

    #[error("network error: {0}")]
    Network(String),
}

// Network audio format. Every stream ticks in lockstep at this rate and
// frame length; a mono frame is 10 ms of audio.
pub const SAMPLE_RATE: u32 = 24_000;
pub const FRAME_SAMPLES: usize = 240;
pub const FRAME_SAMPLES_STEREO: usize = FRAME_SAMPLES * 2;
pub const FRAME_BYTES_STEREO: usize = FRAME_SAMPLES_STEREO * 2;

/// Target interval between mixed frames, in microseconds.
pub const BUFFER_SEND_INTERVAL_USECS: u64 = 10_000;

/// Scales trailing loudness against distance in the audibility gate.
pub const LOUDNESS_TO_DISTANCE_RATIO: f32 = 0.00001;

/// Interaural sample delay for a source at 90 degrees off the listener's
/// forward axis: round(SAMPLE_RATE * 0.196 m / 343 m/s) at 24 kHz.
pub const SAMPLE_PHASE_DELAY_AT_90: u32 = 14;

pub const MAX_SAMPLE_VALUE: i16 = i16::MAX;
pub const MIN_SAMPLE_VALUE: i16 = i16::MIN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_display() {
        let peer_id = PeerId::new();
        let display = format!("{}", peer_id);
        assert_eq!(display.len(), 8);
    }

    #[test]
    fn peer_id_byte_roundtrip() {
        let id = PeerId::new();
        assert_eq!(PeerId::from_bytes(id.into_bytes()), id);
    }

    #[test]
    fn peer_id_equality() {
        let id1 = PeerId::new();
        let id2 = PeerId::from_bytes(id1.into_bytes());
        let id3 = PeerId::new();
        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn stream_id_ordering_is_stable() {
        let a = StreamId::new();
        let b = StreamId::new();
        assert_eq!(a.cmp(&b), a.cmp(&b));
    }

    #[test]
    fn error_display() {
        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "socket gone",
        ));
        assert!(format!("{}", io_err).contains("I/O error: socket gone"));

        let packet_err = Error::BadPacket("truncated header");
        assert!(format!("{}", packet_err).contains("malformed packet: truncated header"));

        let config_err = Error::Config("bad zone tuple".to_string());
        assert!(format!("{}", config_err).contains("configuration error: bad zone tuple"));
    }

    #[test]
    fn frame_constants_agree() {
        assert_eq!(FRAME_SAMPLES_STEREO, 480);
        assert_eq!(FRAME_BYTES_STEREO, 960);
        // One frame spans exactly the send interval.
        assert_eq!(
            FRAME_SAMPLES as u64 * 1_000_000 / SAMPLE_RATE as u64,
            BUFFER_SEND_INTERVAL_USECS
        );
    }
}
