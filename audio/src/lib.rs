//! Audio state and mixing for soundstage.
//!
//! [`ring`] owns the per-stream sample storage, [`registry`] tracks every
//! client's streams across a tick, and [`mix`] folds sources into a
//! listener's stereo frame according to plans from the `spatial` crate.

pub mod mix;
pub mod registry;
pub mod ring;

pub use mix::{mix_for_listener, MixFrame};
pub use registry::{ClientStreams, PositionalStream, Registry, StreamRole};
pub use ring::{RingView, SampleRing};
