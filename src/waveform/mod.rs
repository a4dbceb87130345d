//! Bounded-cost viewport queries over long recordings.

pub mod index;

pub use index::{EnvelopePoint, SignalIndex, WaveformIndex};
