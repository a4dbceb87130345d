//! Session model and multi-file session stitching.

pub mod merge;
pub mod types;

pub use merge::{merge_pair, merge_sessions, session_key};
pub use types::{
    Breath, DeviceSettings, Event, EventKind, Session, SignalSample, SignalType,
    WaveformChannel,
};
