//! Breath segmentation and flow-limitation scoring.

pub mod flow_limitation;
pub mod segmenter;

pub use flow_limitation::flow_limitation_score;
pub use segmenter::{segment_breaths, BreathConfig};
