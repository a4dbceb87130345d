//! Card import orchestration.
//!
//! This module contains:
//! - The parallel per-file decode with failure isolation
//! - The full decode → merge → aggregate → index pipeline
//! - Shared counters describing what an import did

pub mod log;
pub mod pipeline;

pub use log::{ImportLog, ImportStats};
pub use pipeline::{
    decode_card, run_pipeline, CardFile, CardImport, FileFailure, FileReport, ImportError,
    PipelineOutput,
};
