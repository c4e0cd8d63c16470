//! Session orchestration.

pub mod controller;

pub use controller::{initialize, PipelineConfig, Registry, Session, SessionState};
