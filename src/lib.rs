//! hlscam - V4L2 capture to HLS library
//!
//! Captures raw video from a V4L2 device, encodes it to H.264 and publishes
//! MPEG-TS segments with a live playlist.

pub mod error;
pub mod hls;
pub mod pipeline;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
