//! Video capture and encoding.

pub mod capture;
pub mod convert;
pub mod encoder;
pub mod format;
pub mod locate;

pub use capture::{CaptureStream, FrameView, NegotiatedFormat};
pub use encoder::{EncodedAccessUnit, EncoderConfig, H264Encoder, SubmitOutcome};
pub use format::{PixelFormat, Resolution};
pub use locate::{enumerate_devices, locate_device, LocatedDevice};
