//! HLS segmentation and playlist publishing.

pub mod playlist;
pub mod segmenter;
pub mod sink;

pub use segmenter::{Segmenter, SegmenterConfig};
pub use sink::{SegmentSink, TsFileSink, PLAYLIST_NAME};
