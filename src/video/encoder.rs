//! H.264 encoding via libx264 (ac-ffmpeg).
//!
//! The encoder is tuned for segment-aligned live output: zero-latency, no
//! B-frames, fixed GOP with scene-cut detection disabled so keyframes land
//! exactly every `gop` frames. Timestamps run on a microsecond time base,
//! so capture timestamps pass through without rescaling.

use ac_ffmpeg::codec::video::{self, VideoEncoder, VideoFrame, VideoFrameMut};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::convert::{self, Yuv420Planes};
use crate::video::format::{PixelFormat, Resolution};

/// One encoded H.264 access unit, ready for muxing.
#[derive(Debug, Clone)]
pub struct EncodedAccessUnit {
    pub pts_us: i64,
    pub dts_us: i64,
    pub keyframe: bool,
    pub payload: Bytes,
}

/// Result of submitting a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The encoder accepted the frame.
    Accepted,
    /// The encoder's input queue is full; drain with [`H264Encoder::collect`]
    /// and submit the frame again.
    Backpressure,
}

/// Encoder configuration, resolved from the CLI.
#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub gop: u32,
}

/// Check that segment boundaries can land on keyframes: a segment must
/// span a whole number of GOPs.
pub fn validate_gop_alignment(fps: u32, gop: u32, segment_seconds: u32) -> Result<()> {
    if gop == 0 || fps == 0 || segment_seconds == 0 {
        return Err(AppError::EncoderInit(
            "fps, gop and segment length must be non-zero".to_string(),
        ));
    }
    let frames_per_segment = fps as u64 * segment_seconds as u64;
    if frames_per_segment % gop as u64 != 0 {
        return Err(AppError::EncoderInit(format!(
            "segment of {} frames is not a whole number of GOPs (gop={})",
            frames_per_segment, gop
        )));
    }
    Ok(())
}

/// Reuses frozen frames instead of allocating one per capture.
struct FramePool {
    width: usize,
    height: usize,
    time_base: TimeBase,
    pixel_format: video::frame::PixelFormat,
    pool: Vec<VideoFrame>,
}

impl FramePool {
    fn new(
        width: usize,
        height: usize,
        time_base: TimeBase,
        pixel_format: video::frame::PixelFormat,
    ) -> Self {
        Self {
            width,
            height,
            time_base,
            pixel_format,
            pool: Vec::new(),
        }
    }

    fn take(&mut self) -> VideoFrameMut {
        while let Some(frame) = self.pool.pop() {
            match frame.try_into_mut() {
                Ok(frame) => return frame,
                // Still referenced by the encoder; let it go.
                Err(_) => continue,
            }
        }
        VideoFrameMut::black(self.pixel_format, self.width, self.height)
            .with_time_base(self.time_base)
    }

    fn put(&mut self, frame: VideoFrame) {
        if self.pool.len() < 4 {
            self.pool.push(frame);
        }
    }
}

/// libx264 encoder with plane conversion and dts sanity checking.
pub struct H264Encoder {
    encoder: VideoEncoder,
    frame_pool: FramePool,
    config: EncoderConfig,
    last_dts_us: Option<i64>,
    dts_throttler: LogThrottler,
}

impl H264Encoder {
    pub fn open(config: EncoderConfig) -> Result<Self> {
        let resolution = config.resolution;
        if !resolution.is_valid() || resolution.width % 2 != 0 || resolution.height % 2 != 0 {
            return Err(AppError::EncoderInit(format!(
                "unsupported encode resolution {}",
                resolution
            )));
        }

        let time_base = TimeBase::MICROSECONDS;
        let pixel_format = video::frame::get_pixel_format("yuv420p");
        let bitrate = config.bitrate_kbps as u64 * 1000;

        let encoder = VideoEncoder::builder("libx264")
            .map_err(|e| AppError::EncoderInit(format!("libx264 unavailable: {}", e)))?
            .pixel_format(pixel_format)
            .width(resolution.width as usize)
            .height(resolution.height as usize)
            .time_base(time_base)
            .set_option("preset", "veryfast")
            .set_option("tune", "zerolatency")
            .set_option("b", &bitrate.to_string())
            .set_option("maxrate", &bitrate.to_string())
            .set_option("bufsize", &(bitrate * 2).to_string())
            .set_option("g", &config.gop.to_string())
            .set_option("sc_threshold", "0")
            .set_option("bf", "0")
            .build()
            .map_err(|e| AppError::EncoderInit(e.to_string()))?;

        info!(
            "libx264 ready: {} @ {} fps, {} kbps, gop {}",
            resolution, config.fps, config.bitrate_kbps, config.gop
        );

        Ok(Self {
            encoder,
            frame_pool: FramePool::new(
                resolution.width as usize,
                resolution.height as usize,
                time_base,
                pixel_format,
            ),
            config,
            last_dts_us: None,
            dts_throttler: LogThrottler::with_secs(5),
        })
    }

    pub fn codec_parameters(&self) -> CodecParameters {
        self.encoder.codec_parameters().into()
    }

    /// Convert a captured frame into I420 and submit it.
    ///
    /// Backpressure is flow control, not an error: the caller drains pending
    /// packets and retries the same frame.
    pub fn submit(
        &mut self,
        format: PixelFormat,
        stride: usize,
        planes: &[&[u8]],
        pts_us: i64,
    ) -> Result<SubmitOutcome> {
        let mut frame = self.frame_pool.take();
        {
            let mut frame_planes = frame.planes_mut();
            let height = self.config.resolution.height as usize;
            let (head, tail) = frame_planes.split_at_mut(2);
            let (y_head, u_head) = head.split_at_mut(1);
            let y = y_head[0].data_mut();
            let y_stride = y.len() / height;
            let mut dst = Yuv420Planes {
                y,
                u: u_head[0].data_mut(),
                v: tail[0].data_mut(),
                y_stride,
            };
            convert::convert_frame(format, self.config.resolution, stride, planes, &mut dst)?;
        }

        let frame = frame
            .with_pts(Timestamp::new(pts_us, TimeBase::MICROSECONDS))
            .freeze();

        match self.encoder.try_push(frame.clone()) {
            Ok(()) => {
                self.frame_pool.put(frame);
                Ok(SubmitOutcome::Accepted)
            }
            Err(e) if e.is_again() => {
                debug!("encoder input full, asking caller to drain");
                Ok(SubmitOutcome::Backpressure)
            }
            Err(e) => Err(AppError::VideoError(format!("encode failed: {}", e))),
        }
    }

    /// Drain every packet the encoder has ready.
    pub fn collect(&mut self, out: &mut Vec<EncodedAccessUnit>) -> Result<()> {
        while let Some(packet) = self
            .encoder
            .take()
            .map_err(|e| AppError::VideoError(format!("encoder output failed: {}", e)))?
        {
            let pts_us = packet.pts().as_micros().unwrap_or(0);
            let raw_dts_us = packet.dts().as_micros().unwrap_or(pts_us);

            let (dts_us, regressed) = clamp_dts(&mut self.last_dts_us, raw_dts_us);
            if regressed && self.dts_throttler.should_log("dts_regression") {
                warn!(
                    "non-monotonic dts from encoder: {} clamped to {}",
                    raw_dts_us, dts_us
                );
            }

            out.push(EncodedAccessUnit {
                pts_us,
                dts_us,
                keyframe: packet.is_key(),
                payload: Bytes::copy_from_slice(packet.data()),
            });
        }
        Ok(())
    }

    /// Signal end of stream and drain everything still buffered.
    pub fn finish(&mut self) -> Result<Vec<EncodedAccessUnit>> {
        self.encoder
            .flush()
            .map_err(|e| AppError::VideoError(format!("encoder flush failed: {}", e)))?;
        let mut out = Vec::new();
        self.collect(&mut out)?;
        Ok(out)
    }
}

/// libx264 with bf=0 emits monotonically increasing dts; a step backwards
/// would make the stream unusable for muxing, so it is pinned to the
/// previous value. Returns the emitted dts and whether a regression was
/// clamped.
fn clamp_dts(last_dts_us: &mut Option<i64>, dts_us: i64) -> (i64, bool) {
    let clamped = match *last_dts_us {
        Some(last) if dts_us < last => last,
        _ => dts_us,
    };
    *last_dts_us = Some(clamped);
    (clamped, clamped != dts_us)
}
