//! V4L2 capture stream built on the v4l2r ioctl layer.
//!
//! Buffers are mmap'd once at open and cycled between the driver and the
//! pipeline: `next_frame` dequeues a buffer and hands out a view into its
//! mapping, `release` queues the buffer back. Every buffer index is owned by
//! exactly one side at any time; the [`BufferLedger`] tracks which.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l2r::bindings::{v4l2_requestbuffers, v4l2_streamparm, v4l2_streamparm__bindgen_ty_1};
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, MemoryConsistency, PlaneMapping,
    QBufPlane, QBuffer, QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{MemoryType, MmapHandle};
use v4l2r::{Format as V4l2rFormat, QueueType};

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Errno values that mean the capture device itself went away, as opposed
/// to a transient ioctl failure. Matched by both numeric and symbolic form
/// since the ioctl layer reports either, depending on the failing call.
const DEVICE_LOST_ERRNOS: [(i32, &str); 5] = [
    (5, "EIO"),
    (6, "ENXIO"),
    (19, "ENODEV"),
    (32, "EPIPE"),
    (108, "ESHUTDOWN"),
];

/// Who currently owns a capture buffer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferOwner {
    Driver,
    Pipeline,
}

/// Ownership ledger for the mmap buffer pool.
///
/// A buffer moves Driver -> Pipeline on dequeue and Pipeline -> Driver on
/// release; any other transition is a bookkeeping bug and is reported as an
/// error rather than silently corrupting the queue.
#[derive(Debug)]
struct BufferLedger {
    owners: Vec<BufferOwner>,
}

impl BufferLedger {
    fn new(count: usize) -> Self {
        Self {
            owners: vec![BufferOwner::Pipeline; count],
        }
    }

    fn to_pipeline(&mut self, index: usize) -> Result<()> {
        match self.owners.get(index) {
            Some(BufferOwner::Driver) => {
                self.owners[index] = BufferOwner::Pipeline;
                Ok(())
            }
            Some(BufferOwner::Pipeline) => Err(AppError::VideoError(format!(
                "Driver returned buffer {} which the pipeline already holds",
                index
            ))),
            None => Err(AppError::VideoError(format!(
                "Driver returned out-of-range buffer index {}",
                index
            ))),
        }
    }

    fn to_driver(&mut self, index: usize) -> Result<()> {
        match self.owners.get(index) {
            Some(BufferOwner::Pipeline) => {
                self.owners[index] = BufferOwner::Driver;
                Ok(())
            }
            Some(BufferOwner::Driver) => Err(AppError::VideoError(format!(
                "Buffer {} released twice",
                index
            ))),
            None => Err(AppError::VideoError(format!(
                "Released out-of-range buffer index {}",
                index
            ))),
        }
    }

    fn pipeline_held(&self) -> usize {
        self.owners
            .iter()
            .filter(|o| **o == BufferOwner::Pipeline)
            .count()
    }
}

/// A dequeued frame, borrowing the mmap'd buffer it lives in.
///
/// The borrow ties the view's lifetime to the stream, so the buffer cannot
/// be released or re-queued while the view is alive.
#[derive(Debug)]
pub struct FrameView<'a> {
    /// Pool index; pass back to [`CaptureStream::release`].
    pub index: u32,
    /// Driver frame counter.
    pub sequence: u64,
    /// Capture timestamp in microseconds, from the driver clock.
    pub pts_us: i64,
    /// Payload planes, trimmed to the bytes the driver filled.
    pub planes: Vec<&'a [u8]>,
}

/// Negotiated capture parameters, after the driver had its say.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedFormat {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    pub stride: u32,
}

/// Streaming V4L2 capture device with an mmap buffer pool.
pub struct CaptureStream {
    fd: File,
    device_path: PathBuf,
    queue: QueueType,
    negotiated: NegotiatedFormat,
    timeout: Duration,
    mappings: Vec<Vec<PlaneMapping>>,
    ledger: BufferLedger,
    streaming: bool,
}

impl CaptureStream {
    /// Open the device, negotiate format exactly, allocate and map buffers,
    /// and start streaming.
    ///
    /// The requested resolution and pixel format must be accepted verbatim;
    /// a driver that substitutes either fails with `FormatNegotiation`
    /// rather than silently capturing something else.
    pub fn open(
        device_path: impl AsRef<Path>,
        resolution: Resolution,
        format: PixelFormat,
        fps: u32,
        buffer_count: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let device_path = device_path.as_ref().to_path_buf();
        let mut fd = File::options()
            .read(true)
            .write(true)
            .open(&device_path)
            .map_err(|e| {
                AppError::VideoError(format!(
                    "Failed to open {}: {}",
                    device_path.display(),
                    e
                ))
            })?;

        let caps: V4l2rCapability = ioctl::querycap(&fd)
            .map_err(|e| AppError::VideoError(format!("Failed to query capabilities: {}", e)))?;
        let caps_flags = caps.device_caps();

        let queue = if caps_flags.contains(Capabilities::VIDEO_CAPTURE_MPLANE) {
            QueueType::VideoCaptureMplane
        } else if caps_flags.contains(Capabilities::VIDEO_CAPTURE) {
            QueueType::VideoCapture
        } else {
            return Err(AppError::FormatNegotiation {
                device: device_path.display().to_string(),
                reason: "device exposes no video capture queue".to_string(),
            });
        };

        let mut fmt: V4l2rFormat = ioctl::g_fmt(&fd, queue)
            .map_err(|e| AppError::VideoError(format!("Failed to get device format: {}", e)))?;

        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.pixelformat = format.to_fourcc();

        let actual: V4l2rFormat = ioctl::s_fmt(&mut fd, (queue, &fmt))
            .map_err(|e| AppError::VideoError(format!("Failed to set device format: {}", e)))?;

        if actual.width != resolution.width || actual.height != resolution.height {
            return Err(AppError::FormatNegotiation {
                device: device_path.display().to_string(),
                reason: format!(
                    "requested {}, driver offered {}x{}",
                    resolution, actual.width, actual.height
                ),
            });
        }
        if PixelFormat::from_fourcc(actual.pixelformat) != Some(format) {
            return Err(AppError::FormatNegotiation {
                device: device_path.display().to_string(),
                reason: format!(
                    "requested {}, driver offered {}",
                    format, actual.pixelformat
                ),
            });
        }

        let stride = actual
            .plane_fmt
            .first()
            .map(|p| p.bytesperline)
            .unwrap_or(0);

        if fps > 0 {
            if let Err(e) = set_fps(&fd, queue, fps) {
                warn!("Failed to set hardware FPS: {}", e);
            }
        }

        let req: v4l2_requestbuffers = ioctl::reqbufs(
            &fd,
            queue,
            MemoryType::Mmap,
            buffer_count,
            MemoryConsistency::empty(),
        )
        .map_err(|e| AppError::VideoError(format!("Failed to request buffers: {}", e)))?;
        let allocated = req.count as usize;
        if allocated == 0 {
            return Err(AppError::VideoError(
                "Driver returned zero capture buffers".to_string(),
            ));
        }
        if (allocated as u32) < buffer_count {
            debug!(
                "Driver granted {} of {} requested buffers",
                allocated, buffer_count
            );
        }

        let mut mappings = Vec::with_capacity(allocated);
        for index in 0..allocated as u32 {
            let query: QueryBuffer = ioctl::querybuf(&fd, queue, index as usize)
                .map_err(|e| {
                    AppError::VideoError(format!("Failed to query buffer {}: {}", index, e))
                })?;

            if query.planes.is_empty() {
                return Err(AppError::VideoError(format!(
                    "Driver returned zero planes for buffer {}",
                    index
                )));
            }

            let mut plane_maps = Vec::with_capacity(query.planes.len());
            for plane in &query.planes {
                let mapping = ioctl::mmap(&fd, plane.mem_offset, plane.length).map_err(|e| {
                    AppError::VideoError(format!("Failed to mmap buffer {}: {}", index, e))
                })?;
                plane_maps.push(mapping);
            }
            mappings.push(plane_maps);
        }

        let ledger = BufferLedger::new(allocated);
        let mut stream = Self {
            fd,
            device_path,
            queue,
            negotiated: NegotiatedFormat {
                resolution,
                pixel_format: format,
                stride,
            },
            timeout,
            mappings,
            ledger,
            streaming: false,
        };

        for index in 0..allocated as u32 {
            stream.queue_buffer(index)?;
            stream.ledger.to_driver(index as usize)?;
        }

        ioctl::streamon(&stream.fd, stream.queue).map_err(|e| {
            AppError::VideoError(format!("Failed to start capture stream: {}", e))
        })?;
        stream.streaming = true;

        info!(
            "capture streaming on {}: {} {} stride {} ({} buffers)",
            stream.device_path.display(),
            resolution,
            format,
            stride,
            allocated
        );

        Ok(stream)
    }

    pub fn negotiated(&self) -> NegotiatedFormat {
        self.negotiated
    }

    /// Dequeue the next filled buffer.
    ///
    /// On success the returned view's buffer belongs to the pipeline until
    /// [`release`](Self::release) is called with its index. Poll expiry is a
    /// `Timeout` error; a vanished device is `Disconnected`.
    pub fn next_frame(&mut self) -> Result<FrameView<'_>> {
        self.wait_ready()?;

        let dqbuf: V4l2Buffer = ioctl::dqbuf(&self.fd, self.queue)
            .map_err(|e| self.classify_stream_error("dqbuf", &e.to_string()))?;

        let raw = dqbuf.as_v4l2_buffer();
        let index = raw.index as usize;
        let sequence = raw.sequence as u64;
        let pts_us =
            raw.timestamp.tv_sec as i64 * 1_000_000 + raw.timestamp.tv_usec as i64;

        self.ledger.to_pipeline(index)?;

        let mut planes = Vec::with_capacity(self.mappings[index].len());
        for (plane_idx, plane) in dqbuf.planes_iter().enumerate() {
            let bytes_used = *plane.bytesused as usize;
            let data_offset = plane.data_offset.copied().unwrap_or(0) as usize;
            if bytes_used == 0 {
                continue;
            }
            let mapping = &self.mappings[index][plane_idx];
            let start = data_offset.min(mapping.len());
            let end = (data_offset + bytes_used).min(mapping.len());
            planes.push(&mapping[start..end]);
        }

        Ok(FrameView {
            index: index as u32,
            sequence,
            pts_us,
            planes,
        })
    }

    /// Return a buffer to the driver once the pipeline is done with it.
    ///
    /// Must be called exactly once per dequeued frame, on every exit path:
    /// a leaked index starves the pool and capture stalls permanently.
    pub fn release(&mut self, index: u32) -> Result<()> {
        self.ledger.to_driver(index as usize)?;
        self.queue_buffer(index)
    }

    /// Buffer indices currently held by the pipeline.
    pub fn outstanding(&self) -> usize {
        self.ledger.pipeline_held()
    }

    /// Stop streaming and hand all buffers back to the driver. Idempotent;
    /// also runs on drop.
    pub fn close(&mut self) {
        if !self.streaming {
            return;
        }
        let held = self.outstanding();
        if held > 0 {
            debug!("closing capture with {} buffers still held", held);
        }
        if let Err(e) = ioctl::streamoff(&self.fd, self.queue) {
            debug!("Failed to stop capture stream: {}", e);
        }
        self.streaming = false;
    }

    fn wait_ready(&self) -> Result<()> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let timeout_ms = self.timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms))
            .map_err(|e| self.classify_stream_error("poll", &e.to_string()))?;
        if ready == 0 {
            return Err(AppError::Timeout {
                device: self.device_path.display().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        if let Some(revents) = fds[0].revents() {
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                return Err(self.device_lost("poll reported device error"));
            }
        }
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        let handle = MmapHandle::default();
        let planes = self.mappings[index as usize]
            .iter()
            .map(|mapping| {
                let mut plane = QBufPlane::new_from_handle(&handle, 0);
                plane.0.length = mapping.len() as u32;
                plane
            })
            .collect();
        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(self.queue, index);
        qbuf.planes = planes;
        ioctl::qbuf::<_, ()>(&self.fd, qbuf)
            .map_err(|e| self.classify_stream_error("qbuf", &e.to_string()))?;
        Ok(())
    }

    /// Decide whether an ioctl failure means the device is gone.
    fn classify_stream_error(&self, op: &str, detail: &str) -> AppError {
        if !self.device_path.exists() {
            return self.device_lost("device node removed");
        }
        for (errno, name) in DEVICE_LOST_ERRNOS {
            if detail.contains(&format!("os error {}", errno)) || detail.contains(name) {
                return self.device_lost(detail);
            }
        }
        AppError::VideoError(format!("{} failed: {}", op, detail))
    }

    fn device_lost(&self, reason: &str) -> AppError {
        AppError::Disconnected {
            device: self.device_path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_fps(fd: &File, queue: QueueType, fps: u32) -> Result<()> {
    let mut params = unsafe { std::mem::zeroed::<v4l2_streamparm>() };
    params.type_ = queue as u32;
    params.parm = v4l2_streamparm__bindgen_ty_1 {
        capture: v4l2r::bindings::v4l2_captureparm {
            timeperframe: v4l2r::bindings::v4l2_fract {
                numerator: 1,
                denominator: fps,
            },
            ..unsafe { std::mem::zeroed() }
        },
    };

    let _actual: v4l2_streamparm = ioctl::s_parm(fd, params)
        .map_err(|e| AppError::VideoError(format!("Failed to set FPS: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_tracks_dequeue_and_release() {
        let mut ledger = BufferLedger::new(2);
        assert_eq!(ledger.pipeline_held(), 2);

        ledger.to_driver(0).unwrap();
        ledger.to_driver(1).unwrap();
        assert_eq!(ledger.pipeline_held(), 0);

        ledger.to_pipeline(1).unwrap();
        assert_eq!(ledger.pipeline_held(), 1);
        ledger.to_driver(1).unwrap();
        assert_eq!(ledger.pipeline_held(), 0);
    }

    #[test]
    fn ledger_rejects_double_release() {
        let mut ledger = BufferLedger::new(1);
        ledger.to_driver(0).unwrap();
        assert!(ledger.to_driver(0).is_err());
    }

    #[test]
    fn ledger_rejects_duplicate_dequeue() {
        let mut ledger = BufferLedger::new(1);
        ledger.to_driver(0).unwrap();
        ledger.to_pipeline(0).unwrap();
        assert!(ledger.to_pipeline(0).is_err());
    }

    #[test]
    fn ledger_rejects_out_of_range_index() {
        let mut ledger = BufferLedger::new(1);
        assert!(ledger.to_pipeline(5).is_err());
        assert!(ledger.to_driver(5).is_err());
    }
}
