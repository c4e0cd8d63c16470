//! Capture-to-HLS session lifecycle.
//!
//! A session owns one capture device and runs the blocking
//! capture/encode/segment loop on a dedicated thread. The registry hands
//! out sessions keyed by resolved device path, so two sessions can never
//! fight over the same device.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tracing::{error, info, warn};

use crate::error::{AppError, Result};
use crate::hls::{Segmenter, SegmenterConfig, TsFileSink};
use crate::utils::LogThrottler;
use crate::video::encoder::validate_gop_alignment;
use crate::video::{
    CaptureStream, EncoderConfig, H264Encoder, PixelFormat, Resolution, SubmitOutcome,
};

/// Attempts to open a device that reports busy before giving up.
const OPEN_RETRIES: u32 = 5;
const OPEN_RETRY_DELAY_MS: u64 = 200;

/// Reconnect policy after the device disappears mid-stream.
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_DELAY_MS: u64 = 200;
const RECONNECT_MAX_DELAY_MS: u64 = 5_000;

static INIT: std::sync::Once = std::sync::Once::new();

/// One-time process setup. The linked codec libraries register themselves
/// on load, so this reduces to logging the capture device inventory.
/// Subsequent calls are no-ops.
pub fn initialize() {
    INIT.call_once(|| match crate::video::locate::enumerate_devices() {
        Ok(devices) => info!("pipeline ready, {} capture devices present", devices.len()),
        Err(e) => warn!("device scan failed during startup: {}", e),
    });
}

/// Session configuration, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub device_path: PathBuf,
    pub output_dir: PathBuf,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub gop: u32,
    pub segment_seconds: u32,
    pub window: usize,
    pub buffer_count: u32,
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            output_dir: PathBuf::from("."),
            resolution: Resolution::HD1080,
            format: PixelFormat::Yuyv,
            fps: 60,
            bitrate_kbps: 4_000,
            gop: 60,
            segment_seconds: 10,
            window: 6,
            buffer_count: 4,
            timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(AppError::InvalidOutput);
        }
        if !self.resolution.is_valid() {
            return Err(AppError::EncoderInit(format!(
                "unsupported resolution {}",
                self.resolution
            )));
        }
        if self.window == 0 {
            return Err(AppError::VideoError(
                "playlist window must hold at least one segment".into(),
            ));
        }
        validate_gop_alignment(self.fps, self.gop, self.segment_seconds)
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, loop not yet scheduled.
    Idle,
    /// Opening (or re-opening) the capture device.
    Opening,
    /// Frames flowing end to end.
    Streaming,
    /// Stop requested; flushing encoder and tail segment.
    Draining,
    /// Finished cleanly.
    Stopped,
    /// Ended with an unrecoverable error.
    Failed,
}

impl SessionState {
    /// Whether the session still holds its device.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::Opening
                | SessionState::Streaming
                | SessionState::Draining
        )
    }
}

/// A running capture-to-HLS session.
pub struct Session {
    device_path: PathBuf,
    state: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    fn new(device_path: PathBuf) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Self {
            device_path,
            state: Arc::new(state_tx),
            state_rx,
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Request a drain and wait for the loop to finish.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping session on {}", self.device_path.display());
        self.stop_flag.store(true, Ordering::SeqCst);

        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait(&self) -> SessionState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow();
            if !state.is_active() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

/// Tracks which devices have a session, keyed by device path.
pub struct Registry {
    sessions: parking_lot::Mutex<HashMap<PathBuf, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Start a session for `config.device_path`.
    ///
    /// Fails with `DeviceBusy` while another session for the same device is
    /// still active; a finished session's slot is reclaimed. The device,
    /// encoder, and sink are all opened before this returns, so open-time
    /// failures (`DeviceNotFound`, `FormatNegotiation`, `EncoderInit`,
    /// `MuxerInit`, `InvalidOutput`) come back as the error value and the
    /// registry slot is freed.
    pub async fn start(&self, config: PipelineConfig) -> Result<Arc<Session>> {
        config.validate()?;

        let session = self.claim(&config.device_path)?;

        let _ = session.state.send(SessionState::Opening);
        let state = session.state.clone();
        let stop_flag = session.stop_flag.clone();

        // The worker thread owns the device and the encoder for its whole
        // life, so the open phase runs there too and reports back over a
        // oneshot before the streaming loop begins.
        let (open_tx, open_rx) = oneshot::channel();
        let handle = tokio::task::spawn_blocking(move || {
            let pipeline = match open_pipeline(&config, &stop_flag) {
                Ok(pipeline) => {
                    let _ = open_tx.send(Ok(()));
                    pipeline
                }
                Err(e) => {
                    let _ = state.send(SessionState::Failed);
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
            session_loop(config, pipeline, state, stop_flag);
        });
        *session.handle.lock().await = Some(handle);

        match open_rx.await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AppError::VideoError(
                "session worker exited before opening the device".to_string(),
            )),
        }
    }

    fn claim(&self, device_path: &Path) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(device_path) {
            if existing.state().is_active() {
                return Err(AppError::DeviceBusy(device_path.display().to_string()));
            }
        }
        let session = Arc::new(Session::new(device_path.to_path_buf()));
        sessions.insert(device_path.to_path_buf(), session.clone());
        Ok(session)
    }

    /// Sessions that still hold their device.
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.state().is_active())
            .count()
    }

    /// Stop every session and wait for each to drain.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            if let Err(e) = session.stop().await {
                warn!(
                    "failed to stop session on {}: {}",
                    session.device_path.display(),
                    e
                );
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture, encoder, and sink for one session, opened as a unit so that
/// `start` can surface any open-time failure before the loop spawns.
struct SessionPipeline {
    stream: CaptureStream,
    encoder: H264Encoder,
    segmenter: Segmenter<TsFileSink>,
}

fn open_pipeline(config: &PipelineConfig, stop_flag: &AtomicBool) -> Result<SessionPipeline> {
    if !config.device_path.exists() {
        return Err(AppError::DeviceNotFound(
            config.device_path.display().to_string(),
        ));
    }

    let encoder = H264Encoder::open(EncoderConfig {
        resolution: config.resolution,
        fps: config.fps,
        bitrate_kbps: config.bitrate_kbps,
        gop: config.gop,
    })?;

    let sink = TsFileSink::new(&config.output_dir, encoder.codec_parameters())?;
    let segmenter = Segmenter::new(
        sink,
        SegmenterConfig {
            segment_seconds: config.segment_seconds,
            window: config.window,
            frame_duration_us: 1_000_000 / config.fps.max(1) as i64,
        },
    );

    let stream = open_capture(config, stop_flag)?;

    Ok(SessionPipeline {
        stream,
        encoder,
        segmenter,
    })
}

/// Blocking session body; translates the loop result into a terminal state.
fn session_loop(
    config: PipelineConfig,
    pipeline: SessionPipeline,
    state: Arc<watch::Sender<SessionState>>,
    stop_flag: Arc<AtomicBool>,
) {
    match run_session(&config, pipeline, &state, &stop_flag) {
        Ok(()) => {
            let _ = state.send(SessionState::Stopped);
        }
        Err(e) => {
            error!("session on {} failed: {}", config.device_path.display(), e);
            let _ = state.send(SessionState::Failed);
        }
    }
}

fn run_session(
    config: &PipelineConfig,
    pipeline: SessionPipeline,
    state: &watch::Sender<SessionState>,
    stop_flag: &AtomicBool,
) -> Result<()> {
    let SessionPipeline {
        mut stream,
        mut encoder,
        mut segmenter,
    } = pipeline;
    let mut units = Vec::new();

    loop {
        let result = stream_frames(config, state, stop_flag, &mut stream, &mut encoder, &mut segmenter, &mut units);

        match result {
            Ok(()) => break,
            Err(e) if !e.is_session_fatal() => {
                warn!("capture lost: {}", e);
                drop(stream);

                // Publish what we have; the buffered tail is still valid
                // video and players would otherwise lose it.
                for unit in encoder.finish()? {
                    segmenter.push(&unit)?;
                }
                segmenter.flush_partial()?;
                segmenter.mark_discontinuity();

                stream = reconnect(config, stop_flag).map_err(|reconnect_err| {
                    segmenter.abort();
                    reconnect_err
                })?;

                // Fresh encoder: the driver clock restarted, and carrying
                // the old dts history across the jump would wedge the clamp.
                encoder = H264Encoder::open(EncoderConfig {
                    resolution: config.resolution,
                    fps: config.fps,
                    bitrate_kbps: config.bitrate_kbps,
                    gop: config.gop,
                })?;
            }
            Err(e) => {
                segmenter.abort();
                return Err(e);
            }
        }
    }

    // Drain: flush the encoder and publish the tail segment.
    let _ = state.send(SessionState::Draining);
    for unit in encoder.finish()? {
        segmenter.push(&unit)?;
    }
    segmenter.finish()?;
    info!(
        "session on {} drained ({} segments)",
        config.device_path.display(),
        segmenter.segments_published()
    );
    Ok(())
}

/// Inner frame loop. Returns Ok on stop request, Err on any capture or
/// downstream failure.
fn stream_frames(
    config: &PipelineConfig,
    state: &watch::Sender<SessionState>,
    stop_flag: &AtomicBool,
    stream: &mut CaptureStream,
    encoder: &mut H264Encoder,
    segmenter: &mut Segmenter<TsFileSink>,
    units: &mut Vec<crate::video::EncodedAccessUnit>,
) -> Result<()> {
    let _ = state.send(SessionState::Streaming);
    let negotiated = stream.negotiated();
    let drop_throttler = LogThrottler::with_secs(5);

    while !stop_flag.load(Ordering::Relaxed) {
        let view = stream.next_frame()?;
        let index = view.index;
        let pts_us = view.pts_us;

        // Signal glitches on capture hardware surface as dequeued buffers
        // with zero or truncated bytesused; drop the frame, not the session.
        if frame_too_short(negotiated.pixel_format, negotiated.resolution, &view.planes) {
            if drop_throttler.should_log("short_frame") {
                warn!(
                    "dropping short frame from {} ({} bytes)",
                    config.device_path.display(),
                    frame_bytes(&view.planes)
                );
            }
            drop(view);
            stream.release(index)?;
            continue;
        }

        // Submit while the view borrows the mmap buffer; the encoder copies
        // the planes out, so the buffer can go back to the driver right
        // after, whatever the outcome.
        let mut drained = false;
        let submit_result = loop {
            match encoder.submit(
                config.format,
                negotiated.stride as usize,
                &view.planes,
                pts_us,
            ) {
                Ok(SubmitOutcome::Accepted) => break Ok(()),
                Ok(SubmitOutcome::Backpressure) if !drained => {
                    // Only free the encoder's output queue here; the units
                    // go to the segmenter after the buffer is released.
                    if let Err(e) = encoder.collect(units) {
                        break Err(e);
                    }
                    drained = true;
                }
                Ok(SubmitOutcome::Backpressure) => {
                    // Still refusing with nothing left to drain; dropping
                    // one frame beats stalling the whole buffer pool.
                    if drop_throttler.should_log("frame_drop") {
                        warn!("encoder refused frame after drain, dropping");
                    }
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        drop(view);
        stream.release(index)?;
        submit_result?;

        encoder.collect(units)?;
        for unit in units.drain(..) {
            segmenter.push(&unit)?;
        }
    }

    Ok(())
}

fn frame_bytes(planes: &[&[u8]]) -> usize {
    planes.iter().map(|p| p.len()).sum()
}

/// A complete frame carries at least the packed frame size for the
/// negotiated format; anything smaller is a per-frame capture glitch.
fn frame_too_short(format: PixelFormat, resolution: Resolution, planes: &[&[u8]]) -> bool {
    frame_bytes(planes) < format.frame_size(resolution)
}

/// Open the capture device, retrying while the driver reports busy.
fn open_capture(config: &PipelineConfig, stop_flag: &AtomicBool) -> Result<CaptureStream> {
    let mut last_error = None;

    for attempt in 0..OPEN_RETRIES {
        if stop_flag.load(Ordering::Relaxed) {
            return Err(AppError::VideoError("stopped during open".to_string()));
        }

        match CaptureStream::open(
            &config.device_path,
            config.resolution,
            config.format,
            config.fps,
            config.buffer_count,
            config.timeout,
        ) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                let message = e.to_string();
                if message.contains("busy") || message.contains("resource") {
                    warn!(
                        "device busy on attempt {}/{}, retrying in {}ms",
                        attempt + 1,
                        OPEN_RETRIES,
                        OPEN_RETRY_DELAY_MS
                    );
                    std::thread::sleep(Duration::from_millis(OPEN_RETRY_DELAY_MS));
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| AppError::VideoError("failed to open device".to_string())))
}

/// Bounded exponential backoff after the device disappeared.
fn reconnect(config: &PipelineConfig, stop_flag: &AtomicBool) -> Result<CaptureStream> {
    let mut last_error = AppError::Disconnected {
        device: config.device_path.display().to_string(),
        reason: "device lost".to_string(),
    };

    for (attempt, delay_ms) in reconnect_delays().enumerate() {
        if stop_flag.load(Ordering::Relaxed) {
            return Err(last_error);
        }
        info!(
            "reconnect attempt {}/{} in {}ms",
            attempt + 1,
            RECONNECT_ATTEMPTS,
            delay_ms
        );
        std::thread::sleep(Duration::from_millis(delay_ms));

        match open_capture(config, stop_flag) {
            Ok(stream) => {
                info!("capture recovered on {}", config.device_path.display());
                return Ok(stream);
            }
            Err(e) => {
                warn!("reconnect failed: {}", e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

fn reconnect_delays() -> impl Iterator<Item = u64> {
    (0..RECONNECT_ATTEMPTS)
        .map(|attempt| (RECONNECT_BASE_DELAY_MS << attempt).min(RECONNECT_MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_doubles_and_caps() {
        let delays: Vec<u64> = reconnect_delays().collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200]);
        assert!(delays.iter().all(|d| *d <= RECONNECT_MAX_DELAY_MS));
    }

    #[test]
    fn active_states_hold_the_device() {
        assert!(SessionState::Opening.is_active());
        assert!(SessionState::Streaming.is_active());
        assert!(SessionState::Draining.is_active());
        assert!(!SessionState::Stopped.is_active());
        assert!(!SessionState::Failed.is_active());
    }

    #[test]
    fn registry_rejects_second_session_for_same_device() {
        let registry = Registry::new();
        let path = PathBuf::from("/dev/video9");

        let first = registry.claim(&path).unwrap();
        assert_eq!(registry.active_count(), 1);

        match registry.claim(&path) {
            Err(AppError::DeviceBusy(dev)) => assert_eq!(dev, "/dev/video9"),
            other => panic!("expected DeviceBusy, got {:?}", other.map(|s| s.state())),
        }

        // Once the first session ends, the slot is reclaimable.
        let _ = first.state.send(SessionState::Stopped);
        assert_eq!(registry.active_count(), 0);
        registry.claim(&path).unwrap();
    }

    #[test]
    fn distinct_devices_do_not_conflict() {
        let registry = Registry::new();
        registry.claim(Path::new("/dev/video0")).unwrap();
        registry.claim(Path::new("/dev/video1")).unwrap();
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn config_validation_catches_misaligned_gop() {
        let config = PipelineConfig {
            fps: 25,
            gop: 60,
            segment_seconds: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn config_validation_rejects_empty_output_dir() {
        let config = PipelineConfig {
            output_dir: PathBuf::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidOutput)));

        // Missing output wins over any other config problem.
        let config = PipelineConfig {
            output_dir: PathBuf::new(),
            resolution: Resolution::new(1, 1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidOutput)));
    }

    #[test]
    fn short_frames_are_dropped_not_fatal() {
        let full = vec![0u8; PixelFormat::Yuyv.frame_size(Resolution::VGA)];
        assert!(!frame_too_short(
            PixelFormat::Yuyv,
            Resolution::VGA,
            &[&full]
        ));
        // Zero bytesused on signal loss.
        assert!(frame_too_short(PixelFormat::Yuyv, Resolution::VGA, &[]));
        assert!(frame_too_short(PixelFormat::Yuyv, Resolution::VGA, &[&[]]));
        // Truncated by one byte.
        assert!(frame_too_short(
            PixelFormat::Yuyv,
            Resolution::VGA,
            &[&full[..full.len() - 1]]
        ));
    }

    #[tokio::test]
    async fn start_surfaces_missing_device_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let config = PipelineConfig {
            device_path: dir.path().join("video-none"),
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        match registry.start(config).await {
            Err(AppError::DeviceNotFound(device)) => {
                assert!(device.ends_with("video-none"));
            }
            Ok(_) => panic!("start succeeded without a device"),
            Err(other) => panic!("expected DeviceNotFound, got {}", other),
        }
        // The failed open frees the slot.
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn config_validation_rejects_zero_window() {
        let config = PipelineConfig {
            window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn initialize_is_idempotent() {
        initialize();
        initialize();
    }

    #[tokio::test]
    async fn wait_returns_on_terminal_state() {
        let session = Session::new(PathBuf::from("/dev/video0"));
        let _ = session.state.send(SessionState::Failed);
        assert_eq!(session.wait().await, SessionState::Failed);
    }
}
