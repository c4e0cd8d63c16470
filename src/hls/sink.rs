//! Segment storage.
//!
//! The segmenter drives a [`SegmentSink`]; the production sink muxes
//! access units into MPEG-TS files and publishes them atomically, while
//! tests swap in an in-memory sink to check rotation behavior without
//! touching ffmpeg or a filesystem.

use std::fs::File;
use std::path::{Path, PathBuf};

use ac_ffmpeg::codec::CodecParameters;
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::video::EncodedAccessUnit;

pub const PLAYLIST_NAME: &str = "stream.m3u8";

pub fn segment_filename(sequence: u64) -> String {
    format!("segment_{:05}.ts", sequence)
}

/// Where finished segments and playlists go.
///
/// At most one segment is open at a time: `begin`, any number of `write`s,
/// then exactly one of `publish` or `discard`.
pub trait SegmentSink {
    fn begin(&mut self, sequence: u64) -> Result<()>;
    fn write(&mut self, unit: &EncodedAccessUnit) -> Result<()>;
    /// Close the open segment and make it visible to players. Returns the
    /// published filename.
    fn publish(&mut self) -> Result<String>;
    /// Abandon the open segment without publishing it.
    fn discard(&mut self) -> Result<()>;
    /// Delete a segment that fell out of the playlist window.
    fn remove(&mut self, filename: &str) -> Result<()>;
    fn publish_playlist(&mut self, rendered: &str) -> Result<()>;
}

struct OpenSegment {
    muxer: Muxer<File>,
    tmp_path: PathBuf,
    filename: String,
}

/// MPEG-TS segment writer.
///
/// Segments are muxed into a dot-prefixed temp file and renamed into place
/// on publish, so a file named `segment_*.ts` is always complete. The
/// playlist is published the same way.
pub struct TsFileSink {
    dir: PathBuf,
    codec_parameters: CodecParameters,
    open: Option<OpenSegment>,
}

impl TsFileSink {
    pub fn new(dir: impl AsRef<Path>, codec_parameters: CodecParameters) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| AppError::SegmentWrite(format!("{}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            codec_parameters,
            open: None,
        })
    }

    fn atomic_write(&self, filename: &str, contents: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".{}.tmp", filename));
        let path = self.dir.join(filename);
        std::fs::write(&tmp, contents)
            .map_err(|e| AppError::SegmentWrite(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| AppError::SegmentWrite(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}

impl SegmentSink for TsFileSink {
    fn begin(&mut self, sequence: u64) -> Result<()> {
        if self.open.is_some() {
            return Err(AppError::SegmentWrite(
                "previous segment still open".to_string(),
            ));
        }

        let filename = segment_filename(sequence);
        let tmp_path = self.dir.join(format!(".{}.tmp", filename));
        let file = File::create(&tmp_path)
            .map_err(|e| AppError::SegmentWrite(format!("{}: {}", tmp_path.display(), e)))?;

        let output_format = OutputFormat::find_by_name("mpegts")
            .ok_or_else(|| AppError::MuxerInit("mpegts muxer not available".to_string()))?;

        let io = IO::from_seekable_write_stream(file);
        let mut builder = Muxer::builder();
        builder
            .add_stream(&self.codec_parameters)
            .map_err(|e| AppError::MuxerInit(e.to_string()))?;
        let muxer = builder
            .build(io, output_format)
            .map_err(|e| AppError::MuxerInit(e.to_string()))?;

        self.open = Some(OpenSegment {
            muxer,
            tmp_path,
            filename,
        });
        Ok(())
    }

    fn write(&mut self, unit: &EncodedAccessUnit) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| AppError::SegmentWrite("no open segment".to_string()))?;

        let tb = TimeBase::MICROSECONDS;
        let packet = PacketMut::from(unit.payload.as_ref())
            .with_time_base(tb)
            .with_pts(Timestamp::new(unit.pts_us, tb))
            .with_dts(Timestamp::new(unit.dts_us, tb))
            .freeze()
            .with_stream_index(0);

        open.muxer
            .push(packet)
            .map_err(|e| AppError::SegmentWrite(format!("{}: {}", open.filename, e)))
    }

    fn publish(&mut self) -> Result<String> {
        let mut open = self
            .open
            .take()
            .ok_or_else(|| AppError::SegmentWrite("no open segment".to_string()))?;

        open.muxer
            .flush()
            .map_err(|e| AppError::SegmentWrite(format!("{}: {}", open.filename, e)))?;
        // Dropping the muxer writes the container trailer and closes the file.
        drop(open.muxer);

        let path = self.dir.join(&open.filename);
        std::fs::rename(&open.tmp_path, &path)
            .map_err(|e| AppError::SegmentWrite(format!("{}: {}", path.display(), e)))?;

        debug!("published {}", open.filename);
        Ok(open.filename)
    }

    fn discard(&mut self) -> Result<()> {
        if let Some(open) = self.open.take() {
            drop(open.muxer);
            if let Err(e) = std::fs::remove_file(&open.tmp_path) {
                warn!("failed to remove {}: {}", open.tmp_path.display(), e);
            }
        }
        Ok(())
    }

    fn remove(&mut self, filename: &str) -> Result<()> {
        let path = self.dir.join(filename);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            // Already gone is fine; the window only shrinks.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::SegmentWrite(format!("{}: {}", path.display(), e))),
        }
    }

    fn publish_playlist(&mut self, rendered: &str) -> Result<()> {
        self.atomic_write(PLAYLIST_NAME, rendered.as_bytes())
    }
}

/// Records sink calls for rotation tests.
#[cfg(test)]
pub struct MemorySink {
    pub open: Option<(u64, Vec<EncodedAccessUnit>)>,
    pub published: Vec<(u64, Vec<EncodedAccessUnit>)>,
    pub removed: Vec<String>,
    pub playlists: Vec<String>,
    /// When set, the next publish fails once.
    pub fail_next_publish: bool,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self {
            open: None,
            published: Vec::new(),
            removed: Vec::new(),
            playlists: Vec::new(),
            fail_next_publish: false,
        }
    }
}

#[cfg(test)]
impl SegmentSink for MemorySink {
    fn begin(&mut self, sequence: u64) -> Result<()> {
        assert!(self.open.is_none(), "previous segment still open");
        self.open = Some((sequence, Vec::new()));
        Ok(())
    }

    fn write(&mut self, unit: &EncodedAccessUnit) -> Result<()> {
        self.open
            .as_mut()
            .expect("no open segment")
            .1
            .push(unit.clone());
        Ok(())
    }

    fn publish(&mut self) -> Result<String> {
        if self.fail_next_publish {
            self.fail_next_publish = false;
            self.open = None;
            return Err(AppError::SegmentWrite("injected failure".to_string()));
        }
        let (sequence, units) = self.open.take().expect("no open segment");
        let filename = segment_filename(sequence);
        self.published.push((sequence, units));
        Ok(filename)
    }

    fn discard(&mut self) -> Result<()> {
        self.open = None;
        Ok(())
    }

    fn remove(&mut self, filename: &str) -> Result<()> {
        self.removed.push(filename.to_string());
        Ok(())
    }

    fn publish_playlist(&mut self, rendered: &str) -> Result<()> {
        self.playlists.push(rendered.to_string());
        Ok(())
    }
}
