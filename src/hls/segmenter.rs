//! Segment rotation over a stream of encoded access units.
//!
//! Segments always begin with a keyframe and are only rotated at a
//! keyframe whose pts has reached the target boundary, so every published
//! file is independently decodable. A sliding window of recent segments is
//! kept in the playlist; older files are removed.

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::error::Result;
use crate::hls::playlist::{self, SegmentInfo};
use crate::hls::sink::{segment_filename, SegmentSink};
use crate::utils::LogThrottler;
use crate::video::EncodedAccessUnit;

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub segment_seconds: u32,
    /// Number of segments kept in the playlist and on disk.
    pub window: usize,
    /// Nominal duration of one frame, used to size the tail segment.
    pub frame_duration_us: i64,
}

struct CurrentSegment {
    start_pts_us: i64,
    last_pts_us: i64,
    discontinuity: bool,
}

/// Splits encoded access units into fixed-length, keyframe-aligned segments.
pub struct Segmenter<S: SegmentSink> {
    sink: S,
    config: SegmenterConfig,
    target_us: i64,
    sequence: u64,
    media_sequence: u64,
    window_segments: VecDeque<SegmentInfo>,
    current: Option<CurrentSegment>,
    pending_discontinuity: bool,
    preroll_dropped: u64,
    drop_throttler: LogThrottler,
}

impl<S: SegmentSink> Segmenter<S> {
    pub fn new(sink: S, config: SegmenterConfig) -> Self {
        Self {
            sink,
            config,
            target_us: config.segment_seconds as i64 * 1_000_000,
            sequence: 0,
            media_sequence: 0,
            window_segments: VecDeque::new(),
            current: None,
            pending_discontinuity: false,
            preroll_dropped: 0,
            drop_throttler: LogThrottler::with_secs(5),
        }
    }

    /// Feed the next access unit.
    ///
    /// Units arriving before the first keyframe are dropped; a segment that
    /// started with anything else would not be independently playable.
    pub fn push(&mut self, unit: &EncodedAccessUnit) -> Result<()> {
        match &mut self.current {
            None => {
                if !unit.keyframe {
                    self.preroll_dropped += 1;
                    if self.drop_throttler.should_log("preroll_drop") {
                        warn!(
                            "dropping non-keyframe units before segment start ({} so far)",
                            self.preroll_dropped
                        );
                    }
                    return Ok(());
                }
                self.begin_segment(unit.pts_us)?;
            }
            Some(current) => {
                if unit.keyframe && unit.pts_us - current.start_pts_us >= self.target_us {
                    self.close_segment(unit.pts_us)?;
                    self.begin_segment(unit.pts_us)?;
                }
            }
        }

        self.sink.write(unit)?;
        if let Some(current) = &mut self.current {
            current.last_pts_us = unit.pts_us;
        }
        Ok(())
    }

    /// Mark the next published segment as discontinuous with its
    /// predecessor. Called after capture recovery, where the driver clock
    /// may have jumped.
    pub fn mark_discontinuity(&mut self) {
        self.pending_discontinuity = true;
    }

    /// Publish whatever is in flight, typically before a reconnect attempt.
    /// The partial segment is shorter than the target but still starts on a
    /// keyframe, so players handle it fine.
    pub fn flush_partial(&mut self) -> Result<()> {
        let end = match &self.current {
            Some(current) => current.last_pts_us + self.config.frame_duration_us,
            None => return Ok(()),
        };
        self.close_segment(end)
    }

    /// Finish the stream: publish the tail segment and the final playlist.
    pub fn finish(&mut self) -> Result<()> {
        self.flush_partial()?;
        let rendered = playlist::ended_playlist(
            self.window_segments.make_contiguous(),
            self.media_sequence,
        );
        self.sink.publish_playlist(&rendered)?;
        info!("stream finished after {} segments", self.sequence);
        Ok(())
    }

    /// Drop the open segment without publishing, on fatal errors.
    pub fn abort(&mut self) {
        self.current = None;
        let _ = self.sink.discard();
    }

    pub fn segments_published(&self) -> u64 {
        self.sequence
    }

    fn begin_segment(&mut self, start_pts_us: i64) -> Result<()> {
        self.sink.begin(self.sequence)?;
        self.current = Some(CurrentSegment {
            start_pts_us,
            last_pts_us: start_pts_us,
            discontinuity: std::mem::take(&mut self.pending_discontinuity),
        });
        Ok(())
    }

    fn close_segment(&mut self, end_pts_us: i64) -> Result<()> {
        let current = match self.current.take() {
            Some(c) => c,
            None => return Ok(()),
        };

        let filename = self.sink.publish()?;
        let duration = (end_pts_us - current.start_pts_us).max(0) as f32 / 1_000_000.0;
        debug_assert_eq!(filename, segment_filename(self.sequence));

        self.window_segments.push_back(SegmentInfo {
            sequence: self.sequence,
            filename,
            duration,
            discontinuity: current.discontinuity,
        });
        self.sequence += 1;

        while self.window_segments.len() > self.config.window {
            if let Some(expired) = self.window_segments.pop_front() {
                self.media_sequence = expired.sequence + 1;
                self.sink.remove(&expired.filename)?;
            }
        }

        let rendered = playlist::live_playlist(
            self.window_segments.make_contiguous(),
            self.media_sequence,
        );
        self.sink.publish_playlist(&rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::sink::MemorySink;
    use bytes::Bytes;

    fn unit(pts_ms: i64, keyframe: bool) -> EncodedAccessUnit {
        EncodedAccessUnit {
            pts_us: pts_ms * 1000,
            dts_us: pts_ms * 1000,
            keyframe,
            payload: Bytes::from_static(b"nal"),
        }
    }

    fn segmenter(segment_seconds: u32, window: usize) -> Segmenter<MemorySink> {
        Segmenter::new(
            MemorySink::new(),
            SegmenterConfig {
                segment_seconds,
                window,
                frame_duration_us: 33_333,
            },
        )
    }

    /// Feed `seconds` of 30 fps video with a keyframe every second.
    fn feed(seg: &mut Segmenter<MemorySink>, seconds: i64) {
        for frame in 0..seconds * 30 {
            let pts_ms = frame * 1000 / 30;
            seg.push(&unit(pts_ms, frame % 30 == 0)).unwrap();
        }
    }

    #[test]
    fn drops_units_before_first_keyframe() {
        let mut seg = segmenter(2, 4);
        seg.push(&unit(0, false)).unwrap();
        seg.push(&unit(33, false)).unwrap();
        assert!(seg.sink.open.is_none());

        seg.push(&unit(66, true)).unwrap();
        let (_, units) = seg.sink.open.as_ref().unwrap();
        assert_eq!(units.len(), 1);
        assert!(units[0].keyframe);
    }

    #[test]
    fn rotates_only_on_keyframe_at_or_past_boundary() {
        let mut seg = segmenter(2, 4);
        feed(&mut seg, 5);

        // 5 s of video with 2 s segments: two full segments published,
        // third still open.
        assert_eq!(seg.sink.published.len(), 2);
        let (_, first) = &seg.sink.published[0];
        assert!(first[0].keyframe);
        // Every published segment starts with a keyframe.
        for (_, units) in &seg.sink.published {
            assert!(units[0].keyframe);
        }
        // No rotation happened mid-gop: first segment spans exactly 2 s.
        assert_eq!(first.len(), 60);
    }

    #[test]
    fn segment_duration_comes_from_boundary_pts() {
        let mut seg = segmenter(2, 4);
        feed(&mut seg, 3);

        let playlist = seg.sink.playlists.last().unwrap();
        assert!(playlist.contains("#EXTINF:2.000,"), "got: {}", playlist);
    }

    #[test]
    fn window_trims_old_segments_and_advances_media_sequence() {
        let mut seg = segmenter(1, 2);
        feed(&mut seg, 5); // 4 published, window of 2

        assert_eq!(seg.sink.published.len(), 4);
        assert_eq!(
            seg.sink.removed,
            vec![segment_filename(0), segment_filename(1)]
        );
        let playlist = seg.sink.playlists.last().unwrap();
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2"));
        assert!(!playlist.contains(&segment_filename(0)));
        assert!(playlist.contains(&segment_filename(3)));
    }

    #[test]
    fn discontinuity_lands_on_next_published_segment() {
        let mut seg = segmenter(1, 4);
        feed(&mut seg, 2);
        seg.flush_partial().unwrap();
        seg.mark_discontinuity();

        // Recovery: timestamps restart from zero at a keyframe.
        seg.push(&unit(0, true)).unwrap();
        for frame in 1..40 {
            seg.push(&unit(frame * 1000 / 30, frame % 30 == 0)).unwrap();
        }

        let playlist = seg.sink.playlists.last().unwrap();
        let tag = playlist.find("#EXT-X-DISCONTINUITY").unwrap();
        let recovered = playlist
            .find(&segment_filename(2))
            .expect("post-recovery segment listed");
        assert!(tag < recovered);
    }

    #[test]
    fn finish_publishes_tail_segment_and_endlist() {
        let mut seg = segmenter(10, 4);
        feed(&mut seg, 3); // under one segment length
        assert!(seg.sink.published.is_empty());

        seg.finish().unwrap();

        assert_eq!(seg.sink.published.len(), 1);
        let playlist = seg.sink.playlists.last().unwrap();
        assert!(playlist.contains(&segment_filename(0)));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
        // Tail segment is shorter than the 10 s target: 90 frames at
        // 30 fps, last pts 2.966 s plus one frame duration.
        assert!(playlist.contains("#EXTINF:2.999"));
    }

    #[test]
    fn publish_failure_surfaces_as_error() {
        let mut seg = segmenter(1, 4);
        seg.sink.fail_next_publish = true;
        feed(&mut seg, 1);
        let err = seg.flush_partial();
        assert!(err.is_err());
    }
}
