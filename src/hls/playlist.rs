//! Live HLS media playlist rendering.

/// One published segment, as the playlist sees it.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub sequence: u64,
    pub filename: String,
    pub duration: f32,
    /// Set on the first segment after a capture recovery; tells players the
    /// timestamp continuity broke here.
    pub discontinuity: bool,
}

/// Render a live playlist over a sliding window of segments.
///
/// `media_sequence` is the sequence number of the first listed segment, so
/// players can track the window as old segments fall off. Live playlists
/// never carry `#EXT-X-ENDLIST`; [`ended_playlist`] appends it for the
/// final publish.
pub fn live_playlist(segments: &[SegmentInfo], media_sequence: u64) -> String {
    let target_duration = segments
        .iter()
        .map(|s| s.duration.ceil() as u32)
        .max()
        .unwrap_or(1);

    let mut playlist = format!(
        "#EXTM3U\n\
         #EXT-X-VERSION:3\n\
         #EXT-X-TARGETDURATION:{}\n\
         #EXT-X-MEDIA-SEQUENCE:{}\n",
        target_duration, media_sequence
    );

    for seg in segments {
        if seg.discontinuity {
            playlist.push_str("#EXT-X-DISCONTINUITY\n");
        }
        playlist.push_str(&format!("#EXTINF:{:.3},\n{}\n", seg.duration, seg.filename));
    }

    playlist
}

/// Render the final playlist for a stopped stream.
pub fn ended_playlist(segments: &[SegmentInfo], media_sequence: u64) -> String {
    let mut playlist = live_playlist(segments, media_sequence);
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(sequence: u64, duration: f32) -> SegmentInfo {
        SegmentInfo {
            sequence,
            filename: format!("segment_{:05}.ts", sequence),
            duration,
            discontinuity: false,
        }
    }

    #[test]
    fn live_playlist_lists_segments_in_order() {
        let segments = vec![seg(3, 10.0), seg(4, 10.0), seg(5, 9.5)];
        let playlist = live_playlist(&segments, 3);

        assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:10"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:3"));
        let a = playlist.find("segment_00003.ts").unwrap();
        let b = playlist.find("segment_00004.ts").unwrap();
        let c = playlist.find("segment_00005.ts").unwrap();
        assert!(a < b && b < c);
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn target_duration_is_ceiling_of_longest_segment() {
        let segments = vec![seg(0, 9.2), seg(1, 10.04)];
        let playlist = live_playlist(&segments, 0);
        assert!(playlist.contains("#EXT-X-TARGETDURATION:11"));
    }

    #[test]
    fn durations_render_with_millisecond_precision() {
        let playlist = live_playlist(&[seg(0, 9.96666)], 0);
        assert!(playlist.contains("#EXTINF:9.967,"));
    }

    #[test]
    fn discontinuity_tag_precedes_marked_segment() {
        let mut second = seg(1, 10.0);
        second.discontinuity = true;
        let playlist = live_playlist(&[seg(0, 10.0), second], 0);

        let tag = playlist.find("#EXT-X-DISCONTINUITY\n").unwrap();
        let first = playlist.find("segment_00000.ts").unwrap();
        let marked = playlist.find("segment_00001.ts").unwrap();
        assert!(first < tag && tag < marked);
    }

    #[test]
    fn ended_playlist_appends_endlist() {
        let playlist = ended_playlist(&[seg(0, 10.0)], 0);
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }
}
