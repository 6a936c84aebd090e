//! Track location within a demultiplexed source.

use reframe_common::error::ReframeResult;

use crate::capability::{Demuxer, SeekMode};
use crate::format::{MediaFormat, MediaKind};

/// The track a pipeline will consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    /// Index of the track in the source container.
    pub track_index: usize,
    /// Mime type the decoder must be created for.
    pub mime: String,
    pub format: MediaFormat,
}

impl TrackDescriptor {
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_mime(&self.mime)
    }
}

/// Find the first track of `kind`.
///
/// On a match the demuxer is left with that track selected and positioned on
/// the key frame at or before time zero. `Ok(None)` means the source has no
/// such track, which callers treat as nothing to do.
pub fn locate_track(
    demuxer: &mut dyn Demuxer,
    kind: MediaKind,
) -> ReframeResult<Option<TrackDescriptor>> {
    let prefix = kind.mime_prefix();
    for index in 0..demuxer.track_count() {
        let format = demuxer.track_format(index)?;
        if !format.mime.starts_with(prefix) {
            continue;
        }

        demuxer.select_track(index)?;
        demuxer.seek_to(0, SeekMode::PreviousSync)?;
        tracing::debug!(%kind, track = index, mime = %format.mime, "Located track");
        return Ok(Some(TrackDescriptor {
            track_index: index,
            mime: format.mime.clone(),
            format,
        }));
    }

    tracing::info!(%kind, "Source has no track of this kind");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{mime, Sample};
    use reframe_common::error::ReframeError;

    struct ListDemuxer {
        formats: Vec<MediaFormat>,
        selected: Option<usize>,
        seeks: Vec<(i64, SeekMode)>,
    }

    impl Demuxer for ListDemuxer {
        fn track_count(&self) -> usize {
            self.formats.len()
        }

        fn track_format(&self, index: usize) -> ReframeResult<MediaFormat> {
            self.formats
                .get(index)
                .cloned()
                .ok_or_else(|| ReframeError::demux("no such track"))
        }

        fn select_track(&mut self, index: usize) -> ReframeResult<()> {
            self.selected = Some(index);
            Ok(())
        }

        fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> ReframeResult<()> {
            self.seeks.push((time_us, mode));
            Ok(())
        }

        fn read_sample(&mut self) -> ReframeResult<Option<Sample>> {
            Ok(None)
        }

        fn advance(&mut self) -> bool {
            false
        }

        fn release(&mut self) {}
    }

    fn demuxer(formats: Vec<MediaFormat>) -> ListDemuxer {
        ListDemuxer {
            formats,
            selected: None,
            seeks: Vec::new(),
        }
    }

    #[test]
    fn picks_first_matching_track_and_seeks_to_start() {
        let mut d = demuxer(vec![
            MediaFormat::audio(mime::AUDIO_AAC, 48_000, 2),
            MediaFormat::video(mime::VIDEO_AVC, 1920, 1080),
            MediaFormat::video(mime::VIDEO_HEVC, 640, 480),
        ]);

        let track = locate_track(&mut d, MediaKind::Video).unwrap().unwrap();
        assert_eq!(track.track_index, 1);
        assert_eq!(track.mime, mime::VIDEO_AVC);
        assert_eq!(track.kind(), Some(MediaKind::Video));
        assert_eq!(d.selected, Some(1));
        assert_eq!(d.seeks, vec![(0, SeekMode::PreviousSync)]);
    }

    #[test]
    fn missing_kind_is_not_an_error() {
        let mut d = demuxer(vec![MediaFormat::video(mime::VIDEO_VP9, 320, 240)]);
        assert!(locate_track(&mut d, MediaKind::Audio).unwrap().is_none());
        assert_eq!(d.selected, None);
        assert!(d.seeks.is_empty());
    }
}
