//! Native MPEG-4 muxer.
//!
//! Writes `ftyp`, then a 64-bit `mdat` that samples are appended to, then the
//! `moov` index when stopped. Each sample is its own chunk. Output is not
//! fast-start; run it through [`crate::faststart`] for progressive playback.

use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::Muxer;
use reframe_media::format::{BufferInfo, MediaFormat, MediaKind};

use crate::atoms::{
    begin_box, begin_full_box, end_box, write_box_header, FourCC, CO64, CTTS, DINF, DREF, FTYP,
    HANDLER_SOUND, HANDLER_VIDEO, HDLR, MDAT, MDHD, MDIA, MINF, MOOV, MVHD, SMHD, STBL, STCO,
    STSC, STSD, STSS, STSZ, STTS, TKHD, TRAK, URL, VMHD,
};
use crate::sample_entry::{is_supported, write_sample_entry};

pub const MOVIE_TIMESCALE: u32 = 1_000;
pub const VIDEO_TIMESCALE: u32 = 90_000;
/// Samples per AAC frame, used as the duration of a lone audio sample.
const AUDIO_FRAME_SAMPLES: u32 = 1_024;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];
/// ISO-639-2 "und", packed.
const LANGUAGE_UND: u16 = 0x55C4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    Configuring,
    Started,
    Stopped,
    Released,
}

#[derive(Debug, Clone, Copy)]
struct SampleRecord {
    offset: u64,
    size: u32,
    pts_us: i64,
    key: bool,
}

#[derive(Debug)]
struct MuxTrack {
    format: MediaFormat,
    kind: MediaKind,
    timescale: u32,
    samples: Vec<SampleRecord>,
}

pub struct Mp4Muxer {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    state: MuxState,
    tracks: Vec<MuxTrack>,
    mdat_offset: u64,
    position: u64,
}

impl Mp4Muxer {
    /// Create `path` and write the file type header.
    pub fn create(path: &Path) -> ReframeResult<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        let ftyp = ftyp_box()?;
        file.write_all(&ftyp)?;

        tracing::debug!(path = %path.display(), "Created MP4 muxer");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            state: MuxState::Configuring,
            tracks: Vec::new(),
            mdat_offset: 0,
            position: ftyp.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> ReframeResult<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| ReframeError::muxer("muxer has been released"))
    }
}

impl Muxer for Mp4Muxer {
    fn add_track(&mut self, format: &MediaFormat) -> ReframeResult<usize> {
        if self.state != MuxState::Configuring {
            return Err(ReframeError::muxer("tracks must be added before start"));
        }
        let kind = format.kind().ok_or_else(|| {
            ReframeError::unsupported(format!("cannot mux track of type {}", format.mime))
        })?;
        if !is_supported(&format.mime) {
            return Err(ReframeError::unsupported(format!(
                "MPEG-4 muxer does not support {}",
                format.mime
            )));
        }
        format.validate_for_muxing().map_err(ReframeError::muxer)?;

        let timescale = match kind {
            MediaKind::Video => VIDEO_TIMESCALE,
            MediaKind::Audio => format.sample_rate.unwrap_or(MOVIE_TIMESCALE),
        };
        self.tracks.push(MuxTrack {
            format: format.clone(),
            kind,
            timescale,
            samples: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> ReframeResult<()> {
        if self.state != MuxState::Configuring {
            return Err(ReframeError::muxer_start("muxer already started"));
        }
        if self.tracks.is_empty() {
            return Err(ReframeError::muxer_start("no tracks added"));
        }

        let offset = self.position;
        write_box_header(self.file()?, MDAT, 16, true)?;
        self.mdat_offset = offset;
        self.position += 16;
        self.state = MuxState::Started;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> ReframeResult<()> {
        if self.state != MuxState::Started {
            return Err(ReframeError::muxer("write_sample called while not started"));
        }
        if track >= self.tracks.len() {
            return Err(ReframeError::muxer(format!("no track with index {track}")));
        }
        if info.is_codec_config() || data.is_empty() {
            return Ok(());
        }
        let size = u32::try_from(data.len())
            .map_err(|_| ReframeError::muxer(format!("sample of {} bytes is too large", data.len())))?;

        self.file()?.write_all(data)?;
        let offset = self.position;
        self.position += size as u64;
        self.tracks[track].samples.push(SampleRecord {
            offset,
            size,
            pts_us: info.presentation_time_us,
            key: info.is_key_frame(),
        });
        Ok(())
    }

    fn stop(&mut self) -> ReframeResult<()> {
        if self.state != MuxState::Started {
            return Err(ReframeError::muxer("stop called before start"));
        }

        let mdat_size = self.position - self.mdat_offset;
        let mdat_size_pos = self.mdat_offset + 8;
        let moov = build_moov(&self.tracks)?;

        let file = self.file()?;
        file.seek(SeekFrom::Start(mdat_size_pos))?;
        file.write_u64::<BigEndian>(mdat_size)?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&moov)?;
        file.flush()?;

        self.position += moov.len() as u64;
        self.state = MuxState::Stopped;
        self.file = None;

        tracing::info!(
            path = %self.path.display(),
            tracks = self.tracks.len(),
            samples = self.tracks.iter().map(|t| t.samples.len()).sum::<usize>(),
            bytes = self.position,
            "MP4 finalized"
        );
        Ok(())
    }

    fn release(&mut self) {
        if self.state == MuxState::Started {
            tracing::warn!(path = %self.path.display(), "Releasing MP4 muxer without stop");
        }
        self.file = None;
        self.state = MuxState::Released;
    }
}

fn ftyp_box() -> ReframeResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    let pos = begin_box(&mut out, FTYP)?;
    out.write_all(b"isom")?;
    out.write_u32::<BigEndian>(0x200)?;
    for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
        out.write_all(brand)?;
    }
    end_box(&mut out, pos)?;
    Ok(out.into_inner())
}

fn us_to_ticks(us: i64, timescale: u32) -> i64 {
    ((us as i128 * timescale as i128 + 500_000).div_euclid(1_000_000)) as i64
}

fn ticks_to_movie(ticks: u64, timescale: u32) -> u64 {
    (ticks as u128 * MOVIE_TIMESCALE as u128 / timescale.max(1) as u128) as u64
}

/// Decode timing derived from presentation timestamps.
#[derive(Debug, PartialEq, Eq)]
struct TrackTiming {
    /// Decode-time deltas, one per sample.
    deltas: Vec<u32>,
    /// Presentation minus decode time, one per sample.
    composition_offsets: Vec<i64>,
    duration: u64,
}

impl TrackTiming {
    /// Decode times are the sorted presentation times rebased to zero, so
    /// reordered streams keep their presentation order through `ctts`.
    fn compute(track: &MuxTrack) -> Self {
        let pts: Vec<i64> = track
            .samples
            .iter()
            .map(|s| us_to_ticks(s.pts_us, track.timescale))
            .collect();
        if pts.is_empty() {
            return Self {
                deltas: Vec::new(),
                composition_offsets: Vec::new(),
                duration: 0,
            };
        }

        let mut dts = pts.clone();
        dts.sort_unstable();
        let base = dts[0];

        let default_delta = match track.kind {
            MediaKind::Video => track.timescale / track.format.frame_rate.unwrap_or(30).max(1),
            MediaKind::Audio => AUDIO_FRAME_SAMPLES,
        };
        let mut deltas: Vec<u32> = dts
            .windows(2)
            .map(|w| (w[1] - w[0]).clamp(0, u32::MAX as i64) as u32)
            .collect();
        deltas.push(deltas.last().copied().unwrap_or(default_delta));

        let composition_offsets = pts
            .iter()
            .zip(&dts)
            .map(|(p, d)| p - (d - base))
            .collect();
        let duration = deltas.iter().map(|d| *d as u64).sum();

        Self {
            deltas,
            composition_offsets,
            duration,
        }
    }
}

fn run_lengths<T: Copy + PartialEq>(values: &[T]) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for &value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}

fn build_moov(tracks: &[MuxTrack]) -> ReframeResult<Vec<u8>> {
    let timings: Vec<TrackTiming> = tracks.iter().map(TrackTiming::compute).collect();
    let movie_duration = tracks
        .iter()
        .zip(&timings)
        .map(|(t, timing)| ticks_to_movie(timing.duration, t.timescale))
        .max()
        .unwrap_or(0);

    let mut w = Cursor::new(Vec::new());
    let moov = begin_box(&mut w, MOOV)?;
    write_mvhd(&mut w, movie_duration, tracks.len() as u32 + 1)?;
    for (index, (track, timing)) in tracks.iter().zip(&timings).enumerate() {
        write_trak(&mut w, index as u32 + 1, track, timing)?;
    }
    end_box(&mut w, moov)?;
    Ok(w.into_inner())
}

type Out = Cursor<Vec<u8>>;

fn write_matrix(w: &mut Out) -> ReframeResult<()> {
    for value in UNITY_MATRIX {
        w.write_u32::<BigEndian>(value)?;
    }
    Ok(())
}

fn write_mvhd(w: &mut Out, duration: u64, next_track_id: u32) -> ReframeResult<()> {
    let pos = begin_full_box(w, MVHD, 0, 0)?;
    w.write_u32::<BigEndian>(0)?; // creation_time
    w.write_u32::<BigEndian>(0)?; // modification_time
    w.write_u32::<BigEndian>(MOVIE_TIMESCALE)?;
    w.write_u32::<BigEndian>(duration.min(u32::MAX as u64) as u32)?;
    w.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
    w.write_u16::<BigEndian>(0x0100)?; // volume 1.0
    w.write_all(&[0u8; 10])?;
    write_matrix(w)?;
    w.write_all(&[0u8; 24])?;
    w.write_u32::<BigEndian>(next_track_id)?;
    end_box(w, pos)
}

fn write_trak(w: &mut Out, track_id: u32, track: &MuxTrack, timing: &TrackTiming) -> ReframeResult<()> {
    let trak = begin_box(w, TRAK)?;

    let tkhd = begin_full_box(w, TKHD, 0, 0x3)?;
    w.write_u32::<BigEndian>(0)?;
    w.write_u32::<BigEndian>(0)?;
    w.write_u32::<BigEndian>(track_id)?;
    w.write_u32::<BigEndian>(0)?;
    let movie_duration = ticks_to_movie(timing.duration, track.timescale);
    w.write_u32::<BigEndian>(movie_duration.min(u32::MAX as u64) as u32)?;
    w.write_all(&[0u8; 8])?;
    w.write_u16::<BigEndian>(0)?; // layer
    w.write_u16::<BigEndian>(0)?; // alternate_group
    let volume = if track.kind == MediaKind::Audio { 0x0100 } else { 0 };
    w.write_u16::<BigEndian>(volume)?;
    w.write_u16::<BigEndian>(0)?;
    write_matrix(w)?;
    let (width, height) = match track.kind {
        MediaKind::Video => (
            track.format.width.unwrap_or(0),
            track.format.height.unwrap_or(0),
        ),
        MediaKind::Audio => (0, 0),
    };
    w.write_u32::<BigEndian>(width << 16)?;
    w.write_u32::<BigEndian>(height << 16)?;
    end_box(w, tkhd)?;

    let mdia = begin_box(w, MDIA)?;
    write_mdhd(w, track.timescale, timing.duration)?;
    write_hdlr(w, track.kind)?;

    let minf = begin_box(w, MINF)?;
    match track.kind {
        MediaKind::Video => {
            let vmhd = begin_full_box(w, VMHD, 0, 1)?;
            w.write_all(&[0u8; 8])?;
            end_box(w, vmhd)?;
        }
        MediaKind::Audio => {
            let smhd = begin_full_box(w, SMHD, 0, 0)?;
            w.write_u32::<BigEndian>(0)?;
            end_box(w, smhd)?;
        }
    }
    let dinf = begin_box(w, DINF)?;
    let dref = begin_full_box(w, DREF, 0, 0)?;
    w.write_u32::<BigEndian>(1)?;
    let url = begin_full_box(w, URL, 0, 1)?;
    end_box(w, url)?;
    end_box(w, dref)?;
    end_box(w, dinf)?;

    write_stbl(w, track, timing)?;

    end_box(w, minf)?;
    end_box(w, mdia)?;
    end_box(w, trak)
}

fn write_mdhd(w: &mut Out, timescale: u32, duration: u64) -> ReframeResult<()> {
    if duration > u32::MAX as u64 {
        let pos = begin_full_box(w, MDHD, 1, 0)?;
        w.write_u64::<BigEndian>(0)?;
        w.write_u64::<BigEndian>(0)?;
        w.write_u32::<BigEndian>(timescale)?;
        w.write_u64::<BigEndian>(duration)?;
        w.write_u16::<BigEndian>(LANGUAGE_UND)?;
        w.write_u16::<BigEndian>(0)?;
        return end_box(w, pos);
    }
    let pos = begin_full_box(w, MDHD, 0, 0)?;
    w.write_u32::<BigEndian>(0)?;
    w.write_u32::<BigEndian>(0)?;
    w.write_u32::<BigEndian>(timescale)?;
    w.write_u32::<BigEndian>(duration as u32)?;
    w.write_u16::<BigEndian>(LANGUAGE_UND)?;
    w.write_u16::<BigEndian>(0)?;
    end_box(w, pos)
}

fn write_hdlr(w: &mut Out, kind: MediaKind) -> ReframeResult<()> {
    let (handler, name): (FourCC, &[u8]) = match kind {
        MediaKind::Video => (HANDLER_VIDEO, b"VideoHandler\0"),
        MediaKind::Audio => (HANDLER_SOUND, b"SoundHandler\0"),
    };
    let pos = begin_full_box(w, HDLR, 0, 0)?;
    w.write_u32::<BigEndian>(0)?;
    w.write_all(handler.as_bytes())?;
    w.write_all(&[0u8; 12])?;
    w.write_all(name)?;
    end_box(w, pos)
}

fn write_stbl(w: &mut Out, track: &MuxTrack, timing: &TrackTiming) -> ReframeResult<()> {
    let stbl = begin_box(w, STBL)?;

    let stsd = begin_full_box(w, STSD, 0, 0)?;
    w.write_u32::<BigEndian>(1)?;
    write_sample_entry(w, &track.format)?;
    end_box(w, stsd)?;

    let runs = run_lengths(&timing.deltas);
    let stts = begin_full_box(w, STTS, 0, 0)?;
    w.write_u32::<BigEndian>(runs.len() as u32)?;
    for (count, delta) in runs {
        w.write_u32::<BigEndian>(count)?;
        w.write_u32::<BigEndian>(delta)?;
    }
    end_box(w, stts)?;

    if timing.composition_offsets.iter().any(|o| *o != 0) {
        let signed = timing.composition_offsets.iter().any(|o| *o < 0);
        let runs = run_lengths(&timing.composition_offsets);
        let ctts = begin_full_box(w, CTTS, u8::from(signed), 0)?;
        w.write_u32::<BigEndian>(runs.len() as u32)?;
        for (count, offset) in runs {
            w.write_u32::<BigEndian>(count)?;
            w.write_i32::<BigEndian>(offset.clamp(i32::MIN as i64, i32::MAX as i64) as i32)?;
        }
        end_box(w, ctts)?;
    }

    if track.kind == MediaKind::Video && !track.samples.iter().all(|s| s.key) {
        let keys: Vec<u32> = track
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.key)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        let stss = begin_full_box(w, STSS, 0, 0)?;
        w.write_u32::<BigEndian>(keys.len() as u32)?;
        for key in keys {
            w.write_u32::<BigEndian>(key)?;
        }
        end_box(w, stss)?;
    }

    let stsz = begin_full_box(w, STSZ, 0, 0)?;
    w.write_u32::<BigEndian>(0)?;
    w.write_u32::<BigEndian>(track.samples.len() as u32)?;
    for sample in &track.samples {
        w.write_u32::<BigEndian>(sample.size)?;
    }
    end_box(w, stsz)?;

    let stsc = begin_full_box(w, STSC, 0, 0)?;
    if track.samples.is_empty() {
        w.write_u32::<BigEndian>(0)?;
    } else {
        w.write_u32::<BigEndian>(1)?;
        w.write_u32::<BigEndian>(1)?; // first_chunk
        w.write_u32::<BigEndian>(1)?; // samples_per_chunk
        w.write_u32::<BigEndian>(1)?; // sample_description_index
    }
    end_box(w, stsc)?;

    let wide = track.samples.iter().any(|s| s.offset > u32::MAX as u64);
    let table = begin_full_box(w, if wide { CO64 } else { STCO }, 0, 0)?;
    w.write_u32::<BigEndian>(track.samples.len() as u32)?;
    for sample in &track.samples {
        if wide {
            w.write_u64::<BigEndian>(sample.offset)?;
        } else {
            w.write_u32::<BigEndian>(sample.offset as u32)?;
        }
    }
    end_box(w, table)?;

    end_box(w, stbl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reframe_media::format::{mime, BufferFlags};

    fn video_track(pts: &[i64]) -> MuxTrack {
        MuxTrack {
            format: MediaFormat::video(mime::VIDEO_AVC, 320, 240),
            kind: MediaKind::Video,
            timescale: VIDEO_TIMESCALE,
            samples: pts
                .iter()
                .map(|&pts_us| SampleRecord {
                    offset: 0,
                    size: 1,
                    pts_us,
                    key: false,
                })
                .collect(),
        }
    }

    #[test]
    fn timing_for_in_order_frames() {
        let timing = TrackTiming::compute(&video_track(&[0, 33_333, 66_667]));
        assert_eq!(timing.deltas, vec![3_000, 3_000, 3_000]);
        assert!(timing.composition_offsets.iter().all(|o| *o == 0));
        assert_eq!(timing.duration, 9_000);
    }

    #[test]
    fn timing_for_reordered_frames_uses_composition_offsets() {
        // I P B B in decode order
        let timing = TrackTiming::compute(&video_track(&[0, 100_000, 33_333, 66_667]));
        assert_eq!(timing.deltas, vec![3_000, 3_000, 3_000, 3_000]);
        assert_eq!(timing.composition_offsets, vec![0, 6_000, -3_000, -3_000]);
    }

    #[test]
    fn late_start_is_kept_as_offset() {
        let timing = TrackTiming::compute(&video_track(&[500_000, 533_333]));
        assert_eq!(timing.composition_offsets, vec![45_000, 45_000]);
    }

    #[test]
    fn lifecycle_rules_are_enforced() {
        let dir = std::env::temp_dir().join(format!("reframe-mux-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lifecycle.mp4");

        let mut muxer = Mp4Muxer::create(&path).unwrap();
        let info = BufferInfo::new(3, 0, BufferFlags::KEY_FRAME);
        assert!(muxer.write_sample(0, &[1, 2, 3], &info).is_err());
        assert!(matches!(
            muxer.start().unwrap_err(),
            ReframeError::MuxerStart { .. }
        ));
        assert!(muxer.stop().is_err());

        let track = muxer
            .add_track(&MediaFormat::video(mime::VIDEO_AVC, 320, 240))
            .unwrap();
        muxer.start().unwrap();
        assert!(muxer
            .add_track(&MediaFormat::audio(mime::AUDIO_AAC, 44_100, 2))
            .is_err());
        muxer.write_sample(track, &[1, 2, 3], &info).unwrap();
        muxer.stop().unwrap();
        muxer.release();
        muxer.release();

        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len > 32 + 16 + 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_unsupported_codecs() {
        let dir = std::env::temp_dir().join(format!("reframe-mux-codec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut muxer = Mp4Muxer::create(&dir.join("x.mp4")).unwrap();
        let err = muxer
            .add_track(&MediaFormat::video("video/x-unknown", 16, 16))
            .unwrap_err();
        assert!(matches!(err, ReframeError::Unsupported { .. }));
        muxer.release();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
