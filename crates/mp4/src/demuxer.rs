//! Native MPEG-4 demuxer.
//!
//! Loads `moov` once, expands every audio/video track's sample tables into a
//! flat index, and serves samples in decode order.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::{Demuxer, SeekMode};
use reframe_media::format::{BufferFlags, MediaFormat, MediaKind, Sample};

use crate::atoms::{
    read_version_flags, FourCC, CO64, CTTS, HANDLER_SOUND, HANDLER_VIDEO, HDLR, MDHD, MDIA, MINF,
    MOOV, STBL, STCO, STSC, STSD, STSS, STSZ, STTS, TRAK,
};
use crate::sample_entry::parse_sample_entry;
use crate::tree::{scan_atoms, BoxNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedSample {
    pub offset: u64,
    pub size: u32,
    pub time_us: i64,
    pub key: bool,
}

#[derive(Debug, Clone)]
pub struct DemuxTrack {
    pub format: MediaFormat,
    pub samples: Vec<IndexedSample>,
}

pub struct Mp4Demuxer {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    tracks: Vec<DemuxTrack>,
    selected: Option<usize>,
    cursor: usize,
}

impl Mp4Demuxer {
    pub fn open(path: &Path) -> ReframeResult<Self> {
        if !path.exists() {
            return Err(ReframeError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let atoms = scan_atoms(&mut reader, len)?;
        let moov_span = atoms
            .iter()
            .find(|a| a.kind == MOOV)
            .ok_or_else(|| ReframeError::demux(format!("{} has no moov atom", path.display())))?;
        reader.seek(SeekFrom::Start(moov_span.offset))?;
        let mut moov_bytes = vec![0u8; moov_span.size as usize];
        reader.read_exact(&mut moov_bytes)?;
        let moov = BoxNode::parse(&moov_bytes)?;

        let tracks = read_tracks(&moov)?;
        tracing::debug!(path = %path.display(), tracks = tracks.len(), "Opened MP4");

        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            tracks,
            selected: None,
            cursor: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tracks(&self) -> &[DemuxTrack] {
        &self.tracks
    }

    fn selected_track(&self) -> ReframeResult<&DemuxTrack> {
        self.selected
            .and_then(|i| self.tracks.get(i))
            .ok_or_else(|| ReframeError::demux("no track selected"))
    }
}

impl Demuxer for Mp4Demuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> ReframeResult<MediaFormat> {
        self.tracks
            .get(index)
            .map(|t| t.format.clone())
            .ok_or_else(|| ReframeError::demux(format!("no track with index {index}")))
    }

    fn select_track(&mut self, index: usize) -> ReframeResult<()> {
        if index >= self.tracks.len() {
            return Err(ReframeError::demux(format!("no track with index {index}")));
        }
        self.selected = Some(index);
        self.cursor = 0;
        Ok(())
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> ReframeResult<()> {
        let samples = &self.selected_track()?.samples;
        let position = match mode {
            SeekMode::PreviousSync => samples
                .iter()
                .rposition(|s| s.key && s.time_us <= time_us)
                .unwrap_or(0),
            SeekMode::NextSync => samples
                .iter()
                .position(|s| s.key && s.time_us >= time_us)
                .unwrap_or(samples.len()),
        };
        self.cursor = position;
        Ok(())
    }

    fn read_sample(&mut self) -> ReframeResult<Option<Sample>> {
        let Some(entry) = self.selected_track()?.samples.get(self.cursor).copied() else {
            return Ok(None);
        };
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ReframeError::demux("demuxer has been released"))?;

        reader.seek(SeekFrom::Start(entry.offset))?;
        let mut data = vec![0u8; entry.size as usize];
        reader.read_exact(&mut data)?;

        let flags = if entry.key {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };
        Ok(Some(Sample {
            data,
            time_us: entry.time_us,
            flags,
        }))
    }

    fn advance(&mut self) -> bool {
        let len = match self.selected.and_then(|i| self.tracks.get(i)) {
            Some(track) => track.samples.len(),
            None => return false,
        };
        if self.cursor < len {
            self.cursor += 1;
        }
        self.cursor < len
    }

    fn release(&mut self) {
        self.reader = None;
    }
}

fn read_tracks(moov: &BoxNode) -> ReframeResult<Vec<DemuxTrack>> {
    let mut tracks = Vec::new();
    for (index, trak) in moov.children_of_kind(TRAK).enumerate() {
        match read_track(trak)? {
            Some(track) => tracks.push(track),
            None => tracing::debug!(trak = index, "Skipping non audio/video track"),
        }
    }
    Ok(tracks)
}

fn leaf<'a>(parent: &'a BoxNode, path: &[FourCC]) -> ReframeResult<&'a [u8]> {
    parent
        .find(path)
        .and_then(BoxNode::payload)
        .ok_or_else(|| {
            let last = path.last().map(|k| k.to_string()).unwrap_or_default();
            ReframeError::demux(format!("track is missing {last}"))
        })
}

fn read_track(trak: &BoxNode) -> ReframeResult<Option<DemuxTrack>> {
    let hdlr = leaf(trak, &[MDIA, HDLR])?;
    let handler = hdlr.get(8..12).unwrap_or_default();
    if handler != HANDLER_VIDEO.as_bytes() && handler != HANDLER_SOUND.as_bytes() {
        return Ok(None);
    }

    let (timescale, duration) = read_mdhd(leaf(trak, &[MDIA, MDHD])?)?;
    let stbl = trak
        .find(&[MDIA, MINF, STBL])
        .ok_or_else(|| ReframeError::demux("track is missing stbl"))?;

    let stsd = leaf(stbl, &[STSD])?;
    let entries = BoxNode::parse_sequence(stsd.get(8..).unwrap_or_default())?;
    let Some(entry) = entries.first() else {
        return Err(ReframeError::demux("stsd has no sample entries"));
    };
    let mut format = match parse_sample_entry(entry) {
        Ok(format) => format,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping track with unsupported sample entry");
            return Ok(None);
        }
    };

    let sizes = read_stsz(leaf(stbl, &[STSZ])?)?;
    let chunk_offsets = match stbl.child(CO64) {
        Some(co64) => read_chunk_offsets(co64.payload().unwrap_or_default(), true)?,
        None => read_chunk_offsets(leaf(stbl, &[STCO])?, false)?,
    };
    let stsc = read_pairs3(leaf(stbl, &[STSC])?)?;
    let stts = read_runs(leaf(stbl, &[STTS])?)?;
    let composition = match stbl.child(CTTS).and_then(BoxNode::payload) {
        Some(ctts) => Some(read_runs(ctts)?),
        None => None,
    };
    let sync: Option<HashSet<u32>> = match stbl.child(STSS).and_then(BoxNode::payload) {
        Some(stss) => Some(read_u32_list(stss)?.into_iter().collect()),
        None => None,
    };

    let offsets = expand_chunks(&sizes, &chunk_offsets, &stsc)?;
    let decode_times: Vec<i64> = expand_runs(&stts, sizes.len())
        .into_iter()
        .scan(0i64, |elapsed, delta| {
            let start = *elapsed;
            *elapsed += delta;
            Some(start)
        })
        .collect();
    let composition = composition.map(|runs| expand_runs(&runs, sizes.len()));

    let samples: Vec<IndexedSample> = (0..sizes.len())
        .map(|i| {
            let dts = decode_times[i];
            let pts = dts + composition.as_ref().map_or(0, |c| c[i]);
            IndexedSample {
                offset: offsets[i],
                size: sizes[i],
                time_us: (pts as i128 * 1_000_000 / timescale.max(1) as i128) as i64,
                key: sync.as_ref().map_or(true, |s| s.contains(&(i as u32 + 1))),
            }
        })
        .collect();

    let duration_us = (duration as u128 * 1_000_000 / timescale.max(1) as u128) as i64;
    format.duration_us = Some(duration_us);
    format.max_input_size = samples.iter().map(|s| s.size as usize).max();
    match format.kind() {
        Some(MediaKind::Video) if duration_us > 0 => {
            let rate = (samples.len() as f64 * 1_000_000.0 / duration_us as f64).round();
            format.frame_rate = Some(rate as u32);
        }
        Some(MediaKind::Audio) if format.sample_rate.unwrap_or(0) == 0 => {
            format.sample_rate = Some(timescale);
        }
        _ => {}
    }

    Ok(Some(DemuxTrack { format, samples }))
}

fn read_mdhd(payload: &[u8]) -> ReframeResult<(u32, u64)> {
    let mut c = Cursor::new(payload);
    let (version, _) = read_version_flags(&mut c)?;
    if version == 1 {
        c.seek(SeekFrom::Current(16))?;
        let timescale = c.read_u32::<BigEndian>()?;
        Ok((timescale, c.read_u64::<BigEndian>()?))
    } else {
        c.seek(SeekFrom::Current(8))?;
        let timescale = c.read_u32::<BigEndian>()?;
        Ok((timescale, c.read_u32::<BigEndian>()? as u64))
    }
}

fn read_stsz(payload: &[u8]) -> ReframeResult<Vec<u32>> {
    let mut c = Cursor::new(payload);
    read_version_flags(&mut c)?;
    let uniform = c.read_u32::<BigEndian>()?;
    let count = c.read_u32::<BigEndian>()? as usize;
    if uniform != 0 {
        return Ok(vec![uniform; count]);
    }
    (0..count)
        .map(|_| Ok(c.read_u32::<BigEndian>()?))
        .collect()
}

fn read_chunk_offsets(payload: &[u8], wide: bool) -> ReframeResult<Vec<u64>> {
    let mut c = Cursor::new(payload);
    read_version_flags(&mut c)?;
    let count = c.read_u32::<BigEndian>()? as usize;
    (0..count)
        .map(|_| {
            Ok(if wide {
                c.read_u64::<BigEndian>()?
            } else {
                c.read_u32::<BigEndian>()? as u64
            })
        })
        .collect()
}

fn read_u32_list(payload: &[u8]) -> ReframeResult<Vec<u32>> {
    let mut c = Cursor::new(payload);
    read_version_flags(&mut c)?;
    let count = c.read_u32::<BigEndian>()? as usize;
    (0..count)
        .map(|_| Ok(c.read_u32::<BigEndian>()?))
        .collect()
}

/// `(count, value)` runs from `stts`/`ctts`. Values are read as signed.
fn read_runs(payload: &[u8]) -> ReframeResult<Vec<(u32, i64)>> {
    let mut c = Cursor::new(payload);
    let (version, _) = read_version_flags(&mut c)?;
    let count = c.read_u32::<BigEndian>()? as usize;
    (0..count)
        .map(|_| {
            let n = c.read_u32::<BigEndian>()?;
            let raw = c.read_u32::<BigEndian>()?;
            let value = if version == 1 {
                raw as i32 as i64
            } else {
                raw as i64
            };
            Ok((n, value))
        })
        .collect()
}

/// `stsc` entries: first chunk, samples per chunk, description index.
fn read_pairs3(payload: &[u8]) -> ReframeResult<Vec<(u32, u32, u32)>> {
    let mut c = Cursor::new(payload);
    read_version_flags(&mut c)?;
    let count = c.read_u32::<BigEndian>()? as usize;
    (0..count)
        .map(|_| {
            Ok((
                c.read_u32::<BigEndian>()?,
                c.read_u32::<BigEndian>()?,
                c.read_u32::<BigEndian>()?,
            ))
        })
        .collect()
}

/// File offset of every sample.
fn expand_chunks(
    sizes: &[u32],
    chunk_offsets: &[u64],
    stsc: &[(u32, u32, u32)],
) -> ReframeResult<Vec<u64>> {
    let mut offsets = Vec::with_capacity(sizes.len());
    for (chunk_index, &chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = chunk_index as u32 + 1;
        let per_chunk = stsc
            .iter()
            .rev()
            .find(|(first, _, _)| *first <= chunk_number)
            .map(|(_, n, _)| *n)
            .ok_or_else(|| ReframeError::demux(format!("no stsc entry for chunk {chunk_number}")))?;

        let mut position = chunk_offset;
        for _ in 0..per_chunk {
            let Some(size) = sizes.get(offsets.len()) else {
                break;
            };
            offsets.push(position);
            position += *size as u64;
        }
    }

    if offsets.len() < sizes.len() {
        return Err(ReframeError::demux(format!(
            "chunks hold {} of {} samples",
            offsets.len(),
            sizes.len()
        )));
    }
    Ok(offsets)
}

/// One value per sample from `(count, value)` runs. Samples past the last
/// run repeat its value.
fn expand_runs(runs: &[(u32, i64)], count: usize) -> Vec<i64> {
    let mut values = Vec::with_capacity(count);
    for &(n, value) in runs {
        for _ in 0..n {
            if values.len() == count {
                return values;
            }
            values.push(value);
        }
    }
    values.resize(count, runs.last().map_or(0, |r| r.1));
    values
}
