//! Container writing.
//!
//! [`TrackWriter`] guards a muxer so it is only started once every expected
//! track has been added and never takes samples before that.
//! [`ContainerWriter`] merges finished elementary files into one container.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::{Demuxer, DemuxerFactory, Muxer, MuxerFactory};
use reframe_media::format::{BufferInfo, ContainerKind, MediaFormat, MediaKind, Sample};
use reframe_media::locator::locate_track;
use serde::Serialize;

use crate::resource::Owned;

pub struct TrackWriter {
    muxer: Owned<dyn Muxer>,
    path: PathBuf,
    expected: usize,
    tracks: Vec<usize>,
    started: bool,
    finished: bool,
    samples: u64,
}

impl TrackWriter {
    /// Create a writer at `path` that starts after `expected` tracks.
    pub fn create(
        factory: &dyn MuxerFactory,
        path: &Path,
        kind: ContainerKind,
        expected: usize,
    ) -> ReframeResult<Self> {
        if expected == 0 {
            return Err(ReframeError::muxer_start("writer needs at least one track"));
        }
        let muxer = factory.create(path, kind)?;
        Ok(Self {
            muxer: Owned::new(muxer),
            path: path.to_path_buf(),
            expected,
            tracks: Vec::with_capacity(expected),
            started: false,
            finished: false,
            samples: 0,
        })
    }

    /// Add a track; the muxer starts once the last expected track is added.
    pub fn add_track(&mut self, format: &MediaFormat) -> ReframeResult<usize> {
        if self.started || self.tracks.len() == self.expected {
            return Err(ReframeError::muxer_start(format!(
                "cannot add {} track: all {} tracks already added",
                format.mime, self.expected
            )));
        }
        format
            .validate_for_muxing()
            .map_err(ReframeError::muxer_start)?;

        let track = self.muxer.add_track(format)?;
        self.tracks.push(track);
        tracing::debug!(
            path = %self.path.display(),
            track,
            mime = %format.mime,
            added = self.tracks.len(),
            expected = self.expected,
            "Added muxer track"
        );

        if self.tracks.len() == self.expected {
            self.start()?;
        }
        Ok(track)
    }

    /// Start the muxer. Fails unless every expected track has been added.
    pub fn start(&mut self) -> ReframeResult<()> {
        if self.started {
            return Ok(());
        }
        if self.tracks.len() < self.expected {
            return Err(ReframeError::muxer_start(format!(
                "only {} of {} tracks added",
                self.tracks.len(),
                self.expected
            )));
        }
        self.muxer.start()?;
        self.started = true;
        Ok(())
    }

    pub fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> ReframeResult<()> {
        if !self.started {
            return Err(ReframeError::muxer(format!(
                "sample for track {track} written before the muxer started"
            )));
        }
        self.muxer.write_sample(track, data, info)?;
        self.samples += 1;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalize the container, or discard it if it never started.
    ///
    /// Returns whether a finished file exists. Safe to call repeatedly.
    pub fn finish(&mut self) -> ReframeResult<bool> {
        if self.finished {
            return Ok(self.started);
        }
        self.finished = true;

        let stopped = if self.started {
            self.muxer.stop()
        } else {
            Ok(())
        };
        self.muxer.release();

        if !self.started {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.path.display(), error = %e, "Could not remove unstarted output");
                }
            }
            return Ok(false);
        }

        stopped?;
        tracing::debug!(path = %self.path.display(), samples = self.samples, "Container finalized");
        Ok(true)
    }
}

/// An elementary file produced by one pipeline. `path` is `None` when the
/// pipeline had nothing to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryOutput {
    pub kind: MediaKind,
    pub path: Option<PathBuf>,
}

impl ElementaryOutput {
    fn existing_path(&self) -> Option<&Path> {
        self.path.as_deref().filter(|p| p.exists())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedTrack {
    pub kind: MediaKind,
    pub mime: String,
    pub samples: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub output: PathBuf,
    pub container: ContainerKind,
    pub tracks: Vec<MergedTrack>,
}

impl MergeReport {
    pub fn samples(&self) -> u64 {
        self.tracks.iter().map(|t| t.samples).sum()
    }
}

/// Merges single-track elementary files into one output container.
#[derive(Clone)]
pub struct ContainerWriter {
    muxers: Arc<dyn MuxerFactory>,
    demuxers: Arc<dyn DemuxerFactory>,
    require_all: bool,
}

struct MergeSource {
    kind: MediaKind,
    mime: String,
    demuxer: Owned<dyn Demuxer>,
    track: usize,
    pending: Option<Sample>,
    samples: u64,
}

impl ContainerWriter {
    pub fn new(
        muxers: Arc<dyn MuxerFactory>,
        demuxers: Arc<dyn DemuxerFactory>,
        require_all: bool,
    ) -> Self {
        Self {
            muxers,
            demuxers,
            require_all,
        }
    }

    /// Write one track per input into `output`, interleaved by timestamp.
    pub fn merge(
        &self,
        inputs: &[ElementaryOutput],
        container: ContainerKind,
        output: &Path,
    ) -> ReframeResult<MergeReport> {
        if !self.muxers.supports(container) {
            return Err(ReframeError::unsupported(format!(
                "no muxer available for {} output",
                container.extension()
            )));
        }

        let mut sources = Vec::with_capacity(inputs.len());
        for input in inputs {
            match input.existing_path() {
                Some(path) => sources.push(self.open_source(input.kind, path)?),
                None if self.require_all => {
                    return Err(ReframeError::missing_output(input.kind.as_str()));
                }
                None => tracing::warn!(kind = %input.kind, "Elementary output missing; merging without it"),
            }
        }
        if sources.is_empty() {
            return Err(ReframeError::missing_output("video and audio"));
        }

        tracing::info!(
            output = %output.display(),
            container = container.extension(),
            tracks = sources.len(),
            "Merging elementary streams"
        );

        let result = self.interleave(&mut sources, container, output);
        if result.is_err() {
            let _ = std::fs::remove_file(output);
        }
        result
    }

    fn open_source(&self, kind: MediaKind, path: &Path) -> ReframeResult<MergeSource> {
        let mut demuxer = Owned::new(self.demuxers.open(path)?);
        let Some(track) = locate_track(&mut *demuxer, kind)? else {
            return Err(ReframeError::missing_output(format!(
                "{kind} track in {}",
                path.display()
            )));
        };
        let pending = demuxer.read_sample()?;
        Ok(MergeSource {
            kind,
            mime: track.mime,
            demuxer,
            track: track.track_index,
            pending,
            samples: 0,
        })
    }

    fn interleave(
        &self,
        sources: &mut [MergeSource],
        container: ContainerKind,
        output: &Path,
    ) -> ReframeResult<MergeReport> {
        let mut writer = TrackWriter::create(self.muxers.as_ref(), output, container, sources.len())?;
        let mut out_tracks = Vec::with_capacity(sources.len());
        for source in sources.iter() {
            let format = source.demuxer.track_format(source.track)?;
            out_tracks.push(writer.add_track(&format)?);
        }

        loop {
            let next = sources
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.pending.as_ref().map(|p| (i, p.time_us)))
                .min_by_key(|&(_, time)| time);
            let Some((index, _)) = next else { break };

            let source = &mut sources[index];
            if let Some(sample) = source.pending.take() {
                writer.write_sample(out_tracks[index], &sample.data, &sample.info())?;
                source.samples += 1;
            }
            source.pending = if source.demuxer.advance() {
                source.demuxer.read_sample()?
            } else {
                None
            };
        }

        writer.finish()?;
        let report = MergeReport {
            output: output.to_path_buf(),
            container,
            tracks: sources
                .iter()
                .map(|s| MergedTrack {
                    kind: s.kind,
                    mime: s.mime.clone(),
                    samples: s.samples,
                })
                .collect(),
        };
        tracing::info!(
            output = %output.display(),
            samples = report.samples(),
            "Merge complete"
        );
        Ok(report)
    }
}
