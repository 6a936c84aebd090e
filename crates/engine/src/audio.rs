//! Audio pipeline: demux → decode to PCM → stage → encode → mux.
//!
//! Re-encoded PCM carries no timestamps of its own; each chunk is stamped
//! from the number of bytes fed to the encoder so far (see [`PcmClock`]).

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use reframe_common::clock::{JobClock, PcmClock};
use reframe_common::config::{AudioStaging, EncodeDefaults, EngineConfig, PipelineSettings};
use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::{Codec, CodecOutput, Decoder, Demuxer, Encoder, MediaPlatform};
use reframe_media::format::{BufferFlags, ContainerKind, MediaFormat, MediaKind};
use reframe_media::locator::locate_track;

use crate::encode::AudioEncodeSpec;
use crate::pipeline::{lock_slot, Phase, PipelineReport, TrackPipeline};
use crate::resource::Owned;
use crate::writer::TrackWriter;

pub struct AudioPipeline {
    source: PathBuf,
    output: PathBuf,
    staging_path: PathBuf,
    spec: AudioEncodeSpec,
    platform: MediaPlatform,
    staging: AudioStaging,
    settings: PipelineSettings,
    defaults: EncodeDefaults,
    slot: Mutex<Option<AudioResources>>,
    stop_flag: AtomicBool,
    running: AtomicBool,
}

/// Decoded PCM waiting for encoder input buffers.
enum PcmStage {
    /// Held in memory between decoder output and encoder input.
    Direct { pending: VecDeque<u8>, sealed: bool },
    /// Written to a raw file, then read back once decoding has finished.
    TempFile {
        path: PathBuf,
        writer: Option<BufWriter<File>>,
        reader: Option<BufReader<File>>,
        exhausted: bool,
    },
}

// Fields drop in declaration order, which is the release order.
struct AudioResources {
    decoder: Option<Owned<dyn Decoder>>,
    encoder: Owned<dyn Encoder>,
    stage: PcmStage,
    writer: TrackWriter,
    demuxer: Owned<dyn Demuxer>,
    phase: Phase,
    encoder_input_done: bool,
    clock: PcmClock,
    /// Staged PCM above which decoder output is left in the decoder.
    stage_limit: usize,
    chunk: Vec<u8>,
    track: Option<usize>,
    report: PipelineReport,
}

impl AudioPipeline {
    pub fn new(
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        staging_path: impl Into<PathBuf>,
        spec: AudioEncodeSpec,
        platform: MediaPlatform,
        config: &EngineConfig,
    ) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            staging_path: staging_path.into(),
            spec,
            platform,
            staging: config.audio_staging,
            settings: config.pipeline.clone(),
            defaults: config.defaults.clone(),
            slot: Mutex::new(None),
            stop_flag: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    fn setup(&self) -> ReframeResult<Option<AudioResources>> {
        let mut demuxer = Owned::new(self.platform.demuxers.open(&self.source)?);
        let Some(track) = locate_track(&mut *demuxer, MediaKind::Audio)? else {
            return Ok(None);
        };

        let encoder_format =
            self.spec
                .resolve(&track.format, &self.defaults, self.settings.input_buffer_size)?;

        let mut decoder = Owned::new(self.platform.codecs.create_decoder(&track.mime)?);
        decoder.configure(&track.format, None)?;

        let mut encoder = Owned::new(self.platform.codecs.create_encoder(&self.spec.codec)?);
        encoder.configure(&encoder_format)?;

        decoder.start()?;
        encoder.start()?;

        let stage = match self.staging {
            AudioStaging::Direct => PcmStage::Direct {
                pending: VecDeque::new(),
                sealed: false,
            },
            AudioStaging::TempFile => PcmStage::create_file(&self.staging_path)?,
        };

        let writer = TrackWriter::create(
            self.platform.muxers.as_ref(),
            &self.output,
            ContainerKind::Mp4,
            1,
        )?;

        let sample_rate = encoder_format.sample_rate.unwrap_or(1);
        let channels = encoder_format.channel_count.unwrap_or(1);
        tracing::info!(
            source = %self.source.display(),
            track = track.track_index,
            decoder = %track.mime,
            encoder = %self.spec.codec,
            sample_rate,
            channels,
            staging = ?self.staging,
            "Audio pipeline configured"
        );

        Ok(Some(AudioResources {
            decoder: Some(decoder),
            encoder,
            stage,
            writer,
            demuxer,
            phase: Phase::Feeding,
            encoder_input_done: false,
            clock: PcmClock::new(sample_rate, channels),
            stage_limit: self.settings.max_staged_pcm_bytes,
            chunk: Vec::new(),
            track: None,
            report: PipelineReport {
                kind: Some(MediaKind::Audio),
                ..PipelineReport::default()
            },
        }))
    }

    fn transcode(&self, clock: &JobClock) -> ReframeResult<PipelineReport> {
        let Some(resources) = self.setup()? else {
            return Ok(PipelineReport::skipped(MediaKind::Audio));
        };
        {
            let mut slot = lock_slot(&self.slot);
            if self.stop_flag.load(Ordering::SeqCst) {
                drop(slot);
                if let (Err(e), _) = resources.close() {
                    tracing::warn!(error = %e, "Audio output could not be finalized");
                }
                return Err(ReframeError::Cancelled);
            }
            *slot = Some(resources);
        }

        let timeout = self.settings.poll_timeout();
        loop {
            let mut slot = lock_slot(&self.slot);
            if self.stop_flag.load(Ordering::SeqCst) {
                return Err(ReframeError::Cancelled);
            }
            let Some(resources) = slot.as_mut() else {
                return Err(ReframeError::Cancelled);
            };

            match resources.step(timeout) {
                Ok(()) if resources.phase != Phase::Done => continue,
                Ok(()) => {
                    let Some(resources) = slot.take() else {
                        return Err(ReframeError::Cancelled);
                    };
                    drop(slot);
                    let (finished, mut report) = resources.close();
                    if finished? {
                        report.output = Some(self.output.clone());
                    }
                    report.elapsed_ms = clock.elapsed_ms();
                    tracing::info!(
                        samples = report.samples_written,
                        bytes = report.pcm_bytes,
                        elapsed_ms = report.elapsed_ms,
                        "Audio pipeline finished"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    let resources = slot.take();
                    drop(slot);
                    if let Some((Err(close), _)) = resources.map(|r| r.close()) {
                        tracing::warn!(error = %close, "Audio output could not be finalized");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl TrackPipeline for AudioPipeline {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn run(&self) -> ReframeResult<PipelineReport> {
        let clock = JobClock::start();
        self.running.store(true, Ordering::SeqCst);
        let result = self.transcode(&clock);
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            if !e.is_cancellation() {
                tracing::error!(error = %e, "Audio pipeline failed");
            }
        }
        result
    }

    fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let resources = lock_slot(&self.slot).take();
        if let Some(resources) = resources {
            tracing::info!(phase = ?resources.phase, "Stopping audio pipeline");
            if let (Err(e), _) = resources.close() {
                tracing::warn!(error = %e, "Audio output could not be finalized");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl AudioResources {
    fn step(&mut self, timeout: Duration) -> ReframeResult<()> {
        if self.phase == Phase::Feeding {
            self.feed_decoder(timeout)?;
        }
        if self.drain_encoder(timeout)? {
            return Ok(());
        }
        if matches!(self.phase, Phase::Feeding | Phase::DrainingDecoder)
            && self.stage.has_room(self.stage_limit)
        {
            self.drain_decoder(timeout)?;
        }
        if !self.encoder_input_done && self.stage.readable() {
            self.feed_encoder(timeout)?;
        }
        Ok(())
    }

    fn decoder(&mut self) -> ReframeResult<&mut Owned<dyn Decoder>> {
        self.decoder
            .as_mut()
            .ok_or_else(|| ReframeError::codec_config("audio decoder already released"))
    }

    fn feed_decoder(&mut self, timeout: Duration) -> ReframeResult<()> {
        let Some(slot) = self.decoder()?.dequeue_input_buffer(timeout)? else {
            return Ok(());
        };
        match self.demuxer.read_sample()? {
            Some(sample) => {
                self.decoder()?
                    .queue_input_buffer(slot, &sample.data, sample.time_us, BufferFlags::NONE)?;
                self.report.samples_read += 1;
                self.demuxer.advance();
            }
            None => {
                self.decoder()?
                    .queue_input_buffer(slot, &[], 0, BufferFlags::END_OF_STREAM)?;
                self.phase = Phase::DrainingDecoder;
                tracing::debug!(samples = self.report.samples_read, "Audio input exhausted");
            }
        }
        Ok(())
    }

    fn drain_decoder(&mut self, timeout: Duration) -> ReframeResult<()> {
        let output = self.decoder()?.dequeue_output_buffer(timeout)?;
        match output {
            CodecOutput::TryAgainLater => {}
            CodecOutput::FormatChanged(format) => self.retime(&format),
            CodecOutput::Buffer(buffer) => {
                let size = buffer.info.size.min(buffer.data.len());
                if size > 0 {
                    self.stage.accept(&buffer.data[..size])?;
                }
                self.decoder()?.release_output_buffer(buffer.index, false)?;
                if buffer.info.is_end_of_stream() {
                    self.stage.seal()?;
                    // The decoder has nothing left to give; free it before the encode tail.
                    drop(self.decoder.take());
                    self.phase = Phase::DrainingEncoder;
                    tracing::debug!("Audio decoder drained");
                }
            }
        }
        Ok(())
    }

    /// Adopt the decoder's actual PCM layout while nothing has been stamped.
    fn retime(&mut self, format: &MediaFormat) {
        if self.clock.bytes_consumed() != 0 {
            return;
        }
        if let (Some(rate), Some(channels)) = (format.sample_rate, format.channel_count) {
            tracing::debug!(rate, channels, "Decoder PCM format");
            self.clock = PcmClock::new(rate, channels);
        }
    }

    fn feed_encoder(&mut self, timeout: Duration) -> ReframeResult<()> {
        let Some(slot) = self.encoder.dequeue_input_buffer(timeout)? else {
            return Ok(());
        };
        let n = self.stage.read_chunk(slot.capacity.max(1), &mut self.chunk)?;
        if n > 0 {
            let pts = self.clock.consume(n);
            self.encoder
                .queue_input_buffer(slot, &self.chunk[..n], pts, BufferFlags::NONE)?;
            self.report.pcm_bytes += n as u64;
        } else {
            self.encoder.queue_input_buffer(
                slot,
                &[],
                self.clock.timestamp_us(),
                BufferFlags::END_OF_STREAM,
            )?;
            self.encoder_input_done = true;
            tracing::debug!(bytes = self.report.pcm_bytes, "PCM fully queued to encoder");
        }
        Ok(())
    }

    fn drain_encoder(&mut self, timeout: Duration) -> ReframeResult<bool> {
        match self.encoder.dequeue_output_buffer(timeout)? {
            CodecOutput::TryAgainLater => Ok(false),
            CodecOutput::FormatChanged(format) => {
                self.ensure_track(Some(format))?;
                Ok(true)
            }
            CodecOutput::Buffer(buffer) => {
                let info = buffer.info;
                if !info.is_codec_config() && info.size > 1 {
                    let track = self.ensure_track(None)?;
                    let data = buffer.data.get(..info.size).unwrap_or(&buffer.data[..]);
                    self.writer.write_sample(track, data, &info)?;
                    self.report.samples_written += 1;
                    self.report.last_pts_us = Some(info.presentation_time_us);
                }
                self.encoder.release_output_buffer(buffer.index, false)?;
                if info.is_end_of_stream() {
                    self.phase = Phase::Done;
                }
                Ok(true)
            }
        }
    }

    fn ensure_track(&mut self, format: Option<MediaFormat>) -> ReframeResult<usize> {
        if let Some(track) = self.track {
            return Ok(track);
        }
        let format = match format {
            Some(format) => format,
            None => self.encoder.output_format()?,
        };
        let track = self.writer.add_track(&format)?;
        self.track = Some(track);
        Ok(track)
    }

    /// Release decoder, encoder and staged PCM in that order, then finalize
    /// the output.
    fn close(self) -> (ReframeResult<bool>, PipelineReport) {
        let AudioResources {
            decoder,
            encoder,
            mut stage,
            mut writer,
            demuxer,
            report,
            ..
        } = self;
        drop(decoder);
        drop(encoder);
        stage.discard();
        let finished = writer.finish();
        drop(writer);
        drop(demuxer);
        (finished, report)
    }
}

impl PcmStage {
    fn create_file(path: &Path) -> ReframeResult<Self> {
        let file = File::create(path)?;
        Ok(PcmStage::TempFile {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            reader: None,
            exhausted: false,
        })
    }

    fn accept(&mut self, pcm: &[u8]) -> ReframeResult<()> {
        match self {
            PcmStage::Direct { pending, .. } => {
                pending.extend(pcm);
                Ok(())
            }
            PcmStage::TempFile {
                writer: Some(writer),
                ..
            } => {
                writer.write_all(pcm)?;
                Ok(())
            }
            PcmStage::TempFile { path, .. } => Err(ReframeError::Io(std::io::Error::other(
                format!("PCM staging file {} is closed", path.display()),
            ))),
        }
    }

    /// No more PCM will arrive.
    fn seal(&mut self) -> ReframeResult<()> {
        match self {
            PcmStage::Direct { sealed, .. } => *sealed = true,
            PcmStage::TempFile {
                path,
                writer,
                reader,
                ..
            } => {
                if let Some(mut w) = writer.take() {
                    w.flush()?;
                }
                *reader = Some(BufReader::new(File::open(&*path)?));
                tracing::debug!(path = %path.display(), "PCM staged; encoding from file");
            }
        }
        Ok(())
    }

    /// Whether the encoder can be fed now, either data or end of stream.
    fn readable(&self) -> bool {
        match self {
            PcmStage::Direct { pending, sealed } => *sealed || !pending.is_empty(),
            PcmStage::TempFile { reader, .. } => reader.is_some(),
        }
    }

    /// Whether more decoder output may be staged. Only in-memory staging is
    /// bounded.
    fn has_room(&self, limit: usize) -> bool {
        match self {
            PcmStage::Direct { pending, .. } => pending.len() < limit.max(1),
            PcmStage::TempFile { .. } => true,
        }
    }

    /// Move up to `max` bytes into `out`. Zero means everything staged has
    /// been consumed.
    fn read_chunk(&mut self, max: usize, out: &mut Vec<u8>) -> ReframeResult<usize> {
        out.clear();
        match self {
            PcmStage::Direct { pending, .. } => {
                let n = max.min(pending.len());
                out.extend(pending.drain(..n));
                Ok(n)
            }
            PcmStage::TempFile {
                reader: Some(reader),
                exhausted,
                ..
            } => {
                if *exhausted {
                    return Ok(0);
                }
                out.resize(max, 0);
                let mut filled = 0;
                while filled < max {
                    let n = reader.read(&mut out[filled..])?;
                    if n == 0 {
                        *exhausted = true;
                        break;
                    }
                    filled += n;
                }
                out.truncate(filled);
                Ok(filled)
            }
            PcmStage::TempFile { .. } => Ok(0),
        }
    }

    /// Drop staged data and delete any staging file. Idempotent.
    fn discard(&mut self) {
        match self {
            PcmStage::Direct { pending, .. } => pending.clear(),
            PcmStage::TempFile {
                path,
                writer,
                reader,
                ..
            } => {
                drop(writer.take());
                drop(reader.take());
                match std::fs::remove_file(&*path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "Removed PCM staging file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove PCM staging file"),
                }
            }
        }
    }
}

impl Drop for PcmStage {
    fn drop(&mut self) {
        self.discard();
    }
}
