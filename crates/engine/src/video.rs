//! Video pipeline: demux → decode → GPU effect → encode → mux.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use reframe_common::clock::JobClock;
use reframe_common::config::{EncodeDefaults, EngineConfig, PipelineSettings};
use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::{Codec, CodecOutput, Decoder, Demuxer, Encoder, MediaPlatform};
use reframe_media::format::{BufferFlags, ContainerKind, MediaFormat, MediaKind};
use reframe_media::locator::locate_track;

use crate::encode::VideoEncodeSpec;
use crate::pipeline::{lock_slot, Phase, PipelineReport, TrackPipeline};
use crate::render::{FrameOutcome, RenderSurface};
use crate::resource::Owned;
use crate::writer::TrackWriter;

pub struct VideoPipeline {
    source: PathBuf,
    output: PathBuf,
    spec: VideoEncodeSpec,
    platform: MediaPlatform,
    settings: PipelineSettings,
    defaults: EncodeDefaults,
    slot: Mutex<Option<VideoResources>>,
    stop_flag: AtomicBool,
    running: AtomicBool,
}

// Fields drop in declaration order, which is the release order.
struct VideoResources {
    decoder: Owned<dyn Decoder>,
    encoder: Owned<dyn Encoder>,
    surface: RenderSurface,
    writer: TrackWriter,
    demuxer: Owned<dyn Demuxer>,
    phase: Phase,
    track: Option<usize>,
    report: PipelineReport,
}

impl VideoPipeline {
    pub fn new(
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        spec: VideoEncodeSpec,
        platform: MediaPlatform,
        config: &EngineConfig,
    ) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            spec,
            platform,
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

    fn setup(&self) -> ReframeResult<Option<VideoResources>> {
        let mut demuxer = Owned::new(self.platform.demuxers.open(&self.source)?);
        let Some(track) = locate_track(&mut *demuxer, MediaKind::Video)? else {
            return Ok(None);
        };

        let encoder_format = self.spec.resolve(&track.format, &self.defaults)?;
        let mut encoder = Owned::new(self.platform.codecs.create_encoder(&self.spec.codec)?);
        encoder.configure(&encoder_format)?;
        let input_surface = encoder.create_input_surface()?;
        encoder.start()?;

        let surface = RenderSurface::new(
            self.platform.gpu.create_context()?,
            &input_surface,
            self.spec.effect,
            self.settings.image_timeout(),
        )?;

        let mut decoder = Owned::new(self.platform.codecs.create_decoder(&track.mime)?);
        decoder.configure(&track.format, Some(surface.decoder_target()))?;
        decoder.start()?;

        let writer = TrackWriter::create(
            self.platform.muxers.as_ref(),
            &self.output,
            ContainerKind::Mp4,
            1,
        )?;

        tracing::info!(
            source = %self.source.display(),
            track = track.track_index,
            decoder = %track.mime,
            encoder = %self.spec.codec,
            width = ?encoder_format.width,
            height = ?encoder_format.height,
            effect = %self.spec.effect,
            "Video pipeline configured"
        );

        Ok(Some(VideoResources {
            decoder,
            encoder,
            surface,
            writer,
            demuxer,
            phase: Phase::Feeding,
            track: None,
            report: PipelineReport {
                kind: Some(MediaKind::Video),
                ..PipelineReport::default()
            },
        }))
    }

    fn transcode(&self, clock: &JobClock) -> ReframeResult<PipelineReport> {
        let Some(resources) = self.setup()? else {
            return Ok(PipelineReport::skipped(MediaKind::Video));
        };
        {
            let mut slot = lock_slot(&self.slot);
            if self.stop_flag.load(Ordering::SeqCst) {
                drop(slot);
                if let (Err(e), _) = resources.close() {
                    tracing::warn!(error = %e, "Video output could not be finalized");
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
                        frames = report.samples_written,
                        rendered = report.frames_rendered,
                        dropped = report.frames_dropped,
                        elapsed_ms = report.elapsed_ms,
                        "Video pipeline finished"
                    );
                    return Ok(report);
                }
                Err(e) => {
                    let resources = slot.take();
                    drop(slot);
                    if let Some((Err(close), _)) = resources.map(|r| r.close()) {
                        tracing::warn!(error = %close, "Video output could not be finalized");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl TrackPipeline for VideoPipeline {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn run(&self) -> ReframeResult<PipelineReport> {
        let clock = JobClock::start();
        self.running.store(true, Ordering::SeqCst);
        let result = self.transcode(&clock);
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            if !e.is_cancellation() {
                tracing::error!(error = %e, "Video pipeline failed");
            }
        }
        result
    }

    fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let resources = lock_slot(&self.slot).take();
        if let Some(resources) = resources {
            tracing::info!(phase = ?resources.phase, "Stopping video pipeline");
            if let (Err(e), _) = resources.close() {
                tracing::warn!(error = %e, "Video output could not be finalized");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl VideoResources {
    /// One poll iteration: feed, then drain the encoder, and drain the
    /// decoder only when the encoder had nothing to give.
    fn step(&mut self, timeout: Duration) -> ReframeResult<()> {
        if self.phase == Phase::Feeding {
            self.feed_decoder(timeout)?;
        }
        if self.drain_encoder(timeout)? {
            return Ok(());
        }
        if matches!(self.phase, Phase::Feeding | Phase::DrainingDecoder) {
            self.drain_decoder(timeout)?;
        }
        Ok(())
    }

    fn feed_decoder(&mut self, timeout: Duration) -> ReframeResult<()> {
        let Some(slot) = self.decoder.dequeue_input_buffer(timeout)? else {
            return Ok(());
        };
        match self.demuxer.read_sample()? {
            Some(sample) => {
                self.decoder
                    .queue_input_buffer(slot, &sample.data, sample.time_us, sample.flags)?;
                self.report.samples_read += 1;
                self.demuxer.advance();
            }
            None => {
                self.decoder
                    .queue_input_buffer(slot, &[], 0, BufferFlags::END_OF_STREAM)?;
                self.phase = Phase::DrainingDecoder;
                tracing::debug!(samples = self.report.samples_read, "Video input exhausted");
            }
        }
        Ok(())
    }

    /// Returns whether the encoder produced anything.
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

    fn drain_decoder(&mut self, timeout: Duration) -> ReframeResult<()> {
        match self.decoder.dequeue_output_buffer(timeout)? {
            CodecOutput::TryAgainLater => {}
            CodecOutput::FormatChanged(format) => {
                tracing::debug!(
                    width = ?format.width,
                    height = ?format.height,
                    "Decoder output format changed"
                );
            }
            CodecOutput::Buffer(buffer) => {
                let render = buffer.info.size != 0;
                self.decoder.release_output_buffer(buffer.index, render)?;
                if render
                    && self.surface.render_frame(buffer.info.presentation_time_us)?
                        == FrameOutcome::Dropped
                {
                    tracing::debug!(pts_us = buffer.info.presentation_time_us, "Frame skipped");
                }
                if buffer.info.is_end_of_stream() {
                    self.encoder.signal_end_of_input_stream()?;
                    self.phase = Phase::DrainingEncoder;
                    tracing::debug!(
                        rendered = self.surface.frames_rendered(),
                        "Decoder drained; flushing encoder"
                    );
                }
            }
        }
        Ok(())
    }

    /// Output track index, adding it on first use with the encoder's
    /// negotiated format.
    fn ensure_track(&mut self, format: Option<MediaFormat>) -> ReframeResult<usize> {
        if let Some(track) = self.track {
            if format.is_some() {
                tracing::warn!("Encoder format changed after the track was added; ignoring");
            }
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

    /// Release everything in order and finalize the output.
    fn close(self) -> (ReframeResult<bool>, PipelineReport) {
        let VideoResources {
            decoder,
            encoder,
            surface,
            mut writer,
            demuxer,
            mut report,
            ..
        } = self;
        drop(decoder);
        drop(encoder);
        report.frames_rendered = surface.frames_rendered();
        report.frames_dropped = surface.frames_dropped();
        surface.release();
        let finished = writer.finish();
        drop(writer);
        drop(demuxer);
        (finished, report)
    }
}
