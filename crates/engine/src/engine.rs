//! Job orchestration.
//!
//! An [`Engine`] runs one job: stage the input, run the video and audio
//! pipelines concurrently, merge their outputs, apply fast start for MPEG-4,
//! publish the artifact and remove the working directory. Every exit path
//! removes the working directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reframe_common::clock::JobClock;
use reframe_common::config::EngineConfig;
use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::MediaPlatform;
use reframe_media::format::MediaKind;
use reframe_mp4::{fast_start_file, FastStartReport};
use serde::Serialize;
use tokio::task::JoinError;

use crate::audio::AudioPipeline;
use crate::encode::{AudioEncodeSpec, VideoEncodeSpec};
use crate::job::{MediaJobSpec, OutputLocation};
use crate::pipeline::{PipelineReport, TrackPipeline};
use crate::video::VideoPipeline;
use crate::writer::{ContainerWriter, ElementaryOutput, MergeReport};

/// Progress callback for job execution.
pub type ProgressCallback = Arc<dyn Fn(JobProgress) + Send + Sync>;

/// Job progress report.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub stage: JobStage,

    /// Coarse progress [0.0, 1.0].
    pub progress: f64,

    pub elapsed_ms: u64,
}

/// Stages of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Preparing,
    Transcoding,
    Muxing,
    FastStart,
    Publishing,
    CleaningUp,
    Complete,
    Cancelled,
    Failed,
}

/// Summary of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub video: PipelineReport,
    pub audio: PipelineReport,
    pub merge: MergeReport,
    pub fast_start: Option<FastStartReport>,
    pub elapsed_ms: u64,
}

/// How a job ended when it did not fail.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        output: OutputLocation,
        report: Box<JobReport>,
    },
    Cancelled,
}

impl JobOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled)
    }
}

pub struct Engine {
    job: Arc<MediaJobSpec>,
    platform: MediaPlatform,
    require_both_tracks: bool,
    video: Arc<VideoPipeline>,
    audio: Arc<AudioPipeline>,
    progress: Option<ProgressCallback>,
    clock: JobClock,
    started: AtomicBool,
    cancelled: AtomicBool,
    /// Set once the final output file exists.
    output_written: AtomicBool,
}

impl Engine {
    pub fn new(
        job: MediaJobSpec,
        video: VideoEncodeSpec,
        audio: AudioEncodeSpec,
        platform: MediaPlatform,
        config: &EngineConfig,
    ) -> Self {
        let source = job.source_path();
        let video = VideoPipeline::new(
            source.clone(),
            job.video_output_path(),
            video,
            platform.clone(),
            config,
        );
        let audio = AudioPipeline::new(
            source,
            job.audio_output_path(),
            job.raw_audio_path(),
            audio,
            platform.clone(),
            config,
        );
        Self {
            job: Arc::new(job),
            platform,
            require_both_tracks: config.require_both_tracks,
            video: Arc::new(video),
            audio: Arc::new(audio),
            progress: None,
            clock: JobClock::start(),
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            output_written: AtomicBool::new(false),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn job(&self) -> &MediaJobSpec {
        &self.job
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run the job to completion.
    ///
    /// Returns `Ok(JobOutcome::Cancelled)` when [`Engine::stop`] interrupted
    /// it and `Err` when it failed. Either way the working directory is gone.
    pub async fn start(&self) -> ReframeResult<JobOutcome> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReframeError::config("job already started"));
        }
        tracing::info!(
            source = %self.job.source_path().display(),
            work_dir = %self.job.work_dir.display(),
            container = self.job.container.extension(),
            "Starting transcoding job"
        );

        match self.execute().await {
            Ok(_) if self.is_cancelled() => self.finish_cancelled().await,
            Ok(outcome) => {
                self.cleanup().await;
                self.emit(JobStage::Complete, 1.0);
                tracing::info!(elapsed_ms = self.clock.elapsed_ms(), "Job complete");
                Ok(outcome)
            }
            Err(e) if e.is_cancellation() || self.is_cancelled() => self.finish_cancelled().await,
            Err(e) => {
                tracing::error!(error = %e, "Job failed");
                self.emit(JobStage::Failed, 1.0);
                self.discard_output().await;
                self.cleanup().await;
                Err(e)
            }
        }
    }

    /// Cancel the job: stop both pipelines, wait for them to release their
    /// codecs, and remove the working directory.
    pub async fn stop(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping transcoding job");

        let video = self.video.clone();
        let audio = self.audio.clone();
        let stopped = tokio::task::spawn_blocking(move || {
            audio.stop();
            video.stop();
        })
        .await;
        if let Err(e) = stopped {
            tracing::error!(error = %e, "Pipeline shutdown task failed");
        }
        self.cleanup().await;
    }

    async fn execute(&self) -> ReframeResult<JobOutcome> {
        self.check_cancelled()?;
        self.emit(JobStage::Preparing, 0.0);
        let job = self.job.clone();
        blocking("prepare", move || job.prepare()).await?;
        self.check_cancelled()?;

        self.emit(JobStage::Transcoding, 0.1);
        let (video, audio) = self.run_pipelines().await?;
        self.check_cancelled()?;

        self.emit(JobStage::Muxing, 0.8);
        let writer = ContainerWriter::new(
            self.platform.muxers.clone(),
            self.platform.demuxers.clone(),
            self.require_both_tracks,
        );
        let outputs = vec![
            ElementaryOutput {
                kind: MediaKind::Video,
                path: video.output.clone(),
            },
            ElementaryOutput {
                kind: MediaKind::Audio,
                path: audio.output.clone(),
            },
        ];
        let job = self.job.clone();
        let merge = blocking("merge", move || {
            writer.merge(&outputs, job.container, &job.merged_path())
        })
        .await?;
        self.check_cancelled()?;

        let job = self.job.clone();
        let fast_start = if job.container.supports_fast_start() {
            self.emit(JobStage::FastStart, 0.9);
            let report = blocking("fast start", move || {
                fast_start_file(&job.merged_path(), &job.final_path())
            })
            .await?;
            tracing::info!(
                outcome = ?report.outcome,
                moov_size = report.moov_size,
                offsets = report.offsets_patched,
                "Fast start applied"
            );
            Some(report)
        } else {
            blocking("move output", move || move_file(&job.merged_path(), &job.final_path())).await?;
            None
        };
        self.output_written.store(true, Ordering::SeqCst);
        self.emit(JobStage::Publishing, 0.95);
        self.check_cancelled()?;

        let job = self.job.clone();
        let output = blocking("publish", move || job.publish()).await?;

        Ok(JobOutcome::Completed {
            output,
            report: Box::new(JobReport {
                video,
                audio,
                merge,
                fast_start,
                elapsed_ms: self.clock.elapsed_ms(),
            }),
        })
    }

    /// Run both pipelines to the end, even when one of them fails.
    async fn run_pipelines(&self) -> ReframeResult<(PipelineReport, PipelineReport)> {
        let video = self.video.clone();
        let audio = self.audio.clone();
        let (video, audio) = tokio::join!(
            tokio::task::spawn_blocking(move || video.run()),
            tokio::task::spawn_blocking(move || audio.run()),
        );
        let video = video.map_err(|e| join_error("video pipeline", e))?;
        let audio = audio.map_err(|e| join_error("audio pipeline", e))?;

        match (video, audio) {
            (Ok(video), Ok(audio)) => {
                tracing::info!(
                    video_samples = video.samples_written,
                    audio_samples = audio.samples_written,
                    frames_dropped = video.frames_dropped,
                    drop_rate = video.drop_rate(),
                    "Both pipelines finished"
                );
                Ok((video, audio))
            }
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Err(video), Err(audio)) => {
                if video.is_cancellation() {
                    Err(audio)
                } else {
                    tracing::error!(error = %audio, "Audio pipeline also failed");
                    Err(video)
                }
            }
        }
    }

    async fn finish_cancelled(&self) -> ReframeResult<JobOutcome> {
        tracing::info!(elapsed_ms = self.clock.elapsed_ms(), "Job cancelled");
        self.discard_output().await;
        self.cleanup().await;
        self.emit(JobStage::Cancelled, 1.0);
        Ok(JobOutcome::Cancelled)
    }

    /// A job that does not complete leaves no output behind.
    async fn discard_output(&self) {
        if !self.output_written.load(Ordering::SeqCst) {
            return;
        }
        let job = self.job.clone();
        if let Err(e) = blocking("discard output", move || job.discard_output()).await {
            tracing::warn!(error = %e, output = %self.job.final_path().display(), "Failed to remove output");
        }
    }

    async fn cleanup(&self) {
        self.emit(JobStage::CleaningUp, 1.0);
        let job = self.job.clone();
        if let Err(e) = blocking("cleanup", move || job.destroy()).await {
            tracing::error!(error = %e, work_dir = %self.job.work_dir.display(), "Failed to remove working directory");
        }
    }

    fn check_cancelled(&self) -> ReframeResult<()> {
        if self.is_cancelled() {
            return Err(ReframeError::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, stage: JobStage, progress: f64) {
        if let Some(callback) = &self.progress {
            callback(JobProgress {
                stage,
                progress,
                elapsed_ms: self.clock.elapsed_ms(),
            });
        }
    }
}

async fn blocking<T, F>(what: &'static str, f: F) -> ReframeResult<T>
where
    F: FnOnce() -> ReframeResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| join_error(what, e))?
}

fn join_error(what: &str, e: JoinError) -> ReframeError {
    ReframeError::Other(anyhow::anyhow!("{what} task did not complete: {e}"))
}

/// Rename, falling back to copy across filesystems.
fn move_file(from: &std::path::Path, to: &std::path::Path) -> ReframeResult<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)?;
    Ok(())
}
