//! Reframe Engine
//!
//! Runs transcoding jobs against a [`MediaPlatform`](reframe_media::capability::MediaPlatform):
//! - **Video pipeline:** decode → GPU fragment effect → encode → elementary MP4
//! - **Audio pipeline:** decode → PCM staging → encode → elementary MP4
//! - **Container writer:** merges the elementary files into the output container
//! - **Engine:** runs both pipelines concurrently, merges, applies fast start, cleans up

pub mod audio;
pub mod effect;
pub mod encode;
pub mod engine;
pub mod job;
pub mod pipeline;
pub mod render;
pub mod resource;
pub mod video;
pub mod writer;

pub use audio::AudioPipeline;
pub use effect::FragmentEffect;
pub use encode::{AudioEncodeSpec, CodecPreset, VideoEncodeSpec};
pub use engine::{Engine, JobOutcome, JobProgress, JobReport, JobStage, ProgressCallback};
pub use job::{ContentResolver, JobStorage, MediaJobSpec, OutputLocation};
pub use pipeline::{PipelineReport, TrackPipeline};
pub use render::{FrameOutcome, RenderSurface};
pub use video::VideoPipeline;
pub use writer::{ContainerWriter, ElementaryOutput, MergeReport, TrackWriter};
