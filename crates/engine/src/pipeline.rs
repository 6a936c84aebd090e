//! Track pipeline interface shared by the video and audio pipelines.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use reframe_common::error::ReframeResult;
use reframe_media::format::MediaKind;
use serde::Serialize;

/// A decode → encode → write pipeline for one track of the source.
///
/// `run` blocks its thread until the track is written, skipped, failed or
/// stopped. `stop` may be called from any other thread at any time, any
/// number of times, and releases every codec the pipeline holds.
pub trait TrackPipeline: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Transcode the track into its elementary output file.
    fn run(&self) -> ReframeResult<PipelineReport>;

    /// Halt the codecs and finalize whatever output exists.
    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Statistics for one finished pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub kind: Option<MediaKind>,

    /// The source had no track of this kind.
    pub skipped: bool,

    /// Compressed samples read from the source.
    pub samples_read: u64,

    /// Encoded samples written to the output.
    pub samples_written: u64,

    pub frames_rendered: u64,
    pub frames_dropped: u64,

    /// Raw PCM bytes fed to the audio encoder.
    pub pcm_bytes: u64,

    /// Elementary output file, when one was finalized.
    pub output: Option<PathBuf>,

    pub last_pts_us: Option<i64>,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn skipped(kind: MediaKind) -> Self {
        Self {
            kind: Some(kind),
            skipped: true,
            ..Self::default()
        }
    }

    /// Dropped frames as a percentage of decoded frames.
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_rendered + self.frames_dropped;
        if total == 0 {
            return 0.0;
        }
        self.frames_dropped as f64 / total as f64 * 100.0
    }
}

/// Lock a resource slot, recovering from a panic in another holder.
pub(crate) fn lock_slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Loop phase of a codec pair, advanced as end-of-stream propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Source samples are still being fed to the decoder.
    Feeding,
    /// Input exhausted; draining decoder output.
    DrainingDecoder,
    /// Decoder finished; draining the encoder until end of stream.
    DrainingEncoder,
    Done,
}
