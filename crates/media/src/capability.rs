//! Collaborator capability contracts.
//!
//! The engine never decodes or encodes bitstreams itself. Platform adapters
//! (hardware codecs, GPU contexts, container writers) implement these traits
//! and are bundled into a [`MediaPlatform`] for a job.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reframe_common::error::ReframeResult;

use crate::format::{BufferFlags, BufferInfo, ContainerKind, MediaFormat, Sample};
use crate::surface::SurfaceHandle;

/// Seek behaviour of a demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Nearest key frame at or before the requested time.
    PreviousSync,
    /// Nearest key frame at or after the requested time.
    NextSync,
}

/// Reads compressed samples out of a container file.
pub trait Demuxer: Send {
    /// Number of tracks in the container.
    fn track_count(&self) -> usize;

    /// Format of the given track.
    fn track_format(&self, index: usize) -> ReframeResult<MediaFormat>;

    /// Select the track subsequent reads come from.
    fn select_track(&mut self, index: usize) -> ReframeResult<()>;

    /// Reposition the read cursor of the selected track.
    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> ReframeResult<()>;

    /// Read the sample under the cursor without advancing. `None` at end of track.
    fn read_sample(&mut self) -> ReframeResult<Option<Sample>>;

    /// Move to the next sample. Returns false once the track is exhausted.
    fn advance(&mut self) -> bool;

    /// Release the underlying file. Safe to call repeatedly.
    fn release(&mut self);
}

/// An input buffer a codec is ready to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub index: usize,
    pub capacity: usize,
}

/// A buffer produced by a codec.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    pub index: usize,
    pub info: BufferInfo,
    /// Payload bytes. Empty for frames that only exist on a render surface.
    pub data: Vec<u8>,
}

/// Result of one bounded-timeout output poll.
#[derive(Debug, Clone)]
pub enum CodecOutput {
    /// Nothing became available within the timeout.
    TryAgainLater,
    /// The codec negotiated (or renegotiated) its output format.
    FormatChanged(MediaFormat),
    Buffer(OutputBuffer),
}

/// Operations shared by decoders and encoders.
pub trait Codec: Send {
    fn start(&mut self) -> ReframeResult<()>;

    fn stop(&mut self) -> ReframeResult<()>;

    /// Free the codec. Safe to call repeatedly and after a failed `stop()`.
    fn release(&mut self);

    /// Wait up to `timeout` for a free input buffer.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> ReframeResult<Option<InputSlot>>;

    /// Fill a previously dequeued input buffer and hand it to the codec.
    fn queue_input_buffer(
        &mut self,
        slot: InputSlot,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> ReframeResult<()>;

    /// Wait up to `timeout` for output.
    fn dequeue_output_buffer(&mut self, timeout: Duration) -> ReframeResult<CodecOutput>;

    /// Return an output buffer. `render` pushes a decoded frame to the
    /// configured output surface.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> ReframeResult<()>;

    /// The currently negotiated output format.
    fn output_format(&self) -> ReframeResult<MediaFormat>;
}

/// Decompresses samples into raw frames or PCM.
pub trait Decoder: Codec {
    /// Configure for the given input format. With `surface`, decoded frames
    /// are rendered there instead of being returned as bytes.
    fn configure(&mut self, format: &MediaFormat, surface: Option<&SurfaceHandle>)
        -> ReframeResult<()>;
}

/// Compresses raw frames or PCM into a bitstream.
pub trait Encoder: Codec {
    fn configure(&mut self, format: &MediaFormat) -> ReframeResult<()>;

    /// Surface the GPU renders frames into (video encoders, before `start()`).
    fn create_input_surface(&mut self) -> ReframeResult<SurfaceHandle>;

    /// Tell a surface-fed encoder no more frames will arrive.
    fn signal_end_of_input_stream(&mut self) -> ReframeResult<()>;
}

/// Handle to a compiled fragment program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// A GPU rendering context bound to an encoder's input surface.
pub trait GpuContext: Send {
    /// Create the window surface drawing into `target` and bind it.
    fn bind_output(&mut self, target: &SurfaceHandle) -> ReframeResult<()>;

    fn make_current(&mut self) -> ReframeResult<()>;

    fn compile_program(&mut self, vertex_src: &str, fragment_src: &str)
        -> ReframeResult<ProgramId>;

    /// Create the external image decoders render into.
    fn create_external_image(&mut self) -> ReframeResult<SurfaceHandle>;

    /// Wait for a newly rendered image and latch it for sampling.
    fn await_new_image(&mut self, timeout: Duration) -> ReframeResult<()>;

    /// Draw the latched image through `program` onto the bound surface.
    fn draw_external_image(&mut self, program: ProgramId) -> ReframeResult<()>;

    fn set_presentation_time(&mut self, time_ns: i64) -> ReframeResult<()>;

    /// Commit the drawn frame to the bound surface.
    fn swap_buffers(&mut self) -> ReframeResult<()>;

    /// Free all GPU objects. Safe to call repeatedly.
    fn release(&mut self);
}

/// Writes encoded samples into a container file.
pub trait Muxer: Send {
    /// Add a track; returns its index.
    fn add_track(&mut self, format: &MediaFormat) -> ReframeResult<usize>;

    fn start(&mut self) -> ReframeResult<()>;

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> ReframeResult<()>;

    /// Finalize the container.
    fn stop(&mut self) -> ReframeResult<()>;

    /// Free the muxer. Safe to call repeatedly.
    fn release(&mut self);
}

pub trait DemuxerFactory: Send + Sync {
    fn open(&self, path: &Path) -> ReframeResult<Box<dyn Demuxer>>;
}

pub trait CodecFactory: Send + Sync {
    /// A decoder for `mime`, or a codec-configuration error when unsupported.
    fn create_decoder(&self, mime: &str) -> ReframeResult<Box<dyn Decoder>>;

    /// An encoder for `mime`, or a codec-configuration error when unsupported.
    fn create_encoder(&self, mime: &str) -> ReframeResult<Box<dyn Encoder>>;
}

pub trait GpuFactory: Send + Sync {
    fn create_context(&self) -> ReframeResult<Box<dyn GpuContext>>;
}

pub trait MuxerFactory: Send + Sync {
    fn supports(&self, kind: ContainerKind) -> bool;

    fn create(&self, path: &Path, kind: ContainerKind) -> ReframeResult<Box<dyn Muxer>>;
}

/// The set of adapters a job runs against.
#[derive(Clone)]
pub struct MediaPlatform {
    pub demuxers: Arc<dyn DemuxerFactory>,
    pub codecs: Arc<dyn CodecFactory>,
    pub gpu: Arc<dyn GpuFactory>,
    pub muxers: Arc<dyn MuxerFactory>,
}
