//! In-process stand-ins for hardware codecs and the GPU.
//!
//! Video frames travel the same route they would on a device: the decoder
//! renders into the GPU's external image, the GPU swaps into the encoder's
//! input surface, and the encoder turns each swapped frame into a chunk.
//! Containers are real MPEG-4 files written and read by `reframe-mp4`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::capability::{
    Codec, CodecFactory, CodecOutput, Decoder, Encoder, GpuContext, GpuFactory, InputSlot,
    MediaPlatform, Muxer, MuxerFactory, OutputBuffer, ProgramId,
};
use reframe_media::format::{mime, BufferFlags, BufferInfo, ContainerKind, MediaFormat, Sample};
use reframe_media::surface::SurfaceHandle;
use reframe_mp4::{Mp4Muxer, NativeDemuxerFactory, NativeMuxerFactory};

pub const SPS: [u8; 9] = [0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0x95];
pub const PPS: [u8; 8] = [0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];
pub const AAC_CONFIG: [u8; 2] = [0x12, 0x10];

pub const SOURCE_FPS: i64 = 30;
pub const SOURCE_RATE: u32 = 44_100;
pub const SOURCE_CHANNELS: u32 = 2;
pub const AAC_FRAME: i64 = 1024;

/// Counts platform objects created and released.
#[derive(Default)]
pub struct Ledger {
    created: AtomicUsize,
    released: AtomicUsize,
    pub audio_pts: Mutex<Vec<i64>>,
    pub video_pts: Mutex<Vec<i64>>,
    pub webm_tracks: Mutex<Vec<String>>,
}

impl Ledger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(&self) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn release_once(&self, released: &mut bool) {
        if !*released {
            *released = true;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.created() - self.released.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct FakeOptions {
    /// Time the video decoder spends on each frame.
    pub frame_delay: Duration,
    /// Fail every Nth image acquisition on the GPU.
    pub drop_every: Option<u64>,
    /// Input buffer size of the audio encoder.
    pub audio_input_capacity: usize,
    /// Register a WebM muxer behind the native one.
    pub webm: bool,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            frame_delay: Duration::ZERO,
            drop_every: None,
            audio_input_capacity: 3_000,
            webm: false,
        }
    }
}

pub fn platform(ledger: &Arc<Ledger>, options: FakeOptions) -> MediaPlatform {
    let muxers = if options.webm {
        NativeMuxerFactory::with_fallback(Arc::new(FakeWebmMuxerFactory {
            ledger: ledger.clone(),
        }))
    } else {
        NativeMuxerFactory::new()
    };
    MediaPlatform {
        demuxers: Arc::new(NativeDemuxerFactory),
        codecs: Arc::new(FakeCodecs {
            ledger: ledger.clone(),
            options: options.clone(),
        }),
        gpu: Arc::new(FakeGpuFactory {
            ledger: ledger.clone(),
            drop_every: options.drop_every,
        }),
        muxers: Arc::new(muxers),
    }
}

pub fn test_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("reframe_engine_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn source_video_frames(seconds: i64) -> i64 {
    seconds * SOURCE_FPS
}

pub fn source_audio_frames(seconds: i64) -> i64 {
    (seconds * SOURCE_RATE as i64 + AAC_FRAME - 1) / AAC_FRAME
}

/// Write an AVC 320x240 @ 30 fps + AAC 44.1 kHz stereo source file.
pub fn write_source(path: &Path, seconds: i64) {
    let mut video_format = MediaFormat::video(mime::VIDEO_AVC, 320, 240)
        .with_csd(SPS.to_vec())
        .with_csd(PPS.to_vec());
    video_format.frame_rate = Some(SOURCE_FPS as u32);
    let audio_format =
        MediaFormat::audio(mime::AUDIO_AAC, SOURCE_RATE, SOURCE_CHANNELS).with_csd(AAC_CONFIG.to_vec());

    let mut muxer = Mp4Muxer::create(path).unwrap();
    let video = muxer.add_track(&video_format).unwrap();
    let audio = muxer.add_track(&audio_format).unwrap();
    muxer.start().unwrap();

    let video_samples = (0..source_video_frames(seconds)).map(|i| Sample {
        data: vec![i as u8; 200],
        time_us: i * 1_000_000 / SOURCE_FPS,
        flags: if i % SOURCE_FPS == 0 {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        },
    });
    let mut audio_samples = (0..source_audio_frames(seconds))
        .map(|i| Sample {
            data: vec![0x21; 64],
            time_us: i * AAC_FRAME * 1_000_000 / SOURCE_RATE as i64,
            flags: BufferFlags::KEY_FRAME,
        })
        .peekable();

    for v in video_samples {
        while let Some(a) = audio_samples.next_if(|a| a.time_us <= v.time_us) {
            muxer.write_sample(audio, &a.data, &a.info()).unwrap();
        }
        muxer.write_sample(video, &v.data, &v.info()).unwrap();
    }
    for a in audio_samples {
        muxer.write_sample(audio, &a.data, &a.info()).unwrap();
    }
    muxer.stop().unwrap();
    muxer.release();
}

/// Decoded frame timestamps waiting on the GPU's external image.
pub struct ImageQueue(Mutex<VecDeque<i64>>);

/// Frames swapped into an encoder's input surface, in nanoseconds.
pub struct EncoderSink(Mutex<VecDeque<i64>>);

struct FakeCodecs {
    ledger: Arc<Ledger>,
    options: FakeOptions,
}

impl CodecFactory for FakeCodecs {
    fn create_decoder(&self, mime_type: &str) -> ReframeResult<Box<dyn Decoder>> {
        match mime_type {
            mime::VIDEO_AVC | mime::VIDEO_HEVC | mime::VIDEO_VP9 => {
                self.ledger.acquire();
                Ok(Box::new(FakeVideoDecoder {
                    ledger: self.ledger.clone(),
                    frame_delay: self.options.frame_delay,
                    image: None,
                    pending: VecDeque::new(),
                    outstanding: HashMap::new(),
                    next_index: 0,
                    released: false,
                }))
            }
            mime::AUDIO_AAC | mime::AUDIO_OPUS => {
                self.ledger.acquire();
                Ok(Box::new(FakeAudioDecoder {
                    ledger: self.ledger.clone(),
                    format: None,
                    pending: VecDeque::new(),
                    announced: false,
                    next_index: 0,
                    released: false,
                }))
            }
            other => Err(ReframeError::codec_config(format!("no decoder for {other}"))),
        }
    }

    fn create_encoder(&self, mime_type: &str) -> ReframeResult<Box<dyn Encoder>> {
        match mime_type {
            mime::VIDEO_AVC | mime::VIDEO_HEVC | mime::VIDEO_VP9 => {
                self.ledger.acquire();
                Ok(Box::new(FakeVideoEncoder {
                    ledger: self.ledger.clone(),
                    format: None,
                    sink: Arc::new(EncoderSink(Mutex::new(VecDeque::new()))),
                    announced: false,
                    config_sent: false,
                    eos_signaled: false,
                    eos_sent: false,
                    frames: 0,
                    released: false,
                }))
            }
            mime::AUDIO_AAC | mime::AUDIO_OPUS => {
                self.ledger.acquire();
                Ok(Box::new(FakeAudioEncoder {
                    ledger: self.ledger.clone(),
                    format: None,
                    capacity: self.options.audio_input_capacity,
                    pending: VecDeque::new(),
                    announced: false,
                    released: false,
                }))
            }
            other => Err(ReframeError::codec_config(format!("no encoder for {other}"))),
        }
    }
}

struct FakeVideoDecoder {
    ledger: Arc<Ledger>,
    frame_delay: Duration,
    image: Option<Arc<ImageQueue>>,
    pending: VecDeque<(i64, bool)>,
    outstanding: HashMap<usize, i64>,
    next_index: usize,
    released: bool,
}

impl Codec for FakeVideoDecoder {
    fn start(&mut self) -> ReframeResult<()> {
        if self.image.is_none() {
            return Err(ReframeError::codec_config("video decoder needs an output surface"));
        }
        Ok(())
    }

    fn stop(&mut self) -> ReframeResult<()> {
        Ok(())
    }

    fn release(&mut self) {
        self.ledger.release_once(&mut self.released);
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> ReframeResult<Option<InputSlot>> {
        if self.released {
            return Err(ReframeError::codec_config("decoder released"));
        }
        if self.pending.len() >= 4 {
            return Ok(None);
        }
        Ok(Some(InputSlot {
            index: 0,
            capacity: 1 << 20,
        }))
    }

    fn queue_input_buffer(
        &mut self,
        _slot: InputSlot,
        _data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> ReframeResult<()> {
        self.pending
            .push_back((presentation_time_us, flags.contains(BufferFlags::END_OF_STREAM)));
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> ReframeResult<CodecOutput> {
        let Some((pts, eos)) = self.pending.pop_front() else {
            return Ok(CodecOutput::TryAgainLater);
        };
        let index = self.next_index;
        self.next_index += 1;
        let info = if eos {
            BufferInfo::new(0, 0, BufferFlags::END_OF_STREAM)
        } else {
            if !self.frame_delay.is_zero() {
                std::thread::sleep(self.frame_delay);
            }
            self.outstanding.insert(index, pts);
            BufferInfo::new(1, pts, BufferFlags::NONE)
        };
        Ok(CodecOutput::Buffer(OutputBuffer {
            index,
            info,
            data: Vec::new(),
        }))
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> ReframeResult<()> {
        if let (Some(pts), true, Some(image)) = (self.outstanding.remove(&index), render, &self.image) {
            image.0.lock().unwrap().push_back(pts);
        }
        Ok(())
    }

    fn output_format(&self) -> ReframeResult<MediaFormat> {
        Ok(MediaFormat::video("video/raw", 320, 240))
    }
}

impl Decoder for FakeVideoDecoder {
    fn configure(&mut self, _format: &MediaFormat, surface: Option<&SurfaceHandle>) -> ReframeResult<()> {
        self.image = surface.and_then(|s| s.native::<ImageQueue>());
        Ok(())
    }
}

struct FakeGpuFactory {
    ledger: Arc<Ledger>,
    drop_every: Option<u64>,
}

impl GpuFactory for FakeGpuFactory {
    fn create_context(&self) -> ReframeResult<Box<dyn GpuContext>> {
        self.ledger.acquire();
        Ok(Box::new(FakeGpu {
            ledger: self.ledger.clone(),
            drop_every: self.drop_every,
            image: Arc::new(ImageQueue(Mutex::new(VecDeque::new()))),
            sink: None,
            latched: None,
            pts_ns: 0,
            awaits: 0,
            released: false,
        }))
    }
}

struct FakeGpu {
    ledger: Arc<Ledger>,
    drop_every: Option<u64>,
    image: Arc<ImageQueue>,
    sink: Option<Arc<EncoderSink>>,
    latched: Option<i64>,
    pts_ns: i64,
    awaits: u64,
    released: bool,
}

impl GpuContext for FakeGpu {
    fn bind_output(&mut self, target: &SurfaceHandle) -> ReframeResult<()> {
        self.sink = Some(
            target
                .native::<EncoderSink>()
                .ok_or_else(|| ReframeError::render("target is not an encoder surface"))?,
        );
        Ok(())
    }

    fn make_current(&mut self) -> ReframeResult<()> {
        Ok(())
    }

    fn compile_program(&mut self, vertex_src: &str, fragment_src: &str) -> ReframeResult<ProgramId> {
        if vertex_src.is_empty() || !fragment_src.contains("gl_FragColor") {
            return Err(ReframeError::render("shader does not compile"));
        }
        Ok(ProgramId(1))
    }

    fn create_external_image(&mut self) -> ReframeResult<SurfaceHandle> {
        Ok(SurfaceHandle::new(self.image.clone()))
    }

    fn await_new_image(&mut self, _timeout: Duration) -> ReframeResult<()> {
        let next = self.image.0.lock().unwrap().pop_front();
        let Some(pts) = next else {
            return Err(ReframeError::render("no image within timeout"));
        };
        self.awaits += 1;
        if self.drop_every.is_some_and(|n| self.awaits % n == 0) {
            return Err(ReframeError::render("image acquisition failed"));
        }
        self.latched = Some(pts);
        Ok(())
    }

    fn draw_external_image(&mut self, _program: ProgramId) -> ReframeResult<()> {
        if self.latched.is_none() {
            return Err(ReframeError::render("nothing latched"));
        }
        Ok(())
    }

    fn set_presentation_time(&mut self, time_ns: i64) -> ReframeResult<()> {
        self.pts_ns = time_ns;
        Ok(())
    }

    fn swap_buffers(&mut self) -> ReframeResult<()> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| ReframeError::render("no bound output"))?;
        sink.0.lock().unwrap().push_back(self.pts_ns);
        self.latched = None;
        Ok(())
    }

    fn release(&mut self) {
        self.ledger.release_once(&mut self.released);
    }
}

struct FakeVideoEncoder {
    ledger: Arc<Ledger>,
    format: Option<MediaFormat>,
    sink: Arc<EncoderSink>,
    announced: bool,
    config_sent: bool,
    eos_signaled: bool,
    eos_sent: bool,
    frames: u64,
    released: bool,
}

fn video_csd(mime_type: &str) -> Vec<Vec<u8>> {
    match mime_type {
        mime::VIDEO_AVC => vec![SPS.to_vec(), PPS.to_vec()],
        _ => vec![vec![0x01, 0x02, 0x03, 0x04]],
    }
}

impl Codec for FakeVideoEncoder {
    fn start(&mut self) -> ReframeResult<()> {
        if self.format.is_none() {
            return Err(ReframeError::codec_config("encoder not configured"));
        }
        Ok(())
    }

    fn stop(&mut self) -> ReframeResult<()> {
        Ok(())
    }

    fn release(&mut self) {
        self.ledger.release_once(&mut self.released);
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> ReframeResult<Option<InputSlot>> {
        Err(ReframeError::codec_config("surface-input encoder has no input buffers"))
    }

    fn queue_input_buffer(
        &mut self,
        _slot: InputSlot,
        _data: &[u8],
        _presentation_time_us: i64,
        _flags: BufferFlags,
    ) -> ReframeResult<()> {
        Err(ReframeError::codec_config("surface-input encoder has no input buffers"))
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> ReframeResult<CodecOutput> {
        if self.released {
            return Err(ReframeError::codec_config("encoder released"));
        }
        if !self.announced {
            self.announced = true;
            return Ok(CodecOutput::FormatChanged(self.output_format()?));
        }
        if !self.config_sent {
            self.config_sent = true;
            let data = self.output_format()?.codec_specific_data.concat();
            return Ok(CodecOutput::Buffer(OutputBuffer {
                index: 0,
                info: BufferInfo::new(data.len(), 0, BufferFlags::CODEC_CONFIG),
                data,
            }));
        }
        let next = self.sink.0.lock().unwrap().pop_front();
        if let Some(ns) = next {
            let pts = ns / 1_000;
            let flags = if self.frames % 30 == 0 {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::NONE
            };
            self.frames += 1;
            self.ledger.video_pts.lock().unwrap().push(pts);
            let data = vec![self.frames as u8; 24];
            return Ok(CodecOutput::Buffer(OutputBuffer {
                index: 0,
                info: BufferInfo::new(data.len(), pts, flags),
                data,
            }));
        }
        if self.eos_signaled && !self.eos_sent {
            self.eos_sent = true;
            return Ok(CodecOutput::Buffer(OutputBuffer {
                index: 0,
                info: BufferInfo::new(0, 0, BufferFlags::END_OF_STREAM),
                data: Vec::new(),
            }));
        }
        Ok(CodecOutput::TryAgainLater)
    }

    fn release_output_buffer(&mut self, _index: usize, _render: bool) -> ReframeResult<()> {
        Ok(())
    }

    fn output_format(&self) -> ReframeResult<MediaFormat> {
        let configured = self
            .format
            .as_ref()
            .ok_or_else(|| ReframeError::codec_config("encoder not configured"))?;
        let mut format = MediaFormat::video(
            configured.mime.as_str(),
            configured.width.unwrap_or(0),
            configured.height.unwrap_or(0),
        );
        format.frame_rate = configured.frame_rate;
        format.bit_rate = configured.bit_rate;
        format.codec_specific_data = video_csd(&configured.mime);
        Ok(format)
    }
}

impl Encoder for FakeVideoEncoder {
    fn configure(&mut self, format: &MediaFormat) -> ReframeResult<()> {
        if !format.surface_input {
            return Err(ReframeError::codec_config("video encoder expects surface input"));
        }
        self.format = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> ReframeResult<SurfaceHandle> {
        Ok(SurfaceHandle::new(self.sink.clone()))
    }

    fn signal_end_of_input_stream(&mut self) -> ReframeResult<()> {
        self.eos_signaled = true;
        Ok(())
    }
}

struct FakeAudioDecoder {
    ledger: Arc<Ledger>,
    format: Option<MediaFormat>,
    pending: VecDeque<(i64, bool)>,
    announced: bool,
    next_index: usize,
    released: bool,
}

impl FakeAudioDecoder {
    fn layout(&self) -> (u32, u32) {
        let format = self.format.as_ref();
        (
            format.and_then(|f| f.sample_rate).unwrap_or(SOURCE_RATE),
            format.and_then(|f| f.channel_count).unwrap_or(SOURCE_CHANNELS),
        )
    }
}

impl Codec for FakeAudioDecoder {
    fn start(&mut self) -> ReframeResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> ReframeResult<()> {
        Ok(())
    }

    fn release(&mut self) {
        self.ledger.release_once(&mut self.released);
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> ReframeResult<Option<InputSlot>> {
        if self.pending.len() >= 4 {
            return Ok(None);
        }
        Ok(Some(InputSlot {
            index: 0,
            capacity: 1 << 16,
        }))
    }

    fn queue_input_buffer(
        &mut self,
        _slot: InputSlot,
        _data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> ReframeResult<()> {
        self.pending
            .push_back((presentation_time_us, flags.contains(BufferFlags::END_OF_STREAM)));
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> ReframeResult<CodecOutput> {
        if !self.announced {
            self.announced = true;
            let (rate, channels) = self.layout();
            return Ok(CodecOutput::FormatChanged(MediaFormat::audio(
                mime::AUDIO_RAW,
                rate,
                channels,
            )));
        }
        let Some((pts, eos)) = self.pending.pop_front() else {
            return Ok(CodecOutput::TryAgainLater);
        };
        let index = self.next_index;
        self.next_index += 1;
        let (_, channels) = self.layout();
        let data = if eos {
            Vec::new()
        } else {
            vec![(pts & 0x7F) as u8; AAC_FRAME as usize * channels as usize * 2]
        };
        let flags = if eos {
            BufferFlags::END_OF_STREAM
        } else {
            BufferFlags::NONE
        };
        Ok(CodecOutput::Buffer(OutputBuffer {
            index,
            info: BufferInfo::new(data.len(), pts, flags),
            data,
        }))
    }

    fn release_output_buffer(&mut self, _index: usize, _render: bool) -> ReframeResult<()> {
        Ok(())
    }

    fn output_format(&self) -> ReframeResult<MediaFormat> {
        let (rate, channels) = self.layout();
        Ok(MediaFormat::audio(mime::AUDIO_RAW, rate, channels))
    }
}

impl Decoder for FakeAudioDecoder {
    fn configure(&mut self, format: &MediaFormat, _surface: Option<&SurfaceHandle>) -> ReframeResult<()> {
        self.format = Some(format.clone());
        Ok(())
    }
}

struct FakeAudioEncoder {
    ledger: Arc<Ledger>,
    format: Option<MediaFormat>,
    capacity: usize,
    pending: VecDeque<(i64, bool)>,
    announced: bool,
    released: bool,
}

impl Codec for FakeAudioEncoder {
    fn start(&mut self) -> ReframeResult<()> {
        if self.format.is_none() {
            return Err(ReframeError::codec_config("encoder not configured"));
        }
        Ok(())
    }

    fn stop(&mut self) -> ReframeResult<()> {
        Ok(())
    }

    fn release(&mut self) {
        self.ledger.release_once(&mut self.released);
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> ReframeResult<Option<InputSlot>> {
        if self.pending.len() >= 8 {
            return Ok(None);
        }
        Ok(Some(InputSlot {
            index: 0,
            capacity: self.capacity,
        }))
    }

    fn queue_input_buffer(
        &mut self,
        _slot: InputSlot,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> ReframeResult<()> {
        if data.len() > self.capacity {
            return Err(ReframeError::codec_config("input larger than the buffer"));
        }
        let eos = flags.contains(BufferFlags::END_OF_STREAM);
        if !eos {
            self.ledger.audio_pts.lock().unwrap().push(presentation_time_us);
        }
        self.pending.push_back((presentation_time_us, eos));
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> ReframeResult<CodecOutput> {
        if !self.announced {
            self.announced = true;
            return Ok(CodecOutput::FormatChanged(self.output_format()?));
        }
        let Some((pts, eos)) = self.pending.pop_front() else {
            return Ok(CodecOutput::TryAgainLater);
        };
        let (data, flags) = if eos {
            (Vec::new(), BufferFlags::END_OF_STREAM)
        } else {
            (vec![0xAA; 12], BufferFlags::KEY_FRAME)
        };
        Ok(CodecOutput::Buffer(OutputBuffer {
            index: 0,
            info: BufferInfo::new(data.len(), pts, flags),
            data,
        }))
    }

    fn release_output_buffer(&mut self, _index: usize, _render: bool) -> ReframeResult<()> {
        Ok(())
    }

    fn output_format(&self) -> ReframeResult<MediaFormat> {
        let configured = self
            .format
            .as_ref()
            .ok_or_else(|| ReframeError::codec_config("encoder not configured"))?;
        let format = MediaFormat::audio(
            configured.mime.as_str(),
            configured.sample_rate.unwrap_or(0),
            configured.channel_count.unwrap_or(0),
        );
        Ok(match configured.mime.as_str() {
            mime::AUDIO_AAC => format.with_csd(AAC_CONFIG.to_vec()),
            _ => format.with_csd(vec![0x00, 0x02, 0x01, 0x38, 0x00, 0x00, 0xBB, 0x80, 0x00, 0x00, 0x00]),
        })
    }
}

impl Encoder for FakeAudioEncoder {
    fn configure(&mut self, format: &MediaFormat) -> ReframeResult<()> {
        self.format = Some(format.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> ReframeResult<SurfaceHandle> {
        Err(ReframeError::unsupported("audio encoders take buffers"))
    }

    fn signal_end_of_input_stream(&mut self) -> ReframeResult<()> {
        Err(ReframeError::unsupported("audio encoders take buffers"))
    }
}

/// Records tracks and writes a small summary file in place of WebM.
struct FakeWebmMuxerFactory {
    ledger: Arc<Ledger>,
}

impl MuxerFactory for FakeWebmMuxerFactory {
    fn supports(&self, kind: ContainerKind) -> bool {
        kind == ContainerKind::WebM
    }

    fn create(&self, path: &Path, _kind: ContainerKind) -> ReframeResult<Box<dyn Muxer>> {
        Ok(Box::new(FakeWebmMuxer {
            ledger: self.ledger.clone(),
            path: path.to_path_buf(),
            tracks: Vec::new(),
            samples: 0,
            started: false,
        }))
    }
}

struct FakeWebmMuxer {
    ledger: Arc<Ledger>,
    path: PathBuf,
    tracks: Vec<String>,
    samples: u64,
    started: bool,
}

impl Muxer for FakeWebmMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> ReframeResult<usize> {
        self.tracks.push(format.mime.clone());
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> ReframeResult<()> {
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: usize, _data: &[u8], _info: &BufferInfo) -> ReframeResult<()> {
        if !self.started || track >= self.tracks.len() {
            return Err(ReframeError::muxer("bad write"));
        }
        self.samples += 1;
        Ok(())
    }

    fn stop(&mut self) -> ReframeResult<()> {
        std::fs::write(
            &self.path,
            format!("webm {} {}", self.tracks.join(","), self.samples),
        )?;
        *self.ledger.webm_tracks.lock().unwrap() = self.tracks.clone();
        Ok(())
    }

    fn release(&mut self) {}
}
