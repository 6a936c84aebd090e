//! Media formats, buffer metadata, and container kinds.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use reframe_common::error::ReframeError;
use serde::{Deserialize, Serialize};

/// Well-known codec mime types.
pub mod mime {
    pub const VIDEO_AVC: &str = "video/avc";
    pub const VIDEO_HEVC: &str = "video/hevc";
    pub const VIDEO_VP8: &str = "video/x-vnd.on2.vp8";
    pub const VIDEO_VP9: &str = "video/x-vnd.on2.vp9";
    pub const VIDEO_AV1: &str = "video/av01";
    pub const AUDIO_AAC: &str = "audio/mp4a-latm";
    pub const AUDIO_OPUS: &str = "audio/opus";
    pub const AUDIO_RAW: &str = "audio/raw";
}

/// AAC Low Complexity object type.
pub const AAC_PROFILE_LC: u32 = 2;

/// Kind of elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Mime prefix identifying tracks of this kind.
    pub fn mime_prefix(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.starts_with(MediaKind::Video.mime_prefix()) {
            Some(MediaKind::Video)
        } else if mime.starts_with(MediaKind::Audio.mime_prefix()) {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Mp4,
    WebM,
}

impl ContainerKind {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerKind::Mp4 => "mp4",
            ContainerKind::WebM => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ContainerKind::Mp4 => "video/mp4",
            ContainerKind::WebM => "video/webm",
        }
    }

    /// Whether finished files get the fast-start rewrite.
    pub fn supports_fast_start(self) -> bool {
        matches!(self, ContainerKind::Mp4)
    }
}

impl FromStr for ContainerKind {
    type Err = ReframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" | "mpeg4" | "m4v" => Ok(ContainerKind::Mp4),
            "webm" => Ok(ContainerKind::WebM),
            other => Err(ReframeError::config(format!(
                "Unknown container kind: {other}. Use: mp4, webm"
            ))),
        }
    }
}

/// Format description of a track or a codec's input/output.
///
/// Unset fields are unknown; encoders resolve them from the source track.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaFormat {
    pub mime: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    /// Seconds between key frames (encoders only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i_frame_interval: Option<u32>,
    /// Encoder consumes frames from an input surface.
    #[serde(default)]
    pub surface_input: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aac_profile: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<i64>,

    /// Codec-specific data (`csd-0`, `csd-1`, ...), e.g. SPS/PPS for AVC.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codec_specific_data: Vec<Vec<u8>>,
}

impl MediaFormat {
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    pub fn audio(mime: impl Into<String>, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.into(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_mime(&self.mime)
    }

    pub fn with_csd(mut self, csd: Vec<u8>) -> Self {
        self.codec_specific_data.push(csd);
        self
    }

    /// Check that a muxer can describe this track.
    pub fn validate_for_muxing(&self) -> Result<(), String> {
        match self.kind() {
            Some(MediaKind::Video) => {
                if self.width.unwrap_or(0) == 0 || self.height.unwrap_or(0) == 0 {
                    return Err(format!("{} track has no dimensions", self.mime));
                }
                Ok(())
            }
            Some(MediaKind::Audio) => {
                if self.sample_rate.unwrap_or(0) == 0 || self.channel_count.unwrap_or(0) == 0 {
                    return Err(format!(
                        "{} track has no sample rate or channel count",
                        self.mime
                    ));
                }
                Ok(())
            }
            None => Err(format!("unrecognised track mime type {:?}", self.mime)),
        }
    }
}

/// Per-buffer flags shared by codecs, demuxers and muxers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const KEY_FRAME: BufferFlags = BufferFlags(1);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(2);
    pub const END_OF_STREAM: BufferFlags = BufferFlags(4);

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Metadata of one buffer handed between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn new(size: usize, presentation_time_us: i64, flags: BufferFlags) -> Self {
        Self {
            size,
            presentation_time_us,
            flags,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }
}

/// A compressed sample read from a demultiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Vec<u8>,
    pub time_us: i64,
    pub flags: BufferFlags,
}

impl Sample {
    pub fn info(&self) -> BufferInfo {
        BufferInfo::new(self.data.len(), self.time_us, self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mime_prefix() {
        assert_eq!(MediaKind::from_mime(mime::VIDEO_VP9), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime(mime::AUDIO_AAC), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_mime("text/vtt"), None);
    }

    #[test]
    fn test_container_kind_parsing() {
        assert_eq!("MP4".parse::<ContainerKind>().unwrap(), ContainerKind::Mp4);
        assert_eq!("webm".parse::<ContainerKind>().unwrap(), ContainerKind::WebM);
        assert!("avi".parse::<ContainerKind>().is_err());
        assert!(ContainerKind::Mp4.supports_fast_start());
        assert!(!ContainerKind::WebM.supports_fast_start());
    }

    #[test]
    fn test_flags_combine() {
        let flags = BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM;
        assert!(flags.contains(BufferFlags::KEY_FRAME));
        assert!(flags.contains(BufferFlags::END_OF_STREAM));
        assert!(!flags.contains(BufferFlags::CODEC_CONFIG));
        assert!(!BufferFlags::NONE.contains(BufferFlags::NONE));
    }

    #[test]
    fn test_validate_for_muxing() {
        assert!(MediaFormat::video(mime::VIDEO_AVC, 1280, 720)
            .validate_for_muxing()
            .is_ok());
        assert!(MediaFormat::audio(mime::AUDIO_AAC, 48_000, 0)
            .validate_for_muxing()
            .is_err());
        let mut incomplete = MediaFormat::video(mime::VIDEO_HEVC, 640, 480);
        incomplete.height = None;
        assert!(incomplete.validate_for_muxing().is_err());
    }
}
