//! Per-track encode parameters and codec presets.

use std::fmt;
use std::str::FromStr;

use reframe_common::config::EncodeDefaults;
use reframe_common::error::{ReframeError, ReframeResult};
use reframe_media::format::{mime, ContainerKind, MediaFormat, MediaKind, AAC_PROFILE_LC};
use serde::{Deserialize, Serialize};

use crate::effect::FragmentEffect;

/// Requested video encoding. Unset fields come from the source track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEncodeSpec {
    /// Target codec mime type.
    pub codec: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub bit_rate: Option<u32>,
    #[serde(default)]
    pub frame_rate: Option<u32>,
    #[serde(default)]
    pub effect: FragmentEffect,
}

impl VideoEncodeSpec {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            width: None,
            height: None,
            bit_rate: None,
            frame_rate: None,
            effect: FragmentEffect::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_effect(mut self, effect: FragmentEffect) -> Self {
        self.effect = effect;
        self
    }

    /// Reject sizes hardware encoders cannot take.
    pub fn validate(&self) -> ReframeResult<()> {
        if MediaKind::from_mime(&self.codec) != Some(MediaKind::Video) {
            return Err(ReframeError::codec_config(format!(
                "{} is not a video codec",
                self.codec
            )));
        }
        match (self.width, self.height) {
            (None, None) => Ok(()),
            (Some(w), Some(h)) => {
                if w == 0 || h == 0 || w % 16 != 0 || h % 16 != 0 {
                    return Err(ReframeError::codec_config(format!(
                        "output size {w}x{h} must be non-zero multiples of 16"
                    )));
                }
                Ok(())
            }
            _ => Err(ReframeError::codec_config(
                "output width and height must be given together",
            )),
        }
    }

    /// Encoder input format for a source track.
    pub fn resolve(&self, source: &MediaFormat, defaults: &EncodeDefaults) -> ReframeResult<MediaFormat> {
        self.validate()?;
        let width = self.width.or(source.width).unwrap_or(0);
        let height = self.height.or(source.height).unwrap_or(0);
        if width == 0 || height == 0 {
            return Err(ReframeError::codec_config(format!(
                "cannot determine output size for {} source",
                source.mime
            )));
        }

        let mut format = MediaFormat::video(self.codec.as_str(), width, height);
        format.bit_rate = Some(self.bit_rate.or(source.bit_rate).unwrap_or(defaults.video_bitrate));
        format.frame_rate = Some(self.frame_rate.or(source.frame_rate).unwrap_or(defaults.frame_rate));
        format.i_frame_interval = Some(defaults.i_frame_interval);
        format.surface_input = true;
        Ok(format)
    }
}

/// Requested audio encoding. Sample rate and channels follow the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEncodeSpec {
    pub codec: String,
    #[serde(default)]
    pub bit_rate: Option<u32>,
}

impl AudioEncodeSpec {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            bit_rate: None,
        }
    }

    pub fn resolve(
        &self,
        source: &MediaFormat,
        defaults: &EncodeDefaults,
        input_buffer_size: usize,
    ) -> ReframeResult<MediaFormat> {
        if MediaKind::from_mime(&self.codec) != Some(MediaKind::Audio) {
            return Err(ReframeError::codec_config(format!(
                "{} is not an audio codec",
                self.codec
            )));
        }
        let (Some(sample_rate), Some(channels)) = (source.sample_rate, source.channel_count) else {
            return Err(ReframeError::codec_config(format!(
                "{} source has no sample rate or channel count",
                source.mime
            )));
        };

        let mut format = MediaFormat::audio(self.codec.as_str(), sample_rate, channels);
        format.bit_rate = Some(self.bit_rate.unwrap_or(defaults.audio_bitrate));
        format.max_input_size = Some(input_buffer_size);
        if self.codec == mime::AUDIO_AAC {
            format.aac_profile = Some(AAC_PROFILE_LC);
        }
        Ok(format)
    }
}

/// Codec and container combinations offered to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecPreset {
    #[default]
    H264AacMp4,
    H265AacMp4,
    Vp9OpusWebm,
}

impl CodecPreset {
    pub fn video_codec(self) -> &'static str {
        match self {
            CodecPreset::H264AacMp4 => mime::VIDEO_AVC,
            CodecPreset::H265AacMp4 => mime::VIDEO_HEVC,
            CodecPreset::Vp9OpusWebm => mime::VIDEO_VP9,
        }
    }

    pub fn audio_codec(self) -> &'static str {
        match self {
            CodecPreset::H264AacMp4 | CodecPreset::H265AacMp4 => mime::AUDIO_AAC,
            CodecPreset::Vp9OpusWebm => mime::AUDIO_OPUS,
        }
    }

    pub fn container(self) -> ContainerKind {
        match self {
            CodecPreset::H264AacMp4 | CodecPreset::H265AacMp4 => ContainerKind::Mp4,
            CodecPreset::Vp9OpusWebm => ContainerKind::WebM,
        }
    }

    pub fn video_spec(self) -> VideoEncodeSpec {
        VideoEncodeSpec::new(self.video_codec())
    }

    pub fn audio_spec(self) -> AudioEncodeSpec {
        AudioEncodeSpec::new(self.audio_codec())
    }
}

impl fmt::Display for CodecPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodecPreset::H264AacMp4 => "h264_aac_mp4",
            CodecPreset::H265AacMp4 => "h265_aac_mp4",
            CodecPreset::Vp9OpusWebm => "vp9_opus_webm",
        })
    }
}

impl FromStr for CodecPreset {
    type Err = ReframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "h264_aac_mp4" | "h264" | "avc" => Ok(CodecPreset::H264AacMp4),
            "h265_aac_mp4" | "h265" | "hevc" => Ok(CodecPreset::H265AacMp4),
            "vp9_opus_webm" | "vp9" | "webm" => Ok(CodecPreset::Vp9OpusWebm),
            other => Err(ReframeError::config(format!(
                "Unknown codec preset: {other}. Use: h264_aac_mp4, h265_aac_mp4, vp9_opus_webm"
            ))),
        }
    }
}
