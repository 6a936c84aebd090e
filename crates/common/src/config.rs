//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory under which per-job working directories are created.
    pub work_root: PathBuf,

    /// Codec polling parameters.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Encoder parameters used when a job leaves them unset.
    #[serde(default)]
    pub defaults: EncodeDefaults,

    /// How decoded PCM is staged before re-encoding.
    #[serde(default)]
    pub audio_staging: AudioStaging,

    /// Fail the merge when either the video or the audio output is missing.
    #[serde(default = "default_true")]
    pub require_both_tracks: bool,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-call timeouts and buffer sizes for the codec poll loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Timeout of each dequeue call against a codec.
    pub poll_timeout_ms: u64,

    /// How long the render surface waits for a decoded image.
    pub image_timeout_ms: u64,

    /// Maximum input buffer size requested from encoders.
    pub input_buffer_size: usize,

    /// Decoded PCM held in memory under direct staging before the decoder
    /// is left to back up.
    #[serde(default = "default_max_staged_pcm")]
    pub max_staged_pcm_bytes: usize,
}

/// Fallback encoder parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeDefaults {
    pub video_bitrate: u32,
    pub frame_rate: u32,
    /// Seconds between key frames.
    pub i_frame_interval: u32,
    pub audio_bitrate: u32,
}

/// Staging strategy for decoded audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioStaging {
    /// Pipe decoder output straight into the encoder within one loop.
    #[default]
    Direct,
    /// Decode everything into a raw PCM file first, then encode it.
    TempFile,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "reframe_engine=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            pipeline: PipelineSettings::default(),
            defaults: EncodeDefaults::default(),
            audio_staging: AudioStaging::default(),
            require_both_tracks: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10,
            image_timeout_ms: 2500,
            input_buffer_size: 655_360,
            max_staged_pcm_bytes: default_max_staged_pcm(),
        }
    }
}

impl PipelineSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }
}

impl Default for EncodeDefaults {
    fn default() -> Self {
        Self {
            video_bitrate: 1_000_000,
            frame_rate: 30,
            i_frame_interval: 1,
            audio_bitrate: 192_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl EngineConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }

    /// Path the config is loaded from.
    pub fn path() -> PathBuf {
        config_file_path()
    }
}

fn default_true() -> bool {
    true
}

fn default_max_staged_pcm() -> usize {
    4 * 1024 * 1024
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("reframe").join("config.json")
}

/// Default root for job working directories.
fn default_work_root() -> PathBuf {
    let base = std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".cache")
        });
    base.join("reframe").join("jobs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let json = r#"{ "work_root": "/var/tmp/reframe", "audio_staging": "temp_file" }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.work_root, PathBuf::from("/var/tmp/reframe"));
        assert_eq!(config.audio_staging, AudioStaging::TempFile);
        assert_eq!(config.pipeline.poll_timeout(), Duration::from_millis(10));
        assert_eq!(config.defaults.audio_bitrate, 192_000);
        assert!(config.require_both_tracks);
    }

    #[test]
    fn older_pipeline_section_gets_a_pcm_limit() {
        let json = r#"{
            "work_root": "/var/tmp/reframe",
            "pipeline": { "poll_timeout_ms": 5, "image_timeout_ms": 100, "input_buffer_size": 4096 }
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pipeline.poll_timeout_ms, 5);
        assert_eq!(config.pipeline.max_staged_pcm_bytes, 4 * 1024 * 1024);
    }
}
