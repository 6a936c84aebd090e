//! Clock and timing utilities for presentation timestamps.
//!
//! Codecs exchange timestamps in microseconds while the GPU swap path wants
//! nanoseconds. Re-encoded PCM has no container timestamps of its own, so its
//! presentation time is derived from the number of bytes fed to the encoder.

use std::time::Instant;

/// Wall and monotonic start point of a transcoding job.
#[derive(Debug, Clone)]
pub struct JobClock {
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,
}

impl JobClock {
    /// Create a new job clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Milliseconds elapsed since the job started.
    pub fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Seconds elapsed since the job started.
    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wall-clock time at job start.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    /// Convert a microsecond timestamp to nanoseconds.
    pub fn us_to_ns(us: i64) -> i64 {
        us.saturating_mul(1_000)
    }

    /// Convert a microsecond timestamp to seconds.
    pub fn us_to_secs(us: i64) -> f64 {
        us as f64 / 1_000_000.0
    }
}

/// Timestamp generator for interleaved 16-bit PCM.
///
/// `timestamp_us = 1_000_000 * (bytes / 2) / (sample_rate * channels)`.
#[derive(Debug, Clone)]
pub struct PcmClock {
    sample_rate: u32,
    channel_count: u32,
    bytes_consumed: u64,
}

impl PcmClock {
    pub fn new(sample_rate: u32, channel_count: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channel_count: channel_count.max(1),
            bytes_consumed: 0,
        }
    }

    /// Presentation time of the next byte to be consumed.
    pub fn timestamp_us(&self) -> i64 {
        Self::bytes_to_us(self.bytes_consumed, self.sample_rate, self.channel_count)
    }

    /// Record `bytes` as consumed and return the timestamp of the chunk start.
    pub fn consume(&mut self, bytes: usize) -> i64 {
        let start = self.timestamp_us();
        self.bytes_consumed += bytes as u64;
        start
    }

    /// Total bytes consumed so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Convert a PCM byte count to microseconds.
    pub fn bytes_to_us(bytes: u64, sample_rate: u32, channel_count: u32) -> i64 {
        let frames_per_sec = sample_rate.max(1) as u128 * channel_count.max(1) as u128;
        (1_000_000u128 * (bytes as u128 / 2) / frames_per_sec) as i64
    }
}
