//! # Configuration Module
//!
//! Capture and analysis settings for the pipeline. Every field has a default so
//! a partial JSON file (or none at all) yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SpectrumError};

/// Smallest segment that still gives a meaningful window.
pub const MIN_SEGMENT_LENGTH: usize = 8;

/// Upper bound on the capture block size (about 24 s at 44.1 kHz).
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capture rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Samples per captured block.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Signed integer sample width: 8, 16 or 32 bits.
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u16,
    /// Only mono capture is supported.
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Number of Welch segments a block is divided into.
    #[serde(default = "default_segments_per_block")]
    pub segments_per_block: usize,
    /// Nominal scheduler cadence.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            chunk_size: default_chunk_size(),
            bit_depth: default_bit_depth(),
            channels: default_channels(),
            segments_per_block: default_segments_per_block(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_chunk_size() -> usize {
    4096
}

fn default_bit_depth() -> u16 {
    16
}

fn default_channels() -> u16 {
    1
}

fn default_segments_per_block() -> usize {
    3
}

fn default_tick_interval_ms() -> u64 {
    20
}

impl PipelineConfig {
    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    /// * `Config` - the file cannot be read or is not valid JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SpectrumError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| SpectrumError::Config(e.to_string()))
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SpectrumError::Config(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| SpectrumError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Checks every setting before any device is touched.
    pub fn validate(&self) -> Result<()> {
        if self.channels != 1 {
            return Err(SpectrumError::UnsupportedFormat(format!(
                "{} channels requested, only mono capture is supported",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample rate must be positive"));
        }
        if !matches!(self.bit_depth, 8 | 16 | 32) {
            return Err(invalid(format!(
                "bit depth {} is not one of 8, 16, 32",
                self.bit_depth
            )));
        }
        if self.chunk_size < MIN_SEGMENT_LENGTH || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(format!(
                "chunk size {} outside [{}, {}]",
                self.chunk_size, MIN_SEGMENT_LENGTH, MAX_CHUNK_SIZE
            )));
        }
        if self.segments_per_block == 0 {
            return Err(invalid("segments per block must be at least 1"));
        }
        if self.segment_length() < MIN_SEGMENT_LENGTH {
            return Err(invalid(format!(
                "segment length {} is below {}",
                self.segment_length(),
                MIN_SEGMENT_LENGTH
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick interval must be at least 1 ms"));
        }
        Ok(())
    }

    /// Welch segment length; the remainder of the division is dropped.
    pub fn segment_length(&self) -> usize {
        self.chunk_size / self.segments_per_block.max(1)
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bit_depth / 8)
    }

    /// Wall-clock time needed to capture one block.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / f64::from(self.sample_rate.max(1)))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn invalid(msg: impl Into<String>) -> SpectrumError {
    SpectrumError::InvalidConfiguration(msg.into())
}
