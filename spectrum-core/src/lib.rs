// spectrum-core/src/lib.rs

//! The core logic for the live spectrum analyser.
//! This crate is responsible for audio capture, Welch spectral estimation,
//! note labelling and the fixed-cadence update pipeline. It is completely
//! headless and contains no rendering code.

pub mod audio;
pub mod config;
pub mod error;
pub mod notes;
pub mod pipeline;
pub mod tone;
pub mod welch;

pub use config::PipelineConfig;
pub use error::{Result, SpectrumError};
pub use notes::note_label_table;
pub use pipeline::{
    latest_output, register_tick_callback, start_pipeline, stop_pipeline, PipelineHandle,
    PipelineState, PipelineStatus, TickEvent,
};

use std::time::Instant;

/// One captured block of signed integer samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    samples: Vec<i32>,
    sample_rate: u32,
    bit_depth: u16,
}

impl SampleBlock {
    /// Wraps decoded samples, checking each one fits the bit depth.
    pub fn new(samples: Vec<i32>, sample_rate: u32, bit_depth: u16) -> Result<Self> {
        let (min, max) = sample_bounds(bit_depth)?;
        if let Some(bad) = samples.iter().find(|&&s| i64::from(s) < min || i64::from(s) > max) {
            return Err(SpectrumError::Format(format!(
                "sample {} does not fit {} bits",
                bad, bit_depth
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            bit_depth,
        })
    }

    /// The block published before the first capture completes.
    pub fn empty(sample_rate: u32, bit_depth: u16) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            bit_depth,
        }
    }

    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }
}

/// Inclusive value range of a signed sample with `bit_depth` bits.
pub fn sample_bounds(bit_depth: u16) -> Result<(i64, i64)> {
    if bit_depth == 0 || bit_depth > 32 {
        return Err(SpectrumError::InvalidConfiguration(format!(
            "bit depth {} outside [1, 32]",
            bit_depth
        )));
    }
    let half = 1i64 << (bit_depth - 1);
    Ok((-half, half - 1))
}

/// One-sided power spectrum: `(frequency Hz, power)` pairs in increasing frequency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PsdEstimate {
    frequencies: Vec<f64>,
    power: Vec<f64>,
}

impl PsdEstimate {
    pub(crate) fn from_parts(frequencies: Vec<f64>, power: Vec<f64>) -> Self {
        debug_assert_eq!(frequencies.len(), power.len());
        Self { frequencies, power }
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn power(&self) -> &[f64] {
        &self.power
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.frequencies.iter().copied().zip(self.power.iter().copied())
    }

    /// Spacing between adjacent bins in Hz.
    pub fn bin_width(&self) -> Option<f64> {
        match self.frequencies.as_slice() {
            [first, second, ..] => Some(second - first),
            _ => None,
        }
    }

    /// Strongest bin above DC, or `None` if every bin is silent.
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.iter()
            .skip(1)
            .filter(|&(_, p)| p > 0.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// The latest published snapshot of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Tick number; 0 for the initial empty snapshot.
    pub sequence: u64,
    pub waveform: SampleBlock,
    pub psd: PsdEstimate,
    pub timestamp: Instant,
}

impl PipelineOutput {
    pub fn empty(config: &PipelineConfig) -> Self {
        Self {
            sequence: 0,
            waveform: SampleBlock::empty(config.sample_rate, config.bit_depth),
            psd: PsdEstimate::default(),
            timestamp: Instant::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequence == 0
    }
}
