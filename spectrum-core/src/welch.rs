//! # Welch Spectral Estimation Module
//!
//! Turns one captured [`SampleBlock`] into a [`PsdEstimate`] by averaging the
//! periodograms of overlapping, windowed segments.
//!
//! ## Method
//! - Segment length `L = chunk_size / segments_per_block` (remainder dropped)
//! - 50% overlap; samples after the last whole segment are truncated, never padded
//! - Each segment: mean removal, periodic Hann window, forward FFT, |X|²
//! - "Spectrum" scaling: divided by (Σw)² so a sine of amplitude `A` peaks near `A²/2`
//! - One-sided: every bin except DC (and Nyquist for even `L`) is doubled

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::config::MIN_SEGMENT_LENGTH;
use crate::error::{Result, SpectrumError};
use crate::{PsdEstimate, SampleBlock};

/// Removes the DC offset from a segment by making its average value zero.
fn remove_dc_offset(segment: &mut [f64]) {
    let len = segment.len();
    if len == 0 { return; }
    let avg = segment.iter().sum::<f64>() / len as f64;
    for sample in segment.iter_mut() {
        *sample -= avg;
    }
}

/// Periodic Hann window of length `n` (the DFT-even form used for spectral analysis).
fn hann_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / n as f64).cos()))
        .collect()
}

/// Reusable Welch estimator for a fixed segment length.
///
/// The FFT plan and window are computed once; [`estimate`](Self::estimate)
/// takes `&self` and can run on any thread.
pub struct SpectralEstimator {
    segment_length: usize,
    window: Vec<f64>,
    /// 1 / (Σw)²
    scale: f64,
    fft: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for SpectralEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralEstimator")
            .field("segment_length", &self.segment_length)
            .finish()
    }
}

impl SpectralEstimator {
    pub fn new(segment_length: usize) -> Result<Self> {
        if segment_length < MIN_SEGMENT_LENGTH {
            return Err(SpectrumError::InvalidConfiguration(format!(
                "segment length {} is below {}",
                segment_length, MIN_SEGMENT_LENGTH
            )));
        }
        let window = hann_window(segment_length);
        let window_sum: f64 = window.iter().sum();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(segment_length);
        Ok(Self {
            segment_length,
            window,
            scale: 1.0 / (window_sum * window_sum),
            fft,
        })
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    /// Number of output bins: `L/2 + 1`.
    pub fn bin_count(&self) -> usize {
        self.segment_length / 2 + 1
    }

    fn overlap(&self) -> usize {
        self.segment_length / 2
    }

    fn step(&self) -> usize {
        self.segment_length - self.overlap()
    }

    /// How many overlapping segments fit in `len` samples.
    pub fn segment_count(&self, len: usize) -> usize {
        if len < self.segment_length {
            0
        } else {
            (len - self.segment_length) / self.step() + 1
        }
    }

    /// Bin centre frequencies `i * sample_rate / L`.
    pub fn frequencies(&self, sample_rate: u32) -> Vec<f64> {
        let resolution = f64::from(sample_rate) / self.segment_length as f64;
        (0..self.bin_count()).map(|i| i as f64 * resolution).collect()
    }

    /// Estimates the power spectrum of one block.
    ///
    /// # Arguments
    /// * `block` - Captured samples; anything after the last whole segment is ignored
    ///
    /// # Returns
    /// One-sided averaged spectrum with `L / 2 + 1` bins spaced `sample_rate / L` apart
    ///
    /// # Errors
    /// * `InvalidConfiguration` - the block is shorter than one segment
    pub fn estimate(&self, block: &SampleBlock) -> Result<PsdEstimate> {
        let samples = block.samples();
        let segments = self.segment_count(samples.len());
        if segments == 0 {
            return Err(SpectrumError::InvalidConfiguration(format!(
                "block of {} samples is shorter than one segment of {}",
                samples.len(),
                self.segment_length
            )));
        }

        let bins = self.bin_count();
        let mut power = vec![0.0f64; bins];
        let mut segment = vec![0.0f64; self.segment_length];
        let mut buffer = vec![Complex { re: 0.0, im: 0.0 }; self.segment_length];

        for seg in 0..segments {
            let start = seg * self.step();
            for (dst, &src) in segment
                .iter_mut()
                .zip(&samples[start..start + self.segment_length])
            {
                *dst = f64::from(src);
            }
            remove_dc_offset(&mut segment);

            for ((slot, &sample), &w) in buffer.iter_mut().zip(&segment).zip(&self.window) {
                *slot = Complex { re: sample * w, im: 0.0 };
            }
            self.fft.process(&mut buffer);

            for (acc, c) in power.iter_mut().zip(&buffer) {
                *acc += c.norm_sqr();
            }
        }

        let norm = self.scale / segments as f64;
        // DC and, for even lengths, the Nyquist bin have no mirrored counterpart
        let last_doubled = if self.segment_length % 2 == 0 { bins - 1 } else { bins };
        for (i, p) in power.iter_mut().enumerate() {
            *p *= norm;
            if i > 0 && i < last_doubled {
                *p *= 2.0;
            }
        }

        Ok(PsdEstimate::from_parts(self.frequencies(block.sample_rate()), power))
    }
}

/// One-shot estimate without keeping the FFT plan around.
///
/// # Errors
/// * `InvalidConfiguration` - `segment_length` is below 8 or exceeds the block
pub fn estimate(block: &SampleBlock, segment_length: usize) -> Result<PsdEstimate> {
    SpectralEstimator::new(segment_length)?.estimate(block)
}
