//! # Test Tone Source
//!
//! A synthetic [`AudioBackend`] producing a phase-continuous sine wave, paced in
//! real time at one block per `chunk_size / sample_rate` seconds. Useful for
//! running the pipeline on machines without an input device.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use crate::audio::{AudioBackend, AudioSource, StopSignal};
use crate::config::PipelineConfig;
use crate::error::{Result, SpectrumError};
use crate::{sample_bounds, SampleBlock};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneBackend {
    /// Tone frequency in Hz.
    pub frequency: f64,
    /// Peak amplitude as a fraction of full scale, in `(0, 1]`.
    pub amplitude: f64,
    /// Sleep between blocks to mimic device pacing. Disable for fast tests.
    pub realtime: bool,
}

impl Default for ToneBackend {
    fn default() -> Self {
        Self {
            frequency: 1000.0,
            amplitude: 0.25,
            realtime: true,
        }
    }
}

impl ToneBackend {
    pub fn new(frequency: f64, amplitude: f64) -> Self {
        Self {
            frequency,
            amplitude,
            ..Default::default()
        }
    }
}

impl AudioBackend for ToneBackend {
    fn open(&self, config: &PipelineConfig, stop: StopSignal) -> Result<Box<dyn AudioSource>> {
        if !(self.amplitude > 0.0 && self.amplitude <= 1.0) {
            return Err(SpectrumError::InvalidConfiguration(format!(
                "tone amplitude {} outside (0, 1]",
                self.amplitude
            )));
        }
        if !(self.frequency.is_finite() && self.frequency >= 0.0) {
            return Err(SpectrumError::InvalidConfiguration(format!(
                "tone frequency {} Hz is not a finite non-negative value",
                self.frequency
            )));
        }
        let nyquist = f64::from(config.sample_rate) / 2.0;
        if self.frequency > nyquist {
            return Err(SpectrumError::UnsupportedFormat(format!(
                "tone at {} Hz is above the {} Hz Nyquist limit",
                self.frequency, nyquist
            )));
        }
        let (_, max) = sample_bounds(config.bit_depth)?;
        Ok(Box::new(ToneSource {
            tone: *self,
            peak: self.amplitude * max as f64,
            chunk_size: config.chunk_size,
            sample_rate: config.sample_rate,
            bit_depth: config.bit_depth,
            block_duration: config.block_duration(),
            position: 0,
            next_due: Instant::now(),
            stop,
            open: true,
        }))
    }
}

struct ToneSource {
    tone: ToneBackend,
    peak: f64,
    chunk_size: usize,
    sample_rate: u32,
    bit_depth: u16,
    block_duration: Duration,
    /// Index of the next sample, keeps the phase continuous across blocks.
    position: u64,
    next_due: Instant,
    stop: StopSignal,
    open: bool,
}

impl AudioSource for ToneSource {
    fn read_block(&mut self) -> Result<SampleBlock> {
        if !self.open {
            return Err(SpectrumError::DeviceRead("tone source is closed".into()));
        }
        if self.tone.realtime {
            self.next_due += self.block_duration;
            let wait = self.next_due.saturating_duration_since(Instant::now());
            if self.stop.wait_timeout(wait) {
                self.close();
                return Err(SpectrumError::DeviceRead(
                    "capture closed by stop request".into(),
                ));
            }
        } else if self.stop.is_raised() {
            self.close();
            return Err(SpectrumError::DeviceRead(
                "capture closed by stop request".into(),
            ));
        }

        let step = 2.0 * PI * self.tone.frequency / f64::from(self.sample_rate);
        let samples = (0..self.chunk_size as u64)
            .map(|i| {
                let n = (self.position + i) as f64;
                (self.peak * (step * n).sin()).round() as i32
            })
            .collect();
        self.position += self.chunk_size as u64;
        SampleBlock::new(samples, self.sample_rate, self.bit_depth)
    }

    fn close(&mut self) {
        self.open = false;
    }
}
