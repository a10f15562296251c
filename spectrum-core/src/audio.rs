//! # Audio Capture Module
//!
//! This module handles real-time audio capture using CPAL (Cross-Platform Audio Library).
//! Capture is split into two traits so the pipeline can run against real
//! hardware or against fakes:
//!
//! - [`AudioBackend`] opens a device for a given configuration
//! - [`AudioSource`] yields fixed-size [`SampleBlock`]s from an open device
//!
//! ## Hand-off
//! The device callback accumulates raw bytes until a whole block is available and
//! pushes it into a capacity-1 channel. If the reader has not collected the previous
//! block yet, that block is discarded and counted as an overrun; capture itself never
//! waits on the reader.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfigRange};
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::{Result, SpectrumError};
use crate::SampleBlock;

/// A source of fixed-size sample blocks.
///
/// Implementations need not be `Send`: they are created and used on the
/// pipeline's processing thread.
pub trait AudioSource {
    /// Blocks until exactly `chunk_size` samples are available.
    ///
    /// Must return (with an error) within bounded time once the [`StopSignal`]
    /// passed to [`AudioBackend::open`] is raised.
    fn read_block(&mut self) -> Result<SampleBlock>;

    /// Releases the device. Calling it more than once is harmless.
    fn close(&mut self);

    /// Blocks dropped because the reader fell behind.
    fn overruns(&self) -> u64 {
        0
    }
}

/// Opens capture sources. Moved onto the processing thread at pipeline start.
pub trait AudioBackend: Send + 'static {
    fn open(&self, config: &PipelineConfig, stop: StopSignal) -> Result<Box<dyn AudioSource>>;
}

/// Cancellation token observed by blocking reads.
///
/// Raised by dropping the paired [`StopTrigger`], which disconnects the channel
/// and wakes every receiver at once.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

#[derive(Debug)]
pub struct StopTrigger {
    tx: Option<Sender<()>>,
}

/// Creates a linked trigger/signal pair.
pub fn stop_signal() -> (StopTrigger, StopSignal) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (StopTrigger { tx: Some(tx) }, StopSignal { rx })
}

impl StopTrigger {
    pub fn raise(&mut self) {
        self.tx.take();
    }

    pub fn is_raised(&self) -> bool {
        self.tx.is_none()
    }
}

impl StopSignal {
    pub fn is_raised(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for at most `timeout`. Returns `true` if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }

    /// For use in `select!` alongside other channels; becomes ready when raised.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Decodes native-endian signed integers of `bit_depth` bits.
///
/// # Arguments
/// * `bytes` - Raw capture buffer, as delivered by the device
/// * `bit_depth` - Sample width; one of 8, 16 or 32
///
/// # Returns
/// One value per sample, in capture order
///
/// # Errors
/// * `Format` - unknown bit depth, or a length that is not a whole number of samples
pub fn decode_samples(bytes: &[u8], bit_depth: u16) -> Result<Vec<i32>> {
    let width = usize::from(bit_depth / 8);
    if width == 0 || !matches!(bit_depth, 8 | 16 | 32) {
        return Err(SpectrumError::Format(format!(
            "cannot decode {}-bit samples",
            bit_depth
        )));
    }
    if bytes.len() % width != 0 {
        return Err(SpectrumError::Format(format!(
            "{} bytes is not a multiple of the {}-byte sample size",
            bytes.len(),
            width
        )));
    }

    let samples = match bit_depth {
        8 => bytes.iter().map(|&b| i32::from(b as i8)).collect(),
        16 => bytes
            .chunks_exact(2)
            .map(|c| i32::from(i16::from_ne_bytes([c[0], c[1]])))
            .collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    };
    Ok(samples)
}

/// Cuts the device's arbitrarily sized buffers into whole blocks and hands
/// each one to the reader through a capacity-1 channel.
///
/// Runs on the device callback thread, so it never blocks: when the reader has
/// not collected the previous block, that block is evicted and counted as an
/// overrun.
pub struct BlockAssembler {
    pending: Vec<u8>,
    block_bytes: usize,
    tx: Sender<Vec<u8>>,
    drain_rx: Receiver<Vec<u8>>,
    overruns: Arc<AtomicU64>,
}

impl BlockAssembler {
    /// Returns the assembler and the receiving end the reader collects blocks from.
    pub fn new(block_bytes: usize, overruns: Arc<AtomicU64>) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let assembler = Self {
            pending: Vec::with_capacity(block_bytes * 2),
            block_bytes,
            tx,
            drain_rx: rx.clone(),
            overruns,
        };
        (assembler, rx)
    }

    /// Appends one device buffer and publishes every block it completes.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.block_bytes == 0 {
            return;
        }
        self.pending.extend_from_slice(bytes);

        while self.pending.len() >= self.block_bytes {
            let block: Vec<u8> = self.pending.drain(..self.block_bytes).collect();
            if let Err(TrySendError::Full(block)) = self.tx.try_send(block) {
                // Latest wins: evict the unread block and retry once.
                if self.drain_rx.try_recv().is_ok() {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                }
                let _ = self.tx.try_send(block);
            }
        }
    }

    /// Bytes held back until the next block completes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Passes a stream error from the device callback to the reader.
///
/// Only the first error is kept; the reader stops on it anyway.
fn forward_stream_error(tx: &Sender<SpectrumError>, err: cpal::StreamError) {
    let err = SpectrumError::from(err);
    if tx.try_send(err).is_err() {
        warn!("[CAPTURE] Dropping stream error; one is already pending");
    }
}

/// Integer sample format that carries `bit_depth` bits.
fn sample_format_for(bit_depth: u16) -> Result<SampleFormat> {
    match bit_depth {
        8 => Ok(SampleFormat::I8),
        16 => Ok(SampleFormat::I16),
        32 => Ok(SampleFormat::I32),
        other => Err(SpectrumError::UnsupportedFormat(format!(
            "no integer sample format for {} bits",
            other
        ))),
    }
}

/// Captures from the default input device of the default host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(&self, config: &PipelineConfig, stop: StopSignal) -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(CpalSource::open(config, stop)?))
    }
}

/// An open CPAL input stream delivering whole blocks.
pub struct CpalSource {
    stream: Option<cpal::Stream>,
    blocks: Receiver<Vec<u8>>,
    errors: Receiver<SpectrumError>,
    stop: StopSignal,
    overruns: Arc<AtomicU64>,
    reported_overruns: u64,
    chunk_size: usize,
    sample_rate: u32,
    bit_depth: u16,
}

impl CpalSource {
    /// Opens the default input device.
    ///
    /// # Errors
    /// * `DeviceUnavailable` - no input device, or the stream could not start
    /// * `UnsupportedFormat` - no mono integer configuration covers the requested rate
    pub fn open(config: &PipelineConfig, stop: StopSignal) -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            SpectrumError::DeviceUnavailable("no default input device".into())
        })?;

        info!("[CAPTURE] Using audio input device: {}", device.name()?);

        let format = sample_format_for(config.bit_depth)?;
        let configs = device.supported_input_configs()?.collect::<Vec<_>>();
        let supported = find_supported_config(configs, config.sample_rate, config.channels, format)
            .ok_or_else(|| {
                SpectrumError::UnsupportedFormat(format!(
                    "device offers no {} Hz, {}-bit, {}-channel input",
                    config.sample_rate, config.bit_depth, config.channels
                ))
            })?;
        let stream_config: cpal::StreamConfig = supported
            .with_sample_rate(cpal::SampleRate(config.sample_rate))
            .into();

        info!(
            "[CAPTURE] Selected {} Hz, {:?}, {} channel(s)",
            config.sample_rate, format, stream_config.channels
        );

        let block_bytes = config.chunk_size * config.bytes_per_sample();
        let overruns = Arc::new(AtomicU64::new(0));
        let (mut assembler, block_rx) = BlockAssembler::new(block_bytes, Arc::clone(&overruns));
        let (err_tx, err_rx) = crossbeam_channel::bounded::<SpectrumError>(1);

        let stream = device.build_input_stream_raw(
            &stream_config,
            format,
            move |data: &cpal::Data, _: &cpal::InputCallbackInfo| assembler.push(data.bytes()),
            move |err| forward_stream_error(&err_tx, err),
            None,
        )?;

        stream.play()?;

        Ok(Self {
            stream: Some(stream),
            blocks: block_rx,
            errors: err_rx,
            stop,
            overruns,
            reported_overruns: 0,
            chunk_size: config.chunk_size,
            sample_rate: config.sample_rate,
            bit_depth: config.bit_depth,
        })
    }

    fn decode_block(&self, bytes: &[u8]) -> Result<SampleBlock> {
        let samples = decode_samples(bytes, self.bit_depth)?;
        if samples.len() != self.chunk_size {
            return Err(SpectrumError::DeviceRead(format!(
                "short read: {} of {} samples",
                samples.len(),
                self.chunk_size
            )));
        }
        SampleBlock::new(samples, self.sample_rate, self.bit_depth)
    }

    fn report_overruns(&mut self) {
        let total = self.overruns.load(Ordering::Relaxed);
        if total > self.reported_overruns {
            warn!(
                "[CAPTURE] Overrun: {} block(s) dropped ({} total)",
                total - self.reported_overruns,
                total
            );
            self.reported_overruns = total;
        }
    }
}

impl AudioSource for CpalSource {
    fn read_block(&mut self) -> Result<SampleBlock> {
        if self.stream.is_none() {
            return Err(SpectrumError::DeviceRead("capture stream is closed".into()));
        }

        let result = select! {
            recv(self.blocks) -> msg => match msg {
                Ok(bytes) => self.decode_block(&bytes),
                Err(_) => Err(SpectrumError::DeviceRead("capture stream disconnected".into())),
            },
            recv(self.errors) -> msg => Err(msg.unwrap_or_else(|_| {
                SpectrumError::DeviceRead("capture stream disconnected".into())
            })),
            recv(self.stop.receiver()) -> _ => {
                Err(SpectrumError::DeviceRead("capture closed by stop request".into()))
            },
        };

        self.report_overruns();
        if result.is_err() {
            self.close();
        }
        result
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("[CAPTURE] Error pausing stream: {}", e);
            }
            drop(stream);
            info!("[CAPTURE] Input device closed");
        }
    }

    fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Picks a mono configuration of the wanted sample format whose rate range
/// contains `target_rate`.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
    channels: u16,
    format: SampleFormat,
) -> Option<SupportedStreamConfigRange> {
    configs.into_iter().find(|c| {
        c.channels() == channels
            && c.sample_format() == format
            && c.min_sample_rate().0 <= target_rate
            && target_rate <= c.max_sample_rate().0
    })
}
