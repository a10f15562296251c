//! # Update Pipeline Module
//!
//! Drives capture → estimate → publish on a dedicated processing thread.
//!
//! ## Lifecycle
//! - **Idle**: configuration is validated, the estimator and note table are built
//!   and the device is opened. Any failure here is returned from [`start_pipeline`].
//! - **Running**: each tick reads one block, estimates its spectrum, replaces the
//!   published [`PipelineOutput`] and notifies the tick callback. Ticks are spaced by
//!   at least `tick_interval`, but a tick can never be faster than one capture.
//! - **Stopped**: entered on [`PipelineHandle::stop`] or on the first runtime error.
//!   The device is closed and the state is final.
//!
//! Readers see the output through an `Arc` swapped under a short-lived lock, so
//! they observe either the previous or the new snapshot in full.

use log::{debug, error, info};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::audio::{stop_signal, AudioBackend, AudioSource, StopSignal, StopTrigger};
use crate::config::PipelineConfig;
use crate::error::{Result, SpectrumError};
use crate::notes;
use crate::welch::SpectralEstimator;
use crate::PipelineOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopped,
}

/// Out-of-band view of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub state: PipelineState,
    /// Completed ticks.
    pub ticks: u64,
    /// Blocks the capture stage dropped because processing fell behind.
    pub overruns: u64,
    /// The runtime error that stopped the pipeline, if any.
    pub last_error: Option<SpectrumError>,
}

/// Delivered to the tick callback on the processing thread.
#[derive(Debug, Clone)]
pub enum TickEvent {
    Output(Arc<PipelineOutput>),
    /// Sent once when the pipeline stops; carries the error that stopped it.
    Stopped(Option<SpectrumError>),
}

pub type TickCallback = Box<dyn FnMut(&TickEvent) + Send>;

struct Shared {
    output: Mutex<Arc<PipelineOutput>>,
    status: Mutex<PipelineStatus>,
    callback: Mutex<Option<TickCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: PipelineState) {
        lock(&self.status).state = state;
    }

    fn publish(&self, output: Arc<PipelineOutput>, overruns: u64) {
        *lock(&self.output) = output;
        let mut status = lock(&self.status);
        status.ticks += 1;
        status.overruns = overruns;
    }

    fn finish(&self, outcome: Option<SpectrumError>) {
        let mut status = lock(&self.status);
        status.state = PipelineState::Stopped;
        if outcome.is_some() {
            status.last_error = outcome;
        }
    }

    /// Runs the tick callback, turning a panic inside it into an error.
    fn notify(&self, event: &TickEvent) -> Result<()> {
        let mut slot = lock(&self.callback);
        let Some(callback) = slot.as_mut() else {
            return Ok(());
        };
        panic::catch_unwind(AssertUnwindSafe(|| callback(event))).map_err(|payload| {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            SpectrumError::Callback(detail)
        })
    }
}

/// Owner of a running pipeline. Dropping it stops the pipeline.
pub struct PipelineHandle {
    shared: Arc<Shared>,
    trigger: StopTrigger,
    worker: Option<JoinHandle<()>>,
    config: PipelineConfig,
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Validates `config`, opens the device through `backend` and starts ticking.
///
/// Returns only after the device is open, so setup errors surface here and
/// leave nothing running.
///
/// # Arguments
/// * `backend` - Opens the capture source; moved onto the processing thread
/// * `config` - Capture and analysis settings
///
/// # Returns
/// * `Ok(handle)` - The pipeline is `Running`
///
/// # Errors
/// * `InvalidConfiguration` / `UnsupportedFormat` - `config` failed validation
/// * `DeviceUnavailable` / `UnsupportedFormat` - the backend could not open the device
pub fn start_pipeline<B: AudioBackend>(
    backend: B,
    config: PipelineConfig,
) -> Result<PipelineHandle> {
    config.validate()?;
    let estimator = SpectralEstimator::new(config.segment_length())?;
    // Build the label table up front so renderers never pay for it mid-stream.
    let labels = notes::note_label_table().len();
    debug!("[PIPELINE] Note label table ready ({} entries)", labels);

    let shared = Arc::new(Shared {
        output: Mutex::new(Arc::new(PipelineOutput::empty(&config))),
        status: Mutex::new(PipelineStatus {
            state: PipelineState::Idle,
            ticks: 0,
            overruns: 0,
            last_error: None,
        }),
        callback: Mutex::new(None),
    });

    let (trigger, signal) = stop_signal();
    let (setup_tx, setup_rx) = crossbeam_channel::bounded::<Result<()>>(1);

    let worker_shared = Arc::clone(&shared);
    let worker_config = config.clone();
    let worker = thread::spawn(move || {
        let source = match backend.open(&worker_config, signal.clone()) {
            Ok(source) => {
                worker_shared.set_state(PipelineState::Running);
                let _ = setup_tx.send(Ok(()));
                source
            }
            Err(e) => {
                worker_shared.set_state(PipelineState::Stopped);
                let _ = setup_tx.send(Err(e));
                return;
            }
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run(source, estimator, &worker_config, &worker_shared, &signal)
        }));
        if outcome.is_err() {
            worker_shared.finish(Some(SpectrumError::DeviceRead(
                "pipeline thread panicked".into(),
            )));
        }
    });

    let setup = setup_rx.recv().unwrap_or_else(|_| {
        Err(SpectrumError::DeviceUnavailable(
            "pipeline thread exited during setup".into(),
        ))
    });
    match setup {
        Ok(()) => {
            info!(
                "[PIPELINE] Running: {} Hz, {} samples/block, {} segments of {}",
                config.sample_rate,
                config.chunk_size,
                config.segments_per_block,
                config.segment_length()
            );
            Ok(PipelineHandle {
                shared,
                trigger,
                worker: Some(worker),
                config,
            })
        }
        Err(e) => {
            let _ = worker.join();
            shared.set_state(PipelineState::Stopped);
            error!("[PIPELINE] Start failed: {}", e);
            Err(e)
        }
    }
}

/// The processing loop. Runs until stopped or the first error.
fn run(
    mut source: Box<dyn AudioSource>,
    estimator: SpectralEstimator,
    config: &PipelineConfig,
    shared: &Shared,
    stop: &StopSignal,
) {
    let interval = config.tick_interval();
    let mut sequence = 0u64;

    let outcome = loop {
        let tick_started = Instant::now();

        let block = match source.read_block() {
            Ok(block) if block.len() == config.chunk_size => block,
            Ok(block) => {
                break Some(SpectrumError::DeviceRead(format!(
                    "short read: {} of {} samples",
                    block.len(),
                    config.chunk_size
                )));
            }
            // A read interrupted by stop() is a clean shutdown, not a failure.
            Err(_) if stop.is_raised() => break None,
            Err(e) => break Some(e),
        };

        let psd = match estimator.estimate(&block) {
            Ok(psd) => psd,
            Err(e) => break Some(e),
        };

        sequence += 1;
        let output = Arc::new(PipelineOutput {
            sequence,
            waveform: block,
            psd,
            timestamp: Instant::now(),
        });
        shared.publish(Arc::clone(&output), source.overruns());
        if let Err(e) = shared.notify(&TickEvent::Output(output)) {
            break Some(e);
        }
        debug!(
            "[PIPELINE] Tick {} took {:?}",
            sequence,
            tick_started.elapsed()
        );

        let remaining = interval.saturating_sub(tick_started.elapsed());
        if stop.wait_timeout(remaining) {
            break None;
        }
    };

    source.close();
    match &outcome {
        Some(e) => error!("[PIPELINE] Stopped after {} ticks: {}", sequence, e),
        None => info!("[PIPELINE] Stopped after {} ticks", sequence),
    }
    shared.finish(outcome.clone());
    if let Err(e) = shared.notify(&TickEvent::Stopped(outcome)) {
        error!("[PIPELINE] Tick callback failed on stop: {}", e);
    }
}

impl PipelineHandle {
    /// Most recent snapshot; the empty snapshot before the first tick.
    pub fn latest_output(&self) -> Arc<PipelineOutput> {
        Arc::clone(&lock(&self.shared.output))
    }

    /// Installs the per-tick callback, replacing any previous one.
    ///
    /// The callback runs on the processing thread and delays the next tick for
    /// as long as it runs. It must not call back into this handle. A panic inside
    /// it stops the pipeline with [`SpectrumError::Callback`].
    pub fn register_tick_callback<F>(&self, callback: F)
    where
        F: FnMut(&TickEvent) + Send + 'static,
    {
        *lock(&self.shared.callback) = Some(Box::new(callback));
    }

    pub fn status(&self) -> PipelineStatus {
        lock(&self.shared.status).clone()
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.shared.status).state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Interrupts any pending capture, waits for the processing thread and
    /// releases the device. Safe to call more than once.
    pub fn stop(&mut self) -> PipelineStatus {
        self.trigger.raise();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                self.shared.finish(Some(SpectrumError::DeviceRead(
                    "pipeline thread panicked".into(),
                )));
            }
        }
        self.shared.set_state(PipelineState::Stopped);
        self.status()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stops the pipeline and returns its final status.
///
/// Blocks until the processing thread has closed the device and exited.
///
/// # Returns
/// The `Stopped` status. `last_error` holds whatever ended the run early: a
/// device error, a panicking tick callback or a panic on the processing thread.
pub fn stop_pipeline(mut handle: PipelineHandle) -> PipelineStatus {
    handle.stop()
}

pub fn latest_output(handle: &PipelineHandle) -> Arc<PipelineOutput> {
    handle.latest_output()
}

pub fn register_tick_callback<F>(handle: &PipelineHandle, callback: F)
where
    F: FnMut(&TickEvent) + Send + 'static,
{
    handle.register_tick_callback(callback);
}
