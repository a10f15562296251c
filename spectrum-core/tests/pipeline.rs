use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use spectrum_core::audio::{AudioBackend, AudioSource, StopSignal};
use spectrum_core::tone::ToneBackend;
use spectrum_core::{
    latest_output, register_tick_callback, start_pipeline, stop_pipeline, PipelineConfig,
    PipelineState, SampleBlock, SpectrumError, TickEvent,
};

/// How a fake source behaves once opened.
#[derive(Clone, Copy)]
enum Behaviour {
    /// Never produces a block; only a stop request ends the read.
    Block,
    /// Produces `n` silent blocks, then fails with a read error.
    FailAfter(usize),
    /// Produces blocks shorter than the configured chunk size.
    Short,
    /// Produces silent blocks, each after the given delay.
    Paced(Duration),
    /// Produces `n` silent blocks, reporting two dropped blocks before each,
    /// then fails with a read error.
    Lossy(usize),
}

#[derive(Clone)]
struct FakeBackend {
    behaviour: Behaviour,
    refuse_open: bool,
    opens: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl FakeBackend {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            refuse_open: false,
            opens: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn without_device() -> Self {
        Self {
            refuse_open: true,
            ..Self::new(Behaviour::Block)
        }
    }
}

impl AudioBackend for FakeBackend {
    fn open(
        &self,
        config: &PipelineConfig,
        stop: StopSignal,
    ) -> spectrum_core::Result<Box<dyn AudioSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse_open {
            return Err(SpectrumError::DeviceUnavailable("no input device".into()));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            behaviour: self.behaviour,
            config: config.clone(),
            stop,
            live: Arc::clone(&self.live),
            open: true,
            reads: 0,
            dropped: 0,
        }))
    }
}

struct FakeSource {
    behaviour: Behaviour,
    config: PipelineConfig,
    stop: StopSignal,
    live: Arc<AtomicUsize>,
    open: bool,
    reads: usize,
    dropped: u64,
}

impl FakeSource {
    fn silent(&self, len: usize) -> spectrum_core::Result<SampleBlock> {
        SampleBlock::new(vec![0; len], self.config.sample_rate, self.config.bit_depth)
    }
}

impl AudioSource for FakeSource {
    fn read_block(&mut self) -> spectrum_core::Result<SampleBlock> {
        self.reads += 1;
        match self.behaviour {
            Behaviour::Block => {
                let never = crossbeam_channel::never::<()>();
                select! {
                    recv(never) -> _ => unreachable!(),
                    recv(self.stop.receiver()) -> _ => {
                        Err(SpectrumError::DeviceRead("closed".into()))
                    }
                }
            }
            Behaviour::FailAfter(n) | Behaviour::Lossy(n) if self.reads > n => {
                Err(SpectrumError::DeviceRead("device disconnected".into()))
            }
            Behaviour::FailAfter(_) => self.silent(self.config.chunk_size),
            Behaviour::Lossy(_) => {
                self.dropped += 2;
                self.silent(self.config.chunk_size)
            }
            Behaviour::Short => self.silent(self.config.chunk_size / 2),
            Behaviour::Paced(delay) => {
                if self.stop.wait_timeout(delay) {
                    return Err(SpectrumError::DeviceRead("closed".into()));
                }
                self.silent(self.config.chunk_size)
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn overruns(&self) -> u64 {
        self.dropped
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn small_config() -> PipelineConfig {
    PipelineConfig {
        chunk_size: 1024,
        tick_interval_ms: 1,
        ..Default::default()
    }
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn missing_device_fails_start_and_holds_nothing() {
    let backend = FakeBackend::without_device();
    let err = start_pipeline(backend.clone(), small_config()).unwrap_err();
    assert!(matches!(err, SpectrumError::DeviceUnavailable(_)));
    assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
    assert_eq!(backend.live.load(Ordering::SeqCst), 0);
}

#[test]
fn invalid_configuration_never_opens_the_device() {
    let backend = FakeBackend::new(Behaviour::Block);
    let config = PipelineConfig {
        chunk_size: 21,
        segments_per_block: 3,
        ..Default::default()
    };
    let err = start_pipeline(backend.clone(), config).unwrap_err();
    assert!(matches!(err, SpectrumError::InvalidConfiguration(_)));
    assert_eq!(backend.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn initial_snapshot_is_empty() {
    let backend = FakeBackend::new(Behaviour::Block);
    let handle = start_pipeline(backend, small_config()).unwrap();
    let output = latest_output(&handle);
    assert!(output.is_empty());
    assert!(output.waveform.is_empty());
    assert!(output.psd.is_empty());
    assert_eq!(handle.state(), PipelineState::Running);
}

#[test]
fn stop_interrupts_blocked_read_quickly() {
    let backend = FakeBackend::new(Behaviour::Block);
    let handle = start_pipeline(backend.clone(), small_config()).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let status = stop_pipeline(handle);
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "stop took {:?}",
        started.elapsed()
    );
    assert_eq!(status.state, PipelineState::Stopped);
    assert_eq!(status.ticks, 0);
    assert_eq!(status.last_error, None);
    assert_eq!(backend.live.load(Ordering::SeqCst), 0);
}

#[test]
fn read_error_stops_pipeline_without_retry() {
    let backend = FakeBackend::new(Behaviour::FailAfter(3));
    let handle = start_pipeline(backend.clone(), small_config()).unwrap();
    assert!(wait_for(|| handle.state() == PipelineState::Stopped));

    let status = handle.status();
    assert_eq!(status.ticks, 3);
    assert!(matches!(status.last_error, Some(SpectrumError::DeviceRead(_))));
    assert_eq!(latest_output(&handle).sequence, 3);
    assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
    assert_eq!(backend.live.load(Ordering::SeqCst), 0);
}

#[test]
fn short_block_is_a_read_error() {
    let backend = FakeBackend::new(Behaviour::Short);
    let handle = start_pipeline(backend, small_config()).unwrap();
    assert!(wait_for(|| handle.state() == PipelineState::Stopped));
    assert!(matches!(
        handle.status().last_error,
        Some(SpectrumError::DeviceRead(_))
    ));
    assert!(latest_output(&handle).is_empty());
}

#[test]
fn callback_sees_every_tick_then_the_stop() {
    let events: Arc<Mutex<Vec<TickEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let backend = FakeBackend::new(Behaviour::Paced(Duration::from_millis(10)));
    let handle = start_pipeline(backend, small_config()).unwrap();

    let sink = Arc::clone(&events);
    register_tick_callback(&handle, move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    assert!(wait_for(|| events.lock().unwrap().len() >= 3));
    let status = stop_pipeline(handle);

    let events = events.lock().unwrap();
    let sequences: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            TickEvent::Output(output) => Some(output.sequence),
            TickEvent::Stopped(_) => None,
        })
        .collect();
    assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(matches!(events.last(), Some(TickEvent::Stopped(None))));
    assert_eq!(*sequences.last().unwrap(), status.ticks);

    if let Some(TickEvent::Output(output)) = events.first() {
        assert_eq!(output.waveform.len(), 1024);
        assert_eq!(output.psd.len(), 341 / 2 + 1);
        assert!(output.psd.power().iter().all(|&p| p == 0.0));
    } else {
        panic!("first event should be an output");
    }
}

#[test]
fn clean_stop_reaches_callback_without_error() {
    let stopped = Arc::new(Mutex::new(None));
    let backend = FakeBackend::new(Behaviour::Paced(Duration::from_millis(20)));
    let handle = start_pipeline(backend, small_config()).unwrap();
    let sink = Arc::clone(&stopped);
    handle.register_tick_callback(move |event| {
        if let TickEvent::Stopped(err) = event {
            *sink.lock().unwrap() = Some(err.clone());
        }
    });
    drop(handle);
    // A clean stop reports no error
    assert_eq!(*stopped.lock().unwrap(), Some(None));
}

#[test]
fn ticks_respect_the_configured_interval() {
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let backend = FakeBackend::new(Behaviour::Paced(Duration::from_millis(1)));
    let config = PipelineConfig {
        tick_interval_ms: 40,
        ..small_config()
    };
    let handle = start_pipeline(backend, config).unwrap();
    let sink = Arc::clone(&stamps);
    handle.register_tick_callback(move |event| {
        if let TickEvent::Output(output) = event {
            sink.lock().unwrap().push(output.timestamp);
        }
    });
    assert!(wait_for(|| stamps.lock().unwrap().len() >= 4));
    stop_pipeline(handle);

    let stamps = stamps.lock().unwrap();
    for pair in stamps.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(35), "ticks only {:?} apart", gap);
    }
}

#[test]
fn capture_time_bounds_the_cadence() {
    let backend = FakeBackend::new(Behaviour::Paced(Duration::from_millis(50)));
    let handle = start_pipeline(backend, small_config()).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    let status = stop_pipeline(handle);
    // A 1 ms timer would allow ~300 ticks; 50 ms reads allow about 6
    assert!(status.ticks <= 7, "{} ticks", status.ticks);
}

#[test]
fn tone_pipeline_finds_the_tone() {
    let tone = ToneBackend {
        frequency: 1000.0,
        amplitude: 0.5,
        realtime: false,
    };
    let config = PipelineConfig {
        tick_interval_ms: 5,
        ..Default::default()
    };
    let handle = start_pipeline(tone, config).unwrap();
    assert!(wait_for(|| !latest_output(&handle).is_empty()));
    let output = latest_output(&handle);
    stop_pipeline(handle);

    assert_eq!(output.waveform.len(), 4096);
    assert_eq!(output.psd.len(), 683);
    assert!((output.psd.frequencies()[1] - 32.3).abs() < 0.01);
    let (freq, _) = output.psd.peak().unwrap();
    assert!((freq - 1000.0).abs() <= output.psd.bin_width().unwrap());
}

#[test]
fn source_overruns_show_up_in_status() {
    let backend = FakeBackend::new(Behaviour::Lossy(3));
    let handle = start_pipeline(backend.clone(), small_config()).unwrap();
    assert!(wait_for(|| handle.state() == PipelineState::Stopped));

    let status = handle.status();
    assert_eq!(status.ticks, 3);
    assert_eq!(status.overruns, 6);
    assert!(matches!(status.last_error, Some(SpectrumError::DeviceRead(_))));
}

#[test]
fn panicking_callback_stops_the_pipeline() {
    let backend = FakeBackend::new(Behaviour::Paced(Duration::from_millis(5)));
    let handle = start_pipeline(backend.clone(), small_config()).unwrap();
    let stopped = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&stopped);
    handle.register_tick_callback(move |event| match event {
        TickEvent::Output(output) => panic!("renderer failed on tick {}", output.sequence),
        TickEvent::Stopped(err) => *sink.lock().unwrap() = Some(err.clone()),
    });

    assert!(wait_for(|| handle.state() == PipelineState::Stopped));
    let status = handle.status();
    match &status.last_error {
        Some(SpectrumError::Callback(detail)) => assert!(detail.contains("renderer failed")),
        other => panic!("expected a callback error, got {:?}", other),
    }
    assert_eq!(backend.live.load(Ordering::SeqCst), 0);

    let status = stop_pipeline(handle);
    assert_eq!(status.state, PipelineState::Stopped);
    assert!(status.last_error.is_some());
    assert!(matches!(
        *stopped.lock().unwrap(),
        Some(Some(SpectrumError::Callback(_)))
    ));
}
