//! # Spectrum Monitor
//!
//! Headless consumer of the spectrum pipeline. It reads the latest published
//! snapshot at its own refresh rate, independent of the pipeline cadence, and
//! reports the dominant spectral peak with its nearest piano note.
//!
//! ## Threads
//! - **Main thread**: polls `latest_output` every `--refresh-ms`
//! - **Pipeline thread**: capture, Welch estimate, publish; runtime errors come
//!   back through the tick callback

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use std::time::{Duration, Instant};

use spectrum_core::audio::CpalBackend;
use spectrum_core::tone::ToneBackend;
use spectrum_core::{
    notes, sample_bounds, start_pipeline, stop_pipeline, PipelineConfig, PipelineHandle,
    PipelineOutput, PipelineState, SpectrumError, TickEvent,
};

use cli::Cli;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.list_notes {
        for (log_freq, label) in notes::note_label_table() {
            println!(
                "{:>5}  {:>9.2} Hz  (log10 {:.4})",
                label,
                10f64.powf(*log_freq),
                log_freq
            );
        }
        return Ok(());
    }

    let base = match &cli.config {
        Some(path) => {
            let config = PipelineConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("[MAIN] Loaded config from {}", path.display());
            config
        }
        None => PipelineConfig::default(),
    };
    let config = cli.apply(base);

    if let Some(path) = &cli.save_config {
        config
            .save(path)
            .with_context(|| format!("Failed to save config to {}", path.display()))?;
        info!("[MAIN] Configuration saved to {}", path.display());
        return Ok(());
    }

    let run_for = Duration::try_from_secs_f64(cli.seconds)
        .with_context(|| format!("Invalid run time: {} seconds", cli.seconds))?;

    let handle = match cli.tone {
        Some(frequency) => {
            info!("[MAIN] Using synthetic {} Hz tone", frequency);
            start_pipeline(ToneBackend::new(frequency, 0.25), config.clone())
        }
        None => start_pipeline(CpalBackend, config.clone()),
    }
    .context("Failed to start audio pipeline")?;

    let (stopped_tx, stopped_rx) = crossbeam_channel::bounded::<Option<SpectrumError>>(1);
    handle.register_tick_callback(move |event| {
        if let TickEvent::Stopped(outcome) = event {
            let _ = stopped_tx.try_send(outcome.clone());
        }
    });

    let runtime_error = monitor(&handle, &config, &cli, run_for, &stopped_rx);

    let status = stop_pipeline(handle);
    info!(
        "[MAIN] Finished: {} ticks, {} overruns",
        status.ticks, status.overruns
    );
    // Errors recorded after the last poll only show up in the final status
    match runtime_error.or(status.last_error) {
        Some(e) => Err(e).context("Audio pipeline stopped"),
        None => Ok(()),
    }
}

/// Reports snapshots until the run time elapses or the pipeline stops on its own.
fn monitor(
    handle: &PipelineHandle,
    config: &PipelineConfig,
    cli: &Cli,
    run_for: Duration,
    stopped: &Receiver<Option<SpectrumError>>,
) -> Option<SpectrumError> {
    let refresh = Duration::from_millis(cli.refresh_ms.max(1));
    let started = Instant::now();
    let mut last_sequence = 0;
    let mut last_overruns = 0;

    while started.elapsed() < run_for {
        if let Ok(outcome) = stopped.recv_timeout(refresh) {
            if let Some(e) = &outcome {
                error!("[MAIN] Pipeline stopped: {}", e);
            }
            return outcome;
        }
        // Covers a stop that happened before the callback was registered
        if handle.state() == PipelineState::Stopped {
            return handle.status().last_error;
        }

        let output = handle.latest_output();
        if output.sequence != last_sequence {
            last_sequence = output.sequence;
            println!("{}", describe(&output, config));
        }

        let overruns = handle.status().overruns;
        if overruns > last_overruns {
            warn!("[MAIN] {} block(s) dropped so far", overruns);
            last_overruns = overruns;
        }
    }
    None
}

/// One summary line: tick, dominant peak, its note and its level.
fn describe(output: &PipelineOutput, config: &PipelineConfig) -> String {
    let waveform_peak = output
        .waveform
        .samples()
        .iter()
        .map(|s| s.unsigned_abs())
        .max()
        .unwrap_or(0);

    match output.psd.peak() {
        Some((freq, power)) => {
            let note = notes::nearest_key(freq)
                .map(|key| key.label())
                .unwrap_or_else(|| "-".into());
            format!(
                "tick {:>6} | peak {:>8.1} Hz {:>4} | {:>6.1} dBFS | waveform peak {}",
                output.sequence,
                freq,
                note,
                level_dbfs(power, config.bit_depth),
                waveform_peak
            )
        }
        None => format!("tick {:>6} | silence", output.sequence),
    }
}

/// Power of a spectral line relative to a full-scale sine.
fn level_dbfs(power: f64, bit_depth: u16) -> f64 {
    let full_scale = sample_bounds(bit_depth)
        .map(|(_, max)| max as f64)
        .unwrap_or(1.0);
    10.0 * (power / (full_scale * full_scale / 2.0)).log10()
}
