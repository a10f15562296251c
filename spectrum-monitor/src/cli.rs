use clap::Parser;
use std::path::PathBuf;

use spectrum_core::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "spectrum-monitor", about = "Headless live audio spectrum monitor")]
pub struct Cli {
    /// JSON configuration file; command line options override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Capture sample rate in Hz
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Samples per captured block
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Sample width in bits (8, 16 or 32)
    #[arg(long)]
    pub bit_depth: Option<u16>,

    /// Welch segments per block
    #[arg(long)]
    pub segments: Option<usize>,

    /// Pipeline tick interval in milliseconds
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// How often the latest snapshot is read and reported, in milliseconds
    #[arg(long, default_value_t = 250)]
    pub refresh_ms: u64,

    /// Run time in seconds before stopping
    #[arg(short, long, default_value_t = 10.0)]
    pub seconds: f64,

    /// Use a synthetic sine of this frequency (Hz) instead of the input device
    #[arg(long)]
    pub tone: Option<f64>,

    /// Write the effective configuration to this JSON file and exit
    #[arg(long)]
    pub save_config: Option<PathBuf>,

    /// Print the note axis label table and exit
    #[arg(long)]
    pub list_notes: bool,
}

impl Cli {
    /// Applies command line overrides on top of `base`.
    pub fn apply(&self, mut base: PipelineConfig) -> PipelineConfig {
        if let Some(v) = self.sample_rate {
            base.sample_rate = v;
        }
        if let Some(v) = self.chunk_size {
            base.chunk_size = v;
        }
        if let Some(v) = self.bit_depth {
            base.bit_depth = v;
        }
        if let Some(v) = self.segments {
            base.segments_per_block = v;
        }
        if let Some(v) = self.tick_ms {
            base.tick_interval_ms = v;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_given_fields() {
        let cli = Cli::parse_from([
            "spectrum-monitor",
            "--chunk-size",
            "2048",
            "--tick-ms",
            "50",
        ]);
        let config = cli.apply(PipelineConfig::default());
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.segments_per_block, 3);
    }

    #[test]
    fn tone_flag_parses() {
        let cli = Cli::parse_from(["spectrum-monitor", "--tone", "440", "-s", "2"]);
        assert_eq!(cli.tone, Some(440.0));
        assert_eq!(cli.seconds, 2.0);
        assert!(!cli.list_notes);
    }

    #[test]
    fn infinite_run_time_is_not_a_duration() {
        let cli = Cli::parse_from(["spectrum-monitor", "--seconds", "inf"]);
        assert!(cli.seconds.is_infinite());
        assert!(std::time::Duration::try_from_secs_f64(cli.seconds).is_err());
    }
}
