use crate::error::ConfigurationError;
use clap::{Args, Subcommand};
use detprocess_common::{Real, SampleRate, SeriesId};
use std::{fmt, path::PathBuf, str::FromStr};

const DECIMAL_UNITS: [(&str, Real); 5] = [
    ("B", 1.0),
    ("KB", 1e3),
    ("MB", 1e6),
    ("GB", 1e9),
    ("TB", 1e12),
];
const BINARY_UNITS: [(&str, Real); 4] = [
    ("KIB", 1024.0),
    ("MIB", 1048576.0),
    ("GIB", 1073741824.0),
    ("TIB", 1099511627776.0),
];

/// A size in bytes, written as a plain number of bytes or with a decimal
/// (`KB`, `MB`, `GB`, `TB`) or binary (`KiB`, `MiB`, `GiB`, `TiB`) unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit(pub u64);

impl MemoryLimit {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for MemoryLimit {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidMemoryLimit(s.to_owned());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let value = Real::from_str(number.trim()).map_err(|_| invalid())?;
        let unit = unit.trim().to_ascii_uppercase();
        let multiplier = if unit.is_empty() {
            1.0
        } else {
            DECIMAL_UNITS
                .iter()
                .chain(BINARY_UNITS.iter())
                .find(|(name, _)| *name == unit)
                .map(|(_, multiplier)| *multiplier)
                .ok_or_else(invalid)?
        };
        let bytes = (value * multiplier).round();
        if !bytes.is_finite() || bytes < 1.0 || bytes > u64::MAX as Real {
            return Err(invalid());
        }
        Ok(MemoryLimit(bytes as u64))
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

#[derive(Debug, Clone, Args)]
pub struct ProcessParameters {
    /// Processing configuration (JSON) with the trigger section and the filter file.
    #[clap(long, env = "TRIGGER_CONFIG")]
    pub config: PathBuf,

    /// Directory holding the raw data files.
    #[clap(long, env = "TRIGGER_RAW_PATH")]
    pub raw_path: PathBuf,

    /// Series to process, all series in the directory if omitted.
    #[clap(long, value_delimiter = ',')]
    pub series: Vec<SeriesId>,

    /// Stop once this many triggers are found. Requires a single worker, 0 means no limit.
    #[clap(long)]
    pub ntriggers: Option<u64>,

    #[clap(long, env = "TRIGGER_NCORES", default_value = "1")]
    pub ncores: usize,

    /// Partition size at which output is flushed, e.g. "2GB" or "500MiB".
    #[clap(long, env = "TRIGGER_MEMORY_LIMIT", default_value = "2GB")]
    pub memory_limit: MemoryLimit,

    /// Keep the triggers in memory instead of writing files.
    #[clap(long)]
    pub in_memory: bool,

    /// Tag carried in every row and in the output directory name.
    #[clap(long)]
    pub processing_id: Option<String>,

    /// Base directory of the output directory.
    #[clap(long, env = "TRIGGER_OUTPUT_PATH", default_value = ".")]
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct SimulateParameters {
    /// Directory receiving the raw files, the filter file and the configuration.
    #[clap(long)]
    pub output_path: PathBuf,

    #[clap(long, value_delimiter = ',', default_value = "chA,chB")]
    pub channels: Vec<String>,

    #[clap(long, default_value = "2")]
    pub num_series: usize,

    #[clap(long, default_value = "10")]
    pub blocks_per_series: usize,

    #[clap(long, default_value = "10000")]
    pub block_length: usize,

    #[clap(long, default_value = "1250000")]
    pub sample_rate: SampleRate,

    /// Mean number of pulses per second.
    #[clap(long, default_value = "500")]
    pub pulse_rate: Real,

    /// Pulse amplitude, in volts.
    #[clap(long, default_value = "1e-6")]
    pub amplitude: Real,

    /// Standard deviation of the white noise, in volts.
    #[clap(long, default_value = "5e-8")]
    pub noise_sigma: Real,

    #[clap(long, default_value = "10")]
    pub rise_time_usec: Real,

    #[clap(long, default_value = "100")]
    pub fall_time_usec: Real,

    /// Length of the filter template, in samples.
    #[clap(long, default_value = "1024")]
    pub template_length: usize,

    /// Threshold written to the generated configuration.
    #[clap(long, default_value = "5")]
    pub threshold_sigma: Real,

    /// Seed of the random generator, taken from the clock if omitted.
    #[clap(long)]
    pub seed: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    #[clap(about = "Detects triggers in raw data files and writes the trigger table.")]
    Process(ProcessParameters),
    #[clap(
        about = "Writes simulated raw data files, with a matching filter file and configuration."
    )]
    Simulate(SimulateParameters),
}
