use detprocess_common::{BlockIndex, SeriesId};
use itertools::Itertools;
use std::{fmt, path::PathBuf};
use thiserror::Error;

pub type ProcessingResult<T> = Result<T, ProcessingError>;
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors detected while building the run, before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Trigger channel {0} has no \"threshold_sigma\"")]
    MissingThreshold(String),
    #[error("Both \"{msec}\" and \"{samples}\" are given, only one is allowed")]
    AmbiguousWindow {
        msec: &'static str,
        samples: &'static str,
    },
    #[error("A trigger limit ({ntriggers}) requires a single worker, {ncores} requested")]
    TriggerLimitWithMultipleWorkers { ntriggers: u64, ncores: usize },
    #[error("At least one worker is required")]
    NoWorkers,
    #[error("Channel {0} is not available in the data")]
    UnknownChannel(String),
    #[error("Channel {0} is used by more than one trigger")]
    DuplicateChannel(String),
    #[error("Trigger name {0} is used more than once")]
    DuplicateTriggerName(String),
    #[error("No template tagged \"{tag}\" for trigger channel {channel}")]
    MissingTemplate { channel: String, tag: String },
    #[error("No PSD tagged \"{tag}\" for trigger channel {channel}")]
    MissingPsd { channel: String, tag: String },
    #[error("Cannot build the filter for {channel}: {source}")]
    InvalidFilter {
        channel: String,
        #[source]
        source: FilterError,
    },
    #[error("Malformed channel expression \"{0}\"")]
    MalformedChannelExpression(String),
    #[error("Separator '{separator}' in \"{expression}\" is not supported")]
    UnsupportedSeparator { expression: String, separator: char },
    #[error("No trigger channel is enabled")]
    NoTriggerChannels,
    #[error("No series found to process")]
    NoSeries,
    #[error("Invalid memory limit \"{0}\"")]
    InvalidMemoryLimit(String),
    #[error("Invalid sample rate {0}")]
    InvalidSampleRate(f64),
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Source Error: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Template is empty")]
    EmptyTemplate,
    #[error("PSD has {psd} values, expected {two_sided} (two-sided) or {one_sided} (one-sided)")]
    PsdLength {
        psd: usize,
        two_sided: usize,
        one_sided: usize,
    },
    #[error("Pretrigger length {pretrigger} is not inside the template of length {length}")]
    Pretrigger { pretrigger: usize, length: usize },
    #[error("Template has no power where the PSD is valid")]
    ZeroNormalisation,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO Error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Glob Pattern Error: {0}")]
    GlobPattern(#[from] glob::PatternError),
    #[error("Glob Error: {0}")]
    Glob(#[from] glob::GlobError),
    #[error("Unknown series {0}")]
    UnknownSeries(SeriesId),
    #[error("Channel {0} is not present in the block")]
    MissingChannel(String),
    #[error("Corrupt file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Inconsistent files: {0}")]
    Inconsistent(String),
    #[error("No raw data files found in {0}")]
    NoFiles(PathBuf),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO Error: {0}")]
    IO(#[from] std::io::Error),
    #[error("CSV Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Cannot create output directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum WorkerFailureCause {
    #[error("{0}")]
    Source(#[from] SourceError),
    #[error("{0}")]
    Sink(#[from] SinkError),
}

/// A fatal failure of one worker, with the position it had reached.
#[derive(Debug, Error)]
#[error(
    "Worker {worker} failed on series {series_id} at block {block_index} after {trigger_count} trigger(s): {cause}"
)]
pub struct WorkerError {
    pub worker: usize,
    pub series_id: SeriesId,
    pub block_index: BlockIndex,
    pub trigger_count: u64,
    #[source]
    pub cause: WorkerFailureCause,
}

/// The outcome of a failed worker, as reported by the dispatcher.
#[derive(Debug)]
pub struct WorkerFailure {
    pub error: WorkerError,
    pub completed_series: Vec<SeriesId>,
    pub abandoned_series: Vec<SeriesId>,
}

/// Aggregate failure of a run in which at least one worker failed.
#[derive(Debug)]
pub struct RunFailure {
    pub failures: Vec<WorkerFailure>,
    pub completed_series: Vec<SeriesId>,
}

impl RunFailure {
    pub fn abandoned_series(&self) -> impl Iterator<Item = &SeriesId> {
        self.failures
            .iter()
            .flat_map(|failure| failure.abandoned_series.iter())
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} worker(s) failed, {} series completed, abandoned: [{}]",
            self.failures.len(),
            self.completed_series.len(),
            self.abandoned_series().join(", ")
        )?;
        for failure in &self.failures {
            write!(f, "; {}", failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Configuration Error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Sink Error: {0}")]
    Sink(#[from] SinkError),
    #[error("Cannot start the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("{0}")]
    Workers(#[from] RunFailure),
}
