//! Access to continuous waveform data.
//!
//! A [WaveformSource] knows which series exist and opens a [SeriesReader]
//! for one of them. The reader yields fixed-length [WaveformBlock]s in
//! acquisition order until the series is exhausted.
#[cfg(test)]
pub(crate) mod memory;
pub mod raw_file;

use crate::error::{SourceError, SourceResult};
use detprocess_common::{
    AbsoluteSample, BlockIndex, FacilityId, Real, SampleIndex, SampleRate, SeriesId,
    time_to_sample,
};
use std::collections::BTreeMap;

pub use raw_file::{RawFileHeader, RawFileSource, RawFileWriter};

/// Which series of a source should be processed.
#[derive(Default, Debug, Clone)]
pub enum SeriesSelection {
    #[default]
    All,
    Only(Vec<SeriesId>),
}

impl SeriesSelection {
    /// Keeps the series of `available` that are selected, in the order of `available`.
    pub(crate) fn filter(&self, available: Vec<SeriesId>) -> SourceResult<Vec<SeriesId>> {
        match self {
            SeriesSelection::All => Ok(available),
            SeriesSelection::Only(requested) => {
                if let Some(missing) = requested.iter().find(|id| !available.contains(id)) {
                    return Err(SourceError::UnknownSeries(missing.clone()));
                }
                Ok(available
                    .into_iter()
                    .filter(|id| requested.contains(id))
                    .collect())
            }
        }
    }
}

/// Timing metadata of a block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub series_id: SeriesId,
    pub block_index: BlockIndex,
    pub facility: FacilityId,
    pub sample_rate: SampleRate,
    pub pretrigger_samples: usize,
    /// Time of the first sample of the block, in seconds.
    pub start_time: Real,
    pub num_samples: usize,
}

impl BlockInfo {
    pub fn start_sample(&self) -> AbsoluteSample {
        time_to_sample(self.start_time, self.sample_rate)
    }

    /// The first absolute sample after this block.
    pub fn end_sample(&self) -> AbsoluteSample {
        self.start_sample() + self.num_samples as AbsoluteSample
    }

    pub fn time_of(&self, index: SampleIndex) -> Real {
        self.start_time + index as Real / self.sample_rate
    }
}

#[derive(Debug, Clone)]
pub struct WaveformBlock {
    pub info: BlockInfo,
    traces: BTreeMap<String, Vec<Real>>,
}

impl WaveformBlock {
    pub fn new(info: BlockInfo, traces: BTreeMap<String, Vec<Real>>) -> Self {
        Self { info, traces }
    }

    pub fn trace(&self, channel: &str) -> SourceResult<&[Real]> {
        self.traces
            .get(channel)
            .map(Vec::as_slice)
            .ok_or_else(|| SourceError::MissingChannel(channel.to_owned()))
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.traces.keys().map(String::as_str)
    }
}

pub trait SeriesReader {
    /// Reads the next block of the series, restricted to `channels`.
    /// Returns `Ok(None)` at the end of the series.
    fn next_block(&mut self, channels: &[String]) -> SourceResult<Option<WaveformBlock>>;
}

pub trait WaveformSource: Sync {
    fn list_series(&self, selection: &SeriesSelection) -> SourceResult<Vec<SeriesId>>;

    fn available_channels(&self) -> SourceResult<Vec<String>>;

    fn sample_rate(&self) -> SourceResult<SampleRate>;

    fn facility(&self) -> SourceResult<FacilityId>;

    fn open_series(&self, series_id: &str) -> SourceResult<Box<dyn SeriesReader + '_>>;
}
