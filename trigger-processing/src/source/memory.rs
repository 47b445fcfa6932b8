//! In-memory source used by the unit tests.
use super::{BlockInfo, SeriesReader, SeriesSelection, WaveformBlock, WaveformSource};
use crate::error::{SourceError, SourceResult};
use detprocess_common::{FacilityId, Real, SampleRate, SeriesId};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub(crate) struct MemorySeries {
    pub(crate) series_id: SeriesId,
    /// One map of channel traces per block, all of the same length.
    pub(crate) blocks: Vec<BTreeMap<String, Vec<Real>>>,
    /// Reading this block fails.
    pub(crate) fail_at_block: Option<usize>,
}

impl MemorySeries {
    pub(crate) fn new(series_id: &str, blocks: Vec<BTreeMap<String, Vec<Real>>>) -> Self {
        Self {
            series_id: series_id.to_owned(),
            blocks,
            fail_at_block: None,
        }
    }

    pub(crate) fn failing_at(mut self, block: usize) -> Self {
        self.fail_at_block = Some(block);
        self
    }
}

/// Builds the blocks of a single channel series from one continuous trace.
pub(crate) fn single_channel_blocks(
    channel: &str,
    trace: &[Real],
    block_length: usize,
) -> Vec<BTreeMap<String, Vec<Real>>> {
    trace
        .chunks(block_length)
        .map(|chunk| BTreeMap::from([(channel.to_owned(), chunk.to_vec())]))
        .collect()
}

#[derive(Debug, Clone)]
pub(crate) struct MemorySource {
    pub(crate) channels: Vec<String>,
    pub(crate) sample_rate: SampleRate,
    pub(crate) series: Vec<MemorySeries>,
}

impl WaveformSource for MemorySource {
    fn list_series(&self, selection: &SeriesSelection) -> SourceResult<Vec<SeriesId>> {
        selection.filter(self.series.iter().map(|s| s.series_id.clone()).collect())
    }

    fn available_channels(&self) -> SourceResult<Vec<String>> {
        Ok(self.channels.clone())
    }

    fn sample_rate(&self) -> SourceResult<SampleRate> {
        Ok(self.sample_rate)
    }

    fn facility(&self) -> SourceResult<FacilityId> {
        Ok(1)
    }

    fn open_series(&self, series_id: &str) -> SourceResult<Box<dyn SeriesReader + '_>> {
        let series = self
            .series
            .iter()
            .find(|s| s.series_id == series_id)
            .ok_or_else(|| SourceError::UnknownSeries(series_id.to_owned()))?;
        Ok(Box::new(MemorySeriesReader {
            series,
            sample_rate: self.sample_rate,
            next: 0,
            start_sample: 0,
        }))
    }
}

struct MemorySeriesReader<'a> {
    series: &'a MemorySeries,
    sample_rate: SampleRate,
    next: usize,
    start_sample: usize,
}

impl SeriesReader for MemorySeriesReader<'_> {
    fn next_block(&mut self, channels: &[String]) -> SourceResult<Option<WaveformBlock>> {
        if self.series.fail_at_block == Some(self.next) {
            return Err(SourceError::IO(std::io::Error::other("simulated read failure")));
        }
        let Some(traces) = self.series.blocks.get(self.next) else {
            return Ok(None);
        };
        let traces = channels
            .iter()
            .map(|channel| {
                traces
                    .get(channel)
                    .map(|trace| (channel.clone(), trace.clone()))
                    .ok_or_else(|| SourceError::MissingChannel(channel.clone()))
            })
            .collect::<SourceResult<BTreeMap<_, _>>>()?;
        let num_samples = traces.values().map(Vec::len).max().unwrap_or_default();
        let info = BlockInfo {
            series_id: self.series.series_id.clone(),
            block_index: self.next as u64,
            facility: 1,
            sample_rate: self.sample_rate,
            pretrigger_samples: 0,
            start_time: self.start_sample as Real / self.sample_rate,
            num_samples,
        };
        self.next += 1;
        self.start_sample += num_samples;
        Ok(Some(WaveformBlock::new(info, traces)))
    }
}
