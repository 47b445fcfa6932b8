use crate::{
    config::ProcessingConfig,
    dispatch::{self, RunParameters, RunSummary},
    error::{ConfigurationError, ProcessingResult},
    parameters::ProcessParameters,
    setup::build_event_builder,
    sink::{FileSink, MemorySink, create_output_directory},
    source::{RawFileSource, SeriesSelection, WaveformSource},
};
use chrono::Local;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub struct ProcessingOutcome {
    pub summary: RunSummary,
    /// Set when the triggers were written to files.
    pub output_directory: Option<PathBuf>,
}

/// Runs trigger processing on the raw files named by `params`.
///
/// Every configuration problem is reported before the output directory is
/// created or any worker starts.
#[tracing::instrument(skip_all, fields(raw_path = %params.raw_path.display()))]
pub fn process(params: &ProcessParameters) -> ProcessingResult<ProcessingOutcome> {
    let (config, filters) = ProcessingConfig::load_with_filters(&params.config)?;
    let source = RawFileSource::open(&params.raw_path).map_err(ConfigurationError::from)?;

    let selection = if params.series.is_empty() {
        SeriesSelection::All
    } else {
        SeriesSelection::Only(params.series.clone())
    };
    let series = source
        .list_series(&selection)
        .map_err(ConfigurationError::from)?;
    let available = source
        .available_channels()
        .map_err(ConfigurationError::from)?;
    let sample_rate = source.sample_rate().map_err(ConfigurationError::from)?;
    let builder = build_event_builder(&config.trigger, &filters, &available, sample_rate)?;

    let run = RunParameters {
        ntriggers: params.ntriggers,
        ncores: params.ncores,
        memory_limit: params.memory_limit.bytes(),
        processing_id: params.processing_id.clone(),
    };
    dispatch::validate(&run, series.len())?;
    info!(
        "Processing {} series, memory limit {}",
        series.len(),
        params.memory_limit
    );

    if params.in_memory {
        let summary = dispatch::dispatch(&source, &builder, &series, &run, |_, limit| {
            MemorySink::new(limit)
        })?;
        return Ok(ProcessingOutcome {
            summary,
            output_directory: None,
        });
    }

    let facility = source.facility().map_err(ConfigurationError::from)?;
    let directory = create_output_directory(
        &params.output_path,
        params.processing_id.as_deref(),
        facility,
        Local::now(),
    )?;
    let summary = dispatch::dispatch(&source, &builder, &series, &run, |_, _| {
        FileSink::new(directory.clone())
    })?;
    Ok(ProcessingOutcome {
        summary,
        output_directory: Some(directory),
    })
}
