//! Splitting of a run across workers.
use crate::{
    controller::{RunStatus, StreamController, StreamSettings, WorkerReport},
    error::{ConfigurationError, ProcessingResult, RunFailure, WorkerFailure},
    event_builder::EventBuilder,
    sink::{OutputSink, SinkOutput},
    source::WaveformSource,
};
use detprocess_common::SeriesId;
use rayon::prelude::*;
use tracing::{info, warn};

/// The series processed by one worker, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesAssignment {
    pub worker: usize,
    pub series_ids: Vec<SeriesId>,
}

#[derive(Debug, Clone)]
pub struct RunParameters {
    pub ntriggers: Option<u64>,
    pub ncores: usize,
    /// In estimated bytes, shared equally between workers.
    pub memory_limit: u64,
    pub processing_id: Option<String>,
}

impl RunParameters {
    /// A trigger limit of zero means no limit.
    pub fn trigger_limit(&self) -> Option<u64> {
        self.ntriggers.filter(|&limit| limit > 0)
    }
}

#[derive(Default, Debug)]
pub struct RunSummary {
    pub status: RunStatus,
    pub completed_series: Vec<SeriesId>,
    pub num_triggers: u64,
    pub num_events: u64,
    pub num_partitions: usize,
    /// Outputs of all workers, in worker order.
    pub output: SinkOutput,
}

impl RunSummary {
    fn add(&mut self, report: WorkerReport) {
        if self.status == RunStatus::Completed {
            self.status = report.status;
        }
        self.completed_series.extend(report.completed_series);
        self.num_triggers += report.num_triggers;
        self.num_events += report.num_events;
        self.num_partitions += report.num_partitions;
        self.output.append(report.output);
    }
}

/// Splits `series` into at most `ncores` contiguous chunks whose sizes
/// differ by at most one, larger chunks first. Empty chunks are dropped.
pub fn split_series(series: &[SeriesId], ncores: usize) -> Vec<SeriesAssignment> {
    let ncores = ncores.max(1);
    let base = series.len() / ncores;
    let extra = series.len() % ncores;
    let mut start = 0;
    (0..ncores)
        .filter_map(|index| {
            let size = base + usize::from(index < extra);
            let chunk = series.get(start..start + size).unwrap_or_default();
            start += size;
            (!chunk.is_empty()).then(|| SeriesAssignment {
                worker: index + 1,
                series_ids: chunk.to_vec(),
            })
        })
        .collect()
}

/// Checks the run parameters and returns the number of workers to use.
pub fn validate(params: &RunParameters, num_series: usize) -> Result<usize, ConfigurationError> {
    if params.ncores == 0 {
        return Err(ConfigurationError::NoWorkers);
    }
    if let Some(ntriggers) = params.trigger_limit() {
        if params.ncores > 1 {
            return Err(ConfigurationError::TriggerLimitWithMultipleWorkers {
                ntriggers,
                ncores: params.ncores,
            });
        }
    }
    if num_series == 0 {
        return Err(ConfigurationError::NoSeries);
    }
    Ok(params.ncores.min(num_series))
}

/// Processes `series` on independent workers and joins their results.
///
/// `make_sink` is called once per worker with its assignment and its share
/// of the memory limit.
///
/// # Error Modes
/// - [ConfigurationError] if the parameters are invalid, before any worker starts.
/// - [RunFailure] if any worker failed, listing completed and abandoned series.
#[tracing::instrument(skip_all, fields(num_series = series.len(), ncores))]
pub fn dispatch<W, S, F>(
    source: &W,
    builder: &EventBuilder,
    series: &[SeriesId],
    params: &RunParameters,
    make_sink: F,
) -> ProcessingResult<RunSummary>
where
    W: WaveformSource + ?Sized,
    S: OutputSink + Send,
    F: Fn(&SeriesAssignment, u64) -> S + Sync,
{
    let ncores = validate(params, series.len())?;
    tracing::Span::current().record("ncores", ncores);
    if ncores < params.ncores {
        info!(
            "Number of workers reduced from {} to the number of series, {ncores}",
            params.ncores
        );
    }
    let memory_limit = if ncores > 1 {
        params.memory_limit / ncores as u64
    } else {
        params.memory_limit
    };
    let assignments = split_series(series, ncores);

    let run_worker = |assignment: &SeriesAssignment| -> Result<WorkerReport, WorkerFailure> {
        let settings = StreamSettings {
            worker: assignment.worker,
            ntriggers: params.trigger_limit(),
            memory_limit,
            processing_id: params.processing_id.clone(),
        };
        StreamController::new(builder, settings, make_sink(assignment, memory_limit))
            .run(source, &assignment.series_ids)
    };

    let outcomes = if ncores == 1 {
        assignments.iter().map(run_worker).collect::<Vec<_>>()
    } else {
        info!("Starting {ncores} workers");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ncores)
            .thread_name(|index| format!("trigger-worker-{}", index + 1))
            .build()?;
        pool.install(|| assignments.par_iter().map(run_worker).collect::<Vec<_>>())
    };

    let mut summary = RunSummary::default();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(report) => summary.add(report),
            Err(failure) => {
                summary
                    .completed_series
                    .extend(failure.completed_series.iter().cloned());
                failures.push(failure);
            }
        }
    }
    if !failures.is_empty() {
        return Err(RunFailure {
            failures,
            completed_series: summary.completed_series,
        }
        .into());
    }

    if summary.num_events == 0 {
        warn!("No events found");
    }
    if summary.status.is_stopped_by_limit() {
        info!("Run {}", summary.status);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controller::tests::{FlushLog, RecordingSink, builder, source, two_channel_series},
        error::ProcessingError,
        event::Event,
        sink::MemorySink,
    };

    fn ids(count: usize) -> Vec<SeriesId> {
        (1..=count).map(|i| format!("s{i}")).collect()
    }

    fn params(ncores: usize, ntriggers: Option<u64>) -> RunParameters {
        RunParameters {
            ntriggers,
            ncores,
            memory_limit: 1 << 30,
            processing_id: None,
        }
    }

    fn sizes(assignments: &[SeriesAssignment]) -> Vec<usize> {
        assignments.iter().map(|a| a.series_ids.len()).collect()
    }

    #[test]
    fn split_is_contiguous_and_balanced() {
        let series = ids(10);
        let assignments = split_series(&series, 3);
        assert_eq!(sizes(&assignments), vec![4, 3, 3]);
        assert_eq!(assignments[0].series_ids, ids(4));
        assert_eq!(assignments[2].worker, 3);
        assert_eq!(
            assignments
                .iter()
                .flat_map(|a| a.series_ids.clone())
                .collect::<Vec<_>>(),
            series
        );
    }

    #[test]
    fn split_drops_empty_chunks() {
        let assignments = split_series(&ids(2), 4);
        assert_eq!(sizes(&assignments), vec![1, 1]);
        assert!(split_series(&[], 3).is_empty());
        assert_eq!(sizes(&split_series(&ids(3), 1)), vec![3]);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            validate(&params(2, Some(10)), 5),
            Err(ConfigurationError::TriggerLimitWithMultipleWorkers { ntriggers: 10, ncores: 2 })
        ));
        assert!(matches!(validate(&params(0, None), 5), Err(ConfigurationError::NoWorkers)));
        assert!(matches!(validate(&params(1, None), 0), Err(ConfigurationError::NoSeries)));
        assert_eq!(validate(&params(8, None), 3).unwrap(), 3);
        assert_eq!(validate(&params(1, Some(10)), 3).unwrap(), 1);
    }

    #[test]
    fn zero_trigger_limit_is_unlimited() {
        let run = params(2, Some(0));
        assert_eq!(run.trigger_limit(), None);
        assert_eq!(validate(&run, 5).unwrap(), 2);

        let source = test_source();
        let builder = builder(5, 0);
        let series = ids(5);
        let unlimited = dispatch(&source, &builder, &series, &params(1, None), |_, limit| {
            MemorySink::new(limit)
        })
        .unwrap();
        let zero = dispatch(&source, &builder, &series, &params(1, Some(0)), |_, limit| {
            MemorySink::new(limit)
        })
        .unwrap();
        assert_eq!(zero.status, RunStatus::Completed);
        assert_eq!(zero.completed_series, series);
        assert_eq!(zero.num_triggers, unlimited.num_triggers);
        assert!(zero.num_triggers > 0);
    }

    fn test_source() -> crate::source::memory::MemorySource {
        source(
            (1..=5)
                .map(|i| {
                    let offset = i * 7;
                    two_channel_series(
                        &format!("s{i}"),
                        100,
                        400,
                        &[offset, 100 + offset, 198, 300 + offset],
                        &[offset + 2, 202, 350],
                    )
                })
                .collect(),
        )
    }

    fn keyed(events: &[Event]) -> Vec<(String, u64, usize, i64)> {
        let mut keyed = events
            .iter()
            .map(|e| {
                (
                    e.series_id.clone(),
                    e.event_number,
                    e.num_rows(),
                    e.reference().unwrap().absolute_sample,
                )
            })
            .collect::<Vec<_>>();
        keyed.sort();
        keyed
    }

    #[test]
    fn results_do_not_depend_on_worker_count() {
        let source = test_source();
        let builder = builder(5, 0);
        let series = ids(5);

        let single = dispatch(&source, &builder, &series, &params(1, None), |_, limit| {
            MemorySink::new(limit)
        })
        .unwrap();
        let parallel = dispatch(&source, &builder, &series, &params(3, None), |_, limit| {
            MemorySink::new(limit)
        })
        .unwrap();

        assert_eq!(single.status, RunStatus::Completed);
        assert_eq!(parallel.status, RunStatus::Completed);
        assert_eq!(single.num_events, parallel.num_events);
        assert_eq!(single.num_triggers, parallel.num_triggers);
        assert_eq!(keyed(&single.output.events), keyed(&parallel.output.events));
        assert_eq!(parallel.completed_series, series);
    }

    #[test]
    fn memory_limit_is_shared_between_workers() {
        let source = test_source();
        let builder = builder(5, 0);
        let limits = FlushLog::default();
        let mut params = params(2, None);
        params.memory_limit = 1000;
        dispatch(&source, &builder, &ids(4), &params, |assignment, limit| {
            limits
                .lock()
                .unwrap()
                .push((format!("worker{}", assignment.worker), 0, limit as usize));
            RecordingSink::default()
        })
        .unwrap();
        let mut limits = limits.lock().unwrap().clone();
        limits.sort();
        assert_eq!(
            limits,
            vec![("worker1".to_owned(), 0, 500), ("worker2".to_owned(), 0, 500)]
        );
    }

    #[test]
    fn failed_worker_is_reported_with_abandoned_series() {
        let mut source = test_source();
        source.series[3] = source.series[3].clone().failing_at(2);
        let builder = builder(5, 0);
        let error = dispatch(&source, &builder, &ids(5), &params(2, None), |_, _| {
            RecordingSink::default()
        })
        .unwrap_err();

        let ProcessingError::Workers(failure) = error else {
            panic!("expected a worker failure, got {error}");
        };
        assert_eq!(failure.failures.len(), 1);
        let worker = &failure.failures[0];
        assert_eq!(worker.error.worker, 2);
        assert_eq!(worker.error.series_id, "s4");
        assert_eq!(worker.error.block_index, 2);
        assert_eq!(worker.abandoned_series, vec!["s4".to_owned(), "s5".to_owned()]);
        let mut completed = failure.completed_series.clone();
        completed.sort();
        assert_eq!(completed, ids(3));
    }
}
