//! Drives the block loop of one worker.
//!
//! The controller reads the blocks of its series in order, turns them into
//! events, and flushes them to its sink in bounded partitions. It stops early
//! when the requested number of triggers is reached or when an in-memory sink
//! is full.
use crate::{
    error::{WorkerError, WorkerFailure, WorkerFailureCause},
    event::Event,
    event_builder::{CoincidenceState, CoincidentGroup, EventBuilder},
    partition::OutputPartition,
    sink::{OutputSink, SinkOutput},
    source::WaveformSource,
};
use detprocess_common::{
    BlockIndex, EventNumber, SeriesId,
    metrics::{
        failures::{FailureKind, get_label},
        names::{BLOCKS_PROCESSED, EVENTS_BUILT, FAILURES, PARTITIONS_FLUSHED, TRIGGERS_DETECTED},
    },
};
use metrics::counter;
use tracing::{debug, error, info, warn};

const PROGRESS_INTERVAL: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FlushReason {
    #[strum(to_string = "memory limit")]
    MemoryLimit,
    #[strum(to_string = "end of series")]
    EndOfSeries,
    #[strum(to_string = "trigger limit")]
    TriggerLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ControllerState {
    Ready,
    Running,
    #[strum(to_string = "Flushing ({0})")]
    Flushing(FlushReason),
    Done,
    Failed,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RunStatus {
    #[default]
    Completed,
    #[strum(to_string = "stopped at trigger limit")]
    StoppedAtTriggerLimit,
    #[strum(to_string = "stopped at memory limit")]
    StoppedAtMemoryLimit,
}

impl RunStatus {
    pub fn is_stopped_by_limit(self) -> bool {
        self != RunStatus::Completed
    }
}

#[derive(Default, Debug, Clone)]
pub struct StreamSettings {
    pub worker: usize,
    pub ntriggers: Option<u64>,
    /// Partition size, in estimated bytes, at which the partition is flushed.
    pub memory_limit: u64,
    pub processing_id: Option<String>,
}

#[derive(Debug)]
pub struct WorkerReport {
    pub worker: usize,
    pub status: RunStatus,
    pub completed_series: Vec<SeriesId>,
    pub num_triggers: u64,
    pub num_events: u64,
    pub num_partitions: usize,
    pub output: SinkOutput,
}

struct SeriesEnd {
    completed: bool,
    stop: Option<RunStatus>,
}

/// Position of the controller within the current series.
struct Cursor<'a> {
    series_id: &'a str,
    blocks_read: BlockIndex,
    event_number: EventNumber,
}

pub struct StreamController<'b, S: OutputSink> {
    builder: &'b EventBuilder,
    settings: StreamSettings,
    sink: S,
    state: ControllerState,
    trigger_count: u64,
    event_count: u64,
    partition_count: usize,
    next_progress: u64,
}

impl<'b, S: OutputSink> StreamController<'b, S> {
    pub fn new(builder: &'b EventBuilder, settings: StreamSettings, sink: S) -> Self {
        Self {
            builder,
            settings,
            sink,
            state: ControllerState::Ready,
            trigger_count: 0,
            event_count: 0,
            partition_count: 0,
            next_progress: PROGRESS_INTERVAL,
        }
    }

    /// Processes `series` in order.
    ///
    /// # Error Modes
    /// A source or sink failure stops the worker. The partition of the
    /// failing series is discarded and the failure lists the series that
    /// were completed and those abandoned.
    #[tracing::instrument(skip_all, fields(worker = self.settings.worker, num_series = series.len(), num_triggers))]
    pub fn run<W: WaveformSource + ?Sized>(
        mut self,
        source: &W,
        series: &[SeriesId],
    ) -> Result<WorkerReport, WorkerFailure> {
        let mut completed_series = Vec::new();
        let mut status = RunStatus::Completed;
        for (position, series_id) in series.iter().enumerate() {
            if self.trigger_limit_reached() {
                status = RunStatus::StoppedAtTriggerLimit;
                break;
            }
            match self.process_series(source, series_id) {
                Ok(end) => {
                    if end.completed {
                        completed_series.push(series_id.clone());
                    }
                    if let Some(stop) = end.stop {
                        status = stop;
                        break;
                    }
                }
                Err(error) => {
                    self.transition(ControllerState::Failed);
                    let kind = match error.cause {
                        WorkerFailureCause::Source(_) => FailureKind::SourceReadFailed,
                        WorkerFailureCause::Sink(_) => FailureKind::SinkFlushFailed,
                    };
                    counter!(FAILURES, &[get_label(kind)]).increment(1);
                    error!("{error}");
                    return Err(WorkerFailure {
                        error,
                        completed_series,
                        abandoned_series: series.get(position..).unwrap_or_default().to_vec(),
                    });
                }
            }
        }
        self.transition(ControllerState::Done);
        tracing::Span::current().record("num_triggers", self.trigger_count);
        info!(
            "Worker {} {status}: {} trigger(s) in {} event(s), {} partition(s)",
            self.settings.worker, self.trigger_count, self.event_count, self.partition_count
        );
        Ok(WorkerReport {
            worker: self.settings.worker,
            status,
            completed_series,
            num_triggers: self.trigger_count,
            num_events: self.event_count,
            num_partitions: self.partition_count,
            output: self.sink.into_output(),
        })
    }

    #[tracing::instrument(skip_all, fields(series_id = series_id, num_blocks))]
    fn process_series<W: WaveformSource + ?Sized>(
        &mut self,
        source: &W,
        series_id: &str,
    ) -> Result<SeriesEnd, WorkerError> {
        info!("Processing series {series_id}");
        let mut cursor = Cursor {
            series_id,
            blocks_read: 0,
            event_number: 0,
        };
        let mut reader = source
            .open_series(series_id)
            .map_err(|e| self.worker_error(&cursor, e.into()))?;
        let channels = self.builder.raw_channels();
        let mut trigger_states = self.builder.new_trigger_states();
        let mut coincidence = CoincidenceState::default();
        let mut partition = OutputPartition::new(series_id.to_owned(), 1);
        self.transition(ControllerState::Running);

        loop {
            if self.trigger_limit_reached() {
                self.flush_at_trigger_limit(partition, &cursor)?;
                return Ok(SeriesEnd {
                    completed: false,
                    stop: Some(RunStatus::StoppedAtTriggerLimit),
                });
            }
            if !partition.is_empty() && partition.estimated_bytes() >= self.settings.memory_limit {
                let next = partition.next();
                self.flush(
                    FlushReason::MemoryLimit,
                    std::mem::replace(&mut partition, next),
                    &cursor,
                )?;
                if self.sink.is_saturated() {
                    warn!("Memory limit reached, not all events processed");
                    return Ok(SeriesEnd {
                        completed: false,
                        stop: Some(RunStatus::StoppedAtMemoryLimit),
                    });
                }
                self.transition(ControllerState::Running);
            }

            let block = match reader.next_block(&channels) {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(e) => return Err(self.worker_error(&cursor, e.into())),
            };
            let candidates = self
                .builder
                .acquire_triggers(&block, &mut trigger_states)
                .map_err(|e| self.worker_error(&cursor, e.into()))?;
            for group in self.builder.build(&mut coincidence, candidates, &block.info) {
                self.push_event(&mut partition, &mut cursor, group);
            }
            cursor.blocks_read += 1;
            counter!(BLOCKS_PROCESSED).increment(1);
        }
        tracing::Span::current().record("num_blocks", cursor.blocks_read);

        if let Some(group) = self.builder.finish(&mut coincidence) {
            self.push_event(&mut partition, &mut cursor, group);
        }
        if self.trigger_limit_reached() {
            self.flush_at_trigger_limit(partition, &cursor)?;
            return Ok(SeriesEnd {
                completed: true,
                stop: Some(RunStatus::StoppedAtTriggerLimit),
            });
        }
        self.flush(FlushReason::EndOfSeries, partition, &cursor)?;
        if self.sink.is_saturated() {
            warn!("Memory limit reached, not all events processed");
            return Ok(SeriesEnd {
                completed: true,
                stop: Some(RunStatus::StoppedAtMemoryLimit),
            });
        }
        info!(
            "Series {series_id} done: {} event(s) from {} block(s)",
            cursor.event_number, cursor.blocks_read
        );
        Ok(SeriesEnd {
            completed: true,
            stop: None,
        })
    }

    fn push_event(
        &mut self,
        partition: &mut OutputPartition,
        cursor: &mut Cursor<'_>,
        group: CoincidentGroup,
    ) {
        cursor.event_number += 1;
        let event = Event::new(
            cursor.series_id.to_owned(),
            cursor.event_number,
            group,
            self.settings.processing_id.clone(),
        );
        let rows = event.num_rows() as u64;
        self.trigger_count += rows;
        self.event_count += 1;
        counter!(TRIGGERS_DETECTED).increment(rows);
        counter!(EVENTS_BUILT).increment(1);
        partition.push(event);

        if self.trigger_count >= self.next_progress {
            info!("Worker {}: {} triggers found", self.settings.worker, self.trigger_count);
            while self.next_progress <= self.trigger_count {
                self.next_progress += PROGRESS_INTERVAL;
            }
        }
    }

    fn trigger_limit_reached(&self) -> bool {
        self.settings
            .ntriggers
            .is_some_and(|limit| self.trigger_count >= limit)
    }

    fn flush_at_trigger_limit(
        &mut self,
        mut partition: OutputPartition,
        cursor: &Cursor<'_>,
    ) -> Result<(), WorkerError> {
        if let Some(limit) = self.settings.ntriggers {
            let excess = self.trigger_count.saturating_sub(limit) as usize;
            partition.truncate_rows(partition.num_rows().saturating_sub(excess));
            self.trigger_count = self.trigger_count.min(limit);
        }
        self.flush(FlushReason::TriggerLimit, partition, cursor)?;
        info!("Requested number of triggers reached");
        Ok(())
    }

    fn flush(
        &mut self,
        reason: FlushReason,
        partition: OutputPartition,
        cursor: &Cursor<'_>,
    ) -> Result<(), WorkerError> {
        self.transition(ControllerState::Flushing(reason));
        if partition.is_empty() {
            debug!("Nothing to flush for {}", cursor.series_id);
            return Ok(());
        }
        let receipt = self
            .sink
            .flush(partition)
            .map_err(|e| self.worker_error(cursor, e.into()))?;
        self.partition_count += 1;
        counter!(PARTITIONS_FLUSHED).increment(1);
        debug!("Flushed partition: {receipt:?}");
        Ok(())
    }

    fn transition(&mut self, state: ControllerState) {
        debug!("Worker {}: {} -> {state}", self.settings.worker, self.state);
        self.state = state;
    }

    fn worker_error(&self, cursor: &Cursor<'_>, cause: WorkerFailureCause) -> WorkerError {
        WorkerError {
            worker: self.settings.worker,
            series_id: cursor.series_id.to_owned(),
            block_index: cursor.blocks_read,
            trigger_count: self.trigger_count,
            cause,
        }
    }
}
