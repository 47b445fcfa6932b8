//! Destinations of flushed partitions.
mod file;
mod memory;

use crate::{error::SinkError, event::Event, partition::OutputPartition};
use std::path::PathBuf;

pub use file::{FileSink, create_output_directory};
pub use memory::MemorySink;

#[derive(Debug, Clone, PartialEq)]
pub enum FlushReceipt {
    Written { path: PathBuf, rows: usize },
    Retained { rows: usize },
}

/// What a sink produced over a whole run.
#[derive(Default, Debug, Clone)]
pub struct SinkOutput {
    pub events: Vec<Event>,
    pub files: Vec<PathBuf>,
}

impl SinkOutput {
    pub fn append(&mut self, mut other: SinkOutput) {
        self.events.append(&mut other.events);
        self.files.append(&mut other.files);
    }
}

pub trait OutputSink {
    /// Takes ownership of a partition holding complete events only.
    fn flush(&mut self, partition: OutputPartition) -> Result<FlushReceipt, SinkError>;

    /// True once the sink should not receive any more partitions.
    fn is_saturated(&self) -> bool {
        false
    }

    fn into_output(self) -> SinkOutput;
}
