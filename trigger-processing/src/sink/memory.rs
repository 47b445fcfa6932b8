use super::{FlushReceipt, OutputSink, SinkOutput};
use crate::{error::SinkError, event::Event, partition::OutputPartition};
use tracing::warn;

/// Keeps every flushed event in memory, up to a size limit.
#[derive(Debug)]
pub struct MemorySink {
    memory_limit: u64,
    retained_bytes: u64,
    events: Vec<Event>,
}

impl MemorySink {
    pub fn new(memory_limit: u64) -> Self {
        Self {
            memory_limit,
            retained_bytes: 0,
            events: Vec::new(),
        }
    }

    pub fn retained_bytes(&self) -> u64 {
        self.retained_bytes
    }
}

impl OutputSink for MemorySink {
    fn flush(&mut self, partition: OutputPartition) -> Result<FlushReceipt, SinkError> {
        let rows = partition.num_rows();
        self.retained_bytes += partition.estimated_bytes();
        self.events.extend(partition.into_events());
        if self.is_saturated() {
            warn!(
                "In-memory output reached {} bytes, the limit is {}",
                self.retained_bytes, self.memory_limit
            );
        }
        Ok(FlushReceipt::Retained { rows })
    }

    fn is_saturated(&self) -> bool {
        self.retained_bytes >= self.memory_limit
    }

    fn into_output(self) -> SinkOutput {
        SinkOutput {
            events: self.events,
            files: Vec::new(),
        }
    }
}
