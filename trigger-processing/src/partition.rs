use crate::event::Event;
use detprocess_common::SeriesId;

/// Columns of the trigger table, one row per trigger.
pub const TRIGGER_TABLE_COLUMNS: [&str; 10] = [
    "series_number",
    "event_number",
    "trigger_time",
    "trigger_index",
    "trigger_sample",
    "trigger_amplitude",
    "trigger_channel",
    "reference",
    "ntriggers_in_event",
    "processing_id",
];

const BYTES_PER_VALUE: u64 = 8;

/// Events of one series waiting to be flushed to a sink.
#[derive(Debug, Clone)]
pub struct OutputPartition {
    series_id: SeriesId,
    dump_number: u32,
    events: Vec<Event>,
    num_rows: usize,
}

impl OutputPartition {
    pub fn new(series_id: SeriesId, dump_number: u32) -> Self {
        Self {
            series_id,
            dump_number,
            events: Vec::new(),
            num_rows: 0,
        }
    }

    /// An empty partition for the same series, with the next dump number.
    pub fn next(&self) -> Self {
        Self::new(self.series_id.clone(), self.dump_number + 1)
    }

    pub fn series_id(&self) -> &str {
        &self.series_id
    }

    /// Counts the flushes of a series, starting from 1.
    pub fn dump_number(&self) -> u32 {
        self.dump_number
    }

    pub fn push(&mut self, event: Event) {
        self.num_rows += event.num_rows();
        self.events.push(event);
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.num_rows as u64 * TRIGGER_TABLE_COLUMNS.len() as u64 * BYTES_PER_VALUE
    }

    /// Keeps the first `keep` rows.
    ///
    /// An event straddling the boundary loses its trailing triggers but
    /// keeps its reference, later events are dropped.
    pub fn truncate_rows(&mut self, keep: usize) {
        let mut remaining = keep;
        self.events.retain_mut(|event| {
            if remaining == 0 {
                return false;
            }
            let rows = event.num_rows().min(remaining);
            event.truncate_triggers(rows);
            remaining -= rows;
            true
        });
        self.num_rows = self.events.iter().map(Event::num_rows).sum();
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{event_builder::CoincidentGroup, trigger::TriggerCandidate};
    use detprocess_common::Real;

    pub(crate) fn event(event_number: u64, num_triggers: usize) -> Event {
        let triggers = (0..num_triggers)
            .map(|i| TriggerCandidate {
                channel: format!("ch{i}"),
                sample_index: event_number as usize * 100,
                absolute_sample: event_number as i64 * 100,
                amplitude: 1.0,
                absolute_time: event_number as Real * 0.1,
            })
            .collect();
        Event::new(
            "s1".to_owned(),
            event_number,
            CoincidentGroup::new(triggers).unwrap(),
            None,
        )
    }

    #[test]
    fn size_estimate_counts_rows() {
        let mut partition = OutputPartition::new("s1".to_owned(), 1);
        assert_eq!(partition.estimated_bytes(), 0);
        partition.push(event(1, 3));
        partition.push(event(2, 1));
        assert_eq!(partition.num_rows(), 4);
        assert_eq!(partition.num_events(), 2);
        assert_eq!(partition.estimated_bytes(), 4 * 10 * 8);
    }

    #[test]
    fn truncation_keeps_exact_rows() {
        let mut partition = OutputPartition::new("s1".to_owned(), 1);
        partition.push(event(1, 2));
        partition.push(event(2, 3));
        partition.push(event(3, 1));
        partition.truncate_rows(4);
        assert_eq!(partition.num_rows(), 4);
        assert_eq!(partition.num_events(), 2);
        assert_eq!(partition.events()[1].num_rows(), 2);
        assert_eq!(partition.events()[1].reference().unwrap().channel, "ch0");
    }

    #[test]
    fn truncation_beyond_size_is_noop() {
        let mut partition = OutputPartition::new("s1".to_owned(), 1);
        partition.push(event(1, 2));
        partition.truncate_rows(10);
        assert_eq!(partition.num_rows(), 2);
        partition.truncate_rows(0);
        assert!(partition.is_empty());
    }

    #[test]
    fn next_partition_increments_dump_number() {
        let mut partition = OutputPartition::new("s1".to_owned(), 1);
        partition.push(event(1, 1));
        let next = partition.next();
        assert_eq!(next.dump_number(), 2);
        assert_eq!(next.series_id(), "s1");
        assert!(next.is_empty());
    }
}
