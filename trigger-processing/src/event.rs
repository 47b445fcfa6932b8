use crate::{event_builder::CoincidentGroup, trigger::TriggerCandidate};
use detprocess_common::{EventNumber, Real, SeriesId};

/// A group of coincident triggers, numbered within its series.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub series_id: SeriesId,
    pub event_number: EventNumber,
    pub trigger_time: Real,
    /// The reference trigger first.
    pub triggers: Vec<TriggerCandidate>,
    /// Number of triggers merged into the event when it was built.
    pub num_coincident: usize,
    pub processing_id: Option<String>,
}

impl Event {
    pub fn new(
        series_id: SeriesId,
        event_number: EventNumber,
        group: CoincidentGroup,
        processing_id: Option<String>,
    ) -> Self {
        let trigger_time = group.reference().absolute_time;
        let triggers = group.into_triggers();
        Self {
            series_id,
            event_number,
            trigger_time,
            num_coincident: triggers.len(),
            triggers,
            processing_id,
        }
    }

    pub fn reference(&self) -> Option<&TriggerCandidate> {
        self.triggers.first()
    }

    pub fn num_rows(&self) -> usize {
        self.triggers.len()
    }

    /// Keeps the first `keep` triggers, never fewer than the reference.
    pub(crate) fn truncate_triggers(&mut self, keep: usize) {
        self.triggers.truncate(keep.max(1));
    }

    pub fn rows(&self) -> impl Iterator<Item = TriggerRow<'_>> {
        self.triggers
            .iter()
            .enumerate()
            .map(move |(index, trigger)| TriggerRow {
                event: self,
                trigger,
                is_reference: index == 0,
            })
    }
}

/// One row of the trigger table.
#[derive(Debug, Clone, Copy)]
pub struct TriggerRow<'a> {
    pub event: &'a Event,
    pub trigger: &'a TriggerCandidate,
    pub is_reference: bool,
}
