//! Merging of per-channel triggers into coincident groups.
use crate::{
    error::{ConfigurationError, SourceResult},
    source::{BlockInfo, WaveformBlock},
    trigger::{ChannelTrigger, ChannelTriggerState, TriggerCandidate},
};
use detprocess_common::AbsoluteSample;
use rayon::prelude::*;
use std::{cmp::Ordering, collections::HashSet};
use tracing::debug;

/// Maximum distance, in samples, from the anchor of a group to its last member.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoincidenceWindow(pub usize);

impl CoincidenceWindow {
    pub fn samples(self) -> usize {
        self.0
    }
}

/// A group whose window still reached past the end of the last block.
#[derive(Default, Debug, Clone)]
pub struct CoincidenceState {
    open: Vec<TriggerCandidate>,
}

impl CoincidenceState {
    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        !self.open.is_empty()
    }
}

/// Triggers within one coincidence window, with the reference trigger split out.
#[derive(Debug, Clone, PartialEq)]
pub struct CoincidentGroup {
    reference: TriggerCandidate,
    others: Vec<TriggerCandidate>,
}

impl CoincidentGroup {
    /// Builds a group from triggers in sweep order, `None` if there are none.
    ///
    /// The reference is the earliest trigger, the largest of those if several
    /// share the earliest sample, the first by channel name after that.
    pub fn new(mut triggers: Vec<TriggerCandidate>) -> Option<Self> {
        let earliest = triggers.iter().map(|t| t.absolute_sample).min()?;
        let position = triggers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.absolute_sample == earliest)
            .fold(None, |best: Option<(usize, &TriggerCandidate)>, (index, t)| match best {
                Some((_, b)) if b.amplitude >= t.amplitude => best,
                _ => Some((index, t)),
            })
            .map(|(index, _)| index)?;
        let reference = triggers.remove(position);
        Some(Self {
            reference,
            others: triggers,
        })
    }

    pub fn reference(&self) -> &TriggerCandidate {
        &self.reference
    }

    pub fn len(&self) -> usize {
        self.others.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// All triggers, the reference first.
    pub fn into_triggers(self) -> Vec<TriggerCandidate> {
        let mut triggers = Vec::with_capacity(self.others.len() + 1);
        triggers.push(self.reference);
        triggers.extend(self.others);
        triggers
    }
}

fn sweep_order(a: &TriggerCandidate, b: &TriggerCandidate) -> Ordering {
    a.absolute_sample
        .cmp(&b.absolute_sample)
        .then_with(|| a.channel.cmp(&b.channel))
}

#[derive(Debug)]
pub struct EventBuilder {
    triggers: Vec<ChannelTrigger>,
    window: CoincidenceWindow,
}

impl EventBuilder {
    /// # Error Modes
    /// - [ConfigurationError::NoTriggerChannels] if `triggers` is empty.
    /// - [ConfigurationError::DuplicateTriggerName] if two triggers share a name.
    /// - [ConfigurationError::DuplicateChannel] if a raw channel feeds two triggers.
    pub fn new(
        triggers: Vec<ChannelTrigger>,
        window: CoincidenceWindow,
    ) -> Result<Self, ConfigurationError> {
        if triggers.is_empty() {
            return Err(ConfigurationError::NoTriggerChannels);
        }
        let mut names = HashSet::new();
        let mut channels = HashSet::new();
        for trigger in &triggers {
            if !names.insert(trigger.name()) {
                return Err(ConfigurationError::DuplicateTriggerName(
                    trigger.name().to_owned(),
                ));
            }
            for channel in trigger.expression().channels() {
                if !channels.insert(channel) {
                    return Err(ConfigurationError::DuplicateChannel(channel.to_owned()));
                }
            }
        }
        Ok(Self { triggers, window })
    }

    pub fn triggers(&self) -> &[ChannelTrigger] {
        &self.triggers
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> CoincidenceWindow {
        self.window
    }

    /// The raw channels to read from the source, in trigger order.
    pub fn raw_channels(&self) -> Vec<String> {
        self.triggers
            .iter()
            .flat_map(|trigger| trigger.expression().channels())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Fresh per-channel states, one per trigger, for the start of a series.
    pub fn new_trigger_states(&self) -> Vec<ChannelTriggerState> {
        vec![ChannelTriggerState::default(); self.triggers.len()]
    }

    /// Filters the block on every trigger channel and detects its candidates.
    #[tracing::instrument(skip_all, level = "debug", fields(block_index = block.info.block_index, num_triggers))]
    pub fn acquire_triggers(
        &self,
        block: &WaveformBlock,
        states: &mut [ChannelTriggerState],
    ) -> SourceResult<Vec<TriggerCandidate>> {
        let per_channel = self
            .triggers
            .par_iter()
            .zip(states.par_iter_mut())
            .map(|(trigger, state)| {
                let filtered = trigger.filter_block(block)?;
                Ok(trigger
                    .detect(&filtered, &block.info, state)
                    .collect::<Vec<_>>())
            })
            .collect::<SourceResult<Vec<_>>>()?;
        let candidates = per_channel.into_iter().flatten().collect::<Vec<_>>();
        tracing::Span::current().record("num_triggers", candidates.len());
        Ok(candidates)
    }

    /// Merges the candidates of a block into coincident groups.
    ///
    /// The first unconsumed candidate anchors a group and every later one
    /// within the window of the anchor joins it. A group that could still
    /// gain members from the next block is kept open in `state`.
    pub fn build(
        &self,
        state: &mut CoincidenceState,
        mut candidates: Vec<TriggerCandidate>,
        block: &BlockInfo,
    ) -> Vec<CoincidentGroup> {
        candidates.append(&mut state.open);
        candidates.sort_by(sweep_order);

        let window = self.window.samples() as AbsoluteSample;
        let mut groups = Vec::new();
        let mut current: Vec<TriggerCandidate> = Vec::new();
        for candidate in candidates {
            if let Some(anchor) = current.first() {
                if candidate.absolute_sample - anchor.absolute_sample > window {
                    groups.extend(CoincidentGroup::new(std::mem::take(&mut current)));
                }
            }
            current.push(candidate);
        }
        match current.first() {
            Some(anchor) if anchor.absolute_sample + window >= block.end_sample() => {
                debug!("Group anchored at {} left open", anchor.absolute_sample);
                state.open = current;
            }
            Some(_) => groups.extend(CoincidentGroup::new(current)),
            None => {}
        }
        groups
    }

    /// Closes the group left open at the end of a series.
    pub fn finish(&self, state: &mut CoincidenceState) -> Option<CoincidentGroup> {
        CoincidentGroup::new(std::mem::take(&mut state.open))
    }
}
