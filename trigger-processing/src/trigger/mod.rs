//! Detection of pulses on one trigger channel.
//!
//! A [ChannelTrigger] reduces a filtered trace to a lazy sequence of
//! [TriggerCandidate]s: runs above threshold become single peaks, and peaks
//! closer than the pileup window are merged into the largest of them.
mod detector;
mod iter;

use crate::{
    channels::ChannelExpression,
    error::SourceResult,
    filter::MatchedFilter,
    source::{BlockInfo, WaveformBlock},
};
use detector::ThresholdPeakDetector;
use detprocess_common::{AbsoluteSample, Real, SampleIndex};
use iter::{EventFilter, PileupFilter};

/// One detected pulse on one trigger channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerCandidate {
    pub channel: String,
    pub sample_index: SampleIndex,
    pub absolute_sample: AbsoluteSample,
    /// Filter output at the peak, positive in the configured pulse direction.
    pub amplitude: Real,
    pub absolute_time: Real,
}

/// Per series memory of one trigger channel.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct ChannelTriggerState {
    pub last_trigger_sample: Option<AbsoluteSample>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

impl Polarity {
    pub fn from_positive_pulses(positive_pulses: bool) -> Self {
        if positive_pulses {
            Polarity::Positive
        } else {
            Polarity::Negative
        }
    }

    fn factor(self) -> Real {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

#[derive(Debug)]
pub struct ChannelTrigger {
    name: String,
    expression: ChannelExpression,
    filter: Box<dyn MatchedFilter>,
    threshold: Real,
    pileup_window_samples: usize,
    polarity: Polarity,
}

impl ChannelTrigger {
    /// # Parameters
    /// - threshold: in units of the filter output.
    /// - pileup_window_samples: 0 disables pileup suppression.
    pub fn new(
        name: String,
        expression: ChannelExpression,
        filter: Box<dyn MatchedFilter>,
        threshold: Real,
        pileup_window_samples: usize,
        polarity: Polarity,
    ) -> Self {
        Self {
            name,
            expression,
            filter,
            threshold,
            pileup_window_samples,
            polarity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &ChannelExpression {
        &self.expression
    }

    #[cfg(test)]
    pub(crate) fn threshold(&self) -> Real {
        self.threshold
    }

    #[cfg(test)]
    pub(crate) fn pileup_window_samples(&self) -> usize {
        self.pileup_window_samples
    }

    #[cfg(test)]
    pub(crate) fn polarity(&self) -> Polarity {
        self.polarity
    }

    /// Combines the raw channels of the trigger and applies the matched filter.
    pub fn filter_block(&self, block: &WaveformBlock) -> SourceResult<Vec<Real>> {
        Ok(self.filter.apply(&self.expression.combine(block)?))
    }

    /// Lazily detects the pulses of `filtered`, in increasing sample order.
    ///
    /// `state` is updated as candidates are emitted, so it must be the same
    /// value for every block of a series.
    pub fn detect<'a>(
        &'a self,
        filtered: &'a [Real],
        block: &'a BlockInfo,
        state: &'a mut ChannelTriggerState,
    ) -> impl Iterator<Item = TriggerCandidate> + 'a {
        let factor = self.polarity.factor();
        let block_start = block.start_sample();
        filtered
            .iter()
            .enumerate()
            .map(move |(index, &value)| (index, factor * value))
            .events(ThresholdPeakDetector::new(self.threshold))
            .suppress_pileup(self.pileup_window_samples, block_start, state)
            .map(move |peak| TriggerCandidate {
                channel: self.name.clone(),
                sample_index: peak.index,
                absolute_sample: block_start + peak.index as AbsoluteSample,
                amplitude: peak.amplitude,
                absolute_time: block.time_of(peak.index),
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::filter::IdentityFilter;
    use assert_approx_eq::assert_approx_eq;

    pub(crate) fn identity_trigger(
        name: &str,
        channel: &str,
        threshold: Real,
        pileup_window_samples: usize,
    ) -> ChannelTrigger {
        ChannelTrigger::new(
            name.to_owned(),
            ChannelExpression::parse(channel, &[channel.to_owned()]).unwrap(),
            Box::new(IdentityFilter),
            threshold,
            pileup_window_samples,
            Polarity::Positive,
        )
    }

    pub(crate) fn block_info(block_index: u64, start_time: Real, num_samples: usize) -> BlockInfo {
        BlockInfo {
            series_id: "s1".to_owned(),
            block_index,
            facility: 1,
            sample_rate: 1000.0,
            pretrigger_samples: 0,
            start_time,
            num_samples,
        }
    }

    fn trace_with(length: usize, pulses: &[(usize, Real)]) -> Vec<Real> {
        let mut trace = vec![0.0; length];
        for &(index, amplitude) in pulses {
            trace[index] = amplitude;
        }
        trace
    }

    #[test]
    fn candidates_carry_position_and_time() {
        let trigger = identity_trigger("t1", "chA", 1.0, 0);
        let info = block_info(2, 0.2, 100);
        let trace = trace_with(100, &[(5, 3.0), (50, 2.0)]);
        let mut state = ChannelTriggerState::default();
        let candidates = trigger.detect(&trace, &info, &mut state).collect::<Vec<_>>();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].channel, "t1");
        assert_eq!(candidates[0].sample_index, 5);
        assert_eq!(candidates[0].absolute_sample, 205);
        assert_approx_eq!(candidates[0].absolute_time, 0.205, 1e-12);
        assert_eq!(candidates[1].absolute_sample, 250);
        assert_eq!(state.last_trigger_sample, Some(250));
    }

    #[test]
    fn pileup_keeps_largest_pulse() {
        let trigger = identity_trigger("t1", "chA", 1.0, 30);
        let info = block_info(0, 0.0, 100);
        let trace = trace_with(100, &[(10, 3.0), (20, 5.0), (45, 4.0), (80, 2.0)]);
        let mut state = ChannelTriggerState::default();
        let kept = trigger
            .detect(&trace, &info, &mut state)
            .map(|c| c.sample_index)
            .collect::<Vec<_>>();
        assert_eq!(kept, vec![20, 80]);

        // no two candidates closer than the window
        assert!(kept.windows(2).all(|pair| pair[1] - pair[0] >= 30));
    }

    #[test]
    fn pileup_spans_block_boundary() {
        let trigger = identity_trigger("t1", "chA", 1.0, 30);
        let mut state = ChannelTriggerState::default();

        let first = trace_with(100, &[(95, 6.0)]);
        let info = block_info(0, 0.0, 100);
        assert_eq!(trigger.detect(&first, &info, &mut state).count(), 1);

        let second = trace_with(100, &[(10, 9.0), (40, 2.0)]);
        let info = block_info(1, 0.1, 100);
        let kept = trigger
            .detect(&second, &info, &mut state)
            .map(|c| c.absolute_sample)
            .collect::<Vec<_>>();
        assert_eq!(kept, vec![140]);
    }

    #[test]
    fn negative_pulses() {
        let mut trigger = identity_trigger("t1", "chA", 1.0, 0);
        trigger.polarity = Polarity::from_positive_pulses(false);
        let info = block_info(0, 0.0, 10);
        let trace = trace_with(10, &[(3, -4.0), (6, 4.0)]);
        let mut state = ChannelTriggerState::default();
        let candidates = trigger.detect(&trace, &info, &mut state).collect::<Vec<_>>();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].sample_index, 3);
        assert_approx_eq!(candidates[0].amplitude, 4.0);
    }

    #[test]
    fn quiet_trace_has_no_candidates() {
        let trigger = identity_trigger("t1", "chA", 1.0, 10);
        let info = block_info(0, 0.0, 50);
        let mut state = ChannelTriggerState::default();
        assert_eq!(trigger.detect(&[0.5; 50], &info, &mut state).count(), 0);
        assert_eq!(state.last_trigger_sample, None);
    }
}
