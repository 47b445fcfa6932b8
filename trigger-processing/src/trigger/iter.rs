use super::{
    ChannelTriggerState,
    detector::{Detector, Peak},
};
use detprocess_common::{AbsoluteSample, Real, SampleIndex};

#[derive(Clone)]
pub(crate) struct EventIter<I, D>
where
    I: Iterator<Item = (SampleIndex, Real)>,
    D: Detector,
{
    source: I,
    detector: D,
    finished: bool,
}

impl<I, D> Iterator for EventIter<I, D>
where
    I: Iterator<Item = (SampleIndex, Real)>,
    D: Detector,
{
    type Item = D::EventPointType;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.source.next() {
                Some((index, value)) => {
                    if let Some(event) = self.detector.signal(index, value) {
                        return Some(event);
                    }
                }
                None if self.finished => return None,
                None => {
                    self.finished = true;
                    return self.detector.finish();
                }
            }
        }
    }
}

pub(crate) trait EventFilter<I, D>
where
    I: Iterator<Item = (SampleIndex, Real)>,
    D: Detector,
{
    fn events(self, detector: D) -> EventIter<I, D>;
}

impl<I, D> EventFilter<I, D> for I
where
    I: Iterator<Item = (SampleIndex, Real)>,
    D: Detector,
{
    fn events(self, detector: D) -> EventIter<I, D> {
        EventIter {
            source: self,
            detector,
            finished: false,
        }
    }
}

/// Keeps only the largest of peaks closer than the pileup window.
///
/// The last emitted peak is remembered in [ChannelTriggerState] so that the
/// window reaches into the next block of the series.
pub(crate) struct PileupIter<'s, I>
where
    I: Iterator<Item = Peak>,
{
    source: I,
    window: usize,
    block_start: AbsoluteSample,
    state: &'s mut ChannelTriggerState,
    held: Option<Peak>,
}

impl<I> PileupIter<'_, I>
where
    I: Iterator<Item = Peak>,
{
    fn emit(&mut self, peak: Peak) -> Peak {
        self.state.last_trigger_sample = Some(self.block_start + peak.index as AbsoluteSample);
        peak
    }

    fn within_window(&self, earlier: AbsoluteSample, later: AbsoluteSample) -> bool {
        later - earlier < self.window as AbsoluteSample
    }
}

impl<I> Iterator for PileupIter<'_, I>
where
    I: Iterator<Item = Peak>,
{
    type Item = Peak;

    fn next(&mut self) -> Option<Peak> {
        loop {
            let Some(peak) = self.source.next() else {
                let held = self.held.take()?;
                return Some(self.emit(held));
            };
            if self.window == 0 {
                return Some(self.emit(peak));
            }

            let position = self.block_start + peak.index as AbsoluteSample;
            if let Some(last) = self.state.last_trigger_sample {
                if self.within_window(last, position) {
                    continue;
                }
            }
            match self.held.take() {
                None => self.held = Some(peak),
                Some(held) => {
                    let held_position = self.block_start + held.index as AbsoluteSample;
                    if self.within_window(held_position, position) {
                        self.held = Some(if peak.amplitude > held.amplitude {
                            peak
                        } else {
                            held
                        });
                    } else {
                        self.held = Some(peak);
                        return Some(self.emit(held));
                    }
                }
            }
        }
    }
}

pub(crate) trait PileupFilter<'s, I>
where
    I: Iterator<Item = Peak>,
{
    fn suppress_pileup(
        self,
        window: usize,
        block_start: AbsoluteSample,
        state: &'s mut ChannelTriggerState,
    ) -> PileupIter<'s, I>;
}

impl<'s, I> PileupFilter<'s, I> for I
where
    I: Iterator<Item = Peak>,
{
    fn suppress_pileup(
        self,
        window: usize,
        block_start: AbsoluteSample,
        state: &'s mut ChannelTriggerState,
    ) -> PileupIter<'s, I> {
        PileupIter {
            source: self,
            window,
            block_start,
            state,
            held: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak(index: SampleIndex, amplitude: Real) -> Peak {
        Peak { index, amplitude }
    }

    fn suppress(peaks: Vec<Peak>, window: usize, state: &mut ChannelTriggerState) -> Vec<SampleIndex> {
        peaks
            .into_iter()
            .suppress_pileup(window, 0, state)
            .map(|p| p.index)
            .collect()
    }

    #[test]
    fn detector_finishes_once() {
        let mut iter = [(0, 5.0)].into_iter().events(
            crate::trigger::detector::ThresholdPeakDetector::new(1.0),
        );
        assert_eq!(iter.next(), Some(peak(0, 5.0)));
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn keeps_largest_within_window() {
        let mut state = ChannelTriggerState::default();
        let kept = suppress(
            vec![peak(10, 5.0), peak(40, 8.0), peak(70, 6.0), peak(200, 1.0)],
            50,
            &mut state,
        );
        assert_eq!(kept, vec![40, 200]);
        assert_eq!(state.last_trigger_sample, Some(200));
    }

    #[test]
    fn distance_equal_to_window_is_not_pileup() {
        let mut state = ChannelTriggerState::default();
        let kept = suppress(vec![peak(10, 5.0), peak(60, 8.0)], 50, &mut state);
        assert_eq!(kept, vec![10, 60]);
    }

    #[test]
    fn zero_window_keeps_everything() {
        let mut state = ChannelTriggerState::default();
        let kept = suppress(vec![peak(10, 5.0), peak(11, 8.0)], 0, &mut state);
        assert_eq!(kept, vec![10, 11]);
        assert_eq!(state.last_trigger_sample, Some(11));
    }

    #[test]
    fn previous_block_suppresses_early_peaks() {
        let mut state = ChannelTriggerState {
            last_trigger_sample: Some(95),
        };
        let kept = [peak(20, 9.0), peak(60, 1.0)]
            .into_iter()
            .suppress_pileup(50, 100, &mut state)
            .map(|p| p.index)
            .collect::<Vec<_>>();
        // 120 is 25 samples after 95, 160 is 65 after
        assert_eq!(kept, vec![60]);
        assert_eq!(state.last_trigger_sample, Some(160));
    }
}
