use detprocess_common::{Real, SampleIndex};

/// Consumes a trace one sample at a time, emitting points of interest.
pub(crate) trait Detector {
    type EventPointType;

    fn signal(&mut self, index: SampleIndex, value: Real) -> Option<Self::EventPointType>;

    /// Called once the trace is exhausted.
    fn finish(&mut self) -> Option<Self::EventPointType>;
}

/// The maximum of a run of samples above threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Peak {
    pub(crate) index: SampleIndex,
    pub(crate) amplitude: Real,
}

/// Reduces each contiguous run of samples strictly above the threshold to
/// its first maximum.
#[derive(Default, Debug, Clone)]
pub(crate) struct ThresholdPeakDetector {
    threshold: Real,
    peak: Option<Peak>,
}

impl ThresholdPeakDetector {
    pub(crate) fn new(threshold: Real) -> Self {
        Self {
            threshold,
            peak: None,
        }
    }
}

impl Detector for ThresholdPeakDetector {
    type EventPointType = Peak;

    fn signal(&mut self, index: SampleIndex, value: Real) -> Option<Peak> {
        if value > self.threshold {
            match self.peak {
                Some(peak) if peak.amplitude >= value => {}
                _ => {
                    self.peak = Some(Peak {
                        index,
                        amplitude: value,
                    })
                }
            }
            None
        } else {
            self.peak.take()
        }
    }

    fn finish(&mut self) -> Option<Peak> {
        self.peak.take()
    }
}
