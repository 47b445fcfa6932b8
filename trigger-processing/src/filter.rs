//! Matched filtering of raw traces.
//!
//! The [OptimumFilter] estimates, at every sample, the amplitude of a pulse
//! of known shape starting there, weighting frequencies by the inverse of the
//! noise power. Its output is in units of the template amplitude, so a pulse
//! equal to `a` times the template yields `a` at the pulse position.
use crate::error::FilterError;
use detprocess_common::{Real, SampleRate};
use rustfft::{FftPlanner, num_complex::Complex};
use std::fmt::Debug;

pub trait MatchedFilter: Send + Sync + Debug {
    /// Returns the filtered trace, the same length as `trace`.
    fn apply(&self, trace: &[Real]) -> Vec<Real>;

    /// Expected standard deviation of the filter output on noise alone.
    fn resolution(&self) -> Real;
}

#[derive(Debug, Clone)]
pub struct OptimumFilter {
    kernel: Vec<Real>,
    pretrigger: usize,
    resolution: Real,
}

impl OptimumFilter {
    /// Builds the filter from a template and the noise power spectral density.
    ///
    /// # Parameters
    /// - template: pulse shape, `pretrigger` samples before its onset.
    /// - psd: two-sided PSD in V²/Hz of the template length, or a one-sided
    ///   PSD of `len / 2 + 1` values which is unfolded.
    /// - sample_rate: in Hz.
    ///
    /// # Error Modes
    /// - [FilterError::EmptyTemplate], [FilterError::Pretrigger] for an unusable template.
    /// - [FilterError::PsdLength] if the PSD length matches neither form.
    /// - [FilterError::ZeroNormalisation] if the template has no weight at any valid frequency.
    pub fn new(
        template: &[Real],
        pretrigger: usize,
        psd: &[Real],
        sample_rate: SampleRate,
    ) -> Result<Self, FilterError> {
        let length = template.len();
        if length == 0 {
            return Err(FilterError::EmptyTemplate);
        }
        if pretrigger >= length {
            return Err(FilterError::Pretrigger { pretrigger, length });
        }
        let psd = two_sided_psd(psd, length)?;

        let mut planner = FftPlanner::<Real>::new();
        let mut spectrum = to_complex(template, length);
        planner.plan_fft_forward(length).process(&mut spectrum);

        // The DC bin carries the baseline, which is not part of the amplitude.
        let mut norm = 0.0;
        let mut weights = spectrum
            .iter()
            .zip(&psd)
            .enumerate()
            .map(|(k, (s, &j))| {
                if k == 0 || !j.is_finite() || j <= 0.0 {
                    Complex::default()
                } else {
                    norm += s.norm_sqr() / j;
                    *s / j
                }
            })
            .collect::<Vec<_>>();
        if !norm.is_finite() || norm <= 0.0 {
            return Err(FilterError::ZeroNormalisation);
        }
        planner.plan_fft_inverse(length).process(&mut weights);

        Ok(Self {
            kernel: weights.iter().map(|w| w.re / norm).collect(),
            pretrigger,
            resolution: (sample_rate * length as Real / norm).sqrt(),
        })
    }

    pub fn template_length(&self) -> usize {
        self.kernel.len()
    }
}

impl MatchedFilter for OptimumFilter {
    /// Positions where the template does not fit inside the trace are zero.
    fn apply(&self, trace: &[Real]) -> Vec<Real> {
        let length = self.kernel.len();
        let mut filtered = vec![0.0; trace.len()];
        if trace.len() < length {
            return filtered;
        }

        let n_fft = (trace.len() + length).next_power_of_two();
        let mut planner = FftPlanner::<Real>::new();
        let forward = planner.plan_fft_forward(n_fft);
        let mut signal = to_complex(trace, n_fft);
        let mut kernel = to_complex(&self.kernel, n_fft);
        forward.process(&mut signal);
        forward.process(&mut kernel);

        let mut correlation = signal
            .iter()
            .zip(&kernel)
            .map(|(x, g)| *x * g.conj())
            .collect::<Vec<_>>();
        planner.plan_fft_inverse(n_fft).process(&mut correlation);

        let scale = 1.0 / n_fft as Real;
        for (offset, value) in correlation
            .iter()
            .take(trace.len() - length + 1)
            .enumerate()
        {
            if let Some(out) = filtered.get_mut(offset + self.pretrigger) {
                *out = value.re * scale;
            }
        }
        filtered
    }

    fn resolution(&self) -> Real {
        self.resolution
    }
}

fn to_complex(values: &[Real], length: usize) -> Vec<Complex<Real>> {
    let mut buffer = values
        .iter()
        .map(|&x| Complex::new(x, 0.0))
        .collect::<Vec<_>>();
    buffer.resize(length, Complex::new(0.0, 0.0));
    buffer
}

/// A one-sided PSD holds twice the power of the two-sided one, except at DC
/// and, for even lengths, at the Nyquist frequency.
fn two_sided_psd(psd: &[Real], length: usize) -> Result<Vec<Real>, FilterError> {
    let one_sided = length / 2 + 1;
    if psd.len() == length {
        return Ok(psd.to_vec());
    }
    if psd.len() != one_sided {
        return Err(FilterError::PsdLength {
            psd: psd.len(),
            two_sided: length,
            one_sided,
        });
    }
    Ok((0..length)
        .map(|k| {
            let folded = k.min(length - k);
            let value = psd.get(folded).copied().unwrap_or_default();
            if folded == 0 || 2 * folded == length {
                value
            } else {
                value / 2.0
            }
        })
        .collect())
}

/// Passes traces through unchanged, with unit resolution.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct IdentityFilter;

#[cfg(test)]
impl MatchedFilter for IdentityFilter {
    fn apply(&self, trace: &[Real]) -> Vec<Real> {
        trace.to_vec()
    }

    fn resolution(&self) -> Real {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const SAMPLE_RATE: SampleRate = 1.0e6;

    fn pulse_template(length: usize, pretrigger: usize) -> Vec<Real> {
        let raw = (0..length)
            .map(|i| {
                if i < pretrigger {
                    0.0
                } else {
                    let t = (i - pretrigger) as Real;
                    (-t / 12.0).exp() - (-t / 3.0).exp()
                }
            })
            .collect::<Vec<_>>();
        let peak = raw.iter().copied().fold(Real::MIN, Real::max);
        raw.iter().map(|v| v / peak).collect()
    }

    fn white_psd(length: usize, sigma: Real) -> Vec<Real> {
        vec![sigma * sigma / SAMPLE_RATE; length]
    }

    #[test]
    fn recovers_pulse_amplitude() {
        let template = pulse_template(64, 16);
        let filter = OptimumFilter::new(&template, 16, &white_psd(64, 0.01), SAMPLE_RATE).unwrap();

        let mut trace = vec![0.0; 300];
        for (i, value) in template.iter().enumerate() {
            trace[100 + i] = 3.5 * value;
        }
        let filtered = filter.apply(&trace);
        assert_eq!(filtered.len(), 300);
        assert_approx_eq!(filtered[116], 3.5, 1e-9);

        let (peak, _) = filtered
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(peak, 116);
    }

    #[test]
    fn edges_where_the_template_does_not_fit_are_zero() {
        let template = pulse_template(32, 8);
        let filter = OptimumFilter::new(&template, 8, &white_psd(32, 0.01), SAMPLE_RATE).unwrap();
        let trace = (0..100).map(|i| (i as Real * 0.3).sin()).collect::<Vec<_>>();
        let filtered = filter.apply(&trace);
        assert!(filtered[..8].iter().all(|&v| v == 0.0));
        // the last valid start is 100 - 32 = 68, at output index 76
        assert!(filtered[77..].iter().all(|&v| v == 0.0));
        assert!(filtered[8..=76].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn short_trace_is_all_zero() {
        let template = pulse_template(32, 8);
        let filter = OptimumFilter::new(&template, 8, &white_psd(32, 0.01), SAMPLE_RATE).unwrap();
        assert_eq!(filter.apply(&[1.0; 10]), vec![0.0; 10]);
        assert!(filter.apply(&[]).is_empty());
    }

    #[test]
    fn white_noise_resolution() {
        // For white noise the resolution is sigma over the RMS deviation of the template.
        let mut template = vec![0.0; 8];
        template[2] = 1.0;
        let sigma = 0.02;
        let filter = OptimumFilter::new(&template, 2, &white_psd(8, sigma), SAMPLE_RATE).unwrap();
        assert_approx_eq!(filter.resolution(), sigma / 0.875_f64.sqrt(), 1e-12);
    }

    #[test]
    fn one_sided_psd_is_unfolded() {
        let template = pulse_template(8, 2);
        let level = 1e-10;
        let two_sided = vec![level; 8];
        let one_sided = vec![level, 2.0 * level, 2.0 * level, 2.0 * level, level];
        let a = OptimumFilter::new(&template, 2, &two_sided, SAMPLE_RATE).unwrap();
        let b = OptimumFilter::new(&template, 2, &one_sided, SAMPLE_RATE).unwrap();
        assert_approx_eq!(a.resolution(), b.resolution(), 1e-15);
        for (x, y) in a.kernel.iter().zip(&b.kernel) {
            assert_approx_eq!(x, y, 1e-9);
        }
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let template = pulse_template(8, 2);
        assert!(matches!(
            OptimumFilter::new(&[], 0, &[], SAMPLE_RATE),
            Err(FilterError::EmptyTemplate)
        ));
        assert!(matches!(
            OptimumFilter::new(&template, 8, &white_psd(8, 1.0), SAMPLE_RATE),
            Err(FilterError::Pretrigger { .. })
        ));
        assert!(matches!(
            OptimumFilter::new(&template, 2, &white_psd(6, 1.0), SAMPLE_RATE),
            Err(FilterError::PsdLength { psd: 6, .. })
        ));
        assert!(matches!(
            OptimumFilter::new(&[1.0; 8], 2, &white_psd(8, 1.0), SAMPLE_RATE),
            Err(FilterError::ZeroNormalisation)
        ));
    }
}
