pub mod metrics;
pub mod tracer;

pub use tracer::{TracerEngine, TracerOptions};

/// Identifier of one continuous acquisition run, e.g. `I2_D20230512_T093012`.
pub type SeriesId = String;
pub type EventNumber = u64;
pub type BlockIndex = u64;
pub type FacilityId = u32;

/// Index of a sample within one waveform block.
pub type SampleIndex = usize;
/// Position of a sample counted from the epoch of the series clock.
pub type AbsoluteSample = i64;

pub type SampleRate = f64;
pub type Real = f64;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_T%H%M%S";

/// Converts a time in seconds to the nearest absolute sample.
/// Halves round away from zero.
pub fn time_to_sample(time: Real, sample_rate: SampleRate) -> AbsoluteSample {
    (time * sample_rate).round() as AbsoluteSample
}

/// Converts a length in milliseconds to the nearest whole number of samples.
/// Halves round away from zero.
pub fn msec_to_samples(length_msec: Real, sample_rate: SampleRate) -> usize {
    (length_msec * 1e-3 * sample_rate).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msec_conversion_rounds_to_nearest() {
        assert_eq!(msec_to_samples(1.0, 1.25e6), 1250);
        // 0.0012 ms at 1.25 MHz is 1.5 samples, rounded away from zero
        assert_eq!(msec_to_samples(0.0012, 1.25e6), 2);
        // 0.0011 ms at 1.25 MHz is 1.375 samples
        assert_eq!(msec_to_samples(0.0011, 1.25e6), 1);
        assert_eq!(msec_to_samples(0.0, 1.25e6), 0);
    }

    #[test]
    fn negative_lengths_clamp_to_zero() {
        assert_eq!(msec_to_samples(-2.0, 1e6), 0);
    }

    #[test]
    fn time_conversion_rounds_to_nearest() {
        assert_eq!(time_to_sample(2.0, 1e3), 2000);
        assert_eq!(time_to_sample(0.0025, 1e3), 3);
        assert_eq!(time_to_sample(0.0024, 1e3), 2);
    }
}
