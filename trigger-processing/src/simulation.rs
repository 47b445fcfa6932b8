//! Generation of raw data files with known pulses.
//!
//! Pulses arrive as a Poisson process and appear on every channel at the same
//! sample, with a per channel amplitude spread. The pulse shape is a
//! bi-exponential normalised to a unit peak, and white Gaussian noise is added
//! to every sample. Alongside the raw files, a filter file with the matching
//! template and white PSD and a configuration triggering on every channel are
//! written, so the output can be processed directly.
use crate::{
    config::{
        ChannelFilterData, DEFAULT_TAG, FilterFile, ProcessingConfig, Psd, Template,
        TriggerChannelConfig, TriggerSection,
    },
    channels::TRIGGER_LIST_SEPARATOR,
    parameters::SimulateParameters,
    source::{RawFileHeader, RawFileWriter, raw_file::{RAW_FILE_EXTENSION, RAW_FILE_VERSION}},
};
use chrono::{Local, Utc};
use detprocess_common::{AbsoluteSample, FacilityId, Real, SeriesId, TIMESTAMP_FORMAT};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Exp, Normal};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::info;

pub const FILTER_FILE_NAME: &str = "filter.json";
pub const CONFIG_FILE_NAME: &str = "config.json";
const FACILITY: FacilityId = 1;
const BLOCKS_PER_FILE: usize = 100;
const COINCIDENCE_WINDOW_SAMPLES: usize = 4;
const AMPLITUDE_SPREAD: Real = 0.2;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("IO Error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid Normal Distribution: {0}")]
    NormalDistribution(#[from] rand_distr::NormalError),
    #[error("Invalid Exponential Distribution: {0}")]
    ExpDistribution(#[from] rand_distr::ExpError),
    #[error("Invalid Parameters: {0}")]
    InvalidParameters(String),
}

/// A pulse as written to the files.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPulse {
    /// Sample of the pulse onset, counted from the start of the series.
    pub onset: AbsoluteSample,
    /// Peak amplitude on each channel, in channel order.
    pub amplitudes: Vec<Real>,
}

#[derive(Debug)]
pub struct SimulationOutput {
    pub config_path: PathBuf,
    pub filter_path: PathBuf,
    pub raw_files: Vec<PathBuf>,
    pub pulses: BTreeMap<SeriesId, Vec<SimulatedPulse>>,
}

/// A bi-exponential pulse with a unit peak, times in samples.
#[derive(Debug, Clone, Copy)]
struct BiexpPulse {
    rise: Real,
    fall: Real,
    coef: Real,
}

impl BiexpPulse {
    fn new(rise: Real, fall: Real) -> Result<Self, SimulationError> {
        if !(rise > 0.0 && fall > rise) {
            return Err(SimulationError::InvalidParameters(format!(
                "rise time ({rise} samples) must be positive and shorter than the fall time ({fall} samples)"
            )));
        }
        let peak_time = (fall / rise).ln() * rise * fall / (fall - rise);
        let peak = (-peak_time / fall).exp() - (-peak_time / rise).exp();
        Ok(Self {
            rise,
            fall,
            coef: 1.0 / peak,
        })
    }

    fn value_at(&self, time: Real) -> Real {
        if time < 0.0 {
            Real::default()
        } else {
            self.coef * ((-time / self.fall).exp() - (-time / self.rise).exp())
        }
    }
}

/// Writes the simulated data set to `params.output_path`.
#[tracing::instrument(skip_all, fields(num_series = params.num_series, seed))]
pub fn simulate(params: &SimulateParameters) -> Result<SimulationOutput, SimulationError> {
    validate(params)?;
    let seed = params
        .seed
        .unwrap_or_else(|| Utc::now().timestamp_subsec_nanos() as u64);
    tracing::Span::current().record("seed", seed);
    let mut rng = StdRng::seed_from_u64(seed);

    let samples_per_usec = params.sample_rate * 1e-6;
    let shape = BiexpPulse::new(
        params.rise_time_usec * samples_per_usec,
        params.fall_time_usec * samples_per_usec,
    )?;
    let pretrigger = params.template_length / 4;
    let template = (0..params.template_length)
        .map(|i| shape.value_at(i as Real - pretrigger as Real))
        .collect::<Vec<_>>();

    fs::create_dir_all(&params.output_path)?;
    let filter_path = params.output_path.join(FILTER_FILE_NAME);
    write_json(&filter_path, &filter_file(params, &template, pretrigger))?;
    let config_path = params.output_path.join(CONFIG_FILE_NAME);
    write_json(&config_path, &processing_config(params))?;

    let noise = Normal::new(0.0, params.noise_sigma)?;
    let arrivals = Exp::new(params.pulse_rate / params.sample_rate)?;
    let full_scale = params.amplitude * (1.0 + AMPLITUDE_SPREAD) * 1.5 + 8.0 * params.noise_sigma;
    let now = Local::now();

    let mut raw_files = Vec::new();
    let mut pulses = BTreeMap::new();
    for index in 0..params.num_series {
        let series_id = format!(
            "I{FACILITY}_D{}_{:03}",
            now.format(TIMESTAMP_FORMAT),
            index + 1
        );
        let length = params.blocks_per_series * params.block_length;
        let series_pulses = pulse_train(params, &arrivals, length, &mut rng);
        let traces = (0..params.channels.len())
            .map(|channel| {
                let mut trace = (0..length)
                    .map(|_| noise.sample(&mut rng))
                    .collect::<Vec<_>>();
                for pulse in &series_pulses {
                    add_pulse(&mut trace, pulse, channel, &template[pretrigger..]);
                }
                trace
            })
            .collect::<Vec<_>>();

        let header = RawFileHeader {
            format_version: RAW_FILE_VERSION.to_owned(),
            series_id: series_id.clone(),
            facility: FACILITY,
            channel_names: params.channels.clone(),
            volts_scale_factor: vec![full_scale / i16::MAX as Real; params.channels.len()],
            channel_offset_volts: vec![0.0; params.channels.len()],
            sample_rate: params.sample_rate,
            block_length: params.block_length,
            pretrigger_length: pretrigger,
            series_start_time: 0.0,
        };
        raw_files.extend(write_series(&params.output_path, &header, &traces)?);
        info!(
            "Series {series_id}: {} pulse(s) in {} block(s)",
            series_pulses.len(),
            params.blocks_per_series
        );
        pulses.insert(series_id, series_pulses);
    }

    Ok(SimulationOutput {
        config_path,
        filter_path,
        raw_files,
        pulses,
    })
}

fn validate(params: &SimulateParameters) -> Result<(), SimulationError> {
    let invalid = |message: &str| Err(SimulationError::InvalidParameters(message.to_owned()));
    if params.channels.is_empty() {
        return invalid("at least one channel is required");
    }
    if params.block_length == 0 || params.blocks_per_series == 0 {
        return invalid("blocks must hold at least one sample");
    }
    if params.template_length < 4 || params.template_length > params.block_length {
        return invalid("the template must hold at least 4 samples and fit inside a block");
    }
    if !(params.sample_rate > 0.0) {
        return invalid("the sample rate must be positive");
    }
    if !(params.noise_sigma > 0.0) {
        return invalid("the noise must be positive");
    }
    Ok(())
}

fn pulse_train<R: Rng>(
    params: &SimulateParameters,
    arrivals: &Exp<Real>,
    length: usize,
    rng: &mut R,
) -> Vec<SimulatedPulse> {
    let mut pulses = Vec::new();
    let mut time = arrivals.sample(rng);
    while time < length as Real {
        pulses.push(SimulatedPulse {
            onset: time.round() as AbsoluteSample,
            amplitudes: params
                .channels
                .iter()
                .map(|_| {
                    params.amplitude
                        * rng.random_range((1.0 - AMPLITUDE_SPREAD)..(1.0 + AMPLITUDE_SPREAD))
                })
                .collect(),
        });
        time += arrivals.sample(rng);
    }
    pulses
}

/// Adds `shape`, starting at its onset, scaled to the pulse amplitude on `channel`.
fn add_pulse(trace: &mut [Real], pulse: &SimulatedPulse, channel: usize, shape: &[Real]) {
    let (Ok(onset), Some(&amplitude)) = (usize::try_from(pulse.onset), pulse.amplitudes.get(channel))
    else {
        return;
    };
    for (value, &sample) in trace.iter_mut().skip(onset).zip(shape) {
        *value += amplitude * sample;
    }
}

fn write_series(
    directory: &Path,
    header: &RawFileHeader,
    traces: &[Vec<Real>],
) -> Result<Vec<PathBuf>, SimulationError> {
    let num_blocks = traces.first().map(Vec::len).unwrap_or_default() / header.block_length;
    let mut files = Vec::new();
    for (file_number, first_block) in (0..num_blocks).step_by(BLOCKS_PER_FILE).enumerate() {
        let path = directory.join(format!(
            "{}_F{:04}.{RAW_FILE_EXTENSION}",
            header.series_id,
            file_number + 1
        ));
        let mut writer = RawFileWriter::create(&path, header.clone())?;
        for block_index in first_block..num_blocks.min(first_block + BLOCKS_PER_FILE) {
            let start = block_index * header.block_length;
            let block = traces
                .iter()
                .map(|trace| trace.iter().skip(start).take(header.block_length).copied().collect())
                .collect::<Vec<Vec<Real>>>();
            let start_time = header.series_start_time + start as Real / header.sample_rate;
            writer.write_block(block_index as u64, start_time, &block)?;
        }
        writer.finish()?;
        files.push(path);
    }
    Ok(files)
}

fn filter_file(params: &SimulateParameters, template: &[Real], pretrigger: usize) -> FilterFile {
    let data = ChannelFilterData {
        templates: BTreeMap::from([(
            DEFAULT_TAG.to_owned(),
            Template {
                values: template.to_vec(),
                pretrigger_samples: pretrigger,
            },
        )]),
        psds: BTreeMap::from([(
            DEFAULT_TAG.to_owned(),
            Psd {
                values: vec![
                    params.noise_sigma * params.noise_sigma / params.sample_rate;
                    template.len()
                ],
            },
        )]),
    };
    FilterFile(
        params
            .channels
            .iter()
            .map(|channel| (channel.clone(), data.clone()))
            .collect(),
    )
}

fn processing_config(params: &SimulateParameters) -> ProcessingConfig {
    let key = params
        .channels
        .join(&TRIGGER_LIST_SEPARATOR.to_string());
    ProcessingConfig {
        filter_file: PathBuf::from(FILTER_FILE_NAME),
        trigger: TriggerSection {
            coincident_window_msec: None,
            coincident_window_samples: Some(COINCIDENCE_WINDOW_SAMPLES),
            channels: BTreeMap::from([(
                key,
                TriggerChannelConfig {
                    threshold_sigma: Some(params.threshold_sigma),
                    pileup_window_samples: Some(params.template_length / 2),
                    ..Default::default()
                },
            )]),
        },
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), SimulationError> {
    serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), value)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        dispatch::{RunParameters, dispatch},
        event::Event,
        setup::build_event_builder,
        sink::MemorySink,
        source::{RawFileSource, SeriesSelection, WaveformSource},
    };
    use assert_approx_eq::assert_approx_eq;

    pub(crate) fn parameters(output_path: &Path) -> SimulateParameters {
        SimulateParameters {
            output_path: output_path.to_owned(),
            channels: vec!["chA".to_owned(), "chB".to_owned()],
            num_series: 2,
            blocks_per_series: 4,
            block_length: 2000,
            sample_rate: 1e6,
            pulse_rate: 1000.0,
            amplitude: 1.0,
            noise_sigma: 0.01,
            rise_time_usec: 2.0,
            fall_time_usec: 20.0,
            template_length: 128,
            threshold_sigma: 5.0,
            seed: Some(7),
        }
    }

    #[test]
    fn pulse_shape_has_unit_peak() {
        let shape = BiexpPulse::new(2.0, 20.0).unwrap();
        let peak = (0..200)
            .map(|i| shape.value_at(i as Real * 0.05))
            .fold(Real::MIN, Real::max);
        assert_approx_eq!(peak, 1.0, 1e-4);
        assert_eq!(shape.value_at(-1.0), 0.0);
        assert!(BiexpPulse::new(20.0, 2.0).is_err());
    }

    #[test]
    fn same_seed_gives_same_pulses() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = simulate(&parameters(a.path())).unwrap();
        let second = simulate(&parameters(b.path())).unwrap();
        assert_eq!(
            first.pulses.values().collect::<Vec<_>>(),
            second.pulses.values().collect::<Vec<_>>()
        );
        assert_eq!(first.raw_files.len(), 2);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = parameters(dir.path());
        params.template_length = 4000;
        assert!(matches!(
            simulate(&params),
            Err(SimulationError::InvalidParameters(_))
        ));
    }

    /// Every isolated pulse that fits inside one block is found on both channels.
    #[test]
    fn simulated_pulses_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let params = parameters(dir.path());
        let output = simulate(&params).unwrap();

        let (config, filters) = ProcessingConfig::load_with_filters(&output.config_path).unwrap();
        let source = RawFileSource::open(dir.path()).unwrap();
        let builder = build_event_builder(
            &config.trigger,
            &filters,
            &source.available_channels().unwrap(),
            source.sample_rate().unwrap(),
        )
        .unwrap();
        let series = source.list_series(&SeriesSelection::All).unwrap();
        assert_eq!(series, output.pulses.keys().cloned().collect::<Vec<_>>());

        let run = RunParameters {
            ntriggers: None,
            ncores: 2,
            memory_limit: 1 << 30,
            processing_id: Some("sim".to_owned()),
        };
        let summary = dispatch(&source, &builder, &series, &run, |_, limit| {
            MemorySink::new(limit)
        })
        .unwrap();

        let pretrigger = params.template_length / 4;
        let block_length = params.block_length as AbsoluteSample;
        let mut checked = 0;
        for (series_id, pulses) in &output.pulses {
            let events = summary
                .output
                .events
                .iter()
                .filter(|e| &e.series_id == series_id)
                .collect::<Vec<&Event>>();
            for (index, pulse) in pulses.iter().enumerate() {
                let isolated = pulses.iter().enumerate().all(|(other, p)| {
                    other == index
                        || (p.onset - pulse.onset).abs() > 2 * params.template_length as AbsoluteSample
                });
                let local = pulse.onset % block_length;
                let fits = local >= pretrigger as AbsoluteSample
                    && local + (params.template_length - pretrigger) as AbsoluteSample <= block_length;
                if !(isolated && fits) {
                    continue;
                }
                let event = events
                    .iter()
                    .find(|e| (e.reference().unwrap().absolute_sample - pulse.onset).abs() <= 2)
                    .unwrap_or_else(|| panic!("pulse at {} of {series_id} not found", pulse.onset));
                assert_eq!(event.num_rows(), 2);
                for (channel, amplitude) in params.channels.iter().zip(&pulse.amplitudes) {
                    let trigger = event.triggers.iter().find(|t| &t.channel == channel).unwrap();
                    assert_approx_eq!(trigger.amplitude, *amplitude, 0.1);
                }
                checked += 1;
            }
        }
        assert!(checked > 0);
        assert!(summary.output.events.iter().all(|e| e.processing_id.as_deref() == Some("sim")));
    }
}
