//! The processing configuration and filter files, both JSON.
use crate::error::ConfigurationError;
use detprocess_common::{Real, SampleRate, msec_to_samples};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const DEFAULT_TAG: &str = "default";

fn default_tag() -> String {
    DEFAULT_TAG.to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Relative paths are resolved against the directory of the configuration file.
    pub filter_file: PathBuf,
    pub trigger: TriggerSection,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coincident_window_msec: Option<Real>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coincident_window_samples: Option<usize>,
    /// Keyed by channel expression, e.g. `chA`, `chA,chB` or `chA+chB`.
    pub channels: BTreeMap<String, TriggerChannelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerChannelConfig {
    #[serde(default = "default_true")]
    pub run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_sigma: Option<Real>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pileup_window_msec: Option<Real>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pileup_window_samples: Option<usize>,
    #[serde(default = "default_true")]
    pub positive_pulses: bool,
    #[serde(default = "default_tag")]
    pub template_tag: String,
    #[serde(default = "default_tag")]
    pub psd_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_name: Option<String>,
}

impl Default for TriggerChannelConfig {
    fn default() -> Self {
        Self {
            run: true,
            threshold_sigma: None,
            pileup_window_msec: None,
            pileup_window_samples: None,
            positive_pulses: true,
            template_tag: default_tag(),
            psd_tag: default_tag(),
            trigger_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub values: Vec<Real>,
    pub pretrigger_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Psd {
    /// Two-sided of the template length, or one-sided of `len / 2 + 1` values.
    pub values: Vec<Real>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFilterData {
    #[serde(default)]
    pub templates: BTreeMap<String, Template>,
    #[serde(default)]
    pub psds: BTreeMap<String, Psd>,
}

/// Templates and noise PSDs, keyed by trigger channel expression and then by tag.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterFile(pub BTreeMap<String, ChannelFilterData>);

impl FilterFile {
    pub fn template(&self, channel: &str, tag: &str) -> Result<&Template, ConfigurationError> {
        self.0
            .get(channel)
            .and_then(|data| data.templates.get(tag))
            .ok_or_else(|| ConfigurationError::MissingTemplate {
                channel: channel.to_owned(),
                tag: tag.to_owned(),
            })
    }

    pub fn psd(&self, channel: &str, tag: &str) -> Result<&Psd, ConfigurationError> {
        self.0
            .get(channel)
            .and_then(|data| data.psds.get(tag))
            .ok_or_else(|| ConfigurationError::MissingPsd {
                channel: channel.to_owned(),
                tag: tag.to_owned(),
            })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        load_json(path)
    }
}

impl ProcessingConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let mut config: ProcessingConfig = load_json(path)?;
        if config.filter_file.is_relative() {
            if let Some(directory) = path.parent() {
                config.filter_file = directory.join(&config.filter_file);
            }
        }
        debug!("Filter file: {}", config.filter_file.display());
        Ok(config)
    }

    /// Loads the configuration and the filter file it names.
    pub fn load_with_filters(path: &Path) -> Result<(Self, FilterFile), ConfigurationError> {
        let config = Self::load(path)?;
        let filters = FilterFile::load(&config.filter_file)?;
        Ok((config, filters))
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigurationError> {
    let file = File::open(path).map_err(|source| ConfigurationError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigurationError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Converts a window given in msec or in samples to samples.
///
/// # Error Modes
/// - [ConfigurationError::AmbiguousWindow] if both are given.
pub fn resolve_window(
    msec: Option<Real>,
    samples: Option<usize>,
    sample_rate: SampleRate,
    names: (&'static str, &'static str),
) -> Result<Option<usize>, ConfigurationError> {
    match (msec, samples) {
        (Some(_), Some(_)) => Err(ConfigurationError::AmbiguousWindow {
            msec: names.0,
            samples: names.1,
        }),
        (Some(msec), None) => Ok(Some(msec_to_samples(msec, sample_rate))),
        (None, samples) => Ok(samples),
    }
}
