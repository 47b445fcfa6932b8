//! Construction of the trigger channels and the event builder from the
//! configuration, the filter file and what the source provides.
use crate::{
    channels::{ChannelExpression, TRIGGER_LIST_SEPARATOR},
    config::{FilterFile, TriggerChannelConfig, TriggerSection, resolve_window},
    error::ConfigurationError,
    event_builder::{CoincidenceWindow, EventBuilder},
    filter::{MatchedFilter, OptimumFilter},
    trigger::{ChannelTrigger, Polarity},
};
use detprocess_common::SampleRate;
use tracing::{debug, info};

/// Builds the event builder for data with `available` channels sampled at `sample_rate`.
///
/// # Error Modes
/// Any [ConfigurationError] found in the trigger section or the filter file.
#[tracing::instrument(skip_all, fields(num_entries = section.channels.len()))]
pub fn build_event_builder(
    section: &TriggerSection,
    filters: &FilterFile,
    available: &[String],
    sample_rate: SampleRate,
) -> Result<EventBuilder, ConfigurationError> {
    if !sample_rate.is_finite() || sample_rate <= 0.0 {
        return Err(ConfigurationError::InvalidSampleRate(sample_rate));
    }
    let window = resolve_window(
        section.coincident_window_msec,
        section.coincident_window_samples,
        sample_rate,
        ("coincident_window_msec", "coincident_window_samples"),
    )?
    .unwrap_or_default();

    let mut triggers = Vec::new();
    for (key, config) in &section.channels {
        if !config.run {
            debug!("Trigger channel {key} is disabled");
            continue;
        }
        for (name, expression) in expand_key(key, config, available)? {
            triggers.push(build_trigger(name, expression, config, filters, sample_rate)?);
        }
    }

    let builder = EventBuilder::new(triggers, CoincidenceWindow(window))?;
    info!(
        "{} trigger channel(s), coincidence window of {window} sample(s)",
        builder.triggers().len()
    );
    Ok(builder)
}

/// Splits a `,` list into independent triggers, naming each one.
fn expand_key(
    key: &str,
    config: &TriggerChannelConfig,
    available: &[String],
) -> Result<Vec<(String, ChannelExpression)>, ConfigurationError> {
    if !key.contains(TRIGGER_LIST_SEPARATOR) {
        let expression = ChannelExpression::parse(key, available)?;
        let name = config
            .trigger_name
            .clone()
            .unwrap_or_else(|| expression.to_string());
        return Ok(vec![(name, expression)]);
    }
    key.split(TRIGGER_LIST_SEPARATOR)
        .map(|part| {
            let expression = ChannelExpression::parse(part, available)?;
            let name = match &config.trigger_name {
                Some(name) => format!("{name}_{expression}"),
                None => expression.to_string(),
            };
            Ok((name, expression))
        })
        .collect()
}

fn build_trigger(
    name: String,
    expression: ChannelExpression,
    config: &TriggerChannelConfig,
    filters: &FilterFile,
    sample_rate: SampleRate,
) -> Result<ChannelTrigger, ConfigurationError> {
    let channel = expression.to_string();
    let threshold_sigma = config
        .threshold_sigma
        .ok_or_else(|| ConfigurationError::MissingThreshold(channel.clone()))?;
    let pileup_window_samples = resolve_window(
        config.pileup_window_msec,
        config.pileup_window_samples,
        sample_rate,
        ("pileup_window_msec", "pileup_window_samples"),
    )?
    .unwrap_or_default();

    let template = filters.template(&channel, &config.template_tag)?;
    let psd = filters.psd(&channel, &config.psd_tag)?;
    let filter = OptimumFilter::new(
        &template.values,
        template.pretrigger_samples,
        &psd.values,
        sample_rate,
    )
    .map_err(|source| ConfigurationError::InvalidFilter {
        channel: channel.clone(),
        source,
    })?;
    let threshold = threshold_sigma * filter.resolution();
    debug!(
        "Trigger {name} on {channel}: threshold {threshold:e} ({threshold_sigma} sigma), pileup window {pileup_window_samples}"
    );

    Ok(ChannelTrigger::new(
        name,
        expression,
        Box::new(filter),
        threshold,
        pileup_window_samples,
        Polarity::from_positive_pulses(config.positive_pulses),
    ))
}
