use anyhow::Result;
use clap::Parser;
use detprocess_common::{
    TracerEngine, TracerOptions,
    metrics::{component_info_metric, describe_metrics},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{info, level_filters::LevelFilter, warn};
use trigger_processing::{parameters::Mode, processing, simulation};

#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Endpoint on which Prometheus metrics are served, none if omitted.
    #[clap(long, env)]
    observability_address: Option<SocketAddr>,

    /// Log level used when RUST_LOG is not set.
    #[clap(long, env, default_value = "info")]
    log_level: LevelFilter,

    /// Disable coloured log output.
    #[clap(long)]
    no_ansi: bool,

    #[command(subcommand)]
    mode: Mode,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let _tracer = TracerEngine::new(TracerOptions {
        default_level: args.log_level,
        ansi: !args.no_ansi,
    })?;

    if let Some(address) = args.observability_address {
        PrometheusBuilder::new()
            .with_http_listener(address)
            .install()?;
        info!("Serving metrics on {address}");
    }
    describe_metrics();
    component_info_metric("trigger-processing");

    match &args.mode {
        Mode::Process(params) => {
            let outcome = processing::process(params)?;
            let summary = &outcome.summary;
            info!(
                "Run {}: {} trigger(s) in {} event(s) from {} series",
                summary.status,
                summary.num_triggers,
                summary.num_events,
                summary.completed_series.len()
            );
            match &outcome.output_directory {
                Some(directory) => info!(
                    "{} file(s) written to {}",
                    summary.output.files.len(),
                    directory.display()
                ),
                None => info!("{} event(s) kept in memory", summary.output.events.len()),
            }
            if summary.status.is_stopped_by_limit() {
                warn!("Not all data was processed: {}", summary.status);
            }
        }
        Mode::Simulate(params) => {
            let output = simulation::simulate(params)?;
            info!(
                "Wrote {} raw file(s), configuration in {}",
                output.raw_files.len(),
                output.config_path.display()
            );
        }
    }
    Ok(())
}
