use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

pub struct TracerOptions {
    /// Level used when `RUST_LOG` is not set.
    pub default_level: LevelFilter,
    /// Emit ANSI colour codes on the stdout layer.
    pub ansi: bool,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            default_level: LevelFilter::INFO,
            ansi: true,
        }
    }
}

/// This object initialises the stdout tracer, given a TracerOptions struct.
/// The filter is read from `RUST_LOG`, falling back to the configured default level.
pub struct TracerEngine;

impl TracerEngine {
    /// Initialises the stdout tracer for the binary.
    /// # Parameters
    /// - options: The caller-specified instance of TracerOptions.
    /// # Error Modes
    /// - Emits `Err` if a global subscriber has already been installed.
    pub fn new(options: TracerOptions) -> Result<Self, tracing::subscriber::SetGlobalDefaultError> {
        let stdout_tracer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(options.ansi);

        let log_filter = EnvFilter::builder()
            .with_default_directive(options.default_level.into())
            .from_env_lossy();

        let subscriber =
            tracing_subscriber::Registry::default().with(stdout_tracer.with_filter(log_filter));

        tracing::subscriber::set_global_default(subscriber)?;
        Ok(Self)
    }
}
