//! Logging setup for tandem nodes.
//!
//! Console output with uptime timestamps and targets, plus a JSON log file in
//! debug builds. The filter comes from `RUST_LOG`, then the config's
//! `debug.log_level`, then [`DEFAULT_FILTER`].

use std::fs::File;
use std::path::Path;

use tandem_config::Config;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info,tokio=warn,mio=warn";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE_NAME: &str = "tandem.log";

/// Install the global tracing subscriber.
///
/// `log_dir` is only used when `debug_build` is set; a directory that cannot
/// be created falls back to console-only logging.
///
/// ```no_run
/// use tandem_config::Config;
/// use tandem_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = File::create(log_dir.join(LOG_FILE_NAME))
    {
        subscriber.with(json_file_layer(log_file)).init();
        return;
    }

    subscriber.init();
}

/// Directives from the config, or [`DEFAULT_FILTER`] when it has none.
pub fn filter_directives(config: Option<&Config>) -> &str {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => &config.debug.log_level,
        _ => DEFAULT_FILTER,
    }
}

/// An `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn json_file_layer<S>(file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json()
}
