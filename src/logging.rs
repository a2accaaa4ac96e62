//! Log initialization
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Install the global subscriber. Level selection via the `MIMOSA_LOG`
/// environment variable (e.g. `MIMOSA_LOG=debug`).
pub fn init() {
    if tracing_log::LogTracer::init().is_err() {
        debug!("log tracer already installed");
    }

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .compact();

    let filter =
        EnvFilter::try_from_env("MIMOSA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(filter).with(format);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        debug!("logger already initialized");
    }
}
