//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// `RUST_LOG` still wins over the default level; `debug` only lowers the
/// default directive from `INFO` to `DEBUG`.
pub fn init(debug: bool) {
    let default_level = if debug {
        filter::LevelFilter::DEBUG
    } else {
        filter::LevelFilter::INFO
    };
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .with_filter(env_filter);

    if registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}
