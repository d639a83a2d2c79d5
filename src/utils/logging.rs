//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber built from [`LoggingConfig`]: a
//! level filter plus one fmt layer, compact or JSON.

use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Installs the global subscriber.
///
/// Returns `false` if another subscriber was already installed, which makes
/// repeated calls from tests harmless.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = LevelFilter::from_level(config.log_level);

    let (compact, json) = match (config.log_to_console, config.json_format) {
        (false, _) => (None, None),
        (true, false) => (Some(fmt::layer().compact().with_target(true)), None),
        (true, true) => (None, Some(fmt::layer().json().with_current_span(true))),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(compact)
        .with(json)
        .try_init()
        .is_ok();

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    installed
}
