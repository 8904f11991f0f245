//! Structured logger
//!
//! Wraps `tracing` to provide console output, an optional daily-rotated
//! NDJSON file, and `RUST_LOG`-based level control.

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix of the rolling log (`warden.log.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "warden.log";

/// Initialize the global structured logger.
///
/// `RUST_LOG` takes precedence over `level`. With `log_dir` set, events are
/// also written as NDJSON to a daily rolling file. `json` switches the
/// console output to JSON. Calling this twice is a no-op.
pub fn init_logger(log_dir: Option<&Path>, level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = log_dir.map(|dir| {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
        fmt::layer().json().with_writer(appender).with_ansi(false)
    });

    let console_json = json.then(|| fmt::layer().json().with_writer(std::io::stdout));
    let console_text = (!json).then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_ansi(true)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_json)
        .with(console_text)
        .with(file_layer)
        .try_init();
}
