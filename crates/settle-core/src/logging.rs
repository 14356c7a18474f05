//! Tracing setup for the settle binary.
//!
//! Diagnostics go to stderr; stdout belongs to the transcript renderer.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::paths;

/// Log level override used when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "SETTLE_LOG";
/// Set to `1` to also write daily log files under `$SETTLE_HOME/logs`.
pub const LOG_FILE_ENV: &str = "SETTLE_LOG_FILE";

/// Builds the filter: `RUST_LOG`, then `SETTLE_LOG`, then `warn`.
pub fn log_filter() -> EnvFilter {
    let level = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_ENV))
        .ok();
    filter_for(level.as_deref())
}

fn filter_for(level: Option<&str>) -> EnvFilter {
    let level = match level.map(str::trim) {
        Some("silent") => "off",
        Some(level) if !level.is_empty() => level,
        _ => "warn",
    };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Installs the global subscriber.
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed. Does nothing if a subscriber is already set.
pub fn init() -> Option<WorkerGuard> {
    let (file_layer, guard) = if std::env::var(LOG_FILE_ENV).is_ok_and(|v| v == "1") {
        let appender = tracing_appender::rolling::daily(paths::logs_dir(), "settle.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let installed = tracing_subscriber::registry()
        .with(log_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .try_init();

    if installed.is_err() {
        return None;
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults_to_warn() {
        assert_eq!(filter_for(None).to_string(), "warn");
        assert_eq!(filter_for(Some("  ")).to_string(), "warn");
    }

    #[test]
    fn test_filter_accepts_directives() {
        assert_eq!(filter_for(Some("debug")).to_string(), "debug");
        assert_eq!(filter_for(Some("settle_core=trace")).to_string(), "settle_core=trace");
        assert_eq!(filter_for(Some("silent")).to_string(), "off");
    }
}
