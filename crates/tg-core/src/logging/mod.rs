//! Structured logging for the engine and the `tgd` binary.
//!
//! All records go to stderr (or a rotating file with `--log-file`) so that
//! stdout stays reserved for command payloads such as health JSON. The file
//! is written from a background thread; hold the [`LogGuard`] until exit.
//!
//! The filter sits behind a reload handle: when the config file's
//! `[Logging]` section changes at runtime, [`apply_file_level`] swaps the
//! level in place unless a CLI flag or environment variable pinned it.

pub mod config;
pub mod rotate;
pub mod suppress;

pub use config::{LevelSource, LogConfig, LogFormat, LogLevel};
pub use rotate::RotatingFile;
pub use suppress::ErrorLogSuppressor;

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tg_config::FileLogLevel;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();
static FILE_LEVEL_APPLIES: AtomicBool = AtomicBool::new(false);

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Flushes buffered file records when dropped. Empty for stderr logging.
#[must_use = "dropping the guard stops the log file writer"]
#[derive(Debug, Default)]
pub struct LogGuard(Option<WorkerGuard>);

/// Initialize the global subscriber.
///
/// Returns an error only when the log file cannot be opened. A second call
/// in the same process is ignored.
pub fn init_logging(config: &LogConfig) -> std::io::Result<LogGuard> {
    let (filter, handle) = reload::Layer::new(build_filter(&config.filter_directive()));

    let (writer, ansi, guard) = match &config.file {
        Some(path) => {
            let (file, guard) = rotate::non_blocking(path, config.max_file_bytes)?;
            (BoxMakeWriter::new(file), false, Some(guard))
        }
        None => (
            BoxMakeWriter::new(std::io::stderr),
            std::io::stderr().is_terminal(),
            None,
        ),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(false)
                .with_ansi(ansi);
            if config.timestamps {
                registry.with(layer).try_init()
            } else {
                registry.with(layer.without_time()).try_init()
            }
        }
        LogFormat::Jsonl => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_writer(writer),
            )
            .try_init(),
    };

    if installed.is_ok() {
        let _ = FILTER.set(handle);
        FILE_LEVEL_APPLIES.store(config.file_level_applies(), Ordering::SeqCst);
    }
    Ok(LogGuard(guard))
}

/// Re-apply the config file's level. Returns whether the filter changed.
pub fn apply_file_level(level: FileLogLevel, enabled: bool) -> bool {
    if !FILE_LEVEL_APPLIES.load(Ordering::SeqCst) {
        return false;
    }
    let Some(handle) = FILTER.get() else {
        return false;
    };
    let config = LogConfig::default().with_level(LogLevel::from_file(level, enabled));
    handle
        .reload(build_filter(&config.filter_directive()))
        .is_ok()
}

/// Initialize with defaults (tests and simple tools).
pub fn init_default_logging() {
    // stderr only, so the guard is empty
    let _ = init_logging(&LogConfig::from_env(None, None));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_falls_back_on_garbage() {
        // an unparsable directive must not panic
        let _ = build_filter("tg_core=notalevel[");
        let _ = build_filter("tg_core=debug");
    }
}
