//! Bridge from the `log` facade to a host-provided logger.
//!
//! Hosts that already run a `log` or `tracing` subscriber need nothing from
//! this module. Embedders without one implement [`Logger`] and call
//! [`set_logger`] once at startup; `error!` records are the operator channel
//! for persistence failures.

use std::sync::{Arc, OnceLock};

/// Receives age gate log records.
///
/// # Examples
///
/// ```rust
/// use agegate_core::logger::{LogLevel, Logger};
///
/// struct StderrLogger;
///
/// impl Logger for StderrLogger {
///     fn log(&self, level: LogLevel, target: &str, message: String) {
///         eprintln!("[{level:?}] {target}: {message}");
///     }
/// }
/// ```
pub trait Logger: Sync + Send {
    /// Records `message` emitted by module `target` at `level`.
    fn log(&self, level: LogLevel, target: &str, message: String);
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Cache hits and misses.
    Trace,
    /// Per-request decisions.
    Debug,
    /// Verifications recorded.
    Info,
    /// Fail-open paths and rejected input.
    Warn,
    /// Persistence failures.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug => Self::Debug,
            log::Level::Trace => Self::Trace,
        }
    }
}

struct ForwardingLogger;

/// Debug and trace records are only forwarded from our own crates.
fn should_forward(level: log::Level, module_path: Option<&str>) -> bool {
    level <= log::Level::Info || module_path.is_some_and(|path| path.starts_with("agegate"))
}

impl log::Log for ForwardingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !should_forward(record.level(), record.module_path()) {
            return;
        }
        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(
                record.level().into(),
                record.target(),
                record.args().to_string(),
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs `logger` as the destination of all `log` records.
///
/// Only the first call has an effect.
///
/// # Errors
///
/// Returns an error if a logger was already installed, by this function or
/// another `log` implementation.
pub fn set_logger(logger: Arc<dyn Logger>) -> Result<(), log::SetLoggerError> {
    if LOGGER_INSTANCE.set(logger).is_err() {
        log::warn!("age gate logger already set");
    }
    static LOGGER: ForwardingLogger = ForwardingLogger;
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}
