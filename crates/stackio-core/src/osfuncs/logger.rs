//! Structured logging sink required by `OsFuncs` (`spec.md` §4.A).
//!
//! Grounded on the grounding repo's `observability::facade::Logger`
//! contract, but collapsed to the handful of fields this crate actually
//! emits (endpoint/fd identity, a severity, a message) rather than the
//! grounding repo's full `LogRecord`/`AttributeSet` machinery, which
//! exists to serve a much larger surface (audit, tracing, metrics) this
//! crate does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured log sink. Implementations must not block or re-enter the
/// endpoint that is logging through them.
pub trait Logger: Send + Sync + 'static {
    fn log(&self, level: LogLevel, target: &str, message: &str);
}

/// Default `Logger` backed by the `tracing` crate, the same ambient
/// logging crate used across this retrieval pack (`flux-network`,
/// `spark-switch`, the grounding repo's own otel tooling).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, target: &str, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "stackio", fd_or_endpoint = target, message),
            LogLevel::Debug => tracing::debug!(target: "stackio", fd_or_endpoint = target, message),
            LogLevel::Info => tracing::info!(target: "stackio", fd_or_endpoint = target, message),
            LogLevel::Warn => tracing::warn!(target: "stackio", fd_or_endpoint = target, message),
            LogLevel::Error => tracing::error!(target: "stackio", fd_or_endpoint = target, message),
        }
    }
}
