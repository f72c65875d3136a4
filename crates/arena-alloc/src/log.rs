//! Optional diagnostic logging.
//!
//! Allocators accept an optional [`Logger`]. Messages are purely diagnostic:
//! whether a logger is attached never changes what an allocator returns.
//! Loggers are called while the allocator lock is held, so a logger must not
//! allocate from the allocator that is logging to it.

use alloc::sync::Arc;
use core::fmt;

macro_rules! log {
    ($logger:expr, $severity:expr, $($arg:tt)*) => {
        if let Some(logger) = ($logger).as_deref() {
            $crate::log::Logger::log(logger, $severity, format_args!($($arg)*));
        }
    };
}

macro_rules! trace {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::Severity::Trace, $($arg)*);
    };
}

macro_rules! debug {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::Severity::Debug, $($arg)*);
    };
}

macro_rules! info {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::Severity::Information, $($arg)*);
    };
}

macro_rules! warn {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::Severity::Warning, $($arg)*);
    };
}

macro_rules! error {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::Severity::Error, $($arg)*);
    };
}

macro_rules! critical {
    ($logger:expr, $($arg:tt)*) => {
        log!($logger, $crate::log::Severity::Critical, $($arg)*);
    };
}

/// Severity of a log message, from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum Severity {
    #[display("TRACE")]
    Trace,
    #[display("DEBUG")]
    Debug,
    #[display("INFO")]
    Information,
    #[display("WARN")]
    Warning,
    #[display("ERROR")]
    Error,
    #[display("CRITICAL")]
    Critical,
}

/// Sink for allocator diagnostics.
pub trait Logger: Send + Sync {
    fn log(&self, severity: Severity, message: fmt::Arguments<'_>);
}

impl<F> Logger for F
where
    F: Fn(Severity, fmt::Arguments<'_>) + Send + Sync,
{
    fn log(&self, severity: Severity, message: fmt::Arguments<'_>) {
        self(severity, message);
    }
}

/// Shared handle to a logger, as stored by allocators.
pub type SharedLogger = Arc<dyn Logger>;

/// Forwards only messages at or above a minimum severity.
#[derive(Debug, Clone)]
pub struct MinSeverity<L> {
    min: Severity,
    inner: L,
}

impl<L> MinSeverity<L> {
    pub fn new(min: Severity, inner: L) -> Self {
        Self { min, inner }
    }
}

impl<L> Logger for MinSeverity<L>
where
    L: Logger,
{
    fn log(&self, severity: Severity, message: fmt::Arguments<'_>) {
        if severity >= self.min {
            self.inner.log(severity, message);
        }
    }
}
