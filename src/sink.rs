//! # Structured log sink.
//!
//! Rather than a process-wide logger, the sink is an abstraction handed to
//! each driver at construction. The process entry point builds the concrete
//! sink from CLI flags and everything downstream only sees [`Log`], a cheap
//! clonable handle around an `Arc<dyn LogSink>`.
//!
//! A sink must be safe for concurrent use and must not interleave two
//! messages within a single write.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;

/// Message severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Destination for formatted log messages.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn log(&self, severity: Severity, message: &str);
}

/// Shared handle to a [`LogSink`].
///
/// Drivers and the dispatcher hold one of these; the helpers format
/// nothing themselves, callers pass fully formatted messages.
#[derive(Clone)]
pub struct Log {
    sink: Arc<dyn LogSink>,
}

impl Log {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub async fn debug(&self, message: impl AsRef<str>) {
        self.sink.log(Severity::Debug, message.as_ref()).await;
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.sink.log(Severity::Info, message.as_ref()).await;
    }

    pub async fn warning(&self, message: impl AsRef<str>) {
        self.sink.log(Severity::Warning, message.as_ref()).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.sink.log(Severity::Error, message.as_ref()).await;
    }
}

/// Sink writing one line per message to standard error.
pub struct StderrSink;

#[async_trait]
impl LogSink for StderrSink {
    async fn log(&self, severity: Severity, message: &str) {
        // single write per message, the lock keeps lines whole
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{:<7} {}", severity, message);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures messages in memory for assertions.
    pub struct MemorySink {
        pub lines: Mutex<Vec<(Severity, String)>>,
    }

    impl MemorySink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                lines: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LogSink for MemorySink {
        async fn log(&self, severity: Severity, message: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((severity, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_labels_are_stable() {
        assert_eq!(Severity::Debug.as_label(), "debug");
        assert_eq!(Severity::Info.as_label(), "info");
        assert_eq!(Severity::Warning.as_label(), "warning");
        assert_eq!(Severity::Error.as_label(), "error");
    }

    #[test]
    fn severity_orders_by_importance() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }

    #[tokio::test]
    async fn memory_sink_captures_messages() {
        let sink = testing::MemorySink::new();
        let log = Log::new(sink.clone());

        log.info("hello").await;
        log.error("boom").await;

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (Severity::Info, "hello".to_string()));
        assert_eq!(lines[1], (Severity::Error, "boom".to_string()));
    }
}
