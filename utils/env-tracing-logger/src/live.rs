//! Forward log events to a live viewer over a bounded channel.
//!
//! The viewer receives one [LogRecord] per event. When the viewer falls
//! behind and the channel is full, records are dropped rather than blocking
//! the thread which emitted the event.

use std::fmt;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::field::{Field, Visit};

/// Severity as shown to a log viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Map a tracing level. Events at `ERROR` carrying the field
    /// `critical = true` are promoted to [LogLevel::Critical].
    fn from_tracing(level: &tracing::Level, critical: bool) -> Self {
        if *level == tracing::Level::ERROR {
            if critical {
                LogLevel::Critical
            } else {
                LogLevel::Error
            }
        } else if *level == tracing::Level::WARN {
            LogLevel::Warning
        } else if *level == tracing::Level::INFO {
            LogLevel::Info
        } else {
            LogLevel::Debug
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log event as delivered to the live viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// The event target, typically the module path of the emitting code.
    pub source: String,
    pub level: LogLevel,
    /// The formatted message followed by any other fields as `name=value`.
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] {}", self.source, self.level, self.message)
    }
}

/// A [tracing_subscriber::Layer] sending [LogRecord]s to a channel.
pub struct LiveLogLayer {
    tx: Sender<LogRecord>,
}

/// Create a layer and the receiving end of its channel.
///
/// `capacity` is the number of records buffered before new records are
/// dropped.
pub fn live_channel(capacity: usize) -> (LiveLogLayer, Receiver<LogRecord>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (LiveLogLayer { tx }, rx)
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Vec<String>,
    critical: bool,
}

impl Visit for RecordVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "critical" {
            self.critical = value;
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for LiveLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let mut message = visitor.message;
        for field in visitor.fields {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&field);
        }
        let record = LogRecord {
            source: metadata.target().to_string(),
            level: LogLevel::from_tracing(metadata.level(), visitor.critical),
            message,
        };

        match self.tx.try_send(record) {
            Ok(()) => {}
            // The viewer lags or is gone. Never block the logging thread.
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
