//! Log record fan-out
//!
//! Every record is written through `tracing` and also forwarded to any
//! subscribers that asked for a copy.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::Level;

/// A single log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity
    pub level: Level,
    /// Rendered message
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Clonable log sink shared between a driver and its tasks
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<LogRecord>>>>,
}

impl EventSink {
    /// Create a sink with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Emit a record at `level`
    pub fn emit(&self, level: Level, message: impl Into<String>) {
        let message = message.into();

        if level == Level::ERROR {
            tracing::error!("{message}");
        } else if level == Level::WARN {
            tracing::warn!("{message}");
        } else if level == Level::INFO {
            tracing::info!("{message}");
        } else if level == Level::DEBUG {
            tracing::debug!("{message}");
        } else {
            tracing::trace!("{message}");
        }

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.is_empty() {
            return;
        }

        let record = LogRecord { level, message };
        // Dropped receivers are pruned on the next emit
        subscribers.retain(|tx| tx.send(record.clone()).is_ok());
    }

    /// Emit at debug level
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(Level::DEBUG, message);
    }

    /// Emit at info level
    pub fn info(&self, message: impl Into<String>) {
        self.emit(Level::INFO, message);
    }

    /// Emit at warn level
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(Level::WARN, message);
    }

    /// Emit at error level
    pub fn error(&self, message: impl Into<String>) {
        self.emit(Level::ERROR, message);
    }
}
