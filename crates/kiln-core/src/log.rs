//! Job log sink.
//!
//! Executors push interleaved output/error bytes of the running job, plus their
//! own progress messages, into a [`LogSink`]. The receiving side is owned by
//! whoever formats and uploads the build log.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Messages emitted by the executor itself.
    System,
}

/// A chunk of log output. Chunks are raw bytes, not lines.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub data: Bytes,
}

impl LogChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Sending half of a job log. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogChunk>,
}

impl LogSink {
    /// Create a sink together with the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose output goes nowhere.
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    /// Write raw bytes. A closed receiver is not an error for the job.
    pub fn write(&self, stream: LogStream, data: impl Into<Bytes>) {
        let _ = self.tx.send(LogChunk {
            timestamp: Utc::now(),
            stream,
            data: data.into(),
        });
    }

    pub fn stdout(&self, data: impl Into<Bytes>) {
        self.write(LogStream::Stdout, data);
    }

    pub fn stderr(&self, data: impl Into<Bytes>) {
        self.write(LogStream::Stderr, data);
    }

    /// Write an executor message as its own line.
    pub fn system(&self, message: impl AsRef<str>) {
        self.write(LogStream::System, format!("{}\n", message.as_ref()));
    }
}
