//! Event logger - persists the event stream to a JSONL file
//!
//! Subscribes to the bus and appends one timestamped JSON line per
//! event, for reporters that post-process a run instead of watching it.
//! The logger holds only a receiver, so it stops when the bus drops.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::{EventLogEntry, RunEvent};

/// Writes events to a JSONL file
pub struct EventLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLogger {
    /// Open (or create) the log file in append mode
    pub fn new(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::new");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Append one event as a JSON line
    pub fn write_entry(&mut self, entry: &EventLogEntry) -> eyre::Result<()> {
        let json = serde_json::to_string(entry)?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Consume events until the bus closes. Meant to be spawned.
    pub async fn run(mut self, mut rx: broadcast::Receiver<RunEvent>) {
        debug!(path = ?self.path, "EventLogger::run: starting");
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.write_entry(&EventLogEntry::new(event)) {
                        warn!(error = %e, "EventLogger: failed to write event");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "EventLogger: lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("EventLogger::run: bus closed, stopping");
    }
}

/// Subscribe a logger to the bus on a background task. The task ends
/// when the bus is dropped.
pub fn spawn_event_logger(bus: &EventBus, path: impl AsRef<Path>) -> eyre::Result<tokio::task::JoinHandle<()>> {
    let logger = EventLogger::new(path)?;
    let rx = bus.subscribe();
    Ok(tokio::spawn(logger.run(rx)))
}

/// Read a JSONL event log back
pub fn read_event_log(path: impl AsRef<Path>) -> eyre::Result<Vec<EventLogEntry>> {
    let text = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        entries.push(serde_json::from_str(line)?);
    }
    Ok(entries)
}
