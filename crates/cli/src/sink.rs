//! JSON-lines event log.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use hive_core::{Event, EventSink};
use parking_lot::Mutex;
use tracing::warn;

/// Appends every event as one JSON object per line.
pub struct JsonLinesSink {
    out: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Create (or truncate) the log file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("failed to create event log {}", path.display()))?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Flush buffered lines.
    pub fn flush(&self) -> Result<()> {
        self.out.lock().flush().context("failed to flush event log")
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, event: Event) {
        let mut out = self.out.lock();
        let written = serde_json::to_writer(&mut *out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(err) = written {
            warn!(error = %err, "failed to write event");
        }
    }
}
