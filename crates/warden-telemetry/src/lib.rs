// SPDX-License-Identifier: MIT OR Apache-2.0
//! [`TelemetrySink`](warden_core::TelemetrySink) implementations: one that logs via
//! `tracing`, and one that spools events to disk as newline-delimited JSON when no
//! Gateway is reachable — a queue another process can drain later.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use warden_core::{AgentEvent, TelemetrySink};
use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising from spool file I/O.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The spool file or directory could not be opened, written, or read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A spooled line was not valid JSON.
    #[error("malformed spool entry: {0}")]
    Codec(#[from] serde_json::Error),
}

impl AsErrorCode for TelemetryError {
    fn code(&self) -> ErrorCode {
        match self {
            TelemetryError::Io(_) | TelemetryError::Codec(_) => ErrorCode::Fatal,
        }
    }
}

/// A [`TelemetrySink`] that logs every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: AgentEvent) {
        tracing::info!(
            event_id = %event.event_id,
            agent_id = %event.agent_id,
            kind = ?event.kind,
            occurred_at = %event.occurred_at,
            attributes = ?event.attributes,
            "agent_event"
        );
    }
}

/// A [`TelemetrySink`] that appends events to `<dir>/events.jsonl`, one JSON object per
/// line. Used when the agent can't reach the out-of-scope telemetry Gateway; a
/// separate forwarding process drains the spool when connectivity returns.
pub struct FileSpoolSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSpoolSink {
    /// Open (creating if necessary) the spool file at `<dir>/events.jsonl`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Read back every event currently in the spool, in append order.
    ///
    /// Intended for the forwarding process and for tests; not used on the hot path.
    pub fn read_events(&self) -> Result<Vec<AgentEvent>, TelemetryError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

impl TelemetrySink for FileSpoolSink {
    fn emit(&self, event: AgentEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        let _ = writeln!(file, "{line}");
        let _ = file.flush();
    }
}
