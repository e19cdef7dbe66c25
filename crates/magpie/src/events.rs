//! Append-only JSONL event log for collection runs.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use magpie_types::{CommandState, UploadJobState};

/// Default events file name inside the run's state directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// The events file path for a state directory.
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// One recorded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    /// Archive keyword the event belongs to; empty for run-level events.
    #[serde(default)]
    pub archive: String,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted { run_id: String },
    ArchiveStarted { path: String },
    ArchiveSkipped { reason: String },
    CommandStarted { keyword: String, pid: u32 },
    CommandFinished {
        keyword: String,
        state: CommandState,
        exit_code: Option<i32>,
    },
    EntryAdded { name: String, size: u64 },
    ArchiveCompleted { final_size: u64 },
    ArchiveFailed { reason: String },
    UploadFinished {
        remote_name: String,
        state: UploadJobState,
    },
    RunFinished { success: bool },
}

/// In-memory event collection, flushed to disk as JSONL.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event stamped now.
    pub fn record(&mut self, archive: &str, kind: RunEventKind) {
        self.events.push(RunEvent {
            timestamp: Utc::now(),
            archive: archive.to_string(),
            kind,
        });
    }

    /// Append all recorded events to `path`, one JSON object per line.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    /// Read a JSONL event file back.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("failed to read event line")?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(
                serde_json::from_str(&line)
                    .with_context(|| format!("bad event line: {line}"))?,
            );
        }
        Ok(Self { events })
    }

    /// Events for one archive keyword.
    pub fn events_for_archive(&self, archive: &str) -> Vec<&RunEvent> {
        self.events.iter().filter(|e| e.archive == archive).collect()
    }

    pub fn all_events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
