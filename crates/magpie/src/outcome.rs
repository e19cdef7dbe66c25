//! Outcome persistence and summary rendering.

use std::path::Path;

use anyhow::{Context, Result};

use magpie_types::{ArchiveState, CommandState, RunOutcome};

/// Write the structured outcome file (`--outcome`).
pub fn write_outcome(outcome: &RunOutcome, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(outcome).context("failed to serialize outcome")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write outcome {}", path.display()))?;
    Ok(())
}

/// Read an outcome file back (used by tooling and tests).
pub fn read_outcome(path: &Path) -> Result<RunOutcome> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read outcome {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("bad outcome file {}", path.display()))
}

/// Render the per-archive, per-command textual summary.
pub fn render_summary(outcome: &RunOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "run {} on {} ({})\n",
        outcome.run_id, outcome.host.computer_name, outcome.host.system_type
    ));

    for archive in &outcome.archives {
        let state = match archive.state {
            ArchiveState::Completed => "completed",
            ArchiveState::Failed => "failed",
            ArchiveState::Skipped => "skipped",
            ArchiveState::Cancelled => "cancelled",
        };
        out.push_str(&format!("\narchive {}: {state}", archive.keyword));
        if let Some(path) = &archive.path {
            out.push_str(&format!(" ({path}"));
            if let Some(size) = archive.size {
                out.push_str(&format!(", {size} bytes"));
            }
            out.push(')');
        }
        if let Some(error) = &archive.error {
            out.push_str(&format!(" - {error}"));
        }
        out.push('\n');

        for command in &archive.commands {
            let state = match command.state {
                CommandState::Pending => "pending",
                CommandState::Running => "running",
                CommandState::Completed => "completed",
                CommandState::Failed => "failed",
                CommandState::Skipped => "skipped",
                CommandState::TimedOut => "timed out",
                CommandState::Cancelled => "cancelled",
            };
            out.push_str(&format!("  {}: {state}", command.keyword));
            if let Some(code) = command.exit_code {
                out.push_str(&format!(" (exit {code})"));
            }
            if let Some(kind) = command.error_kind {
                out.push_str(&format!(" [{kind}]"));
            }
            if let Some(note) = &command.note {
                out.push_str(&format!(" - {note}"));
            }
            out.push('\n');
            for output in &command.outputs {
                out.push_str(&format!("    {} ({} bytes", output.name, output.size));
                if let Some(sha256) = &output.digests.sha256 {
                    out.push_str(&format!(", sha256 {sha256}"));
                }
                out.push_str(")\n");
            }
        }
    }
    out
}
