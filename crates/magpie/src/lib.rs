//! # Magpie
//!
//! A host artifact collection orchestrator. Magpie takes a declarative
//! plan of collection tools, runs them on a live host under per-archive
//! resource and time limits, captures their outputs (standard streams,
//! files, directory trees) through a streaming hash pipeline into archive
//! containers, and delivers the finished archives to a remote destination.
//!
//! ## Pipeline
//!
//! The core flow is **load → evaluate → execute → deliver**:
//!
//! 1. [`magpie_config::load_plan`] parses and validates the plan document.
//! 2. [`magpie_plan::evaluate`] resolves it against host facts and CLI
//!    filters into a pure, testable value.
//! 3. [`engine::run_plan`] schedules commands under each archive's
//!    concurrency cap, wires child output into the archive builder, and
//!    enforces deadlines and resource limits.
//! 4. The upload agent ships completed archives and optionally removes the
//!    local copies.
//!
//! ## Key types
//!
//! - `CollectionPlan` / `EvaluatedPlan` — what to run (magpie-types,
//!   magpie-plan)
//! - `RunOptions` — all runtime knobs for one run
//! - `RunOutcome` — machine-readable receipt, written by [`outcome`]
//! - `Reporter` — caller-owned progress sink
//!
//! ## Modules
//!
//! - [`engine`] — the command scheduler and per-archive execution loop
//! - [`limits`] — resource container abstraction and portable enforcement
//! - [`scratch`] — run-scoped scratch directory lifecycle
//! - [`events`] — append-only JSONL event log
//! - [`outcome`] — outcome file writing and textual summary rendering
//! - [`reporter`] — the progress reporting trait

pub mod engine;
pub mod events;
pub mod limits;
pub mod outcome;
pub mod reporter;
pub mod scratch;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use engine::{RunOptions, run_plan};
pub use reporter::Reporter;

/// Process-wide shutdown token: one writer, many observers.
///
/// The top-level driver sets it on a fatal signal or user abort; every
/// long-running loop observes it between units of work.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_token_is_shared() {
        let token = ShutdownToken::new();
        let observer = token.clone();
        assert!(!observer.is_triggered());
        token.trigger();
        assert!(observer.is_triggered());
        token.trigger();
        assert!(observer.is_triggered());
    }
}
