//! The command scheduler.
//!
//! One archive at a time: commands are dequeued in declaration order and
//! launched as concurrency slots free up, with `FlushQueue` commands acting
//! as barriers. Each child's standard streams are drained into spill
//! buffers by dedicated reader threads (one per captured pipe, so a full
//! kernel pipe can never wedge a child), file and directory outputs are
//! harvested after exit, and everything flows into the archive builder
//! which hashes and serialises it. Limits ride in a resource container;
//! wall-clock deadlines belong to this module.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use magpie_archive::{ArchiveAgent, ArchiveNotification, ArchiveRequest, OpenRequest};
use magpie_plan::{Disposition, EvaluatedArchive, EvaluatedCommand, EvaluatedPlan, PatternContext, expand_env};
use magpie_resolver::ResourceResolver;
use magpie_stream::Stream;
use magpie_stream::primitives::TemporaryStream;
use magpie_types::{
    ArchiveOutcome, ArchiveState, CollectErrorKind, CommandOutcome, CommandState, DigestSet,
    ExecutableRef, HashSelection, InputSource, OutputDigest, OutputKind, RepeatPolicy, RunOutcome,
    UploadConfig, UploadJobState,
};
use magpie_upload::{UploadAgent, UploadNotification, UploadRequest};

use crate::ShutdownToken;
use crate::events::{EventLog, RunEventKind, events_path};
use crate::limits::{self, ResourceContainer};
use crate::reporter::Reporter;
use crate::scratch::ScratchDir;

/// Child process priority (`--priority`). Applied best-effort via the
/// platform's renice facility; advisory where that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    Low,
    High,
}

/// All runtime knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Where finished archives land.
    pub output_dir: PathBuf,
    /// Parent of the run's scratch subtree.
    pub temp_dir: PathBuf,
    /// Where the events log and other run state land.
    pub state_dir: PathBuf,
    /// Side bundle overriding the self-embedded one.
    pub bundle: Option<PathBuf>,
    /// Digests computed per archive entry.
    pub hashes: HashSelection,
    /// Mirror captured child output to the reporter.
    pub tee_cleartext: bool,
    pub priority: Priority,
    /// Deliver finished archives when set.
    pub upload: Option<UploadConfig>,
    /// Structured outcome file (`--outcome`).
    pub outcome_path: Option<PathBuf>,
    /// Offline image path; exported to children as `OfflineLocation`.
    pub offline: Option<String>,
}

impl RunOptions {
    pub fn new(output_dir: &Path, temp_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            state_dir: output_dir.join(".magpie"),
            bundle: None,
            hashes: HashSelection::default(),
            tee_cleartext: false,
            priority: Priority::Normal,
            upload: None,
            outcome_path: None,
            offline: None,
        }
    }
}

/// Execute an evaluated plan end to end and return the run receipt.
pub fn run_plan(
    plan: &EvaluatedPlan,
    options: &RunOptions,
    shutdown: &ShutdownToken,
    reporter: &mut dyn Reporter,
) -> Result<RunOutcome> {
    let started_at = Utc::now();
    std::fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("failed to create {}", options.output_dir.display()))?;
    let scratch = ScratchDir::create(&options.temp_dir, &plan.run_id)?;
    let mut events = EventLog::new();
    events.record(
        "",
        RunEventKind::RunStarted {
            run_id: plan.run_id.clone(),
        },
    );
    for warning in &plan.warnings {
        reporter.warn(warning);
    }

    let ctx = PatternContext::new(&plan.host, &plan.run_id);
    let mut archives = Vec::with_capacity(plan.archives.len());
    for archive in &plan.archives {
        if shutdown.is_triggered() {
            reporter.warn(&format!(
                "{}: cancelled before start (shutdown requested)",
                archive.spec.keyword
            ));
            archives.push(cancelled_outcome(archive));
            continue;
        }
        let outcome = run_archive(
            archive,
            &ctx,
            options,
            &scratch,
            shutdown,
            &mut events,
            reporter,
        );
        archives.push(outcome);
    }

    if let Some(upload) = &options.upload {
        deliver_archives(upload, &mut archives, shutdown, &mut events, reporter);
    }

    let outcome = RunOutcome {
        run_id: plan.run_id.clone(),
        host: plan.host.clone(),
        started_at,
        finished_at: Utc::now(),
        archives,
    };
    events.record(
        "",
        RunEventKind::RunFinished {
            success: outcome.success(),
        },
    );
    if let Err(e) = events.write_to_file(&events_path(&options.state_dir)) {
        reporter.warn(&format!("failed to write events log: {e:#}"));
    }
    if let Some(path) = &options.outcome_path {
        crate::outcome::write_outcome(&outcome, path)?;
    }
    Ok(outcome)
}

fn cancelled_outcome(archive: &EvaluatedArchive) -> ArchiveOutcome {
    ArchiveOutcome {
        keyword: archive.spec.keyword.clone(),
        state: ArchiveState::Cancelled,
        optional: archive.spec.optional,
        path: None,
        size: None,
        error: Some("run was cancelled".to_string()),
        commands: Vec::new(),
    }
}

/// Apply the repeat policy to the archive's output path.
fn resolve_output_path(dir: &Path, name: &str, repeat: RepeatPolicy) -> Result<Option<PathBuf>> {
    let path = dir.join(name);
    match repeat {
        RepeatPolicy::Overwrite => Ok(Some(path)),
        RepeatPolicy::Once => {
            if path.exists() {
                Ok(None)
            } else {
                Ok(Some(path))
            }
        }
        RepeatPolicy::CreateNew => {
            if !path.exists() {
                return Ok(Some(path));
            }
            let stem = Path::new(name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string());
            let ext = Path::new(name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            for n in 1..10_000u32 {
                let candidate = dir.join(format!("{stem}_{n}{ext}"));
                if !candidate.exists() {
                    return Ok(Some(candidate));
                }
            }
            bail!("no free output name for {name} in {}", dir.display())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_archive(
    archive: &EvaluatedArchive,
    ctx: &PatternContext,
    options: &RunOptions,
    scratch: &ScratchDir,
    shutdown: &ShutdownToken,
    events: &mut EventLog,
    reporter: &mut dyn Reporter,
) -> ArchiveOutcome {
    let keyword = archive.spec.keyword.clone();
    let mut outcome = ArchiveOutcome {
        keyword: keyword.clone(),
        state: ArchiveState::Completed,
        optional: archive.spec.optional,
        path: None,
        size: None,
        error: None,
        commands: Vec::new(),
    };

    let output_path = match resolve_output_path(
        &options.output_dir,
        &archive.archive_name,
        archive.spec.repeat,
    ) {
        Ok(Some(path)) => path,
        Ok(None) => {
            reporter.info(&format!(
                "{keyword}: output exists and repeat policy is 'once', skipping"
            ));
            events.record(
                &keyword,
                RunEventKind::ArchiveSkipped {
                    reason: "output exists (repeat=once)".to_string(),
                },
            );
            outcome.state = ArchiveState::Skipped;
            return outcome;
        }
        Err(e) => {
            outcome.state = ArchiveState::Failed;
            outcome.error = Some(format!("{e:#}"));
            return outcome;
        }
    };

    reporter.info(&format!(
        "{keyword}: collecting into {}",
        output_path.display()
    ));
    events.record(
        &keyword,
        RunEventKind::ArchiveStarted {
            path: output_path.display().to_string(),
        },
    );

    let agent = ArchiveAgent::spawn();
    if agent
        .send(ArchiveRequest::Open(OpenRequest {
            path: output_path.clone(),
            format: archive.spec.format,
            compression: archive.spec.compression.unwrap_or_default(),
            password: archive.spec.password.clone(),
            hashes: options.hashes,
        }))
        .is_err()
    {
        outcome.state = ArchiveState::Failed;
        outcome.error = Some("archive builder is gone".to_string());
        return outcome;
    }

    let resolver_dir = scratch.root().join(".resources").join(&keyword);
    let mut resolver = ResourceResolver::new(&resolver_dir);
    if let Some(bundle) = &options.bundle {
        resolver = resolver.with_self_bundle(bundle);
    }

    let mut container = limits::create(&archive.spec.limits);
    let (commands, fatal) = schedule_commands(
        archive,
        ctx,
        options,
        scratch,
        shutdown,
        &agent,
        &mut resolver,
        container.as_mut(),
        events,
        reporter,
    );
    container.close();
    resolver.release_all();
    outcome.commands = commands;
    if let Some(reason) = fatal {
        outcome.state = ArchiveState::Failed;
        outcome.error = Some(reason);
    }

    let finish = if shutdown.is_triggered() {
        ArchiveRequest::Cancel
    } else {
        ArchiveRequest::Complete
    };
    let _ = agent.send(finish);

    // Drain notifications; the builder stops after Complete/Cancel. The
    // entry map feeds the per-command digests.
    let mut entries: HashMap<String, (u64, DigestSet)> = HashMap::new();
    for note in agent.notifications().iter() {
        match note {
            ArchiveNotification::FileAdded {
                name,
                size,
                digests,
            } => {
                events.record(&keyword, RunEventKind::EntryAdded { name: name.clone(), size });
                entries.insert(name, (size, digests));
            }
            ArchiveNotification::FileAddFailed { name, reason } => {
                reporter.warn(&format!("{keyword}: entry {name} failed: {reason}"));
            }
            ArchiveNotification::Completed { final_size } => {
                events.record(&keyword, RunEventKind::ArchiveCompleted { final_size });
                outcome.size = Some(final_size);
                outcome.path = Some(output_path.display().to_string());
                break;
            }
            ArchiveNotification::Failed { reason } => {
                events.record(
                    &keyword,
                    RunEventKind::ArchiveFailed {
                        reason: reason.clone(),
                    },
                );
                outcome.state = ArchiveState::Failed;
                outcome.error = Some(reason);
                break;
            }
            ArchiveNotification::Cancelled => {
                outcome.state = ArchiveState::Cancelled;
                break;
            }
            _ => {}
        }
    }
    let _ = agent.join();

    for command in &mut outcome.commands {
        for output in &mut command.outputs {
            if let Some((size, digests)) = entries.get(&output.name) {
                output.size = *size;
                output.digests = digests.clone();
            }
        }
    }
    outcome
}

/// One launched child and everything needed to reap and harvest it.
struct RunningCommand {
    keyword: String,
    optional: bool,
    child: Child,
    started_at: chrono::DateTime<Utc>,
    start: Instant,
    deadline: Instant,
    drains: Vec<JoinHandle<()>>,
    captures: Vec<(String, Arc<Mutex<TemporaryStream>>)>,
    late_outputs: Vec<(String, OutputKind)>,
    command_dir: PathBuf,
}

/// Outcome of the admission loop: per-command records plus the fatal
/// archive failure, if one occurred.
#[allow(clippy::too_many_arguments)]
fn schedule_commands(
    archive: &EvaluatedArchive,
    ctx: &PatternContext,
    options: &RunOptions,
    scratch: &ScratchDir,
    shutdown: &ShutdownToken,
    agent: &ArchiveAgent,
    resolver: &mut ResourceResolver,
    container: &mut dyn ResourceContainer,
    events: &mut EventLog,
    reporter: &mut dyn Reporter,
) -> (Vec<CommandOutcome>, Option<String>) {
    let keyword = &archive.spec.keyword;
    let cap = archive.spec.concurrency_cap.max(1);
    let archive_deadline = Instant::now() + archive.spec.archive_timeout;

    let mut outcomes: Vec<CommandOutcome> = Vec::new();
    let mut running: Vec<RunningCommand> = Vec::new();
    let mut fatal: Option<String> = None;

    for command in &archive.commands {
        if shutdown.is_triggered() || Instant::now() >= archive_deadline {
            break;
        }

        match &command.disposition {
            Disposition::Skip { reason, fatal: is_fatal } => {
                if *is_fatal && fatal.is_none() {
                    fatal = Some(format!(
                        "mandatory command '{}' skipped: {reason}",
                        command.spec.keyword
                    ));
                }
                if *is_fatal {
                    reporter.error(&format!("{}: skipped: {reason}", command.spec.keyword));
                } else {
                    reporter.info(&format!("{}: skipped: {reason}", command.spec.keyword));
                }
                outcomes.push(skip_outcome(command, reason, *is_fatal));
                continue;
            }
            Disposition::Run => {}
        }

        // FlushQueue: drain the pool, run alone, then resume fan-out.
        let is_barrier =
            command.spec.queue == magpie_types::QueueBehavior::FlushQueue;
        if is_barrier {
            drain_all(&mut running, &mut outcomes, archive, agent, container, events, reporter);
            let _ = agent.send(ArchiveRequest::FlushQueue);
        } else {
            while running.len() >= cap {
                poll_once(&mut running, &mut outcomes, archive, agent, container, events, reporter);
                if observe_deadline(
                    &mut running,
                    &mut outcomes,
                    container,
                    archive_deadline,
                    shutdown,
                    reporter,
                ) {
                    break;
                }
            }
            if shutdown.is_triggered() || Instant::now() >= archive_deadline {
                break;
            }
        }

        match launch(command, ctx, options, scratch, resolver, container, archive.spec.child_debug) {
            Ok(mut launched) => {
                events.record(
                    keyword,
                    RunEventKind::CommandStarted {
                        keyword: launched.keyword.clone(),
                        pid: launched.child.id(),
                    },
                );
                reporter.info(&format!(
                    "{}: started (pid {})",
                    launched.keyword,
                    launched.child.id()
                ));
                if is_barrier {
                    // Barrier commands run alone to completion.
                    wait_single(&mut launched, container);
                    let outcome = harvest(launched, agent, container, reporter);
                    events.record(
                        keyword,
                        RunEventKind::CommandFinished {
                            keyword: outcome.keyword.clone(),
                            state: outcome.state,
                            exit_code: outcome.exit_code,
                        },
                    );
                    outcomes.push(outcome);
                } else {
                    running.push(launched);
                }
            }
            Err(failure) => {
                let is_fatal = !command.spec.optional;
                if is_fatal && fatal.is_none() {
                    fatal = Some(format!(
                        "mandatory command '{}' could not launch: {}",
                        command.spec.keyword, failure.message
                    ));
                }
                reporter.error(&format!(
                    "{}: {}",
                    command.spec.keyword, failure.message
                ));
                outcomes.push(CommandOutcome {
                    keyword: command.spec.keyword.clone(),
                    state: CommandState::Failed,
                    optional: command.spec.optional,
                    exit_code: None,
                    error_kind: Some(failure.kind),
                    note: Some(failure.message),
                    started_at: None,
                    finished_at: None,
                    duration_ms: 0,
                    outputs: Vec::new(),
                });
            }
        }
    }

    // Archive deadline or shutdown: everything still in flight is cancelled.
    if shutdown.is_triggered() || Instant::now() >= archive_deadline {
        let interrupted = !running.is_empty() || outcomes.len() < archive.commands.len();
        for launched in running.drain(..) {
            outcomes.push(cancel_running(launched, container, reporter));
        }
        if interrupted && fatal.is_none() && !shutdown.is_triggered() {
            fatal = Some("archive deadline exceeded".to_string());
        }
    } else {
        drain_all(&mut running, &mut outcomes, archive, agent, container, events, reporter);
    }

    (outcomes, fatal)
}

fn skip_outcome(command: &EvaluatedCommand, reason: &str, fatal: bool) -> CommandOutcome {
    CommandOutcome {
        keyword: command.spec.keyword.clone(),
        state: CommandState::Skipped,
        optional: command.spec.optional,
        exit_code: None,
        error_kind: fatal.then_some(CollectErrorKind::Config),
        note: Some(reason.to_string()),
        started_at: None,
        finished_at: None,
        duration_ms: 0,
        outputs: Vec::new(),
    }
}

struct LaunchFailure {
    kind: CollectErrorKind,
    message: String,
}

impl LaunchFailure {
    fn new(kind: CollectErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

/// Admission steps 2-7: materialise the executable, stage inputs, bind
/// outputs, compose the argv and start the child inside the container.
#[allow(clippy::too_many_arguments)]
fn launch(
    command: &EvaluatedCommand,
    ctx: &PatternContext,
    options: &RunOptions,
    scratch: &ScratchDir,
    resolver: &mut ResourceResolver,
    container: &mut dyn ResourceContainer,
    child_debug: bool,
) -> Result<RunningCommand, LaunchFailure> {
    let keyword = &command.spec.keyword;
    let command_dir = scratch.command_dir(keyword).map_err(|e| {
        LaunchFailure::new(CollectErrorKind::Io, format!("{e:#}"))
    })?;

    // Executable materialisation.
    let (program, mut argv) = match &command.executable {
        ExecutableRef::SelfTool { argument } => {
            let image = std::env::current_exe().map_err(|e| {
                LaunchFailure::new(CollectErrorKind::Launch, format!("cannot locate own image: {e}"))
            })?;
            (image, vec![argument.clone()])
        }
        ExecutableRef::Embedded(reference) => {
            let path = resolver.resolve(reference).map_err(|e| {
                LaunchFailure::new(CollectErrorKind::Resolver, e.to_string())
            })?;
            (path, Vec::new())
        }
        ExecutableRef::Path { path } => {
            let expanded = expand_env(path);
            let candidate = PathBuf::from(&expanded);
            let resolved = if candidate.is_file() {
                candidate
            } else {
                which::which(&expanded).map_err(|_| {
                    LaunchFailure::new(
                        CollectErrorKind::Launch,
                        format!("executable '{expanded}' not found"),
                    )
                })?
            };
            (resolved, Vec::new())
        }
    };

    // Input staging, in declared order.
    let mut substitutions: Vec<(String, String)> = Vec::new();
    let mut inputs = command.spec.inputs.clone();
    inputs.sort_by_key(|i| i.order);
    for input in &inputs {
        let staged = match &input.source {
            InputSource::Embedded(reference) => resolver.resolve(reference).map_err(|e| {
                LaunchFailure::new(CollectErrorKind::Resolver, e.to_string())
            })?,
            InputSource::Path { path } => {
                let expanded = PathBuf::from(expand_env(path));
                if !expanded.exists() {
                    return Err(LaunchFailure::new(
                        CollectErrorKind::Io,
                        format!("input '{}' missing at {}", input.name, expanded.display()),
                    ));
                }
                expanded
            }
        };
        if let Some(placeholder) = &input.argument {
            substitutions.push((placeholder.clone(), staged.display().to_string()));
        }
    }

    // Output binding. Standard streams capture into spill buffers; file and
    // directory outputs are harvested from scratch after exit.
    let mut outputs = command.spec.outputs.clone();
    outputs.sort_by_key(|o| o.order);
    let mut stdout_capture: Option<(String, Arc<Mutex<TemporaryStream>>)> = None;
    let mut stderr_capture: Option<(String, Arc<Mutex<TemporaryStream>>)> = None;
    let mut captures = Vec::new();
    let mut late_outputs = Vec::new();
    for output in &outputs {
        match &output.kind {
            OutputKind::StdOut => {
                let sink = Arc::new(Mutex::new(TemporaryStream::new(&command_dir)));
                stdout_capture = Some((output.name.clone(), Arc::clone(&sink)));
                captures.push((output.name.clone(), sink));
            }
            OutputKind::StdErr => {
                let sink = Arc::new(Mutex::new(TemporaryStream::new(&command_dir)));
                stderr_capture = Some((output.name.clone(), Arc::clone(&sink)));
                captures.push((output.name.clone(), sink));
            }
            OutputKind::StdOutErr => {
                let sink = Arc::new(Mutex::new(TemporaryStream::new(&command_dir)));
                stdout_capture = Some((output.name.clone(), Arc::clone(&sink)));
                stderr_capture = Some((output.name.clone(), Arc::clone(&sink)));
                captures.push((output.name.clone(), sink));
            }
            OutputKind::File => {
                late_outputs.push((output.name.clone(), output.kind.clone()));
            }
            OutputKind::Directory { .. } => {
                let dir = command_dir.join(&output.name);
                std::fs::create_dir_all(&dir).map_err(|e| {
                    LaunchFailure::new(CollectErrorKind::Io, format!("{}: {e}", dir.display()))
                })?;
                late_outputs.push((output.name.clone(), output.kind.clone()));
            }
        }
        if let Some(placeholder) = &output.argument {
            substitutions.push((
                placeholder.clone(),
                command_dir.join(&output.name).display().to_string(),
            ));
        }
    }

    // Argument composition: patterns first, then input/output placeholders.
    let mut warnings = Vec::new();
    for arg in &command.spec.arguments {
        let mut value = ctx.expand(arg, &mut warnings);
        for (placeholder, replacement) in &substitutions {
            value = value.replace(placeholder.as_str(), replacement);
        }
        argv.push(value);
    }

    let mut builder = Command::new(&program);
    builder
        .args(&argv)
        .current_dir(&command_dir)
        .stdin(Stdio::null())
        .stdout(if stdout_capture.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if stderr_capture.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    if let Some(offline) = &options.offline {
        builder.env("OfflineLocation", offline);
    }
    if child_debug {
        builder.env("MAGPIE_CHILD_DEBUG", "1");
    }

    let mut child = builder.spawn().map_err(|e| {
        LaunchFailure::new(
            CollectErrorKind::Launch,
            format!("failed to start {}: {e}", program.display()),
        )
    })?;

    // Limit application before the child does real work.
    let _ = container.attach(child.id());
    apply_priority(child.id(), options.priority);

    let mut drains = Vec::new();
    if let Some((_, sink)) = &stdout_capture {
        if let Some(pipe) = child.stdout.take() {
            drains.push(spawn_drain(pipe, Arc::clone(sink), options.tee_cleartext));
        }
    }
    if let Some((_, sink)) = &stderr_capture {
        if let Some(pipe) = child.stderr.take() {
            drains.push(spawn_drain(pipe, Arc::clone(sink), options.tee_cleartext));
        }
    }

    Ok(RunningCommand {
        keyword: keyword.clone(),
        optional: command.spec.optional,
        child,
        started_at: Utc::now(),
        start: Instant::now(),
        deadline: Instant::now() + command.effective_timeout,
        drains,
        captures,
        late_outputs,
        command_dir,
    })
}

/// One reader thread per captured pipe: drains into the spill buffer and
/// optionally mirrors to stderr.
fn spawn_drain(
    mut pipe: impl std::io::Read + Send + 'static,
    sink: Arc<Mutex<TemporaryStream>>,
    tee: bool,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let n = match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Ok(mut sink) = sink.lock() {
                let _ = magpie_stream::write_all(&mut *sink, &buf[..n]);
            }
            if tee {
                use std::io::Write;
                let _ = std::io::stderr().write_all(&buf[..n]);
            }
        }
    })
}

#[cfg(unix)]
fn apply_priority(pid: u32, priority: Priority) {
    let nice = match priority {
        Priority::Normal => return,
        Priority::Low => "10",
        Priority::High => "-5",
    };
    let _ = Command::new("renice")
        .args(["-n", nice, "-p", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn apply_priority(_pid: u32, _priority: Priority) {}

/// Reap any finished children; sleeps briefly when nothing changed.
fn poll_once(
    running: &mut Vec<RunningCommand>,
    outcomes: &mut Vec<CommandOutcome>,
    archive: &EvaluatedArchive,
    agent: &ArchiveAgent,
    container: &mut dyn ResourceContainer,
    events: &mut EventLog,
    reporter: &mut dyn Reporter,
) {
    let mut index = 0;
    let mut reaped = false;
    while index < running.len() {
        let done = match running[index].child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => {
                if Instant::now() >= running[index].deadline
                    || container.violation().is_some()
                {
                    // Deadline or cap: put the whole container down, then
                    // reap normally; harvest() decides which state it was.
                    container.terminate_all();
                    limits::kill_tree(running[index].child.id());
                    let _ = running[index].child.kill();
                    let _ = running[index].child.wait();
                    true
                } else {
                    false
                }
            }
            Err(_) => true,
        };
        if done {
            let launched = running.remove(index);
            let outcome = harvest(launched, agent, container, reporter);
            events.record(
                &archive.spec.keyword,
                RunEventKind::CommandFinished {
                    keyword: outcome.keyword.clone(),
                    state: outcome.state,
                    exit_code: outcome.exit_code,
                },
            );
            outcomes.push(outcome);
            reaped = true;
        } else {
            index += 1;
        }
    }
    if !reaped {
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Kill-and-cancel every running command when the archive deadline or the
/// shutdown token fires. Returns true when the loop should stop admitting.
fn observe_deadline(
    running: &mut Vec<RunningCommand>,
    outcomes: &mut Vec<CommandOutcome>,
    container: &mut dyn ResourceContainer,
    archive_deadline: Instant,
    shutdown: &ShutdownToken,
    reporter: &mut dyn Reporter,
) -> bool {
    if !shutdown.is_triggered() && Instant::now() < archive_deadline {
        return false;
    }
    for launched in running.drain(..) {
        outcomes.push(cancel_running(launched, container, reporter));
    }
    true
}

fn drain_all(
    running: &mut Vec<RunningCommand>,
    outcomes: &mut Vec<CommandOutcome>,
    archive: &EvaluatedArchive,
    agent: &ArchiveAgent,
    container: &mut dyn ResourceContainer,
    events: &mut EventLog,
    reporter: &mut dyn Reporter,
) {
    while !running.is_empty() {
        poll_once(running, outcomes, archive, agent, container, events, reporter);
    }
}

fn wait_single(launched: &mut RunningCommand, container: &mut dyn ResourceContainer) {
    loop {
        match launched.child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => {
                if Instant::now() >= launched.deadline || container.violation().is_some() {
                    container.terminate_all();
                    limits::kill_tree(launched.child.id());
                    let _ = launched.child.kill();
                    let _ = launched.child.wait();
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn cancel_running(
    mut launched: RunningCommand,
    container: &mut dyn ResourceContainer,
    reporter: &mut dyn Reporter,
) -> CommandOutcome {
    container.terminate_all();
    limits::kill_tree(launched.child.id());
    let _ = launched.child.kill();
    let _ = launched.child.wait();
    for drain in launched.drains.drain(..) {
        let _ = drain.join();
    }
    reporter.warn(&format!("{}: cancelled", launched.keyword));
    CommandOutcome {
        keyword: launched.keyword,
        state: CommandState::Cancelled,
        optional: launched.optional,
        exit_code: None,
        error_kind: Some(CollectErrorKind::Cancelled),
        note: None,
        started_at: Some(launched.started_at),
        finished_at: Some(Utc::now()),
        duration_ms: launched.start.elapsed().as_millis() as u64,
        outputs: Vec::new(),
    }
}

/// Step 9: close the sinks, send the captured streams and declared files
/// to the builder, and produce the command record.
fn harvest(
    mut launched: RunningCommand,
    agent: &ArchiveAgent,
    container: &mut dyn ResourceContainer,
    reporter: &mut dyn Reporter,
) -> CommandOutcome {
    let status = launched.child.wait().ok();
    for drain in launched.drains.drain(..) {
        let _ = drain.join();
    }

    let exit_code = status.and_then(|s| s.code());
    let timed_out = Instant::now() >= launched.deadline && exit_code.is_none();
    let violation = container.violation();

    // A tripped cap wins over a deadline: the child was killed for its
    // resource usage, however long it ran.
    let (state, error_kind, note) = if let Some(kind) = violation {
        (
            CommandState::Failed,
            Some(CollectErrorKind::LimitViolation),
            Some(format!("{kind} exceeded")),
        )
    } else if timed_out {
        (CommandState::TimedOut, Some(CollectErrorKind::Timeout), None)
    } else {
        (CommandState::Completed, None, None)
    };

    if state == CommandState::TimedOut {
        reporter.warn(&format!("{}: timed out", launched.keyword));
    } else if let Some(note) = &note {
        reporter.error(&format!("{}: {note}", launched.keyword));
    } else {
        reporter.info(&format!(
            "{}: exited with {}",
            launched.keyword,
            exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
        ));
    }

    let mut outputs = Vec::new();

    // Captured standard streams become archive entries even when empty;
    // partial output of a timed-out child is kept.
    let mut seen = std::collections::HashSet::new();
    for (name, sink) in launched.captures.drain(..) {
        if !seen.insert(name.clone()) {
            continue; // stdout_err shares one sink under two registrations
        }
        let mut stream = match Arc::try_unwrap(sink) {
            Ok(mutex) => match mutex.into_inner() {
                Ok(stream) => stream,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        if stream.seek(std::io::SeekFrom::Start(0)).is_err() {
            continue;
        }
        outputs.push(OutputDigest {
            name: name.clone(),
            size: stream.size().unwrap_or(0),
            digests: DigestSet::default(),
        });
        let _ = agent.send(ArchiveRequest::AddStream {
            name,
            source: Box::new(stream),
        });
    }

    // Declared file and directory outputs.
    for (name, kind) in launched.late_outputs.drain(..) {
        match kind {
            OutputKind::File => {
                let path = launched.command_dir.join(&name);
                if path.is_file() {
                    outputs.push(OutputDigest {
                        name: name.clone(),
                        size: 0,
                        digests: DigestSet::default(),
                    });
                    let _ = agent.send(ArchiveRequest::AddFile {
                        name,
                        source: path,
                        delete_after_flush: true,
                    });
                } else {
                    reporter.warn(&format!(
                        "{}: declared output '{name}' was not produced",
                        launched.keyword
                    ));
                }
            }
            OutputKind::Directory { pattern } => {
                let source_dir = launched.command_dir.join(&name);
                let _ = agent.send(ArchiveRequest::AddDirectory {
                    name,
                    source_dir,
                    pattern,
                    delete_after_flush: true,
                });
            }
            _ => {}
        }
    }

    CommandOutcome {
        keyword: launched.keyword,
        state,
        optional: launched.optional,
        exit_code,
        error_kind,
        note,
        started_at: Some(launched.started_at),
        finished_at: Some(Utc::now()),
        duration_ms: launched.start.elapsed().as_millis() as u64,
        outputs,
    }
}

/// Ship completed archives through the upload agent. Sync failures mark
/// the owning archive failed; async jobs are polled until the grace lapses.
fn deliver_archives(
    config: &UploadConfig,
    archives: &mut [ArchiveOutcome],
    shutdown: &ShutdownToken,
    events: &mut EventLog,
    reporter: &mut dyn Reporter,
) {
    let agent = match UploadAgent::spawn(config.clone(), magpie_retry::RetryConfig::default()) {
        Ok(agent) => agent,
        Err(e) => {
            reporter.error(&format!("upload agent unavailable: {e:#}"));
            for archive in archives.iter_mut() {
                if archive.state == ArchiveState::Completed {
                    archive.state = ArchiveState::Failed;
                    archive.error = Some(format!("upload agent unavailable: {e:#}"));
                }
            }
            return;
        }
    };

    let mut remote_by_name: HashMap<String, usize> = HashMap::new();
    for (index, archive) in archives.iter().enumerate() {
        if archive.state != ArchiveState::Completed {
            continue;
        }
        let Some(path) = &archive.path else { continue };
        let local = PathBuf::from(path);
        let remote = local
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.keyword.clone());
        remote_by_name.insert(remote.clone(), index);
        let _ = agent.send(UploadRequest::UploadFile {
            local_path: local,
            remote_name: remote,
            delete_after: config.delete_after_upload,
        });
    }

    let _ = agent.send(if shutdown.is_triggered() {
        UploadRequest::Cancel
    } else {
        UploadRequest::Complete
    });

    for note in agent.notifications().iter() {
        match note {
            UploadNotification::JobStateChanged {
                remote_name,
                state,
                error,
                ..
            } => {
                events.record(
                    "",
                    RunEventKind::UploadFinished {
                        remote_name: remote_name.clone(),
                        state,
                    },
                );
                if state == UploadJobState::Failed {
                    reporter.error(&format!(
                        "upload of {remote_name} failed: {}",
                        error.as_deref().unwrap_or("unknown error")
                    ));
                    if config.mode == magpie_types::UploadMode::Sync {
                        if let Some(&index) = remote_by_name.get(&remote_name) {
                            archives[index].state = ArchiveState::Failed;
                            archives[index].error =
                                Some(format!("upload failed: {}", error.unwrap_or_default()));
                        }
                    }
                } else if state == UploadJobState::Completed {
                    reporter.info(&format!("uploaded {remote_name}"));
                }
            }
            UploadNotification::DeleteFailed { local_path, error, .. } => {
                reporter.warn(&format!(
                    "could not remove {} after upload: {error}",
                    local_path.display()
                ));
            }
            UploadNotification::JobComplete | UploadNotification::Cancelled => break,
            _ => {}
        }
    }
    let _ = agent.join();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_policy_once_skips_existing() {
        let td = tempfile::tempdir().expect("tempdir");
        let existing = td.path().join("a.zip");
        std::fs::write(&existing, b"x").expect("write");
        assert_eq!(
            resolve_output_path(td.path(), "a.zip", RepeatPolicy::Once).expect("resolve"),
            None
        );
        assert_eq!(
            resolve_output_path(td.path(), "b.zip", RepeatPolicy::Once).expect("resolve"),
            Some(td.path().join("b.zip"))
        );
    }

    #[test]
    fn repeat_policy_create_new_picks_free_suffix() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("a.zip"), b"x").expect("write");
        std::fs::write(td.path().join("a_1.zip"), b"x").expect("write");
        assert_eq!(
            resolve_output_path(td.path(), "a.zip", RepeatPolicy::CreateNew).expect("resolve"),
            Some(td.path().join("a_2.zip"))
        );
    }

    #[test]
    fn repeat_policy_overwrite_reuses_path() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(td.path().join("a.zip"), b"x").expect("write");
        assert_eq!(
            resolve_output_path(td.path(), "a.zip", RepeatPolicy::Overwrite).expect("resolve"),
            Some(td.path().join("a.zip"))
        );
    }
}
