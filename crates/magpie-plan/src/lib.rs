//! Plan evaluation for magpie.
//!
//! Evaluation takes the parsed [`CollectionPlan`] plus runtime facts (host
//! architecture, OS version, system type, user-selected keyword filters,
//! offline mode) and produces the effective, fully resolved command list
//! per archive - a pure value the scheduler consumes and tests can build
//! by hand. No processes are touched here.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use magpie_types::{
    ArchiveSpec, CollectionPlan, CommandSpec, CompressionLevel, ExecutableRef, HostFacts,
    RepeatPolicy,
};

/// Commands keyed to this marker keep running in offline mode; everything
/// else is demoted to an optional skip.
pub const OFFLINE_MARKER: &str = "offline";

/// Declared timeouts saturate here (the legacy loader wrapped them through
/// a signed 32-bit conversion instead).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(u32::MAX as u64);

/// Case-insensitive keyword filters from the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordFilters {
    /// `--key`: restrict the run set to matching archives/commands.
    pub only: Vec<String>,
    /// `--enable-key`: force otherwise-skipped commands to run.
    pub enable: Vec<String>,
    /// `--disable-key`: demote matching commands to optional and skip them.
    pub disable: Vec<String>,
}

impl KeywordFilters {
    fn matches(list: &[String], keyword: &str) -> bool {
        list.iter().any(|k| k.eq_ignore_ascii_case(keyword))
    }

    fn only_selects(&self, archive: &str, command: &str) -> bool {
        self.only.is_empty()
            || Self::matches(&self.only, archive)
            || Self::matches(&self.only, command)
    }

    fn enables(&self, archive: &str, command: &str) -> bool {
        Self::matches(&self.enable, archive) || Self::matches(&self.enable, command)
    }

    fn disables(&self, archive: &str, command: &str) -> bool {
        Self::matches(&self.disable, archive) || Self::matches(&self.disable, command)
    }
}

/// Runtime inputs of an evaluation beyond the host facts.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    pub filters: KeywordFilters,
    /// CLI `--once` / `--overwrite` / `--create-new`.
    pub repeat_override: Option<RepeatPolicy>,
    /// CLI `--compression`.
    pub compression_override: Option<CompressionLevel>,
    /// Offline image path; set when evaluating against a disk image.
    pub offline: Option<String>,
    /// CLI `--nolimits` keywords; `*` lifts limits everywhere.
    pub no_limits: Vec<String>,
}

/// What the evaluator decided about one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Admit the command.
    Run,
    /// Do not run it. `fatal` marks a skip that must fail the archive
    /// (a non-optional command that cannot run).
    Skip { reason: String, fatal: bool },
}

impl Disposition {
    pub fn is_run(&self) -> bool {
        matches!(self, Disposition::Run)
    }
}

/// One command after evaluation: gate decisions applied, architecture
/// variant chosen, effective deadline computed.
#[derive(Debug, Clone)]
pub struct EvaluatedCommand {
    pub spec: CommandSpec,
    /// The variant picked for this host.
    pub executable: ExecutableRef,
    /// `min(spec.timeout, archive.command_timeout)`, saturated.
    pub effective_timeout: Duration,
    pub disposition: Disposition,
}

/// One archive after evaluation.
#[derive(Debug, Clone)]
pub struct EvaluatedArchive {
    pub spec: ArchiveSpec,
    /// Output file name with patterns substituted.
    pub archive_name: String,
    pub commands: Vec<EvaluatedCommand>,
}

impl EvaluatedArchive {
    /// Commands the scheduler should admit, in declaration order.
    pub fn runnable(&self) -> impl Iterator<Item = &EvaluatedCommand> {
        self.commands.iter().filter(|c| c.disposition.is_run())
    }
}

/// The evaluator's product: a pure value, ready for the scheduler.
#[derive(Debug, Clone)]
pub struct EvaluatedPlan {
    pub run_id: String,
    pub host: HostFacts,
    pub archives: Vec<EvaluatedArchive>,
    /// Human-readable evaluation warnings (unresolved patterns, saturated
    /// timeouts).
    pub warnings: Vec<String>,
}

/// Evaluate `plan` against `host` under `options`.
pub fn evaluate(plan: &CollectionPlan, host: &HostFacts, options: &EvalOptions) -> EvaluatedPlan {
    let run_id = new_run_id();
    let ctx = PatternContext::new(host, &run_id);
    let mut warnings = Vec::new();
    let mut archives = Vec::with_capacity(plan.archives.len());

    for archive in &plan.archives {
        let mut spec = archive.clone();
        if let Some(repeat) = options.repeat_override {
            spec.repeat = repeat;
        }
        if let Some(compression) = options.compression_override {
            spec.compression = Some(compression);
        }
        if lifts_limits(&options.no_limits, &spec.keyword) {
            spec.limits = Default::default();
        }

        let archive_name = ctx.expand(&spec.name_template, &mut warnings);
        let commands = spec
            .commands
            .iter()
            .map(|command| evaluate_command(&spec, command, host, options, &mut warnings))
            .collect();

        archives.push(EvaluatedArchive {
            spec,
            archive_name,
            commands,
        });
    }

    EvaluatedPlan {
        run_id,
        host: host.clone(),
        archives,
        warnings,
    }
}

fn lifts_limits(no_limits: &[String], keyword: &str) -> bool {
    no_limits
        .iter()
        .any(|k| k == "*" || k.eq_ignore_ascii_case(keyword))
}

fn evaluate_command(
    archive: &ArchiveSpec,
    command: &CommandSpec,
    host: &HostFacts,
    options: &EvalOptions,
    warnings: &mut Vec<String>,
) -> EvaluatedCommand {
    let executable = select_variant(command, host);
    let effective_timeout = effective_timeout(archive, command, warnings);
    let forced = options.filters.enables(&archive.keyword, &command.keyword);

    let disposition = command_disposition(archive, command, host, options, forced);

    EvaluatedCommand {
        spec: command.clone(),
        executable,
        effective_timeout,
        disposition,
    }
}

fn command_disposition(
    archive: &ArchiveSpec,
    command: &CommandSpec,
    host: &HostFacts,
    options: &EvalOptions,
    forced: bool,
) -> Disposition {
    let filters = &options.filters;

    if !filters.only_selects(&archive.keyword, &command.keyword) {
        return Disposition::Skip {
            reason: "not selected by --key".to_string(),
            fatal: false,
        };
    }
    if filters.disables(&archive.keyword, &command.keyword) {
        // Disabled commands are demoted to optional: never fatal.
        return Disposition::Skip {
            reason: "disabled by --disable-key".to_string(),
            fatal: false,
        };
    }

    if options.offline.is_some() && !offline_keyed(archive, command) {
        return Disposition::Skip {
            reason: "offline run: command targets the live system".to_string(),
            fatal: false,
        };
    }

    if !forced {
        if let Some(required) = &command.required_os {
            if !required.matches(host.os_major, host.os_minor) {
                return Disposition::Skip {
                    reason: format!(
                        "host version {}.{} does not satisfy the gate",
                        host.os_major, host.os_minor
                    ),
                    fatal: !command.optional,
                };
            }
        }
        if let Some(types) = &command.required_system_type {
            if !host.system_type_matches(types) {
                return Disposition::Skip {
                    reason: format!("system type '{}' not in {:?}", host.system_type, types),
                    fatal: !command.optional,
                };
            }
        }
    }

    Disposition::Run
}

fn offline_keyed(archive: &ArchiveSpec, command: &CommandSpec) -> bool {
    let marker = |k: &str| k.to_ascii_lowercase().contains(OFFLINE_MARKER);
    marker(&archive.keyword) || marker(&command.keyword)
}

/// Pick `run64` on 64-bit hosts and `run32` on 32-bit hosts, falling back
/// to `run`.
pub fn select_variant(command: &CommandSpec, host: &HostFacts) -> ExecutableRef {
    let exec = &command.executable;
    let variant = if host.arch_bits == 64 {
        exec.run64.as_ref()
    } else {
        exec.run32.as_ref()
    };
    variant.unwrap_or(&exec.run).clone()
}

fn effective_timeout(
    archive: &ArchiveSpec,
    command: &CommandSpec,
    warnings: &mut Vec<String>,
) -> Duration {
    let declared = command.timeout.unwrap_or(archive.command_timeout);
    let mut effective = declared.min(archive.command_timeout);
    if effective > MAX_TIMEOUT {
        warnings.push(format!(
            "command '{}': timeout saturated to {}s",
            command.keyword,
            MAX_TIMEOUT.as_secs()
        ));
        effective = MAX_TIMEOUT;
    }
    effective
}

// ---------------------------------------------------------------------------
// Pattern substitution
// ---------------------------------------------------------------------------

/// Substitution context for `{ComputerName}`-style patterns.
#[derive(Debug, Clone)]
pub struct PatternContext {
    pub computer_name: String,
    pub full_computer_name: String,
    pub system_type: String,
    pub timestamp: String,
    pub run_id: String,
}

impl PatternContext {
    pub fn new(host: &HostFacts, run_id: &str) -> Self {
        Self {
            computer_name: host.computer_name.clone(),
            full_computer_name: host.full_computer_name.clone(),
            system_type: host.system_type.clone(),
            timestamp: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Substitute the global patterns. Unresolved `{...}` placeholders stay
    /// verbatim and produce a warning.
    pub fn expand(&self, template: &str, warnings: &mut Vec<String>) -> String {
        self.expand_with(template, &[], warnings)
    }

    /// Substitute the global patterns plus per-binding extras such as
    /// `{Name}`, `{FileName}`, `{DirectoryName}`.
    pub fn expand_with(
        &self,
        template: &str,
        extra: &[(&str, &str)],
        warnings: &mut Vec<String>,
    ) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut unresolved = BTreeSet::new();

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let Some(end) = tail.find('}') else {
                out.push_str(tail);
                rest = "";
                break;
            };
            let name = &tail[1..end];
            let value = match name {
                "ComputerName" => Some(self.computer_name.as_str()),
                "FullComputerName" => Some(self.full_computer_name.as_str()),
                "SystemType" => Some(self.system_type.as_str()),
                "TimeStamp" => Some(self.timestamp.as_str()),
                "RunId" => Some(self.run_id.as_str()),
                other => extra.iter().find(|(k, _)| *k == other).map(|(_, v)| *v),
            };
            match value {
                Some(value) => out.push_str(value),
                None => {
                    unresolved.insert(name.to_string());
                    out.push_str(&tail[..=end]);
                }
            }
            rest = &tail[end + 1..];
        }
        out.push_str(rest);

        for name in unresolved {
            warnings.push(format!("unresolved pattern {{{name}}} in '{template}'"));
        }
        out
    }
}

/// Expand `%VAR%` and `$VAR` environment references in a path string.
/// Unknown variables stay verbatim.
pub fn expand_env(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;

    while let Some(start) = rest.find(['%', '$']) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(stripped) = tail.strip_prefix('%') {
            if let Some(end) = stripped.find('%') {
                let name = &stripped[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&tail[..end + 2]),
                }
                rest = &stripped[end + 1..];
                continue;
            }
        } else if let Some(stripped) = tail.strip_prefix('$') {
            let end = stripped
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(stripped.len());
            if end > 0 {
                let name = &stripped[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(&tail[..end + 1]),
                }
                rest = &stripped[end..];
                continue;
            }
        }
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Host facts
// ---------------------------------------------------------------------------

/// Capture facts about the running host. Pure-value overrides come from
/// the CLI afterwards.
pub fn capture_host_facts() -> HostFacts {
    let computer_name = std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    let (os_major, os_minor) = os_version();

    HostFacts {
        full_computer_name: computer_name.clone(),
        computer_name,
        system_type: "workstation".to_string(),
        os_major,
        os_minor,
        arch_bits: if cfg!(target_pointer_width = "64") {
            64
        } else {
            32
        },
        tags: BTreeSet::new(),
    }
}

fn os_version() -> (u32, u32) {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
    let mut parts = release.trim().split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts
        .next()
        .map(|p| {
            p.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    (major, minor)
}

fn new_run_id() -> String {
    format!(
        "{}_{:04x}",
        Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u16>()
    )
}
