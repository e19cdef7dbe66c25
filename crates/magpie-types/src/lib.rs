//! # Types
//!
//! Core domain types for magpie, the host artifact collection orchestrator.
//!
//! This crate defines the fundamental data structures shared by every other
//! crate in the workspace:
//! - [`CollectionPlan`] - Immutable input: the ordered set of archives to produce
//! - [`ArchiveSpec`] / [`CommandSpec`] - One output container and the commands feeding it
//! - [`ExecutableRef`] - Tagged reference to a tool image (self, embedded, on disk)
//! - [`ResourceLimits`] - Memory/CPU/wall-clock caps applied to a command group
//! - [`CommandState`] / [`CollectErrorKind`] - Terminal states and the error taxonomy
//! - [`RunOutcome`] - Machine-readable summary of a completed run
//!
//! ## Serialization
//!
//! All plan and outcome types implement `Serialize`/`Deserialize`. Durations
//! accept human-readable strings (`"5m"`, `"90s"`) or integral milliseconds,
//! and always serialize back as milliseconds so files round-trip.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds).
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Same as [`deserialize_duration`] but for optional fields.
pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "deserialize_duration")] Duration);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

/// Serialize an optional Duration as milliseconds.
pub fn serialize_opt_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_archive_timeout() -> Duration {
    Duration::from_secs(10 * 60 * 60)
}

/// The immutable input of a run: an ordered list of archives to produce.
///
/// A plan is built once by the configuration loader, evaluated against host
/// facts by the plan evaluator, and then consumed by the scheduler. It is
/// never mutated after load.
///
/// # Example
///
/// ```rust
/// use magpie_types::{ArchiveSpec, CollectionPlan};
///
/// let plan = CollectionPlan {
///     archives: vec![ArchiveSpec::named("triage", "{ComputerName}_triage.zip")],
/// };
/// assert_eq!(plan.archives.len(), 1);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionPlan {
    /// Archives in declaration order. Order is preserved through evaluation
    /// and execution.
    pub archives: Vec<ArchiveSpec>,
}

impl CollectionPlan {
    /// Look up an archive by keyword (case-insensitive, like all keyword
    /// matching in magpie).
    pub fn archive(&self, keyword: &str) -> Option<&ArchiveSpec> {
        self.archives
            .iter()
            .find(|a| a.keyword.eq_ignore_ascii_case(keyword))
    }

    /// All archive and command keywords, in declaration order.
    pub fn keywords(&self) -> Vec<String> {
        let mut out = Vec::new();
        for a in &self.archives {
            out.push(a.keyword.clone());
            for c in &a.commands {
                out.push(c.keyword.clone());
            }
        }
        out
    }
}

/// One output container and the ordered commands that feed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSpec {
    /// Unique identifier within the plan. Used by CLI keyword filters.
    pub keyword: String,
    /// Output file name; may contain `{ComputerName}`-style patterns,
    /// substituted at evaluation time.
    pub name_template: String,
    /// Container format. When `None`, derived from the (substituted) file
    /// name extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ArchiveFormat>,
    /// Compression level for compressed containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionLevel>,
    /// Entry password for containers that support one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Maximum number of commands running at once for this archive.
    #[serde(default = "default_concurrency")]
    pub concurrency_cap: usize,
    /// When true, failure of this archive does not fail the run.
    #[serde(default)]
    pub optional: bool,
    /// Attach a debugger-friendly environment to children (diagnostic runs).
    #[serde(default)]
    pub child_debug: bool,
    /// What to do when the output file already exists.
    #[serde(default)]
    pub repeat: RepeatPolicy,
    /// Limits applied to the archive's resource container.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Default per-command deadline; a command's own `timeout` takes the
    /// smaller of the two.
    #[serde(
        default = "default_command_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub command_timeout: Duration,
    /// Whole-archive deadline, measured from first admission.
    #[serde(
        default = "default_archive_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub archive_timeout: Duration,
    /// Commands in declaration order.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

impl ArchiveSpec {
    /// A minimal spec with defaults for everything but identity. Mostly
    /// useful in tests and doc examples.
    pub fn named(keyword: &str, name_template: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            name_template: name_template.to_string(),
            format: None,
            compression: None,
            password: None,
            concurrency_cap: default_concurrency(),
            optional: false,
            child_debug: false,
            repeat: RepeatPolicy::default(),
            limits: ResourceLimits::default(),
            command_timeout: default_command_timeout(),
            archive_timeout: default_archive_timeout(),
            commands: Vec::new(),
        }
    }
}

/// Supported output container formats.
///
/// `Zip` is the general-purpose compressed container (deflate, optional
/// AES-256 entry password). `Tar` is the plain collection container used
/// when bit-exact, uncompressed output is wanted; it is also the layout of
/// the embedded resource bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    /// Compressed container (`.zip`).
    Zip,
    /// Plain collection container (`.tar`).
    Tar,
}

impl ArchiveFormat {
    /// Derive the format from a file name extension. Unknown or missing
    /// extensions are `None`; the caller decides how to fail.
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = name.rsplit('.').next()?;
        match ext.to_ascii_lowercase().as_str() {
            "zip" => Some(ArchiveFormat::Zip),
            "tar" => Some(ArchiveFormat::Tar),
            _ => None,
        }
    }
}

/// Compression level names accepted in plans. They map to backend-specific
/// values (deflate 1/6/9 for zip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    Fast,
    #[default]
    Normal,
    Max,
}

/// What to do when an archive's output file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPolicy {
    /// Pick a fresh name by suffixing `_1`, `_2`, ... to the basename.
    #[default]
    CreateNew,
    /// Truncate and rewrite the existing file.
    Overwrite,
    /// Skip the archive entirely; it is reported as skipped.
    Once,
}

/// Limits applied to the resource container an archive's children run in.
///
/// All fields are optional; an all-`None` value means "no caps" and is the
/// default. CPU-time caps are wall-clock-independent (they measure time the
/// processes actually spent on-CPU).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Committed-memory cap for the whole container, bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_memory_bytes: Option<u64>,
    /// Committed-memory cap per process, bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_memory_bytes: Option<u64>,
    /// CPU-time cap per process.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub per_process_cpu_time: Option<Duration>,
    /// CPU-time cap for the whole container.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub per_job_cpu_time: Option<Duration>,
    /// Wall-clock cap for the whole container. Enforced by the scheduler's
    /// deadline, not by the container itself.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub elapsed_wall_time: Option<Duration>,
    /// CPU scheduling policy for the container.
    #[serde(default)]
    pub cpu_policy: CpuPolicy,
}

impl ResourceLimits {
    /// True when no cap of any kind is set.
    pub fn is_unlimited(&self) -> bool {
        *self == ResourceLimits::default()
    }
}

/// CPU scheduling policy for a resource container.
///
/// `HardCapPercent` and `Weight` are mutually exclusive; the configuration
/// loader rejects plans that set both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuPolicy {
    /// No CPU policy.
    #[default]
    None,
    /// Hard cap as a percentage of total CPU, 1-100.
    HardCapPercent(u8),
    /// Relative weight, 1-9.
    Weight(u8),
}

impl CpuPolicy {
    /// Validate the numeric range of the policy.
    pub fn is_valid(&self) -> bool {
        match self {
            CpuPolicy::None => true,
            CpuPolicy::HardCapPercent(p) => (1..=100).contains(p),
            CpuPolicy::Weight(w) => (1..=9).contains(w),
        }
    }
}

/// One child-process invocation declared in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Unique identifier within the archive.
    pub keyword: String,
    /// When true, skipping or failing this command does not fail the archive.
    #[serde(default)]
    pub optional: bool,
    /// Whether this command acts as a queue barrier.
    #[serde(default)]
    pub queue: QueueBehavior,
    /// OS version gate; the command is skipped when the host does not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_os: Option<OsRequirement>,
    /// System-type gate (any-match, case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_system_type: Option<Vec<String>>,
    /// Per-command deadline; the effective deadline is
    /// `min(timeout, archive.command_timeout)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub timeout: Option<Duration>,
    /// The tool image to run, with optional 32/64-bit variants.
    pub executable: ExecutableSpec,
    /// Arguments in declaration order (opaque; placeholders from
    /// inputs/outputs are substituted at launch).
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Files staged before launch.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Captures harvested during/after the run.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

/// Queue behaviour of a command within its archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBehavior {
    /// Run as soon as a concurrency slot frees up.
    #[default]
    Enqueue,
    /// Barrier: wait for all running commands, run alone, then resume
    /// normal fan-out.
    FlushQueue,
}

/// OS version gate: `(major, minor)` compared with the declared comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRequirement {
    pub major: u32,
    pub minor: u32,
    #[serde(default)]
    pub comparator: VersionComparator,
}

/// Comparator for [`OsRequirement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionComparator {
    Eq,
    #[default]
    Ge,
    Le,
}

impl OsRequirement {
    /// Tuple comparison of the host version against the requirement.
    pub fn matches(&self, host_major: u32, host_minor: u32) -> bool {
        let host = (host_major, host_minor);
        let want = (self.major, self.minor);
        match self.comparator {
            VersionComparator::Eq => host == want,
            VersionComparator::Ge => host >= want,
            VersionComparator::Le => host <= want,
        }
    }
}

/// A tool image with optional architecture variants.
///
/// The evaluator picks `run64` on 64-bit hosts and `run32` on 32-bit hosts,
/// falling back to `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableSpec {
    /// Display name, used in scratch paths and diagnostics.
    pub name: String,
    /// Default variant.
    pub run: ExecutableRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run32: Option<ExecutableRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run64: Option<ExecutableRef>,
}

impl ExecutableSpec {
    /// A spec with a single variant and a name derived from it.
    pub fn single(name: &str, run: ExecutableRef) -> Self {
        Self {
            name: name.to_string(),
            run,
            run32: None,
            run64: None,
        }
    }
}

/// Tagged reference to a tool image or payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutableRef {
    /// The orchestrator re-invokes its own image in tool mode, with
    /// `argument` prepended to the argv.
    SelfTool { argument: String },
    /// A payload carried inside an embedded bundle.
    Embedded(ResourceRef),
    /// A filesystem path; `%VAR%` / `$VAR` environment references are
    /// expanded at evaluation time.
    Path { path: String },
}

/// Address of a payload inside an embedded bundle: `res:<module>#<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Bundle module: `self` for the orchestrator's own image, otherwise a
    /// path to a side bundle file.
    pub module: String,
    /// Entry name within the bundle.
    pub name: String,
    /// For `format = bundle`: the inner entry to extract out of a nested
    /// bundle carried under `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<String>,
    /// Payload format.
    #[serde(default)]
    pub format: ResourceFormat,
}

impl ResourceRef {
    /// The file name the payload is extracted under.
    pub fn extracted_name(&self) -> &str {
        self.inner.as_deref().unwrap_or(&self.name)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => write!(f, "res:{}#{}/{}", self.module, self.name, inner),
            None => write!(f, "res:{}#{}", self.module, self.name),
        }
    }
}

/// Format of an embedded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFormat {
    /// Copied verbatim to scratch.
    #[default]
    Binary,
    /// A nested bundle; the `inner` entry is streamed out of it.
    Bundle,
}

/// A file staged into scratch before a command launches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Position among the command's inputs.
    pub order: u32,
    /// Staged file name under the command's scratch directory.
    pub name: String,
    /// Where the bytes come from.
    pub source: InputSource,
    /// Argument placeholder replaced by the staged path at launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
}

/// Source of an input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    /// Extracted from an embedded bundle.
    Embedded(ResourceRef),
    /// Copied from a filesystem path (environment variables expanded).
    Path { path: String },
}

/// A capture harvested from a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Position among the command's outputs.
    pub order: u32,
    /// Entry name in the archive (and scratch file name for file kinds).
    pub name: String,
    /// What is captured.
    pub kind: OutputKind,
    /// Argument placeholder replaced by the scratch path at launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
}

/// The capture kinds a command output can bind to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// The child's standard output.
    StdOut,
    /// The child's standard error.
    StdErr,
    /// Both standard streams interleaved in arrival order.
    StdOutErr,
    /// A file the child writes at `scratch/<name>`, harvested after exit.
    File,
    /// A directory tree the child populates at `scratch/<name>`; entries
    /// matching the glob are harvested after exit.
    Directory { pattern: String },
}

/// Lifecycle states of a scheduled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
}

impl CommandState {
    /// True for states a command cannot leave.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::Pending | CommandState::Running)
    }
}

/// Terminal states of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// The error taxonomy carried on handles, notifications and outcomes.
///
/// These are kinds, not error values: propagation uses `anyhow`, and the
/// kind is recorded wherever a state machine needs to distinguish causes
/// (a memory-capped child is a `LimitViolation`, never a `Timeout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectErrorKind {
    /// Plan contradiction found during evaluation.
    Config,
    /// Embedded reference absent or bundle corrupt.
    Resolver,
    /// Child process could not start.
    Launch,
    /// A container-enforced memory or CPU-time cap was exceeded.
    LimitViolation,
    /// Wall-clock deadline exceeded.
    Timeout,
    /// Stream read/write failure.
    Io,
    /// Container writer rejection or corruption on close.
    Archive,
    /// Delivery failure after retries.
    Upload,
    /// Shutdown token observed.
    Cancelled,
}

impl std::fmt::Display for CollectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectErrorKind::Config => "config",
            CollectErrorKind::Resolver => "resolver",
            CollectErrorKind::Launch => "launch",
            CollectErrorKind::LimitViolation => "limit_violation",
            CollectErrorKind::Timeout => "timeout",
            CollectErrorKind::Io => "io",
            CollectErrorKind::Archive => "archive",
            CollectErrorKind::Upload => "upload",
            CollectErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Digest algorithm selection for entry hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSelection {
    #[serde(default)]
    pub md5: bool,
    #[serde(default)]
    pub sha1: bool,
    #[serde(default = "default_true")]
    pub sha256: bool,
}

fn default_true() -> bool {
    true
}

impl Default for HashSelection {
    fn default() -> Self {
        Self {
            md5: false,
            sha1: false,
            sha256: true,
        }
    }
}

impl HashSelection {
    /// Every supported algorithm at once.
    pub fn all() -> Self {
        Self {
            md5: true,
            sha1: true,
            sha256: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.md5 || self.sha1 || self.sha256)
    }
}

/// Hex digests computed over one entry. Absent algorithms were not selected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Facts about the host a plan is evaluated against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostFacts {
    /// Short computer name, `{ComputerName}`.
    pub computer_name: String,
    /// Fully qualified name, `{FullComputerName}`.
    pub full_computer_name: String,
    /// Site-defined system type tag (`workstation`, `domain_controller`, ...).
    pub system_type: String,
    /// OS version as a `(major, minor)` tuple.
    pub os_major: u32,
    pub os_minor: u32,
    /// Pointer width of the host: 32 or 64.
    pub arch_bits: u8,
    /// User-selected tags; matched case-insensitively.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl HostFacts {
    /// True when any of `candidates` equals the host system type,
    /// case-insensitively.
    pub fn system_type_matches(&self, candidates: &[String]) -> bool {
        candidates
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.system_type))
    }
}

// ---------------------------------------------------------------------------
// Upload configuration
// ---------------------------------------------------------------------------

/// Transport selection for the upload agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    /// Plain filesystem copy (local, `file://`, mounted UNC shares).
    /// Sync-only.
    #[default]
    FileCopy,
    /// HTTP(S) transfer; the only method that supports async mode.
    BackgroundTransfer,
}

/// Sync vs async delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// The agent blocks until each transfer ends.
    #[default]
    Sync,
    /// The agent hands transfers to the transport and polls on Refresh.
    Async,
}

/// Authentication scheme for the destination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadAuth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    /// Accepted in plans; this build reports them unsupported when used.
    Ntlm,
    Kerberos,
    Negotiate,
}

/// Lifecycle states of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadJobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl UploadJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadJobState::Completed | UploadJobState::Failed)
    }
}

/// Destination and policy for the upload agent, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Destination root: `https://...`, `http://...`, `file://...`, or a
    /// plain directory path (including mounted UNC shares).
    pub destination: String,
    #[serde(default)]
    pub method: UploadMethod,
    #[serde(default)]
    pub mode: UploadMode,
    #[serde(default)]
    pub auth: UploadAuth,
    /// Remove local files once their transfer completes.
    #[serde(default)]
    pub delete_after_upload: bool,
    /// How long Complete waits for stragglers in async mode.
    #[serde(
        default = "default_upload_grace",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub completion_grace: Duration,
}

fn default_upload_grace() -> Duration {
    Duration::from_secs(120)
}

// ---------------------------------------------------------------------------
// Outcome records
// ---------------------------------------------------------------------------

/// Machine-readable summary of one run, written when `--outcome` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Run identifier, also used for the scratch subtree.
    pub run_id: String,
    /// Host facts captured at startup.
    pub host: HostFacts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Per-archive results in plan order.
    pub archives: Vec<ArchiveOutcome>,
}

impl RunOutcome {
    /// True when every non-optional archive succeeded, which also requires
    /// every non-optional command inside it to have reached a good end.
    pub fn success(&self) -> bool {
        self.archives.iter().all(|a| a.optional || a.is_success())
    }
}

/// Result of one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    pub keyword: String,
    pub state: ArchiveState,
    #[serde(default)]
    pub optional: bool,
    /// Final output path, when one was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Final container size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-command results in admission order.
    pub commands: Vec<CommandOutcome>,
}

impl ArchiveOutcome {
    /// A produced or skipped archive whose non-optional commands all ended
    /// well. A timed-out mandatory command makes the archive unsuccessful
    /// even though the container itself completed.
    pub fn is_success(&self) -> bool {
        let archive_ok = matches!(self.state, ArchiveState::Completed | ArchiveState::Skipped);
        archive_ok
            && self.commands.iter().all(|c| {
                c.optional
                    || (matches!(c.state, CommandState::Completed | CommandState::Skipped)
                        && c.error_kind.is_none())
            })
    }
}

/// Result of one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub keyword: String,
    pub state: CommandState,
    #[serde(default)]
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<CollectErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Digests of the command's harvested outputs.
    pub outputs: Vec<OutputDigest>,
}

/// Digest record for one harvested output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDigest {
    /// Entry name in the archive.
    pub name: String,
    pub size: u64,
    #[serde(flatten)]
    pub digests: DigestSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_roundtrips_through_millis() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            #[serde(
                deserialize_with = "deserialize_duration",
                serialize_with = "serialize_duration"
            )]
            d: Duration,
        }

        let json = serde_json::to_string(&Holder {
            d: Duration::from_secs(90),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"d":90000}"#);

        let back: Holder = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.d, Duration::from_secs(90));

        let human: Holder = serde_json::from_str(r#"{"d":"5m"}"#).expect("deserialize");
        assert_eq!(human.d, Duration::from_secs(300));
    }

    #[test]
    fn archive_format_from_name() {
        assert_eq!(ArchiveFormat::from_name("out.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name("out.TAR"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_name("out.7z"), None);
        assert_eq!(ArchiveFormat::from_name("noext"), None);
    }

    #[test]
    fn os_requirement_comparators() {
        let ge = OsRequirement {
            major: 10,
            minor: 0,
            comparator: VersionComparator::Ge,
        };
        assert!(!ge.matches(9, 9));
        assert!(ge.matches(10, 0));
        assert!(ge.matches(10, 5));
        assert!(ge.matches(11, 0));

        let eq = OsRequirement {
            major: 6,
            minor: 1,
            comparator: VersionComparator::Eq,
        };
        assert!(eq.matches(6, 1));
        assert!(!eq.matches(6, 2));

        let le = OsRequirement {
            major: 6,
            minor: 3,
            comparator: VersionComparator::Le,
        };
        assert!(le.matches(6, 1));
        assert!(!le.matches(10, 0));
    }

    #[test]
    fn cpu_policy_ranges() {
        assert!(CpuPolicy::None.is_valid());
        assert!(CpuPolicy::HardCapPercent(1).is_valid());
        assert!(CpuPolicy::HardCapPercent(100).is_valid());
        assert!(!CpuPolicy::HardCapPercent(0).is_valid());
        assert!(!CpuPolicy::HardCapPercent(101).is_valid());
        assert!(CpuPolicy::Weight(9).is_valid());
        assert!(!CpuPolicy::Weight(10).is_valid());
    }

    #[test]
    fn keyword_lookup_is_case_insensitive() {
        let plan = CollectionPlan {
            archives: vec![ArchiveSpec::named("Triage", "t.zip")],
        };
        assert!(plan.archive("triage").is_some());
        assert!(plan.archive("TRIAGE").is_some());
        assert!(plan.archive("other").is_none());
    }

    #[test]
    fn resource_ref_display() {
        let plain = ResourceRef {
            module: "self".to_string(),
            name: "helper".to_string(),
            inner: None,
            format: ResourceFormat::Binary,
        };
        assert_eq!(plain.to_string(), "res:self#helper");
        assert_eq!(plain.extracted_name(), "helper");

        let nested = ResourceRef {
            module: "self".to_string(),
            name: "tools.tar".to_string(),
            inner: Some("helper".to_string()),
            format: ResourceFormat::Bundle,
        };
        assert_eq!(nested.to_string(), "res:self#tools.tar/helper");
        assert_eq!(nested.extracted_name(), "helper");
    }

    #[test]
    fn default_hash_selection_is_sha256_only() {
        let sel = HashSelection::default();
        assert!(!sel.md5);
        assert!(!sel.sha1);
        assert!(sel.sha256);
        assert!(!sel.is_empty());
    }

    #[test]
    fn command_state_terminality() {
        assert!(!CommandState::Pending.is_terminal());
        assert!(!CommandState::Running.is_terminal());
        assert!(CommandState::Completed.is_terminal());
        assert!(CommandState::TimedOut.is_terminal());
        assert!(CommandState::Skipped.is_terminal());
    }

    #[test]
    fn outcome_success_honours_optional() {
        let base = |state, optional| ArchiveOutcome {
            keyword: "a".to_string(),
            state,
            optional,
            path: None,
            size: None,
            error: None,
            commands: vec![],
        };

        let ok = RunOutcome {
            run_id: "r".to_string(),
            host: HostFacts::default(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            archives: vec![base(ArchiveState::Completed, false), base(ArchiveState::Failed, true)],
        };
        assert!(ok.success());

        let bad = RunOutcome {
            run_id: "r".to_string(),
            host: HostFacts::default(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            archives: vec![base(ArchiveState::Failed, false)],
        };
        assert!(!bad.success());
    }

    #[test]
    fn plan_serialization_roundtrip() {
        let mut spec = ArchiveSpec::named("triage", "{ComputerName}_triage.zip");
        spec.commands.push(CommandSpec {
            keyword: "processes".to_string(),
            optional: true,
            queue: QueueBehavior::Enqueue,
            required_os: Some(OsRequirement {
                major: 10,
                minor: 0,
                comparator: VersionComparator::Ge,
            }),
            required_system_type: None,
            timeout: Some(Duration::from_secs(300)),
            executable: ExecutableSpec::single(
                "lister",
                ExecutableRef::Path {
                    path: "/usr/bin/ps".to_string(),
                },
            ),
            arguments: vec!["aux".to_string()],
            inputs: vec![],
            outputs: vec![OutputSpec {
                order: 0,
                name: "processes.txt".to_string(),
                kind: OutputKind::StdOut,
                argument: None,
            }],
        });
        let plan = CollectionPlan {
            archives: vec![spec],
        };

        let json = serde_json::to_string_pretty(&plan).expect("serialize");
        let back: CollectionPlan = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.archives.len(), 1);
        let cmd = &back.archives[0].commands[0];
        assert_eq!(cmd.keyword, "processes");
        assert_eq!(cmd.timeout, Some(Duration::from_secs(300)));
        assert_eq!(cmd.outputs[0].kind, OutputKind::StdOut);
    }
}
