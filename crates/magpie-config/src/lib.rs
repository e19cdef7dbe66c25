//! Plan document loading for magpie.
//!
//! Plans are TOML documents mirroring the classic node set:
//! `archive`, `restrictions`, `command`, `execute`, `input`, `output`.
//! Loading parses the document, validates it (duplicate keywords, CPU
//! policy contradictions, malformed version gates) and converts it into
//! the immutable [`CollectionPlan`] the evaluator and scheduler consume.
//!
//! # Example
//!
//! ```
//! let doc = r#"
//! [[archive]]
//! keyword = "triage"
//! name = "{ComputerName}_triage.zip"
//! compression = "fast"
//!
//! [[archive.command]]
//! keyword = "ps"
//! timeout = "5m"
//!
//! [archive.command.execute]
//! name = "ps"
//! run = "/bin/ps"
//!
//! [[archive.command.output]]
//! name = "ps.txt"
//! source = "stdout"
//! "#;
//! let plan = magpie_config::parse_plan(doc).expect("parse");
//! assert_eq!(plan.archives[0].commands[0].keyword, "ps");
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use magpie_types::{
    ArchiveSpec, CollectionPlan, CommandSpec, CompressionLevel, CpuPolicy, ExecutableRef,
    ExecutableSpec, InputSource, InputSpec, OsRequirement, OutputKind, OutputSpec, QueueBehavior,
    RepeatPolicy, ResourceFormat, ResourceLimits, ResourceRef, VersionComparator,
};

/// Default plan file name looked up next to the binary.
pub const PLAN_FILE: &str = "magpie.toml";

/// Load and validate a plan document from disk.
pub fn load_plan(path: &Path) -> Result<CollectionPlan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    parse_plan(&text).with_context(|| format!("invalid plan {}", path.display()))
}

/// Parse and validate a plan document.
pub fn parse_plan(text: &str) -> Result<CollectionPlan> {
    let doc: PlanDoc = toml::from_str(text).context("plan document is not valid TOML")?;
    doc.into_plan()
}

#[derive(Debug, Default, Deserialize)]
struct PlanDoc {
    #[serde(default, rename = "archive")]
    archives: Vec<ArchiveDoc>,
}

#[derive(Debug, Deserialize)]
struct ArchiveDoc {
    keyword: String,
    /// Output file name template (`name` in the classic node set).
    name: String,
    #[serde(default)]
    compression: Option<CompressionLevel>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    child_debug: bool,
    #[serde(default)]
    repeat: Option<RepeatPolicy>,
    #[serde(default)]
    archive_timeout: Option<String>,
    #[serde(default)]
    command_timeout: Option<String>,
    #[serde(default)]
    restrictions: Option<RestrictionsDoc>,
    #[serde(default, rename = "command")]
    commands: Vec<CommandDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct RestrictionsDoc {
    #[serde(default)]
    job_memory: Option<u64>,
    #[serde(default)]
    process_memory: Option<u64>,
    #[serde(default)]
    elapsed_time: Option<String>,
    #[serde(default)]
    job_user_time: Option<String>,
    #[serde(default)]
    per_process_user_time: Option<String>,
    #[serde(default)]
    cpu_rate: Option<u8>,
    #[serde(default)]
    cpu_weight: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct CommandDoc {
    keyword: String,
    #[serde(default)]
    optional: bool,
    /// `enqueue` (default) or `flush`.
    #[serde(default)]
    queue: Option<String>,
    /// Version gate: `"10.0"`, `"6.1+"`, `"6.3-"`.
    #[serde(default)]
    winver: Option<String>,
    /// Pipe-separated system types, any-match.
    #[serde(default)]
    systemtype: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
    execute: ExecuteDoc,
    #[serde(default, rename = "argument")]
    arguments: Vec<String>,
    #[serde(default, rename = "input")]
    inputs: Vec<InputDoc>,
    #[serde(default, rename = "output")]
    outputs: Vec<OutputDoc>,
}

#[derive(Debug, Deserialize)]
struct ExecuteDoc {
    name: String,
    run: String,
    #[serde(default)]
    run32: Option<String>,
    #[serde(default)]
    run64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InputDoc {
    name: String,
    source: String,
    #[serde(default)]
    argument: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputDoc {
    name: String,
    /// `stdout`, `stderr`, `stdout_err`, `file` or `directory`.
    source: String,
    #[serde(default)]
    argument: Option<String>,
    #[serde(default)]
    filematch: Option<String>,
}

impl PlanDoc {
    fn into_plan(self) -> Result<CollectionPlan> {
        let mut seen = BTreeSet::new();
        let mut archives = Vec::with_capacity(self.archives.len());
        for archive in self.archives {
            let keyword = archive.keyword.to_ascii_lowercase();
            if !seen.insert(keyword) {
                bail!("duplicate archive keyword '{}'", archive.keyword);
            }
            archives.push(archive.into_spec()?);
        }
        Ok(CollectionPlan { archives })
    }
}

impl ArchiveDoc {
    fn into_spec(self) -> Result<ArchiveSpec> {
        let mut spec = ArchiveSpec::named(&self.keyword, &self.name);
        spec.compression = self.compression;
        spec.password = self.password;
        spec.optional = self.optional;
        spec.child_debug = self.child_debug;
        if let Some(repeat) = self.repeat {
            spec.repeat = repeat;
        }
        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                bail!("archive '{}': concurrency must be at least 1", self.keyword);
            }
            spec.concurrency_cap = concurrency;
        }
        if let Some(raw) = &self.archive_timeout {
            spec.archive_timeout = parse_duration(raw)
                .with_context(|| format!("archive '{}': bad archive_timeout", self.keyword))?;
        }
        if let Some(raw) = &self.command_timeout {
            spec.command_timeout = parse_duration(raw)
                .with_context(|| format!("archive '{}': bad command_timeout", self.keyword))?;
        }
        if let Some(restrictions) = self.restrictions {
            spec.limits = restrictions
                .into_limits()
                .with_context(|| format!("archive '{}': bad restrictions", self.keyword))?;
        }

        let mut seen = BTreeSet::new();
        for command in self.commands {
            if !seen.insert(command.keyword.to_ascii_lowercase()) {
                bail!(
                    "archive '{}': duplicate command keyword '{}'",
                    self.keyword,
                    command.keyword
                );
            }
            spec.commands.push(command.into_spec()?);
        }
        Ok(spec)
    }
}

impl RestrictionsDoc {
    fn into_limits(self) -> Result<ResourceLimits> {
        let cpu_policy = match (self.cpu_rate, self.cpu_weight) {
            (Some(_), Some(_)) => {
                // The legacy loader silently ignored both; make the
                // contradiction loud instead.
                bail!("cpu_rate and cpu_weight are mutually exclusive")
            }
            (Some(rate), None) => CpuPolicy::HardCapPercent(rate),
            (None, Some(weight)) => CpuPolicy::Weight(weight),
            (None, None) => CpuPolicy::None,
        };
        if !cpu_policy.is_valid() {
            bail!("cpu policy value out of range: {cpu_policy:?}");
        }

        Ok(ResourceLimits {
            job_memory_bytes: self.job_memory,
            process_memory_bytes: self.process_memory,
            per_process_cpu_time: self
                .per_process_user_time
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            per_job_cpu_time: self
                .job_user_time
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            elapsed_wall_time: self
                .elapsed_time
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            cpu_policy,
        })
    }
}

impl CommandDoc {
    fn into_spec(self) -> Result<CommandSpec> {
        let queue = match self.queue.as_deref() {
            None | Some("enqueue") => QueueBehavior::Enqueue,
            Some("flush") => QueueBehavior::FlushQueue,
            Some(other) => bail!(
                "command '{}': unknown queue behaviour '{other}'",
                self.keyword
            ),
        };

        let required_os = self
            .winver
            .as_deref()
            .map(parse_winver)
            .transpose()
            .with_context(|| format!("command '{}': bad winver", self.keyword))?;

        let required_system_type = self.systemtype.map(|raw| {
            raw.split('|')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        });

        let timeout = self
            .timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
            .with_context(|| format!("command '{}': bad timeout", self.keyword))?;

        let executable = ExecutableSpec {
            name: self.execute.name,
            run: parse_executable_ref(&self.execute.run)?,
            run32: self
                .execute
                .run32
                .as_deref()
                .map(parse_executable_ref)
                .transpose()?,
            run64: self
                .execute
                .run64
                .as_deref()
                .map(parse_executable_ref)
                .transpose()?,
        };

        let inputs = self
            .inputs
            .into_iter()
            .enumerate()
            .map(|(order, doc)| {
                Ok(InputSpec {
                    order: order as u32,
                    source: parse_input_source(&doc.source)?,
                    name: doc.name,
                    argument: doc.argument,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let outputs = self
            .outputs
            .into_iter()
            .enumerate()
            .map(|(order, doc)| {
                let kind = match doc.source.as_str() {
                    "stdout" => OutputKind::StdOut,
                    "stderr" => OutputKind::StdErr,
                    "stdout_err" => OutputKind::StdOutErr,
                    "file" => OutputKind::File,
                    "directory" => OutputKind::Directory {
                        pattern: doc.filematch.unwrap_or_else(|| "*".to_string()),
                    },
                    other => bail!("output '{}': unknown source '{other}'", doc.name),
                };
                Ok(OutputSpec {
                    order: order as u32,
                    name: doc.name,
                    kind,
                    argument: doc.argument,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CommandSpec {
            keyword: self.keyword,
            optional: self.optional,
            queue,
            required_os,
            required_system_type,
            timeout,
            executable,
            arguments: self.arguments,
            inputs,
            outputs,
        })
    }
}

fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration '{raw}'"))
}

/// Parse a version gate: `major.minor` with an optional trailing `+`
/// (at least) or `-` (at most).
pub fn parse_winver(raw: &str) -> Result<OsRequirement> {
    let (version, comparator) = match raw.strip_suffix('+') {
        Some(rest) => (rest, VersionComparator::Ge),
        None => match raw.strip_suffix('-') {
            Some(rest) => (rest, VersionComparator::Le),
            None => (raw, VersionComparator::Eq),
        },
    };
    let Some((major, minor)) = version.split_once('.') else {
        bail!("invalid version gate '{raw}' (expected major.minor)");
    };
    Ok(OsRequirement {
        major: major
            .trim()
            .parse()
            .with_context(|| format!("invalid major version in '{raw}'"))?,
        minor: minor
            .trim()
            .parse()
            .with_context(|| format!("invalid minor version in '{raw}'"))?,
        comparator,
    })
}

/// Parse an executable reference string:
/// - `self:<argument>` re-invokes the orchestrator in tool mode
/// - `res:<module>#<name>` is a bundle payload; `res:<module>#<name>/<inner>`
///   addresses an entry inside a nested bundle
/// - anything else is a filesystem path (environment variables expanded at
///   evaluation time)
pub fn parse_executable_ref(raw: &str) -> Result<ExecutableRef> {
    if let Some(argument) = raw.strip_prefix("self:") {
        if argument.is_empty() {
            bail!("self reference needs a tool argument");
        }
        return Ok(ExecutableRef::SelfTool {
            argument: argument.to_string(),
        });
    }
    if let Some(rest) = raw.strip_prefix("res:") {
        let Some((module, entry)) = rest.split_once('#') else {
            bail!("resource reference '{raw}' is missing '#<name>'");
        };
        if module.is_empty() || entry.is_empty() {
            bail!("resource reference '{raw}' is incomplete");
        }
        let (name, inner) = match entry.split_once('/') {
            Some((name, inner)) => (name.to_string(), Some(inner.to_string())),
            None => (entry.to_string(), None),
        };
        let format = if inner.is_some() {
            ResourceFormat::Bundle
        } else {
            ResourceFormat::Binary
        };
        return Ok(ExecutableRef::Embedded(ResourceRef {
            module: module.to_string(),
            name,
            inner,
            format,
        }));
    }
    Ok(ExecutableRef::Path {
        path: raw.to_string(),
    })
}

fn parse_input_source(raw: &str) -> Result<InputSource> {
    match parse_executable_ref(raw)? {
        ExecutableRef::Embedded(reference) => Ok(InputSource::Embedded(reference)),
        ExecutableRef::Path { path } => Ok(InputSource::Path { path }),
        ExecutableRef::SelfTool { .. } => {
            bail!("input source '{raw}' cannot be a self reference")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_PLAN: &str = r#"
[[archive]]
keyword = "triage"
name = "{ComputerName}_{TimeStamp}_triage.zip"
compression = "max"
concurrency = 3
repeat = "overwrite"
archive_timeout = "2h"
command_timeout = "10m"

[archive.restrictions]
job_memory = 1073741824
elapsed_time = "90m"
cpu_rate = 40

[[archive.command]]
keyword = "processes"
winver = "6.1+"
systemtype = "Workstation|Server"
timeout = "5m"
argument = ["aux"]

[archive.command.execute]
name = "ps"
run = "/bin/ps"
run64 = "res:self#ps64"

[[archive.command.output]]
name = "processes.txt"
source = "stdout"

[[archive.command]]
keyword = "collect_logs"
optional = true
queue = "flush"

[archive.command.execute]
name = "logger"
run = "self:collect-logs"

[[archive.command.input]]
name = "filter.cfg"
source = "res:self#filter.cfg"
argument = "{Filter}"

[[archive.command.output]]
name = "logs"
source = "directory"
filematch = "*.log"
"#;

    #[test]
    fn full_plan_parses() {
        let plan = parse_plan(FULL_PLAN).expect("parse");
        assert_eq!(plan.archives.len(), 1);
        let archive = &plan.archives[0];
        assert_eq!(archive.keyword, "triage");
        assert_eq!(archive.compression, Some(CompressionLevel::Max));
        assert_eq!(archive.concurrency_cap, 3);
        assert_eq!(archive.repeat, RepeatPolicy::Overwrite);
        assert_eq!(archive.archive_timeout, Duration::from_secs(2 * 3600));
        assert_eq!(archive.limits.job_memory_bytes, Some(1 << 30));
        assert_eq!(archive.limits.cpu_policy, CpuPolicy::HardCapPercent(40));

        let ps = &archive.commands[0];
        assert_eq!(ps.keyword, "processes");
        assert_eq!(
            ps.required_os,
            Some(OsRequirement {
                major: 6,
                minor: 1,
                comparator: VersionComparator::Ge
            })
        );
        assert_eq!(
            ps.required_system_type.as_deref(),
            Some(&["Workstation".to_string(), "Server".to_string()][..])
        );
        assert_eq!(ps.timeout, Some(Duration::from_secs(300)));
        assert!(matches!(ps.executable.run, ExecutableRef::Path { .. }));
        assert!(matches!(
            ps.executable.run64,
            Some(ExecutableRef::Embedded(_))
        ));

        let logs = &archive.commands[1];
        assert_eq!(logs.queue, QueueBehavior::FlushQueue);
        assert!(matches!(
            logs.executable.run,
            ExecutableRef::SelfTool { ref argument } if argument == "collect-logs"
        ));
        assert!(matches!(
            logs.outputs[0].kind,
            OutputKind::Directory { ref pattern } if pattern == "*.log"
        ));
    }

    #[test]
    fn cpu_rate_and_weight_together_are_rejected() {
        let doc = r#"
[[archive]]
keyword = "a"
name = "a.zip"
[archive.restrictions]
cpu_rate = 50
cpu_weight = 5
"#;
        let err = parse_plan(doc).expect_err("must fail");
        assert!(format!("{err:#}").contains("mutually exclusive"));
    }

    #[test]
    fn duplicate_keywords_are_rejected() {
        let doc = r#"
[[archive]]
keyword = "a"
name = "a.zip"

[[archive]]
keyword = "A"
name = "b.zip"
"#;
        assert!(parse_plan(doc).is_err());
    }

    #[test]
    fn invalid_winver_is_rejected() {
        let doc = r#"
[[archive]]
keyword = "a"
name = "a.zip"
[[archive.command]]
keyword = "c"
winver = "not-a-version"
[archive.command.execute]
name = "x"
run = "/bin/true"
"#;
        assert!(parse_plan(doc).is_err());
    }

    #[test]
    fn winver_comparators_parse() {
        assert_eq!(
            parse_winver("10.0+").expect("parse").comparator,
            VersionComparator::Ge
        );
        assert_eq!(
            parse_winver("6.3-").expect("parse").comparator,
            VersionComparator::Le
        );
        assert_eq!(
            parse_winver("6.1").expect("parse").comparator,
            VersionComparator::Eq
        );
        assert!(parse_winver("6").is_err());
    }

    #[test]
    fn executable_ref_forms() {
        assert!(matches!(
            parse_executable_ref("self:dump-registry").expect("parse"),
            ExecutableRef::SelfTool { .. }
        ));
        let embedded = parse_executable_ref("res:self#tools.tar/helper").expect("parse");
        match embedded {
            ExecutableRef::Embedded(r) => {
                assert_eq!(r.module, "self");
                assert_eq!(r.name, "tools.tar");
                assert_eq!(r.inner.as_deref(), Some("helper"));
                assert_eq!(r.format, ResourceFormat::Bundle);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_executable_ref("%SystemRoot%/system32/tool.exe").expect("parse"),
            ExecutableRef::Path { .. }
        ));
        assert!(parse_executable_ref("res:no-entry").is_err());
        assert!(parse_executable_ref("self:").is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let doc = r#"
[[archive]]
keyword = "a"
name = "a.zip"
concurrency = 0
"#;
        assert!(parse_plan(doc).is_err());
    }
}
