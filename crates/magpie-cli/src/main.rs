use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use magpie::engine::{Priority, RunOptions};
use magpie::outcome::render_summary;
use magpie::reporter::Reporter;
use magpie::{ShutdownToken, run_plan};
use magpie_plan::{EvalOptions, KeywordFilters, capture_host_facts, evaluate};
use magpie_types::{
    CollectionPlan, CompressionLevel, HashSelection, RepeatPolicy, UploadAuth, UploadConfig,
    UploadMethod, UploadMode,
};

#[derive(Parser, Debug)]
#[command(name = "magpie", version)]
#[command(about = "Host artifact collection: run tool plans, archive outputs, deliver archives")]
struct Cli {
    /// Path to the plan document.
    #[arg(long, default_value = magpie_config::PLAN_FILE)]
    plan: PathBuf,

    /// Only run archives/commands with these keywords (comma-separated).
    #[arg(long = "key", value_delimiter = ',')]
    keys: Vec<String>,

    /// Force otherwise-skipped keywords to run.
    #[arg(long = "enable-key", value_delimiter = ',')]
    enable_keys: Vec<String>,

    /// Demote matching keywords to optional and skip them.
    #[arg(long = "disable-key", value_delimiter = ',')]
    disable_keys: Vec<String>,

    /// Directory finished archives are written to.
    #[arg(long, default_value = ".")]
    out: PathBuf,

    /// Scratch parent directory (defaults to the system temp directory).
    #[arg(long)]
    tempdir: Option<PathBuf>,

    /// Write the structured outcome file here.
    #[arg(long)]
    outcome: Option<PathBuf>,

    /// Write the textual summary here as well as to stdout.
    #[arg(long)]
    outline: Option<PathBuf>,

    /// Skip archives whose output already exists.
    #[arg(long)]
    once: bool,

    /// Overwrite existing archive outputs.
    #[arg(long)]
    overwrite: bool,

    /// Never clobber: suffix new outputs with _1, _2, ...
    #[arg(long = "create-new")]
    create_new: bool,

    /// Compression level: fast, normal or max.
    #[arg(long)]
    compression: Option<String>,

    /// Override the detected computer name.
    #[arg(long)]
    computer: Option<String>,

    /// Override the detected fully qualified computer name.
    #[arg(long)]
    fullcomputer: Option<String>,

    /// Override the detected system type tag.
    #[arg(long)]
    systemtype: Option<String>,

    /// Extra selection tags (comma-separated).
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Evaluate against a disk image instead of the live system.
    #[arg(long)]
    offline: Option<String>,

    /// Override every archive's whole-archive deadline (e.g. 2h).
    #[arg(long)]
    archive_timeout: Option<String>,

    /// Override every archive's default per-command deadline (e.g. 10m).
    #[arg(long)]
    command_timeout: Option<String>,

    /// Lift resource limits for these keywords, or everywhere when given
    /// without a value.
    #[arg(long = "nolimits", num_args = 0..=1, default_missing_value = "*", value_delimiter = ',')]
    no_limits: Vec<String>,

    /// Child process priority: normal, low or high.
    #[arg(long)]
    priority: Option<String>,

    /// Mirror captured child output to the console.
    #[arg(long)]
    tee_cleartext: bool,

    /// Side bundle file overriding the self-embedded one.
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Entry digests to compute (comma-separated: md5, sha1, sha256).
    #[arg(long, value_delimiter = ',')]
    hash: Vec<String>,

    /// Upload destination: https URL, file:// URL or directory path.
    #[arg(long)]
    upload: Option<String>,

    /// Remove local archives once uploaded.
    #[arg(long)]
    upload_delete: bool,

    /// Basic-auth credentials for the upload destination, `user:password`.
    #[arg(long)]
    upload_auth: Option<String>,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute the plan (default).
    Run,
    /// List archive and command keywords.
    Keys,
    /// Print the evaluated plan without executing it.
    Plan,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            eprintln!("[error] {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let mut reporter = CliReporter;
    let mut plan = magpie_config::load_plan(&cli.plan)?;
    apply_timeout_overrides(&mut plan, &cli)?;

    let mut host = capture_host_facts();
    if let Some(computer) = &cli.computer {
        host.computer_name = computer.clone();
    }
    if let Some(full) = &cli.fullcomputer {
        host.full_computer_name = full.clone();
    }
    if let Some(system_type) = &cli.systemtype {
        host.system_type = system_type.clone();
    }
    host.tags.extend(cli.tags.iter().cloned());

    let options = EvalOptions {
        filters: KeywordFilters {
            only: cli.keys.clone(),
            enable: cli.enable_keys.clone(),
            disable: cli.disable_keys.clone(),
        },
        repeat_override: repeat_override(&cli)?,
        compression_override: cli
            .compression
            .as_deref()
            .map(parse_compression)
            .transpose()?,
        offline: cli.offline.clone(),
        no_limits: cli.no_limits.clone(),
    };
    let evaluated = evaluate(&plan, &host, &options);

    match cli.cmd.as_ref().unwrap_or(&Commands::Run) {
        Commands::Keys => {
            print_keys(&plan);
            Ok(true)
        }
        Commands::Plan => {
            print_evaluated(&evaluated);
            Ok(true)
        }
        Commands::Run => {
            let run_options = build_run_options(&cli)?;
            let shutdown = ShutdownToken::new();
            let outcome = run_plan(&evaluated, &run_options, &shutdown, &mut reporter)?;
            let summary = render_summary(&outcome);
            print!("{summary}");
            if let Some(path) = &cli.outline {
                std::fs::write(path, &summary)
                    .with_context(|| format!("failed to write outline {}", path.display()))?;
            }
            Ok(outcome.success())
        }
    }
}

fn apply_timeout_overrides(plan: &mut CollectionPlan, cli: &Cli) -> Result<()> {
    if let Some(raw) = &cli.archive_timeout {
        let timeout = parse_duration(raw)?;
        for archive in &mut plan.archives {
            archive.archive_timeout = timeout;
        }
    }
    if let Some(raw) = &cli.command_timeout {
        let timeout = parse_duration(raw)?;
        for archive in &mut plan.archives {
            archive.command_timeout = timeout;
        }
    }
    Ok(())
}

fn repeat_override(cli: &Cli) -> Result<Option<RepeatPolicy>> {
    match (cli.once, cli.overwrite, cli.create_new) {
        (false, false, false) => Ok(None),
        (true, false, false) => Ok(Some(RepeatPolicy::Once)),
        (false, true, false) => Ok(Some(RepeatPolicy::Overwrite)),
        (false, false, true) => Ok(Some(RepeatPolicy::CreateNew)),
        _ => bail!("--once, --overwrite and --create-new are mutually exclusive"),
    }
}

fn parse_compression(raw: &str) -> Result<CompressionLevel> {
    match raw.to_ascii_lowercase().as_str() {
        "fast" => Ok(CompressionLevel::Fast),
        "normal" => Ok(CompressionLevel::Normal),
        "max" => Ok(CompressionLevel::Max),
        other => bail!("unknown compression level '{other}'"),
    }
}

fn parse_priority(raw: &str) -> Result<Priority> {
    match raw.to_ascii_lowercase().as_str() {
        "normal" => Ok(Priority::Normal),
        "low" => Ok(Priority::Low),
        "high" => Ok(Priority::High),
        other => bail!("unknown priority '{other}'"),
    }
}

fn parse_hashes(names: &[String]) -> Result<HashSelection> {
    if names.is_empty() {
        return Ok(HashSelection::default());
    }
    let mut selection = HashSelection {
        md5: false,
        sha1: false,
        sha256: false,
    };
    for name in names {
        match name.to_ascii_lowercase().as_str() {
            "md5" => selection.md5 = true,
            "sha1" => selection.sha1 = true,
            "sha256" => selection.sha256 = true,
            other => bail!("unknown hash algorithm '{other}'"),
        }
    }
    Ok(selection)
}

fn parse_duration(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration: {raw}"))
}

fn build_run_options(cli: &Cli) -> Result<RunOptions> {
    let temp_dir = cli
        .tempdir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let mut options = RunOptions::new(&cli.out, &temp_dir);
    options.bundle = cli.bundle.clone();
    options.hashes = parse_hashes(&cli.hash)?;
    options.tee_cleartext = cli.tee_cleartext;
    options.outcome_path = cli.outcome.clone();
    options.offline = cli.offline.clone();
    if let Some(priority) = &cli.priority {
        options.priority = parse_priority(priority)?;
    }
    if let Some(destination) = &cli.upload {
        options.upload = Some(build_upload_config(
            destination,
            cli.upload_delete,
            cli.upload_auth.as_deref(),
        )?);
    }
    Ok(options)
}

fn build_upload_config(
    destination: &str,
    delete_after: bool,
    auth: Option<&str>,
) -> Result<UploadConfig> {
    let method = if destination.starts_with("http://") || destination.starts_with("https://") {
        UploadMethod::BackgroundTransfer
    } else {
        UploadMethod::FileCopy
    };
    let auth = match auth {
        None => UploadAuth::Anonymous,
        Some(raw) => {
            let Some((username, password)) = raw.split_once(':') else {
                bail!("--upload-auth expects user:password");
            };
            UploadAuth::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }
        }
    };
    Ok(UploadConfig {
        destination: destination.to_string(),
        method,
        mode: UploadMode::Sync,
        auth,
        delete_after_upload: delete_after,
        completion_grace: Duration::from_secs(120),
    })
}

fn print_keys(plan: &CollectionPlan) {
    for archive in &plan.archives {
        println!("{}", archive.keyword);
        for command in &archive.commands {
            println!("  {}", command.keyword);
        }
    }
}

fn print_evaluated(evaluated: &magpie_plan::EvaluatedPlan) {
    println!("run_id: {}", evaluated.run_id);
    println!(
        "host: {} ({}, {}.{}, {}-bit)",
        evaluated.host.computer_name,
        evaluated.host.system_type,
        evaluated.host.os_major,
        evaluated.host.os_minor,
        evaluated.host.arch_bits
    );
    for warning in &evaluated.warnings {
        println!("warning: {warning}");
    }
    println!();

    for archive in &evaluated.archives {
        println!("{} -> {}", archive.spec.keyword, archive.archive_name);
        for command in &archive.commands {
            let disposition = match &command.disposition {
                magpie_plan::Disposition::Run => "run".to_string(),
                magpie_plan::Disposition::Skip { reason, fatal } => {
                    if *fatal {
                        format!("skip (FATAL: {reason})")
                    } else {
                        format!("skip ({reason})")
                    }
                }
            };
            println!(
                "  {:<24} {} (timeout {})",
                command.spec.keyword,
                disposition,
                humantime::format_duration(command.effective_timeout)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn cli_with(args: &[&str]) -> Cli {
        let mut argv = vec!["magpie"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn repeat_flags_are_mutually_exclusive() {
        let cli = cli_with(&["--once", "--overwrite"]);
        assert!(repeat_override(&cli).is_err());

        let cli = cli_with(&["--create-new"]);
        assert_eq!(
            repeat_override(&cli).expect("override"),
            Some(RepeatPolicy::CreateNew)
        );

        let cli = cli_with(&[]);
        assert_eq!(repeat_override(&cli).expect("override"), None);
    }

    #[test]
    fn compression_and_priority_parse() {
        assert_eq!(parse_compression("MAX").expect("parse"), CompressionLevel::Max);
        assert!(parse_compression("ultra").is_err());
        assert_eq!(parse_priority("low").expect("parse"), Priority::Low);
        assert!(parse_priority("realtime").is_err());
    }

    #[test]
    fn hash_selection_parses_csv() {
        let selection =
            parse_hashes(&["md5".to_string(), "SHA256".to_string()]).expect("parse");
        assert!(selection.md5);
        assert!(!selection.sha1);
        assert!(selection.sha256);

        assert!(parse_hashes(&["crc32".to_string()]).is_err());

        let default = parse_hashes(&[]).expect("parse");
        assert!(default.sha256);
    }

    #[test]
    fn nolimits_defaults_to_wildcard() {
        let cli = cli_with(&["--nolimits"]);
        assert_eq!(cli.no_limits, vec!["*".to_string()]);

        let cli = cli_with(&["--nolimits", "heavy,huge"]);
        assert_eq!(cli.no_limits, vec!["heavy".to_string(), "huge".to_string()]);
    }

    #[test]
    fn upload_config_selects_method_from_scheme() {
        let http = build_upload_config("https://collector/drop", false, Some("u:p"))
            .expect("config");
        assert_eq!(http.method, UploadMethod::BackgroundTransfer);
        assert!(matches!(http.auth, UploadAuth::Basic { .. }));

        let copy = build_upload_config("/mnt/evidence", true, None).expect("config");
        assert_eq!(copy.method, UploadMethod::FileCopy);
        assert!(copy.delete_after_upload);

        assert!(build_upload_config("https://x", false, Some("nocolon")).is_err());
    }

    #[test]
    fn timeout_overrides_apply_to_every_archive() {
        let doc = r#"
[[archive]]
keyword = "a"
name = "a.zip"

[[archive]]
keyword = "b"
name = "b.zip"
"#;
        let mut plan = magpie_config::parse_plan(doc).expect("parse");
        let cli = cli_with(&["--archive-timeout", "2h", "--command-timeout", "10m"]);
        apply_timeout_overrides(&mut plan, &cli).expect("override");
        for archive in &plan.archives {
            assert_eq!(archive.archive_timeout, Duration::from_secs(7200));
            assert_eq!(archive.command_timeout, Duration::from_secs(600));
        }
    }

    #[test]
    fn keys_listing_covers_plan() {
        let td = tempdir().expect("tempdir");
        let plan_path = td.path().join("magpie.toml");
        fs::write(
            &plan_path,
            r#"
[[archive]]
keyword = "triage"
name = "t.zip"

[[archive.command]]
keyword = "ps"

[archive.command.execute]
name = "ps"
run = "/bin/ps"
"#,
        )
        .expect("write");

        let plan = magpie_config::load_plan(&plan_path).expect("load");
        assert_eq!(plan.keywords(), vec!["triage".to_string(), "ps".to_string()]);
    }
}
