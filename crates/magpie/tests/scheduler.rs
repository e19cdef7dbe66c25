//! End-to-end scheduler scenarios with real child processes.

#![cfg(unix)]

use std::fs::File;
use std::io::Read;
use std::time::Duration;

use magpie::engine::RunOptions;
use magpie::reporter::MemoryReporter;
use magpie::{ShutdownToken, run_plan};
use magpie_plan::{EvalOptions, evaluate};
use magpie_types::{
    ArchiveSpec, ArchiveState, CollectionPlan, CommandSpec, CommandState, ExecutableRef,
    ExecutableSpec, HostFacts, OutputKind, OutputSpec, QueueBehavior, ResourceFormat, ResourceRef,
};

fn host() -> HostFacts {
    HostFacts {
        computer_name: "TESTHOST".to_string(),
        full_computer_name: "testhost.local".to_string(),
        system_type: "workstation".to_string(),
        os_major: 6,
        os_minor: 0,
        arch_bits: 64,
        tags: Default::default(),
    }
}

fn shell_command(keyword: &str, script: &str) -> CommandSpec {
    CommandSpec {
        keyword: keyword.to_string(),
        optional: false,
        queue: QueueBehavior::Enqueue,
        required_os: None,
        required_system_type: None,
        timeout: None,
        executable: ExecutableSpec::single(
            "sh",
            ExecutableRef::Path {
                path: "/bin/sh".to_string(),
            },
        ),
        arguments: vec!["-c".to_string(), script.to_string()],
        inputs: vec![],
        outputs: vec![],
    }
}

fn stdout_output(name: &str) -> OutputSpec {
    OutputSpec {
        order: 0,
        name: name.to_string(),
        kind: OutputKind::StdOut,
        argument: None,
    }
}

fn run(
    plan: &CollectionPlan,
    configure: impl FnOnce(&mut RunOptions),
) -> (magpie_types::RunOutcome, tempfile::TempDir) {
    let td = tempfile::tempdir().expect("tempdir");
    let out_dir = td.path().join("out");
    let mut options = RunOptions::new(&out_dir, &td.path().join("tmp"));
    configure(&mut options);

    let evaluated = evaluate(plan, &host(), &EvalOptions::default());
    let mut reporter = MemoryReporter::default();
    let outcome = run_plan(&evaluated, &options, &ShutdownToken::new(), &mut reporter)
        .expect("run_plan");
    (outcome, td)
}

fn zip_entry_bytes(archive_path: &str, entry: &str) -> Vec<u8> {
    let mut archive =
        zip::ZipArchive::new(File::open(archive_path).expect("open archive")).expect("zip");
    let mut file = archive.by_name(entry).expect("entry");
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).expect("read entry");
    bytes
}

#[test]
fn stdout_capture_lands_in_archive_with_digest() {
    let mut archive = ArchiveSpec::named("single", "single.zip");
    let mut cmd = shell_command("hello", "printf hello");
    cmd.outputs.push(stdout_output("hello.txt"));
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let (outcome, _td) = run(&plan, |_| {});

    let archive = &outcome.archives[0];
    assert_eq!(archive.state, ArchiveState::Completed);
    let command = &archive.commands[0];
    assert_eq!(command.state, CommandState::Completed);
    assert_eq!(command.exit_code, Some(0));

    let path = archive.path.as_deref().expect("archive path");
    assert_eq!(zip_entry_bytes(path, "hello.txt"), b"hello");

    // SHA-256 of ASCII "hello", computed by the entry hasher.
    let digest = &command.outputs[0];
    assert_eq!(digest.name, "hello.txt");
    assert_eq!(digest.size, 5);
    assert_eq!(
        digest.digests.sha256.as_deref(),
        Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );
}

#[test]
fn zero_output_child_still_produces_entry() {
    let mut archive = ArchiveSpec::named("empty", "empty.zip");
    let mut cmd = shell_command("silent", "true");
    cmd.outputs.push(stdout_output("silent.txt"));
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let (outcome, _td) = run(&plan, |_| {});
    let archive = &outcome.archives[0];
    let path = archive.path.as_deref().expect("archive path");
    assert_eq!(zip_entry_bytes(path, "silent.txt"), b"");
    assert_eq!(archive.commands[0].outputs[0].size, 0);
}

#[test]
fn flush_queue_is_a_barrier() {
    let mut archive = ArchiveSpec::named("barrier", "barrier.zip");
    archive.concurrency_cap = 2;

    let mut c1 = shell_command("c1", "sleep 0.4; printf c1");
    c1.outputs.push(stdout_output("c1.out"));
    let mut c2 = shell_command("c2", "sleep 0.4; printf c2");
    c2.outputs.push(stdout_output("c2.out"));
    let mut cf = shell_command("cf", "printf cf");
    cf.queue = QueueBehavior::FlushQueue;
    cf.outputs.push(stdout_output("cf.out"));
    let mut c3 = shell_command("c3", "printf c3");
    c3.outputs.push(stdout_output("c3.out"));
    archive.commands = vec![c1, c2, cf, c3];

    let plan = CollectionPlan {
        archives: vec![archive],
    };
    let (outcome, _td) = run(&plan, |_| {});

    let commands = &outcome.archives[0].commands;
    let find = |k: &str| {
        commands
            .iter()
            .find(|c| c.keyword == k)
            .unwrap_or_else(|| panic!("missing {k}"))
    };
    let (c1, c2, cf, c3) = (find("c1"), find("c2"), find("cf"), find("c3"));
    for c in [c1, c2, cf, c3] {
        assert_eq!(c.state, CommandState::Completed, "{}", c.keyword);
    }

    // The barrier starts only after its predecessors finish, and its
    // successor only after the barrier finishes.
    let cf_start = cf.started_at.expect("cf start");
    assert!(cf_start >= c1.finished_at.expect("c1 end"));
    assert!(cf_start >= c2.finished_at.expect("c2 end"));
    assert!(c3.started_at.expect("c3 start") >= cf.finished_at.expect("cf end"));
}

#[test]
fn timeout_keeps_partial_output_and_fails_the_run() {
    let mut archive = ArchiveSpec::named("deadline", "deadline.zip");
    let mut cmd = shell_command("sleeper", "printf partial; sleep 30");
    cmd.timeout = Some(Duration::from_secs(1));
    cmd.outputs.push(stdout_output("sleeper.out"));
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let started = std::time::Instant::now();
    let (outcome, _td) = run(&plan, |_| {});
    // Deadline plus reaping grace, nowhere near the 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(10));

    let archive = &outcome.archives[0];
    assert_eq!(archive.state, ArchiveState::Completed);
    let command = &archive.commands[0];
    assert_eq!(command.state, CommandState::TimedOut);
    assert_eq!(
        command.error_kind,
        Some(magpie_types::CollectErrorKind::Timeout)
    );

    // The partial capture still made it into the archive.
    let path = archive.path.as_deref().expect("archive path");
    assert_eq!(zip_entry_bytes(path, "sleeper.out"), b"partial");

    // A mandatory command timed out: the run is not a success.
    assert!(!outcome.success());
}

#[test]
fn optional_timeout_does_not_fail_the_run() {
    let mut archive = ArchiveSpec::named("soft", "soft.zip");
    let mut cmd = shell_command("softsleep", "sleep 30");
    cmd.optional = true;
    cmd.timeout = Some(Duration::from_secs(1));
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let (outcome, _td) = run(&plan, |_| {});
    assert_eq!(outcome.archives[0].commands[0].state, CommandState::TimedOut);
    assert!(outcome.success());
}

#[test]
fn embedded_executable_resolves_runs_and_cleans_up() {
    // Build a side bundle carrying the helper script.
    let script = "#!/bin/sh\nprintf embedded-ran\n";
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(script.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, "helper.sh", script.as_bytes())
        .expect("append");
    let bundle = builder.into_inner().expect("bundle");

    let td = tempfile::tempdir().expect("tempdir");
    let bundle_path = td.path().join("tools.tar");
    std::fs::write(&bundle_path, bundle).expect("write bundle");

    let mut archive = ArchiveSpec::named("embedded", "embedded.zip");
    let mut cmd = CommandSpec {
        keyword: "helper".to_string(),
        optional: false,
        queue: QueueBehavior::Enqueue,
        required_os: None,
        required_system_type: None,
        timeout: None,
        executable: ExecutableSpec::single(
            "helper",
            ExecutableRef::Embedded(ResourceRef {
                module: "self".to_string(),
                name: "helper.sh".to_string(),
                inner: None,
                format: ResourceFormat::Binary,
            }),
        ),
        arguments: vec![],
        inputs: vec![],
        outputs: vec![],
    };
    cmd.outputs.push(stdout_output("helper.out"));
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let out_dir = td.path().join("out");
    let tmp_dir = td.path().join("tmp");
    let mut options = RunOptions::new(&out_dir, &tmp_dir);
    options.bundle = Some(bundle_path);

    let evaluated = evaluate(&plan, &host(), &EvalOptions::default());
    let mut reporter = MemoryReporter::default();
    let outcome = run_plan(&evaluated, &options, &ShutdownToken::new(), &mut reporter)
        .expect("run_plan");

    let archive = &outcome.archives[0];
    assert_eq!(archive.state, ArchiveState::Completed);
    let path = archive.path.as_deref().expect("archive path");
    assert_eq!(zip_entry_bytes(path, "helper.out"), b"embedded-ran");

    // The scratch subtree (including the extracted helper) is gone.
    assert!(!tmp_dir.join("WorkingTemp").join(&outcome.run_id).exists());
}

#[test]
fn file_output_is_harvested_after_exit() {
    let mut archive = ArchiveSpec::named("filecap", "filecap.tar");
    let mut cmd = shell_command("writer", "printf file-bytes > produced.bin");
    cmd.outputs.push(OutputSpec {
        order: 0,
        name: "produced.bin".to_string(),
        kind: OutputKind::File,
        argument: None,
    });
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let (outcome, _td) = run(&plan, |_| {});
    let archive = &outcome.archives[0];
    assert_eq!(archive.state, ArchiveState::Completed);

    let path = archive.path.as_deref().expect("archive path");
    let mut tar = tar::Archive::new(File::open(path).expect("open"));
    let mut entries = tar.entries().expect("entries");
    let mut entry = entries.next().expect("entry").expect("entry");
    assert_eq!(
        entry.path().expect("path").to_string_lossy(),
        "produced.bin"
    );
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).expect("read");
    assert_eq!(bytes, b"file-bytes");
}

#[test]
fn directory_output_harvests_matching_files() {
    let mut archive = ArchiveSpec::named("dircap", "dircap.zip");
    let mut cmd = shell_command(
        "logger",
        "printf one > logs/a.log; printf two > logs/b.log; printf no > logs/skip.txt",
    );
    cmd.outputs.push(OutputSpec {
        order: 0,
        name: "logs".to_string(),
        kind: OutputKind::Directory {
            pattern: "*.log".to_string(),
        },
        argument: None,
    });
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let (outcome, _td) = run(&plan, |_| {});
    let archive = &outcome.archives[0];
    assert_eq!(archive.state, ArchiveState::Completed);

    let path = archive.path.as_deref().expect("archive path");
    let mut zip = zip::ZipArchive::new(File::open(path).expect("open")).expect("zip");
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).expect("entry").name().to_string())
        .collect();
    assert!(names.contains(&"logs/a.log".to_string()));
    assert!(names.contains(&"logs/b.log".to_string()));
    assert!(!names.iter().any(|n| n.contains("skip.txt")));
}

#[test]
fn mandatory_launch_failure_fails_the_archive() {
    let mut archive = ArchiveSpec::named("broken", "broken.zip");
    let mut cmd = shell_command("ghost", "true");
    cmd.executable = ExecutableSpec::single(
        "ghost",
        ExecutableRef::Path {
            path: "/nonexistent/tool-that-is-not-there".to_string(),
        },
    );
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let (outcome, _td) = run(&plan, |_| {});
    let archive = &outcome.archives[0];
    assert_eq!(archive.state, ArchiveState::Failed);
    assert_eq!(archive.commands[0].state, CommandState::Failed);
    assert!(!outcome.success());
}

#[test]
fn optional_archives_do_not_fail_the_run() {
    let mut archive = ArchiveSpec::named("softarchive", "softarchive.zip");
    archive.optional = true;
    let mut cmd = shell_command("ghost", "true");
    cmd.executable = ExecutableSpec::single(
        "ghost",
        ExecutableRef::Path {
            path: "/nonexistent/tool".to_string(),
        },
    );
    archive.commands.push(cmd);
    let plan = CollectionPlan {
        archives: vec![archive],
    };

    let (outcome, _td) = run(&plan, |_| {});
    assert_eq!(outcome.archives[0].state, ArchiveState::Failed);
    assert!(outcome.success());
}
