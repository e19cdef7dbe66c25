//! Resource containers: collective memory and CPU-time limits for the
//! children of one archive.
//!
//! The abstraction mirrors an OS job object: create with limits, attach
//! children, terminate the lot. The portable implementation polls
//! `/proc/<pid>` on Linux and degrades to wall-clock-only enforcement
//! elsewhere (the scheduler owns wall-clock deadlines either way). A
//! tripped cap is reported as a violation so the scheduler can record
//! `LimitViolation` rather than `Timeout`, whatever the timing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use magpie_types::ResourceLimits;

/// Which cap a container enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    ProcessMemory,
    JobMemory,
    ProcessCpu,
    JobCpu,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::ProcessMemory => "per-process memory cap",
            ViolationKind::JobMemory => "job memory cap",
            ViolationKind::ProcessCpu => "per-process cpu-time cap",
            ViolationKind::JobCpu => "job cpu-time cap",
        };
        f.write_str(s)
    }
}

/// An OS-level grouping enforcing collective limits on attached children.
pub trait ResourceContainer: Send {
    /// Put a child under the container's limits.
    fn attach(&mut self, pid: u32) -> Result<()>;

    /// The cap that tripped, if any. Once set it stays set.
    fn violation(&self) -> Option<ViolationKind>;

    /// Kill everything attached. Idempotent.
    fn terminate_all(&mut self);

    /// Stop enforcement; terminates first when not already done.
    fn close(&mut self);
}

/// Build a container for `limits`. All-`None` limits get a no-op container.
pub fn create(limits: &ResourceLimits) -> Box<dyn ResourceContainer> {
    if limits.is_unlimited() {
        Box::new(NullContainer::default())
    } else {
        Box::new(PollingContainer::start(limits.clone()))
    }
}

/// Container for unlimited archives: tracks pids only so `terminate_all`
/// still works.
#[derive(Default)]
struct NullContainer {
    pids: Vec<u32>,
    terminated: bool,
}

impl ResourceContainer for NullContainer {
    fn attach(&mut self, pid: u32) -> Result<()> {
        self.pids.push(pid);
        Ok(())
    }

    fn violation(&self) -> Option<ViolationKind> {
        None
    }

    fn terminate_all(&mut self) {
        if !self.terminated {
            self.terminated = true;
            for pid in &self.pids {
                if is_our_child(*pid) {
                    kill_tree(*pid);
                }
            }
        }
    }

    fn close(&mut self) {
        self.terminate_all();
    }
}

struct Shared {
    pids: Mutex<Vec<u32>>,
    violation: Mutex<Option<ViolationKind>>,
    stop: AtomicBool,
}

/// Polling enforcement over `/proc`.
struct PollingContainer {
    shared: Arc<Shared>,
    monitor: Option<std::thread::JoinHandle<()>>,
    terminated: bool,
}

impl PollingContainer {
    fn start(limits: ResourceLimits) -> Self {
        let shared = Arc::new(Shared {
            pids: Mutex::new(Vec::new()),
            violation: Mutex::new(None),
            stop: AtomicBool::new(false),
        });
        let monitor_shared = Arc::clone(&shared);
        let monitor = std::thread::spawn(move || monitor_loop(monitor_shared, limits));
        Self {
            shared,
            monitor: Some(monitor),
            terminated: false,
        }
    }
}

impl ResourceContainer for PollingContainer {
    fn attach(&mut self, pid: u32) -> Result<()> {
        if let Ok(mut pids) = self.shared.pids.lock() {
            pids.push(pid);
        }
        Ok(())
    }

    fn violation(&self) -> Option<ViolationKind> {
        self.shared.violation.lock().ok().and_then(|v| *v)
    }

    fn terminate_all(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Ok(pids) = self.shared.pids.lock() {
            for pid in pids.iter() {
                if is_our_child(*pid) {
                    kill_tree(*pid);
                }
            }
        }
    }

    fn close(&mut self) {
        self.terminate_all();
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            monitor.join().ok();
        }
    }
}

impl Drop for PollingContainer {
    fn drop(&mut self) {
        self.close();
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn monitor_loop(shared: Arc<Shared>, limits: ResourceLimits) {
    while !shared.stop.load(Ordering::SeqCst) {
        let pids: Vec<u32> = shared
            .pids
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default();

        if let Some(kind) = sample_violation(&pids, &limits) {
            if let Ok(mut slot) = shared.violation.lock() {
                slot.get_or_insert(kind);
            }
            for pid in &pids {
                if is_our_child(*pid) {
                    kill_tree(*pid);
                }
            }
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn sample_violation(pids: &[u32], limits: &ResourceLimits) -> Option<ViolationKind> {
    let mut job_rss = 0u64;
    let mut job_cpu = Duration::ZERO;

    for pid in pids {
        let Some(sample) = sample_process(*pid) else {
            continue;
        };
        job_rss += sample.rss_bytes;
        job_cpu += sample.cpu_time;

        if let Some(cap) = limits.process_memory_bytes {
            if sample.rss_bytes > cap {
                return Some(ViolationKind::ProcessMemory);
            }
        }
        if let Some(cap) = limits.per_process_cpu_time {
            if sample.cpu_time > cap {
                return Some(ViolationKind::ProcessCpu);
            }
        }
    }

    if let Some(cap) = limits.job_memory_bytes {
        if job_rss > cap {
            return Some(ViolationKind::JobMemory);
        }
    }
    if let Some(cap) = limits.per_job_cpu_time {
        if job_cpu > cap {
            return Some(ViolationKind::JobCpu);
        }
    }
    None
}

struct ProcessSample {
    rss_bytes: u64,
    cpu_time: Duration,
}

#[cfg(target_os = "linux")]
fn sample_process(pid: u32) -> Option<ProcessSample> {
    // Default Linux clock tick; sysconf is not reachable without FFI.
    const TICKS_PER_SEC: u64 = 100;

    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let rss_kb: u64 = status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesised comm; utime and stime are the 12th and
    // 13th of those.
    let after_comm = stat.rsplit_once(')').map(|(_, rest)| rest)?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);

    Some(ProcessSample {
        rss_bytes: rss_kb * 1024,
        cpu_time: Duration::from_millis((utime + stime) * 1000 / TICKS_PER_SEC),
    })
}

#[cfg(not(target_os = "linux"))]
fn sample_process(_pid: u32) -> Option<ProcessSample> {
    None
}

/// Whether `pid` is still a live direct child of this process. A pid left
/// behind by an already-reaped child may have been reused; killing it
/// would hit an innocent process.
#[cfg(target_os = "linux")]
fn is_our_child(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let Some((_, rest)) = stat.rsplit_once(')') else {
        return false;
    };
    rest.split_whitespace()
        .nth(1)
        .and_then(|p| p.parse::<u32>().ok())
        == Some(std::process::id())
}

#[cfg(not(target_os = "linux"))]
fn is_our_child(_pid: u32) -> bool {
    true
}

/// Kill `pid` and every process descended from it.
///
/// Children of a killed tool would otherwise outlive it holding the
/// capture pipes open; a job object would take the whole tree down, so the
/// portable path must too. Descendants are discovered via `/proc` on Linux
/// and killed leaves-first.
pub fn kill_tree(pid: u32) {
    for victim in descendants(pid).into_iter().rev() {
        kill_pid(victim);
    }
    kill_pid(pid);
}

#[cfg(target_os = "linux")]
fn descendants(root: u32) -> Vec<u32> {
    let mut children: std::collections::HashMap<u32, Vec<u32>> = std::collections::HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
                continue;
            };
            let Some((_, rest)) = stat.rsplit_once(')') else {
                continue;
            };
            if let Some(ppid) = rest
                .split_whitespace()
                .nth(1)
                .and_then(|p| p.parse::<u32>().ok())
            {
                children.entry(ppid).or_default().push(pid);
            }
        }
    }

    // Breadth-first from the root; reversing gives leaves-first kill order.
    let mut ordered = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        if let Some(kids) = children.get(&parent) {
            for kid in kids {
                ordered.push(*kid);
                frontier.push(*kid);
            }
        }
    }
    ordered
}

#[cfg(not(target_os = "linux"))]
fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status();
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status();
}
