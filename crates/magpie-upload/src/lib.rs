//! Upload agent for magpie.
//!
//! The agent is one owning worker thread fed by a typed request channel.
//! Each request becomes an [`UploadJob`]; sync mode performs the transfer
//! inline, async mode hands it to a transport thread and reports progress
//! on `Refresh`. Individual job failures never abort siblings, and
//! post-upload deletion is attempted exactly once.
//!
//! Transports: filesystem copy (plain directories, `file://` URLs, mounted
//! UNC shares; sync-only) and HTTP(S) PUT with a HEAD probe, basic
//! authentication and retry/backoff from [`magpie_retry`].

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, Sender, unbounded};

use magpie_retry::RetryConfig;
use magpie_stream::Stream;
use magpie_types::{UploadAuth, UploadConfig, UploadJobState, UploadMethod, UploadMode};

mod transport;

use transport::{CopyTransport, HttpTransport, Transport};

/// Requests accepted by the agent.
pub enum UploadRequest {
    /// Transfer one local file to `remote_name` under the destination.
    UploadFile {
        local_path: PathBuf,
        remote_name: String,
        delete_after: bool,
    },
    /// Transfer every match of `pattern` inside `local_dir`, named
    /// `remote_prefix/<file>`.
    UploadDirectory {
        local_dir: PathBuf,
        remote_prefix: String,
        pattern: String,
        delete_after: bool,
    },
    /// Spool a stream to disk and transfer it.
    UploadStream {
        remote_name: String,
        source: Box<dyn Stream>,
    },
    /// Poll in-flight async jobs and emit progress notifications.
    Refresh,
    /// No new uploads; drain, then emit `JobComplete`.
    Complete,
    /// Best-effort abort of everything in flight.
    Cancel,
}

/// Notifications published by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadNotification {
    JobQueued {
        id: u64,
        remote_name: String,
    },
    JobStateChanged {
        id: u64,
        remote_name: String,
        state: UploadJobState,
        error: Option<String>,
    },
    /// The local source could not be removed after a successful transfer.
    DeleteFailed {
        id: u64,
        local_path: PathBuf,
        error: String,
    },
    /// Every job reached a terminal state (or the grace period lapsed).
    JobComplete,
    Cancelled,
}

/// One tracked transfer.
struct UploadJob {
    id: u64,
    local_path: PathBuf,
    remote_name: String,
    delete_after: bool,
    state: UploadJobState,
    error: Option<String>,
    /// Slot the async transport thread reports into.
    slot: Option<Arc<Mutex<(UploadJobState, Option<String>)>>>,
}

/// Handle to the upload worker.
pub struct UploadAgent {
    requests: Sender<UploadRequest>,
    notifications: Receiver<UploadNotification>,
    worker: Option<JoinHandle<()>>,
}

impl UploadAgent {
    /// Build the agent for a destination. Fails when the configuration is
    /// contradictory (file-copy is sync-only) or names an auth scheme this
    /// build cannot drive.
    pub fn spawn(config: UploadConfig, retry: RetryConfig) -> Result<Self> {
        if config.method == UploadMethod::FileCopy && config.mode == UploadMode::Async {
            bail!("file-copy destinations only support sync mode");
        }
        match &config.auth {
            UploadAuth::Anonymous | UploadAuth::Basic { .. } => {}
            other => bail!("auth scheme {other:?} is not supported by this build"),
        }

        let transport: Arc<dyn Transport> = match config.method {
            UploadMethod::FileCopy => Arc::new(CopyTransport::new(&config.destination)?),
            UploadMethod::BackgroundTransfer => {
                Arc::new(HttpTransport::new(&config.destination, config.auth.clone(), retry)?)
            }
        };

        let (req_tx, req_rx) = unbounded::<UploadRequest>();
        let (note_tx, note_rx) = unbounded::<UploadNotification>();
        let mode = config.mode;
        let grace = config.completion_grace;
        let worker =
            std::thread::spawn(move || run(req_rx, note_tx, transport, mode, grace));
        Ok(Self {
            requests: req_tx,
            notifications: note_rx,
            worker: Some(worker),
        })
    }

    pub fn send(&self, request: UploadRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|e| anyhow!("upload worker is gone: {e}"))
    }

    pub fn sender(&self) -> Sender<UploadRequest> {
        self.requests.clone()
    }

    pub fn notifications(&self) -> Receiver<UploadNotification> {
        self.notifications.clone()
    }

    /// Wait for the worker to stop (after Complete or Cancel).
    pub fn join(mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| anyhow!("upload worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for UploadAgent {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.requests.send(UploadRequest::Cancel);
            let _ = worker.join();
        }
    }
}

struct AgentState {
    jobs: Vec<UploadJob>,
    next_id: u64,
    cancel: Arc<AtomicBool>,
    spool_dir: Option<tempfile::TempDir>,
}

fn run(
    requests: Receiver<UploadRequest>,
    notes: Sender<UploadNotification>,
    transport: Arc<dyn Transport>,
    mode: UploadMode,
    grace: Duration,
) {
    let mut state = AgentState {
        jobs: Vec::new(),
        next_id: 1,
        cancel: Arc::new(AtomicBool::new(false)),
        spool_dir: None,
    };

    while let Ok(request) = requests.recv() {
        match request {
            UploadRequest::UploadFile {
                local_path,
                remote_name,
                delete_after,
            } => {
                enqueue(&mut state, &notes, &transport, mode, local_path, remote_name, delete_after);
            }
            UploadRequest::UploadDirectory {
                local_dir,
                remote_prefix,
                pattern,
                delete_after,
            } => {
                let full = local_dir.join(&pattern);
                match glob::glob(&full.to_string_lossy()) {
                    Ok(matches) => {
                        for path in matches.flatten() {
                            if !path.is_file() {
                                continue;
                            }
                            let file = path
                                .file_name()
                                .map(|f| f.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            let remote = if remote_prefix.is_empty() {
                                file
                            } else {
                                format!("{remote_prefix}/{file}")
                            };
                            enqueue(&mut state, &notes, &transport, mode, path, remote, delete_after);
                        }
                    }
                    Err(e) => {
                        let id = state.next_id;
                        state.next_id += 1;
                        let _ = notes.send(UploadNotification::JobStateChanged {
                            id,
                            remote_name: remote_prefix.clone(),
                            state: UploadJobState::Failed,
                            error: Some(format!("invalid pattern {pattern}: {e}")),
                        });
                    }
                }
            }
            UploadRequest::UploadStream {
                remote_name,
                source,
            } => match spool_stream(&mut state, source) {
                Ok(path) => {
                    enqueue(&mut state, &notes, &transport, mode, path, remote_name, true);
                }
                Err(e) => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let _ = notes.send(UploadNotification::JobStateChanged {
                        id,
                        remote_name,
                        state: UploadJobState::Failed,
                        error: Some(format!("{e:#}")),
                    });
                }
            },
            UploadRequest::Refresh => {
                poll_jobs(&mut state, &notes);
            }
            UploadRequest::Complete => {
                // Drain: poll every second until every job is terminal or
                // the grace period lapses.
                let deadline = Instant::now() + grace;
                loop {
                    poll_jobs(&mut state, &notes);
                    let pending = state.jobs.iter().any(|j| !j.state.is_terminal());
                    if !pending || Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                let _ = notes.send(UploadNotification::JobComplete);
                return;
            }
            UploadRequest::Cancel => {
                state.cancel.store(true, Ordering::SeqCst);
                let _ = notes.send(UploadNotification::Cancelled);
                return;
            }
        }
    }
}

fn enqueue(
    state: &mut AgentState,
    notes: &Sender<UploadNotification>,
    transport: &Arc<dyn Transport>,
    mode: UploadMode,
    local_path: PathBuf,
    remote_name: String,
    delete_after: bool,
) {
    let id = state.next_id;
    state.next_id += 1;
    let _ = notes.send(UploadNotification::JobQueued {
        id,
        remote_name: remote_name.clone(),
    });

    let mut job = UploadJob {
        id,
        local_path,
        remote_name,
        delete_after,
        state: UploadJobState::Queued,
        error: None,
        slot: None,
    };

    match mode {
        UploadMode::Sync => {
            job.state = UploadJobState::Active;
            match transport.put(&job.local_path, &job.remote_name) {
                Ok(()) => {
                    job.state = UploadJobState::Completed;
                    finish_job(&mut job, notes);
                }
                Err(e) => {
                    job.state = UploadJobState::Failed;
                    job.error = Some(format!("{e:#}"));
                    finish_job(&mut job, notes);
                }
            }
        }
        UploadMode::Async => {
            let slot = Arc::new(Mutex::new((UploadJobState::Active, None)));
            job.state = UploadJobState::Active;
            job.slot = Some(Arc::clone(&slot));

            let transport = Arc::clone(transport);
            let cancel = Arc::clone(&state.cancel);
            let local = job.local_path.clone();
            let remote = job.remote_name.clone();
            std::thread::spawn(move || {
                let outcome = if cancel.load(Ordering::SeqCst) {
                    Err(anyhow!("cancelled before transfer started"))
                } else {
                    transport.put(&local, &remote)
                };
                if let Ok(mut slot) = slot.lock() {
                    match outcome {
                        Ok(()) => *slot = (UploadJobState::Completed, None),
                        Err(e) => *slot = (UploadJobState::Failed, Some(format!("{e:#}"))),
                    }
                }
            });
        }
    }

    state.jobs.push(job);
}

/// Poll async slots and emit a notification for every state change. Jobs
/// that just completed run their post-upload deletion here.
fn poll_jobs(state: &mut AgentState, notes: &Sender<UploadNotification>) {
    for job in &mut state.jobs {
        if job.state.is_terminal() {
            continue;
        }
        let Some(slot) = &job.slot else { continue };
        let (new_state, error) = match slot.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => continue,
        };
        if new_state != job.state {
            job.state = new_state;
            job.error = error;
            if job.state.is_terminal() {
                finish_job(job, notes);
            }
        }
    }
}

/// Emit the terminal notification for a job, deleting the source when
/// configured. Deletion is attempted once; failure is reported but does
/// not reopen the job.
fn finish_job(job: &mut UploadJob, notes: &Sender<UploadNotification>) {
    let _ = notes.send(UploadNotification::JobStateChanged {
        id: job.id,
        remote_name: job.remote_name.clone(),
        state: job.state,
        error: job.error.clone(),
    });
    if job.state == UploadJobState::Completed && job.delete_after {
        if let Err(e) = fs::remove_file(&job.local_path) {
            let _ = notes.send(UploadNotification::DeleteFailed {
                id: job.id,
                local_path: job.local_path.clone(),
                error: e.to_string(),
            });
        }
    }
}

fn spool_stream(state: &mut AgentState, mut source: Box<dyn Stream>) -> Result<PathBuf> {
    if state.spool_dir.is_none() {
        state.spool_dir = Some(tempfile::tempdir().context("failed to create spool dir")?);
    }
    let dir = state
        .spool_dir
        .as_ref()
        .map(|d| d.path().to_path_buf())
        .unwrap_or_else(std::env::temp_dir);

    let path = dir.join(format!("spool-{}", state.next_id));
    let mut out = magpie_stream::primitives::FileStream::create(&path)?;
    magpie_stream::copy_stream(source.as_mut(), &mut out)?;
    out.close()?;
    source.close()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn copy_config(dest: &str) -> UploadConfig {
        UploadConfig {
            destination: dest.to_string(),
            method: UploadMethod::FileCopy,
            mode: UploadMode::Sync,
            auth: UploadAuth::Anonymous,
            delete_after_upload: false,
            completion_grace: Duration::from_secs(5),
        }
    }

    fn drain_until_complete(agent: &UploadAgent) -> Vec<UploadNotification> {
        let mut notes = Vec::new();
        for note in agent.notifications().iter() {
            let terminal = matches!(
                note,
                UploadNotification::JobComplete | UploadNotification::Cancelled
            );
            notes.push(note);
            if terminal {
                break;
            }
        }
        notes
    }

    #[test]
    fn file_copy_delivers_identical_bytes_and_deletes_source() {
        let td = tempfile::tempdir().expect("tempdir");
        let src = td.path().join("artifact.bin");
        let payload = vec![0x5Au8; 10 * 1024];
        fs::write(&src, &payload).expect("write");
        let dest = td.path().join("remote");

        let agent = UploadAgent::spawn(
            copy_config(&format!("file://{}", dest.display())),
            RetryConfig::default(),
        )
        .expect("spawn");
        agent
            .send(UploadRequest::UploadFile {
                local_path: src.clone(),
                remote_name: "artifact.bin".into(),
                delete_after: true,
            })
            .expect("send");
        agent.send(UploadRequest::Complete).expect("send");

        let notes = drain_until_complete(&agent);
        agent.join().expect("join");

        assert!(notes.iter().any(|n| matches!(
            n,
            UploadNotification::JobStateChanged { state: UploadJobState::Completed, .. }
        )));
        assert!(matches!(notes.last(), Some(UploadNotification::JobComplete)));
        assert_eq!(fs::read(dest.join("artifact.bin")).expect("read"), payload);
        assert!(!src.exists());
    }

    #[test]
    fn job_failure_does_not_abort_siblings() {
        let td = tempfile::tempdir().expect("tempdir");
        let good = td.path().join("good.bin");
        fs::write(&good, b"ok").expect("write");
        let dest = td.path().join("remote");

        let agent = UploadAgent::spawn(
            copy_config(&dest.display().to_string()),
            RetryConfig::default(),
        )
        .expect("spawn");
        agent
            .send(UploadRequest::UploadFile {
                local_path: td.path().join("missing.bin"),
                remote_name: "missing.bin".into(),
                delete_after: false,
            })
            .expect("send");
        agent
            .send(UploadRequest::UploadFile {
                local_path: good,
                remote_name: "good.bin".into(),
                delete_after: false,
            })
            .expect("send");
        agent.send(UploadRequest::Complete).expect("send");

        let notes = drain_until_complete(&agent);
        agent.join().expect("join");

        assert!(notes.iter().any(|n| matches!(
            n,
            UploadNotification::JobStateChanged { state: UploadJobState::Failed, remote_name, .. }
                if remote_name == "missing.bin"
        )));
        assert!(dest.join("good.bin").exists());
    }

    #[test]
    fn directory_upload_respects_pattern() {
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path().join("artifacts");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("a.zip"), b"a").expect("write");
        fs::write(dir.join("b.zip"), b"b").expect("write");
        fs::write(dir.join("notes.txt"), b"n").expect("write");
        let dest = td.path().join("remote");

        let agent = UploadAgent::spawn(
            copy_config(&dest.display().to_string()),
            RetryConfig::default(),
        )
        .expect("spawn");
        agent
            .send(UploadRequest::UploadDirectory {
                local_dir: dir,
                remote_prefix: "run1".into(),
                pattern: "*.zip".into(),
                delete_after: false,
            })
            .expect("send");
        agent.send(UploadRequest::Complete).expect("send");
        drain_until_complete(&agent);
        agent.join().expect("join");

        assert!(dest.join("run1/a.zip").exists());
        assert!(dest.join("run1/b.zip").exists());
        assert!(!dest.join("run1/notes.txt").exists());
    }

    #[test]
    fn stream_upload_spools_and_delivers() {
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("remote");

        let agent = UploadAgent::spawn(
            copy_config(&dest.display().to_string()),
            RetryConfig::default(),
        )
        .expect("spawn");
        agent
            .send(UploadRequest::UploadStream {
                remote_name: "streamed.bin".into(),
                source: Box::new(magpie_stream::primitives::MemoryStream::new(
                    b"streamed payload".to_vec(),
                )),
            })
            .expect("send");
        agent.send(UploadRequest::Complete).expect("send");
        drain_until_complete(&agent);
        agent.join().expect("join");

        assert_eq!(
            fs::read(dest.join("streamed.bin")).expect("read"),
            b"streamed payload"
        );
    }

    #[test]
    fn file_copy_rejects_async_mode() {
        let mut config = copy_config("/tmp/nowhere");
        config.mode = UploadMode::Async;
        assert!(UploadAgent::spawn(config, RetryConfig::default()).is_err());
    }

    #[test]
    fn unsupported_auth_is_rejected_at_construction() {
        let mut config = copy_config("/tmp/nowhere");
        config.auth = UploadAuth::Ntlm;
        assert!(UploadAgent::spawn(config, RetryConfig::default()).is_err());
    }

    #[test]
    fn http_upload_hits_server_with_retries() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let addr = server.server_addr().to_string();
        let received = Arc::new(Mutex::new(Vec::<(String, String, Vec<u8>)>::new()));
        let received_clone = Arc::clone(&received);

        let handler = std::thread::spawn(move || {
            // HEAD probe answers 404, then the PUT is accepted.
            for _ in 0..2 {
                let Ok(mut request) = server.recv() else { return };
                let method = request.method().to_string();
                let url = request.url().to_string();
                let mut body = Vec::new();
                let _ = request.as_reader().read_to_end(&mut body);
                let status = if method == "HEAD" { 404 } else { 201 };
                received_clone
                    .lock()
                    .expect("received")
                    .push((method, url, body));
                let _ = request.respond(tiny_http::Response::empty(status));
            }
        });

        let config = UploadConfig {
            destination: format!("http://{addr}/drop"),
            method: UploadMethod::BackgroundTransfer,
            mode: UploadMode::Sync,
            auth: UploadAuth::Basic {
                username: "collector".into(),
                password: "s3cret".into(),
            },
            delete_after_upload: false,
            completion_grace: Duration::from_secs(5),
        };

        let td = tempfile::tempdir().expect("tempdir");
        let src = td.path().join("up.bin");
        fs::write(&src, b"http payload").expect("write");

        let agent = UploadAgent::spawn(config, RetryConfig::default()).expect("spawn");
        agent
            .send(UploadRequest::UploadFile {
                local_path: src,
                remote_name: "up.bin".into(),
                delete_after: false,
            })
            .expect("send");
        agent.send(UploadRequest::Complete).expect("send");
        let notes = drain_until_complete(&agent);
        agent.join().expect("join");
        handler.join().expect("handler");

        assert!(notes.iter().any(|n| matches!(
            n,
            UploadNotification::JobStateChanged { state: UploadJobState::Completed, .. }
        )));
        let received = received.lock().expect("received");
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, "HEAD");
        assert_eq!(received[1].0, "PUT");
        assert_eq!(received[1].1, "/drop/up.bin");
        assert_eq!(received[1].2, b"http payload");
    }
}
