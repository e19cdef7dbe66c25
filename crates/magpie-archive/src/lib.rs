//! Archive builder agent for magpie.
//!
//! One owning worker thread consumes a typed request channel and serialises
//! everything into a single container file, publishing lifecycle
//! notifications on its way. Requests are processed strictly in FIFO order,
//! so the notification order per archive equals the request order - the
//! property the scheduler and the outcome writer lean on.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use magpie_archive::{ArchiveAgent, ArchiveRequest, OpenRequest};
//! use magpie_types::{CompressionLevel, HashSelection};
//!
//! let agent = ArchiveAgent::spawn();
//! agent
//!     .send(ArchiveRequest::Open(OpenRequest {
//!         path: PathBuf::from("collection.zip"),
//!         format: None,
//!         compression: CompressionLevel::Normal,
//!         password: None,
//!         hashes: HashSelection::default(),
//!     }))
//!     .expect("send");
//! agent
//!     .send(ArchiveRequest::AddFile {
//!         name: "hosts".into(),
//!         source: PathBuf::from("/etc/hosts"),
//!         delete_after_flush: false,
//!     })
//!     .expect("send");
//! agent.send(ArchiveRequest::Complete).expect("send");
//! for note in agent.notifications().iter() {
//!     println!("{note:?}");
//! }
//! ```

use std::fs;
use std::path::PathBuf;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};

use magpie_stream::hash::HashStream;
use magpie_stream::primitives::FileStream;
use magpie_stream::{ReadAdapter, Stream};
use magpie_types::{ArchiveFormat, CompressionLevel, DigestSet, HashSelection};

pub mod backend;

use backend::ContainerWriter;

/// Parameters of the `Open` request.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Output path of the container.
    pub path: PathBuf,
    /// Explicit format; derived from the extension when `None`.
    pub format: Option<ArchiveFormat>,
    pub compression: CompressionLevel,
    pub password: Option<String>,
    /// Digests computed per entry and published in `FileAdded`.
    pub hashes: HashSelection,
}

/// Requests accepted by the builder, processed strictly in FIFO order.
pub enum ArchiveRequest {
    /// Open the container. Only legal as the first request.
    Open(OpenRequest),
    /// Append the file at `source` under `name`.
    AddFile {
        name: String,
        source: PathBuf,
        delete_after_flush: bool,
    },
    /// Append the bytes of a stream under `name`.
    AddStream {
        name: String,
        source: Box<dyn Stream>,
    },
    /// Append every non-directory match of `pattern` inside `source_dir`
    /// as `name/<file>`, then report `DirectoryAdded`.
    AddDirectory {
        name: String,
        source_dir: PathBuf,
        pattern: String,
        delete_after_flush: bool,
    },
    /// Barrier: attempt pending source deletions, then acknowledge. The
    /// archive stays open.
    FlushQueue,
    /// Finalise the container and stop the worker.
    Complete,
    /// Abandon the archive and stop the worker.
    Cancel,
}

impl std::fmt::Debug for ArchiveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveRequest::Open(req) => f.debug_tuple("Open").field(&req.path).finish(),
            ArchiveRequest::AddFile { name, source, .. } => f
                .debug_struct("AddFile")
                .field("name", name)
                .field("source", source)
                .finish(),
            ArchiveRequest::AddStream { name, .. } => {
                f.debug_struct("AddStream").field("name", name).finish()
            }
            ArchiveRequest::AddDirectory { name, pattern, .. } => f
                .debug_struct("AddDirectory")
                .field("name", name)
                .field("pattern", pattern)
                .finish(),
            ArchiveRequest::FlushQueue => f.write_str("FlushQueue"),
            ArchiveRequest::Complete => f.write_str("Complete"),
            ArchiveRequest::Cancel => f.write_str("Cancel"),
        }
    }
}

/// Notifications published by the builder, one per processed request
/// (plus one `FileAdded` per directory match).
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveNotification {
    Started {
        path: PathBuf,
    },
    FileAdded {
        name: String,
        size: u64,
        digests: DigestSet,
    },
    FileAddFailed {
        name: String,
        reason: String,
    },
    DirectoryAdded {
        name: String,
        files: usize,
    },
    QueueFlushed,
    Completed {
        final_size: u64,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

/// Handle to the builder worker. Dropping the handle cancels the worker.
pub struct ArchiveAgent {
    requests: Sender<ArchiveRequest>,
    notifications: Receiver<ArchiveNotification>,
    worker: Option<JoinHandle<()>>,
}

impl ArchiveAgent {
    /// Start the worker thread. The archive itself opens on the first
    /// [`ArchiveRequest::Open`].
    pub fn spawn() -> Self {
        let (req_tx, req_rx) = unbounded::<ArchiveRequest>();
        let (note_tx, note_rx) = unbounded::<ArchiveNotification>();
        let worker = std::thread::spawn(move || run(req_rx, note_tx));
        Self {
            requests: req_tx,
            notifications: note_rx,
            worker: Some(worker),
        }
    }

    /// Enqueue a request.
    pub fn send(&self, request: ArchiveRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|e| anyhow!("archive worker is gone: {e}"))
    }

    /// A clonable sender for the request channel.
    pub fn sender(&self) -> Sender<ArchiveRequest> {
        self.requests.clone()
    }

    /// The notification channel.
    pub fn notifications(&self) -> Receiver<ArchiveNotification> {
        self.notifications.clone()
    }

    /// Wait for the worker to stop (it stops after Complete or Cancel).
    pub fn join(mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("archive worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ArchiveAgent {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.requests.send(ArchiveRequest::Cancel);
            let _ = worker.join();
        }
    }
}

struct OpenedArchive {
    writer: Box<dyn ContainerWriter>,
    hashes: HashSelection,
    pending_delete: Vec<PathBuf>,
}

enum BuilderState {
    Idle,
    Accepting(OpenedArchive),
    Failed(String),
}

fn run(requests: Receiver<ArchiveRequest>, notes: Sender<ArchiveNotification>) {
    let mut state = BuilderState::Idle;

    while let Ok(request) = requests.recv() {
        state = match (state, request) {
            (BuilderState::Idle, ArchiveRequest::Open(open)) => match backend::open_writer(
                &open.path,
                open.format,
                open.compression,
                open.password.as_deref(),
            ) {
                Ok(writer) => {
                    let _ = notes.send(ArchiveNotification::Started {
                        path: open.path.clone(),
                    });
                    BuilderState::Accepting(OpenedArchive {
                        writer,
                        hashes: open.hashes,
                        pending_delete: Vec::new(),
                    })
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    let _ = notes.send(ArchiveNotification::Failed {
                        reason: reason.clone(),
                    });
                    BuilderState::Failed(reason)
                }
            },
            (BuilderState::Idle, ArchiveRequest::Cancel) => {
                let _ = notes.send(ArchiveNotification::Cancelled);
                return;
            }
            (BuilderState::Idle, other) => {
                let _ = notes.send(ArchiveNotification::Failed {
                    reason: format!("archive is not open (got {other:?})"),
                });
                BuilderState::Idle
            }

            (BuilderState::Accepting(mut archive), ArchiveRequest::AddFile {
                name,
                source,
                delete_after_flush,
            }) => {
                match add_file(&mut archive, &name, &source) {
                    Ok(note) => {
                        if delete_after_flush {
                            archive.pending_delete.push(source);
                        }
                        let _ = notes.send(note);
                    }
                    Err(e) => {
                        let _ = notes.send(ArchiveNotification::FileAddFailed {
                            name,
                            reason: format!("{e:#}"),
                        });
                    }
                }
                BuilderState::Accepting(archive)
            }
            (BuilderState::Accepting(mut archive), ArchiveRequest::AddStream { name, source }) => {
                match add_stream(&mut archive, &name, source) {
                    Ok(note) => {
                        let _ = notes.send(note);
                    }
                    Err(e) => {
                        let _ = notes.send(ArchiveNotification::FileAddFailed {
                            name,
                            reason: format!("{e:#}"),
                        });
                    }
                }
                BuilderState::Accepting(archive)
            }
            (BuilderState::Accepting(mut archive), ArchiveRequest::AddDirectory {
                name,
                source_dir,
                pattern,
                delete_after_flush,
            }) => {
                match enumerate_matches(&source_dir, &pattern) {
                    Ok(files) => {
                        let mut added = 0usize;
                        for file in files {
                            let entry_name = match file.file_name() {
                                Some(f) => format!("{}/{}", name, f.to_string_lossy()),
                                None => continue,
                            };
                            match add_file(&mut archive, &entry_name, &file) {
                                Ok(note) => {
                                    added += 1;
                                    if delete_after_flush {
                                        archive.pending_delete.push(file);
                                    }
                                    let _ = notes.send(note);
                                }
                                Err(e) => {
                                    let _ = notes.send(ArchiveNotification::FileAddFailed {
                                        name: entry_name,
                                        reason: format!("{e:#}"),
                                    });
                                }
                            }
                        }
                        let _ = notes.send(ArchiveNotification::DirectoryAdded {
                            name,
                            files: added,
                        });
                    }
                    Err(e) => {
                        let _ = notes.send(ArchiveNotification::FileAddFailed {
                            name,
                            reason: format!("{e:#}"),
                        });
                    }
                }
                BuilderState::Accepting(archive)
            }
            (BuilderState::Accepting(mut archive), ArchiveRequest::FlushQueue) => {
                attempt_deletions(&mut archive.pending_delete);
                let _ = notes.send(ArchiveNotification::QueueFlushed);
                BuilderState::Accepting(archive)
            }
            (BuilderState::Accepting(mut archive), ArchiveRequest::Complete) => {
                attempt_deletions(&mut archive.pending_delete);
                match archive.writer.finish() {
                    Ok(final_size) => {
                        let _ = notes.send(ArchiveNotification::Completed { final_size });
                    }
                    Err(e) => {
                        let _ = notes.send(ArchiveNotification::Failed {
                            reason: format!("{e:#}"),
                        });
                    }
                }
                return;
            }
            (BuilderState::Accepting(_), ArchiveRequest::Cancel) => {
                let _ = notes.send(ArchiveNotification::Cancelled);
                return;
            }
            (BuilderState::Accepting(archive), ArchiveRequest::Open(_)) => {
                let _ = notes.send(ArchiveNotification::Failed {
                    reason: "archive is already open".to_string(),
                });
                BuilderState::Accepting(archive)
            }

            // From Failed only Cancel and Complete make progress; both are
            // terminal. Adds are answered so senders never hang on a reply.
            (BuilderState::Failed(_), ArchiveRequest::Complete)
            | (BuilderState::Failed(_), ArchiveRequest::Cancel) => {
                let _ = notes.send(ArchiveNotification::Cancelled);
                return;
            }
            (BuilderState::Failed(reason), ArchiveRequest::AddFile { name, .. })
            | (BuilderState::Failed(reason), ArchiveRequest::AddStream { name, .. })
            | (BuilderState::Failed(reason), ArchiveRequest::AddDirectory { name, .. }) => {
                let _ = notes.send(ArchiveNotification::FileAddFailed {
                    name,
                    reason: reason.clone(),
                });
                BuilderState::Failed(reason)
            }
            (BuilderState::Failed(reason), _) => {
                let _ = notes.send(ArchiveNotification::Failed {
                    reason: reason.clone(),
                });
                BuilderState::Failed(reason)
            }
        };
    }
}

fn add_file(
    archive: &mut OpenedArchive,
    name: &str,
    source: &std::path::Path,
) -> Result<ArchiveNotification> {
    let file = FileStream::open(source)?;
    add_stream_inner(archive, name, Box::new(file))
}

fn add_stream(
    archive: &mut OpenedArchive,
    name: &str,
    source: Box<dyn Stream>,
) -> Result<ArchiveNotification> {
    add_stream_inner(archive, name, source)
}

fn add_stream_inner(
    archive: &mut OpenedArchive,
    name: &str,
    source: Box<dyn Stream>,
) -> Result<ArchiveNotification> {
    let mut hashed = HashStream::new(source, archive.hashes);
    let mut adapter = ReadAdapter(&mut hashed);
    let size = archive
        .writer
        .add_entry(name, &mut adapter)
        .with_context(|| format!("failed to add entry {name}"))?;
    hashed.close()?;
    Ok(ArchiveNotification::FileAdded {
        name: name.to_string(),
        size,
        digests: hashed.digests().unwrap_or_default(),
    })
}

fn enumerate_matches(dir: &std::path::Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = dir.join(pattern);
    let pattern_str = full.to_string_lossy();
    let mut files = Vec::new();
    for entry in glob::glob(&pattern_str)
        .with_context(|| format!("invalid file pattern {pattern}"))?
    {
        let path = entry.context("directory enumeration failed")?;
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

fn attempt_deletions(pending: &mut Vec<PathBuf>) {
    pending.retain(|path| fs::remove_file(path).is_err() && path.exists());
}
