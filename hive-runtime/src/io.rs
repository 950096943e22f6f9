//! File collaborator.
//!
//! Regular files cannot be waited on with epoll, so file operations run on a
//! single worker thread (`hive-io`), spawned on first use. The calling actor
//! submits a job on a bounded channel and blocks; the worker performs the
//! blocking syscall, posts a [`Completion`] on a second bounded channel and
//! wakes the scheduler's poller. The scheduler drains completions at the top
//! of every iteration, stores each result in the actor's control block and
//! makes it ready.
//!
//! The file itself travels with the job and comes back with the completion,
//! so an actor torn down mid-operation never leaves the worker using a
//! closed descriptor.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::actor::{ActorId, Wait};
use crate::error::{Error, Result};
use crate::poller::Waker;
use crate::scheduler::{Kernel, KernelState};

/// How [`Ctx::file_open`](crate::Ctx::file_open) opens a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only; the file must exist.
    Read,
    /// Write only; created if missing, truncated if present.
    Write,
    /// Write only, appending; created if missing.
    Append,
    /// Read and write; created if missing, never truncated.
    ReadWrite,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::Read => opts.read(true),
            OpenMode::Write => opts.write(true).create(true).truncate(true),
            OpenMode::Append => opts.append(true).create(true),
            OpenMode::ReadWrite => opts.read(true).write(true).create(true),
        };
        opts
    }
}

/// An open file owned by an actor.
///
/// Empty while an operation on it is in flight; an operation interrupted by
/// teardown leaves it empty for good.
#[derive(Debug)]
pub struct FileHandle {
    file: Option<File>,
}

impl FileHandle {
    fn take(&mut self) -> Result<File> {
        self.file
            .take()
            .ok_or(Error::Closed)
    }

    /// Whether the handle still owns an open file.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

/// Work for the I/O thread.
#[derive(Debug)]
pub(crate) enum FileOp {
    Open { path: PathBuf, mode: OpenMode },
    Read { file: File, max: usize },
    Write { file: File, data: Vec<u8> },
    Sync { file: File },
    Close { file: File },
}

/// Result slot of a blocked I/O call.
#[derive(Debug)]
pub(crate) enum IoValue {
    Opened(File),
    Read(File, Vec<u8>),
    Wrote(File, usize),
    Synced(File),
    Closed,
    /// A registered socket became ready.
    Ready,
}

#[derive(Debug)]
struct Job {
    actor: ActorId,
    op: FileOp,
}

#[derive(Debug)]
pub(crate) struct Completion {
    actor: ActorId,
    result: io::Result<IoValue>,
}

fn run_op(op: FileOp) -> io::Result<IoValue> {
    match op {
        FileOp::Open { path, mode } => mode.options().open(path).map(IoValue::Opened),
        FileOp::Read { mut file, max } => {
            let mut buf = vec![0u8; max];
            let n = loop {
                match file.read(&mut buf) {
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    other => break other?,
                }
            };
            buf.truncate(n);
            Ok(IoValue::Read(file, buf))
        }
        FileOp::Write { mut file, data } => {
            file.write_all(&data)?;
            Ok(IoValue::Wrote(file, data.len()))
        }
        FileOp::Sync { file } => {
            file.sync_all()?;
            Ok(IoValue::Synced(file))
        }
        FileOp::Close { file } => {
            drop(file);
            Ok(IoValue::Closed)
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

/// The `hive-io` thread and its two queues.
#[derive(Debug)]
pub(crate) struct IoWorker {
    jobs: Option<Sender<Job>>,
    done: Receiver<Completion>,
    thread: Option<JoinHandle<()>>,
}

impl IoWorker {
    pub(crate) fn spawn(depth: usize, waker: Arc<Waker>) -> io::Result<Self> {
        let (jobs_tx, jobs_rx) = crossbeam_channel::bounded::<Job>(depth);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<Completion>(depth);
        let thread = thread::Builder::new()
            .name("hive-io".into())
            .spawn(move || {
                debug!("io worker started");
                for job in jobs_rx {
                    trace!(actor = %job.actor, op = ?job.op, "io job");
                    let result = run_op(job.op);
                    if done_tx
                        .send(Completion {
                            actor: job.actor,
                            result,
                        })
                        .is_err()
                    {
                        break;
                    }
                    waker.wake();
                }
                debug!("io worker stopped");
            })?;
        Ok(IoWorker {
            jobs: Some(jobs_tx),
            done: done_rx,
            thread: Some(thread),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        let Some(jobs) = &self.jobs else {
            return Err(Error::Closed);
        };
        jobs.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => Error::ResourceExhausted("io queue"),
            TrySendError::Disconnected(_) => Error::Closed,
        })
    }

    fn try_complete(&self) -> Option<Completion> {
        self.done.try_recv().ok()
    }

    /// Close the job queue and join the thread.
    pub(crate) fn shutdown(&mut self) {
        self.jobs = None;
        // Keep the completion queue moving until the worker hangs up.
        while self.done.recv().is_ok() {}
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("io worker panicked");
            }
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Kernel-side bookkeeping of the file collaborator.
#[derive(Debug, Default)]
pub(crate) struct IoState {
    pub(crate) worker: Option<IoWorker>,
    pub(crate) in_flight: usize,
}

// ── Kernel integration ──────────────────────────────────────────────────────

impl KernelState {
    /// Hand finished jobs back to their actors.
    pub(crate) fn drain_completions(&mut self) {
        loop {
            let Some(completion) = self.io.worker.as_ref().and_then(IoWorker::try_complete)
            else {
                return;
            };
            self.io.in_flight = self.io.in_flight.saturating_sub(1);
            let slot = completion.actor.slot();
            match self.actors.get_mut(slot) {
                Some(cb) if cb.id == completion.actor && matches!(cb.wait, Some(Wait::Io)) => {
                    cb.io = Some(completion.result);
                    self.wake(slot, None);
                }
                // Dropping the result closes any file it carries.
                _ => debug!(actor = %completion.actor, "io completion for departed actor"),
            }
        }
    }
}

impl Kernel {
    /// Run `op` on the worker thread, blocking the calling actor.
    fn file_op(&self, me: ActorId, op: FileOp) -> Result<IoValue> {
        let slot = self.current_slot(me)?;
        {
            let mut st = self.state();
            if st.io.in_flight >= self.config.io_queue_depth {
                return Err(Error::ResourceExhausted("io queue"));
            }
            if st.io.worker.is_none() {
                let waker = st.poller.waker();
                st.io.worker = Some(IoWorker::spawn(self.config.io_queue_depth, waker)?);
            }
            let worker = st.io.worker.as_ref().ok_or(Error::Closed)?;
            worker.submit(Job { actor: me, op })?;
            st.io.in_flight += 1;
        }
        self.block(slot, Wait::Io)?;
        let result = self
            .state()
            .actors
            .get_mut(slot)
            .and_then(|cb| cb.io.take())
            .ok_or(Error::Closed)?;
        result.map_err(Error::from)
    }

    pub(crate) fn file_open(&self, me: ActorId, path: &Path, mode: OpenMode) -> Result<FileHandle> {
        let op = FileOp::Open {
            path: path.to_path_buf(),
            mode,
        };
        match self.file_op(me, op)? {
            IoValue::Opened(file) => Ok(FileHandle { file: Some(file) }),
            _ => Err(Error::Closed),
        }
    }

    pub(crate) fn file_read(&self, me: ActorId, handle: &mut FileHandle, max: usize) -> Result<Vec<u8>> {
        let file = handle.take()?;
        match self.file_op(me, FileOp::Read { file, max })? {
            IoValue::Read(file, data) => {
                handle.file = Some(file);
                Ok(data)
            }
            _ => Err(Error::Closed),
        }
    }

    pub(crate) fn file_write(&self, me: ActorId, handle: &mut FileHandle, data: &[u8]) -> Result<usize> {
        let file = handle.take()?;
        let op = FileOp::Write {
            file,
            data: data.to_vec(),
        };
        match self.file_op(me, op)? {
            IoValue::Wrote(file, n) => {
                handle.file = Some(file);
                Ok(n)
            }
            _ => Err(Error::Closed),
        }
    }

    pub(crate) fn file_sync(&self, me: ActorId, handle: &mut FileHandle) -> Result<()> {
        let file = handle.take()?;
        match self.file_op(me, FileOp::Sync { file })? {
            IoValue::Synced(file) => {
                handle.file = Some(file);
                Ok(())
            }
            _ => Err(Error::Closed),
        }
    }

    pub(crate) fn file_close(&self, me: ActorId, mut handle: FileHandle) -> Result<()> {
        let file = handle.take()?;
        match self.file_op(me, FileOp::Close { file })? {
            IoValue::Closed => Ok(()),
            _ => Err(Error::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_run_against_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let IoValue::Opened(file) = run_op(FileOp::Open {
            path: path.clone(),
            mode: OpenMode::Write,
        })
        .unwrap() else {
            panic!("expected open");
        };
        let IoValue::Wrote(file, n) = run_op(FileOp::Write {
            file,
            data: b"hello".to_vec(),
        })
        .unwrap() else {
            panic!("expected write");
        };
        assert_eq!(n, 5);
        assert!(matches!(run_op(FileOp::Close { file }).unwrap(), IoValue::Closed));

        let IoValue::Opened(file) = run_op(FileOp::Open {
            path,
            mode: OpenMode::Read,
        })
        .unwrap() else {
            panic!("expected open");
        };
        let IoValue::Read(_, data) = run_op(FileOp::Read { file, max: 64 }).unwrap() else {
            panic!("expected read");
        };
        assert_eq!(data, b"hello");
    }

    #[test]
    fn emptied_handle_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = FileHandle {
            file: Some(File::create(dir.path().join("h")).unwrap()),
        };
        assert!(handle.take().is_ok());
        assert!(!handle.is_open());
        assert!(matches!(handle.take(), Err(Error::Closed)));
    }

    #[test]
    fn open_missing_file_for_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_op(FileOp::Open {
            path: dir.path().join("missing"),
            mode: OpenMode::Read,
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn worker_round_trip_wakes_poller() {
        let dir = tempfile::tempdir().unwrap();
        let mut poller = crate::poller::Poller::new().unwrap();
        let mut worker = IoWorker::spawn(2, poller.waker()).unwrap();
        let actor = ActorId::from_raw(0x1_0001);
        worker
            .submit(Job {
                actor,
                op: FileOp::Open {
                    path: dir.path().join("f"),
                    mode: OpenMode::ReadWrite,
                },
            })
            .unwrap();

        let completion = loop {
            let mut ready = Vec::new();
            poller
                .poll(&mut ready, Some(std::time::Duration::from_millis(50)))
                .unwrap();
            if let Some(c) = worker.try_complete() {
                break c;
            }
        };
        assert_eq!(completion.actor, actor);
        assert!(matches!(completion.result, Ok(IoValue::Opened(_))));
        worker.shutdown();
        assert!(matches!(
            worker.submit(Job {
                actor,
                op: FileOp::Open {
                    path: dir.path().join("g"),
                    mode: OpenMode::Write,
                },
            }),
            Err(Error::Closed)
        ));
    }
}
