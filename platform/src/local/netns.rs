//! Network namespace harness.
//!
//! Switching network namespace changes the calling thread's state, so a
//! [`Namespace`] owns a dedicated worker thread. The namespace is created on
//! that thread and every namespace-sensitive operation is shipped to it as a
//! closure: the worker enters the namespace, runs the closure and switches
//! back before it takes the next job. Callers never change namespace
//! themselves, and two scoped regions can never overlap on the worker.
//!
//! Requires `CAP_SYS_ADMIN`.

use std::fs::File;
use std::io;
use std::process::Output;
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread::JoinHandle;

use async_trait::async_trait;
use nix::sched::{setns, unshare, CloneFlags};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::ssh::{piped, wait_with_input, Launcher};

const THREAD_NS_PATH: &str = "/proc/thread-self/ns/net";

/// Errors from namespace operations.
#[derive(Debug, Error)]
pub enum NsError {
    /// Could not open a namespace handle.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Path that was opened.
        path: &'static str,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// `unshare(CLONE_NEWNET)` failed.
    #[error("unshare failed: {0}")]
    Unshare(#[source] nix::Error),

    /// `setns` failed.
    #[error("setns failed: {0}")]
    Setns(#[source] nix::Error),

    /// The worker thread could not be started.
    #[error("failed to spawn namespace worker: {0}")]
    Spawn(#[source] io::Error),

    /// The worker thread stopped before answering.
    #[error("namespace worker is gone")]
    WorkerGone,

    /// The namespace was already closed.
    #[error("namespace is closed")]
    Closed,
}

/// Job run on the worker; receives whether entering the namespace worked.
type Job = Box<dyn FnOnce(Result<(), NsError>) + Send>;

/// An isolated network namespace with its own execution context.
pub struct Namespace {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Namespace {
    /// Allocate a new network namespace.
    ///
    /// Nothing stays allocated when this fails.
    pub async fn create() -> Result<Self, NsError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();

        let worker = std::thread::Builder::new()
            .name("netns-worker".into())
            .spawn(move || worker(ready_tx, jobs_rx))
            .map_err(NsError::Spawn)?;

        ready_rx.await.map_err(|_| NsError::WorkerGone)??;
        tracing::debug!("created network namespace");

        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Run `f` inside the namespace and return its result.
    ///
    /// The namespace is entered right before `f` runs and left right after,
    /// on the namespace's own thread. Jobs are serialized.
    pub async fn run<F, T>(&self, f: F) -> Result<T, NsError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |entered| {
            let _ = tx.send(entered.map(|()| f()));
        });

        {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = jobs.as_ref().ok_or(NsError::Closed)?;
            sender.send(job).map_err(|_| NsError::WorkerGone)?;
        }

        rx.await.map_err(|_| NsError::WorkerGone)?
    }

    /// Release the namespace.
    ///
    /// Safe to call more than once. Anything created inside the namespace
    /// must be torn down first.
    pub async fn close(&self) -> Result<(), NsError> {
        drop(
            self.jobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = worker {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|_| NsError::WorkerGone)?
                .map_err(|_| NsError::WorkerGone)?;
            tracing::debug!("closed network namespace");
        }
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        // Dropping the sender stops the worker, which drops the handle.
        self.jobs
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("Namespace").field("open", &open).finish()
    }
}

/// Body of the worker thread.
fn worker(ready: oneshot::Sender<Result<(), NsError>>, jobs: mpsc::Receiver<Job>) {
    let (orig, target) = match create_on_this_thread() {
        Ok(handles) => handles,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    for job in jobs {
        match Entered::enter(&target, &orig) {
            Ok(entered) => {
                job(Ok(()));
                if let Err(e) = entered.exit() {
                    // Stuck in the wrong namespace; refuse further work.
                    tracing::error!("failed to leave network namespace: {}", e);
                    return;
                }
            }
            Err(e) => job(Err(e)),
        }
    }
}

/// Create a namespace and return (original, new) handles, leaving the
/// thread in its original namespace.
fn create_on_this_thread() -> Result<(File, File), NsError> {
    let orig = open_thread_ns()?;
    unshare(CloneFlags::CLONE_NEWNET).map_err(NsError::Unshare)?;
    let target = open_thread_ns();
    // Switch back even when the new handle could not be opened; with no
    // handle left the kernel frees the namespace.
    setns(&orig, CloneFlags::CLONE_NEWNET).map_err(NsError::Setns)?;
    Ok((orig, target?))
}

fn open_thread_ns() -> Result<File, NsError> {
    File::open(THREAD_NS_PATH).map_err(|source| NsError::Open {
        path: THREAD_NS_PATH,
        source,
    })
}

/// The worker thread is inside the target namespace while this is alive.
struct Entered<'a> {
    orig: &'a File,
}

impl<'a> Entered<'a> {
    fn enter(target: &File, orig: &'a File) -> Result<Self, NsError> {
        setns(target, CloneFlags::CLONE_NEWNET).map_err(NsError::Setns)?;
        Ok(Self { orig })
    }

    fn exit(self) -> Result<(), NsError> {
        let result = setns(self.orig, CloneFlags::CLONE_NEWNET).map_err(NsError::Setns);
        std::mem::forget(self);
        result
    }
}

impl Drop for Entered<'_> {
    // Only reached when a job panics.
    fn drop(&mut self) {
        if let Err(e) = setns(self.orig, CloneFlags::CLONE_NEWNET) {
            tracing::error!("failed to leave network namespace: {}", e);
        }
    }
}

/// Starts processes inside the namespace. Children inherit it, and are
/// killed when the returned future is dropped.
#[async_trait]
impl Launcher for Namespace {
    async fn output(&self, cmd: std::process::Command, stdin: Option<Vec<u8>>) -> io::Result<Output> {
        let mut cmd = piped(cmd, stdin.is_some());
        // The worker has no runtime of its own; the child is registered with ours.
        let runtime = tokio::runtime::Handle::current();
        let child = self
            .run(move || {
                let _rt = runtime.enter();
                cmd.spawn()
            })
            .await
            .map_err(io::Error::other)??;
        wait_with_input(child, stdin).await
    }
}
