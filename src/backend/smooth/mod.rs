//! Deferred actuation: a worker owns the device and eases it towards the
//! latest target.
//!
//! ```text
//!  FUSE handler                          worker (child process or thread)
//!     │ write "200" ──► TargetSender ═══► WorkerEnd ── poll(interval) ─┐
//!     │ (returns at once)                     ▲                        │
//!     │                                       └── Ramp::tick ── pwrite ┘
//! ```

pub mod channel;
pub mod ramp;
pub mod worker;

use super::Backend;
use crate::error::{BacklightError, Result};
use crate::escalate::{Escalate, InterruptProcess};
use channel::TargetSender;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, dup, fork, getpid};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

pub use ramp::RampConfig;

#[derive(Debug)]
enum Worker {
    Thread(JoinHandle<()>),
    Process(Pid),
}

#[derive(Debug)]
pub struct SmoothBackend {
    sender: TargetSender,
    worker: Option<Worker>,
}

impl SmoothBackend {
    /// Runs the worker on a dedicated thread. `escalate` is invoked from that
    /// thread if the worker dies after startup.
    pub fn spawn_thread(
        dir: BorrowedFd<'_>,
        config: RampConfig,
        escalate: Arc<dyn Escalate>,
    ) -> Result<Self> {
        let (sender, end) = channel::pair()?;
        let dir = dup(dir).map_err(|e| BacklightError::Spawn(e.to_string()))?;

        let handle = std::thread::Builder::new()
            .name("smooth-worker".into())
            .spawn(move || worker::serve(dir.as_fd(), end, config, escalate.as_ref()))
            .map_err(|e| BacklightError::Spawn(e.to_string()))?;

        Self::ready(sender, Worker::Thread(handle))
    }

    /// Forks the worker into a child process, which interrupts this process
    /// if it dies after startup.
    ///
    /// Must be called before any other thread exists, in particular before
    /// the async runtime is built.
    pub fn spawn_process(dir: BorrowedFd<'_>, config: RampConfig) -> Result<Self> {
        let (sender, end) = channel::pair()?;
        let parent = getpid();

        // SAFETY: the caller guarantees the process is still single-threaded,
        // so the child cannot inherit a lock held by another thread.
        match unsafe { fork() }.map_err(|e| BacklightError::Spawn(e.to_string()))? {
            ForkResult::Child => {
                drop(sender);
                worker::serve(dir, end, config, &InterruptProcess(parent));
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                drop(end);
                debug!(pid = child.as_raw(), "forked smoothing worker");
                Self::ready(sender, Worker::Process(child))
            }
        }
    }

    fn ready(sender: TargetSender, worker: Worker) -> Result<Self> {
        let backend = Self {
            sender,
            worker: Some(worker),
        };
        // On failure `backend` drops here, which reaps the worker.
        backend.sender.wait_ready()?;
        info!("smoothing worker ready");
        Ok(backend)
    }

    #[cfg(test)]
    fn worker_pid(&self) -> Option<Pid> {
        match self.worker {
            Some(Worker::Process(pid)) => Some(pid),
            _ => None,
        }
    }
}

impl Backend for SmoothBackend {
    fn apply(&self, brightness: u32) -> Result<()> {
        let target = i32::try_from(brightness).unwrap_or(i32::MAX);
        self.sender.send(target)
    }
}

impl Drop for SmoothBackend {
    fn drop(&mut self) {
        self.sender.close();
        match self.worker.take() {
            Some(Worker::Thread(handle)) => {
                if handle.join().is_err() {
                    warn!("smoothing worker thread panicked");
                }
            }
            Some(Worker::Process(pid)) => {
                if let Err(err) = waitpid(pid, None) {
                    warn!(%err, pid = pid.as_raw(), "cannot reap smoothing worker");
                }
            }
            None => {}
        }
    }
}
