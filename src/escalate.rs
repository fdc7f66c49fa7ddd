//! Turning a lost actuation guarantee into a mount shutdown.

use nix::sys::signal::{Signal, kill, raise};
use nix::unistd::Pid;
use tracing::error;

/// Ends the mount when brightness writes can no longer be honoured.
pub trait Escalate: Send + Sync {
    fn escalate(&self, reason: &str);
}

/// Interrupts the current process; the front-end unmounts on `SIGINT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptSelf;

impl Escalate for InterruptSelf {
    fn escalate(&self, reason: &str) {
        error!(reason, "interrupting mount");
        if let Err(err) = raise(Signal::SIGINT) {
            error!(%err, "cannot raise SIGINT");
        }
    }
}

/// Interrupts another process, used by a worker running in a forked child.
#[derive(Debug, Clone, Copy)]
pub struct InterruptProcess(pub Pid);

impl Escalate for InterruptProcess {
    fn escalate(&self, reason: &str) {
        error!(reason, pid = self.0.as_raw(), "interrupting mount process");
        if let Err(err) = kill(self.0, Signal::SIGINT) {
            error!(%err, "cannot signal mount process");
        }
    }
}
