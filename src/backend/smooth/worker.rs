use super::channel::{Received, WorkerEnd};
use super::ramp::{Ramp, RampConfig};
use crate::device::{self, BRIGHTNESS, MAX_BRIGHTNESS};
use crate::error::DeviceError;
use crate::escalate::Escalate;
use nix::fcntl::{OFlag, openat};
use nix::sys::stat::Mode;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Consecutive interrupted waits tolerated before giving up.
pub const TRANSIENT_RETRY_LIMIT: u32 = 10_000;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("cannot open brightness for writing: {0}")]
    Open(nix::Error),

    #[error("cannot signal readiness: {0}")]
    Handshake(nix::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("device reports max_brightness of 0")]
    ZeroRange,

    #[error("waiting for targets failed: {0}")]
    Wait(nix::Error),
}

/// Where the worker loop takes its targets from.
pub trait TargetSource {
    fn wait(&self, timeout: Option<Duration>) -> nix::Result<Received>;
}

impl TargetSource for WorkerEnd {
    fn wait(&self, timeout: Option<Duration>) -> nix::Result<Received> {
        WorkerEnd::wait(self, timeout)
    }
}

fn is_transient(err: nix::Error) -> bool {
    matches!(err, nix::Error::EINTR | nix::Error::EAGAIN)
}

/// Worker entry point. Failures before the handshake just close the channel,
/// which the mounting side reports; later failures end the mount.
pub fn serve(dir: BorrowedFd<'_>, end: WorkerEnd, config: RampConfig, escalate: &dyn Escalate) {
    let device = match openat(
        dir,
        BRIGHTNESS,
        OFlag::O_WRONLY | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(err) => {
            error!(err = %WorkerError::Open(err), "smoothing worker cannot start");
            return;
        }
    };

    if let Err(err) = end.signal_ready() {
        error!(err = %WorkerError::Handshake(err), "smoothing worker cannot start");
        return;
    }

    match run(dir, &device, &end, config) {
        Ok(()) => info!("brightness channel closed, smoothing worker exiting"),
        Err(err) => {
            error!(%err, "smoothing worker failed");
            escalate.escalate("smoothing worker stopped");
        }
    }
}

/// Ramps `device` towards targets received from `source` until end-of-stream.
pub fn run(
    dir: BorrowedFd<'_>,
    device: &OwnedFd,
    source: &impl TargetSource,
    config: RampConfig,
) -> Result<(), WorkerError> {
    let max = device::read_int(dir, MAX_BRIGHTNESS)?;
    if max == 0 {
        return Err(WorkerError::ZeroRange);
    }
    let current = device::read_int(dir, BRIGHTNESS)?;
    let mut ramp = Ramp::new(config, max, current);
    debug!(max, current, "smoothing worker ready");

    let mut retries = TRANSIENT_RETRY_LIMIT;
    loop {
        match source.wait(ramp.interval()) {
            Ok(Received::Closed) => return Ok(()),
            Ok(Received::Target(target)) => {
                ramp.retarget(target);
                debug!(
                    from = ramp.real(),
                    to = ramp.target(),
                    step = ramp.step(),
                    "ramp"
                );
            }
            Ok(Received::Nothing) => {}
            Err(err) if is_transient(err) && retries > 0 => {
                retries -= 1;
                continue;
            }
            Err(err) => {
                warn!(%err, retries, "giving up on brightness channel");
                return Err(WorkerError::Wait(err));
            }
        }
        retries = TRANSIENT_RETRY_LIMIT;

        if let Some(value) = ramp.tick() {
            device::write_int_at(device, value)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::channel::pair;
    use super::*;
    use crate::device::testing::{fake_backlight, open_dir, read_value};
    use crate::escalate::testing::Recorder;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::os::fd::AsFd;
    use std::time::Instant;

    /// Replays canned wait results, then reports end-of-stream.
    struct Scripted(RefCell<VecDeque<nix::Result<Received>>>);

    impl Scripted {
        fn new(results: impl IntoIterator<Item = nix::Result<Received>>) -> Self {
            Self(RefCell::new(results.into_iter().collect()))
        }
    }

    impl TargetSource for Scripted {
        fn wait(&self, _timeout: Option<Duration>) -> nix::Result<Received> {
            self.0.borrow_mut().pop_front().unwrap_or(Ok(Received::Closed))
        }
    }

    fn interrupted(count: u32, err: nix::Error) -> impl Iterator<Item = nix::Result<Received>> {
        std::iter::repeat_n(Err(err), count as usize)
    }

    fn open_device(dir: BorrowedFd<'_>) -> OwnedFd {
        openat(dir, BRIGHTNESS, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty()).unwrap()
    }

    fn fast() -> RampConfig {
        RampConfig {
            full_scale: Duration::from_millis(40),
            min_interval: Duration::from_millis(1),
            min_period: Duration::from_millis(40),
        }
    }

    fn wait_for(path: &std::path::Path, expected: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while read_value(path, "brightness") != expected {
            assert!(Instant::now() < deadline, "brightness never became {expected:?}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn worker_ramps_to_latest_target_and_exits_on_close() {
        let sysfs = fake_backlight("100\n", "255\n");
        let dir = open_dir(sysfs.path());
        let (tx, rx) = pair().unwrap();
        let recorder = Recorder::default();

        std::thread::scope(|s| {
            let worker = s.spawn(|| serve(dir.as_fd(), rx, fast(), &recorder));
            tx.wait_ready().unwrap();

            tx.send(20).unwrap();
            tx.send(300).unwrap();
            wait_for(sysfs.path(), "255\n");

            tx.send(0).unwrap();
            wait_for(sysfs.path(), "0\n");

            tx.close();
            worker.join().unwrap();
        });

        assert!(recorder.reasons().is_empty());
    }

    #[test]
    fn missing_device_never_becomes_ready() {
        let sysfs = fake_backlight("100\n", "255\n");
        std::fs::remove_file(sysfs.path().join("brightness")).unwrap();
        let dir = open_dir(sysfs.path());
        let (tx, rx) = pair().unwrap();
        let recorder = Recorder::default();

        std::thread::scope(|s| {
            s.spawn(|| serve(dir.as_fd(), rx, fast(), &recorder));
            assert!(tx.wait_ready().is_err());
        });

        assert!(recorder.reasons().is_empty());
    }

    #[test]
    fn unreadable_range_after_ready_escalates() {
        let sysfs = fake_backlight("100\n", "0\n");
        let dir = open_dir(sysfs.path());
        let (tx, rx) = pair().unwrap();
        let recorder = Recorder::default();

        std::thread::scope(|s| {
            s.spawn(|| serve(dir.as_fd(), rx, fast(), &recorder));
            tx.wait_ready().unwrap();
        });

        assert_eq!(recorder.reasons().len(), 1);
    }

    #[test]
    fn tolerates_retry_limit_of_consecutive_interruptions() {
        let sysfs = fake_backlight("100\n", "255\n");
        let dir = open_dir(sysfs.path());
        let device = open_device(dir.as_fd());
        let source = Scripted::new(interrupted(TRANSIENT_RETRY_LIMIT, nix::Error::EINTR));

        assert!(run(dir.as_fd(), &device, &source, fast()).is_ok());
    }

    #[test]
    fn gives_up_after_retry_limit_is_exceeded() {
        let sysfs = fake_backlight("100\n", "255\n");
        let dir = open_dir(sysfs.path());
        let device = open_device(dir.as_fd());
        let source = Scripted::new(interrupted(TRANSIENT_RETRY_LIMIT + 1, nix::Error::EINTR));

        let res = run(dir.as_fd(), &device, &source, fast());
        assert!(matches!(res, Err(WorkerError::Wait(nix::Error::EINTR))));
    }

    #[test]
    fn retry_budget_resets_after_successful_wait() {
        let sysfs = fake_backlight("100\n", "255\n");
        let dir = open_dir(sysfs.path());
        let device = open_device(dir.as_fd());
        let script = interrupted(TRANSIENT_RETRY_LIMIT, nix::Error::EINTR)
            .chain([Ok(Received::Target(99))])
            .chain(interrupted(TRANSIENT_RETRY_LIMIT, nix::Error::EAGAIN));
        let source = Scripted::new(script);

        assert!(run(dir.as_fd(), &device, &source, fast()).is_ok());
        assert_eq!(read_value(sysfs.path(), "brightness"), "99\n");
    }

    #[test]
    fn non_transient_wait_error_ends_worker() {
        let sysfs = fake_backlight("100\n", "255\n");
        let dir = open_dir(sysfs.path());
        let device = open_device(dir.as_fd());
        let source = Scripted::new([Err(nix::Error::EBADF)]);

        let res = run(dir.as_fd(), &device, &source, fast());
        assert!(matches!(res, Err(WorkerError::Wait(nix::Error::EBADF))));
    }
}
