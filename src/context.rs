use crate::device::{self, BRIGHTNESS, MAX_BRIGHTNESS};
use crate::error::{BacklightError, DeviceError, Result};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub fn open_backlight_dir(path: &Path) -> Result<OwnedFd> {
    open(
        path,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|source| BacklightError::OpenDir {
        path: path.to_owned(),
        source,
    })
}

/// Reads `max_brightness`, rejecting directories that are not backlight
/// controls or that advertise an empty range.
pub fn read_max_brightness(dir: BorrowedFd<'_>, path: &Path) -> Result<u32> {
    let max = device::read_int(dir, MAX_BRIGHTNESS).map_err(|source| not_backlight(path, source))?;
    if max == 0 {
        return Err(BacklightError::ZeroRange {
            path: path.to_owned(),
        });
    }
    Ok(max)
}

fn not_backlight(path: &Path, source: DeviceError) -> BacklightError {
    BacklightError::NotBacklight {
        path: path.to_owned(),
        source,
    }
}

/// State shared by every filesystem operation of one mount.
#[derive(Debug)]
pub struct MountContext {
    path: PathBuf,
    dir: OwnedFd,
    max_brightness: u32,
    target: Mutex<u32>,
}

impl MountContext {
    pub fn open(path: PathBuf) -> Result<Self> {
        let dir = open_backlight_dir(&path)?;
        let current =
            device::read_int(dir.as_fd(), BRIGHTNESS).map_err(|source| not_backlight(&path, source))?;
        let max_brightness = read_max_brightness(dir.as_fd(), &path)?;

        Ok(Self {
            path,
            dir,
            max_brightness,
            target: Mutex::new(current.min(max_brightness)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> BorrowedFd<'_> {
        self.dir.as_fd()
    }

    pub fn max_brightness(&self) -> u32 {
        self.max_brightness
    }

    pub fn target(&self) -> u32 {
        *self.target.lock().unwrap()
    }

    /// Live device value, never cached.
    pub fn actual(&self) -> std::result::Result<u32, DeviceError> {
        device::read_int(self.dir(), BRIGHTNESS)
    }

    /// Clamps `requested` into range, stores it and passes it to `apply`
    /// while still holding the lock, so actuation sees targets in the order
    /// they were stored.
    pub fn set_target<F, E>(&self, requested: i64, apply: F) -> std::result::Result<u32, E>
    where
        F: FnOnce(u32) -> std::result::Result<(), E>,
    {
        let value = requested.clamp(0, i64::from(self.max_brightness)) as u32;
        let mut target = self.target.lock().unwrap();
        *target = value;
        apply(value)?;
        Ok(value)
    }
}
