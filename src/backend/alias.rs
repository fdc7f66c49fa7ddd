use super::Backend;
use crate::context::{open_backlight_dir, read_max_brightness};
use crate::device::{self, BRIGHTNESS, MAX_BRIGHTNESS};
use crate::error::{BacklightError, Result};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mirrors writes onto a second device with its own range.
#[derive(Debug)]
pub struct AliasBackend {
    path: PathBuf,
    dir: OwnedFd,
    source_max: u32,
}

/// `round(value * target_max / source_max)` in integer arithmetic.
pub fn rescale(value: u32, source_max: u32, target_max: u32) -> u32 {
    let source_max = u64::from(source_max.max(1));
    let scaled = (u64::from(value) * u64::from(target_max) + source_max / 2) / source_max;
    scaled.min(u64::from(u32::MAX)) as u32
}

impl AliasBackend {
    /// Opens the alias target and checks it exposes a usable range.
    pub fn open(path: &Path, source_max: u32) -> Result<Self> {
        let dir = open_backlight_dir(path)?;
        read_max_brightness(dir.as_fd(), path)?;
        Ok(Self {
            path: path.to_owned(),
            dir,
            source_max,
        })
    }
}

impl Backend for AliasBackend {
    fn apply(&self, brightness: u32) -> Result<()> {
        // The target range is re-read each time; hotplugged panels change it.
        let target_max = device::read_int(self.dir.as_fd(), MAX_BRIGHTNESS)?;
        if target_max == 0 {
            return Err(BacklightError::ZeroRange {
                path: self.path.clone(),
            });
        }
        let scaled = rescale(brightness, self.source_max, target_max);
        debug!(brightness, scaled, target_max, "alias write");
        device::write_int(self.dir.as_fd(), BRIGHTNESS, scaled)?;
        Ok(())
    }
}
