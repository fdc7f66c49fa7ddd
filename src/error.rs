use std::path::PathBuf;
use thiserror::Error;

/// Failure to read or write one of the integer pseudo-files.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("cannot access {name}: {source}")]
    Unavailable {
        name: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("{name} does not contain a number")]
    Malformed { name: &'static str },

    #[error("short write to {name}")]
    ShortWrite { name: &'static str },
}

impl DeviceError {
    pub fn errno(&self) -> i32 {
        match self {
            DeviceError::Unavailable { source, .. } => *source as i32,
            DeviceError::Malformed { .. } | DeviceError::ShortWrite { .. } => libc::EIO,
        }
    }
}

impl From<DeviceError> for fuse3::Errno {
    fn from(value: DeviceError) -> Self {
        fuse3::Errno::from(value.errno())
    }
}

#[derive(Error, Debug)]
pub enum BacklightError {
    #[error("cannot open {}: {source}", path.display())]
    OpenDir {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("{} does not look like backlight control: {source}", path.display())]
    NotBacklight {
        path: PathBuf,
        #[source]
        source: DeviceError,
    },

    #[error("{} reports max_brightness of 0", path.display())]
    ZeroRange { path: PathBuf },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("brightness channel: {0}")]
    Channel(nix::Error),

    #[error("smoothing worker exited before becoming ready")]
    WorkerNotReady,

    #[error("cannot start smoothing worker: {0}")]
    Spawn(String),
}

pub type Result<T, E = BacklightError> = std::result::Result<T, E>;
