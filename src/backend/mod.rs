//! Physical actuation of an accepted `brightness` write.

pub mod alias;
pub mod smooth;

use crate::error::Result;

pub use alias::AliasBackend;
pub use smooth::SmoothBackend;

/// Receives every clamped target stored by the filesystem.
pub trait Backend: Send + Sync {
    fn apply(&self, brightness: u32) -> Result<()>;
}
