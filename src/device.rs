//! Small integer pseudo-files of a backlight class device.
//!
//! Every call opens the attribute fresh and closes it again, so no descriptor
//! outlives the call and other tools are never locked out.

use crate::error::DeviceError;
use crate::util::retry_eintr;
use nix::fcntl::{OFlag, openat};
use nix::sys::stat::Mode;
use nix::sys::uio::pwrite;
use std::os::fd::{AsFd, BorrowedFd};

pub const BRIGHTNESS: &str = "brightness";
pub const ACTUAL_BRIGHTNESS: &str = "actual_brightness";
pub const MAX_BRIGHTNESS: &str = "max_brightness";

const READ_LIMIT: usize = 31;

/// Parses the first decimal integer of `raw` the way `scanf("%d")` would:
/// leading whitespace and a sign are accepted, trailing bytes are ignored.
/// Out-of-range magnitudes saturate.
pub fn parse_leading_int(raw: &[u8]) -> Option<i64> {
    let mut rest = raw;
    while let [first, tail @ ..] = rest {
        if !first.is_ascii_whitespace() {
            break;
        }
        rest = tail;
    }

    let negative = match rest.first() {
        Some(b'-') => {
            rest = &rest[1..];
            true
        }
        Some(b'+') => {
            rest = &rest[1..];
            false
        }
        _ => false,
    };

    let digits = rest.iter().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }

    let magnitude = rest[..digits].iter().fold(0i64, |acc, c| {
        acc.saturating_mul(10).saturating_add(i64::from(c - b'0'))
    });
    Some(if negative { -magnitude } else { magnitude })
}

/// Reads the first integer in `dir/name`, clamping negative values to 0.
pub fn read_int(dir: BorrowedFd<'_>, name: &'static str) -> Result<u32, DeviceError> {
    let unavailable = |source| DeviceError::Unavailable { name, source };

    let fd = openat(
        dir,
        name,
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(unavailable)?;

    let mut buf = [0u8; READ_LIMIT];
    let len = retry_eintr(|| nix::unistd::read(&fd, &mut buf)).map_err(unavailable)?;
    let value = parse_leading_int(&buf[..len]).ok_or(DeviceError::Malformed { name })?;
    Ok(value.clamp(0, i64::from(u32::MAX)) as u32)
}

/// Writes `value` as a decimal line to `dir/name` with a single write.
pub fn write_int(dir: BorrowedFd<'_>, name: &'static str, value: u32) -> Result<(), DeviceError> {
    let unavailable = |source| DeviceError::Unavailable { name, source };

    let fd = openat(
        dir,
        name,
        OFlag::O_WRONLY | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(unavailable)?;

    let line = format!("{value}\n");
    let written = retry_eintr(|| nix::unistd::write(&fd, line.as_bytes())).map_err(unavailable)?;
    if written != line.len() {
        return Err(DeviceError::ShortWrite { name });
    }
    Ok(())
}

/// Rewrites a held brightness descriptor in place. Truncation is best effort
/// since sysfs attributes refuse it.
pub fn write_int_at<Fd: AsFd>(fd: Fd, value: u32) -> Result<(), DeviceError> {
    let line = format!("{value}\n");
    let written = retry_eintr(|| pwrite(fd.as_fd(), line.as_bytes(), 0)).map_err(|source| {
        DeviceError::Unavailable {
            name: BRIGHTNESS,
            source,
        }
    })?;
    if written != line.len() {
        return Err(DeviceError::ShortWrite { name: BRIGHTNESS });
    }
    let _ = nix::unistd::ftruncate(fd.as_fd(), written as i64);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::fs;

    #[test]
    fn parse_accepts_scanf_style_input() {
        assert_eq!(parse_leading_int(b"100\n"), Some(100));
        assert_eq!(parse_leading_int(b"  42 trailing"), Some(42));
        assert_eq!(parse_leading_int(b"+7"), Some(7));
        assert_eq!(parse_leading_int(b"-12\n"), Some(-12));
        assert_eq!(parse_leading_int(b"99999999999999999999999"), Some(i64::MAX));
        assert_eq!(parse_leading_int(b""), None);
        assert_eq!(parse_leading_int(b"abc"), None);
        assert_eq!(parse_leading_int(b"-"), None);
    }

    #[test]
    fn read_int_clamps_negative_to_zero() {
        let dir = fake_backlight("-5\n", "255\n");
        let fd = open_dir(dir.path());
        assert_eq!(read_int(fd.as_fd(), BRIGHTNESS), Ok(0));
        assert_eq!(read_int(fd.as_fd(), MAX_BRIGHTNESS), Ok(255));
    }

    #[test]
    fn read_int_distinguishes_missing_from_malformed() {
        let dir = fake_backlight("100\n", "255\n");
        fs::write(dir.path().join("max_brightness"), "none\n").unwrap();
        fs::remove_file(dir.path().join("brightness")).unwrap();
        let fd = open_dir(dir.path());

        assert_eq!(
            read_int(fd.as_fd(), BRIGHTNESS),
            Err(DeviceError::Unavailable {
                name: BRIGHTNESS,
                source: nix::Error::ENOENT,
            })
        );
        assert_eq!(
            read_int(fd.as_fd(), MAX_BRIGHTNESS),
            Err(DeviceError::Malformed {
                name: MAX_BRIGHTNESS
            })
        );
    }

    #[test]
    fn write_int_replaces_value() {
        let dir = fake_backlight("100\n", "255\n");
        let fd = open_dir(dir.path());
        write_int(fd.as_fd(), BRIGHTNESS, 7).unwrap();
        // O_WRONLY without O_TRUNC overwrites in place, like a sysfs store.
        assert_eq!(read_value(dir.path(), "brightness"), "7\n0\n");
        assert_eq!(read_int(fd.as_fd(), BRIGHTNESS), Ok(7));
    }

    #[test]
    fn write_int_at_rewrites_from_start() {
        let dir = fake_backlight("100\n", "255\n");
        let file = fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("brightness"))
            .unwrap();
        write_int_at(&file, 5).unwrap();
        assert_eq!(read_value(dir.path(), "brightness"), "5\n");
        write_int_at(&file, 250).unwrap();
        assert_eq!(read_value(dir.path(), "brightness"), "250\n");
    }
}
