//! Path-level operations against the real backlight directory, with
//! `brightness` and `actual_brightness` answered locally.

use crate::backend::Backend;
use crate::context::MountContext;
use crate::device::{ACTUAL_BRIGHTNESS, BRIGHTNESS, parse_leading_int};
use crate::escalate::Escalate;
use crate::handle_table::{Handle, HandleTable, VirtualFile};
use crate::util::{
    errno_from_nix, file_attr_from_stat, file_type_from_dir_type, file_type_from_mode,
    oflag_from_bits, os_to_cstring, retry_eintr, slice_at,
};
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use nix::dir::Dir;
use nix::fcntl::{AtFlags, OFlag, openat, readlinkat};
use nix::sys::stat::{Mode, fstat, fstatat};
use nix::sys::statvfs::{Statvfs, fstatvfs};
use nix::sys::uio::{pread, pwrite};
use std::ffi::{OsStr, OsString};
use std::os::fd::AsFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;
use tracing::error;

/// Maps a mount-relative absolute path onto a name relative to the backlight
/// directory. The root, an empty path and `..` all mean the directory itself.
pub fn normalize(path: &OsStr) -> &OsStr {
    let bytes = path.as_bytes();
    let rel = bytes.strip_prefix(b"/").unwrap_or(bytes);
    if rel.is_empty() || rel == b".." {
        OsStr::new(".")
    } else {
        OsStr::from_bytes(rel)
    }
}

/// Which intercepted file, if any, `path` names. Only top-level entries are
/// intercepted.
pub fn intercepted(path: &OsStr) -> Option<VirtualFile> {
    let rel = normalize(path);
    if rel == OsStr::new(BRIGHTNESS) {
        Some(VirtualFile::Brightness)
    } else if rel == OsStr::new(ACTUAL_BRIGHTNESS) {
        Some(VirtualFile::ActualBrightness)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub kind: FileType,
}

pub struct Passthrough {
    ctx: MountContext,
    backend: Box<dyn Backend>,
    escalate: Arc<dyn Escalate>,
    handles: HandleTable,
}

impl Passthrough {
    pub fn new(ctx: MountContext, backend: Box<dyn Backend>, escalate: Arc<dyn Escalate>) -> Self {
        Self {
            ctx,
            backend,
            escalate,
            handles: HandleTable::new(),
        }
    }

    pub fn context(&self) -> &MountContext {
        &self.ctx
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn stat(&self, path: &OsStr) -> Result<FileAttr, fuse3::Errno> {
        let rel = os_to_cstring(normalize(path))?;
        let stat = fstatat(self.ctx.dir(), rel.as_c_str(), AtFlags::AT_SYMLINK_NOFOLLOW)
            .map_err(errno_from_nix)?;
        Ok(file_attr_from_stat(&stat))
    }

    /// Attributes through an open descriptor, when `fh` has one.
    pub fn stat_handle(&self, fh: u64) -> Option<Result<FileAttr, fuse3::Errno>> {
        let handle = self.handles.get_file(fh)?;
        let fd = handle.as_fd()?;
        Some(
            fstat(fd)
                .map(|stat| file_attr_from_stat(&stat))
                .map_err(errno_from_nix),
        )
    }

    pub fn truncate(&self, path: &OsStr, size: u64) -> Result<(), fuse3::Errno> {
        if intercepted(path).is_some() {
            return Ok(());
        }
        let rel = os_to_cstring(normalize(path))?;
        let file = openat(
            self.ctx.dir(),
            rel.as_c_str(),
            OFlag::O_WRONLY | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(errno_from_nix)?;
        let size = i64::try_from(size).map_err(|_| fuse3::Errno::from(libc::EFBIG))?;
        nix::unistd::ftruncate(&file, size).map_err(errno_from_nix)
    }

    pub fn readlink(&self, path: &OsStr) -> Result<Vec<u8>, fuse3::Errno> {
        let rel = os_to_cstring(normalize(path))?;
        let target = readlinkat(self.ctx.dir(), rel.as_c_str()).map_err(errno_from_nix)?;
        Ok(target.into_vec())
    }

    pub fn open(&self, path: &OsStr, flags: u32) -> Result<u64, fuse3::Errno> {
        match intercepted(path) {
            Some(VirtualFile::Brightness) => {
                return Ok(self.handles.insert_virtual(VirtualFile::Brightness));
            }
            Some(VirtualFile::ActualBrightness) => {
                let access = oflag_from_bits(flags) & OFlag::O_ACCMODE;
                if access != OFlag::O_RDONLY {
                    return Err(fuse3::Errno::from(libc::EACCES));
                }
                return Ok(self.handles.insert_virtual(VirtualFile::ActualBrightness));
            }
            None => {}
        }

        let oflag = (oflag_from_bits(flags) | OFlag::O_NOFOLLOW | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            & !(OFlag::O_CREAT | OFlag::O_NONBLOCK);
        let rel = os_to_cstring(normalize(path))?;
        let fd = openat(self.ctx.dir(), rel.as_c_str(), oflag, Mode::empty())
            .map_err(errno_from_nix)?;
        Ok(self.handles.insert_file(fd))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        let value = match handle {
            Handle::Virtual(VirtualFile::Brightness) => self.ctx.target(),
            Handle::Virtual(VirtualFile::ActualBrightness) => self.ctx.actual()?,
            Handle::File(fd) => {
                let mut buf = vec![0u8; size as usize];
                let len = retry_eintr(|| pread(fd.as_fd(), &mut buf, offset as i64))
                    .map_err(errno_from_nix)?;
                buf.truncate(len);
                return Ok(buf);
            }
            Handle::Dir(_) => return Err(fuse3::Errno::from(libc::EISDIR)),
        };

        let line = format!("{value}\n");
        Ok(slice_at(line.as_bytes(), offset, size).to_vec())
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        match handle {
            Handle::Virtual(VirtualFile::Brightness) => {
                let requested =
                    parse_leading_int(data).ok_or_else(|| fuse3::Errno::from(libc::EINVAL))?;
                self.set_brightness(requested)?;
                Ok(data.len() as u32)
            }
            Handle::Virtual(VirtualFile::ActualBrightness) => Err(fuse3::Errno::from(libc::EBADF)),
            Handle::File(fd) => {
                let written = retry_eintr(|| pwrite(fd.as_fd(), data, offset as i64))
                    .map_err(errno_from_nix)?;
                Ok(written as u32)
            }
            Handle::Dir(_) => Err(fuse3::Errno::from(libc::EISDIR)),
        }
    }

    fn set_brightness(&self, requested: i64) -> Result<u32, fuse3::Errno> {
        self.ctx
            .set_target(requested, |value| self.backend.apply(value))
            .map_err(|err| {
                error!(%err, requested, "cannot apply brightness");
                self.escalate.escalate("brightness can no longer be applied");
                fuse3::Errno::from(libc::EIO)
            })
    }

    pub fn release(&self, fh: u64) {
        self.handles.remove(fh);
    }

    pub fn opendir(&self, path: &OsStr) -> Result<u64, fuse3::Errno> {
        let rel = os_to_cstring(normalize(path))?;
        let fd = openat(
            self.ctx.dir(),
            rel.as_c_str(),
            OFlag::O_RDONLY
                | OFlag::O_DIRECTORY
                | OFlag::O_NOFOLLOW
                | OFlag::O_NOCTTY
                | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(errno_from_nix)?;
        Ok(self.handles.insert_dir(fd))
    }

    /// Entries of an open directory in the order the backend returns them,
    /// `.` and `..` included.
    pub fn list_dir(&self, fh: u64) -> Result<Vec<DirEntryInfo>, fuse3::Errno> {
        let dir_fd = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        let mut dir = Dir::openat(
            dir_fd.as_fd(),
            ".",
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(errno_from_nix)?;

        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(errno_from_nix)?;
            let name = OsStr::from_bytes(entry.file_name().to_bytes()).to_owned();
            let kind = match entry.file_type() {
                Some(kind) => file_type_from_dir_type(kind),
                None => fstatat(
                    dir_fd.as_fd(),
                    entry.file_name(),
                    AtFlags::AT_SYMLINK_NOFOLLOW,
                )
                .map(|stat| file_type_from_mode(stat.st_mode))
                .unwrap_or(FileType::RegularFile),
            };
            entries.push(DirEntryInfo { name, kind });
        }
        Ok(entries)
    }

    /// Attributes of `name` inside the directory `dir`, open as `fh`. The
    /// root's `..` reports the root itself rather than what lies outside it.
    pub fn stat_entry(
        &self,
        dir: &OsStr,
        fh: u64,
        name: &OsStr,
    ) -> Result<FileAttr, fuse3::Errno> {
        if name == OsStr::new("..") && normalize(dir) == OsStr::new(".") {
            return self.stat(dir);
        }
        let dir_fd = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        let name = os_to_cstring(name)?;
        let stat = fstatat(dir_fd.as_fd(), name.as_c_str(), AtFlags::AT_SYMLINK_NOFOLLOW)
            .map_err(errno_from_nix)?;
        Ok(file_attr_from_stat(&stat))
    }

    pub fn releasedir(&self, fh: u64) {
        self.handles.remove(fh);
    }

    pub fn statfs(&self) -> Result<Statvfs, fuse3::Errno> {
        fstatvfs(self.ctx.dir()).map_err(errno_from_nix)
    }
}
