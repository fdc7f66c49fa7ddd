use crate::passthrough::{Passthrough, intercepted};
use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::DirectoryEntryPlus;
use fuse3::SetAttr;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::trace;

const ATTR_TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 4096;
/// Kernel FUSE ABI open flag: bypass the page cache for this handle.
const FOPEN_DIRECT_IO: u32 = 1 << 0;

fn traced<T>(
    op: &'static str,
    path: Option<&OsStr>,
    res: Result<T, fuse3::Errno>,
) -> Result<T, fuse3::Errno> {
    match &res {
        Ok(_) => trace!(op, ?path, "ok"),
        Err(err) => trace!(op, ?path, ?err, "failed"),
    }
    res
}

/// FUSE front-end over a [`Passthrough`].
pub struct BacklightFs {
    inner: Passthrough,
}

impl BacklightFs {
    pub fn new(inner: Passthrough) -> Self {
        Self { inner }
    }

    fn attr_reply(&self, path: &OsStr) -> Result<ReplyAttr, fuse3::Errno> {
        let attr = self.inner.stat(path)?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr,
        })
    }
}

impl PathFilesystem for BacklightFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        let ctx = self.inner.context();
        tracing::info!(
            dir = %ctx.path().display(),
            max_brightness = ctx.max_brightness(),
            target = ctx.target(),
            "filesystem initialised"
        );
        Ok(ReplyInit {
            max_write: NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN),
        })
    }

    async fn destroy(&self, _req: Request) {
        tracing::info!(open_handles = self.inner.open_handles(), "filesystem destroyed");
    }

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let attr = traced("lookup", Some(&path), self.inner.stat(&path))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        if let Some(res) = fh.and_then(|id| self.inner.stat_handle(id)) {
            let attr = traced("getattr", path, res)?;
            return Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr,
            });
        }

        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        traced("getattr", Some(path), self.attr_reply(path))
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;

        if set_attr.mode.is_some() || set_attr.uid.is_some() || set_attr.gid.is_some() {
            return traced("setattr", Some(path), Err(fuse3::Errno::from(libc::EPERM)));
        }
        if let Some(size) = set_attr.size {
            traced("truncate", Some(path), self.inner.truncate(path, size))?;
        }
        self.attr_reply(path)
    }

    async fn readlink(&self, _req: Request, path: &OsStr) -> Result<ReplyData, fuse3::Errno> {
        let target = traced("readlink", Some(path), self.inner.readlink(path))?;
        Ok(Bytes::from(target).into())
    }

    async fn open(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let fh = traced("open", Some(path), self.inner.open(path, flags))?;
        Ok(ReplyOpen {
            fh,
            flags: open_reply_flags(path),
        })
    }

    async fn read(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let data = traced("read", path, self.inner.read(fh, offset, size))?;
        Ok(Bytes::from(data).into())
    }

    async fn write(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let written = traced("write", path, self.inner.write(fh, offset, data))?;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        self.inner.release(fh);
        traced("release", path, Ok(fh)).map(|_| ())
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        _fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        Ok(())
    }

    async fn opendir(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let fh = traced("opendir", Some(path), self.inner.opendir(path))?;
        Ok(ReplyOpen { fh, flags })
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let listed = traced("readdir", Some(path), self.inner.list_dir(fh))?;

        let entries: Vec<fuse3::Result<DirectoryEntry>> = listed
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| {
                Ok(DirectoryEntry {
                    kind: entry.kind,
                    name: entry.name,
                    offset: idx as i64 + 1,
                })
            })
            .skip(offset.max(0) as usize)
            .collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let listed = traced("readdirplus", Some(parent), self.inner.list_dir(fh))?;

        let entries: Vec<fuse3::Result<DirectoryEntryPlus>> = listed
            .into_iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(idx, entry)| {
                let attr = self.inner.stat_entry(parent, fh, &entry.name)?;
                Ok(DirectoryEntryPlus {
                    kind: entry.kind,
                    name: entry.name,
                    offset: idx as i64 + 1,
                    attr,
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                })
            })
            .collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        path: &OsStr,
        fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        self.inner.releasedir(fh);
        traced("releasedir", Some(path), Ok(fh)).map(|_| ())
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        let stats = self.inner.statfs()?;
        Ok(ReplyStatFs {
            blocks: stats.blocks(),
            bfree: stats.blocks_free(),
            bavail: stats.blocks_available(),
            files: stats.files(),
            ffree: stats.files_free(),
            bsize: stats.block_size() as u32,
            namelen: stats.name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }
}

/// Intercepted values change underneath the reported size, so every read of
/// them must reach the filesystem.
fn open_reply_flags(path: &OsStr) -> u32 {
    if intercepted(path).is_some() {
        FOPEN_DIRECT_IO
    } else {
        0
    }
}

fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    let mut composed = OsString::from(parent);
    if parent != OsStr::new("/") {
        composed.push("/");
    }
    composed.push(name);
    composed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_paths_join_without_double_slash() {
        assert_eq!(
            make_child_path(OsStr::new("/"), OsStr::new("brightness")),
            OsString::from("/brightness")
        );
        assert_eq!(
            make_child_path(OsStr::new("/power"), OsStr::new("control")),
            OsString::from("/power/control")
        );
    }

    #[test]
    fn intercepted_files_bypass_page_cache() {
        assert_eq!(open_reply_flags(OsStr::new("/brightness")), FOPEN_DIRECT_IO);
        assert_eq!(
            open_reply_flags(OsStr::new("/actual_brightness")),
            FOPEN_DIRECT_IO
        );
        assert_eq!(open_reply_flags(OsStr::new("/max_brightness")), 0);
        assert_eq!(open_reply_flags(OsStr::new("/power/brightness")), 0);
    }
}
