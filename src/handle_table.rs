use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// One of the two names answered by the filesystem itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualFile {
    Brightness,
    ActualBrightness,
}

#[derive(Debug, Clone)]
pub enum Handle {
    File(Arc<OwnedFd>),
    Dir(Arc<OwnedFd>),
    Virtual(VirtualFile),
}

impl Handle {
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Handle::File(fd) | Handle::Dir(fd) => Some(fd.as_fd()),
            Handle::Virtual(_) => None,
        }
    }
}

/// Per-open state keyed by the `fh` handed to the kernel. Removing an entry
/// drops the descriptor, which closes it exactly once.
#[derive(Debug, Default)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&self, fd: OwnedFd) -> u64 {
        self.insert(Handle::File(Arc::new(fd)))
    }

    pub fn insert_dir(&self, fd: OwnedFd) -> u64 {
        self.insert(Handle::Dir(Arc::new(fd)))
    }

    pub fn insert_virtual(&self, file: VirtualFile) -> u64 {
        self.insert(Handle::Virtual(file))
    }

    /// File or virtual handle; directory handles are not readable as files.
    pub fn get_file(&self, id: u64) -> Option<Handle> {
        match self.get(id)? {
            Handle::Dir(_) => None,
            handle => Some(handle),
        }
    }

    pub fn get_dir(&self, id: u64) -> Option<Arc<OwnedFd>> {
        match self.get(id)? {
            Handle::Dir(fd) => Some(fd),
            _ => None,
        }
    }

    pub fn remove(&self, id: u64) -> Option<Handle> {
        self.entries.write().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    fn insert(&self, handle: Handle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().unwrap().insert(id, handle);
        id
    }

    fn get(&self, id: u64) -> Option<Handle> {
        self.entries.read().unwrap().get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_kept_apart() {
        let table = HandleTable::new();
        let dir: OwnedFd = std::fs::File::open(std::env::temp_dir()).unwrap().into();
        let d = table.insert_dir(dir);
        let v = table.insert_virtual(VirtualFile::ActualBrightness);

        assert!(table.get_file(d).is_none());
        assert!(table.get_dir(d).is_some());
        assert!(table.get_dir(v).is_none());
        assert!(matches!(
            table.get_file(v),
            Some(Handle::Virtual(VirtualFile::ActualBrightness))
        ));
    }

    #[test]
    fn remove_releases_once() {
        let table = HandleTable::new();
        let id = table.insert_virtual(VirtualFile::Brightness);
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert_eq!(table.len(), 0);
    }
}
