use std::fmt;
use std::sync::{Arc, Mutex};

use crate::fs::{Resource, TFSError};
use crate::node::Inode;
use crate::sync;
use crate::InodeNumber;

/// A file descriptor: the slot an open file occupies in the open file table. A handle
/// is only ever handed out again after it has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

impl FileHandle {
    pub fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// One open session on an inode. The session pins the inode it was opened on, so a
/// recycled inode number never redirects it to another file.
#[derive(Debug)]
pub struct OpenFile {
    pub inumber: InodeNumber,
    pub node: Arc<Inode>,
    /// Where the next read or write through this handle starts.
    pub offset: usize,
}

/// Each slot holds its own mutex so a read or write can keep its session's offset
/// locked without blocking opens and closes of other handles.
pub struct OpenFileTable {
    entries: Mutex<Vec<Option<Arc<Mutex<OpenFile>>>>>,
}

impl OpenFileTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(vec![None; capacity]),
        }
    }

    pub fn insert(
        &self,
        inumber: InodeNumber,
        node: Arc<Inode>,
        offset: usize,
    ) -> Result<FileHandle, TFSError> {
        let mut entries = sync::lock(&self.entries);
        let slot = entries
            .iter()
            .position(Option::is_none)
            .ok_or(TFSError::Exhausted(Resource::OpenFiles))?;
        entries[slot] = Some(Arc::new(Mutex::new(OpenFile {
            inumber,
            node,
            offset,
        })));
        Ok(FileHandle(slot))
    }

    pub fn get(&self, fh: FileHandle) -> Result<Arc<Mutex<OpenFile>>, TFSError> {
        sync::lock(&self.entries)
            .get(fh.0)
            .and_then(Option::clone)
            .ok_or(TFSError::InvalidHandle(fh))
    }

    pub fn remove(&self, fh: FileHandle) -> Result<(), TFSError> {
        sync::lock(&self.entries)
            .get_mut(fh.0)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(TFSError::InvalidHandle(fh))
    }

    /// The number of handles currently open.
    pub fn open_count(&self) -> usize {
        sync::lock(&self.entries)
            .iter()
            .filter(|entry| entry.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InodeKind, InodeTable};

    fn file_inode() -> Arc<Inode> {
        let inodes = InodeTable::new(1);
        inodes.get(inodes.create(InodeKind::File).unwrap()).unwrap()
    }

    #[test]
    fn handles_are_reused_only_after_remove() {
        let table = OpenFileTable::new(2);
        let first = table.insert(1, file_inode(), 0).unwrap();
        let second = table.insert(1, file_inode(), 10).unwrap();
        assert_ne!(first, second);
        match table.insert(2, file_inode(), 0).unwrap_err() {
            TFSError::Exhausted(Resource::OpenFiles) => (),
            err => panic!("Unexpected error type: {:?}", err),
        }

        table.remove(first).unwrap();
        assert_eq!(table.open_count(), 1);
        assert_eq!(table.insert(3, file_inode(), 0).unwrap(), first);
    }

    #[test]
    fn entries_keep_their_own_offsets() {
        let table = OpenFileTable::new(4);
        let fh = table.insert(5, file_inode(), 42).unwrap();
        {
            let entry = table.get(fh).unwrap();
            let mut entry = entry.lock().unwrap();
            assert_eq!(entry.inumber, 5);
            assert_eq!(entry.offset, 42);
            entry.offset += 8;
        }
        assert_eq!(table.get(fh).unwrap().lock().unwrap().offset, 50);
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let table = OpenFileTable::new(1);
        let fh = table.insert(0, file_inode(), 0).unwrap();
        table.remove(fh).unwrap();

        assert!(table.get(fh).is_err());
        match table.remove(fh).unwrap_err() {
            TFSError::InvalidHandle(handle) => assert_eq!(handle, fh),
            err => panic!("Unexpected error type: {:?}", err),
        }
        assert!(table.get(FileHandle(9)).is_err());
    }
}
