use std::mem::size_of;
use std::sync::Arc;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::block::BlockStore;
use crate::fs::{Resource, TFSError};
use crate::node::Inode;
use crate::InodeNumber;

/// Longest file name, in bytes, a directory entry can hold.
pub const MAX_FILE_NAME: usize = 40;

/// One fixed-width record of the root directory. An entry whose name starts with a
/// zero byte is an empty slot.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy)]
pub struct DirEntry {
    name: [u8; MAX_FILE_NAME],
    inumber: U32<LittleEndian>,
}

impl DirEntry {
    pub const SIZE: usize = size_of::<DirEntry>();

    pub fn new(name: &str, inumber: InodeNumber) -> Result<Self, TFSError> {
        let bytes = valid_name(name)?;
        let mut entry = Self::new_zeroed();
        entry.name[..bytes.len()].copy_from_slice(bytes);
        entry.inumber.set(inumber);
        Ok(entry)
    }

    pub fn is_unset(&self) -> bool {
        self.name[0] == 0
    }

    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MAX_FILE_NAME);
        &self.name[..len]
    }

    pub fn inumber(&self) -> InodeNumber {
        self.inumber.get()
    }
}

fn valid_name(name: &str) -> Result<&[u8], TFSError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_FILE_NAME || bytes.contains(&0) {
        return Err(TFSError::InvalidPath(format!(
            "file names must be 1 to {} bytes without NUL: {:?}",
            MAX_FILE_NAME, name
        )));
    }
    Ok(bytes)
}

/// The flat namespace: a directory inode whose file data is a sequence of
/// [`DirEntry`] records, read and written through the same block addressing as any
/// other file. Scans hold the directory inode's shared lock, mutations its exclusive
/// lock.
pub struct Directory {
    node: Arc<Inode>,
    capacity: usize,
}

impl Directory {
    pub fn new(node: Arc<Inode>, capacity: usize) -> Self {
        Self { node, capacity }
    }

    pub fn lookup(&self, name: &str, store: &BlockStore) -> Result<InodeNumber, TFSError> {
        let wanted = valid_name(name)?;
        let data = self.node.read();
        let mut entry = DirEntry::new_zeroed();
        for slot in 0..data.size() / DirEntry::SIZE {
            data.read_at(slot * DirEntry::SIZE, entry.as_bytes_mut(), store)?;
            if !entry.is_unset() && entry.name() == wanted {
                return Ok(entry.inumber());
            }
        }
        Err(TFSError::NotFound)
    }

    /// Stores `name -> inumber` in the first empty slot, growing the directory by one
    /// record when every existing slot is taken.
    pub fn add_entry(
        &self,
        inumber: InodeNumber,
        name: &str,
        store: &BlockStore,
    ) -> Result<(), TFSError> {
        let new_entry = DirEntry::new(name, inumber)?;
        let mut data = self.node.write();
        let slots = data.size() / DirEntry::SIZE;

        let mut free_slot = None;
        let mut entry = DirEntry::new_zeroed();
        for slot in 0..slots {
            data.read_at(slot * DirEntry::SIZE, entry.as_bytes_mut(), store)?;
            if entry.is_unset() {
                free_slot = free_slot.or(Some(slot));
            } else if entry.name() == new_entry.name() {
                return Err(TFSError::AlreadyExists(name.to_string()));
            }
        }

        let slot = free_slot.unwrap_or(slots);
        if slot >= self.capacity {
            warn!("directory full, cannot add {:?}", name);
            return Err(TFSError::Exhausted(Resource::DirEntries));
        }
        data.write_at(slot * DirEntry::SIZE, new_entry.as_bytes(), store)?;
        debug!("added directory entry {:?} -> inode {} in slot {}", name, inumber, slot);
        Ok(())
    }

    /// Clears the slot holding `name` and returns the inode it pointed at.
    pub fn remove_entry(&self, name: &str, store: &BlockStore) -> Result<InodeNumber, TFSError> {
        let wanted = valid_name(name)?;
        let mut data = self.node.write();
        let mut entry = DirEntry::new_zeroed();
        for slot in 0..data.size() / DirEntry::SIZE {
            data.read_at(slot * DirEntry::SIZE, entry.as_bytes_mut(), store)?;
            if !entry.is_unset() && entry.name() == wanted {
                data.write_at(slot * DirEntry::SIZE, DirEntry::new_zeroed().as_bytes(), store)?;
                debug!("removed directory entry {:?} from slot {}", name, slot);
                return Ok(entry.inumber());
            }
        }
        Err(TFSError::NotFound)
    }

    /// Names currently in the directory, in slot order.
    pub fn entries(&self, store: &BlockStore) -> Result<Vec<(String, InodeNumber)>, TFSError> {
        let data = self.node.read();
        let mut entry = DirEntry::new_zeroed();
        let mut entries = Vec::new();
        for slot in 0..data.size() / DirEntry::SIZE {
            data.read_at(slot * DirEntry::SIZE, entry.as_bytes_mut(), store)?;
            if !entry.is_unset() {
                entries.push((
                    String::from_utf8_lossy(entry.name()).into_owned(),
                    entry.inumber(),
                ));
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InodeKind, InodeTable};

    fn create_root(capacity: usize) -> (BlockStore, Directory) {
        let store = BlockStore::new(16);
        let table = InodeTable::new(2);
        let inumber = table.create(InodeKind::Directory).unwrap();
        (store, Directory::new(table.get(inumber).unwrap(), capacity))
    }

    #[test]
    fn entry_is_fixed_width() {
        assert_eq!(DirEntry::SIZE, MAX_FILE_NAME + 4);
        let entry = DirEntry::new("foo", 7).unwrap();
        assert_eq!(entry.name(), b"foo");
        assert_eq!(entry.inumber(), 7);
        assert!(DirEntry::new_zeroed().is_unset());
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert!(DirEntry::new("", 1).is_err());
        assert!(DirEntry::new(&"x".repeat(MAX_FILE_NAME + 1), 1).is_err());
        assert!(DirEntry::new(&"x".repeat(MAX_FILE_NAME), 1).is_ok());
    }

    #[test]
    fn lookup_finds_added_entries() {
        let (store, dir) = create_root(8);
        dir.add_entry(1, "foo", &store).unwrap();
        dir.add_entry(2, "bar/baz", &store).unwrap();

        assert_eq!(dir.lookup("foo", &store).unwrap(), 1);
        assert_eq!(dir.lookup("bar/baz", &store).unwrap(), 2);
        match dir.lookup("fo", &store).unwrap_err() {
            TFSError::NotFound => (),
            err => panic!("Unexpected error type: {:?}", err),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (store, dir) = create_root(8);
        dir.add_entry(1, "foo", &store).unwrap();
        match dir.add_entry(2, "foo", &store).unwrap_err() {
            TFSError::AlreadyExists(name) => assert_eq!(name, "foo"),
            err => panic!("Unexpected error type: {:?}", err),
        }
    }

    #[test]
    fn full_directory_is_exhausted() {
        let (store, dir) = create_root(2);
        dir.add_entry(1, "a", &store).unwrap();
        dir.add_entry(2, "b", &store).unwrap();
        match dir.add_entry(3, "c", &store).unwrap_err() {
            TFSError::Exhausted(Resource::DirEntries) => (),
            err => panic!("Unexpected error type: {:?}", err),
        }
    }

    #[test]
    fn removed_slots_are_reused_first() {
        let (store, dir) = create_root(3);
        dir.add_entry(1, "a", &store).unwrap();
        dir.add_entry(2, "b", &store).unwrap();
        dir.add_entry(3, "c", &store).unwrap();

        assert_eq!(dir.remove_entry("a", &store).unwrap(), 1);
        assert!(dir.lookup("a", &store).is_err());
        dir.add_entry(4, "d", &store).unwrap();

        let names: Vec<String> = dir
            .entries(&store)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["d", "b", "c"]);
    }

    #[test]
    fn entries_straddle_block_boundaries() {
        let (store, dir) = create_root(64);
        for i in 0..40 {
            dir.add_entry(i, &format!("file{}", i), &store).unwrap();
        }
        for i in 0..40 {
            assert_eq!(dir.lookup(&format!("file{}", i), &store).unwrap(), i);
        }
    }
}
