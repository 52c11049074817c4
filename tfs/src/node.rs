use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::alloc::Bitmap;
use crate::block::BlockStore;
use crate::fs::{Resource, TFSError};
use crate::sync;
use crate::{BlockNumber, InodeNumber, BLOCK_SIZE};

/// Block references stored inline in every inode.
pub const DIRECT_BLOCKS: usize = 10;
/// Block references that fit in one indirect block.
pub const REFS_PER_BLOCK: usize = BLOCK_SIZE / size_of::<U32<LittleEndian>>();
/// Largest number of data blocks one inode can address.
const MAX_FILE_BLOCKS: usize = DIRECT_BLOCKS + REFS_PER_BLOCK;
/// Largest file, in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

/// A block full of block references, the second level of the addressing scheme.
///
/// A slot holds `0` when unset and `n + 1` when it refers to block `n`, so a freshly
/// zeroed block reads back as an indirect block with every slot unset.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes)]
pub struct IndirectBlock {
    refs: [U32<LittleEndian>; REFS_PER_BLOCK],
}

const _: () = assert!(size_of::<IndirectBlock>() == BLOCK_SIZE);

impl IndirectBlock {
    fn get(&self, slot: usize) -> Option<BlockNumber> {
        match self.refs[slot].get() {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    fn set(&mut self, slot: usize, blocknr: BlockNumber) {
        self.refs[slot].set(blocknr as u32 + 1);
    }

    fn iter(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        (0..REFS_PER_BLOCK).filter_map(move |slot| self.get(slot))
    }
}

/// An allocated file or directory.
///
/// The kind is fixed at creation. Everything that changes afterwards lives in
/// [`InodeData`] behind the inode's own reader/writer lock: readers share it, writers,
/// truncation and deletion take it exclusively.
#[derive(Debug)]
pub struct Inode {
    kind: InodeKind,
    data: RwLock<InodeData>,
}

impl Inode {
    fn new(kind: InodeKind) -> Self {
        Self {
            kind,
            data: RwLock::new(InodeData::default()),
        }
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn read(&self) -> RwLockReadGuard<'_, InodeData> {
        sync::read(&self.data)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, InodeData> {
        sync::write(&self.data)
    }
}

#[derive(Debug, Default)]
pub struct InodeData {
    /// The total size of the file in bytes.
    size: usize,
    /// Pointers to the first `DIRECT_BLOCKS` data blocks of the file.
    direct: [Option<BlockNumber>; DIRECT_BLOCKS],
    /// Pointer to an [`IndirectBlock`] addressing the data blocks after the direct ones.
    indirect: Option<BlockNumber>,
    /// Set once the inode has been deleted. Handles opened before the delete may still
    /// reach the inode and must not touch the blocks it gave back.
    released: bool,
}

impl InodeData {
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fails with `NotFound` when the inode was deleted under the caller.
    pub fn ensure_live(&self) -> Result<(), TFSError> {
        if self.released {
            return Err(TFSError::NotFound);
        }
        Ok(())
    }

    /// Resolves the `block_pos`-th block of the file without allocating anything.
    fn block(
        &self,
        block_pos: usize,
        store: &BlockStore,
    ) -> Result<Option<BlockNumber>, TFSError> {
        if block_pos < DIRECT_BLOCKS {
            return Ok(self.direct[block_pos]);
        }
        if block_pos >= MAX_FILE_BLOCKS {
            return Err(TFSError::FileTooLarge);
        }
        match self.indirect {
            None => Ok(None),
            Some(indirect) => store
                .read_block(indirect, |block| {
                    IndirectBlock::ref_from(&block[..]).map(|refs| refs.get(block_pos - DIRECT_BLOCKS))
                })?
                .ok_or(TFSError::InvalidBlock(indirect)),
        }
    }

    /// Resolves the `block_pos`-th block of the file, allocating it (and the indirect
    /// block in front of it) when it is not there yet.
    fn block_or_alloc(
        &mut self,
        block_pos: usize,
        store: &BlockStore,
    ) -> Result<BlockNumber, TFSError> {
        if let Some(blocknr) = self.block(block_pos, store)? {
            return Ok(blocknr);
        }

        if block_pos < DIRECT_BLOCKS {
            let blocknr = store.allocate()?;
            self.direct[block_pos] = Some(blocknr);
            return Ok(blocknr);
        }

        let indirect = match self.indirect {
            Some(indirect) => indirect,
            None => {
                let indirect = store.allocate()?;
                self.indirect = Some(indirect);
                indirect
            }
        };
        let blocknr = store.allocate()?;
        let linked = store.write_block(indirect, |block| {
            IndirectBlock::mut_from(&mut block[..])
                .map(|refs| refs.set(block_pos - DIRECT_BLOCKS, blocknr))
        })?;
        if linked.is_none() {
            store.free(blocknr)?;
            return Err(TFSError::InvalidBlock(indirect));
        }
        Ok(blocknr)
    }

    /// Copies file bytes starting at `offset` into `buf`, returning how many bytes were
    /// copied. Never allocates; an unset reference inside the file means the block
    /// bookkeeping is broken.
    pub fn read_at(
        &self,
        offset: usize,
        buf: &mut [u8],
        store: &BlockStore,
    ) -> Result<usize, TFSError> {
        if offset > self.size {
            return Err(TFSError::InvalidOffset {
                offset,
                size: self.size,
            });
        }
        let to_read = buf.len().min(self.size - offset);

        let mut done = 0;
        while done < to_read {
            let block_pos = (offset + done) / BLOCK_SIZE;
            let within_block = (offset + done) % BLOCK_SIZE;
            let chunk = (to_read - done).min(BLOCK_SIZE - within_block);

            let blocknr = self
                .block(block_pos, store)?
                .ok_or(TFSError::CorruptReference { block_pos })?;
            store.read_block(blocknr, |block| {
                buf[done..done + chunk].copy_from_slice(&block[within_block..within_block + chunk])
            })?;
            trace!("read {} bytes from block {} (file block {})", chunk, blocknr, block_pos);
            done += chunk;
        }
        Ok(done)
    }

    /// Copies `buf` into the file starting at `offset`, allocating blocks as the write
    /// crosses into them, and grows the size to cover the written range.
    ///
    /// Bytes that landed before a failure stay in the file. When some did land the
    /// failure comes back as [`TFSError::ShortWrite`] carrying their count.
    pub fn write_at(
        &mut self,
        offset: usize,
        buf: &[u8],
        store: &BlockStore,
    ) -> Result<usize, TFSError> {
        // Writing past the end would leave unset references inside the file.
        if offset > self.size {
            return Err(TFSError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let mut written = 0;
        while written < buf.len() {
            let block_pos = (offset + written) / BLOCK_SIZE;
            let within_block = (offset + written) % BLOCK_SIZE;
            let chunk = (buf.len() - written).min(BLOCK_SIZE - within_block);

            let result = self.block_or_alloc(block_pos, store).and_then(|blocknr| {
                store.write_block(blocknr, |block| {
                    block[within_block..within_block + chunk]
                        .copy_from_slice(&buf[written..written + chunk])
                })?;
                trace!("wrote {} bytes to block {} (file block {})", chunk, blocknr, block_pos);
                Ok(())
            });
            if let Err(err) = result {
                return Err(match written {
                    0 => err,
                    written => TFSError::ShortWrite {
                        written,
                        source: Box::new(err),
                    },
                });
            }

            written += chunk;
            self.size = self.size.max(offset + written);
        }
        Ok(written)
    }

    /// Detaches every block the inode references, direct, indirect-addressed and the
    /// indirect block itself, and gives them back to the store. The size drops to zero.
    pub fn truncate(&mut self, store: &BlockStore) -> Result<usize, TFSError> {
        let mut blocks: Vec<BlockNumber> = self.direct.iter().flatten().copied().collect();
        if let Some(indirect) = self.indirect {
            let addressed = store
                .read_block(indirect, |block| {
                    IndirectBlock::ref_from(&block[..]).map(|refs| refs.iter().collect::<Vec<_>>())
                })?
                .ok_or(TFSError::InvalidBlock(indirect))?;
            blocks.extend(addressed);
            blocks.push(indirect);
        }

        // References go first so nothing points at a block once it is free.
        self.direct = [None; DIRECT_BLOCKS];
        self.indirect = None;
        self.size = 0;

        // Keep going past a failed free so the remaining blocks still go back.
        let mut first_err = None;
        for &blocknr in blocks.iter() {
            if let Err(err) = store.free(blocknr) {
                warn!("cannot free block {}: {}", blocknr, err);
                first_err = first_err.or(Some(err));
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(blocks.len()),
        }
    }
}

struct InodeGroup {
    nodes: BTreeMap<InodeNumber, Arc<Inode>>,
    alloc_tracker: Bitmap,
}

/// Fixed-capacity table of inode slots. Slot bookkeeping is guarded by the table's
/// mutex; the inodes themselves are shared out as `Arc`s so the table lock is never
/// held while an inode's own lock is waited on.
pub struct InodeTable {
    group: Mutex<InodeGroup>,
}

impl InodeTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            group: Mutex::new(InodeGroup {
                nodes: BTreeMap::new(),
                alloc_tracker: Bitmap::new(capacity),
            }),
        }
    }

    pub fn create(&self, kind: InodeKind) -> Result<InodeNumber, TFSError> {
        let mut group = sync::lock(&self.group);
        let inumber = group
            .alloc_tracker
            .alloc()
            .ok_or(TFSError::Exhausted(Resource::Inodes))? as InodeNumber;
        group.nodes.insert(inumber, Arc::new(Inode::new(kind)));
        debug!("created {:?} inode {}", kind, inumber);
        Ok(inumber)
    }

    pub fn get(&self, inumber: InodeNumber) -> Result<Arc<Inode>, TFSError> {
        sync::lock(&self.group)
            .nodes
            .get(&inumber)
            .cloned()
            .ok_or(TFSError::NotFound)
    }

    /// Releases every block of the inode, then recycles its slot. The inode's exclusive
    /// lock is held throughout so no reader or writer sees it half torn down.
    pub fn delete(&self, inumber: InodeNumber, store: &BlockStore) -> Result<(), TFSError> {
        let node = self.get(inumber)?;
        let mut data = node.write();
        data.ensure_live()?;
        let truncated = data.truncate(store);
        data.released = true;

        let mut group = sync::lock(&self.group);
        group.nodes.remove(&inumber);
        group.alloc_tracker.set_free(inumber as usize);
        let freed = truncated?;
        debug!("deleted inode {}, released {} blocks", inumber, freed);
        Ok(())
    }

    /// The number of allocated inodes, root included.
    pub fn total_nodes(&self) -> usize {
        sync::lock(&self.group).nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn indirect_block_fills_exactly_one_block() {
        assert_eq!(REFS_PER_BLOCK, 256);
        assert_eq!(MAX_FILE_SIZE, (10 + 256) * BLOCK_SIZE);
    }

    #[test]
    fn zeroed_indirect_block_has_every_slot_unset() {
        let mut refs = IndirectBlock::new_zeroed();
        assert_eq!(refs.iter().count(), 0);

        refs.set(0, 0);
        refs.set(255, 41);
        assert_eq!(refs.get(0), Some(0));
        assert_eq!(refs.get(1), None);
        assert_eq!(refs.iter().collect::<Vec<_>>(), vec![0, 41]);
    }

    #[test]
    fn writes_spanning_direct_and_indirect_blocks_read_back() {
        let store = BlockStore::new(64);
        let mut data = InodeData::default();
        let content = pattern(DIRECT_BLOCKS * BLOCK_SIZE + 1);

        assert_eq!(data.write_at(0, &content, &store).unwrap(), content.len());
        assert_eq!(data.size(), content.len());
        // Eleven data blocks plus the indirect block.
        assert_eq!(store.free_count(), 64 - 12);

        let mut buf = vec![0; content.len()];
        assert_eq!(data.read_at(0, &mut buf, &store).unwrap(), content.len());
        assert_eq!(buf, content);
    }

    #[test]
    fn overwrite_in_the_middle_keeps_size() {
        let store = BlockStore::new(8);
        let mut data = InodeData::default();
        data.write_at(0, &[1; 3000], &store).unwrap();
        data.write_at(1000, &[2; 100], &store).unwrap();
        assert_eq!(data.size(), 3000);

        let mut buf = vec![0; 3000];
        data.read_at(0, &mut buf, &store).unwrap();
        assert!(buf[..1000].iter().all(|&b| b == 1));
        assert!(buf[1000..1100].iter().all(|&b| b == 2));
        assert!(buf[1100..].iter().all(|&b| b == 1));
    }

    #[test]
    fn read_is_clamped_to_size() {
        let store = BlockStore::new(4);
        let mut data = InodeData::default();
        data.write_at(0, b"hello", &store).unwrap();

        let mut buf = [0; 16];
        assert_eq!(data.read_at(2, &mut buf, &store).unwrap(), 3);
        assert_eq!(&buf[..3], b"llo");
        assert_eq!(data.read_at(5, &mut buf, &store).unwrap(), 0);
        match data.read_at(6, &mut buf, &store).unwrap_err() {
            TFSError::InvalidOffset { offset: 6, size: 5 } => (),
            err => panic!("Unexpected error type: {:?}", err),
        }
    }

    #[test]
    fn write_past_end_of_file_is_rejected() {
        let store = BlockStore::new(4);
        let mut data = InodeData::default();
        assert!(data.write_at(1, b"x", &store).is_err());
        assert_eq!(store.free_count(), 4);
    }

    #[test]
    fn failed_allocation_reports_bytes_already_written() {
        let store = BlockStore::new(2);
        let mut data = InodeData::default();

        match data.write_at(0, &pattern(3 * BLOCK_SIZE), &store).unwrap_err() {
            TFSError::ShortWrite { written, source } => {
                assert_eq!(written, 2 * BLOCK_SIZE);
                match *source {
                    TFSError::Exhausted(Resource::Blocks) => (),
                    err => panic!("Unexpected error type: {:?}", err),
                }
            }
            err => panic!("Unexpected error type: {:?}", err),
        }
        // The committed part stays readable.
        assert_eq!(data.size(), 2 * BLOCK_SIZE);
        let mut buf = vec![0; 2 * BLOCK_SIZE];
        data.read_at(0, &mut buf, &store).unwrap();
        assert_eq!(buf, pattern(2 * BLOCK_SIZE));
    }

    #[test]
    fn writes_stop_at_the_largest_addressable_file() {
        let store = BlockStore::new(MAX_FILE_BLOCKS + 2);
        let mut data = InodeData::default();
        data.write_at(0, &vec![7; MAX_FILE_SIZE], &store).unwrap();

        match data.write_at(MAX_FILE_SIZE, b"x", &store).unwrap_err() {
            TFSError::FileTooLarge => (),
            err => panic!("Unexpected error type: {:?}", err),
        }
        assert_eq!(data.size(), MAX_FILE_SIZE);
    }

    #[test]
    fn truncate_returns_every_block_to_the_store() {
        let store = BlockStore::new(32);
        let mut data = InodeData::default();
        data.write_at(0, &pattern(12 * BLOCK_SIZE), &store).unwrap();
        assert_eq!(store.free_count(), 32 - 13);

        assert_eq!(data.truncate(&store).unwrap(), 13);
        assert_eq!(data.size(), 0);
        assert_eq!(store.free_count(), 32);

        // The inode is reusable after truncation.
        data.write_at(0, b"again", &store).unwrap();
        assert_eq!(data.size(), 5);
    }

    #[test]
    fn truncate_frees_remaining_blocks_after_a_failed_free() {
        let store = BlockStore::new(8);
        let mut data = InodeData::default();
        data.write_at(0, &pattern(3 * BLOCK_SIZE), &store).unwrap();
        let middle = data.direct[1].unwrap();
        store.free(middle).unwrap();

        match data.truncate(&store).unwrap_err() {
            TFSError::AlreadyFree(nr) => assert_eq!(nr, middle),
            err => panic!("Unexpected error type: {:?}", err),
        }
        assert_eq!(data.size(), 0);
        assert_eq!(store.free_count(), 8);
    }

    #[test]
    fn inode_table_hands_out_first_free_slot() {
        let store = BlockStore::new(4);
        let table = InodeTable::new(3);
        assert_eq!(table.create(InodeKind::Directory).unwrap(), 0);
        assert_eq!(table.create(InodeKind::File).unwrap(), 1);
        assert_eq!(table.create(InodeKind::File).unwrap(), 2);
        match table.create(InodeKind::File).unwrap_err() {
            TFSError::Exhausted(Resource::Inodes) => (),
            err => panic!("Unexpected error type: {:?}", err),
        }

        table.delete(1, &store).unwrap();
        assert_eq!(table.total_nodes(), 2);
        assert_eq!(table.create(InodeKind::File).unwrap(), 1);
    }

    #[test]
    fn deleted_inode_is_not_found_and_frees_blocks() {
        let store = BlockStore::new(16);
        let table = InodeTable::new(4);
        let inumber = table.create(InodeKind::File).unwrap();
        let node = table.get(inumber).unwrap();
        node.write().write_at(0, &pattern(4000), &store).unwrap();
        assert_eq!(node.kind(), InodeKind::File);

        table.delete(inumber, &store).unwrap();
        assert_eq!(store.free_count(), 16);
        assert!(table.get(inumber).is_err());
        // A holder of the old inode sees it as gone.
        assert!(node.read().ensure_live().is_err());
        match table.delete(inumber, &store).unwrap_err() {
            TFSError::NotFound => (),
            err => panic!("Unexpected error type: {:?}", err),
        }
    }
}
