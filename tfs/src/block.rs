use std::sync::{Mutex, RwLock};

use crate::alloc::{Bitmap, State};
use crate::fs::{Resource, TFSError};
use crate::sync;
use crate::{BlockNumber, BLOCK_SIZE};

pub type Block = [u8; BLOCK_SIZE];

/// A fixed arena of data blocks living entirely in memory.
///
/// Ownership of the bytes stays here; inodes only ever hold block numbers. The
/// allocation bitmap sits behind its own mutex so allocations coming from different
/// inodes' I/O paths never race, and each block carries its own lock so reads and
/// writes against unrelated blocks do not contend.
pub struct BlockStore {
    blocks: Box<[RwLock<Block>]>,
    data_map: Mutex<Bitmap>,
}

impl BlockStore {
    pub fn new(count: usize) -> Self {
        Self {
            blocks: (0..count).map(|_| RwLock::new([0; BLOCK_SIZE])).collect(),
            data_map: Mutex::new(Bitmap::new(count)),
        }
    }

    /// Reserves the first free block. Recycled blocks are zeroed before they are
    /// handed out so a fresh block never leaks a previous owner's bytes.
    pub fn allocate(&self) -> Result<BlockNumber, TFSError> {
        let blocknr = sync::lock(&self.data_map)
            .alloc()
            .ok_or(TFSError::Exhausted(Resource::Blocks))?;
        sync::write(&self.blocks[blocknr]).fill(0);
        trace!("allocated data block {}", blocknr);
        Ok(blocknr)
    }

    /// Returns a block to the free pool. Freeing a block twice would let two inodes
    /// share it later, so it is rejected.
    pub fn free(&self, blocknr: BlockNumber) -> Result<(), TFSError> {
        let mut data_map = sync::lock(&self.data_map);
        match data_map.get(blocknr) {
            None => Err(TFSError::InvalidBlock(blocknr)),
            Some(State::Free) => Err(TFSError::AlreadyFree(blocknr)),
            Some(State::Used) => {
                data_map.set_free(blocknr);
                trace!("freed data block {}", blocknr);
                Ok(())
            }
        }
    }

    /// Runs `f` over the bytes of an allocated block.
    pub fn read_block<V>(
        &self,
        blocknr: BlockNumber,
        f: impl FnOnce(&Block) -> V,
    ) -> Result<V, TFSError> {
        let block = self.allocated(blocknr)?;
        let guard = sync::read(block);
        Ok(f(&*guard))
    }

    /// Runs `f` over the bytes of an allocated block with write access.
    pub fn write_block<V>(
        &self,
        blocknr: BlockNumber,
        f: impl FnOnce(&mut Block) -> V,
    ) -> Result<V, TFSError> {
        let block = self.allocated(blocknr)?;
        let mut guard = sync::write(block);
        Ok(f(&mut *guard))
    }

    pub fn free_count(&self) -> usize {
        let data_map = sync::lock(&self.data_map);
        data_map.capacity() - data_map.used()
    }

    fn allocated(&self, blocknr: BlockNumber) -> Result<&RwLock<Block>, TFSError> {
        match sync::lock(&self.data_map).get(blocknr) {
            Some(State::Used) => Ok(&self.blocks[blocknr]),
            _ => Err(TFSError::InvalidBlock(blocknr)),
        }
    }
}
