use crate::dir::DirEntry;
use crate::fs::{TFSError, TFS};
use crate::node::MAX_FILE_SIZE;
use crate::BLOCK_SIZE;

const DEFAULT_DATA_BLOCKS: usize = 1024;
const DEFAULT_INODES: usize = 50;
const DEFAULT_OPEN_FILES: usize = 20;
/// As many entries as fit in the directory's first block.
const DEFAULT_DIR_ENTRIES: usize = BLOCK_SIZE / DirEntry::SIZE;

/// Sizes the fixed tables of a file system before it is created. Every table is
/// allocated up front; running out of one later is an ordinary error.
#[derive(Debug, Clone)]
pub struct TFSBuilder {
    data_blocks: usize,
    inodes: usize,
    open_files: usize,
    dir_entries: usize,
}

impl Default for TFSBuilder {
    fn default() -> Self {
        Self {
            data_blocks: DEFAULT_DATA_BLOCKS,
            inodes: DEFAULT_INODES,
            open_files: DEFAULT_OPEN_FILES,
            dir_entries: DEFAULT_DIR_ENTRIES,
        }
    }
}

impl TFSBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of data blocks in the block store.
    pub fn with_data_blocks(mut self, blocks: usize) -> Self {
        self.data_blocks = blocks;
        self
    }

    /// Sets the number of inode slots, the root directory's included.
    pub fn with_inodes(mut self, inodes: usize) -> Self {
        self.inodes = inodes;
        self
    }

    /// Sets how many handles may be open at once.
    pub fn with_open_files(mut self, open_files: usize) -> Self {
        self.open_files = open_files;
        self
    }

    /// Sets how many names the root directory can hold.
    pub fn with_dir_entries(mut self, dir_entries: usize) -> Self {
        self.dir_entries = dir_entries;
        self
    }

    pub fn build(self) -> Result<TFS, TFSError> {
        self.validate()?;
        TFS::with_capacities(
            self.data_blocks,
            self.inodes,
            self.open_files,
            self.dir_entries,
        )
    }

    fn validate(&self) -> Result<(), TFSError> {
        let sizes = [
            ("data blocks", self.data_blocks),
            ("inodes", self.inodes),
            ("open files", self.open_files),
            ("directory entries", self.dir_entries),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(TFSError::InvalidConfig(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.inodes > u32::MAX as usize {
            return Err(TFSError::InvalidConfig(format!(
                "at most {} inodes are addressable",
                u32::MAX
            )));
        }
        // The indirect block stores block numbers as u32 + 1.
        if self.data_blocks >= u32::MAX as usize {
            return Err(TFSError::InvalidConfig(format!(
                "at most {} data blocks are addressable",
                u32::MAX - 1
            )));
        }
        if self.dir_entries * DirEntry::SIZE > MAX_FILE_SIZE {
            return Err(TFSError::InvalidConfig(format!(
                "the root directory can address at most {} entries",
                MAX_FILE_SIZE / DirEntry::SIZE
            )));
        }
        Ok(())
    }
}
