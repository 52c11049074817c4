#[macro_use]
extern crate log;

mod alloc;
mod block;
mod config;
mod dir;
mod file;
mod fs;
mod io;
mod node;
mod sync;

pub use crate::config::TFSBuilder;
pub use crate::dir::MAX_FILE_NAME;
pub use crate::file::FileHandle;
pub use crate::fs::{OpenMode, Resource, Stat, TFSError, TFS};
pub use crate::node::{InodeKind, DIRECT_BLOCKS, MAX_FILE_SIZE, REFS_PER_BLOCK};

/// Every data block, direct or indirect, holds exactly this many bytes.
pub const BLOCK_SIZE: usize = 1024;

/// The root directory always occupies the first inode slot.
pub const ROOT_INUM: InodeNumber = 0;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// Index of an inode slot in the inode table.
pub type InodeNumber = u32;
