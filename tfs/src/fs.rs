use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use thiserror::Error;

use crate::block::BlockStore;
use crate::config::TFSBuilder;
use crate::dir::Directory;
use crate::file::{FileHandle, OpenFileTable};
use crate::node::{Inode, InodeKind, InodeTable};
use crate::sync;
use crate::{BlockNumber, InodeNumber, ROOT_INUM};

bitflags! {
    // Encodes open filesystem call options http://man7.org/linux/man-pages/man2/open.2.html.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        /// Create the file when it does not exist.
        const CREATE = 0b001;
        /// Drop the contents of an existing file.
        const TRUNCATE = 0b010;
        /// Start at the end of the file instead of the beginning.
        const APPEND = 0b100;
    }
}

/// The fixed-size table a failed allocation ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Blocks,
    Inodes,
    OpenFiles,
    DirEntries,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Blocks => "data blocks",
            Resource::Inodes => "inodes",
            Resource::OpenFiles => "open file table slots",
            Resource::DirEntries => "directory entries",
        })
    }
}

#[derive(Error, Debug)]
pub enum TFSError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("found no file at path")]
    NotFound,
    #[error("a file named {0:?} already exists")]
    AlreadyExists(String),
    #[error("out of {0}")]
    Exhausted(Resource),
    #[error("{0} is not open")]
    InvalidHandle(FileHandle),
    #[error("block {0} is not an allocated data block")]
    InvalidBlock(BlockNumber),
    #[error("block {0} is already free")]
    AlreadyFree(BlockNumber),
    #[error("file block {block_pos} is inside the file but has no data block")]
    CorruptReference { block_pos: usize },
    #[error("offset {offset} is past the end of the file ({size} bytes)")]
    InvalidOffset { offset: usize, size: usize },
    #[error("file would exceed the largest addressable size")]
    FileTooLarge,
    #[error("write stopped after {written} bytes")]
    ShortWrite {
        written: usize,
        #[source]
        source: Box<TFSError>,
    },
    #[error("root directory was created as inode {0}")]
    RootInode(InodeNumber),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("host file system error")]
    Host(#[from] std::io::Error),
}

/// A snapshot of a file's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inumber: InodeNumber,
    pub kind: InodeKind,
    pub size: usize,
}

/// An in-memory file system with a single flat directory.
///
/// Every operation takes `&self`; share one instance between threads with an `Arc`.
/// Reads and writes on unrelated files only meet at the block allocator. Name
/// resolution that may create, truncate or remove a file is serialized by one
/// structural mutex.
///
/// Locks are always taken in this order, and never two inode locks at once:
/// structural mutex, open file entry, inode, then the allocator and block locks.
pub struct TFS {
    blocks: BlockStore,
    inodes: InodeTable,
    root: Directory,
    open_files: OpenFileTable,
    structure: Mutex<()>,
}

impl TFS {
    /// Initializes an empty file system with the default capacities.
    pub fn create() -> Result<Self, TFSError> {
        TFSBuilder::new().build()
    }

    pub fn builder() -> TFSBuilder {
        TFSBuilder::new()
    }

    pub(crate) fn with_capacities(
        data_blocks: usize,
        inodes: usize,
        open_files: usize,
        dir_entries: usize,
    ) -> Result<Self, TFSError> {
        let blocks = BlockStore::new(data_blocks);
        let inode_table = InodeTable::new(inodes);

        let root = inode_table.create(InodeKind::Directory)?;
        if root != ROOT_INUM {
            return Err(TFSError::RootInode(root));
        }
        let root = Directory::new(inode_table.get(root)?, dir_entries);

        info!(
            "Created file system with {} data blocks, {} inodes, {} open files, {} directory entries.",
            data_blocks, inodes, open_files, dir_entries
        );
        Ok(TFS {
            blocks,
            inodes: inode_table,
            root,
            open_files: OpenFileTable::new(open_files),
            structure: Mutex::new(()),
        })
    }

    /// Tears the file system down. Every handle still open is discarded with it.
    pub fn destroy(self) {
        info!(
            "Destroying file system with {} inodes and {} open files.",
            self.inodes.total_nodes(),
            self.open_files.open_count()
        );
    }

    /// Resolves a path to its inode number without side effects.
    pub fn lookup(&self, path: &str) -> Result<InodeNumber, TFSError> {
        let name = file_name(path)?;
        self.root.lookup(name, &self.blocks)
    }

    /// Opens the file at `path` and returns a handle positioned at its start, or at its
    /// end with [`OpenMode::APPEND`].
    pub fn open(&self, path: &str, mode: OpenMode) -> Result<FileHandle, TFSError> {
        let name = file_name(path)?;

        let (inumber, node, offset) = {
            let _structure = sync::lock(&self.structure);
            match self.root.lookup(name, &self.blocks) {
                Ok(inumber) => {
                    let node = self.inodes.get(inumber)?;
                    let offset = if mode.contains(OpenMode::TRUNCATE) {
                        self.truncate(inumber, &node)?;
                        0
                    } else if mode.contains(OpenMode::APPEND) {
                        node.read().size()
                    } else {
                        0
                    };
                    (inumber, node, offset)
                }
                Err(TFSError::NotFound) if mode.contains(OpenMode::CREATE) => {
                    let inumber = self.create_file(name)?;
                    (inumber, self.inodes.get(inumber)?, 0)
                }
                Err(err) => return Err(err),
            }
        };

        let fh = self.open_files.insert(inumber, node, offset).map_err(|err| {
            warn!("cannot open {}: {}", path, err);
            err
        })?;
        debug!("opened {} (inode {}) as {} at offset {}", path, inumber, fh, offset);
        Ok(fh)
    }

    pub fn close(&self, fh: FileHandle) -> Result<(), TFSError> {
        self.open_files.remove(fh)?;
        debug!("closed {}", fh);
        Ok(())
    }

    /// Writes `buf` at the handle's offset and moves the offset past it. Returns the
    /// number of bytes requested; a failure part way through is reported as
    /// [`TFSError::ShortWrite`] and the bytes before it stay written.
    pub fn write(&self, fh: FileHandle, buf: &[u8]) -> Result<usize, TFSError> {
        let entry = self.open_files.get(fh)?;
        let mut file = sync::lock(&entry);
        let node = Arc::clone(&file.node);

        let mut data = node.write();
        data.ensure_live()?;
        match data.write_at(file.offset, buf, &self.blocks) {
            Ok(written) => {
                file.offset += written;
                Ok(written)
            }
            Err(err) => {
                if let TFSError::ShortWrite { written, .. } = err {
                    file.offset += written;
                }
                warn!("write to {} failed: {}", fh, err);
                Err(err)
            }
        }
    }

    /// Reads up to `len` bytes from the handle's offset, stopping early at the end of
    /// the file.
    pub fn read(&self, fh: FileHandle, len: usize) -> Result<Vec<u8>, TFSError> {
        let mut buf = vec![0; len];
        let read = self.read_into(fh, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Like [`TFS::read`], filling the caller's buffer and returning the byte count.
    pub fn read_into(&self, fh: FileHandle, buf: &mut [u8]) -> Result<usize, TFSError> {
        let entry = self.open_files.get(fh)?;
        let mut file = sync::lock(&entry);
        let node = Arc::clone(&file.node);

        let data = node.read();
        data.ensure_live()?;
        let read = data.read_at(file.offset, buf, &self.blocks)?;
        file.offset += read;
        Ok(read)
    }

    /// Removes the name from the directory and deletes its inode along with every
    /// block it holds. Handles still open on it fail from then on.
    pub fn unlink(&self, path: &str) -> Result<(), TFSError> {
        let name = file_name(path)?;
        let _structure = sync::lock(&self.structure);
        let inumber = self.root.remove_entry(name, &self.blocks)?;
        self.inodes.delete(inumber, &self.blocks)?;
        debug!("unlinked {} (inode {})", path, inumber);
        Ok(())
    }

    pub fn stat(&self, path: &str) -> Result<Stat, TFSError> {
        let inumber = self.lookup(path)?;
        let node = self.inodes.get(inumber)?;
        let data = node.read();
        data.ensure_live()?;
        Ok(Stat {
            inumber,
            kind: node.kind(),
            size: data.size(),
        })
    }

    /// Names in the root directory with their inode numbers.
    pub fn list(&self) -> Result<Vec<(String, InodeNumber)>, TFSError> {
        self.root.entries(&self.blocks)
    }

    /// Data blocks not currently referenced by any inode.
    pub fn free_blocks(&self) -> usize {
        self.blocks.free_count()
    }

    /// Allocates a file inode and links it into the root directory. Must run under the
    /// structural mutex.
    fn create_file(&self, name: &str) -> Result<InodeNumber, TFSError> {
        let inumber = self.inodes.create(InodeKind::File).map_err(|err| {
            warn!("cannot create {:?}: {}", name, err);
            err
        })?;
        if let Err(err) = self.root.add_entry(inumber, name, &self.blocks) {
            // No orphaned inodes.
            if let Err(cleanup) = self.inodes.delete(inumber, &self.blocks) {
                warn!("cannot release inode {} of {:?}: {}", inumber, name, cleanup);
            }
            return Err(err);
        }
        Ok(inumber)
    }

    fn truncate(&self, inumber: InodeNumber, node: &Arc<Inode>) -> Result<(), TFSError> {
        let mut data = node.write();
        data.ensure_live()?;
        if data.size() > 0 {
            let freed = data.truncate(&self.blocks)?;
            debug!("truncated inode {}, released {} blocks", inumber, freed);
        }
        Ok(())
    }
}

/// Strips the leading separator from an absolute path. Any further separators are part
/// of the name; the namespace is flat.
fn file_name(path: &str) -> Result<&str, TFSError> {
    match path.strip_prefix('/') {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(TFSError::InvalidPath(format!(
            "path must start with \"/\" and name a file: {:?}",
            path
        ))),
    }
}
