use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::BufWriter;
use std::path::Path;

use crate::file::FileHandle;
use crate::fs::{OpenMode, TFSError, TFS};

/// Bytes moved per read or write call while copying.
const COPY_CHUNK: usize = 1024;

impl TFS {
    /// Appends the contents of the file at `source` to the host file `dest`, creating
    /// the host file when it does not exist. Returns the number of bytes copied.
    pub fn copy_to_external<P: AsRef<Path>>(
        &self,
        source: &str,
        dest: P,
    ) -> Result<usize, TFSError> {
        let fh = self.open(source, OpenMode::empty())?;
        let copied = self.copy_out(fh, dest.as_ref());
        self.close(fh)?;
        let copied = copied?;
        debug!("copied {} bytes from {} to {}", copied, source, dest.as_ref().display());
        Ok(copied)
    }

    /// Replaces the contents of the file at `dest` with the host file `source`,
    /// creating it when it does not exist. Returns the number of bytes copied.
    pub fn copy_from_external<P: AsRef<Path>>(
        &self,
        source: P,
        dest: &str,
    ) -> Result<usize, TFSError> {
        let host = File::open(source.as_ref())?;
        let fh = self.open(dest, OpenMode::CREATE | OpenMode::TRUNCATE)?;
        let copied = self.copy_in(host, fh);
        self.close(fh)?;
        let copied = copied?;
        debug!("copied {} bytes from {} to {}", copied, source.as_ref().display(), dest);
        Ok(copied)
    }

    fn copy_out(&self, fh: FileHandle, dest: &Path) -> Result<usize, TFSError> {
        let host = OpenOptions::new().create(true).append(true).open(dest)?;
        let mut writer = BufWriter::new(host);
        let mut buffer = [0; COPY_CHUNK];
        let mut copied = 0;
        loop {
            let read = self.read_into(fh, &mut buffer)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read])?;
            copied += read;
        }
        writer.flush()?;
        Ok(copied)
    }

    fn copy_in(&self, mut host: File, fh: FileHandle) -> Result<usize, TFSError> {
        let mut buffer = [0; COPY_CHUNK];
        let mut copied = 0;
        loop {
            let read = host.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            copied += self.write(fh, &buffer[..read])?;
        }
        Ok(copied)
    }
}
