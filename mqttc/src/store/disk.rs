//! Payload area with a free list of reusable blocks.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use tracing::trace;

use super::metadata::{read_varint, write_varint};
use crate::error::{Error, Result};

/// Byte storage behind a payload area.
pub trait Backing: Read + Write + Seek + Send {
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

impl Backing for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

impl Backing for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A contiguous unused range of the payload area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub position: u64,
    pub length: u64,
}

/// Allocates, reads and writes payload bytes.
///
/// Allocation is first-fit over the free list; freed blocks are merged with
/// their neighbours, and a block that reaches the end of the area shrinks
/// the area instead.
pub struct DiskManager {
    data: Mutex<Box<dyn Backing>>,
    free: Vec<FreeBlock>,
    end: u64,
}

impl std::fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskManager")
            .field("free", &self.free)
            .field("end", &self.end)
            .finish()
    }
}

impl DiskManager {
    /// Payload area held in memory.
    pub fn memory() -> Self {
        Self {
            data: Mutex::new(Box::new(Cursor::new(Vec::new()))),
            free: Vec::new(),
            end: 0,
        }
    }

    /// Open or create the payload file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let end = file.metadata()?.len();
        Ok(Self {
            data: Mutex::new(Box::new(file)),
            free: Vec::new(),
            end,
        })
    }

    /// Size of the payload area in bytes.
    pub fn len(&self) -> u64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    pub fn free_blocks(&self) -> &[FreeBlock] {
        &self.free
    }

    /// Store `bytes` and return their position.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let position = self.allocate(bytes.len() as u64);
        if !bytes.is_empty() {
            let mut data = self.data.lock();
            data.seek(SeekFrom::Start(position))?;
            data.write_all(bytes)?;
        }
        trace!("disk: wrote {} bytes at {}", bytes.len(), position);
        Ok(position)
    }

    pub fn read(&self, position: u64, length: u64) -> Result<Vec<u8>> {
        if position + length > self.end {
            return Err(Error::StoreCorrupted(format!(
                "read of {} bytes at {} past end {}",
                length, position, self.end
            )));
        }
        let mut buf = vec![0u8; length as usize];
        if length > 0 {
            let mut data = self.data.lock();
            data.seek(SeekFrom::Start(position))?;
            data.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    /// Return a block to the free list.
    pub fn free(&mut self, position: u64, length: u64) -> Result<()> {
        if length == 0 {
            return Ok(());
        }

        let at = self.free.partition_point(|b| b.position < position);
        self.free.insert(at, FreeBlock { position, length });

        // Merge with the following block, then with the preceding one.
        if at + 1 < self.free.len() && self.free[at].position + self.free[at].length == self.free[at + 1].position {
            self.free[at].length += self.free[at + 1].length;
            self.free.remove(at + 1);
        }
        let mut at = at;
        if at > 0 && self.free[at - 1].position + self.free[at - 1].length == self.free[at].position {
            self.free[at - 1].length += self.free[at].length;
            self.free.remove(at);
            at -= 1;
        }

        if self.free[at].position + self.free[at].length == self.end {
            self.end = self.free[at].position;
            self.free.remove(at);
            self.data.lock().set_len(self.end)?;
            trace!("disk: truncated payload area to {}", self.end);
        }
        Ok(())
    }

    /// Drop every payload.
    pub fn clear(&mut self) -> Result<()> {
        self.free.clear();
        self.end = 0;
        self.data.lock().set_len(0)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.data.lock().sync()?;
        Ok(())
    }

    /// xxh64 digest of the whole payload area.
    pub fn calculate_hash(&self) -> Result<u64> {
        let bytes = self.read(0, self.end)?;
        Ok(xxhash_rust::xxh64::xxh64(&bytes, 0))
    }

    /// Encode the free list as a varint count followed by position/length pairs.
    pub fn encode_free_list(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, self.free.len() as u32);
        for block in &self.free {
            write_varint(&mut out, block.position as u32);
            write_varint(&mut out, block.length as u32);
        }
        out
    }

    pub fn load_free_list(&mut self, mut buf: &[u8]) -> Result<()> {
        self.free.clear();
        if buf.is_empty() {
            return Ok(());
        }
        let count = read_varint(&mut buf)?;
        for _ in 0..count {
            let position = read_varint(&mut buf)? as u64;
            let length = read_varint(&mut buf)? as u64;
            if position + length > self.end {
                return Err(Error::StoreCorrupted(format!(
                    "free block {}+{} past end {}",
                    position, length, self.end
                )));
            }
            self.free.push(FreeBlock { position, length });
        }
        self.free.sort_by_key(|b| b.position);
        Ok(())
    }

    fn allocate(&mut self, length: u64) -> u64 {
        if length == 0 {
            return self.end;
        }
        if let Some(i) = self.free.iter().position(|b| b.length >= length) {
            let block = &mut self.free[i];
            let position = block.position;
            block.position += length;
            block.length -= length;
            if block.length == 0 {
                self.free.remove(i);
            }
            return position;
        }
        let position = self.end;
        self.end += length;
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read() {
        let mut disk = DiskManager::memory();
        let a = disk.append(b"hello").unwrap();
        let b = disk.append(b"world!").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 5);
        assert_eq!(disk.read(a, 5).unwrap(), b"hello");
        assert_eq!(disk.read(b, 6).unwrap(), b"world!");
        assert!(disk.read(b, 7).is_err());
    }

    #[test]
    fn test_first_fit_reuse() {
        let mut disk = DiskManager::memory();
        let a = disk.append(&[1; 10]).unwrap();
        let _b = disk.append(&[2; 10]).unwrap();
        disk.free(a, 10).unwrap();

        let c = disk.append(&[3; 4]).unwrap();
        assert_eq!(c, 0);
        assert_eq!(disk.free_blocks(), &[FreeBlock { position: 4, length: 6 }]);
        assert_eq!(disk.len(), 20);
    }

    #[test]
    fn test_coalesce_and_truncate() {
        let mut disk = DiskManager::memory();
        let a = disk.append(&[1; 8]).unwrap();
        let b = disk.append(&[2; 8]).unwrap();
        let c = disk.append(&[3; 8]).unwrap();
        let _d = disk.append(&[4; 8]).unwrap();

        disk.free(a, 8).unwrap();
        disk.free(c, 8).unwrap();
        disk.free(b, 8).unwrap();
        assert_eq!(disk.free_blocks(), &[FreeBlock { position: 0, length: 24 }]);

        disk.free(24, 8).unwrap();
        assert!(disk.free_blocks().is_empty());
        assert!(disk.is_empty());
    }

    #[test]
    fn test_free_list_encoding() {
        let mut disk = DiskManager::memory();
        let a = disk.append(&[1; 300]).unwrap();
        disk.append(&[2; 5]).unwrap();
        disk.free(a, 300).unwrap();

        let encoded = disk.encode_free_list();
        disk.load_free_list(&encoded).unwrap();
        assert_eq!(disk.free_blocks(), &[FreeBlock { position: 0, length: 300 }]);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let mut disk = DiskManager::memory();
        disk.append(b"abc").unwrap();
        let first = disk.calculate_hash().unwrap();
        disk.append(b"d").unwrap();
        assert_ne!(first, disk.calculate_hash().unwrap());
    }
}
