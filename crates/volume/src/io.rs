//! Block stores and buffered block I/O. Everything above this layer deals in
//! whole 4 KiB blocks; the buffered reader/writer adapt byte streams (saves,
//! restores) onto block regions.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dedup_index_common::{empty_block, Block, BlockStore, IndexError, BYTES_PER_BLOCK};

/// Block store over a preallocated file.
pub struct FileStore {
    file: File,
    blocks: u64,
}

impl FileStore {
    /// Create (or truncate) a store of `blocks` 4 KiB blocks.
    pub fn create(path: &Path, blocks: u64) -> Result<Self, IndexError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks * BYTES_PER_BLOCK as u64)?;
        Ok(FileStore { file, blocks })
    }

    pub fn open(path: &Path, writable: bool) -> Result<Self, IndexError> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        Ok(FileStore {
            file,
            blocks: len / BYTES_PER_BLOCK as u64,
        })
    }
}

impl BlockStore for FileStore {
    fn read_block(&self, block: u64, buf: &mut Block) -> Result<(), IndexError> {
        if block >= self.blocks {
            return Err(IndexError::OutOfRange("block read past store"));
        }
        self.file
            .read_exact_at(buf, block * BYTES_PER_BLOCK as u64)?;
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &Block) -> Result<(), IndexError> {
        if block >= self.blocks {
            return Err(IndexError::OutOfRange("block write past store"));
        }
        self.file.write_all_at(buf, block * BYTES_PER_BLOCK as u64)?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn sync(&self) -> Result<(), IndexError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory store for tests, with a write-failure switch so callers can
/// exercise the read-only latch.
pub struct MemoryStore {
    blocks: Mutex<Vec<u8>>,
    block_count: u64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new(block_count: u64) -> Self {
        MemoryStore {
            blocks: Mutex::new(vec![0; (block_count * BYTES_PER_BLOCK as u64) as usize]),
            block_count,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Directly corrupt a byte, for torn-write and checksum tests.
    pub fn poke(&self, byte_offset: u64, value: u8) {
        self.blocks.lock().unwrap()[byte_offset as usize] = value;
    }

    pub fn peek(&self, byte_offset: u64) -> u8 {
        self.blocks.lock().unwrap()[byte_offset as usize]
    }
}

impl BlockStore for MemoryStore {
    fn read_block(&self, block: u64, buf: &mut Block) -> Result<(), IndexError> {
        if block >= self.block_count {
            return Err(IndexError::OutOfRange("block read past store"));
        }
        let data = self.blocks.lock().unwrap();
        let at = (block * BYTES_PER_BLOCK as u64) as usize;
        buf.copy_from_slice(&data[at..at + BYTES_PER_BLOCK]);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &Block) -> Result<(), IndexError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        if block >= self.block_count {
            return Err(IndexError::OutOfRange("block write past store"));
        }
        let mut data = self.blocks.lock().unwrap();
        let at = (block * BYTES_PER_BLOCK as u64) as usize;
        data[at..at + BYTES_PER_BLOCK].copy_from_slice(buf);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<(), IndexError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected sync failure",
            )));
        }
        Ok(())
    }
}

/// Hands out buffered readers and writers over block regions of one store.
#[derive(Clone)]
pub struct IoFactory {
    store: Arc<dyn BlockStore>,
}

impl IoFactory {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        IoFactory { store }
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn reader(&self, first_block: u64, block_count: u64) -> BufferedReader {
        BufferedReader {
            store: Arc::clone(&self.store),
            first_block,
            block_count,
            next_block: 0,
            buffer: empty_block(),
            buffered: false,
            offset: 0,
        }
    }

    pub fn writer(&self, first_block: u64, block_count: u64) -> BufferedWriter {
        BufferedWriter {
            store: Arc::clone(&self.store),
            first_block,
            block_count,
            next_block: 0,
            buffer: empty_block(),
            offset: 0,
        }
    }
}

/// Sequential byte reader over a block region; buffers one block.
pub struct BufferedReader {
    store: Arc<dyn BlockStore>,
    first_block: u64,
    block_count: u64,
    next_block: u64,
    buffer: Box<Block>,
    buffered: bool,
    offset: usize,
}

impl Read for BufferedReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if !self.buffered || self.offset == BYTES_PER_BLOCK {
            if self.next_block >= self.block_count {
                return Ok(0);
            }
            self.store
                .read_block(self.first_block + self.next_block, &mut self.buffer)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            self.next_block += 1;
            self.buffered = true;
            self.offset = 0;
        }
        let take = out.len().min(BYTES_PER_BLOCK - self.offset);
        out[..take].copy_from_slice(&self.buffer[self.offset..self.offset + take]);
        self.offset += take;
        Ok(take)
    }
}

/// Sequential byte writer over a block region; buffers one block and pads
/// the final partial block with zeros on `finish`.
pub struct BufferedWriter {
    store: Arc<dyn BlockStore>,
    first_block: u64,
    block_count: u64,
    next_block: u64,
    buffer: Box<Block>,
    offset: usize,
}

impl BufferedWriter {
    fn write_buffer(&mut self) -> Result<(), IndexError> {
        if self.next_block >= self.block_count {
            return Err(IndexError::NoSpace("buffered writer region"));
        }
        self.store
            .write_block(self.first_block + self.next_block, &self.buffer)?;
        self.next_block += 1;
        self.offset = 0;
        self.buffer.fill(0);
        Ok(())
    }

    /// Flush the partial tail block (zero padded). Idempotent.
    pub fn finish(&mut self) -> Result<(), IndexError> {
        if self.offset > 0 {
            self.write_buffer()?;
        }
        Ok(())
    }

    /// Blocks written so far, counting a partial tail.
    pub fn blocks_written(&self) -> u64 {
        self.next_block + if self.offset > 0 { 1 } else { 0 }
    }

    /// Write fence through the store.
    pub fn sync(&self) -> Result<(), IndexError> {
        self.store.sync()
    }
}

impl Write for BufferedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while written < data.len() {
            let room = BYTES_PER_BLOCK - self.offset;
            let take = room.min(data.len() - written);
            self.buffer[self.offset..self.offset + take]
                .copy_from_slice(&data[written..written + take]);
            self.offset += take;
            written += take;
            if self.offset == BYTES_PER_BLOCK {
                self.write_buffer().map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                })?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        let store = FileStore::create(&path, 8).unwrap();

        let mut block = *empty_block();
        block[0] = 0xAB;
        block[BYTES_PER_BLOCK - 1] = 0xCD;
        store.write_block(5, &block).unwrap();
        store.sync().unwrap();

        let mut read = *empty_block();
        store.read_block(5, &mut read).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[BYTES_PER_BLOCK - 1], 0xCD);

        assert!(matches!(
            store.read_block(8, &mut read),
            Err(IndexError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_file_store_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        {
            let store = FileStore::create(&path, 4).unwrap();
            let mut block = *empty_block();
            block[100] = 42;
            store.write_block(2, &block).unwrap();
            store.sync().unwrap();
        }
        let store = FileStore::open(&path, false).unwrap();
        assert_eq!(store.block_count(), 4);
        let mut read = *empty_block();
        store.read_block(2, &mut read).unwrap();
        assert_eq!(read[100], 42);
    }

    #[test]
    fn test_buffered_writer_reader_round_trip() {
        let store = Arc::new(MemoryStore::new(16));
        let factory = IoFactory::new(store);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut writer = factory.writer(2, 8);
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();
        assert_eq!(writer.blocks_written(), 3);

        let mut reader = factory.reader(2, 8);
        let mut read_back = vec![0u8; payload.len()];
        reader.read_exact(&mut read_back).unwrap();
        assert_eq!(read_back, payload);

        // Tail of the final block is zero padded.
        let mut tail = vec![0u8; BYTES_PER_BLOCK * 3 - payload.len()];
        reader.read_exact(&mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffered_writer_region_bound() {
        let store = Arc::new(MemoryStore::new(4));
        let factory = IoFactory::new(store);
        let mut writer = factory.writer(0, 1);
        let big = vec![0u8; 2 * BYTES_PER_BLOCK];
        assert!(writer.write_all(&big).is_err());
    }

    #[test]
    fn test_memory_store_write_failure() {
        let store = MemoryStore::new(2);
        let block = *empty_block();
        store.write_block(0, &block).unwrap();
        store.fail_writes(true);
        assert!(store.write_block(0, &block).is_err());
        assert!(store.sync().is_err());
        store.fail_writes(false);
        store.write_block(0, &block).unwrap();
    }
}
