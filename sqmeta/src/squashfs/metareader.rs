use std::cmp::min;
use std::io::{self, Read, Seek, SeekFrom};
use std::mem;

use tracing::trace;

use super::block::{MetaBlockHeader, Position, META_BLOCK_SIZE, META_HEADER_SIZE};
use super::compressed::Compress;
use super::error::{Error, Result};
use super::metadata::{DirEntry, DirHeader, Inode};
use super::superblock::Superblock;

/// Allocate a zeroed buffer, reporting failure instead of aborting
pub(crate) fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::Allocation)?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Reader over a region of compressed meta-data blocks.
///
/// SquashFS stores its meta-data (inodes, directory listings, lookup tables) in blocks of up to
/// 8 KiB that are compressed independently and written back to back, each behind a 2-byte
/// header. Records are not aligned to blocks, so a single inode may start in one block and end in
/// the next. This reader hides that: after a [`seek`] to a block header and an offset into the
/// block's uncompressed data, [`read_into`] returns bytes from the decoded block and silently
/// loads and decodes the following block whenever a read runs past the end of the current one.
///
/// Every block start handed to the reader must lie in the window `[start, limit)` given at
/// construction; anything else is reported as [`Error::OutOfBounds`]. Only one decoded block is
/// held at a time. It is replaced wholesale when the reader moves to a different block, and
/// reused when a seek targets the block that is already loaded.
///
/// The reader keeps no per-directory state, so one instance can serve any number of interleaved
/// directory walks through [`ReaddirState`](super::ReaddirState).
///
/// [`seek`]: MetaReader::seek
/// [`read_into`]: MetaReader::read_into
#[derive(Debug)]
pub struct MetaReader<R, C> {
    inner: R,                   // Backing reader on the compressed stream
    comp: C,                    // Decompressor for blocks without the uncompressed flag
    start: u64,                 // Lowest valid block start
    limit: u64,                 // End of the region; no block may extend past it
    block_start: u64,           // Absolute position of the loaded block's header
    next_block: u64,            // Absolute position of the block that follows it
    data: Vec<u8>,              // Decoded contents of the loaded block
    offset: usize,              // Read offset within the decoded block
    loaded: bool,
}

impl<R: Read + Seek, C: Compress> MetaReader<R, C> {
    /// Create a reader for the blocks in `[start, limit)`. Until the first seek, reads begin with
    /// the block at `start`.
    pub fn new(inner: R, comp: C, start: u64, limit: u64) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(META_BLOCK_SIZE).map_err(|_| Error::Allocation)?;
        Ok(Self {
            inner,
            comp,
            start,
            limit,
            block_start: start,
            next_block: start,
            data,
            offset: 0,
            loaded: false,
        })
    }

    fn out_of_bounds(&self, position: u64) -> Error {
        Error::OutOfBounds { position, start: self.start, limit: self.limit }
    }

    /// Read and decode the block whose header is at `block_start`, replacing the loaded one.
    fn load_block(&mut self, block_start: u64) -> Result<()> {
        // Whatever happens below, the old block is no longer the current one
        self.loaded = false;
        self.data.clear();
        self.offset = 0;

        if let Err(e) = self.decode_block(block_start) {
            self.data.clear();
            return Err(e);
        }
        self.loaded = true;
        Ok(())
    }

    // Decodes into the buffer reserved at construction; a block never outgrows it
    fn decode_block(&mut self, block_start: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(block_start))?;
        let header = MetaBlockHeader::read(&mut self.inner)?;
        let next_block = block_start + header.disk_len();
        if next_block > self.limit {
            return Err(self.out_of_bounds(next_block));
        }

        if header.compressed {
            let mut payload = alloc_buffer(header.size.into())?;
            self.inner.read_exact(&mut payload)?;
            let decoded = self.comp.decompress(&payload, META_BLOCK_SIZE)?;
            self.data.extend_from_slice(&decoded);
        } else {
            self.data.resize(header.size.into(), 0);
            self.inner.read_exact(&mut self.data)?;
        }
        trace!(block_start, disk_size = header.size, compressed = header.compressed, size = self.data.len(), "loaded meta-data block");

        self.block_start = block_start;
        self.next_block = next_block;
        Ok(())
    }

    /// Position the reader at `offset` bytes into the uncompressed contents of the block whose
    /// header is at the absolute position `block_start`.
    pub fn seek(&mut self, block_start: u64, offset: usize) -> Result<()> {
        if block_start < self.start || block_start >= self.limit {
            return Err(self.out_of_bounds(block_start));
        }

        if !self.loaded || block_start != self.block_start {
            self.load_block(block_start)?;
        }

        if offset > self.data.len() {
            return Err(Error::OutOfBounds { position: offset as u64, start: 0, limit: self.data.len() as u64 });
        }
        self.offset = offset;
        Ok(())
    }

    /// Fill `buf` completely, moving on to the following blocks as needed.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut buf = buf;
        while !buf.is_empty() {
            if self.offset == self.data.len() {
                self.seek(self.next_block, 0)?;
                if self.data.is_empty() {
                    return Err(Error::corrupt(format!("empty meta-data block at {}", self.block_start)));
                }
            }
            let n = min(buf.len(), self.data.len() - self.offset);
            let (head, tail) = mem::take(&mut buf).split_at_mut(n);
            head.copy_from_slice(&self.data[self.offset..self.offset + n]);
            self.offset += n;
            buf = tail;
        }
        Ok(())
    }

    /// Where the next read will come from. A reader parked at the very end of a block reports
    /// the start of the following block, so the value can always be fed back to [`seek`].
    ///
    /// [`seek`]: MetaReader::seek
    pub fn position(&self) -> Position {
        if self.offset == self.data.len() {
            Position::new(self.next_block, 0)
        } else {
            Position::new(self.block_start, self.offset as u32)
        }
    }

    /// The `[start, limit)` window this reader is confined to
    pub fn window(&self) -> (u64, u64) {
        (self.start, self.limit)
    }

    pub fn read_dir_header(&mut self) -> Result<DirHeader> {
        DirHeader::read(self)
    }

    pub fn read_dir_entry(&mut self) -> Result<DirEntry> {
        DirEntry::read(self)
    }

    /// Upper bound on the bytes that can still be read before the end of the window. Every
    /// block after the loaded one takes at least 3 bytes on disk and decodes to at most 8 KiB.
    pub fn remaining_bound(&self) -> u64 {
        let in_block = (self.data.len() - self.offset) as u64;
        let blocks_left = self.limit.saturating_sub(self.next_block) / (META_HEADER_SIZE + 1);
        in_block.saturating_add(blocks_left.saturating_mul(META_BLOCK_SIZE as u64))
    }

    /// Seek to an inode and decode it. `block_start` is absolute, not relative to the inode
    /// table.
    pub fn read_inode(&mut self, sb: &Superblock, block_start: u64, offset: usize) -> Result<Inode> {
        self.seek(block_start, offset)?;
        let avail = self.remaining_bound();
        Inode::read_bounded(self, sb.block_size, avail)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek, C: Compress> Read for MetaReader<R, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset == self.data.len() {
            self.seek(self.next_block, 0)?;
        }
        let n = min(buf.len(), self.data.len() - self.offset);
        buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
