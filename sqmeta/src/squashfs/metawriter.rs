use std::cmp::min;
use std::collections::VecDeque;
use std::io::Write;

use tracing::trace;

use super::block::{MetaBlockHeader, Position, META_BLOCK_SIZE};
use super::compressed::Compress;
use super::error::{Error, Result};

/// Packs a byte stream into SquashFS meta-data blocks.
///
/// Appended bytes accumulate in a pending buffer. Whenever it reaches 8 KiB it is compressed and
/// emitted as one block; a block that doesn't shrink under compression is stored verbatim with
/// the uncompressed flag set in its header. Emitted blocks go straight to the sink, or, when the
/// writer keeps blocks in memory, are collected until [`write_to_file`] hands them to the sink
/// in order.
///
/// [`position`] is relative to the first block this writer emitted (or to the last [`reset`]),
/// which is how inode references and directory table offsets are expressed on disk.
///
/// [`write_to_file`]: MetaWriter::write_to_file
/// [`position`]: MetaWriter::position
/// [`reset`]: MetaWriter::reset
#[derive(Debug)]
pub struct MetaWriter<W, C> {
    inner: W,
    comp: C,
    pending: Vec<u8>,
    block_start: u64,
    keep_in_mem: bool,
    blocks: VecDeque<Vec<u8>>,
}

impl<W: Write, C: Compress> MetaWriter<W, C> {
    pub fn new(inner: W, comp: C, keep_in_mem: bool) -> Self {
        Self {
            inner,
            comp,
            pending: Vec::with_capacity(META_BLOCK_SIZE),
            block_start: 0,
            keep_in_mem,
            blocks: VecDeque::new(),
        }
    }

    /// Append bytes to the stream, emitting a block each time 8 KiB have accumulated.
    ///
    /// If emitting a block fails, the error is returned and the bytes of this call that are
    /// still pending are dropped: when no block was emitted during the call, the pending buffer
    /// is back to what it was before the call; otherwise it is empty.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let mark = self.pending.len();
        let mut emitted = false;
        let mut data = data;
        while !data.is_empty() {
            let n = min(data.len(), META_BLOCK_SIZE - self.pending.len());
            self.pending.extend_from_slice(&data[..n]);
            data = &data[n..];

            if self.pending.len() == META_BLOCK_SIZE {
                if let Err(e) = self.flush() {
                    self.pending.truncate(if emitted { 0 } else { mark });
                    return Err(e);
                }
                emitted = true;
            }
        }
        Ok(())
    }

    /// Emit whatever is pending as a block, even if it is not full. Does nothing when nothing
    /// is pending. On failure the pending bytes and the position are left unchanged.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let packed = self.comp.compress(&self.pending)?;
        let compressed = packed.len() < self.pending.len();
        let payload = if compressed { &packed[..] } else { &self.pending[..] };
        let header = MetaBlockHeader::new(payload.len(), compressed)?;

        let mut block = Vec::with_capacity(payload.len() + 2);
        header.write(&mut block)?;
        block.extend_from_slice(payload);

        let disk_len = block.len() as u64;
        if self.keep_in_mem {
            self.blocks.push_back(block);
        } else {
            self.inner.write_all(&block).map_err(Error::Io)?;
        }
        trace!(block_start = self.block_start, size = self.pending.len(), disk_len, compressed, "emitted meta-data block");

        self.block_start += disk_len;
        self.pending.clear();
        Ok(())
    }

    /// Where the next appended byte will land
    pub fn position(&self) -> Position {
        Position::new(self.block_start, self.pending.len() as u32)
    }

    /// Drop pending bytes and start counting positions from zero again. Blocks already
    /// collected in memory are kept.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.block_start = 0;
    }

    /// Write all blocks collected in memory to the sink, oldest first. Blocks are removed from
    /// the collection as they are written, so a failed call can be retried.
    pub fn write_to_file(&mut self) -> Result<()> {
        if !self.keep_in_mem {
            return Err(Error::NotInMemory);
        }
        while let Some(block) = self.blocks.front() {
            self.inner.write_all(block).map_err(Error::Io)?;
            self.blocks.pop_front();
        }
        Ok(())
    }

    /// Blocks collected in memory and not yet written
    pub fn blocks(&self) -> impl Iterator<Item = &[u8]> {
        self.blocks.iter().map(|b| &b[..])
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Give back the sink. Pending bytes and unwritten blocks are discarded.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    use crate::squashfs::metareader::MetaReader;
    use crate::squashfs::superblock::Compressor;

    struct FailingCompressor;

    impl Compress for FailingCompressor {
        fn compress(&self, _data: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Compression("out of luck".into()))
        }

        fn decompress(&self, _data: &[u8], _max_len: usize) -> Result<Vec<u8>> {
            Err(Error::Compression("out of luck".into()))
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn noise(len: usize) -> Vec<u8> {
        // xorshift; incompressible enough for any codec
        let mut x: u32 = 0x9E37_79B9;
        (0..len).map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        }).collect()
    }

    #[test]
    fn test_full_blocks_flush_on_append() -> Result<()> {
        let mut w = MetaWriter::new(Vec::new(), Compressor::None, false);
        w.append(&noise(META_BLOCK_SIZE))?;
        assert_eq!(w.position(), Position::new(2 + META_BLOCK_SIZE as u64, 0));
        assert_eq!(w.get_ref().len(), 2 + META_BLOCK_SIZE);
        assert_eq!(&w.get_ref()[..2], &(0x8000u16 | 8192).to_le_bytes());

        w.append(&noise(100))?;
        assert_eq!(w.position(), Position::new(2 + META_BLOCK_SIZE as u64, 100));
        Ok(())
    }

    #[test]
    fn test_flush_empty() -> Result<()> {
        let mut w = MetaWriter::new(Vec::new(), Compressor::None, false);
        w.flush()?;
        assert!(w.get_ref().is_empty());
        assert_eq!(w.position(), Position::new(0, 0));
        Ok(())
    }

    #[cfg(feature = "flate2")]
    #[test]
    fn test_incompressible_stored_raw() -> Result<()> {
        let data = noise(3000);
        let mut w = MetaWriter::new(Vec::new(), Compressor::Gzip, false);
        w.append(&data)?;
        w.flush()?;
        let out = w.into_inner();
        let header = MetaBlockHeader::from_raw(u16::from_le_bytes([out[0], out[1]]))?;
        assert!(!header.compressed);
        assert_eq!(usize::from(header.size), data.len());
        assert_eq!(&out[2..], &data[..]);
        Ok(())
    }

    #[cfg(feature = "flate2")]
    #[test]
    fn test_compressible_shrinks() -> Result<()> {
        let data = vec![b'z'; 5000];
        let mut w = MetaWriter::new(Vec::new(), Compressor::Gzip, false);
        w.append(&data)?;
        w.flush()?;
        let out = w.into_inner();
        let header = MetaBlockHeader::from_raw(u16::from_le_bytes([out[0], out[1]]))?;
        assert!(header.compressed);
        assert_eq!(header.disk_len(), out.len() as u64);
        assert!(out.len() < data.len());
        Ok(())
    }

    #[test]
    fn test_keep_in_mem() -> Result<()> {
        let data = noise(20000);
        let mut w = MetaWriter::new(Vec::new(), Compressor::None, true);
        w.append(&data)?;
        w.flush()?;
        assert!(w.get_ref().is_empty());
        assert_eq!(w.blocks().count(), 3);

        w.write_to_file()?;
        assert_eq!(w.blocks().count(), 0);
        let out = w.into_inner();
        assert_eq!(out.len(), data.len() + 3 * 2);

        let limit = out.len() as u64;
        let mut r = MetaReader::new(Cursor::new(out), Compressor::None, 0, limit)?;
        let mut buf = vec![0; data.len()];
        r.read_into(&mut buf)?;
        assert_eq!(buf, data);
        Ok(())
    }

    #[test]
    fn test_write_to_file_needs_memory() {
        let mut w = MetaWriter::new(Vec::new(), Compressor::None, false);
        assert!(matches!(w.write_to_file(), Err(Error::NotInMemory)));
    }

    #[test]
    fn test_reset() -> Result<()> {
        let mut w = MetaWriter::new(Vec::new(), Compressor::None, false);
        w.append(&noise(9000))?;
        assert_eq!(w.position(), Position::new(8194, 808));
        w.reset();
        assert_eq!(w.position(), Position::new(0, 0));
        w.flush()?;
        assert_eq!(w.get_ref().len(), 8194);
        Ok(())
    }

    #[test]
    fn test_failed_flush_keeps_state() -> Result<()> {
        let mut w = MetaWriter::new(Vec::new(), FailingCompressor, false);
        w.append(b"hello")?;
        assert!(matches!(w.flush(), Err(Error::Compression(_))));
        assert_eq!(w.position(), Position::new(0, 5));
        Ok(())
    }

    #[test]
    fn test_failed_append_restores_pending() -> Result<()> {
        let mut w = MetaWriter::new(Vec::new(), FailingCompressor, false);
        w.append(&[1; 100])?;
        assert!(matches!(w.append(&[2; META_BLOCK_SIZE]), Err(Error::Compression(_))));
        assert_eq!(w.position(), Position::new(0, 100));
        assert!(w.get_ref().is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_sink() -> Result<()> {
        let mut w = MetaWriter::new(BrokenSink, Compressor::None, false);
        assert!(matches!(w.append(&[0; META_BLOCK_SIZE + 10]), Err(Error::Io(_))));
        assert_eq!(w.position(), Position::new(0, 0));

        let mut w = MetaWriter::new(BrokenSink, Compressor::None, true);
        w.append(&[0; 10])?;
        w.flush()?;
        assert!(matches!(w.write_to_file(), Err(Error::Io(_))));
        assert_eq!(w.blocks().count(), 1);
        Ok(())
    }
}
