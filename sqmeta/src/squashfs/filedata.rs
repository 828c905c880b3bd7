use std::fs::File;
use std::io::{self, Cursor, Seek, SeekFrom, Write};

use tracing::debug;

use super::block::Block;
use super::error::{Error, Result};
use super::metadata::Inode;

/// Supplies the decompressed contents of a file's data blocks and tail fragment
pub trait BlockSource {
    /// Data block `index` of the file `inode`
    fn get_block(&mut self, inode: &Inode, index: usize) -> Result<Block>;

    /// The tail end of the file `inode`, stored in a fragment block
    fn get_fragment(&mut self, inode: &Inode) -> Result<Block>;
}

impl<B: BlockSource + ?Sized> BlockSource for &mut B {
    fn get_block(&mut self, inode: &Inode, index: usize) -> Result<Block> {
        (**self).get_block(inode, index)
    }

    fn get_fragment(&mut self, inode: &Inode) -> Result<Block> {
        (**self).get_fragment(inode)
    }
}

/// Destination of a reconstructed file. Besides plain writes, a sink must be able to take its
/// final size up front and to step over a region without writing it, which is how holes are
/// left in sparse output.
pub trait DataSink: Write {
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    /// Advance the write position by `len` bytes
    fn skip(&mut self, len: u64) -> io::Result<()>;
}

impl DataSink for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        let len = i64::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.seek(SeekFrom::Current(len))?;
        Ok(())
    }
}

impl DataSink for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        let pos = self.position().checked_add(len)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.set_position(pos);
        Ok(())
    }
}

fn write_zeros<S: Write + ?Sized>(sink: &mut S, len: u64) -> io::Result<()> {
    const ZEROS: [u8; 4096] = [0; 4096];
    let mut left = len;
    while left > 0 {
        let n = left.min(ZEROS.len() as u64) as usize;
        sink.write_all(&ZEROS[..n])?;
        left -= n as u64;
    }
    Ok(())
}

/// Reconstruct the contents of the file `inode` into `sink`.
///
/// Blocks are fetched from `source` in order and written out back to back; the part of the file
/// not covered by its blocks comes from a single fragment lookup at the end. Sparse blocks (with
/// an on-disk size of zero) stand for `block_size` bytes of zeros, or fewer if the file ends
/// earlier. With `allow_sparse`, the sink is sized up front and sparse blocks are skipped over,
/// leaving holes; otherwise the zeros are written explicitly.
pub fn dump_file<S, B>(inode: &Inode, sink: &mut S, block_size: u32, allow_sparse: bool, source: &mut B) -> Result<()>
where S: DataSink + ?Sized,
      B: BlockSource + ?Sized,
{
    let info = inode.file_info().ok_or(Error::NotFile)?;
    let mut remaining = info.file_size;
    debug!(inode = inode.inode_number, size = remaining, blocks = info.block_sizes.len(), allow_sparse, "dumping file");

    if allow_sparse {
        sink.set_len(remaining).map_err(Error::SparseOutput)?;
    }

    for (index, size) in info.block_sizes.iter().enumerate() {
        if size.is_sparse() {
            let len = remaining.min(block_size.into());
            if allow_sparse {
                sink.skip(len).map_err(Error::SparseOutput)?;
            } else {
                write_zeros(sink, len)?;
            }
            remaining -= len;
        } else {
            let block = source.get_block(inode, index)?;
            sink.write_all(&block.data)?;
            remaining = remaining.saturating_sub(block.size() as u64);
        }
    }

    if remaining > 0 {
        let fragment = source.get_fragment(inode)?;
        let tail = usize::try_from(remaining).ok()
            .filter(|&tail| tail <= fragment.size())
            .ok_or_else(|| Error::corrupt(format!(
                "fragment of {} bytes is too short for the {remaining} byte tail", fragment.size())))?;
        sink.write_all(&fragment.data[..tail])?;
    }
    Ok(())
}
