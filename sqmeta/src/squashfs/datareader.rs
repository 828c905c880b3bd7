use std::io::{Read, Seek, SeekFrom};

use tracing::trace;

use super::block::{Block, DataBlockSize};
use super::compressed::Compress;
use super::error::{Error, Result};
use super::filedata::BlockSource;
use super::metadata::{FileInfo, FragmentLookupTable, Inode};
use super::metareader::alloc_buffer;
use super::superblock::Superblock;

/// Fetches and decompresses the data blocks and fragments of files in an image.
///
/// The most recently used fragment block is kept decoded, since the tails of neighbouring files
/// usually share one.
#[derive(Debug)]
pub struct DataReader<R, C> {
    inner: R,
    comp: C,
    block_size: u32,
    fragments: FragmentLookupTable,
    cached_fragment: Option<(u32, Block)>,
}

impl<R: Read + Seek, C: Compress> DataReader<R, C> {
    /// Create a reader for the image described by `sb`. This loads the fragment table.
    pub fn new(mut inner: R, comp: C, sb: &Superblock) -> Result<Self> {
        let fragments = FragmentLookupTable::read(&mut inner, &comp, sb)?;
        Ok(Self { inner, comp, block_size: sb.block_size, fragments, cached_fragment: None })
    }

    fn read_block(&mut self, start: u64, size: DataBlockSize) -> Result<Vec<u8>> {
        let mut payload = alloc_buffer(size.disk_size() as usize)?;
        self.inner.seek(SeekFrom::Start(start))?;
        self.inner.read_exact(&mut payload)?;
        trace!(start, ?size, "read data block");
        if size.is_compressed() {
            self.comp.decompress(&payload, self.block_size as usize)
        } else if payload.len() > self.block_size as usize {
            Err(Error::corrupt(format!("uncompressed block of {} bytes", payload.len())))
        } else {
            Ok(payload)
        }
    }

    fn file_info(inode: &Inode) -> Result<&FileInfo> {
        inode.file_info().ok_or(Error::NotFile)
    }
}

impl<R: Read + Seek, C: Compress> BlockSource for DataReader<R, C> {
    fn get_block(&mut self, inode: &Inode, index: usize) -> Result<Block> {
        let info = Self::file_info(inode)?;
        let size = *info.block_sizes.get(index)
            .ok_or_else(|| Error::corrupt(format!("file has no block {index}")))?;

        // Every block is full except possibly the last, when there is no fragment
        let block_size = u64::from(self.block_size);
        let expected = info.file_size.saturating_sub(index as u64 * block_size).min(block_size) as usize;
        if size.is_sparse() {
            return Ok(Block::zeroed(expected));
        }

        // Blocks are stored back to back from blocks_start
        let start = info.blocks_start + info.block_sizes[..index].iter()
            .map(|s| u64::from(s.disk_size()))
            .sum::<u64>();
        let data = self.read_block(start, size)?;
        if data.len() != expected {
            return Err(Error::corrupt(format!("block {index} decodes to {} bytes, expected {expected}", data.len())));
        }
        Ok(Block::new(data))
    }

    fn get_fragment(&mut self, inode: &Inode) -> Result<Block> {
        let info = Self::file_info(inode)?;
        if !info.has_fragment() {
            return Err(Error::corrupt("file has no fragment"));
        }

        let cached = matches!(&self.cached_fragment, Some((index, _)) if *index == info.frag_index);
        if !cached {
            let entry = *self.fragments.get(info.frag_index)?;
            let data = self.read_block(entry.start, entry.size)?;
            self.cached_fragment = Some((info.frag_index, Block::new(data)));
        }

        let fragment = match &self.cached_fragment {
            Some((_, block)) => block,
            None => return Err(Error::corrupt("fragment block not loaded")),
        };
        let tail = (info.file_size % u64::from(self.block_size)) as usize;
        let start = info.frag_offset as usize;
        let data = fragment.data.get(start..start + tail)
            .ok_or_else(|| Error::corrupt(format!(
                "fragment tail {start}+{tail} outside of {} byte fragment block", fragment.size())))?;
        Ok(Block::new(data.to_vec()))
    }
}
