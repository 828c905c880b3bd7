use std::fmt;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::error::{Error, Result};

/// SquashFS meta-data block size is fixed by the on-disk format
pub const META_BLOCK_SIZE: usize = 8192;

/// Size of the header preceding every meta-data block
pub const META_HEADER_SIZE: u64 = 2;

const META_UNCOMPRESSED: u16 = 0x8000;
const DATA_UNCOMPRESSED: u32 = 0x0100_0000;
const DATA_SIZE_MASK: u32 = 0x00FF_FFFF;

/// The 16-bit header in front of a meta-data block. The low 15 bits hold the on-disk payload
/// size; the top bit is set when the payload is stored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaBlockHeader {
    pub size: u16,
    pub compressed: bool,
}

impl MetaBlockHeader {
    pub fn new(size: usize, compressed: bool) -> Result<Self> {
        if size > META_BLOCK_SIZE {
            return Err(Error::corrupt(format!("meta-data block size too big -- {size}")));
        }
        Ok(Self { size: size as u16, compressed })
    }

    pub fn from_raw(raw: u16) -> Result<Self> {
        Self::new((raw & !META_UNCOMPRESSED).into(), raw & META_UNCOMPRESSED == 0)
    }

    pub fn to_raw(self) -> u16 {
        if self.compressed {
            self.size
        } else {
            self.size | META_UNCOMPRESSED
        }
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        Self::from_raw(r.read_u16::<LittleEndian>()?)
    }

    pub fn write<W: Write>(self, w: &mut W) -> Result<()> {
        w.write_u16::<LittleEndian>(self.to_raw())?;
        Ok(())
    }

    /// Number of bytes the block occupies on disk, header included
    pub fn disk_len(self) -> u64 {
        META_HEADER_SIZE + u64::from(self.size)
    }
}

/// Location of a byte in a meta-data block stream: the absolute position of a block header
/// plus an offset into that block's uncompressed contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub block_start: u64,
    pub offset: u32,
}

impl Position {
    pub fn new(block_start: u64, offset: u32) -> Self {
        Self { block_start, offset }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.block_start, self.offset)
    }
}

/// A data block or fragment size word, as stored in file inodes and the fragment table
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DataBlockSize(pub u32);

impl DataBlockSize {
    pub fn new(disk_size: u32, compressed: bool) -> Self {
        let flag = if compressed { 0 } else { DATA_UNCOMPRESSED };
        Self((disk_size & DATA_SIZE_MASK) | flag)
    }

    pub fn sparse() -> Self {
        Self(0)
    }

    pub fn disk_size(self) -> u32 {
        self.0 & DATA_SIZE_MASK
    }

    pub fn is_compressed(self) -> bool {
        self.0 & DATA_UNCOMPRESSED == 0
    }

    /// A block with no on-disk data is a hole of zero bytes
    pub fn is_sparse(self) -> bool {
        self.disk_size() == 0
    }
}

impl fmt::Debug for DataBlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sparse() {
            write!(f, "sparse")
        } else {
            write!(f, "{}{}", self.disk_size(), if self.is_compressed() { "" } else { " (raw)" })
        }
    }
}

/// Decompressed contents of one data block or fragment. Owned by whoever fetched it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn zeroed(size: usize) -> Self {
        Self { data: vec![0; size] }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
