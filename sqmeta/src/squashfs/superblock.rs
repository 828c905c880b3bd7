use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::error::{Error, Result};
use super::metadata::EntryReference;

pub const MAGIC: u32 = 0x73717368;

/// Size of the super-block as stored at the start of an image
pub const SUPERBLOCK_SIZE: u64 = 96;

#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    pub inode_count: u32,
    pub mod_time: u32,
    pub block_size: u32,
    pub frag_count: u32,
    pub compressor: Compressor,
    pub block_log: u16,
    pub flags: SuperblockFlags,
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: EntryReference,
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

bitflags! {
    pub struct SuperblockFlags: u16 {
        const INODES_UNCOMPRESSED = 0x0001;
        const DATABLOCKS_UNCOMPRESSED = 0x0002;
        const FRAGMENTS_UNCOMPRESSED = 0x0008;
        const FRAGMENTS_NOT_USED = 0x0010;
        const FRAGMENTS_ALWAYS_GENERATED = 0x0020;
        const DATA_DEDUPLICATED = 0x0040;
        const NFS_EXPORT_EXISTS = 0x0080;
        const XATTRS_UNCOMPRESSED = 0x0100;
        const NO_XATTRS = 0x0200;
        const COMPRESSOR_OPTIONS_PRESENT = 0x0400;
        const ID_TABLE_UNCOMPRESSED = 0x0800;
    }
}

/// Compressor id stored in the super-block. `None` is not a valid on-disk id; it selects
/// pass-through storage for blocks that are kept raw.
#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzo = 2,
    Lzma = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
    #[num_enum(default)]
    Unknown = 0xFFFF,
}

impl Superblock {
    /// A super-block for a fresh image. Table locations are left for the caller to fill in once
    /// the tables have been written.
    pub fn new(compressor: Compressor, block_size: u32) -> Self {
        Superblock {
            magic: MAGIC,
            inode_count: 0,
            mod_time: 0,
            block_size,
            frag_count: 0,
            compressor,
            block_log: block_size.trailing_zeros() as u16,
            flags: SuperblockFlags::NO_XATTRS,
            id_count: 0,
            version_major: 4,
            version_minor: 0,
            root_inode: EntryReference::new(0, 0),
            bytes_used: SUPERBLOCK_SIZE,
            id_table: u64::MAX,
            xattr_table: u64::MAX,
            inode_table: u64::MAX,
            dir_table: u64::MAX,
            frag_table: u64::MAX,
            export_table: u64::MAX,
        }
    }

    pub fn read<R>(r: &mut R) -> Result<Superblock>
    where R: Read
    {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(Error::corrupt(format!("bad super-block magic {magic:#010x}")));
        }
        let sb = Superblock {
            magic,
            inode_count: r.read_u32::<LittleEndian>()?,
            mod_time: r.read_u32::<LittleEndian>()?,
            block_size: r.read_u32::<LittleEndian>()?,
            frag_count: r.read_u32::<LittleEndian>()?,
            compressor: Compressor::try_from(r.read_u16::<LittleEndian>()?)
                .map_err(|e| Error::corrupt(e.to_string()))?,
            block_log: r.read_u16::<LittleEndian>()?,
            flags: SuperblockFlags::from_bits_truncate(r.read_u16::<LittleEndian>()?),
            id_count: r.read_u16::<LittleEndian>()?,
            version_major: r.read_u16::<LittleEndian>()?,
            version_minor: r.read_u16::<LittleEndian>()?,
            root_inode: EntryReference::read(r)?,
            bytes_used: r.read_u64::<LittleEndian>()?,
            id_table: r.read_u64::<LittleEndian>()?,
            xattr_table: r.read_u64::<LittleEndian>()?,
            inode_table: r.read_u64::<LittleEndian>()?,
            dir_table: r.read_u64::<LittleEndian>()?,
            frag_table: r.read_u64::<LittleEndian>()?,
            export_table: r.read_u64::<LittleEndian>()?,
        };

        // Data block sizes are powers of two between 4K and 1M, and block_log must agree
        if !sb.block_size.is_power_of_two() || !(4096..=1 << 20).contains(&sb.block_size)
            || u32::from(sb.block_log) != sb.block_size.trailing_zeros()
        {
            return Err(Error::corrupt(format!("invalid block size {} (log {})", sb.block_size, sb.block_log)));
        }
        Ok(sb)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Superblock> {
        Superblock::read(&mut &b[..])
    }

    pub fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write
    {
        w.write_u32::<LittleEndian>(self.magic)?;
        w.write_u32::<LittleEndian>(self.inode_count)?;
        w.write_u32::<LittleEndian>(self.mod_time)?;
        w.write_u32::<LittleEndian>(self.block_size)?;
        w.write_u32::<LittleEndian>(self.frag_count)?;
        w.write_u16::<LittleEndian>(self.compressor.into())?;
        w.write_u16::<LittleEndian>(self.block_log)?;
        w.write_u16::<LittleEndian>(self.flags.bits())?;
        w.write_u16::<LittleEndian>(self.id_count)?;
        w.write_u16::<LittleEndian>(self.version_major)?;
        w.write_u16::<LittleEndian>(self.version_minor)?;
        self.root_inode.write(w)?;
        w.write_u64::<LittleEndian>(self.bytes_used)?;
        w.write_u64::<LittleEndian>(self.id_table)?;
        w.write_u64::<LittleEndian>(self.xattr_table)?;
        w.write_u64::<LittleEndian>(self.inode_table)?;
        w.write_u64::<LittleEndian>(self.dir_table)?;
        w.write_u64::<LittleEndian>(self.frag_table)?;
        w.write_u64::<LittleEndian>(self.export_table)?;
        Ok(())
    }
}
