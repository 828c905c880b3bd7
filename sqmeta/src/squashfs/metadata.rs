use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::debug;

use super::block::{DataBlockSize, META_BLOCK_SIZE};
use super::compressed::Compress;
use super::error::{Error, Result};
use super::metareader::MetaReader;
use super::superblock::{Superblock, SUPERBLOCK_SIZE};

/// Fragment index of a file whose tail is stored in its last full data block
pub const NO_FRAGMENT: u32 = 0xFFFF_FFFF;

/// Xattr index of an inode without extended attributes
pub const NO_XATTR: u32 = 0xFFFF_FFFF;

/// Maximum number of entries that may share one directory header
pub const MAX_DIR_ENTRIES: u32 = 256;

/// Maximum length of a directory entry name
pub const MAX_NAME_LEN: usize = 256;

/// Maximum length of a symbolic link target
pub const MAX_SYMLINK_LEN: u32 = 4096;

/// Encoded size of a directory header
pub const DIR_HEADER_SIZE: usize = 12;

/// Encoded size of a directory entry, not counting its name
pub const DIR_ENTRY_BASE_SIZE: usize = 8;

/// Encoded size of the fields shared by all inode types
pub const INODE_HEADER_SIZE: usize = 16;

/// An opaque reference value that can be used to retrieve a specific [`Inode`]: the start of an
/// inode table meta-data block (relative to the inode table) in the upper 48 bits, and the
/// offset into that block's uncompressed data in the low 16 bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EntryReference {
    val: u64
}

impl EntryReference {
    pub fn new(location: u64, offset: u16) -> Self {
        Self {
            val: (location << 16) | u64::from(offset),
        }
    }

    pub fn location(&self) -> u64 {
        self.val >> 16
    }

    pub fn offset(&self) -> u16 {
        (self.val & 0xFFFF) as u16
    }

    pub fn raw(&self) -> u64 {
        self.val
    }

    pub fn from_raw(val: u64) -> Self {
        Self { val }
    }

    pub(crate) fn read<R>(r: &mut R) -> Result<Self>
    where R: Read
    {
        Ok(Self {
            val: r.read_u64::<LittleEndian>()?
        })
    }

    pub(crate) fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write
    {
        w.write_u64::<LittleEndian>(self.val)?;
        Ok(())
    }
}

impl std::fmt::Debug for EntryReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.location(), self.offset())
    }
}

pub(crate) trait FromBytes {
    const BYTE_SIZE: u16;
    fn from_bytes(buf: &[u8]) -> Self;
}

impl FromBytes for u32 {
    const BYTE_SIZE: u16 = std::mem::size_of::<Self>() as u16;
    fn from_bytes(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

/// Location and size of a fragment block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    pub start: u64,
    pub size: DataBlockSize,
}

impl FromBytes for FragmentEntry {
    const BYTE_SIZE: u16 = 16;
    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            start: LittleEndian::read_u64(&buf[0..8]),
            size: DataBlockSize(LittleEndian::read_u32(&buf[8..12])),
        }
    }
}

impl FragmentEntry {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.start)?;
        w.write_u32::<LittleEndian>(self.size.0)?;
        w.write_u32::<LittleEndian>(0)?;
        Ok(())
    }
}

/// A table of fixed-size entries stored in meta-data blocks, located through an uncompressed
/// index of block start addresses at `table_offset`.
#[derive(Debug)]
pub(crate) struct LookupTable<I: FromBytes> {
    pub block_offsets: Vec<u64>,
    pub entries: Vec<I>,
}

impl<I: FromBytes> LookupTable<I> {
    /// Read `item_count` entries of the table whose index is at `table_offset`. The index must
    /// end by `end`, and the blocks it points to sit between the super-block and the index.
    pub fn read<R, C>(r: &mut R, comp: C, table_offset: u64, item_count: u32, end: u64) -> Result<Self>
    where R: Read + Seek,
          C: Compress,
    {
        let per_block = (META_BLOCK_SIZE / usize::from(I::BYTE_SIZE)) as u32;
        let block_count = item_count.div_ceil(per_block);

        // Every block needs an index slot and at least 3 bytes on disk
        let index_end = table_offset.checked_add(u64::from(block_count) * 8);
        let blocks_room = table_offset.saturating_sub(SUPERBLOCK_SIZE);
        if index_end.map_or(true, |e| e > end) || u64::from(block_count) * 3 > blocks_room {
            return Err(Error::corrupt(format!(
                "lookup table of {item_count} entries at {table_offset} does not fit in the image")));
        }

        let mut me = LookupTable { block_offsets: Vec::new(), entries: Vec::new() };
        me.block_offsets.try_reserve_exact(block_count as usize).map_err(|_| Error::Allocation)?;
        me.entries.try_reserve_exact(item_count as usize).map_err(|_| Error::Allocation)?;

        // Read the meta-data block locations
        r.seek(SeekFrom::Start(table_offset))?;
        for _ in 0..block_count {
            me.block_offsets.push(r.read_u64::<LittleEndian>()?);
        }

        // The blocks themselves are written ahead of their index
        let mut reader = MetaReader::new(r, comp, SUPERBLOCK_SIZE, table_offset)?;
        let mut buf = vec![0; usize::from(I::BYTE_SIZE)];
        for n in 0..item_count {
            if n % per_block == 0 {
                let block = me.block_offsets[(n / per_block) as usize];
                reader.seek(block, 0)?;
            }
            reader.read_into(&mut buf)?;
            me.entries.push(I::from_bytes(&buf));
        }
        debug!(table_offset, item_count, block_count, "read lookup table");
        Ok(me)
    }
}

#[derive(Debug)]
pub(crate) struct FragmentLookupTable {
    pub lu_table: LookupTable<FragmentEntry>,
}

impl FragmentLookupTable {
    pub fn read<R, C>(r: &mut R, comp: C, sb: &Superblock) -> Result<Self>
    where R: Read + Seek,
          C: Compress,
    {
        if sb.frag_count == 0 || sb.frag_table == u64::MAX {
            return Ok(Self { lu_table: LookupTable { block_offsets: Vec::new(), entries: Vec::new() } });
        }
        Ok(Self {
            lu_table: LookupTable::read(r, comp, sb.frag_table, sb.frag_count, sb.bytes_used)?,
        })
    }

    pub fn get(&self, index: u32) -> Result<&FragmentEntry> {
        self.lu_table.entries.get(index as usize)
            .ok_or_else(|| Error::corrupt(format!("fragment index {index} out of range")))
    }
}

#[derive(Debug)]
pub(crate) struct IdLookupTable {
    pub lu_table: LookupTable<u32>,
}

impl IdLookupTable {
    pub fn read<R, C>(r: &mut R, comp: C, sb: &Superblock) -> Result<Self>
    where R: Read + Seek,
          C: Compress,
    {
        if sb.id_count == 0 || sb.id_table == u64::MAX {
            return Ok(Self { lu_table: LookupTable { block_offsets: Vec::new(), entries: Vec::new() } });
        }
        Ok(Self {
            lu_table: LookupTable::read(r, comp, sb.id_table, sb.id_count.into(), sb.bytes_used)?,
        })
    }
}

#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    BasicDir = 1,
    BasicFile = 2,
    BasicSymlink = 3,
    BasicBlockDev = 4,
    BasicCharDev = 5,
    BasicNamedPipe = 6,
    BasicSocket = 7,
    ExtDir = 8,
    ExtFile = 9,
    ExtSymlink = 10,
    ExtBlockDev = 11,
    ExtCharDev = 12,
    ExtNamedPipe = 13,
    ExtSocket = 14,
}

impl InodeType {
    fn decode(raw: u16) -> Result<Self> {
        InodeType::try_from(raw).map_err(|_| Error::corrupt(format!("unknown inode type {raw}")))
    }

    pub fn is_extended(self) -> bool {
        u16::from(self) >= 8
    }

    /// The basic counterpart of an extended type. Directory entries always store this one.
    pub fn basic(self) -> Self {
        match self {
            InodeType::ExtDir => InodeType::BasicDir,
            InodeType::ExtFile => InodeType::BasicFile,
            InodeType::ExtSymlink => InodeType::BasicSymlink,
            InodeType::ExtBlockDev => InodeType::BasicBlockDev,
            InodeType::ExtCharDev => InodeType::BasicCharDev,
            InodeType::ExtNamedPipe => InodeType::BasicNamedPipe,
            InodeType::ExtSocket => InodeType::BasicSocket,
            t => t,
        }
    }
}

/// Information about an object in the filesystem (ex. file, directory, device node)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub inode_type: InodeType,
    pub permissions: u16,
    pub uid_index: u16,
    pub gid_index: u16,
    pub mtime: u32,
    pub inode_number: u32,
    pub extended_info: InodeExtendedInfo,
}

/// Type-specific information about a filesystem object. Basic and extended inodes of the same
/// kind share one variant; fields that only exist on disk for extended inodes hold their
/// defaults for basic ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeExtendedInfo {
    Dir(DirInfo),
    File(FileInfo),
    Symlink(SymlinkInfo),
    Dev(DevInfo),
    Ipc(IpcInfo),
}

/// Information about a directory object in the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    /// Start of the directory's first meta-data block, relative to the directory table
    pub block_index: u32,
    pub link_count: u32,
    /// Size of the directory listing plus three (for the implied `.` and `..`)
    pub file_size: u32,
    pub block_offset: u16,
    pub parent_inode: u32,
    pub xattr_index: u32,
    pub index: Vec<DirIndex>,
}

/// Information about a file object in the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub frag_offset: u32,
    pub xattr_index: u32,
    pub block_sizes: Vec<DataBlockSize>,
}

impl FileInfo {
    pub fn has_fragment(&self) -> bool {
        self.frag_index != NO_FRAGMENT
    }
}

/// Information about a symbolic link object in the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkInfo {
    pub link_count: u32,
    pub target_path: Vec<u8>,
    pub xattr_index: u32,
}

/// Information about a device object in the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    pub link_count: u32,
    pub dev_number: u32,
    pub xattr_index: u32,
}

/// Information about an IPC object in the filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcInfo {
    pub link_count: u32,
    pub xattr_index: u32,
}

/// Number of full blocks listed in a file inode. A trailing partial block is only listed when
/// the tail is not stored in a fragment. The size list must fit in the `avail` bytes left to
/// the record.
fn file_block_count(file_size: u64, frag_index: u32, block_size: u32, avail: u64) -> Result<u64> {
    if block_size == 0 {
        return Err(Error::corrupt("block size of zero"));
    }
    let block_size = u64::from(block_size);
    let count = if frag_index == NO_FRAGMENT {
        file_size.div_ceil(block_size)
    } else {
        file_size / block_size
    };
    match count.checked_mul(4) {
        Some(len) if len <= avail => Ok(count),
        _ => Err(Error::corrupt(format!("file of {file_size} bytes lists more blocks than the inode table holds"))),
    }
}

fn read_block_sizes<R: Read>(r: &mut R, count: u64) -> Result<Vec<DataBlockSize>> {
    // count comes straight off the disk, so don't trust it for the allocation
    let mut block_sizes = Vec::with_capacity(count.min((META_BLOCK_SIZE / 4) as u64) as usize);
    for _ in 0..count {
        block_sizes.push(DataBlockSize(r.read_u32::<LittleEndian>()?));
    }
    Ok(block_sizes)
}

fn read_name<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut name = vec![0; len];
    r.read_exact(&mut name)?;
    Ok(name)
}

impl Inode {
    /// Decode an inode from the current position of `r`. Nothing is returned unless the whole
    /// record could be read.
    pub fn read<R>(r: &mut R, block_size: u32) -> Result<Self>
    where R: Read
    {
        Self::read_bounded(r, block_size, u64::MAX)
    }

    /// Like [`read`](Self::read), for a source known to hold at most `avail` more bytes. A file
    /// inode whose block list could not fit is rejected before any of the list is read.
    pub fn read_bounded<R>(r: &mut R, block_size: u32, avail: u64) -> Result<Self>
    where R: Read
    {
        let inode_type = InodeType::decode(r.read_u16::<LittleEndian>()?)?;
        let permissions = r.read_u16::<LittleEndian>()?;
        let uid_index = r.read_u16::<LittleEndian>()?;
        let gid_index = r.read_u16::<LittleEndian>()?;
        let mtime = r.read_u32::<LittleEndian>()?;
        let inode_number = r.read_u32::<LittleEndian>()?;
        let extended_info = match inode_type {
            InodeType::BasicDir => InodeExtendedInfo::Dir(DirInfo {
                block_index: r.read_u32::<LittleEndian>()?,
                link_count: r.read_u32::<LittleEndian>()?,
                file_size: r.read_u16::<LittleEndian>()?.into(),
                block_offset: r.read_u16::<LittleEndian>()?,
                parent_inode: r.read_u32::<LittleEndian>()?,
                xattr_index: NO_XATTR,
                index: Vec::new(),
            }),
            InodeType::ExtDir => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u32::<LittleEndian>()?;
                let block_index = r.read_u32::<LittleEndian>()?;
                let parent_inode = r.read_u32::<LittleEndian>()?;
                let index_count = r.read_u16::<LittleEndian>()?;
                let block_offset = r.read_u16::<LittleEndian>()?;
                let xattr_index = r.read_u32::<LittleEndian>()?;
                let mut index = Vec::with_capacity(index_count.into());
                for _ in 0..index_count {
                    index.push(DirIndex::read(r)?);
                }
                InodeExtendedInfo::Dir(DirInfo {
                    block_index, link_count, file_size, block_offset, parent_inode, xattr_index, index,
                })
            },
            InodeType::BasicFile => {
                let blocks_start = r.read_u32::<LittleEndian>()?.into();
                let frag_index = r.read_u32::<LittleEndian>()?;
                let frag_offset = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u32::<LittleEndian>()?.into();
                let count = file_block_count(file_size, frag_index, block_size, avail)?;
                InodeExtendedInfo::File(FileInfo {
                    blocks_start, file_size, sparse: 0, link_count: 1, frag_index, frag_offset,
                    xattr_index: NO_XATTR,
                    block_sizes: read_block_sizes(r, count)?,
                })
            },
            InodeType::ExtFile => {
                let blocks_start = r.read_u64::<LittleEndian>()?;
                let file_size = r.read_u64::<LittleEndian>()?;
                let sparse = r.read_u64::<LittleEndian>()?;
                let link_count = r.read_u32::<LittleEndian>()?;
                let frag_index = r.read_u32::<LittleEndian>()?;
                let frag_offset = r.read_u32::<LittleEndian>()?;
                let xattr_index = r.read_u32::<LittleEndian>()?;
                let count = file_block_count(file_size, frag_index, block_size, avail)?;
                InodeExtendedInfo::File(FileInfo {
                    blocks_start, file_size, sparse, link_count, frag_index, frag_offset, xattr_index,
                    block_sizes: read_block_sizes(r, count)?,
                })
            },
            InodeType::BasicSymlink | InodeType::ExtSymlink => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let target_size = r.read_u32::<LittleEndian>()?;
                if target_size > MAX_SYMLINK_LEN {
                    return Err(Error::corrupt(format!("symlink target of {target_size} bytes")));
                }
                let target_path = read_name(r, target_size as usize)?;
                let xattr_index = if inode_type.is_extended() {
                    r.read_u32::<LittleEndian>()?
                } else {
                    NO_XATTR
                };
                InodeExtendedInfo::Symlink(SymlinkInfo { link_count, target_path, xattr_index })
            },
            InodeType::BasicBlockDev | InodeType::BasicCharDev |
            InodeType::ExtBlockDev | InodeType::ExtCharDev => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let dev_number = r.read_u32::<LittleEndian>()?;
                let xattr_index = if inode_type.is_extended() {
                    r.read_u32::<LittleEndian>()?
                } else {
                    NO_XATTR
                };
                InodeExtendedInfo::Dev(DevInfo { link_count, dev_number, xattr_index })
            },
            InodeType::BasicNamedPipe | InodeType::BasicSocket |
            InodeType::ExtNamedPipe | InodeType::ExtSocket => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let xattr_index = if inode_type.is_extended() {
                    r.read_u32::<LittleEndian>()?
                } else {
                    NO_XATTR
                };
                InodeExtendedInfo::Ipc(IpcInfo { link_count, xattr_index })
            },
        };

        Ok(Self {
            inode_type, permissions, uid_index, gid_index, mtime, inode_number, extended_info
        })
    }

    /// Encode the inode in the layout selected by `inode_type`
    pub fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write
    {
        w.write_u16::<LittleEndian>(self.inode_type.into())?;
        w.write_u16::<LittleEndian>(self.permissions)?;
        w.write_u16::<LittleEndian>(self.uid_index)?;
        w.write_u16::<LittleEndian>(self.gid_index)?;
        w.write_u32::<LittleEndian>(self.mtime)?;
        w.write_u32::<LittleEndian>(self.inode_number)?;

        let ext = self.inode_type.is_extended();
        match (&self.extended_info, self.inode_type.basic()) {
            (InodeExtendedInfo::Dir(d), InodeType::BasicDir) => {
                if ext {
                    w.write_u32::<LittleEndian>(d.link_count)?;
                    w.write_u32::<LittleEndian>(d.file_size)?;
                    w.write_u32::<LittleEndian>(d.block_index)?;
                    w.write_u32::<LittleEndian>(d.parent_inode)?;
                    let index_count = u16::try_from(d.index.len())
                        .map_err(|_| Error::corrupt("too many directory index entries"))?;
                    w.write_u16::<LittleEndian>(index_count)?;
                    w.write_u16::<LittleEndian>(d.block_offset)?;
                    w.write_u32::<LittleEndian>(d.xattr_index)?;
                    for i in &d.index {
                        i.write(w)?;
                    }
                } else {
                    let file_size = u16::try_from(d.file_size)
                        .map_err(|_| Error::corrupt("directory too large for a basic inode"))?;
                    w.write_u32::<LittleEndian>(d.block_index)?;
                    w.write_u32::<LittleEndian>(d.link_count)?;
                    w.write_u16::<LittleEndian>(file_size)?;
                    w.write_u16::<LittleEndian>(d.block_offset)?;
                    w.write_u32::<LittleEndian>(d.parent_inode)?;
                }
            },
            (InodeExtendedInfo::File(f), InodeType::BasicFile) => {
                if ext {
                    w.write_u64::<LittleEndian>(f.blocks_start)?;
                    w.write_u64::<LittleEndian>(f.file_size)?;
                    w.write_u64::<LittleEndian>(f.sparse)?;
                    w.write_u32::<LittleEndian>(f.link_count)?;
                    w.write_u32::<LittleEndian>(f.frag_index)?;
                    w.write_u32::<LittleEndian>(f.frag_offset)?;
                    w.write_u32::<LittleEndian>(f.xattr_index)?;
                } else {
                    let blocks_start = u32::try_from(f.blocks_start)
                        .map_err(|_| Error::corrupt("blocks start too large for a basic inode"))?;
                    let file_size = u32::try_from(f.file_size)
                        .map_err(|_| Error::corrupt("file too large for a basic inode"))?;
                    w.write_u32::<LittleEndian>(blocks_start)?;
                    w.write_u32::<LittleEndian>(f.frag_index)?;
                    w.write_u32::<LittleEndian>(f.frag_offset)?;
                    w.write_u32::<LittleEndian>(file_size)?;
                }
                for b in &f.block_sizes {
                    w.write_u32::<LittleEndian>(b.0)?;
                }
            },
            (InodeExtendedInfo::Symlink(s), InodeType::BasicSymlink) => {
                w.write_u32::<LittleEndian>(s.link_count)?;
                w.write_u32::<LittleEndian>(s.target_path.len() as u32)?;
                w.write_all(&s.target_path)?;
                if ext {
                    w.write_u32::<LittleEndian>(s.xattr_index)?;
                }
            },
            (InodeExtendedInfo::Dev(d), InodeType::BasicBlockDev | InodeType::BasicCharDev) => {
                w.write_u32::<LittleEndian>(d.link_count)?;
                w.write_u32::<LittleEndian>(d.dev_number)?;
                if ext {
                    w.write_u32::<LittleEndian>(d.xattr_index)?;
                }
            },
            (InodeExtendedInfo::Ipc(i), InodeType::BasicNamedPipe | InodeType::BasicSocket) => {
                w.write_u32::<LittleEndian>(i.link_count)?;
                if ext {
                    w.write_u32::<LittleEndian>(i.xattr_index)?;
                }
            },
            (_, t) => {
                return Err(Error::corrupt(format!("inode info does not match type {t:?}")));
            },
        }
        Ok(())
    }

    pub fn is_file(&self) -> bool {
        matches!(self.inode_type, InodeType::BasicFile | InodeType::ExtFile)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.inode_type, InodeType::BasicDir | InodeType::ExtDir)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.inode_type, InodeType::BasicSymlink | InodeType::ExtSymlink)
    }

    pub fn inode_number(&self) -> u32 {
        self.inode_number
    }

    pub fn permissions(&self) -> u16 {
        self.permissions
    }

    pub fn mode(&self) -> u16 {
        let mut mode = self.permissions;
        mode |= match self.inode_type.basic() {
            InodeType::BasicBlockDev => 0o60000,
            InodeType::BasicCharDev => 0o20000,
            InodeType::BasicDir => 0o40000,
            InodeType::BasicFile => 0o100000,
            InodeType::BasicNamedPipe => 0o10000,
            InodeType::BasicSocket => 0o140000,
            InodeType::BasicSymlink => 0o120000,
            _ => 0,
        };
        mode
    }

    pub fn file_size(&self) -> Option<u64> {
        match &self.extended_info {
            InodeExtendedInfo::File(i) => Some(i.file_size),
            InodeExtendedInfo::Dir(i) => Some(i.file_size.into()),
            _ => None,
        }
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        match &self.extended_info {
            InodeExtendedInfo::File(i) => Some(i),
            _ => None,
        }
    }

    pub fn dir_info(&self) -> Option<&DirInfo> {
        match &self.extended_info {
            InodeExtendedInfo::Dir(i) => Some(i),
            _ => None,
        }
    }

    pub fn mtime(&self) -> u32 {
        self.mtime
    }
}

/// A directory header. The entries that follow it share one inode table block and store their
/// inode numbers relative to `inode_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirHeader {
    /// Number of entries following the header (stored on disk as one less)
    pub count: u32,
    /// Start of the inode table block holding the entries' inodes
    pub start: u32,
    pub inode_number: u32,
}

impl DirHeader {
    pub fn read<R>(r: &mut R) -> Result<Self>
    where R: Read
    {
        let count = r.read_u32::<LittleEndian>()?;
        let start = r.read_u32::<LittleEndian>()?;
        let inode_number = r.read_u32::<LittleEndian>()?;
        if count >= MAX_DIR_ENTRIES {
            return Err(Error::corrupt(format!("directory header with {} entries", u64::from(count) + 1)));
        }
        Ok(Self { count: count + 1, start, inode_number })
    }

    pub fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write
    {
        if self.count == 0 || self.count > MAX_DIR_ENTRIES {
            return Err(Error::corrupt(format!("directory header with {} entries", self.count)));
        }
        w.write_u32::<LittleEndian>(self.count - 1)?;
        w.write_u32::<LittleEndian>(self.start)?;
        w.write_u32::<LittleEndian>(self.inode_number)?;
        Ok(())
    }
}

/// A named reference to an inode within a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Offset of the inode within its uncompressed inode table block
    pub offset: u16,
    /// Difference of the inode number from the header's
    pub inode_offset: i16,
    pub inode_type: InodeType,
    pub name: Vec<u8>,
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::corrupt(format!("directory entry name of {} bytes", name.len())));
    }
    if name == b"." || name == b".." || name.iter().any(|&c| c == b'/' || c == 0) {
        return Err(Error::corrupt(format!("invalid directory entry name {:?}", String::from_utf8_lossy(name))));
    }
    Ok(())
}

impl DirEntry {
    pub fn read<R>(r: &mut R) -> Result<Self>
    where R: Read
    {
        let offset = r.read_u16::<LittleEndian>()?;
        let inode_offset = r.read_i16::<LittleEndian>()?;
        let inode_type = InodeType::decode(r.read_u16::<LittleEndian>()?)?;
        let name_size = usize::from(r.read_u16::<LittleEndian>()?) + 1;
        if name_size > MAX_NAME_LEN {
            return Err(Error::corrupt(format!("directory entry name of {name_size} bytes")));
        }
        let name = read_name(r, name_size)?;
        check_name(&name)?;
        Ok(Self { offset, inode_offset, inode_type, name })
    }

    pub fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write
    {
        check_name(&self.name)?;
        w.write_u16::<LittleEndian>(self.offset)?;
        w.write_i16::<LittleEndian>(self.inode_offset)?;
        w.write_u16::<LittleEndian>(self.inode_type.into())?;
        w.write_u16::<LittleEndian>((self.name.len() - 1) as u16)?;
        w.write_all(&self.name)?;
        Ok(())
    }

    /// Number of bytes the entry occupies in the directory table
    pub fn encoded_size(&self) -> usize {
        DIR_ENTRY_BASE_SIZE + self.name.len()
    }

    pub fn file_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// A directory index entry of an extended directory inode: where a directory header lives, and
/// the name of the first entry after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirIndex {
    /// Byte offset of the header from the start of the directory listing
    pub index: u32,
    /// Start of the directory table block holding the header
    pub start: u32,
    pub name: Vec<u8>,
}

impl DirIndex {
    pub fn read<R>(r: &mut R) -> Result<Self>
    where R: Read
    {
        let index = r.read_u32::<LittleEndian>()?;
        let start = r.read_u32::<LittleEndian>()?;
        let name_size = r.read_u32::<LittleEndian>()? as usize + 1;
        if name_size > MAX_NAME_LEN {
            return Err(Error::corrupt(format!("directory index name of {name_size} bytes")));
        }
        let name = read_name(r, name_size)?;
        Ok(Self { index, start, name })
    }

    pub fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write
    {
        check_name(&self.name)?;
        w.write_u32::<LittleEndian>(self.index)?;
        w.write_u32::<LittleEndian>(self.start)?;
        w.write_u32::<LittleEndian>((self.name.len() - 1) as u32)?;
        w.write_all(&self.name)?;
        Ok(())
    }
}
