use std::io::{Read, Seek};

use tracing::trace;

use super::compressed::Compress;
use super::error::{Error, Result};
use super::metadata::{DirEntry, EntryReference, Inode, DIR_ENTRY_BASE_SIZE, DIR_HEADER_SIZE};
use super::metareader::MetaReader;
use super::superblock::Superblock;

/// A position in the directory table plus the number of listing bytes left from there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirCursor {
    pub block: u64,
    pub offset: usize,
    pub size: usize,
}

/// Progress through one directory listing.
///
/// The state is independent of any reader, so any number of directories can be walked at the
/// same time through a single [`MetaReader`] on the directory table: the reader is re-seeked to
/// the saved cursor on every call to [`MetaReader::readdir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaddirState {
    init: DirCursor,
    current: DirCursor,
    entries: u32,       // Entries left under the last header read
    inum_base: u32,     // Inode number the last header's entries are relative to
    inode_block: u64,   // Inode table block of the last header's entries
}

/// A decoded directory entry along with the values resolved from its header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirEntry {
    pub entry: DirEntry,
    pub inode_number: u32,
    pub inode_ref: EntryReference,
}

impl ReaddirEntry {
    pub fn file_name(&self) -> String {
        self.entry.file_name()
    }
}

impl ReaddirState {
    /// Start of the listing of directory `inode`
    pub fn new(sb: &Superblock, inode: &Inode) -> Result<Self> {
        let info = inode.dir_info().ok_or(Error::NotDirectory)?;
        let init = DirCursor {
            block: sb.dir_table + u64::from(info.block_index),
            offset: info.block_offset.into(),
            size: info.file_size as usize,
        };
        Ok(Self { init, current: init, entries: 0, inum_base: 0, inode_block: 0 })
    }

    /// Rewind to the first entry
    pub fn reset(&mut self) {
        self.current = self.init;
        self.entries = 0;
    }

    pub fn cursor(&self) -> DirCursor {
        self.current
    }

    fn finish(&mut self) {
        self.current.size = 0;
        self.entries = 0;
    }
}

impl<R: Read + Seek, C: Compress> MetaReader<R, C> {
    /// Read the next entry of the directory tracked by `state`, or `None` at the end of the
    /// listing. `state` is only advanced when an entry is returned or the end is reached.
    ///
    /// The size recorded in a directory inode is 3 bytes more than the listing actually takes,
    /// so a listing is over as soon as too few bytes remain to hold another record.
    pub fn readdir(&mut self, state: &mut ReaddirState) -> Result<Option<ReaddirEntry>> {
        let mut next = *state;

        if next.entries == 0 {
            if next.current.size <= DIR_HEADER_SIZE {
                state.finish();
                return Ok(None);
            }
            self.seek(next.current.block, next.current.offset)?;
            let header = self.read_dir_header()?;
            trace!(count = header.count, start = header.start, inode_number = header.inode_number, "directory header");
            next.inum_base = header.inode_number;
            next.inode_block = header.start.into();
            next.entries = header.count;
            next.current.size -= DIR_HEADER_SIZE;
            let pos = self.position();
            next.current.block = pos.block_start;
            next.current.offset = pos.offset as usize;
        }

        if next.current.size <= DIR_ENTRY_BASE_SIZE {
            state.finish();
            return Ok(None);
        }

        self.seek(next.current.block, next.current.offset)?;
        let entry = self.read_dir_entry()?;
        let entry_size = entry.encoded_size();
        if entry_size > next.current.size {
            return Err(Error::corrupt(format!(
                "directory entry of {entry_size} bytes overruns listing with {} bytes left", next.current.size)));
        }

        next.current.size -= entry_size;
        next.entries -= 1;
        let pos = self.position();
        next.current.block = pos.block_start;
        next.current.offset = pos.offset as usize;
        *state = next;

        Ok(Some(ReaddirEntry {
            inode_number: next.inum_base.wrapping_add_signed(entry.inode_offset.into()),
            inode_ref: EntryReference::new(next.inode_block, entry.offset),
            entry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::squashfs::metadata::{DirHeader, DirInfo, InodeExtendedInfo, InodeType, IpcInfo, NO_XATTR};
    use crate::squashfs::metawriter::MetaWriter;
    use crate::squashfs::superblock::Compressor;

    const DIR_TABLE: u64 = 96;

    fn dir_inode(block_index: u32, block_offset: u16, file_size: u32) -> Inode {
        Inode {
            inode_type: InodeType::BasicDir,
            permissions: 0o755,
            uid_index: 0,
            gid_index: 0,
            mtime: 0,
            inode_number: 1,
            extended_info: InodeExtendedInfo::Dir(DirInfo {
                block_index, link_count: 2, file_size, block_offset, parent_inode: 1,
                xattr_index: NO_XATTR, index: Vec::new(),
            }),
        }
    }

    fn entry(name: &str, offset: u16, inode_offset: i16) -> DirEntry {
        DirEntry { offset, inode_offset, inode_type: InodeType::BasicFile, name: name.as_bytes().to_vec() }
    }

    // Encode a listing as a series of headers, each with its entries
    fn listing(groups: &[(DirHeader, Vec<DirEntry>)]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for (header, entries) in groups {
            header.write(&mut buf)?;
            for e in entries {
                e.write(&mut buf)?;
            }
        }
        Ok(buf)
    }

    struct Table {
        sb: Superblock,
        image: Vec<u8>,
    }

    impl Table {
        // Lay out each listing back to back in the directory table and return their inodes
        fn build(listings: &[Vec<u8>], padding: usize) -> Result<(Self, Vec<Inode>)> {
            let mut w = MetaWriter::new(Vec::new(), Compressor::None, false);
            w.append(&vec![0xEE; padding])?;
            let mut inodes = Vec::new();
            for l in listings {
                let pos = w.position();
                w.append(l)?;
                inodes.push(dir_inode(pos.block_start as u32, pos.offset as u16, l.len() as u32 + 3));
            }
            w.flush()?;
            let mut image = vec![0; DIR_TABLE as usize];
            image.extend_from_slice(w.get_ref());
            let mut sb = Superblock::new(Compressor::None, 4096);
            sb.dir_table = DIR_TABLE;
            sb.bytes_used = image.len() as u64;
            Ok((Self { sb, image }, inodes))
        }

        fn reader(&self) -> Result<MetaReader<Cursor<&[u8]>, Compressor>> {
            MetaReader::new(Cursor::new(&self.image[..]), Compressor::None, DIR_TABLE, self.sb.bytes_used)
        }
    }

    fn names<R: Read + Seek, C: Compress>(r: &mut MetaReader<R, C>, state: &mut ReaddirState) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while let Some(e) = r.readdir(state)? {
            out.push(e.file_name());
        }
        Ok(out)
    }

    fn two_headers() -> Result<Vec<u8>> {
        listing(&[
            (DirHeader { count: 3, start: 0, inode_number: 10 },
                vec![entry("a", 0, 0), entry("bb", 32, 1), entry("ccc", 64, 2)]),
            (DirHeader { count: 2, start: 8194, inode_number: 20 },
                vec![entry("dd", 16, -1), entry("e", 48, 5)]),
        ])
    }

    #[test]
    fn test_two_headers() -> Result<()> {
        let (table, inodes) = Table::build(&[two_headers()?], 40)?;
        let mut r = table.reader()?;
        let mut state = ReaddirState::new(&table.sb, &inodes[0])?;

        let mut got = Vec::new();
        for _ in 0..5 {
            got.push(r.readdir(&mut state)?.expect("entry"));
        }
        assert!(r.readdir(&mut state)?.is_none());
        assert!(r.readdir(&mut state)?.is_none());

        let names: Vec<_> = got.iter().map(|e| e.file_name()).collect();
        assert_eq!(names, ["a", "bb", "ccc", "dd", "e"]);
        let numbers: Vec<_> = got.iter().map(|e| e.inode_number).collect();
        assert_eq!(numbers, [10, 11, 12, 19, 25]);
        assert_eq!(got[1].inode_ref, EntryReference::new(0, 32));
        assert_eq!(got[3].inode_ref, EntryReference::new(8194, 16));
        Ok(())
    }

    #[test]
    fn test_reset() -> Result<()> {
        let (table, inodes) = Table::build(&[two_headers()?], 0)?;
        let mut r = table.reader()?;
        let mut state = ReaddirState::new(&table.sb, &inodes[0])?;
        let first = names(&mut r, &mut state)?;
        state.reset();
        assert_eq!(names(&mut r, &mut state)?, first);
        Ok(())
    }

    #[test]
    fn test_listing_across_blocks() -> Result<()> {
        // Start the listing a few bytes before a block boundary
        let (table, inodes) = Table::build(&[two_headers()?], 8180)?;
        let mut r = table.reader()?;
        let mut state = ReaddirState::new(&table.sb, &inodes[0])?;
        assert_eq!(names(&mut r, &mut state)?, ["a", "bb", "ccc", "dd", "e"]);
        Ok(())
    }

    #[test]
    fn test_interleaved() -> Result<()> {
        let other = listing(&[
            (DirHeader { count: 3, start: 0, inode_number: 100 },
                vec![entry("x", 0, 0), entry("y", 0, 1), entry("z", 0, 2)]),
        ])?;
        let (table, inodes) = Table::build(&[two_headers()?, other], 17)?;
        let mut r = table.reader()?;
        let mut s1 = ReaddirState::new(&table.sb, &inodes[0])?;
        let mut s2 = ReaddirState::new(&table.sb, &inodes[1])?;

        let mut first = Vec::new();
        let mut second = Vec::new();
        loop {
            let a = r.readdir(&mut s1)?;
            let b = r.readdir(&mut s2)?;
            if a.is_none() && b.is_none() {
                break;
            }
            first.extend(a.map(|e| e.file_name()));
            second.extend(b.map(|e| e.file_name()));
        }
        assert_eq!(first, ["a", "bb", "ccc", "dd", "e"]);
        assert_eq!(second, ["x", "y", "z"]);
        Ok(())
    }

    #[test]
    fn test_empty_dir() -> Result<()> {
        let (table, inodes) = Table::build(&[Vec::new()], 0)?;
        let mut r = table.reader()?;
        let mut state = ReaddirState::new(&table.sb, &inodes[0])?;
        assert_eq!(state.cursor().size, 3);
        assert!(r.readdir(&mut state)?.is_none());
        Ok(())
    }

    #[test]
    fn test_entry_overruns_listing() -> Result<()> {
        // "bb" takes 10 bytes, but the inode leaves room for only 9 after the header
        let short = listing(&[(DirHeader { count: 1, start: 0, inode_number: 1 }, vec![entry("bb", 0, 0)])])?;
        let (table, mut inodes) = Table::build(&[short], 0)?;
        if let InodeExtendedInfo::Dir(d) = &mut inodes[0].extended_info {
            d.file_size = (DIR_HEADER_SIZE + 9) as u32;
        }
        let mut r = table.reader()?;
        let mut state = ReaddirState::new(&table.sb, &inodes[0])?;
        let snapshot = state;
        assert!(matches!(r.readdir(&mut state), Err(Error::Corrupt(_))));
        assert_eq!(state, snapshot);
        Ok(())
    }

    #[test]
    fn test_truncated_listing_ends_early() -> Result<()> {
        // The header promises three entries but the size only covers one of them
        let (table, mut inodes) = Table::build(&[two_headers()?], 0)?;
        if let InodeExtendedInfo::Dir(d) = &mut inodes[0].extended_info {
            d.file_size = (DIR_HEADER_SIZE + 9 + 3) as u32;
        }
        let mut r = table.reader()?;
        let mut state = ReaddirState::new(&table.sb, &inodes[0])?;
        assert_eq!(names(&mut r, &mut state)?, ["a"]);
        Ok(())
    }

    #[test]
    fn test_not_a_directory() {
        let sb = Superblock::new(Compressor::None, 4096);
        let mut inode = dir_inode(0, 0, 0);
        inode.inode_type = InodeType::BasicNamedPipe;
        inode.extended_info = InodeExtendedInfo::Ipc(IpcInfo { link_count: 1, xattr_index: NO_XATTR });
        assert!(matches!(ReaddirState::new(&sb, &inode), Err(Error::NotDirectory)));
    }
}
