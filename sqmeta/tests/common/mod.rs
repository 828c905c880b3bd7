//! A small image writer for tests: data blocks, shared fragment blocks, inode and directory
//! tables, fragment and id lookup tables.

#![allow(dead_code)]

use std::io::Cursor;

use anyhow::{ensure, Result};

use sqmeta::squashfs::metadata::{
    DirEntry, DirHeader, DirInfo, FileInfo, FragmentEntry, InodeExtendedInfo, InodeType, SymlinkInfo,
    NO_FRAGMENT, NO_XATTR,
};
use sqmeta::squashfs::{
    Compress, Compressor, DataBlockSize, EntryReference, Inode, MetaWriter, Superblock, META_BLOCK_SIZE,
    SUPERBLOCK_SIZE,
};

/// What a directory entry needs to know about the inode it names
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub inode_ref: EntryReference,
    pub inode_number: u32,
    pub inode_type: InodeType,
}

pub struct ImageBuilder {
    comp: Compressor,
    block_size: u32,
    image: Vec<u8>,
    inodes: MetaWriter<Vec<u8>, Compressor>,
    dirs: MetaWriter<Vec<u8>, Compressor>,
    fragments: Vec<FragmentEntry>,
    frag_pending: Vec<u8>,
    ids: Vec<u32>,
    next_inode: u32,
    inode_count: u32,
}

impl ImageBuilder {
    pub fn new(comp: Compressor, block_size: u32) -> Self {
        Self {
            comp,
            block_size,
            image: vec![0; SUPERBLOCK_SIZE as usize],
            inodes: MetaWriter::new(Vec::new(), comp, false),
            dirs: MetaWriter::new(Vec::new(), comp, true),
            fragments: Vec::new(),
            frag_pending: Vec::new(),
            ids: vec![0, 1000],
            next_inode: 1,
            inode_count: 0,
        }
    }

    fn alloc_inode_number(&mut self) -> u32 {
        let n = self.next_inode;
        self.next_inode += 1;
        self.inode_count += 1;
        n
    }

    // Write a block to the data area, compressed when that helps
    fn write_data_block(&mut self, data: &[u8]) -> Result<DataBlockSize> {
        let packed = self.comp.compress(data)?;
        if packed.len() < data.len() {
            self.image.extend_from_slice(&packed);
            Ok(DataBlockSize::new(packed.len() as u32, true))
        } else {
            self.image.extend_from_slice(data);
            Ok(DataBlockSize::new(data.len() as u32, false))
        }
    }

    fn flush_fragment(&mut self) -> Result<()> {
        if self.frag_pending.is_empty() {
            return Ok(());
        }
        let start = self.image.len() as u64;
        let pending = std::mem::take(&mut self.frag_pending);
        let size = self.write_data_block(&pending)?;
        self.fragments.push(FragmentEntry { start, size });
        Ok(())
    }

    fn write_inode(&mut self, inode: &Inode) -> Result<EntryReference> {
        let pos = self.inodes.position();
        let mut buf = Vec::new();
        inode.write(&mut buf)?;
        self.inodes.append(&buf)?;
        Ok(EntryReference::new(pos.block_start, pos.offset as u16))
    }

    /// Add a regular file. Blocks of all zeros are stored sparse. With `use_fragment`, a
    /// partial last block goes to a shared fragment block.
    pub fn add_file(&mut self, data: &[u8], use_fragment: bool) -> Result<Node> {
        let bs = self.block_size as usize;
        let tail_len = if use_fragment { data.len() % bs } else { 0 };
        let (body, tail) = data.split_at(data.len() - tail_len);

        let blocks_start = self.image.len() as u64;
        let mut block_sizes = Vec::new();
        let mut sparse = 0;
        for chunk in body.chunks(bs) {
            if chunk.iter().all(|&b| b == 0) {
                block_sizes.push(DataBlockSize::sparse());
                sparse += chunk.len() as u64;
            } else {
                block_sizes.push(self.write_data_block(chunk)?);
            }
        }

        let (frag_index, frag_offset) = if tail.is_empty() {
            (NO_FRAGMENT, 0)
        } else {
            if self.frag_pending.len() + tail.len() > bs {
                self.flush_fragment()?;
            }
            let at = (self.fragments.len() as u32, self.frag_pending.len() as u32);
            self.frag_pending.extend_from_slice(tail);
            at
        };

        let inode_number = self.alloc_inode_number();
        let inode_type = if sparse > 0 { InodeType::ExtFile } else { InodeType::BasicFile };
        let inode = Inode {
            inode_type,
            permissions: 0o644,
            uid_index: 1,
            gid_index: 0,
            mtime: 1_700_000_000,
            inode_number,
            extended_info: InodeExtendedInfo::File(FileInfo {
                blocks_start,
                file_size: data.len() as u64,
                sparse,
                link_count: 1,
                frag_index,
                frag_offset,
                xattr_index: NO_XATTR,
                block_sizes,
            }),
        };
        let inode_ref = self.write_inode(&inode)?;
        Ok(Node { inode_ref, inode_number, inode_type: InodeType::BasicFile })
    }

    pub fn add_symlink(&mut self, target: &str) -> Result<Node> {
        let inode_number = self.alloc_inode_number();
        let inode = Inode {
            inode_type: InodeType::BasicSymlink,
            permissions: 0o777,
            uid_index: 0,
            gid_index: 0,
            mtime: 0,
            inode_number,
            extended_info: InodeExtendedInfo::Symlink(SymlinkInfo {
                link_count: 1,
                target_path: target.as_bytes().to_vec(),
                xattr_index: NO_XATTR,
            }),
        };
        let inode_ref = self.write_inode(&inode)?;
        Ok(Node { inode_ref, inode_number, inode_type: InodeType::BasicSymlink })
    }

    /// Add a directory holding `children`. Entries are sorted by name and split into runs that
    /// share an inode table block.
    pub fn add_dir(&mut self, children: &[(&str, Node)]) -> Result<Node> {
        let mut children = children.to_vec();
        children.sort_by(|a, b| a.0.cmp(b.0));

        let start = self.dirs.position();
        let mut listing = Vec::new();
        let mut rest = &children[..];
        while let Some((_, first)) = rest.first() {
            let run = rest.iter()
                .take_while(|(_, n)| n.inode_ref.location() == first.inode_ref.location())
                .take(256)
                .count();
            let header = DirHeader {
                count: run as u32,
                start: first.inode_ref.location() as u32,
                inode_number: first.inode_number,
            };
            header.write(&mut listing)?;
            for (name, node) in &rest[..run] {
                let delta = i64::from(node.inode_number) - i64::from(first.inode_number);
                ensure!(i16::try_from(delta).is_ok(), "inode number delta {delta} too large");
                DirEntry {
                    offset: node.inode_ref.offset(),
                    inode_offset: delta as i16,
                    inode_type: node.inode_type,
                    name: name.as_bytes().to_vec(),
                }.write(&mut listing)?;
            }
            rest = &rest[run..];
        }
        self.dirs.append(&listing)?;

        let inode_number = self.alloc_inode_number();
        let inode = Inode {
            inode_type: InodeType::BasicDir,
            permissions: 0o755,
            uid_index: 0,
            gid_index: 0,
            mtime: 0,
            inode_number,
            extended_info: InodeExtendedInfo::Dir(DirInfo {
                block_index: start.block_start as u32,
                link_count: 2,
                file_size: listing.len() as u32 + 3,
                block_offset: start.offset as u16,
                parent_inode: 0,
                xattr_index: NO_XATTR,
                index: Vec::new(),
            }),
        };
        let inode_ref = self.write_inode(&inode)?;
        Ok(Node { inode_ref, inode_number, inode_type: InodeType::BasicDir })
    }

    // Write a table of fixed-size entries followed by its index; returns the index location
    fn write_lookup_table(&mut self, entries: &[u8], entry_size: usize) -> Result<u64> {
        let mut writer = MetaWriter::new(Vec::new(), self.comp, false);
        let mut index = Vec::new();
        let base = self.image.len() as u64;
        for chunk in entries.chunks(META_BLOCK_SIZE / entry_size * entry_size) {
            index.push(base + writer.position().block_start);
            writer.append(chunk)?;
            writer.flush()?;
        }
        self.image.extend_from_slice(&writer.into_inner());
        let table = self.image.len() as u64;
        for block in index {
            self.image.extend_from_slice(&block.to_le_bytes());
        }
        Ok(table)
    }

    /// Lay out the tables behind the data and fill in the super-block
    pub fn finish(mut self, root: Node) -> Result<Vec<u8>> {
        self.flush_fragment()?;

        let mut sb = Superblock::new(self.comp, self.block_size);
        sb.root_inode = root.inode_ref;
        sb.inode_count = self.inode_count;

        self.inodes.flush()?;
        sb.inode_table = self.image.len() as u64;
        let inodes = std::mem::replace(&mut self.inodes, MetaWriter::new(Vec::new(), self.comp, false));
        self.image.extend_from_slice(&inodes.into_inner());

        self.dirs.flush()?;
        sb.dir_table = self.image.len() as u64;
        self.dirs.write_to_file()?;
        let dirs = std::mem::replace(&mut self.dirs, MetaWriter::new(Vec::new(), self.comp, false));
        self.image.extend_from_slice(&dirs.into_inner());

        if !self.fragments.is_empty() {
            let mut raw = Vec::new();
            for f in &self.fragments {
                f.write(&mut raw)?;
            }
            sb.frag_count = self.fragments.len() as u32;
            sb.frag_table = self.write_lookup_table(&raw, 16)?;
        }

        let raw: Vec<u8> = self.ids.iter().flat_map(|id| id.to_le_bytes()).collect();
        sb.id_count = self.ids.len() as u16;
        sb.id_table = self.write_lookup_table(&raw, 4)?;

        sb.bytes_used = self.image.len() as u64;
        let mut header = Cursor::new(&mut self.image[..SUPERBLOCK_SIZE as usize]);
        sb.write(&mut header)?;
        Ok(self.image)
    }
}

/// A pseudo-random byte pattern that doesn't compress well
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len).map(|_| {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        x as u8
    }).collect()
}

/// Text that compresses well
pub fn text(len: usize) -> Vec<u8> {
    b"The quick brown fox jumps over the lazy dog. ".iter().cycle().take(len).cloned().collect()
}
