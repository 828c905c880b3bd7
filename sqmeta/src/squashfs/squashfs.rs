//! See https://dr-emann.github.io/squashfs/squashfs.html
//! for details on the SquashFS binary format

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Component, Path};

use tracing::{debug, warn};

use super::datareader::DataReader;
use super::error::{Error, Result};
use super::filedata::{dump_file, DataSink};
use super::metadata::{EntryReference, IdLookupTable, Inode};
use super::metareader::MetaReader;
use super::readdir::{ReaddirEntry, ReaddirState};
use super::source::{SharedSource, SourceCursor};
use super::superblock::{Compressor, Superblock, SuperblockFlags};

type ImageMetaReader<R> = MetaReader<SourceCursor<R>, Compressor>;

/// End of the table starting at `start`: the closest table start after it, or the end of the
/// image.
fn table_end(sb: &Superblock, start: u64) -> u64 {
    [sb.inode_table, sb.dir_table, sb.frag_table, sb.export_table, sb.id_table, sb.xattr_table]
        .into_iter()
        .filter(|&t| t > start && t != u64::MAX)
        .fold(sb.bytes_used, u64::min)
}

/// The top-level interface to a SquashFS image. This struct can be used to look up inodes, walk
/// directories and dump file contents.
#[derive(Debug)]
pub struct SquashFS<R: Read + Seek> {
    sb: Superblock,
    id_table: IdLookupTable,
    inodes: ImageMetaReader<R>,
    dirs: ImageMetaReader<R>,
    data: DataReader<SourceCursor<R>, Compressor>,
}

impl SquashFS<BufReader<File>> {
    /// Open the contents of a filepath as a SquashFS, using a BufReader
    pub fn open<P>(path: P) -> Result<Self>
    where P: AsRef<Path>
    {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> SquashFS<R> {
    /// Create a new SquashFS instance from the provided Reader
    pub fn new(mut r: R) -> Result<Self> {
        r.seek(SeekFrom::Start(0))?;
        let sb = Superblock::read(&mut r)?;
        let comp = sb.compressor;
        if sb.flags.contains(SuperblockFlags::COMPRESSOR_OPTIONS_PRESENT) {
            warn!(compressor = ?comp, "ignoring compressor options");
        }
        let id_table = IdLookupTable::read(&mut r, comp, &sb)?;

        let mut source = SharedSource::new(r);
        let inodes = MetaReader::new(source.cursor(), comp, sb.inode_table, sb.dir_table)?;
        let dirs = MetaReader::new(source.cursor(), comp, sb.dir_table, table_end(&sb, sb.dir_table))?;
        let data = DataReader::new(source.cursor(), comp, &sb)?;
        debug!(compressor = ?comp, block_size = sb.block_size, inodes = sb.inode_count, "opened image");
        Ok(SquashFS { sb, id_table, inodes, dirs, data })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Retrieve the root Inode of the SquashFS. This corresponds to the '/' directory
    pub fn root_inode(&mut self) -> Result<Inode> {
        self.inode_from_entryref(self.sb.root_inode)
    }

    /// Retrieve the Inode specified by SquashFS metadata Entry Reference
    pub fn inode_from_entryref(&mut self, inode_ref: EntryReference) -> Result<Inode> {
        let block_start = self.sb.inode_table + inode_ref.location();
        self.inodes.read_inode(&self.sb, block_start, inode_ref.offset().into())
    }

    /// Start walking the directory `inode`. Any number of walks may be in progress at once;
    /// advance them with [`readdir`](Self::readdir).
    pub fn readdir_state(&self, inode: &Inode) -> Result<ReaddirState> {
        ReaddirState::new(&self.sb, inode)
    }

    pub fn readdir(&mut self, state: &mut ReaddirState) -> Result<Option<ReaddirEntry>> {
        self.dirs.readdir(state)
    }

    /// Retrieve an iterator that walks the entries of the directory `inode`
    pub fn read_dir_inode(&mut self, inode: &Inode) -> Result<ReadDir<'_, R>> {
        let state = self.readdir_state(inode)?;
        Ok(ReadDir { fs: self, state, failed: false })
    }

    /// Retrieve an iterator that walks the entries of the directory at `path`
    pub fn read_dir<P>(&mut self, path: P) -> Result<ReadDir<'_, R>>
    where P: AsRef<Path>
    {
        let inode = self.inode_from_path(path)?;
        self.read_dir_inode(&inode)
    }

    /// Retrieve the Inode specified by the given path. Symbolic links are not followed.
    pub fn inode_from_path<P>(&mut self, path: P) -> Result<Inode>
    where P: AsRef<Path>
    {
        let mut inode = self.root_inode()?;
        for comp in path.as_ref().components() {
            inode = match comp {
                Component::RootDir => self.root_inode()?,
                Component::CurDir => inode,
                Component::Normal(name) => {
                    let name = name.to_string_lossy();
                    let mut found = None;
                    for entry in self.read_dir_inode(&inode)? {
                        let entry = entry?;
                        if entry.entry.name == name.as_bytes() {
                            found = Some(entry.inode_ref);
                            break;
                        }
                    }
                    let inode_ref = found.ok_or_else(|| Error::NotFound(path.as_ref().display().to_string()))?;
                    self.inode_from_entryref(inode_ref)?
                },
                _ => return Err(Error::NotFound(path.as_ref().display().to_string())),
            };
        }
        Ok(inode)
    }

    /// Write the contents of the file `inode` to `sink`. With `allow_sparse`, runs of sparse
    /// blocks become holes in the output.
    pub fn dump_file<S>(&mut self, inode: &Inode, sink: &mut S, allow_sparse: bool) -> Result<()>
    where S: DataSink + ?Sized
    {
        dump_file(inode, sink, self.sb.block_size, allow_sparse, &mut self.data)
    }

    /// Read the whole contents of the file `inode` into memory
    pub fn read_file(&mut self, inode: &Inode) -> Result<Vec<u8>> {
        let mut sink = Cursor::new(Vec::new());
        self.dump_file(inode, &mut sink, false)?;
        Ok(sink.into_inner())
    }

    fn lookup_id(&self, index: u16) -> Result<u32> {
        self.id_table.lu_table.entries.get(usize::from(index)).copied()
            .ok_or_else(|| Error::corrupt(format!("id index {index} out of range")))
    }

    pub fn uid(&self, inode: &Inode) -> Result<u32> {
        self.lookup_id(inode.uid_index)
    }

    pub fn gid(&self, inode: &Inode) -> Result<u32> {
        self.lookup_id(inode.gid_index)
    }
}

/// An iterator over the entries of a directory. Iteration stops after the first error.
#[derive(Debug)]
pub struct ReadDir<'a, R: Read + Seek> {
    fs: &'a mut SquashFS<R>,
    state: ReaddirState,
    failed: bool,
}

impl<'a, R: Read + Seek> Iterator for ReadDir<'a, R> {
    type Item = Result<ReaddirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.fs.readdir(&mut self.state).transpose();
        self.failed = matches!(next, Some(Err(_)));
        next
    }
}
