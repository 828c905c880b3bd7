mod block;
mod compressed;
mod datareader;
mod error;
mod filedata;
mod metareader;
mod metawriter;
mod readdir;
mod source;
mod squashfs;
mod superblock;

pub mod metadata;

pub use block::{Block, DataBlockSize, MetaBlockHeader, Position, META_BLOCK_SIZE, META_HEADER_SIZE};
pub use compressed::Compress;
pub use datareader::DataReader;
pub use error::{Error, Result};
pub use filedata::{dump_file, BlockSource, DataSink};
pub use metadata::{EntryReference, Inode};
pub use metareader::MetaReader;
pub use metawriter::MetaWriter;
pub use readdir::{DirCursor, ReaddirEntry, ReaddirState};
pub use squashfs::*;
pub use superblock::{Compressor, Superblock, SuperblockFlags, MAGIC, SUPERBLOCK_SIZE};
