//! Sqmeta reads and writes the ***meta***-data block layer of SquashFS images, and reconstructs
//! file contents from data blocks and fragments.
//!
//! The building blocks are usable on their own:
//! - [`MetaReader`](squashfs::MetaReader) reads a byte stream out of a region of compressed
//!   meta-data blocks, crossing block boundaries transparently.
//! - [`MetaWriter`](squashfs::MetaWriter) packs a byte stream into meta-data blocks.
//! - [`ReaddirState`](squashfs::ReaddirState) walks a directory listing through a shared
//!   `MetaReader`, so several directories can be walked at once.
//! - [`dump_file`](squashfs::dump_file) writes a file's contents to a sink, optionally leaving
//!   holes for sparse blocks.
//!
//! [`SquashFS`](squashfs::SquashFS) ties them together over an image file.
//!
//! ## Feature Flags
//! - `gzip` (default): zlib compressed images, via flate2
//! - `xz` (default): xz compressed images, via lzma-rs
//! - `zstd` (default): zstd compressed images, via ruzstd
//!
//! ## Usage Example
//! ```no_run
//! use std::fs::File;
//! use sqmeta::squashfs::{Result, SquashFS};
//! fn unpack_file_from_squashfs() -> Result<()> {
//!     // Open the SquashFS
//!     let mut sqfs = SquashFS::open("rootfs.squashfs")?;
//!
//!     // List the contents of a directory
//!     for entry in sqfs.read_dir("/etc")? {
//!         println!("{}", entry?.file_name());
//!     }
//!
//!     // Write a file out, keeping its holes
//!     let inode = sqfs.inode_from_path("/var/lib/disk.img")?;
//!     let mut out = File::create("disk.img")?;
//!     sqfs.dump_file(&inode, &mut out, true)?;
//!     Ok(())
//! }
//! ```

pub mod squashfs;
