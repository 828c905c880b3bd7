use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{self, bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use sqmeta::squashfs::metadata::InodeExtendedInfo;
use sqmeta::squashfs::{Inode, SquashFS};

#[derive(Parser, Debug)]
#[command(version, about = "Inspect and unpack SquashFS images")]
struct Cli {
    /// The SquashFS Filesystem to operate on
    filesystem: PathBuf,

    /// The command to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print file contents
    Cat(CatArgs),
    /// List files
    Ls(LsArgs),
    /// Extract a file or directory tree
    Unpack(UnpackArgs),
    /// Show inode details
    Stat(StatArgs),
}

#[derive(Args, Debug)]
struct CatArgs {
    files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct LsArgs {
    #[arg(short)]
    long: bool,
    files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct UnpackArgs {
    /// Path inside the image
    path: PathBuf,
    /// Where to write it
    dest: PathBuf,
    /// Write out zeros instead of leaving holes for sparse blocks
    #[arg(long)]
    no_sparse: bool,
}

#[derive(Args, Debug)]
struct StatArgs {
    files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut sqfs = SquashFS::open(&cli.filesystem)
        .context("Failed to open SquashFS")?;
    match &cli.command {
        Command::Cat(args) => cmd_cat(&mut sqfs, args),
        Command::Ls(args) => cmd_ls(&mut sqfs, args),
        Command::Unpack(args) => cmd_unpack(&mut sqfs, args),
        Command::Stat(args) => cmd_stat(&mut sqfs, args),
    }
}

fn cmd_cat<R: Read + Seek>(sqfs: &mut SquashFS<R>, args: &CatArgs) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    for file_arg in &args.files {
        let inode = sqfs.inode_from_path(file_arg)
            .with_context(|| format!("Cannot open '{}'", file_arg.display()))?;
        if inode.is_dir() {
            warn!(path = %file_arg.display(), "skipping directory");
            continue;
        }
        stdout.write_all(&sqfs.read_file(&inode)?)?;
    }
    Ok(())
}

fn cmd_ls<R: Read + Seek>(sqfs: &mut SquashFS<R>, args: &LsArgs) -> anyhow::Result<()> {
    let default = [PathBuf::from("/")];
    let paths = if args.files.is_empty() { &default[..] } else { &args.files[..] };
    let single_path = paths.len() == 1;
    let mut first = true;

    // First, print non-directories that directly appeared as arguments
    let mut files = Vec::new();
    for file_arg in paths {
        match sqfs.inode_from_path(file_arg) {
            Ok(inode) if !inode.is_dir() => files.push((file_arg.display().to_string(), inode)),
            Ok(_) => {},
            Err(e) => warn!(path = %file_arg.display(), error = %e, "cannot access"),
        }
    }
    if !files.is_empty() {
        display_files(sqfs, files, args.long)?;
        first = false;
    }

    // Next, print the contents of each directory argument, preceded by "<NAME>:"
    // If only a single path argument is supplied, do not precede with the "<NAME>:" header
    for file_arg in paths {
        let Ok(inode) = sqfs.inode_from_path(file_arg) else { continue };
        if !inode.is_dir() {
            continue;
        }
        let entries = sqfs.read_dir_inode(&inode)?.collect::<Result<Vec<_>, _>>()?;
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            files.push((entry.file_name(), sqfs.inode_from_entryref(entry.inode_ref)?));
        }
        if !first {
            println!();
        }
        if !single_path {
            println!("{}:", file_arg.display());
        }
        display_files(sqfs, files, args.long)?;
        first = false;
    }
    Ok(())
}

fn display_files<R: Read + Seek>(sqfs: &SquashFS<R>, files: Vec<(String, Inode)>, long: bool) -> anyhow::Result<()> {
    for (filename, inode) in files {
        if !long {
            println!("{filename}");
            continue;
        }
        let link_postfix = match &inode.extended_info {
            InodeExtendedInfo::Symlink(i) => format!(" -> {}", String::from_utf8_lossy(&i.target_path)),
            _ => String::new(),
        };
        println!("{} {:>5} {:>5} {:>10} {}{}",
            inode_mode_string(inode.mode()),
            sqfs.uid(&inode)?,
            sqfs.gid(&inode)?,
            inode.file_size().unwrap_or(0),
            filename,
            link_postfix);
    }
    Ok(())
}

fn cmd_unpack<R: Read + Seek>(sqfs: &mut SquashFS<R>, args: &UnpackArgs) -> anyhow::Result<()> {
    let inode = sqfs.inode_from_path(&args.path)
        .with_context(|| format!("Cannot open '{}'", args.path.display()))?;
    unpack_inode(sqfs, &inode, &args.dest, !args.no_sparse, &mut Vec::new())
}

// `ancestors` holds the listing locations of the directories being unpacked above `inode`
fn unpack_inode<R: Read + Seek>(sqfs: &mut SquashFS<R>, inode: &Inode, dest: &Path, allow_sparse: bool,
                                ancestors: &mut Vec<(u32, u16)>) -> anyhow::Result<()> {
    debug!(dest = %dest.display(), inode = inode.inode_number(), "unpacking");
    if let Some(dir) = inode.dir_info() {
        let listing = (dir.block_index, dir.block_offset);
        if ancestors.contains(&listing) {
            bail!("Directory loop at '{}'", dest.display());
        }
        fs::create_dir_all(dest)
            .with_context(|| format!("Cannot create directory '{}'", dest.display()))?;
        let entries = sqfs.read_dir_inode(inode)?.collect::<Result<Vec<_>, _>>()?;
        ancestors.push(listing);
        for entry in entries {
            let child = sqfs.inode_from_entryref(entry.inode_ref)?;
            unpack_inode(sqfs, &child, &dest.join(entry.file_name()), allow_sparse, ancestors)?;
        }
        ancestors.pop();
    } else if inode.is_file() {
        let mut out = File::create(dest)
            .with_context(|| format!("Cannot create '{}'", dest.display()))?;
        sqfs.dump_file(inode, &mut out, allow_sparse)
            .with_context(|| format!("Failed to write '{}'", dest.display()))?;
    } else {
        warn!(dest = %dest.display(), inode_type = ?inode.inode_type, "skipping special file");
    }
    Ok(())
}

fn cmd_stat<R: Read + Seek>(sqfs: &mut SquashFS<R>, args: &StatArgs) -> anyhow::Result<()> {
    if args.files.is_empty() {
        bail!("No paths given");
    }
    for file_arg in &args.files {
        let inode = sqfs.inode_from_path(file_arg)
            .with_context(|| format!("Cannot open '{}'", file_arg.display()))?;
        println!("  File: {}", file_arg.display());
        println!("  Type: {:?}", inode.inode_type);
        println!(" Inode: {}", inode.inode_number());
        println!("Access: ({:04o}/{})  Uid: {}  Gid: {}",
            inode.permissions(), inode_mode_string(inode.mode()), sqfs.uid(&inode)?, sqfs.gid(&inode)?);
        println!("Modify: {}", inode.mtime());
        match &inode.extended_info {
            InodeExtendedInfo::File(f) => {
                println!("  Size: {}  Blocks: {}  Sparse: {}", f.file_size, f.block_sizes.len(), f.sparse);
                if f.has_fragment() {
                    println!("  Frag: {} @ {}", f.frag_index, f.frag_offset);
                }
            },
            InodeExtendedInfo::Dir(d) => {
                println!("  Size: {}  Links: {}  Index: {}", d.file_size, d.link_count, d.index.len());
            },
            InodeExtendedInfo::Symlink(s) => {
                println!("Target: {}", String::from_utf8_lossy(&s.target_path));
            },
            InodeExtendedInfo::Dev(d) => {
                println!("Device: {}:{}", (d.dev_number >> 8) & 0xFFF, (d.dev_number & 0xFF) | ((d.dev_number >> 12) & 0xFFF00));
            },
            InodeExtendedInfo::Ipc(_) => {},
        }
    }
    Ok(())
}

fn inode_mode_string(mode: u16) -> String {
    let mut s = String::with_capacity(10);
    let mode_type = (mode & 0o170000) >> 12;
    let ch = match mode_type {
        1 => 'p',  // Pipe
        2 => 'c',  // char-dev
        4 => 'd',  // dir
        6 => 'b',  // block-dev
        8 => '-',  // file
        10 => 'l', // symlink
        12 => 's', // socket
        _ => '?',  // unknown
    };
    s.push(ch);
    for (bit, c) in [(0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
                     (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
                     (0o004, 'r'), (0o002, 'w'), (0o001, 'x')] {
        s.push(if mode & bit != 0 { c } else { '-' });
    }
    s
}
