//! gensqfs - Create a SquashFS image from a directory or a description file.

use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::debug;

use sqfs::{
    builder::{build, BuildOptions},
    compress::{CompressorConfig, CompressorId, CompressorRegistry},
    sortfile::SortFile,
    source::{DescriptionSource, DirSource},
    squashfs::{
        format::DEFAULT_BLOCK_SIZE,
        writer::{write_image, WriterOptions},
    },
};

/// Create a SquashFS image from a source directory or a description file.
#[derive(Parser, Debug)]
#[command(name = "gensqfs", version, about)]
struct Args {
    /// Treat SOURCE as a description file listing the entries of the image.
    #[arg(long)]
    description: bool,

    /// Directory that file locations in a description are relative to.
    ///
    /// Defaults to the directory containing the description.
    #[arg(long, requires = "description")]
    pack_dir: Option<PathBuf>,

    /// Block compressor.
    #[arg(long, default_value = "gzip")]
    compressor: CompressorId,

    /// Compression level; the compressor's default if not given.
    #[arg(long)]
    level: Option<u32>,

    /// Data block size, a power of two between 4 KiB and 1 MiB.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Owner of every entry in the image.
    #[arg(long)]
    force_uid: Option<u32>,

    /// Group of every entry in the image.
    #[arg(long)]
    force_gid: Option<u32>,

    /// Store file tails in their own blocks instead of shared fragment blocks.
    #[arg(long)]
    no_tail_packing: bool,

    /// Don't look for files with identical blocks.
    #[arg(long)]
    no_dedup: bool,

    /// Extended attributes to add, in `getfattr --dump` format.
    #[arg(long)]
    xattr_file: Option<PathBuf>,

    /// SELinux file contexts to label the entries with.
    #[arg(long)]
    selinux: Option<PathBuf>,

    /// Per-file packing priorities and flags.
    #[arg(long)]
    sort_file: Option<PathBuf>,

    /// Leave out entries whose image path (`/a/b`) matches this regular expression.
    #[arg(long)]
    exclude: Vec<String>,

    /// Copy extended attributes from the source directory.
    #[arg(long, conflicts_with = "description")]
    keep_xattrs: bool,

    /// Don't descend into directories on other filesystems.
    #[arg(long, conflicts_with = "description")]
    one_file_system: bool,

    /// Compression threads.  Defaults to the number of CPUs.
    #[arg(long)]
    workers: Option<usize>,

    /// Modification time stored in the superblock.
    ///
    /// Defaults to $SOURCE_DATE_EPOCH, or the newest modification time in the image.
    #[arg(long)]
    mkfs_time: Option<u32>,

    /// The source directory or description file.
    source: PathBuf,

    /// The output image path.
    image: PathBuf,
}

fn source_date_epoch() -> Result<Option<i64>> {
    match env::var("SOURCE_DATE_EPOCH") {
        Ok(value) => Ok(Some(value.trim().parse().with_context(|| {
            format!("Invalid SOURCE_DATE_EPOCH {value:?}")
        })?)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).context("Invalid SOURCE_DATE_EPOCH"),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let epoch = source_date_epoch()?;
    let build_options = BuildOptions {
        force_uid: args.force_uid,
        force_gid: args.force_gid,
        exclude: args.exclude.clone(),
        xattrs: args.keep_xattrs,
        one_file_system: args.one_file_system,
        xattr_map: args.xattr_file.clone(),
        selinux: args.selinux.clone(),
        default_mtime: epoch.unwrap_or(0),
    };
    let mut hooks = build_options
        .hooks()
        .context("Failed to set up post-processing")?;

    let tree = if args.description {
        let base = match &args.pack_dir {
            Some(dir) => dir.clone(),
            None => args
                .source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        let mut source = DescriptionSource::load(&args.source, &base, build_options.default_mtime)
            .with_context(|| format!("Failed to read description {:?}", args.source))?;
        build(&mut source, &mut hooks, build_options.default_mtime)
    } else {
        let mut source = DirSource::open(&args.source, build_options.dir_source_options())
            .with_context(|| format!("Failed to open {:?}", args.source))?;
        build(&mut source, &mut hooks, build_options.default_mtime)
    }
    .with_context(|| format!("Failed to scan {:?}", args.source))?;

    let sort = match &args.sort_file {
        Some(path) => Some(
            SortFile::load(path).with_context(|| format!("Failed to read sort file {path:?}"))?,
        ),
        None => None,
    };

    let mkfs_time = match (args.mkfs_time, epoch) {
        (Some(time), _) => Some(time),
        (None, Some(epoch)) => match u32::try_from(epoch) {
            Ok(time) => Some(time),
            Err(_) => bail!("SOURCE_DATE_EPOCH {epoch} doesn't fit in the superblock"),
        },
        (None, None) => None,
    };

    let defaults = WriterOptions::default();
    let options = WriterOptions {
        block_size: args.block_size,
        compressor: CompressorConfig {
            id: args.compressor,
            level: args.level,
        },
        tail_packing: !args.no_tail_packing,
        deduplicate: !args.no_dedup,
        workers: args.workers.unwrap_or(defaults.workers).max(1),
        mkfs_time,
        sort,
        ..defaults
    };
    debug!("{options:?}");

    let registry = CompressorRegistry::with_defaults();
    // read back when checking duplicate blocks
    let mut output = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.image)
        .with_context(|| format!("Failed to create {:?}", args.image))?;
    let summary = match write_image(&tree, &mut output, &options, &registry) {
        Ok(summary) => summary,
        Err(e) => {
            drop(output);
            let _ = fs::remove_file(&args.image);
            return Err(e).with_context(|| format!("Failed to write {:?}", args.image));
        }
    };

    println!(
        "{:?}: {} inodes, {} bytes, {} files ({} bytes in, {} blocks, {} duplicate, {} sparse, {} fragment blocks)",
        args.image,
        summary.inode_count,
        summary.bytes_used,
        summary.data.files,
        summary.data.bytes_in,
        summary.data.blocks_written,
        summary.data.duplicate_blocks,
        summary.data.sparse_blocks,
        summary.data.fragment_blocks,
    );
    Ok(())
}
