//! unsqfs - Inspect and extract SquashFS images.

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sqfs::{
    compress::CompressorRegistry,
    listing::write_listing,
    squashfs::reader::Image,
    unpack::{unpack, UnpackOptions},
};

/// Inspect and extract SquashFS images.
#[derive(Parser, Debug)]
#[command(name = "unsqfs", version, about)]
struct Args {
    /// The image to read.
    image: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists the entries below PATH, one per line.
    Ls {
        #[arg(default_value = "/")]
        path: PathBuf,
    },
    /// Writes the content of a regular file to stdout.
    Cat { path: PathBuf },
    /// Extracts the whole tree into an existing directory.
    Unpack {
        dir: PathBuf,
        /// Restore owners and groups.
        #[arg(long)]
        set_owner: bool,
        /// Restore extended attributes.
        #[arg(long)]
        set_xattrs: bool,
    },
    /// Prints the superblock.
    Info,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let data = fs::read(&args.image).with_context(|| format!("Failed to read {:?}", args.image))?;
    let registry = CompressorRegistry::with_defaults();
    let image = Image::open(&data, &registry)
        .with_context(|| format!("{:?} is not a usable image", args.image))?;

    let mut stdout = io::stdout().lock();
    match args.cmd {
        Command::Info => write!(stdout, "{}", image.superblock_info())?,
        Command::Ls { path } => {
            let fs = image.read_tree()?;
            write_listing(&mut stdout, &fs, &path)?;
        }
        Command::Cat { path } => {
            let fs = image.read_tree()?;
            let (dir, name) = fs
                .root
                .split(path.as_os_str())
                .with_context(|| format!("No such file {path:?}"))?;
            let layout = dir
                .get_file(name)
                .with_context(|| format!("Can't read {path:?}"))?;
            io::copy(&mut image.open_file(layout), &mut stdout)
                .with_context(|| format!("Failed to read {path:?}"))?;
        }
        Command::Unpack {
            dir,
            set_owner,
            set_xattrs,
        } => {
            let fs = image.read_tree()?;
            let options = UnpackOptions {
                set_owner,
                set_xattrs,
            };
            unpack(&image, &fs, &dir, options)?;
        }
    }
    stdout.flush()?;
    Ok(())
}
