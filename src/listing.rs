//! Text listing of a tree read back from an image.
//!
//! One line per entry, parents before children and siblings in byte order:
//!
//! ```text
//! MODE UID/GID SIZE MTIME PATH [-> TARGET]
//! ```
//!
//! Bytes in paths and link targets that aren't printable ASCII are written as `\xNN`.

use std::{
    ffi::OsStr,
    fmt::{self, Write as FmtWrite},
    io::Write,
    os::unix::ffi::OsStrExt,
    path::Path,
};

use anyhow::{Context, Result};
use rustix::fs::{major, minor};

use crate::{
    generic_tree::Stat,
    squashfs::reader::{Directory, FileSystem, Inode, LeafContent},
    util::format_mtime,
};

fn write_escaped(writer: &mut impl fmt::Write, bytes: &[u8]) -> fmt::Result {
    for &c in bytes {
        match c {
            b'\\' => writer.write_str("\\\\")?,
            b'\n' => writer.write_str("\\n")?,
            b'\t' => writer.write_str("\\t")?,
            c if (b' '..=b'~').contains(&c) => writer.write_char(c as char)?,
            _ => write!(writer, "\\x{c:02x}")?,
        }
    }
    Ok(())
}

/// `ls -l` style mode string: type character followed by the nine permission characters.
pub fn mode_string(type_char: char, mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for (shift, special, special_char) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')] {
        let bits = (mode >> shift) & 7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(match (bits & 1 != 0, mode & special != 0) {
            (true, true) => special_char,
            (false, true) => special_char.to_ascii_uppercase(),
            (true, false) => 'x',
            (false, false) => '-',
        });
    }
    out
}

fn write_line(
    line: &mut String,
    path: &[u8],
    type_char: char,
    stat: &Stat,
    size: &str,
    target: Option<&OsStr>,
) -> fmt::Result {
    write!(
        line,
        "{} {}/{} {size} {} ",
        mode_string(type_char, stat.st_mode),
        stat.st_uid,
        stat.st_gid,
        format_mtime(stat.st_mtim_sec),
    )?;
    write_escaped(line, path)?;
    if let Some(target) = target {
        line.push_str(" -> ");
        write_escaped(line, target.as_bytes())?;
    }
    line.push('\n');
    Ok(())
}

fn format_inode(line: &mut String, path: &[u8], inode: &Inode) -> fmt::Result {
    let leaf = match inode {
        Inode::Directory(dir) => {
            return write_line(line, path, 'd', &dir.stat, &dir.len().to_string(), None)
        }
        Inode::Leaf(leaf) => leaf,
    };

    let device = |rdev: u64| format!("{},{}", major(rdev), minor(rdev));
    match &leaf.content {
        LeafContent::Regular(layout) => {
            write_line(line, path, '-', &leaf.stat, &layout.size.to_string(), None)
        }
        LeafContent::Symlink(target) => write_line(
            line,
            path,
            'l',
            &leaf.stat,
            &target.len().to_string(),
            Some(target),
        ),
        LeafContent::BlockDevice(rdev) => {
            write_line(line, path, 'b', &leaf.stat, &device(*rdev), None)
        }
        LeafContent::CharacterDevice(rdev) => {
            write_line(line, path, 'c', &leaf.stat, &device(*rdev), None)
        }
        LeafContent::Fifo => write_line(line, path, 'p', &leaf.stat, "0", None),
        LeafContent::Socket => write_line(line, path, 's', &leaf.stat, "0", None),
    }
}

fn join(parent: &[u8], name: &OsStr) -> Vec<u8> {
    let mut path = parent.to_vec();
    if path.last() != Some(&b'/') {
        path.push(b'/');
    }
    path.extend_from_slice(name.as_bytes());
    path
}

struct Lister<'w, W: Write> {
    output: &'w mut W,
    line: String,
}

impl<W: Write> Lister<'_, W> {
    fn entry(&mut self, path: &[u8], inode: &Inode) -> Result<()> {
        self.line.clear();
        format_inode(&mut self.line, path, inode)?;
        self.output.write_all(self.line.as_bytes())?;

        if let Inode::Directory(dir) = inode {
            self.children(path, dir)?;
        }
        Ok(())
    }

    fn children(&mut self, path: &[u8], dir: &Directory) -> Result<()> {
        for (name, inode) in dir.sorted_entries() {
            self.entry(&join(path, name), inode)?;
        }
        Ok(())
    }
}

/// Lists the entry at `path` (`/` for the whole tree) and everything below it.
pub fn write_listing(output: &mut impl Write, fs: &FileSystem, path: &Path) -> Result<()> {
    let mut lister = Lister {
        output,
        line: String::new(),
    };

    let display = Path::new("/").join(path);
    let display = display.as_os_str().as_bytes();
    if path.file_name().is_none() {
        lister.line.clear();
        let size = fs.root.len().to_string();
        write_line(&mut lister.line, display, 'd', &fs.root.stat, &size, None)?;
        lister.output.write_all(lister.line.as_bytes())?;
        return lister.children(display, &fs.root);
    }

    let (dir, name) = fs
        .root
        .split(path.as_os_str())
        .with_context(|| format!("No such entry {path:?}"))?;
    let inode = dir
        .lookup(name)
        .with_context(|| format!("No such entry {path:?}"))?;
    lister.entry(display, inode)
}
