//! Extracting a tree read from an image into a host directory.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs::File,
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::{Context, Result};
use log::{debug, trace};
use rustix::{
    fd::{AsFd, OwnedFd},
    fs::{
        chmodat, chownat, linkat, mkdirat, mknodat, openat, setxattr, symlinkat, utimensat,
        AtFlags, FileType, Gid, Mode, OFlags, Timespec, Timestamps, Uid, XattrFlags, CWD,
    },
    io::Errno,
};

use crate::{
    generic_tree::Stat,
    squashfs::reader::{Directory, FileSystem, Image, Inode, Leaf, LeafContent},
    util::proc_self_fd,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackOptions {
    /// Restore owner and group (usually needs privileges).
    pub set_owner: bool,
    /// Restore extended attributes.
    pub set_xattrs: bool,
}

/// Attempt to use O_TMPFILE + linkat to atomically create a file with its contents.
/// Falls back to a plain create if the target doesn't support O_TMPFILE.
fn set_file_contents(
    dirfd: &OwnedFd,
    name: &OsStr,
    mode: Mode,
    content: &mut impl io::Read,
) -> Result<()> {
    match openat(
        dirfd,
        ".",
        OFlags::WRONLY | OFlags::TMPFILE | OFlags::CLOEXEC,
        mode,
    ) {
        Ok(tmp) => {
            let mut tmp = File::from(tmp);
            io::copy(content, &mut tmp)?;
            linkat(
                CWD,
                proc_self_fd(&tmp),
                dirfd,
                name,
                AtFlags::SYMLINK_FOLLOW,
            )?;
        }
        Err(Errno::OPNOTSUPP | Errno::ISDIR) => {
            let fd = openat(
                dirfd,
                name,
                OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
                mode,
            )?;
            io::copy(content, &mut File::from(fd))?;
        }
        Err(e) => Err(e)?,
    }
    Ok(())
}

struct Unpacker<'a, 'i> {
    image: &'a Image<'i>,
    options: UnpackOptions,
    root: OwnedFd,
    /// Where each hard-linked leaf was first written, relative to the root.
    written: HashMap<*const Leaf, PathBuf>,
}

impl Unpacker<'_, '_> {
    /// Applies ownership, xattrs, mode and mtime, in that order: chown clears set-id bits.
    fn set_metadata(
        &self,
        dirfd: impl AsFd,
        name: &Path,
        stat: &Stat,
        is_symlink: bool,
    ) -> Result<()> {
        if self.options.set_owner {
            chownat(
                &dirfd,
                name,
                Some(Uid::from_raw(stat.st_uid)),
                Some(Gid::from_raw(stat.st_gid)),
                AtFlags::SYMLINK_NOFOLLOW,
            )
            .context("Failed to set owner")?;
        }

        if self.options.set_xattrs && !stat.xattrs.borrow().is_empty() {
            // setxattr() doesn't work on O_PATH fds; the /proc/self/fd link resolves to the
            // file itself, even for symlinks.
            let fd = openat(
                &dirfd,
                name,
                OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                Mode::empty(),
            )?;
            let path = proc_self_fd(&fd);
            for (key, value) in stat.xattrs.borrow().iter() {
                setxattr(&path, &**key, value, XattrFlags::empty())
                    .with_context(|| format!("Failed to set xattr {key:?}"))?;
            }
        }

        if !is_symlink {
            chmodat(&dirfd, name, stat.st_mode.into(), AtFlags::empty())
                .context("Failed to set mode")?;
        }

        let mtime = Timespec {
            tv_sec: stat.st_mtim_sec,
            tv_nsec: 0,
        };
        let times = Timestamps {
            last_access: mtime,
            last_modification: mtime,
        };
        utimensat(&dirfd, name, &times, AtFlags::SYMLINK_NOFOLLOW)
            .context("Failed to set modification time")?;
        Ok(())
    }

    fn write_leaf(&mut self, leaf: &Rc<Leaf>, dirfd: &OwnedFd, path: &Path) -> Result<()> {
        let name = path.file_name().context("Leaf without a name")?;

        if Rc::strong_count(leaf) > 1 {
            if let Some(first) = self.written.get(&Rc::as_ptr(leaf)) {
                trace!("{path:?} is a hard link to {first:?}");
                linkat(&self.root, first, dirfd, name, AtFlags::empty())?;
                return Ok(());
            }
            self.written.insert(Rc::as_ptr(leaf), path.to_path_buf());
        }

        // Created private; the final mode is applied by set_metadata().
        let private = Mode::from_raw_mode(0o600);
        match &leaf.content {
            LeafContent::Regular(layout) => {
                let mut content = self.image.open_file(layout);
                set_file_contents(dirfd, name, private, &mut content)?
            }
            LeafContent::BlockDevice(rdev) => {
                mknodat(dirfd, name, FileType::BlockDevice, private, *rdev)?
            }
            LeafContent::CharacterDevice(rdev) => {
                mknodat(dirfd, name, FileType::CharacterDevice, private, *rdev)?
            }
            LeafContent::Socket => mknodat(dirfd, name, FileType::Socket, private, 0)?,
            LeafContent::Fifo => mknodat(dirfd, name, FileType::Fifo, private, 0)?,
            LeafContent::Symlink(target) => symlinkat(&**target, dirfd, name)?,
        }

        let is_symlink = matches!(leaf.content, LeafContent::Symlink(_));
        self.set_metadata(dirfd, Path::new(name), &leaf.stat, is_symlink)
    }

    fn write_directory(&mut self, dir: &Directory, dirfd: &OwnedFd, path: &Path) -> Result<()> {
        let name = path.file_name().context("Directory without a name")?;
        match mkdirat(dirfd, name, Mode::from_raw_mode(0o700)) {
            Ok(()) | Err(Errno::EXIST) => {}
            Err(e) => Err(e)?,
        }

        let fd = openat(
            dirfd,
            name,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        self.write_directory_contents(dir, &fd, path)?;
        self.set_metadata(dirfd, Path::new(name), &dir.stat, false)
    }

    fn write_directory_contents(
        &mut self,
        dir: &Directory,
        fd: &OwnedFd,
        path: &Path,
    ) -> Result<()> {
        for (name, inode) in dir.sorted_entries() {
            let path = path.join(name);
            match inode {
                Inode::Directory(ref dir) => self.write_directory(dir, fd, &path),
                Inode::Leaf(ref leaf) => self.write_leaf(leaf, fd, &path),
            }
            .with_context(|| format!("Failed to extract /{}", path.display()))?;
        }

        Ok(())
    }
}

/// Writes `fs` (read from `image`) below `target`, which must be an existing directory.
///
/// Hard links are recreated.  The attributes of the root are applied to `target` itself.
pub fn unpack(image: &Image, fs: &FileSystem, target: &Path, options: UnpackOptions) -> Result<()> {
    let root = openat(
        CWD,
        target,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("Failed to open {target:?}"))?;

    let mut unpacker = Unpacker {
        image,
        options,
        root,
        written: HashMap::new(),
    };
    let root = unpacker.root.try_clone()?;
    unpacker.write_directory_contents(&fs.root, &root, Path::new(""))?;
    unpacker
        .set_metadata(CWD, target, &fs.root.stat, false)
        .with_context(|| format!("Failed to set attributes of {target:?}"))?;
    debug!("unpacked into {target:?}");
    Ok(())
}
