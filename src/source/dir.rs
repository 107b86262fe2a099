//! Enumeration of a live directory tree.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    ffi::{CStr, OsStr},
    mem::MaybeUninit,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    vec,
};

use log::{debug, warn};
use rustix::{
    fd::{AsFd, OwnedFd},
    fs::{fstat, getxattr, listxattr, openat, readlinkat, Dir, FileType, Mode, OFlags, CWD},
};
use zerocopy::IntoBytes;

use super::{DirEntry, DirEntryKind, DirectorySource, SourceError};
use crate::{
    generic_tree::Stat,
    squashfs::{format::xattr_prefix, tables::XattrSet},
    tree::FileSource,
    util::proc_self_fd,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct DirSourceOptions {
    /// Read extended attributes from the files.
    pub xattrs: bool,
    /// Don't descend into directories on other devices.  The mount points themselves are
    /// still included, empty.
    pub one_file_system: bool,
}

struct Frame {
    fd: OwnedFd,
    path: PathBuf,
    names: vec::IntoIter<Box<OsStr>>,
}

/// Depth-first walk of a directory, children of each directory in byte order.
///
/// Non-directories are tracked by `(device, inode)` so that further names of the same file are
/// reported as [`DirEntryKind::Hardlink`].
pub struct DirSource {
    root: PathBuf,
    options: DirSourceOptions,
    root_fd: Option<OwnedFd>,
    root_dev: u64,
    stack: Vec<Frame>,
    inodes: HashMap<(u64, u64), PathBuf>,
    last: Option<(PathBuf, OwnedFd)>,
}

fn read_xattrs(fd: &OwnedFd, path: &Path) -> Result<XattrSet, SourceError> {
    // flistxattr() and fgetxattr() don't work on O_PATH fds, so go via /proc/self/fd, which
    // also gives the right answer for symlinks themselves.
    let filename = proc_self_fd(fd);
    let mut xattrs = BTreeMap::new();

    let mut names = vec![MaybeUninit::new(0); 65536];
    let (names, _) =
        listxattr(&filename, &mut names[..]).map_err(|e| SourceError::io(path, e))?;

    for name in names.split_inclusive(|c| *c == 0) {
        let name = CStr::from_bytes_with_nul(name.as_bytes())
            .map_err(|e| SourceError::io(path, std::io::Error::other(e)))?;
        if xattr_prefix(name.to_bytes()).is_none() {
            warn!("{path:?}: skipping unsupported xattr {name:?}");
            continue;
        }

        let mut buffer = vec![MaybeUninit::new(0); 65536];
        let (value, _) =
            getxattr(&filename, name, &mut buffer[..]).map_err(|e| SourceError::io(path, e))?;
        xattrs.insert(
            Box::from(OsStr::from_bytes(name.to_bytes())),
            Box::from(&*value),
        );
    }

    Ok(xattrs)
}

impl DirSource {
    pub fn open(root: &Path, options: DirSourceOptions) -> Result<Self, SourceError> {
        let fd = openat(
            CWD,
            root,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| SourceError::io(root, e))?;
        let root_dev = fstat(&fd).map_err(|e| SourceError::io(root, e))?.st_dev as u64;

        Ok(Self {
            root: root.to_path_buf(),
            options,
            root_fd: Some(fd),
            root_dev,
            stack: vec![],
            inodes: HashMap::new(),
            last: None,
        })
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn push_frame(&mut self, fd: OwnedFd, path: PathBuf) -> Result<(), SourceError> {
        let host = self.host_path(&path);
        let mut names = vec![];
        for item in Dir::read_from(fd.as_fd()).map_err(|e| SourceError::io(&host, e))? {
            let entry = item.map_err(|e| SourceError::io(&host, e))?;
            let name = entry.file_name().to_bytes();
            if name != b"." && name != b".." {
                names.push(Box::from(OsStr::from_bytes(name)));
            }
        }
        names.sort();

        self.stack.push(Frame {
            fd,
            path,
            names: names.into_iter(),
        });
        Ok(())
    }

    fn entry(&mut self, path: PathBuf, fd: &OwnedFd) -> Result<DirEntry, SourceError> {
        let host = self.host_path(&path);
        let buf = fstat(fd).map_err(|e| SourceError::io(&host, e))?;

        let xattrs = match self.options.xattrs {
            true => read_xattrs(fd, &host)?,
            false => BTreeMap::new(),
        };
        let stat = Stat {
            st_mode: buf.st_mode as u32 & 0o7777,
            st_uid: buf.st_uid,
            st_gid: buf.st_gid,
            st_mtim_sec: buf.st_mtime as i64,
            xattrs: RefCell::new(xattrs),
        };

        let file_type = FileType::from_raw_mode(buf.st_mode as _);
        let mut kind = match file_type {
            FileType::Directory => DirEntryKind::Directory,
            FileType::RegularFile => DirEntryKind::Regular,
            FileType::Symlink => DirEntryKind::Symlink,
            FileType::BlockDevice => DirEntryKind::BlockDevice(buf.st_rdev as u64),
            FileType::CharacterDevice => DirEntryKind::CharacterDevice(buf.st_rdev as u64),
            FileType::Fifo => DirEntryKind::Fifo,
            FileType::Socket => DirEntryKind::Socket,
            FileType::Unknown => {
                return Err(SourceError::UnsupportedType {
                    path: host,
                    mode: buf.st_mode as u32,
                })
            }
        };

        // NB: some filesystems report st_nlink incorrectly, so every non-directory is tracked
        if file_type != FileType::Directory {
            let key = (buf.st_dev as u64, buf.st_ino as u64);
            match self.inodes.get(&key) {
                Some(first) => kind = DirEntryKind::Hardlink(first.clone()),
                None => {
                    self.inodes.insert(key, path.clone());
                }
            }
        }

        let size = match kind {
            DirEntryKind::Regular => buf.st_size as u64,
            _ => 0,
        };
        Ok(DirEntry {
            path,
            kind,
            stat,
            size,
        })
    }
}

impl DirectorySource for DirSource {
    fn next_entry(&mut self) -> Result<Option<DirEntry>, SourceError> {
        self.last = None;

        if let Some(fd) = self.root_fd.take() {
            let entry = self.entry(PathBuf::new(), &fd)?;
            self.push_frame(fd, PathBuf::new())?;
            return Ok(Some(entry));
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(name) = frame.names.next() else {
                self.stack.pop();
                continue;
            };
            let path = frame.path.join(&*name);

            let fd = openat(
                &frame.fd,
                &*name,
                OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                Mode::empty(),
            )
            .map_err(|e| SourceError::io(self.host_path(&path), e))?;
            let entry = self.entry(path.clone(), &fd)?;

            if entry.is_dir() {
                let dev = fstat(&fd)
                    .map_err(|e| SourceError::io(self.host_path(&path), e))?
                    .st_dev as u64;
                if self.options.one_file_system && dev != self.root_dev {
                    debug!("not crossing into {:?}", self.host_path(&path));
                } else {
                    let dirfd = openat(
                        &fd,
                        ".",
                        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
                        Mode::empty(),
                    )
                    .map_err(|e| SourceError::io(self.host_path(&path), e))?;
                    self.push_frame(dirfd, path)?;
                }
            } else {
                self.last = Some((path, fd));
            }
            return Ok(Some(entry));
        }
    }

    fn read_link(&mut self) -> Result<Box<OsStr>, SourceError> {
        let Some((path, fd)) = &self.last else {
            return Err(SourceError::NotASymlink(self.root.clone()));
        };
        let target = readlinkat(fd, "", Vec::new()).map_err(|e| match e {
            rustix::io::Errno::NOENT | rustix::io::Errno::INVAL => {
                SourceError::NotASymlink(self.host_path(path))
            }
            e => SourceError::io(self.host_path(path), e),
        })?;
        Ok(OsStr::from_bytes(target.as_bytes()).into())
    }

    fn open_file(&self, path: &Path) -> Result<FileSource, SourceError> {
        Ok(FileSource::Host(self.host_path(path)))
    }
}
