//! A generic metadata-only filesystem tree where regular files can be stored
//! however the caller wants.
//!
//! The image writer fills regular files with a [`crate::tree::FileSource`] describing where the
//! content comes from; the image reader fills them with the [`crate::data::FileLayout`] found in
//! the image.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Component, Path},
    rc::Rc,
};

use thiserror::Error;

use crate::squashfs::format::MAX_NAME_LEN;

/// File metadata similar to `struct stat` from POSIX.
#[derive(Debug)]
pub struct Stat {
    /// Permission bits (the `0o7777` part of `st_mode`).
    pub st_mode: u32,
    /// User ID of owner.
    pub st_uid: u32,
    /// Group ID of owner.
    pub st_gid: u32,
    /// Modification time in seconds since Unix epoch.
    pub st_mtim_sec: i64,
    /// Extended attributes as key-value pairs.
    pub xattrs: RefCell<BTreeMap<Box<OsStr>, Box<[u8]>>>,
}

impl Clone for Stat {
    fn clone(&self) -> Self {
        Self {
            st_mode: self.st_mode,
            st_uid: self.st_uid,
            st_gid: self.st_gid,
            st_mtim_sec: self.st_mtim_sec,
            xattrs: RefCell::new(self.xattrs.borrow().clone()),
        }
    }
}

impl PartialEq for Stat {
    fn eq(&self, other: &Self) -> bool {
        self.st_mode == other.st_mode
            && self.st_uid == other.st_uid
            && self.st_gid == other.st_gid
            && self.st_mtim_sec == other.st_mtim_sec
            && *self.xattrs.borrow() == *other.xattrs.borrow()
    }
}

impl Stat {
    /// A stat with the given permission bits, owned by root, with an mtime of 0 and no xattrs.
    pub fn with_mode(st_mode: u32) -> Self {
        Self {
            st_mode,
            st_uid: 0,
            st_gid: 0,
            st_mtim_sec: 0,
            xattrs: RefCell::new(BTreeMap::new()),
        }
    }

    /// The modification time as stored in an image: whole seconds, clamped into `u32`.
    pub fn image_mtime(&self) -> u32 {
        self.st_mtim_sec.clamp(0, u32::MAX as i64) as u32
    }
}

/// Content types for leaf nodes (non-directory files).
#[derive(Debug)]
pub enum LeafContent<T> {
    /// A regular file with content of type `T`.
    Regular(T),
    /// A block device with the given device number.
    BlockDevice(u64),
    /// A character device with the given device number.
    CharacterDevice(u64),
    /// A named pipe (FIFO).
    Fifo,
    /// A Unix domain socket.
    Socket,
    /// A symbolic link pointing to the given target path.
    Symlink(Box<OsStr>),
}

/// A leaf node representing a non-directory file.
#[derive(Debug)]
pub struct Leaf<T> {
    /// Metadata for this leaf node.
    pub stat: Stat,
    /// The content and type of this leaf node.
    pub content: LeafContent<T>,
}

/// A directory node containing named entries.
#[derive(Debug, Clone)]
pub struct Directory<T> {
    /// Metadata for this directory.
    pub stat: Stat,
    /// Map of filenames to inodes within this directory.
    pub(crate) entries: BTreeMap<Box<OsStr>, Inode<T>>,
}

/// A filesystem inode representing either a directory or a leaf node.
#[derive(Debug, Clone)]
pub enum Inode<T> {
    /// A directory inode.
    Directory(Box<Directory<T>>),
    /// A leaf inode (reference-counted to support hardlinks).
    Leaf(Rc<Leaf<T>>),
}

/// Errors that can occur when working with filesystem trees.
#[derive(Error, Debug)]
pub enum TreeError {
    /// The filename contains invalid components (e.g., "..", ".", "/" or too many bytes).
    #[error("Invalid filename {0:?}")]
    InvalidFilename(Box<OsStr>),
    /// The specified directory entry does not exist.
    #[error("Directory entry {0:?} does not exist")]
    NotFound(Box<OsStr>),
    /// The entry exists but is not a directory when a directory was expected.
    #[error("Directory entry {0:?} is not a subdirectory")]
    NotADirectory(Box<OsStr>),
    /// The entry is a directory when a non-directory was expected.
    #[error("Directory entry {0:?} is a directory")]
    IsADirectory(Box<OsStr>),
    /// The entry exists but is not a regular file when a regular file was expected.
    #[error("Directory entry {0:?} is not a regular file")]
    IsNotRegular(Box<OsStr>),
    /// An entry with the same name is already present.
    #[error("Directory entry {0:?} already exists")]
    AlreadyExists(Box<OsStr>),
}

/// Checks that `name` can be stored as a single directory entry in an image.
pub fn validate_name(name: &OsStr) -> Result<(), TreeError> {
    let bytes = name.as_bytes();
    if bytes.is_empty()
        || bytes.len() > MAX_NAME_LEN
        || bytes.contains(&b'/')
        || bytes == b"."
        || bytes == b".."
    {
        return Err(TreeError::InvalidFilename(Box::from(name)));
    }
    Ok(())
}

impl<T> Inode<T> {
    /// Returns a reference to the metadata for this inode.
    pub fn stat(&self) -> &Stat {
        match self {
            Inode::Directory(dir) => &dir.stat,
            Inode::Leaf(leaf) => &leaf.stat,
        }
    }
}

impl<T> Directory<T> {
    /// Creates a new directory with the given metadata.
    pub fn new(stat: Stat) -> Self {
        Self {
            stat,
            entries: BTreeMap::new(),
        }
    }

    /// Iterates over all inodes in the current directory, in no particular order.
    pub fn inodes(&self) -> impl Iterator<Item = &Inode<T>> + use<'_, T> {
        self.entries.values()
    }

    /// Iterates over all entries in the current directory, in bytewise order of name.  The
    /// iterator returns pairs of `(&OsStr, &Inode)`.
    ///
    /// This is the order in which entries are serialized, so the same tree always produces the
    /// same listing.
    pub fn sorted_entries(&self) -> impl Iterator<Item = (&OsStr, &Inode<T>)> + use<'_, T> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// The number of entries directly in this directory.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Gets a reference to a subdirectory of this directory.
    ///
    /// The given path may be absolute or relative and it makes no difference.  It may not contain
    /// any "." or ".." components.  It may or may not end in "/" and it makes no difference.
    ///
    /// See `Directory::get_directory_mut()` for the mutable version of this function.
    pub fn get_directory(&self, pathname: &OsStr) -> Result<&Directory<T>, TreeError> {
        match self.get_directory_opt(pathname)? {
            Some(r) => Ok(r),
            None => Err(TreeError::NotFound(Box::from(pathname))),
        }
    }

    /// Like [`Self::get_directory()`] but maps [`TreeError::NotFound`] to [`Option`].
    pub fn get_directory_opt(&self, pathname: &OsStr) -> Result<Option<&Directory<T>>, TreeError> {
        let path = Path::new(pathname);
        let mut dir = self;

        for component in path.components() {
            dir = match component {
                Component::RootDir => dir,
                Component::Prefix(..) | Component::CurDir | Component::ParentDir => {
                    return Err(TreeError::InvalidFilename(pathname.into()));
                }
                Component::Normal(filename) => match dir.entries.get(filename) {
                    Some(Inode::Directory(subdir)) => subdir,
                    Some(_) => return Err(TreeError::NotADirectory(filename.into())),
                    None => return Ok(None),
                },
            }
        }

        Ok(Some(dir))
    }

    /// Gets a mutable reference to a subdirectory of this directory.
    ///
    /// This is the mutable version of `Directory::get_directory()`.
    pub fn get_directory_mut(&mut self, pathname: &OsStr) -> Result<&mut Directory<T>, TreeError> {
        let path = Path::new(pathname);
        let mut dir = self;

        for component in path.components() {
            dir = match component {
                Component::RootDir => dir,
                Component::Prefix(..) | Component::CurDir | Component::ParentDir => {
                    return Err(TreeError::InvalidFilename(pathname.into()));
                }
                Component::Normal(filename) => match dir.entries.get_mut(filename) {
                    Some(Inode::Directory(subdir)) => subdir,
                    Some(_) => return Err(TreeError::NotADirectory(filename.into())),
                    None => return Err(TreeError::NotFound(filename.into())),
                },
            };
        }

        Ok(dir)
    }

    /// Splits a pathname into a directory and the filename within that directory.  The directory
    /// must already exist.  The filename within the directory may or may not exist.
    ///
    /// This is the main entry point for most operations based on pathname.  The expectation is
    /// that the returned filename will be used to perform a more concrete operation on the
    /// returned directory.
    pub fn split<'d, 'n>(
        &'d self,
        pathname: &'n OsStr,
    ) -> Result<(&'d Directory<T>, &'n OsStr), TreeError> {
        let path = Path::new(pathname);

        let Some(filename) = path.file_name() else {
            return Err(TreeError::InvalidFilename(Box::from(pathname)));
        };

        let dir = match path.parent() {
            Some(parent) => self.get_directory(parent.as_os_str())?,
            None => self,
        };

        Ok((dir, filename))
    }

    /// Splits a pathname into a directory and the filename within that directory.  The directory
    /// must already exist.  The filename within the directory may or may not exist.
    ///
    /// This is the `_mut` version of `Directory::split()`.
    pub fn split_mut<'d, 'n>(
        &'d mut self,
        pathname: &'n OsStr,
    ) -> Result<(&'d mut Directory<T>, &'n OsStr), TreeError> {
        let path = Path::new(pathname);

        let Some(filename) = path.file_name() else {
            return Err(TreeError::InvalidFilename(Box::from(pathname)));
        };

        let dir = match path.parent() {
            Some(parent) => self.get_directory_mut(parent.as_os_str())?,
            None => self,
        };

        Ok((dir, filename))
    }

    /// Takes a reference to the "leaf" file (not directory) with the given filename directly
    /// contained in this directory.  This is usually done in preparation for creating a hardlink.
    pub fn ref_leaf(&self, filename: &OsStr) -> Result<Rc<Leaf<T>>, TreeError> {
        match self.entries.get(filename) {
            Some(Inode::Leaf(leaf)) => Ok(Rc::clone(leaf)),
            Some(Inode::Directory(..)) => Err(TreeError::IsADirectory(Box::from(filename))),
            None => Err(TreeError::NotFound(Box::from(filename))),
        }
    }

    /// The payload of the regular file `filename` directly inside this directory.
    pub fn get_file<'a>(&'a self, filename: &OsStr) -> Result<&'a T, TreeError> {
        match self.entries.get(filename) {
            Some(Inode::Leaf(leaf)) => match &leaf.content {
                LeafContent::Regular(file) => Ok(file),
                _ => Err(TreeError::IsNotRegular(filename.into())),
            },
            Some(Inode::Directory(..)) => Err(TreeError::IsADirectory(filename.into())),
            None => Err(TreeError::NotFound(filename.into())),
        }
    }

    /// Inserts the given inode into the directory with special handling for directories.  In case
    /// the inode is a directory and there is already a subdirectory with the given filename, the
    /// `stat` field will be updated with the value from the provided `inode` and the entries of
    /// both directories are merged recursively.
    ///
    /// In all other cases, this function is equivalent to `Directory::insert()`.
    pub fn merge(&mut self, filename: &OsStr, inode: Inode<T>) {
        if let Inode::Directory(new_dir) = inode {
            if let Some(Inode::Directory(old_dir)) = self.entries.get_mut(filename) {
                let Directory { stat, entries } = *new_dir;
                old_dir.stat = stat;
                for (name, child) in entries {
                    old_dir.merge(&name, child);
                }
            } else {
                self.insert(filename, Inode::Directory(new_dir));
            }
        } else {
            self.insert(filename, inode);
        }
    }

    /// Inserts the given inode into the directory.
    ///
    /// If the `filename` existed previously, the content is completely overwritten, including the
    /// case that it was a directory.
    pub fn insert(&mut self, filename: &OsStr, inode: Inode<T>) {
        self.entries.insert(Box::from(filename), inode);
    }

    /// Inserts the given inode, failing if the name is not a valid entry name or is already taken.
    pub fn insert_new(&mut self, filename: &OsStr, inode: Inode<T>) -> Result<(), TreeError> {
        validate_name(filename)?;
        if self.entries.contains_key(filename) {
            return Err(TreeError::AlreadyExists(Box::from(filename)));
        }
        self.insert(filename, inode);
        Ok(())
    }

    /// Does a directory lookup on the given filename, returning the Inode if it exists.
    pub fn lookup(&self, filename: &OsStr) -> Option<&Inode<T>> {
        self.entries.get(filename)
    }

    /// Recursively finds the newest modification time in this directory tree.
    ///
    /// Returns the maximum modification time among this directory's metadata
    /// and all files and subdirectories it contains.
    pub fn newest_file(&self) -> i64 {
        let mut newest = self.stat.st_mtim_sec;
        for inode in self.entries.values() {
            let mtime = match inode {
                Inode::Leaf(ref leaf) => leaf.stat.st_mtim_sec,
                Inode::Directory(ref dir) => dir.newest_file(),
            };
            if mtime > newest {
                newest = mtime;
            }
        }
        newest
    }
}

/// A complete filesystem tree with a root directory.
#[derive(Debug, Clone)]
pub struct FileSystem<T> {
    /// The root directory of the filesystem.
    pub root: Directory<T>,
}

impl<T> FileSystem<T> {
    /// Creates a new filesystem with a root directory having the given metadata.
    pub fn new(root_stat: Stat) -> Self {
        Self {
            root: Directory::new(root_stat),
        }
    }

    /// Sets the metadata for the root directory.
    pub fn set_root_stat(&mut self, stat: Stat) {
        self.root.stat = stat;
    }

    /// Grafts another tree below `pathname`.
    ///
    /// The root of `other` takes the place of the directory at `pathname` (which is created if
    /// it doesn't exist yet).  Directories present in both trees are merged, everything else
    /// from `other` replaces what was there.  Grafting onto "/" merges into the root itself.
    pub fn graft(&mut self, pathname: &OsStr, other: FileSystem<T>) -> Result<(), TreeError> {
        let Directory { stat, entries } = other.root;

        let target = if Path::new(pathname).file_name().is_none() {
            // "/" or ""
            self.root.get_directory_mut(pathname)?
        } else {
            let (parent, name) = self.root.split_mut(pathname)?;
            validate_name(name)?;
            parent.merge(name, Inode::Directory(Box::new(Directory::new(stat.clone()))));
            parent.get_directory_mut(name)?
        };

        target.stat = stat;
        for (name, inode) in entries {
            target.merge(&name, inode);
        }
        Ok(())
    }
}
