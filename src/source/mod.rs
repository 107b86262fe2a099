//! Directory sources: where the entries of a tree being built come from.
//!
//! A [`DirectorySource`] yields [`DirEntry`]s one at a time, parents before their children.
//! Two sources exist: [`dir::DirSource`] walks a live directory and
//! [`description::DescriptionSource`] replays a textual description.

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{generic_tree::Stat, tree::FileSource};

pub mod description;
pub mod dir;

pub use description::{DescriptionError, DescriptionSource};
pub use dir::{DirSource, DirSourceOptions};

/// The type of a [`DirEntry`], with the type-specific payload that is cheap to get.
///
/// Symlink targets are fetched separately with [`DirectorySource::read_link()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEntryKind {
    Directory,
    Regular,
    Symlink,
    BlockDevice(u64),
    CharacterDevice(u64),
    Fifo,
    Socket,
    /// Another name for the non-directory at the given path, relative to the source root.
    Hardlink(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Relative to the source root.  Empty for the root itself.
    pub path: PathBuf,
    pub kind: DirEntryKind,
    pub stat: Stat,
    /// Size of a regular file's content, zero for everything else.
    pub size: u64,
}

impl DirEntry {
    /// The path as it appears in the image, `/a/b`.
    pub fn image_path(&self) -> PathBuf {
        Path::new("/").join(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == DirEntryKind::Directory
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} is not a symlink")]
    NotASymlink(PathBuf),
    #[error("{path:?} has unsupported file type {mode:#o}")]
    UnsupportedType { path: PathBuf, mode: u32 },
    #[error("Invalid description")]
    Description(#[from] DescriptionError),
}

impl SourceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: impl Into<io::Error>) -> Self {
        Self::Io {
            path: path.into(),
            source: source.into(),
        }
    }

    /// The path the error is about, if there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Io { path, .. } | Self::NotASymlink(path) | Self::UnsupportedType { path, .. } => {
                Some(path)
            }
            Self::Description(_) => None,
        }
    }
}

/// A lazily enumerated tree of entries.
pub trait DirectorySource {
    /// Returns the next entry, or `None` once the tree is exhausted.  The root comes first.
    fn next_entry(&mut self) -> Result<Option<DirEntry>, SourceError>;

    /// Returns the target of the symlink most recently returned by [`Self::next_entry()`].
    fn read_link(&mut self) -> Result<Box<OsStr>, SourceError>;

    /// Describes where the content of the regular file at `path` (relative to the source
    /// root) can be read from.
    fn open_file(&self, path: &Path) -> Result<FileSource, SourceError>;
}
