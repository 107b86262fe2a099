//! A filesystem tree ready to be packed into an image: regular files are
//! represented by where their content can be read from.

use std::{io, path::PathBuf};

use crate::stream::{BufferedStream, ByteStream, MemoryStream, DEFAULT_BUFFER_SIZE};

pub use crate::generic_tree::{self, Stat, TreeError};

/// Where a regular file's content comes from when building an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// A file on the host, read when the data is packed.
    Host(PathBuf),
    /// Content held in memory.
    Bytes(Box<[u8]>),
}

impl FileSource {
    /// Opens the content as a [`ByteStream`].
    ///
    /// `min_buffer` is the largest single request the consumer will make (the block size).
    pub fn open(&self, min_buffer: usize) -> io::Result<Box<dyn ByteStream + '_>> {
        Ok(match self {
            FileSource::Host(path) => Box::new(BufferedStream::open(
                path,
                min_buffer.max(DEFAULT_BUFFER_SIZE),
            )?),
            FileSource::Bytes(data) => Box::new(MemoryStream::new(data, "<memory>")),
        })
    }
}

impl From<Vec<u8>> for FileSource {
    fn from(data: Vec<u8>) -> Self {
        FileSource::Bytes(data.into_boxed_slice())
    }
}

impl From<&[u8]> for FileSource {
    fn from(data: &[u8]) -> Self {
        FileSource::Bytes(Box::from(data))
    }
}

/// Content of a leaf node in a tree being built.
pub type LeafContent = generic_tree::LeafContent<FileSource>;

/// A leaf node (file, symlink, device, fifo or socket) in a tree being built.
pub type Leaf = generic_tree::Leaf<FileSource>;

/// A directory in a tree being built.
pub type Directory = generic_tree::Directory<FileSource>;

/// An inode representing either a directory or a leaf node in a tree being built.
pub type Inode = generic_tree::Inode<FileSource>;

/// A complete tree, ready for [`crate::squashfs::writer::write_image()`].
pub type FileSystem = generic_tree::FileSystem<FileSource>;
