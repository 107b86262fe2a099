//! SquashFS 4.0 images: the on-disk format, the writer and the reader.

pub mod directory;
pub mod format;
pub mod inode;
pub mod meta;
pub mod reader;
pub mod tables;
pub mod writer;
