//! Building and reading SquashFS 4.0 images.
//!
//! A tree is gathered from a [`source::DirectorySource`] by [`builder::build()`], written with
//! [`squashfs::writer::write_image()`] and read back with [`squashfs::reader::Image`].

pub mod builder;
pub mod compress;
pub mod data;
pub mod generic_tree;
pub mod hooks;
pub mod listing;
pub mod sortfile;
pub mod source;
pub mod squashfs;
pub mod stream;
pub mod tree;
pub mod unpack;
pub mod util;
