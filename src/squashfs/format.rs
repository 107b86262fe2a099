//! SquashFS 4.0 on-disk format definitions.
//!
//! This module defines the binary layout of the superblock, inode records,
//! directory listings and lookup table entries.  Everything is little-endian
//! and unaligned, so all structures are built from zerocopy's LE integer
//! types and can be read from (or written to) arbitrary byte offsets.

// Enum-like fields are stored as plain integers and converted separately; we avoid TryFromBytes so
// that a corrupt image produces a typed error from the reader rather than a failed transmute.

use std::fmt;

use thiserror::Error;
use zerocopy::{
    little_endian::{I16, U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

pub const MAGIC: U32 = U32::new(0x73717368);
pub const VERSION_MAJOR: u16 = 4;
pub const VERSION_MINOR: u16 = 0;

pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// The image is padded to a multiple of this after `bytes_used`.
pub const DEVBLK_SIZE: u64 = 4096;

/* Metadata blocks */

pub const META_BLOCK_SIZE: usize = 8192;
pub const META_UNCOMPRESSED: u16 = 0x8000;
pub const META_SIZE_MASK: u16 = 0x7fff;

/* Data blocks */

pub const DATA_UNCOMPRESSED: u32 = 1 << 24;
pub const DATA_SIZE_MASK: u32 = DATA_UNCOMPRESSED - 1;

pub const NO_FRAGMENT: u32 = 0xffff_ffff;
pub const NO_XATTRS: u32 = 0xffff_ffff;
pub const TABLE_ABSENT: u64 = u64::MAX;

/* Superblock flags */

pub const FLAG_UNCOMPRESSED_INODES: u16 = 0x0001;
pub const FLAG_UNCOMPRESSED_DATA: u16 = 0x0002;
pub const FLAG_UNCOMPRESSED_FRAGMENTS: u16 = 0x0008;
pub const FLAG_NO_FRAGMENTS: u16 = 0x0010;
pub const FLAG_ALWAYS_FRAGMENTS: u16 = 0x0020;
pub const FLAG_DUPLICATES: u16 = 0x0040;
pub const FLAG_EXPORTABLE: u16 = 0x0080;
pub const FLAG_UNCOMPRESSED_XATTRS: u16 = 0x0100;
pub const FLAG_NO_XATTRS: u16 = 0x0200;
pub const FLAG_COMPRESSOR_OPTIONS: u16 = 0x0400;
pub const FLAG_UNCOMPRESSED_IDS: u16 = 0x0800;

/* Directory listings */

pub const MAX_NAME_LEN: usize = 256;
pub const DIR_MAX_RUN: usize = 256;
/// A directory inode's `file_size` is the listing length plus this.
pub const DIR_SIZE_BIAS: u32 = 3;

/* Extended attributes */

pub const XATTR_VALUE_OOL: u16 = 0x0100;
pub const XATTR_TYPE_MASK: u16 = 0x00ff;
pub const XATTR_PREFIXES: [&[u8]; 3] = [b"user.", b"trusted.", b"security."];

/// Splits an xattr key into its prefix index and the remaining suffix.
///
/// Returns `None` for namespaces that can't be represented in the image.
pub fn xattr_prefix(key: &[u8]) -> Option<(u16, &[u8])> {
    XATTR_PREFIXES
        .iter()
        .enumerate()
        .find_map(|(index, prefix)| key.strip_prefix(*prefix).map(|rest| (index as u16, rest)))
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("Invalid inode type {0}")]
    InvalidInodeType(u16),
    #[error("{0} does not fit its on-disk field")]
    Overflow(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum InodeType {
    Directory = 1,
    RegularFile = 2,
    Symlink = 3,
    BlockDevice = 4,
    CharacterDevice = 5,
    Fifo = 6,
    Socket = 7,
    ExtDirectory = 8,
    ExtRegularFile = 9,
    ExtSymlink = 10,
    ExtBlockDevice = 11,
    ExtCharacterDevice = 12,
    ExtFifo = 13,
    ExtSocket = 14,
}

impl InodeType {
    const EXTENDED_OFFSET: u16 = 7;

    pub fn is_extended(self) -> bool {
        self as u16 > Self::EXTENDED_OFFSET
    }

    /// The basic (compact) variant of this type, as used in directory listings.
    pub fn basic(self) -> Self {
        if self.is_extended() {
            // the basic values are contiguous, so this can't fail
            Self::try_from(self as u16 - Self::EXTENDED_OFFSET).unwrap_or(self)
        } else {
            self
        }
    }

    pub fn extended(self) -> Self {
        if self.is_extended() {
            self
        } else {
            Self::try_from(self as u16 + Self::EXTENDED_OFFSET).unwrap_or(self)
        }
    }

    pub fn is_dir(self) -> bool {
        self.basic() == Self::Directory
    }
}

impl TryFrom<u16> for InodeType {
    type Error = FormatError;

    fn try_from(value: u16) -> Result<Self, FormatError> {
        Ok(match value {
            1 => Self::Directory,
            2 => Self::RegularFile,
            3 => Self::Symlink,
            4 => Self::BlockDevice,
            5 => Self::CharacterDevice,
            6 => Self::Fifo,
            7 => Self::Socket,
            8 => Self::ExtDirectory,
            9 => Self::ExtRegularFile,
            10 => Self::ExtSymlink,
            11 => Self::ExtBlockDevice,
            12 => Self::ExtCharacterDevice,
            13 => Self::ExtFifo,
            14 => Self::ExtSocket,
            other => return Err(FormatError::InvalidInodeType(other)),
        })
    }
}

impl From<InodeType> for U16 {
    fn from(value: InodeType) -> Self {
        U16::new(value as u16)
    }
}

/// Packs a Linux device number into the 32-bit on-disk encoding.
pub fn encode_device(major: u32, minor: u32) -> u32 {
    (minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)
}

/// Inverse of [`encode_device()`], returning `(major, minor)`.
pub fn decode_device(device: u32) -> (u32, u32) {
    let major = (device >> 8) & 0xfff;
    let minor = (device & 0xff) | ((device >> 12) & 0xfff00);
    (major, minor)
}

/* Superblock */

#[derive(Clone, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Superblock {
    // vertical whitespace every 16 bytes (hexdump-friendly)
    pub magic: U32,
    pub inode_count: U32,
    pub modification_time: U32,
    pub block_size: U32,

    pub fragment_entry_count: U32,
    pub compression_id: U16,
    pub block_log: U16,
    pub flags: U16,
    pub id_count: U16,
    pub version_major: U16,
    pub version_minor: U16,

    pub root_inode_ref: U64,
    pub bytes_used: U64,

    pub id_table_start: U64,
    pub xattr_id_table_start: U64,

    pub inode_table_start: U64,
    pub directory_table_start: U64,

    pub fragment_table_start: U64,
    pub export_table_start: U64,
}

impl Superblock {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags.get() & flag != 0
    }
}

impl fmt::Debug for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Superblock")
            .field("magic", &format_args!("{:#x}", self.magic.get()))
            .field("inode_count", &self.inode_count.get())
            .field("modification_time", &self.modification_time.get())
            .field("block_size", &self.block_size.get())
            .field("fragment_entry_count", &self.fragment_entry_count.get())
            .field("compression_id", &self.compression_id.get())
            .field("flags", &format_args!("{:#06x}", self.flags.get()))
            .field("id_count", &self.id_count.get())
            .field("bytes_used", &self.bytes_used.get())
            .finish_non_exhaustive()
    }
}

/* Inodes */

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct InodeHeader {
    pub inode_type: U16,
    pub permissions: U16,
    pub uid_idx: U16,
    pub gid_idx: U16,
    pub mtime: U32,
    pub inode_number: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryInode {
    pub block_index: U32,
    pub link_count: U32,
    pub file_size: U16,
    pub block_offset: U16,
    pub parent_inode: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtDirectoryInode {
    pub link_count: U32,
    pub file_size: U32,
    pub block_index: U32,
    pub parent_inode: U32,
    pub index_count: U16,
    pub block_offset: U16,
    pub xattr_idx: U32,
}

/// Followed by `name_size + 1` bytes of name.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryIndex {
    pub index: U32,
    pub start: U32,
    pub name_size: U32,
}

/// Followed by one u32 size word per block.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FileInode {
    pub blocks_start: U32,
    pub fragment_index: U32,
    pub fragment_offset: U32,
    pub file_size: U32,
}

/// Followed by one u32 size word per block.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtFileInode {
    pub blocks_start: U64,
    pub file_size: U64,
    pub sparse: U64,
    pub link_count: U32,
    pub fragment_index: U32,
    pub fragment_offset: U32,
    pub xattr_idx: U32,
}

/// Followed by the target and, for the extended variant, a u32 xattr index.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SymlinkInode {
    pub link_count: U32,
    pub target_size: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DeviceInode {
    pub link_count: U32,
    pub device: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtDeviceInode {
    pub link_count: U32,
    pub device: U32,
    pub xattr_idx: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct IpcInode {
    pub link_count: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ExtIpcInode {
    pub link_count: U32,
    pub xattr_idx: U32,
}

/* Directories */

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryHeader {
    pub count: U32,
    pub start: U32,
    pub inode_number: U32,
}

/// Followed by `name_size + 1` bytes of name.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryEntry {
    pub offset: U16,
    pub inode_offset: I16,
    pub inode_type: U16,
    pub name_size: U16,
}

/* Lookup tables */

#[derive(Debug, Default, Clone, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FragmentEntry {
    pub start: U64,
    pub size: U32,
    pub unused: U32,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrKey {
    pub kind: U16,
    pub name_size: U16,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrValue {
    pub size: U32,
}

#[derive(Debug, Default, Clone, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrId {
    pub xattr_ref: U64,
    pub count: U32,
    pub size: U32,
}

/// Followed by u64 offsets of the metadata blocks holding the [`XattrId`] entries.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct XattrIdTable {
    pub kv_start: U64,
    pub count: U32,
    pub unused: U32,
}

/* Compressor options */

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct GzipOptions {
    pub level: U32,
    pub window_size: U16,
    pub strategies: U16,
}

#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ZstdOptions {
    pub level: U32,
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<Superblock>(), 96);
        assert_eq!(size_of::<InodeHeader>(), 16);
        assert_eq!(size_of::<DirectoryInode>(), 16);
        assert_eq!(size_of::<ExtDirectoryInode>(), 24);
        assert_eq!(size_of::<FileInode>(), 16);
        assert_eq!(size_of::<ExtFileInode>(), 40);
        assert_eq!(size_of::<DirectoryHeader>(), 12);
        assert_eq!(size_of::<DirectoryEntry>(), 8);
        assert_eq!(size_of::<FragmentEntry>(), 16);
        assert_eq!(size_of::<XattrId>(), 16);
        assert_eq!(size_of::<XattrIdTable>(), 16);
    }

    #[test]
    fn inode_type_variants() {
        assert_eq!(InodeType::ExtRegularFile.basic(), InodeType::RegularFile);
        assert_eq!(InodeType::Socket.extended(), InodeType::ExtSocket);
        assert!(InodeType::ExtDirectory.is_dir());
        assert!(!InodeType::Symlink.is_extended());
        assert_eq!(
            InodeType::try_from(15u16),
            Err(FormatError::InvalidInodeType(15))
        );
    }

    #[test]
    fn device_numbers() {
        for (major, minor) in [(0, 0), (1, 3), (8, 17), (259, 0x12345), (4095, 0xfffff)] {
            assert_eq!(decode_device(encode_device(major, minor)), (major, minor));
        }
        assert_eq!(encode_device(1, 3), 0x103);
    }

    #[test]
    fn xattr_prefixes() {
        assert_eq!(xattr_prefix(b"user.foo"), Some((0, &b"foo"[..])));
        assert_eq!(xattr_prefix(b"security.selinux"), Some((2, &b"selinux"[..])));
        assert_eq!(xattr_prefix(b"system.posix_acl_access"), None);
    }
}
