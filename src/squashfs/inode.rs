//! Inode record encoding and decoding.
//!
//! Every node gets the compact record shape unless one of its fields doesn't fit, in which case
//! the extended shape is used.  The decoder accepts both and checks every variable-length part
//! against sane bounds before reading it.

use zerocopy::IntoBytes;

use super::{
    format::{
        DeviceInode, DirectoryIndex, DirectoryInode, ExtDeviceInode, ExtDirectoryInode,
        ExtFileInode, ExtIpcInode, FileInode, FormatError, InodeHeader, InodeType, IpcInode,
        SymlinkInode, DIR_SIZE_BIAS, MAX_NAME_LEN, NO_FRAGMENT, NO_XATTRS,
    },
    meta::{MetaCursor, MetaRef},
    reader::ReaderError,
};
use crate::data::{FileLayout, FragmentRef};

/// The longest symlink target accepted when reading.
pub const MAX_SYMLINK_LEN: u32 = 4096;

/// The fields shared by every inode record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeInfo {
    pub permissions: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
    pub inode_number: u32,
    pub xattr: Option<u32>,
}

/// The type-specific part of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodePayload<L> {
    Directory {
        listing: MetaRef,
        listing_len: u32,
        link_count: u32,
        parent_inode: u32,
    },
    File {
        layout: L,
        link_count: u32,
    },
    Symlink {
        target: Box<[u8]>,
        link_count: u32,
    },
    BlockDevice {
        device: u32,
        link_count: u32,
    },
    CharacterDevice {
        device: u32,
        link_count: u32,
    },
    Fifo {
        link_count: u32,
    },
    Socket {
        link_count: u32,
    },
}

/// An encoded record, ready for the inode table.
#[derive(Debug)]
pub struct InodeRecord {
    pub inode_type: InodeType,
    pub bytes: Vec<u8>,
}

fn xattr_index(xattr: Option<u32>) -> u32 {
    xattr.unwrap_or(NO_XATTRS)
}

fn fragment_fields(layout: &FileLayout) -> (u32, u32) {
    match layout.fragment {
        Some(f) => (f.index, f.offset),
        None => (NO_FRAGMENT, 0),
    }
}

fn header(info: &InodeInfo, inode_type: InodeType) -> InodeHeader {
    InodeHeader {
        inode_type: inode_type.into(),
        permissions: info.permissions.into(),
        uid_idx: info.uid_idx.into(),
        gid_idx: info.gid_idx.into(),
        mtime: info.mtime.into(),
        inode_number: info.inode_number.into(),
    }
}

/// Encodes one inode, choosing the smallest shape that can hold it.
pub fn encode(
    info: &InodeInfo,
    payload: &InodePayload<&FileLayout>,
) -> Result<InodeRecord, FormatError> {
    let has_xattrs = info.xattr.is_some();
    let mut bytes = vec![];

    let inode_type = match payload {
        InodePayload::Directory {
            listing,
            listing_len,
            link_count,
            parent_inode,
        } => {
            let block_index =
                u32::try_from(listing.block).map_err(|_| FormatError::Overflow("directory table"))?;
            let file_size = listing_len + DIR_SIZE_BIAS;
            if has_xattrs || file_size > u16::MAX as u32 {
                bytes.extend_from_slice(header(info, InodeType::ExtDirectory).as_bytes());
                let inode = ExtDirectoryInode {
                    link_count: (*link_count).into(),
                    file_size: file_size.into(),
                    block_index: block_index.into(),
                    parent_inode: (*parent_inode).into(),
                    index_count: 0.into(),
                    block_offset: listing.offset.into(),
                    xattr_idx: xattr_index(info.xattr).into(),
                };
                bytes.extend_from_slice(inode.as_bytes());
                InodeType::ExtDirectory
            } else {
                bytes.extend_from_slice(header(info, InodeType::Directory).as_bytes());
                let inode = DirectoryInode {
                    block_index: block_index.into(),
                    link_count: (*link_count).into(),
                    file_size: (file_size as u16).into(),
                    block_offset: listing.offset.into(),
                    parent_inode: (*parent_inode).into(),
                };
                bytes.extend_from_slice(inode.as_bytes());
                InodeType::Directory
            }
        }
        InodePayload::File { layout, link_count } => {
            let (fragment_index, fragment_offset) = fragment_fields(layout);
            let compact = (
                u32::try_from(layout.blocks_start),
                u32::try_from(layout.size),
            );
            let inode_type = match compact {
                (Ok(blocks_start), Ok(file_size))
                    if !has_xattrs && *link_count <= 1 && layout.sparse == 0 =>
                {
                    bytes.extend_from_slice(header(info, InodeType::RegularFile).as_bytes());
                    let inode = FileInode {
                        blocks_start: blocks_start.into(),
                        fragment_index: fragment_index.into(),
                        fragment_offset: fragment_offset.into(),
                        file_size: file_size.into(),
                    };
                    bytes.extend_from_slice(inode.as_bytes());
                    InodeType::RegularFile
                }
                _ => {
                    bytes.extend_from_slice(header(info, InodeType::ExtRegularFile).as_bytes());
                    let inode = ExtFileInode {
                        blocks_start: layout.blocks_start.into(),
                        file_size: layout.size.into(),
                        sparse: layout.sparse.into(),
                        link_count: (*link_count).into(),
                        fragment_index: fragment_index.into(),
                        fragment_offset: fragment_offset.into(),
                        xattr_idx: xattr_index(info.xattr).into(),
                    };
                    bytes.extend_from_slice(inode.as_bytes());
                    InodeType::ExtRegularFile
                }
            };
            for size in &layout.block_sizes {
                bytes.extend_from_slice(&size.to_le_bytes());
            }
            inode_type
        }
        InodePayload::Symlink { target, link_count } => {
            let inode_type = match has_xattrs {
                true => InodeType::ExtSymlink,
                false => InodeType::Symlink,
            };
            let target_size =
                u32::try_from(target.len()).map_err(|_| FormatError::Overflow("symlink target"))?;
            bytes.extend_from_slice(header(info, inode_type).as_bytes());
            let inode = SymlinkInode {
                link_count: (*link_count).into(),
                target_size: target_size.into(),
            };
            bytes.extend_from_slice(inode.as_bytes());
            bytes.extend_from_slice(target);
            if has_xattrs {
                bytes.extend_from_slice(&xattr_index(info.xattr).to_le_bytes());
            }
            inode_type
        }
        InodePayload::BlockDevice { device, link_count }
        | InodePayload::CharacterDevice { device, link_count } => {
            let basic = match payload {
                InodePayload::BlockDevice { .. } => InodeType::BlockDevice,
                _ => InodeType::CharacterDevice,
            };
            if has_xattrs {
                bytes.extend_from_slice(header(info, basic.extended()).as_bytes());
                let inode = ExtDeviceInode {
                    link_count: (*link_count).into(),
                    device: (*device).into(),
                    xattr_idx: xattr_index(info.xattr).into(),
                };
                bytes.extend_from_slice(inode.as_bytes());
                basic.extended()
            } else {
                bytes.extend_from_slice(header(info, basic).as_bytes());
                let inode = DeviceInode {
                    link_count: (*link_count).into(),
                    device: (*device).into(),
                };
                bytes.extend_from_slice(inode.as_bytes());
                basic
            }
        }
        InodePayload::Fifo { link_count } | InodePayload::Socket { link_count } => {
            let basic = match payload {
                InodePayload::Fifo { .. } => InodeType::Fifo,
                _ => InodeType::Socket,
            };
            if has_xattrs {
                bytes.extend_from_slice(header(info, basic.extended()).as_bytes());
                let inode = ExtIpcInode {
                    link_count: (*link_count).into(),
                    xattr_idx: xattr_index(info.xattr).into(),
                };
                bytes.extend_from_slice(inode.as_bytes());
                basic.extended()
            } else {
                bytes.extend_from_slice(header(info, basic).as_bytes());
                let inode = IpcInode {
                    link_count: (*link_count).into(),
                };
                bytes.extend_from_slice(inode.as_bytes());
                basic
            }
        }
    };

    Ok(InodeRecord { inode_type, bytes })
}

/// A decoded inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInode {
    pub inode_type: InodeType,
    pub info: InodeInfo,
    pub payload: InodePayload<FileLayout>,
}

/// Limits that depend on the image being read.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub block_size: u32,
    /// Length of the whole image; no file can have more block size words than this allows.
    pub image_len: u64,
}

fn decode_xattr(raw: u32) -> Option<u32> {
    (raw != NO_XATTRS).then_some(raw)
}

fn decode_file(
    cursor: &mut MetaCursor,
    limits: &DecodeLimits,
    blocks_start: u64,
    size: u64,
    sparse: u64,
    fragment_index: u32,
    fragment_offset: u32,
) -> Result<FileLayout, ReaderError> {
    let block_size = limits.block_size as u64;
    let tail = size % block_size;
    let fragment = match fragment_index {
        NO_FRAGMENT => None,
        _ if tail == 0 => {
            return Err(ReaderError::corrupt(
                cursor.table(),
                format!("file of {size} bytes has a fragment but no tail"),
            ))
        }
        index => Some(FragmentRef {
            index,
            offset: fragment_offset,
            len: tail as u32,
        }),
    };

    let count = FileLayout::block_count(size, limits.block_size, fragment.is_some());
    if count > limits.image_len / 4 {
        return Err(ReaderError::corrupt(
            cursor.table(),
            format!("file of {size} bytes needs {count} block sizes"),
        ));
    }
    let raw = cursor.read_vec(count as usize * 4)?;
    let block_sizes = raw
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();

    Ok(FileLayout {
        blocks_start,
        block_sizes,
        fragment,
        size,
        sparse,
    })
}

/// Decodes the record at the cursor.
pub fn decode(cursor: &mut MetaCursor, limits: &DecodeLimits) -> Result<DecodedInode, ReaderError> {
    let header: InodeHeader = cursor.read()?;
    let inode_type = InodeType::try_from(header.inode_type.get())
        .map_err(|e| ReaderError::corrupt(cursor.table(), e.to_string()))?;
    let mut info = InodeInfo {
        permissions: header.permissions.get(),
        uid_idx: header.uid_idx.get(),
        gid_idx: header.gid_idx.get(),
        mtime: header.mtime.get(),
        inode_number: header.inode_number.get(),
        xattr: None,
    };

    let payload = match inode_type {
        InodeType::Directory => {
            let inode: DirectoryInode = cursor.read()?;
            directory_payload(
                cursor,
                inode.block_index.get(),
                inode.block_offset.get(),
                inode.file_size.get() as u32,
                inode.link_count.get(),
                inode.parent_inode.get(),
            )?
        }
        InodeType::ExtDirectory => {
            let inode: ExtDirectoryInode = cursor.read()?;
            info.xattr = decode_xattr(inode.xattr_idx.get());
            for _ in 0..inode.index_count.get() {
                let index: DirectoryIndex = cursor.read()?;
                let name_len = index.name_size.get() as usize + 1;
                if name_len > MAX_NAME_LEN {
                    return Err(ReaderError::corrupt(
                        cursor.table(),
                        format!("directory index name of {name_len} bytes"),
                    ));
                }
                cursor.read_vec(name_len)?;
            }
            directory_payload(
                cursor,
                inode.block_index.get(),
                inode.block_offset.get(),
                inode.file_size.get(),
                inode.link_count.get(),
                inode.parent_inode.get(),
            )?
        }
        InodeType::RegularFile => {
            let inode: FileInode = cursor.read()?;
            let layout = decode_file(
                cursor,
                limits,
                inode.blocks_start.get() as u64,
                inode.file_size.get() as u64,
                0,
                inode.fragment_index.get(),
                inode.fragment_offset.get(),
            )?;
            InodePayload::File {
                layout,
                link_count: 1,
            }
        }
        InodeType::ExtRegularFile => {
            let inode: ExtFileInode = cursor.read()?;
            info.xattr = decode_xattr(inode.xattr_idx.get());
            let layout = decode_file(
                cursor,
                limits,
                inode.blocks_start.get(),
                inode.file_size.get(),
                inode.sparse.get(),
                inode.fragment_index.get(),
                inode.fragment_offset.get(),
            )?;
            InodePayload::File {
                layout,
                link_count: inode.link_count.get(),
            }
        }
        InodeType::Symlink | InodeType::ExtSymlink => {
            let inode: SymlinkInode = cursor.read()?;
            let len = inode.target_size.get();
            if len == 0 || len > MAX_SYMLINK_LEN {
                return Err(ReaderError::corrupt(
                    cursor.table(),
                    format!("symlink target of {len} bytes"),
                ));
            }
            let target = cursor.read_vec(len as usize)?.into_boxed_slice();
            if inode_type.is_extended() {
                let raw: zerocopy::little_endian::U32 = cursor.read()?;
                info.xattr = decode_xattr(raw.get());
            }
            InodePayload::Symlink {
                target,
                link_count: inode.link_count.get(),
            }
        }
        InodeType::BlockDevice | InodeType::CharacterDevice => {
            let inode: DeviceInode = cursor.read()?;
            device_payload(inode_type, inode.device.get(), inode.link_count.get())
        }
        InodeType::ExtBlockDevice | InodeType::ExtCharacterDevice => {
            let inode: ExtDeviceInode = cursor.read()?;
            info.xattr = decode_xattr(inode.xattr_idx.get());
            device_payload(inode_type, inode.device.get(), inode.link_count.get())
        }
        InodeType::Fifo | InodeType::Socket => {
            let inode: IpcInode = cursor.read()?;
            ipc_payload(inode_type, inode.link_count.get())
        }
        InodeType::ExtFifo | InodeType::ExtSocket => {
            let inode: ExtIpcInode = cursor.read()?;
            info.xattr = decode_xattr(inode.xattr_idx.get());
            ipc_payload(inode_type, inode.link_count.get())
        }
    };

    Ok(DecodedInode {
        inode_type,
        info,
        payload,
    })
}

fn directory_payload(
    cursor: &MetaCursor,
    block: u32,
    offset: u16,
    file_size: u32,
    link_count: u32,
    parent_inode: u32,
) -> Result<InodePayload<FileLayout>, ReaderError> {
    let listing_len = file_size.checked_sub(DIR_SIZE_BIAS).ok_or_else(|| {
        ReaderError::corrupt(cursor.table(), format!("directory size {file_size}"))
    })?;
    Ok(InodePayload::Directory {
        listing: MetaRef::new(block as u64, offset),
        listing_len,
        link_count,
        parent_inode,
    })
}

fn device_payload(inode_type: InodeType, device: u32, link_count: u32) -> InodePayload<FileLayout> {
    match inode_type.basic() {
        InodeType::BlockDevice => InodePayload::BlockDevice { device, link_count },
        _ => InodePayload::CharacterDevice { device, link_count },
    }
}

fn ipc_payload(inode_type: InodeType, link_count: u32) -> InodePayload<FileLayout> {
    match inode_type.basic() {
        InodeType::Fifo => InodePayload::Fifo { link_count },
        _ => InodePayload::Socket { link_count },
    }
}
