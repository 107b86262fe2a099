//! The image reader.
//!
//! [`Image::open()`] validates the superblock and loads the small lookup tables eagerly; inodes
//! and directory listings are decoded on demand.  Every offset and length taken from the image
//! is checked against the image bounds before it is used.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    ffi::OsStr,
    fmt,
    io::{self, Read},
    os::unix::ffi::OsStrExt,
    rc::Rc,
};

use log::{debug, trace};
use thiserror::Error;
use zerocopy::{little_endian::U64, FromBytes};

use super::{
    directory::{decode_listing, ListingEntry},
    format::{
        decode_device, FragmentEntry, InodeType, Superblock, XattrId, XattrIdTable,
        XattrKey, XattrValue, DATA_SIZE_MASK, DATA_UNCOMPRESSED, FLAG_ALWAYS_FRAGMENTS,
        FLAG_COMPRESSOR_OPTIONS, FLAG_DUPLICATES, FLAG_EXPORTABLE, FLAG_NO_FRAGMENTS,
        FLAG_NO_XATTRS, FLAG_UNCOMPRESSED_DATA, FLAG_UNCOMPRESSED_FRAGMENTS,
        FLAG_UNCOMPRESSED_IDS, FLAG_UNCOMPRESSED_INODES, FLAG_UNCOMPRESSED_XATTRS, MAGIC,
        MAX_BLOCK_SIZE, META_BLOCK_SIZE, MIN_BLOCK_SIZE, TABLE_ABSENT, VERSION_MAJOR,
        VERSION_MINOR, XATTR_PREFIXES, XATTR_TYPE_MASK, XATTR_VALUE_OOL,
    },
    inode::{decode, DecodeLimits, DecodedInode, InodePayload},
    meta::{parse_header, MetaRef, MetaTable},
    tables::XattrSet,
};
use crate::{
    compress::{CompressError, Compressor, CompressorId, CompressorRegistry},
    data::FileLayout,
    generic_tree::{self, Stat, TreeError},
};

/// Directories nested deeper than this are treated as corruption.
pub const MAX_DEPTH: usize = 1024;

/// The largest xattr value accepted when reading.
const MAX_XATTR_VALUE: u32 = 64 * 1024;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("Bad magic {0:#x}, not a SquashFS image")]
    BadMagic(u32),
    #[error("Unsupported SquashFS version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("Invalid block size {size} (log {log})")]
    InvalidBlockSize { size: u32, log: u16 },
    #[error("{table}: {len} bytes at {offset:#x} are outside the {size} bytes available")]
    OutOfBounds {
        table: &'static str,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[error("{table} is corrupt: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("{table}: failed to decompress")]
    Decompress {
        table: &'static str,
        #[source]
        source: CompressError,
    },
    #[error("Image compressor")]
    Compressor(#[from] CompressError),
    #[error("Inconsistent directory tree")]
    Tree(#[from] TreeError),
}

impl ReaderError {
    pub(crate) fn corrupt(table: &'static str, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            detail: detail.into(),
        }
    }
}

/// The tree of an image as read back: regular files are described by their layout.
pub type FileSystem = generic_tree::FileSystem<FileLayout>;
pub type Directory = generic_tree::Directory<FileLayout>;
pub type Leaf = generic_tree::Leaf<FileLayout>;
pub type LeafContent = generic_tree::LeafContent<FileLayout>;
pub type Inode = generic_tree::Inode<FileLayout>;

fn slice<'d>(
    data: &'d [u8],
    table: &'static str,
    offset: u64,
    len: u64,
) -> Result<&'d [u8], ReaderError> {
    let out_of_bounds = || ReaderError::OutOfBounds {
        table,
        offset,
        len,
        size: data.len() as u64,
    };
    let end = offset.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > data.len() as u64 {
        return Err(out_of_bounds());
    }
    Ok(&data[offset as usize..end as usize])
}

/// Reads a lookup table of `count` entries of `entry_size` bytes whose block list is at
/// `list_start`.
fn read_lookup_table(
    data: &[u8],
    compressor: &Rc<dyn Compressor>,
    table: &'static str,
    list_start: u64,
    count: u64,
    entry_size: usize,
) -> Result<Vec<u8>, ReaderError> {
    let total = count
        .checked_mul(entry_size as u64)
        .ok_or_else(|| ReaderError::corrupt(table, format!("{count} entries")))?;
    let blocks = total.div_ceil(META_BLOCK_SIZE as u64);
    let list = slice(data, table, list_start, blocks * 8)?;

    let meta = MetaTable::new(table, data, Rc::clone(compressor));
    let mut out = Vec::new();
    for raw in list.chunks_exact(8) {
        let start = u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]);
        let block = meta.block(start)?;
        let wanted = (total - out.len() as u64).min(META_BLOCK_SIZE as u64) as usize;
        if block.len() < wanted {
            return Err(ReaderError::corrupt(
                table,
                format!("block at {start:#x} holds {} of {wanted} bytes", block.len()),
            ));
        }
        out.extend_from_slice(&block[..wanted]);
    }
    Ok(out)
}

fn entries<T: FromBytes>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(size_of::<T>())
        .filter_map(|chunk| T::read_from_bytes(chunk).ok())
        .collect()
}

const FLAG_NAMES: [(u16, &str); 11] = [
    (FLAG_UNCOMPRESSED_INODES, "uncompressed-inodes"),
    (FLAG_UNCOMPRESSED_DATA, "uncompressed-data"),
    (FLAG_UNCOMPRESSED_FRAGMENTS, "uncompressed-fragments"),
    (FLAG_NO_FRAGMENTS, "no-fragments"),
    (FLAG_ALWAYS_FRAGMENTS, "always-fragments"),
    (FLAG_DUPLICATES, "duplicates"),
    (FLAG_EXPORTABLE, "exportable"),
    (FLAG_UNCOMPRESSED_XATTRS, "uncompressed-xattrs"),
    (FLAG_NO_XATTRS, "no-xattrs"),
    (FLAG_COMPRESSOR_OPTIONS, "compressor-options"),
    (FLAG_UNCOMPRESSED_IDS, "uncompressed-ids"),
];

/// The superblock fields in host types, as shown by `unsqfs info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperblockInfo {
    pub compressor: CompressorId,
    pub block_size: u32,
    pub modification_time: u32,
    pub inode_count: u32,
    pub fragment_count: u32,
    pub id_count: u16,
    pub flags: u16,
    pub bytes_used: u64,
    /// Table name and start offset; `None` for absent tables.
    pub tables: Vec<(&'static str, Option<u64>)>,
}

impl SuperblockInfo {
    /// Names of the flags that are set.
    pub fn flag_names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for SuperblockInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "compressor:        {}", self.compressor)?;
        writeln!(f, "block size:        {}", self.block_size)?;
        writeln!(f, "modification time: {}", self.modification_time)?;
        writeln!(f, "inodes:            {}", self.inode_count)?;
        writeln!(f, "fragments:         {}", self.fragment_count)?;
        writeln!(f, "ids:               {}", self.id_count)?;
        writeln!(
            f,
            "flags:             {:#06x} {}",
            self.flags,
            self.flag_names().join(" ")
        )?;
        writeln!(f, "bytes used:        {}", self.bytes_used)?;
        for (name, start) in &self.tables {
            match start {
                Some(start) => writeln!(f, "{:<19}{start}", format!("{name}:"))?,
                None => writeln!(f, "{:<19}absent", format!("{name}:"))?,
            }
        }
        Ok(())
    }
}

/// A parsed image.
pub struct Image<'i> {
    data: &'i [u8],
    superblock: Superblock,
    compressor: Rc<dyn Compressor>,
    inodes: MetaTable<'i>,
    directories: MetaTable<'i>,
    ids: Vec<u32>,
    fragments: Vec<FragmentEntry>,
    xattr_ids: Vec<XattrId>,
    xattr_kv: Option<MetaTable<'i>>,
    fragment_cache: RefCell<Option<(u32, Rc<[u8]>)>>,
}

impl fmt::Debug for Image<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Image")
            .field("superblock", &self.superblock)
            .field("compressor", &self.compressor.id())
            .finish_non_exhaustive()
    }
}

impl<'i> Image<'i> {
    /// Parses the superblock and the lookup tables of `data`.
    pub fn open(data: &'i [u8], registry: &CompressorRegistry) -> Result<Self, ReaderError> {
        let (superblock, _) = Superblock::read_from_prefix(data).map_err(|_| {
            ReaderError::OutOfBounds {
                table: "superblock",
                offset: 0,
                len: size_of::<Superblock>() as u64,
                size: data.len() as u64,
            }
        })?;

        if superblock.magic != MAGIC {
            return Err(ReaderError::BadMagic(superblock.magic.get()));
        }
        let (major, minor) = (
            superblock.version_major.get(),
            superblock.version_minor.get(),
        );
        if (major, minor) != (VERSION_MAJOR, VERSION_MINOR) {
            return Err(ReaderError::UnsupportedVersion { major, minor });
        }
        let block_size = superblock.block_size.get();
        let block_log = superblock.block_log.get();
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || block_size.trailing_zeros() != block_log as u32
        {
            return Err(ReaderError::InvalidBlockSize {
                size: block_size,
                log: block_log,
            });
        }

        let bytes_used = superblock.bytes_used.get();
        let data = slice(data, "image", 0, bytes_used)?;

        let options = match superblock.has_flag(FLAG_COMPRESSOR_OPTIONS) {
            true => {
                let header = slice(data, "compressor options", 96, 2)?;
                let (len, compressed) = parse_header(u16::from_le_bytes([header[0], header[1]]));
                if compressed {
                    return Err(ReaderError::corrupt(
                        "compressor options",
                        "options block is compressed",
                    ));
                }
                Some(slice(data, "compressor options", 98, len as u64)?)
            }
            false => None,
        };
        let compressor: Rc<dyn Compressor> = Rc::from(
            registry.for_image(superblock.compression_id.get(), options)?,
        );

        let check_start = |table: &'static str, start: u64| {
            if start >= bytes_used {
                Err(ReaderError::OutOfBounds {
                    table,
                    offset: start,
                    len: 1,
                    size: bytes_used,
                })
            } else {
                Ok(start)
            }
        };
        let inode_start = check_start("inode table", superblock.inode_table_start.get())?;
        let directory_start =
            check_start("directory table", superblock.directory_table_start.get())?;
        if inode_start >= directory_start {
            return Err(ReaderError::corrupt(
                "superblock",
                "inode table doesn't precede the directory table",
            ));
        }
        let id_start = check_start("id table", superblock.id_table_start.get())?;

        let inodes = MetaTable::new(
            "inode table",
            &data[inode_start as usize..directory_start as usize],
            Rc::clone(&compressor),
        );
        let directories = MetaTable::new(
            "directory table",
            &data[directory_start as usize..],
            Rc::clone(&compressor),
        );

        let ids = entries::<zerocopy::little_endian::U32>(&read_lookup_table(
            data,
            &compressor,
            "id table",
            id_start,
            superblock.id_count.get() as u64,
            4,
        )?)
        .into_iter()
        .map(|id| id.get())
        .collect();

        let fragment_count = superblock.fragment_entry_count.get();
        let fragments = match fragment_count {
            0 => vec![],
            _ => {
                let start = check_start("fragment table", superblock.fragment_table_start.get())?;
                entries(&read_lookup_table(
                    data,
                    &compressor,
                    "fragment table",
                    start,
                    fragment_count as u64,
                    size_of::<FragmentEntry>(),
                )?)
            }
        };

        let (xattr_ids, xattr_kv) = match superblock.xattr_id_table_start.get() {
            TABLE_ABSENT => (vec![], None),
            start => {
                let start = check_start("xattr id table", start)?;
                let header = XattrIdTable::read_from_bytes(slice(
                    data,
                    "xattr id table",
                    start,
                    size_of::<XattrIdTable>() as u64,
                )?)
                .map_err(|_| ReaderError::corrupt("xattr id table", "short header"))?;
                let kv_start = check_start("xattr table", header.kv_start.get())?;
                let ids = entries(&read_lookup_table(
                    data,
                    &compressor,
                    "xattr id table",
                    start + size_of::<XattrIdTable>() as u64,
                    header.count.get() as u64,
                    size_of::<XattrId>(),
                )?);
                let kv = MetaTable::new(
                    "xattr table",
                    &data[kv_start as usize..],
                    Rc::clone(&compressor),
                );
                (ids, Some(kv))
            }
        };

        debug!("opened image: {superblock:?}");
        Ok(Self {
            data,
            superblock,
            compressor,
            inodes,
            directories,
            ids,
            fragments,
            xattr_ids,
            xattr_kv,
            fragment_cache: RefCell::new(None),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn compressor_id(&self) -> CompressorId {
        self.compressor.id()
    }

    pub fn superblock_info(&self) -> SuperblockInfo {
        let sb = &self.superblock;
        let present = |start: u64| (start != TABLE_ABSENT).then_some(start);
        SuperblockInfo {
            compressor: self.compressor_id(),
            block_size: sb.block_size.get(),
            modification_time: sb.modification_time.get(),
            inode_count: sb.inode_count.get(),
            fragment_count: sb.fragment_entry_count.get(),
            id_count: sb.id_count.get(),
            flags: sb.flags.get(),
            bytes_used: sb.bytes_used.get(),
            tables: vec![
                ("inode table", present(sb.inode_table_start.get())),
                ("directory table", present(sb.directory_table_start.get())),
                ("fragment table", present(sb.fragment_table_start.get())),
                ("export table", present(sb.export_table_start.get())),
                ("id table", present(sb.id_table_start.get())),
                ("xattr id table", present(sb.xattr_id_table_start.get())),
            ],
        }
    }

    fn limits(&self) -> DecodeLimits {
        DecodeLimits {
            block_size: self.superblock.block_size.get(),
            image_len: self.data.len() as u64,
        }
    }

    /// Decodes the inode at `reference`.
    pub fn inode(&self, reference: MetaRef) -> Result<DecodedInode, ReaderError> {
        decode(&mut self.inodes.cursor(reference), &self.limits())
    }

    pub fn root_inode(&self) -> Result<DecodedInode, ReaderError> {
        let root = self.inode(MetaRef::from_raw(self.superblock.root_inode_ref.get()))?;
        if !root.inode_type.is_dir() {
            return Err(ReaderError::corrupt(
                "inode table",
                "root inode is not a directory",
            ));
        }
        Ok(root)
    }

    /// Reads the listing of a directory inode.
    pub fn directory(
        &self,
        inode: &DecodedInode,
    ) -> Result<Vec<ListingEntry<Box<[u8]>>>, ReaderError> {
        let InodePayload::Directory {
            listing,
            listing_len,
            ..
        } = inode.payload
        else {
            return Err(ReaderError::corrupt(
                "inode table",
                format!("inode {} is not a directory", inode.info.inode_number),
            ));
        };
        decode_listing(&mut self.directories.cursor(listing), listing_len)
    }

    /// Resolves an index into the id table.
    pub fn id(&self, index: u16) -> Result<u32, ReaderError> {
        self.ids
            .get(index as usize)
            .copied()
            .ok_or_else(|| ReaderError::corrupt("id table", format!("no id with index {index}")))
    }

    /// Reads the xattr set with the given index.
    pub fn xattrs(&self, index: Option<u32>) -> Result<XattrSet, ReaderError> {
        let mut set = XattrSet::new();
        let Some(index) = index else {
            return Ok(set);
        };
        let (Some(entry), Some(kv)) = (self.xattr_ids.get(index as usize), &self.xattr_kv) else {
            return Err(ReaderError::corrupt(
                "xattr id table",
                format!("no xattr set with index {index}"),
            ));
        };

        let mut cursor = kv.cursor(MetaRef::from_raw(entry.xattr_ref.get()));
        for _ in 0..entry.count.get() {
            let key: XattrKey = cursor.read()?;
            let kind = key.kind.get();
            let prefix = XATTR_PREFIXES
                .get((kind & XATTR_TYPE_MASK) as usize)
                .ok_or_else(|| ReaderError::corrupt("xattr table", format!("key type {kind}")))?;
            let suffix = cursor.read_vec(key.name_size.get() as usize)?;
            let name = [*prefix, &suffix].concat();

            let value_len: XattrValue = cursor.read()?;
            let value = if kind & XATTR_VALUE_OOL != 0 {
                // the value is stored elsewhere; we get its reference
                let reference: U64 = cursor.read()?;
                let mut elsewhere = kv.cursor(MetaRef::from_raw(reference.get()));
                let size: XattrValue = elsewhere.read()?;
                read_value(&mut |len| elsewhere.read_vec(len), size.size.get())?
            } else {
                read_value(&mut |len| cursor.read_vec(len), value_len.size.get())?
            };

            set.insert(OsStr::from_bytes(&name).into(), value.into_boxed_slice());
        }
        Ok(set)
    }

    fn stat(&self, inode: &DecodedInode) -> Result<Stat, ReaderError> {
        let xattrs = self.xattrs(inode.info.xattr)?;
        Ok(Stat {
            st_mode: inode.info.permissions as u32 & 0o7777,
            st_uid: self.id(inode.info.uid_idx)?,
            st_gid: self.id(inode.info.gid_idx)?,
            st_mtim_sec: inode.info.mtime as i64,
            xattrs: RefCell::new(xattrs),
        })
    }

    /// Rebuilds the whole tree.  Hard links are shared again by inode number.
    pub fn read_tree(&self) -> Result<FileSystem, ReaderError> {
        let root = self.root_inode()?;
        let mut fs = FileSystem::new(self.stat(&root)?);
        let mut walk = TreeWalk {
            image: self,
            leaves: HashMap::new(),
            visited: HashSet::from([root.info.inode_number]),
        };
        walk.fill(&mut fs.root, &root, 0)?;
        Ok(fs)
    }

    fn data_block_count(layout: &FileLayout) -> usize {
        layout.block_sizes.len() + layout.fragment.is_some() as usize
    }

    /// Returns the uncompressed content of block `index` of a file, the fragment tail being the
    /// last block.
    fn file_block(&self, layout: &FileLayout, index: usize) -> Result<Vec<u8>, ReaderError> {
        let block_size = self.superblock.block_size.get() as u64;
        let expected = (layout.size - index as u64 * block_size).min(block_size) as usize;

        if index == layout.block_sizes.len() {
            let Some(fragment) = layout.fragment else {
                return Err(ReaderError::corrupt("data", "block index past the end"));
            };
            let block = self.fragment_block(fragment.index)?;
            let start = fragment.offset as usize;
            return block
                .get(start..start + fragment.len as usize)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    ReaderError::corrupt(
                        "fragment",
                        format!(
                            "{} bytes at {start} past the {} byte fragment block",
                            fragment.len,
                            block.len()
                        ),
                    )
                });
        }

        let size_word = layout.block_sizes[index];
        if size_word == 0 {
            return Ok(vec![0; expected]);
        }
        let offset = layout.blocks_start
            + layout.block_sizes[..index]
                .iter()
                .map(|w| (w & DATA_SIZE_MASK) as u64)
                .sum::<u64>();
        let block = self.data_block("data", offset, size_word)?;
        if block.len() != expected {
            return Err(ReaderError::corrupt(
                "data",
                format!(
                    "block at {offset:#x} holds {} bytes instead of {expected}",
                    block.len()
                ),
            ));
        }
        Ok(block)
    }

    fn data_block(
        &self,
        table: &'static str,
        offset: u64,
        size_word: u32,
    ) -> Result<Vec<u8>, ReaderError> {
        let data_end = self.superblock.inode_table_start.get();
        let region = &self.data[..data_end as usize];
        let stored = slice(region, table, offset, (size_word & DATA_SIZE_MASK) as u64)?;
        trace!("{table} block at {offset:#x}, size word {size_word:#x}");
        match size_word & DATA_UNCOMPRESSED != 0 {
            true => Ok(stored.to_vec()),
            false => self
                .compressor
                .decompress(stored, self.superblock.block_size.get() as usize)
                .map_err(|source| ReaderError::Decompress { table, source }),
        }
    }

    fn fragment_block(&self, index: u32) -> Result<Rc<[u8]>, ReaderError> {
        if let Some((cached, block)) = &*self.fragment_cache.borrow() {
            if *cached == index {
                return Ok(Rc::clone(block));
            }
        }
        let entry = self.fragments.get(index as usize).ok_or_else(|| {
            ReaderError::corrupt("fragment table", format!("no fragment {index}"))
        })?;
        let block: Rc<[u8]> = self
            .data_block("fragment", entry.start.get(), entry.size.get())?
            .into();
        *self.fragment_cache.borrow_mut() = Some((index, Rc::clone(&block)));
        Ok(block)
    }

    /// Reads a whole file into memory.
    pub fn read_file(&self, layout: &FileLayout) -> Result<Vec<u8>, ReaderError> {
        let mut out = Vec::with_capacity(layout.size.min(self.data.len() as u64 * 16) as usize);
        for index in 0..Self::data_block_count(layout) {
            out.extend_from_slice(&self.file_block(layout, index)?);
        }
        if out.len() as u64 != layout.size {
            return Err(ReaderError::corrupt(
                "data",
                format!("file has {} of {} bytes", out.len(), layout.size),
            ));
        }
        Ok(out)
    }

    /// A streaming reader over a file's content.
    pub fn open_file<'a>(&'a self, layout: &'a FileLayout) -> FileReader<'a, 'i> {
        FileReader {
            image: self,
            layout,
            next: 0,
            buffer: vec![],
            position: 0,
        }
    }
}

fn read_value(
    read: &mut dyn FnMut(usize) -> Result<Vec<u8>, ReaderError>,
    size: u32,
) -> Result<Vec<u8>, ReaderError> {
    if size > MAX_XATTR_VALUE {
        return Err(ReaderError::corrupt(
            "xattr table",
            format!("value of {size} bytes"),
        ));
    }
    read(size as usize)
}

struct TreeWalk<'a, 'i> {
    image: &'a Image<'i>,
    leaves: HashMap<u32, Rc<Leaf>>,
    visited: HashSet<u32>,
}

impl TreeWalk<'_, '_> {
    fn leaf(&mut self, inode: DecodedInode) -> Result<Rc<Leaf>, ReaderError> {
        if let Some(leaf) = self.leaves.get(&inode.info.inode_number) {
            return Ok(Rc::clone(leaf));
        }

        let stat = self.image.stat(&inode)?;
        let content = match inode.payload {
            InodePayload::File { layout, .. } => LeafContent::Regular(layout),
            InodePayload::Symlink { target, .. } => {
                LeafContent::Symlink(OsStr::from_bytes(&target).into())
            }
            InodePayload::BlockDevice { device, .. } => {
                let (major, minor) = decode_device(device);
                LeafContent::BlockDevice(rustix::fs::makedev(major, minor))
            }
            InodePayload::CharacterDevice { device, .. } => {
                let (major, minor) = decode_device(device);
                LeafContent::CharacterDevice(rustix::fs::makedev(major, minor))
            }
            InodePayload::Fifo { .. } => LeafContent::Fifo,
            InodePayload::Socket { .. } => LeafContent::Socket,
            InodePayload::Directory { .. } => {
                return Err(ReaderError::corrupt(
                    "inode table",
                    "directory where a leaf was expected",
                ))
            }
        };

        let leaf = Rc::new(Leaf { stat, content });
        self.leaves
            .insert(inode.info.inode_number, Rc::clone(&leaf));
        Ok(leaf)
    }

    fn fill(
        &mut self,
        dir: &mut Directory,
        inode: &DecodedInode,
        depth: usize,
    ) -> Result<(), ReaderError> {
        if depth > MAX_DEPTH {
            return Err(ReaderError::corrupt(
                "directory table",
                format!("directories nested deeper than {MAX_DEPTH}"),
            ));
        }

        for entry in self.image.directory(inode)? {
            let child = self.image.inode(entry.inode_ref)?;
            if child.info.inode_number != entry.inode_number
                || child.inode_type.basic() != entry.inode_type
            {
                return Err(ReaderError::corrupt(
                    "directory table",
                    format!(
                        "entry {:?} doesn't match inode {:?} ({:?})",
                        entry.name.escape_ascii().to_string(),
                        child.info.inode_number,
                        child.inode_type
                    ),
                ));
            }

            let name = OsStr::from_bytes(&entry.name);
            if entry.inode_type == InodeType::Directory {
                if !self.visited.insert(child.info.inode_number) {
                    return Err(ReaderError::corrupt(
                        "directory table",
                        format!("directory inode {} is linked twice", child.info.inode_number),
                    ));
                }
                let mut sub = Directory::new(self.image.stat(&child)?);
                self.fill(&mut sub, &child, depth + 1)?;
                dir.insert_new(name, Inode::Directory(Box::new(sub)))?;
            } else {
                let leaf = self.leaf(child)?;
                dir.insert_new(name, Inode::Leaf(leaf))?;
            }
        }
        Ok(())
    }
}

/// Streams a file's content block by block.
pub struct FileReader<'a, 'i> {
    image: &'a Image<'i>,
    layout: &'a FileLayout,
    next: usize,
    buffer: Vec<u8>,
    position: usize,
}

impl Read for FileReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position == self.buffer.len() {
            if self.next == Image::data_block_count(self.layout) {
                return Ok(0);
            }
            self.buffer = self
                .image
                .file_block(self.layout, self.next)
                .map_err(io::Error::other)?;
            self.next += 1;
            self.position = 0;
        }

        let n = buf.len().min(self.buffer.len() - self.position);
        buf[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io::Read};

    use super::*;
    use crate::{
        squashfs::writer::{mkfs_image, WriterOptions},
        tree::{self, FileSource},
    };

    fn stat(mode: u32) -> Stat {
        Stat {
            st_mode: mode,
            st_uid: 0,
            st_gid: 0,
            st_mtim_sec: 1000,
            xattrs: RefCell::new(BTreeMap::new()),
        }
    }

    fn options() -> WriterOptions {
        WriterOptions {
            block_size: 4096,
            workers: 1,
            ..Default::default()
        }
    }

    fn image_with(files: &[(&str, Vec<u8>)]) -> Box<[u8]> {
        let mut fs = tree::FileSystem::new(stat(0o755));
        for (name, data) in files {
            fs.root.insert(
                OsStr::new(name),
                tree::Inode::Leaf(Rc::new(tree::Leaf {
                    stat: stat(0o644),
                    content: tree::LeafContent::Regular(FileSource::from(data.clone())),
                })),
            );
        }
        mkfs_image(&fs, &options()).unwrap()
    }

    #[test]
    fn files_read_back() {
        let big: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        let image = image_with(&[("big", big.clone()), ("small", b"tiny".to_vec())]);
        let image = Image::open(&image, &CompressorRegistry::with_defaults()).unwrap();
        let fs = image.read_tree().unwrap();

        let layout = fs.root.get_file(OsStr::new("big")).unwrap();
        assert_eq!(image.read_file(layout).unwrap(), big);

        let mut streamed = vec![];
        image
            .open_file(layout)
            .read_to_end(&mut streamed)
            .unwrap();
        assert_eq!(streamed, big);

        let small = fs.root.get_file(OsStr::new("small")).unwrap();
        assert_eq!(image.read_file(small).unwrap(), b"tiny");
    }

    #[test]
    fn bad_superblocks() {
        let registry = CompressorRegistry::with_defaults();
        let image = image_with(&[("a", b"a".to_vec())]);

        assert!(matches!(
            Image::open(&image[..50], &registry),
            Err(ReaderError::OutOfBounds { .. })
        ));

        let mut bad = image.to_vec();
        bad[0] = b'x';
        assert!(matches!(
            Image::open(&bad, &registry),
            Err(ReaderError::BadMagic(_))
        ));

        let mut bad = image.to_vec();
        bad[28..30].copy_from_slice(&3u16.to_le_bytes());
        assert!(matches!(
            Image::open(&bad, &registry),
            Err(ReaderError::UnsupportedVersion { major: 3, minor: 0 })
        ));

        let mut bad = image.to_vec();
        bad[22..24].copy_from_slice(&13u16.to_le_bytes());
        assert!(matches!(
            Image::open(&bad, &registry),
            Err(ReaderError::InvalidBlockSize { .. })
        ));

        let mut bad = image.to_vec();
        bad[20..22].copy_from_slice(&4u16.to_le_bytes());
        assert!(matches!(
            Image::open(&bad, &registry),
            Err(ReaderError::Compressor(CompressError::Unsupported(
                CompressorId::Xz
            )))
        ));
    }

    #[test]
    fn truncated_images_are_rejected() {
        let big: Vec<u8> = (0..50000u32).map(|i| (i * 7 % 253) as u8).collect();
        let image = image_with(&[("big", big), ("x", b"x".to_vec())]);
        let registry = CompressorRegistry::with_defaults();
        let bytes_used = Superblock::read_from_prefix(&image[..])
            .unwrap()
            .0
            .bytes_used
            .get() as usize;

        for len in (96..bytes_used).step_by(97) {
            let result = Image::open(&image[..len], &registry).and_then(|i| {
                let fs = i.read_tree()?;
                let layout = fs.root.get_file(OsStr::new("big"))?;
                i.read_file(layout)
            });
            assert!(result.is_err(), "truncated to {len} bytes");
        }
    }

    #[test]
    fn superblock_info_lists_tables() {
        let image = image_with(&[("a", b"a".to_vec())]);
        let image = Image::open(&image, &CompressorRegistry::with_defaults()).unwrap();
        let info = image.superblock_info();
        assert_eq!(info.compressor, CompressorId::Gzip);
        assert_eq!(info.block_size, 4096);
        assert_eq!(info.inode_count, 2);
        assert_eq!(info.flag_names(), ["duplicates", "exportable", "no-xattrs"]);
        assert!(info.tables.contains(&("xattr id table", None)));
        assert!(matches!(info.tables[3], ("export table", Some(_))));

        let text = info.to_string();
        assert!(text.contains("compressor:        gzip\n"));
        assert!(text.contains("xattr id table:    absent\n"));
    }
}
