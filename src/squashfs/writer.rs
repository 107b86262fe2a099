//! The image writer.
//!
//! Writing runs through a fixed sequence of [`Stage`]s.  The superblock slot at the start of the
//! output is reserved first and only filled in after everything else has been written, so an
//! image whose build failed (or was interrupted) has no valid magic.

use std::{
    collections::HashMap,
    error::Error,
    ffi::OsStr,
    fmt,
    io::{Cursor, SeekFrom},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::{debug, trace};
use thiserror::Error;
use zerocopy::IntoBytes;

use super::{
    directory::{encode_listing, ListingEntry},
    format::{
        encode_device, InodeType, Superblock, DEFAULT_BLOCK_SIZE, DEVBLK_SIZE,
        FLAG_COMPRESSOR_OPTIONS, FLAG_DUPLICATES, FLAG_EXPORTABLE, FLAG_NO_FRAGMENTS,
        FLAG_NO_XATTRS, MAGIC, MAX_BLOCK_SIZE, META_UNCOMPRESSED, MIN_BLOCK_SIZE, TABLE_ABSENT,
        VERSION_MAJOR, VERSION_MINOR,
    },
    inode::{encode, InodeInfo, InodePayload, InodeRecord},
    meta::{MetaRef, MetaWriter},
    tables::{write_lookup_table, write_xattr_table, IdTable, XattrSet, XattrTable},
};
use crate::{
    compress::{CompressorConfig, CompressorRegistry},
    data::{DataOptions, DataStats, DataWriter, FileLayout, ImageOutput, PackFlags},
    sortfile::SortFile,
    tree::{Directory, FileSystem, Inode, Leaf, LeafContent, Stat},
};

/// The steps of writing an image, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scan,
    AssignIds,
    PackData,
    EncodeInodes,
    PackMetadata,
    WriteTables,
    WriteSuperblock,
    Done,
    Failed,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        Some(match self {
            Stage::Scan => Stage::AssignIds,
            Stage::AssignIds => Stage::PackData,
            Stage::PackData => Stage::EncodeInodes,
            Stage::EncodeInodes => Stage::PackMetadata,
            Stage::PackMetadata => Stage::WriteTables,
            Stage::WriteTables => Stage::WriteSuperblock,
            Stage::WriteSuperblock => Stage::Done,
            Stage::Done | Stage::Failed => return None,
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Stage::Scan => "scanning the tree",
            Stage::AssignIds => "assigning inode numbers and ids",
            Stage::PackData => "packing file data",
            Stage::EncodeInodes => "encoding inodes",
            Stage::PackMetadata => "packing metadata",
            Stage::WriteTables => "writing tables",
            Stage::WriteSuperblock => "writing the superblock",
            Stage::Done => "done",
            Stage::Failed => "failed",
        })
    }
}

/// A failed image build: the stage that failed, the path it was working on (if any) and the
/// underlying error.
#[derive(Error, Debug)]
pub struct BuildError {
    pub stage: Stage,
    pub path: Option<PathBuf>,
    #[source]
    pub source: Box<dyn Error + Send + Sync>,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Failed {}", self.stage)?;
        if let Some(path) = &self.path {
            write!(f, " at {path:?}")?;
        }
        Ok(())
    }
}

impl BuildError {
    fn new(stage: Stage, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            stage,
            path: None,
            source: source.into(),
        }
    }

    fn at(stage: Stage, path: &Path, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            stage,
            path: Some(path.to_path_buf()),
            source: source.into(),
        }
    }
}

/// Settings for a new image.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub block_size: u32,
    pub compressor: CompressorConfig,
    /// Pack file tails into shared fragment blocks.
    pub tail_packing: bool,
    pub deduplicate: bool,
    /// Compression threads; 1 compresses on the calling thread.
    pub workers: usize,
    /// Write the export table, which allows NFS export of the mounted image.
    pub exportable: bool,
    /// The superblock modification time.  Defaults to the newest mtime in the tree.
    pub mkfs_time: Option<u32>,
    pub sort: Option<SortFile>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compressor: CompressorConfig::default(),
            tail_packing: true,
            deduplicate: true,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            exportable: true,
            mkfs_time: None,
            sort: None,
        }
    }
}

/// What was written.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub inode_count: u32,
    pub bytes_used: u64,
    pub fragment_count: u32,
    pub id_count: usize,
    pub xattr_sets: usize,
    pub data: DataStats,
}

#[derive(Debug)]
enum NodeKind<'t> {
    Directory {
        /// `(name, inode number)`, sorted by name.
        children: Vec<(&'t OsStr, u32)>,
        subdirs: u32,
    },
    Leaf(&'t Leaf),
}

/// One inode of the image.  Nodes are stored in inode number order.
#[derive(Debug)]
struct Node<'t> {
    path: PathBuf,
    stat: &'t Stat,
    kind: NodeKind<'t>,
    parent: u32,
    link_count: u32,
}

/// Flattens a tree into [`Node`]s, numbering them.
///
/// The contents of subdirectories are numbered before the children of the directory itself,
/// and the root comes last.  That way every inode is written before its parent's, and a
/// directory's listing can refer to the final locations of all its children.
struct InodeCollector<'t> {
    nodes: Vec<Node<'t>>,
    hardlinks: HashMap<*const Leaf, u32>,
}

impl<'t> InodeCollector<'t> {
    fn push(&mut self, node: Node<'t>) -> u32 {
        self.nodes.push(node);
        self.nodes.len() as u32
    }

    fn collect_leaf(&mut self, leaf: &'t Rc<Leaf>, path: PathBuf) -> u32 {
        if let Some(number) = self.hardlinks.get(&Rc::as_ptr(leaf)) {
            self.nodes[*number as usize - 1].link_count += 1;
            return *number;
        }

        let number = self.push(Node {
            path,
            stat: &leaf.stat,
            kind: NodeKind::Leaf(leaf),
            parent: 0,
            link_count: 1,
        });
        self.hardlinks.insert(Rc::as_ptr(leaf), number);
        number
    }

    /// Numbers everything below `dir`, returning its children.
    fn collect_contents(&mut self, dir: &'t Directory, path: &Path) -> Vec<(&'t OsStr, u32)> {
        let mut contents = vec![];
        for (name, inode) in dir.sorted_entries() {
            if let Inode::Directory(sub) = inode {
                contents.push(self.collect_contents(sub, &path.join(name)));
            }
        }
        let mut contents = contents.into_iter();

        let mut children = Vec::with_capacity(dir.len());
        for (name, inode) in dir.sorted_entries() {
            let child_path = path.join(name);
            let number = match inode {
                Inode::Directory(sub) => {
                    let grandchildren = contents.next().unwrap_or_default();
                    self.collect_dir(sub, child_path, grandchildren)
                }
                Inode::Leaf(leaf) => self.collect_leaf(leaf, child_path),
            };
            children.push((name, number));
        }
        children
    }

    fn collect_dir(
        &mut self,
        dir: &'t Directory,
        path: PathBuf,
        children: Vec<(&'t OsStr, u32)>,
    ) -> u32 {
        let subdirs = dir
            .inodes()
            .filter(|inode| matches!(inode, Inode::Directory(_)))
            .count() as u32;
        let number = self.push(Node {
            path,
            stat: &dir.stat,
            kind: NodeKind::Directory { children, subdirs },
            parent: 0,
            link_count: 2 + subdirs,
        });

        // now that our number is known, tell the subdirectories about it
        if let NodeKind::Directory { children, .. } = &self.nodes[number as usize - 1].kind {
            let subdirs: Vec<u32> = children
                .iter()
                .map(|(_, n)| *n)
                .filter(|n| matches!(self.nodes[*n as usize - 1].kind, NodeKind::Directory { .. }))
                .collect();
            for n in subdirs {
                self.nodes[n as usize - 1].parent = number;
            }
        }
        number
    }

    fn collect(fs: &'t FileSystem) -> Vec<Node<'t>> {
        let mut this = Self {
            nodes: vec![],
            hardlinks: HashMap::new(),
        };
        let root = Path::new("/");
        let children = this.collect_contents(&fs.root, root);
        let number = this.collect_dir(&fs.root, root.to_path_buf(), children);
        // the root's parent points one past the last inode
        this.nodes[number as usize - 1].parent = number + 1;
        this.nodes
    }
}

fn validate_tree(dir: &Directory, path: &Path) -> Result<(), BuildError> {
    for (name, inode) in dir.sorted_entries() {
        let child = path.join(name);
        crate::generic_tree::validate_name(name)
            .map_err(|e| BuildError::at(Stage::Scan, &child, e))?;
        match inode {
            Inode::Directory(sub) => validate_tree(sub, &child)?,
            Inode::Leaf(leaf) => {
                if let LeafContent::Symlink(target) = &leaf.content {
                    if target.is_empty() {
                        return Err(BuildError::at(Stage::Scan, &child, "empty symlink target"));
                    }
                }
            }
        }
    }
    Ok(())
}

fn basic_type(node: &Node) -> InodeType {
    match node.kind {
        NodeKind::Directory { .. } => InodeType::Directory,
        NodeKind::Leaf(leaf) => match leaf.content {
            LeafContent::Regular(_) => InodeType::RegularFile,
            LeafContent::Symlink(_) => InodeType::Symlink,
            LeafContent::BlockDevice(_) => InodeType::BlockDevice,
            LeafContent::CharacterDevice(_) => InodeType::CharacterDevice,
            LeafContent::Fifo => InodeType::Fifo,
            LeafContent::Socket => InodeType::Socket,
        },
    }
}

fn device_number(rdev: u64) -> u32 {
    encode_device(rustix::fs::major(rdev), rustix::fs::minor(rdev))
}

struct ImageWriter<'t, 'o, W: ImageOutput> {
    fs: &'t FileSystem,
    output: &'o mut W,
    options: &'o WriterOptions,
    registry: &'o CompressorRegistry,
    /// `None` until the first stage starts.
    stage: Option<Stage>,

    nodes: Vec<Node<'t>>,
    infos: Vec<InodeInfo>,
    ids: IdTable,
    xattrs: XattrTable,
    layouts: Vec<Option<FileLayout>>,
    records: Vec<Option<InodeRecord>>,
    position: u64,
}

/// Offsets and contents of everything that follows the data region.
#[derive(Default)]
struct Tables {
    inode_table: Vec<u8>,
    directory_table: Vec<u8>,
    inode_refs: Vec<MetaRef>,
    fragments: Vec<u8>,
    fragment_count: u32,
    data: DataStats,
}

#[derive(Default)]
struct TableOffsets {
    inode_table: u64,
    directory_table: u64,
    fragment_table: u64,
    export_table: u64,
    id_table: u64,
    xattr_table: u64,
    end: u64,
}

impl<'t, 'o, W: ImageOutput> ImageWriter<'t, 'o, W> {
    /// Moves to the next stage, running `f` for it.  A failure leaves the writer in
    /// [`Stage::Failed`], after which nothing else runs.
    fn step<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce(&mut Self) -> Result<T, BuildError>,
    ) -> Result<T, BuildError> {
        let expected = match self.stage {
            None => Some(Stage::Scan),
            Some(current) => current.next(),
        };
        if expected != Some(stage) {
            return Err(BuildError::new(
                stage,
                format!("can't start after {:?}", self.stage),
            ));
        }

        self.stage = Some(stage);
        debug!("{stage}");
        f(self).inspect_err(|e| {
            debug!("{e}");
            self.stage = Some(Stage::Failed);
        })
    }

    fn scan(&mut self) -> Result<(), BuildError> {
        let block_size = self.options.block_size;
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(BuildError::new(
                Stage::Scan,
                format!("invalid block size {block_size}"),
            ));
        }
        validate_tree(&self.fs.root, Path::new("/"))
    }

    fn assign_ids(&mut self) -> Result<(), BuildError> {
        self.nodes = InodeCollector::collect(self.fs);
        let count = u32::try_from(self.nodes.len())
            .ok()
            .filter(|n| *n < u32::MAX - 1)
            .ok_or_else(|| BuildError::new(Stage::AssignIds, "too many inodes"))?;
        debug!("{count} inodes");

        for (index, node) in self.nodes.iter().enumerate() {
            let stage = Stage::AssignIds;
            let uid_idx = self
                .ids
                .get_or_insert(node.stat.st_uid)
                .map_err(|e| BuildError::at(stage, &node.path, e))?;
            let gid_idx = self
                .ids
                .get_or_insert(node.stat.st_gid)
                .map_err(|e| BuildError::at(stage, &node.path, e))?;
            let set: XattrSet = node.stat.xattrs.borrow().clone();
            let xattr = self
                .xattrs
                .get_or_insert(&set)
                .map_err(|e| BuildError::at(stage, &node.path, e))?;

            self.infos.push(InodeInfo {
                permissions: (node.stat.st_mode & 0o7777) as u16,
                uid_idx,
                gid_idx,
                mtime: node.stat.image_mtime(),
                inode_number: index as u32 + 1,
                xattr,
            });
        }
        Ok(())
    }

    /// The order in which regular files are packed: ascending sort priority, ties in inode order.
    fn pack_order(&self) -> Vec<(usize, PackFlags)> {
        let mut order: Vec<(i64, usize, PackFlags)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                matches!(node.kind, NodeKind::Leaf(Leaf { content: LeafContent::Regular(_), .. }))
            })
            .map(|(index, node)| {
                match self.options.sort.as_ref().and_then(|s| s.get(&node.path)) {
                    Some(entry) => (entry.priority, index, entry.flags),
                    None => (0, index, PackFlags::default()),
                }
            })
            .collect();
        order.sort_by_key(|(priority, index, _)| (*priority, *index));
        order.into_iter().map(|(_, index, flags)| (index, flags)).collect()
    }

    fn pack_data(&mut self) -> Result<Tables, BuildError> {
        let stage = Stage::PackData;
        let compressor = self
            .registry
            .create(&self.options.compressor)
            .map_err(|e| BuildError::new(stage, e))?;
        let compressor = &*compressor;

        // the superblock slot, filled in at the very end
        self.output
            .truncate(0)
            .map_err(|e| BuildError::new(stage, e))?;
        let mut header = vec![0u8; size_of::<Superblock>()];
        if let Some(options) = compressor.options() {
            header.extend_from_slice(&(options.len() as u16 | META_UNCOMPRESSED).to_le_bytes());
            header.extend_from_slice(&options);
        }
        self.output
            .write_all(&header)
            .map_err(|e| BuildError::new(stage, e))?;

        let order = self.pack_order();
        self.layouts = vec![None; self.nodes.len()];
        let data_options = DataOptions {
            block_size: self.options.block_size,
            tail_packing: self.options.tail_packing,
            deduplicate: self.options.deduplicate,
            workers: self.options.workers.max(1),
        };

        let nodes = &self.nodes;
        let layouts = &mut self.layouts;
        let output = &mut *self.output;
        let summary = std::thread::scope(|scope| {
            let mut data = DataWriter::new(scope, output, compressor, data_options)
                .map_err(|e| BuildError::new(stage, e))?;
            for (index, flags) in order {
                let node = &nodes[index];
                let NodeKind::Leaf(Leaf {
                    content: LeafContent::Regular(source),
                    ..
                }) = node.kind
                else {
                    continue;
                };
                let mut stream = source
                    .open(data_options.block_size as usize)
                    .map_err(|e| BuildError::at(stage, &node.path, e))?;
                let layout = data
                    .ingest(&mut *stream, flags)
                    .map_err(|e| BuildError::at(stage, &node.path, e))?;
                trace!("{:?}: {layout:?}", node.path);
                layouts[index] = Some(layout);
            }
            data.finish().map_err(|e| BuildError::new(stage, e))
        })?;

        self.position = summary.end;
        let fragment_count = u32::try_from(summary.fragments.len())
            .map_err(|_| BuildError::new(stage, "too many fragment blocks"))?;
        Ok(Tables {
            fragments: summary.fragments.as_bytes().to_vec(),
            fragment_count,
            data: summary.stats,
            ..Default::default()
        })
    }

    fn encode_leaves(&mut self) -> Result<(), BuildError> {
        let stage = Stage::EncodeInodes;
        let empty = FileLayout::default();
        self.records = Vec::with_capacity(self.nodes.len());

        for (index, node) in self.nodes.iter().enumerate() {
            let NodeKind::Leaf(leaf) = node.kind else {
                self.records.push(None);
                continue;
            };
            let link_count = node.link_count;
            let payload = match &leaf.content {
                LeafContent::Regular(_) => InodePayload::File {
                    layout: self.layouts[index].as_ref().unwrap_or(&empty),
                    link_count,
                },
                LeafContent::Symlink(target) => InodePayload::Symlink {
                    target: Box::from(target.as_bytes()),
                    link_count,
                },
                LeafContent::BlockDevice(rdev) => InodePayload::BlockDevice {
                    device: device_number(*rdev),
                    link_count,
                },
                LeafContent::CharacterDevice(rdev) => InodePayload::CharacterDevice {
                    device: device_number(*rdev),
                    link_count,
                },
                LeafContent::Fifo => InodePayload::Fifo { link_count },
                LeafContent::Socket => InodePayload::Socket { link_count },
            };
            let record = encode(&self.infos[index], &payload)
                .map_err(|e| BuildError::at(stage, &node.path, e))?;
            self.records.push(Some(record));
        }
        Ok(())
    }

    fn pack_metadata(&mut self, tables: &mut Tables) -> Result<MetaRef, BuildError> {
        let stage = Stage::PackMetadata;
        let compressor = self
            .registry
            .create(&self.options.compressor)
            .map_err(|e| BuildError::new(stage, e))?;
        let mut inodes = MetaWriter::new(&*compressor, false);
        let mut directories = MetaWriter::new(&*compressor, false);
        let mut refs: Vec<MetaRef> = Vec::with_capacity(self.nodes.len());
        let mut types: Vec<InodeType> = Vec::with_capacity(self.nodes.len());

        for (index, node) in self.nodes.iter().enumerate() {
            let fail = |e: Box<dyn Error + Send + Sync>| BuildError::at(stage, &node.path, e);

            let record = match (&node.kind, self.records[index].take()) {
                (NodeKind::Leaf(_), Some(record)) => record,
                (NodeKind::Directory { children, subdirs }, _) => {
                    let entries: Vec<ListingEntry<&[u8]>> = children
                        .iter()
                        .map(|(name, number)| ListingEntry {
                            name: name.as_bytes(),
                            inode_ref: refs[*number as usize - 1],
                            inode_number: *number,
                            inode_type: types[*number as usize - 1],
                        })
                        .collect();
                    let listing = encode_listing(&entries).map_err(|e| fail(e.into()))?;
                    let listing_ref = directories.append(&listing).map_err(|e| fail(e.into()))?;
                    trace!(
                        "{:?}: {} entries, listing at {listing_ref:?}",
                        node.path,
                        children.len()
                    );
                    let payload = InodePayload::Directory {
                        listing: listing_ref,
                        listing_len: listing.len() as u32,
                        link_count: 2 + subdirs,
                        parent_inode: node.parent,
                    };
                    encode(&self.infos[index], &payload).map_err(|e| fail(e.into()))?
                }
                (NodeKind::Leaf(_), None) => {
                    return Err(fail("inode was not encoded".into()));
                }
            };

            debug_assert_eq!(record.inode_type.basic(), basic_type(node));
            let reference = inodes.append(&record.bytes).map_err(|e| fail(e.into()))?;
            refs.push(reference);
            types.push(record.inode_type.basic());
        }

        tables.inode_table = inodes.finish().map_err(|e| BuildError::new(stage, e))?;
        tables.directory_table = directories
            .finish()
            .map_err(|e| BuildError::new(stage, e))?;
        let root = refs
            .last()
            .copied()
            .ok_or_else(|| BuildError::new(stage, "no root inode"))?;
        tables.inode_refs = refs;
        Ok(root)
    }

    fn write_tables(&mut self, tables: &Tables) -> Result<TableOffsets, BuildError> {
        let stage = Stage::WriteTables;
        let fail = |e: Box<dyn Error + Send + Sync>| BuildError::new(stage, e);
        let compressor = self
            .registry
            .create(&self.options.compressor)
            .map_err(|e| fail(e.into()))?;
        let compressor = &*compressor;
        let output = &mut *self.output;
        let mut offsets = TableOffsets::default();

        let mut position = self.position;
        output
            .seek(SeekFrom::Start(position))
            .map_err(|e| fail(e.into()))?;

        offsets.inode_table = position;
        output
            .write_all(&tables.inode_table)
            .map_err(|e| fail(e.into()))?;
        position += tables.inode_table.len() as u64;

        offsets.directory_table = position;
        output
            .write_all(&tables.directory_table)
            .map_err(|e| fail(e.into()))?;
        position += tables.directory_table.len() as u64;

        offsets.fragment_table = TABLE_ABSENT;
        if tables.fragment_count > 0 {
            let (start, end) =
                write_lookup_table(output, position, &tables.fragments, compressor, false)
                    .map_err(|e| fail(e.into()))?;
            offsets.fragment_table = start;
            position = end;
        }

        offsets.export_table = TABLE_ABSENT;
        if self.options.exportable {
            let refs: Vec<u8> = tables
                .inode_refs
                .iter()
                .flat_map(|r| r.to_raw().to_le_bytes())
                .collect();
            let (start, end) = write_lookup_table(output, position, &refs, compressor, false)
                .map_err(|e| fail(e.into()))?;
            offsets.export_table = start;
            position = end;
        }

        let ids: Vec<u8> = self.ids.ids().iter().flat_map(|id| id.to_le_bytes()).collect();
        let (start, end) = write_lookup_table(output, position, &ids, compressor, false)
            .map_err(|e| fail(e.into()))?;
        offsets.id_table = start;
        position = end;

        offsets.xattr_table = TABLE_ABSENT;
        if !self.xattrs.is_empty() {
            let (start, end) =
                write_xattr_table(output, position, &self.xattrs, compressor, false)
                    .map_err(|e| fail(e.into()))?;
            offsets.xattr_table = start;
            position = end;
        }

        offsets.end = position;
        debug!(
            "tables: inodes at {:#x}, directories at {:#x}, end at {position:#x}",
            offsets.inode_table, offsets.directory_table
        );
        Ok(offsets)
    }

    /// Checks that every file's blocks and fragment lie inside the data region.
    fn check_references(&self, tables: &Tables, data_end: u64) -> Result<(), BuildError> {
        let stage = Stage::WriteSuperblock;
        let block_size = self.options.block_size;
        for (node, layout) in self.nodes.iter().zip(&self.layouts) {
            let Some(layout) = layout else {
                continue;
            };
            let stored = layout.stored_len();
            if stored > 0 && layout.blocks_start + stored > data_end {
                return Err(BuildError::at(stage, &node.path, "blocks run past the data region"));
            }
            if let Some(fragment) = layout.fragment {
                if fragment.index >= tables.fragment_count
                    || fragment.offset as u64 + fragment.len as u64 > block_size as u64
                {
                    return Err(BuildError::at(stage, &node.path, "dangling fragment reference"));
                }
            }
        }
        Ok(())
    }

    fn write_superblock(
        &mut self,
        tables: &Tables,
        offsets: &TableOffsets,
        root: MetaRef,
    ) -> Result<u64, BuildError> {
        let stage = Stage::WriteSuperblock;
        let fail = |e: std::io::Error| BuildError::new(stage, e);
        self.check_references(tables, offsets.inode_table)?;

        let compressor = self
            .registry
            .create(&self.options.compressor)
            .map_err(|e| BuildError::new(stage, e))?;
        let mut flags = 0;
        if self.options.deduplicate {
            flags |= FLAG_DUPLICATES;
        }
        if self.options.exportable {
            flags |= FLAG_EXPORTABLE;
        }
        if !self.options.tail_packing {
            flags |= FLAG_NO_FRAGMENTS;
        }
        if self.xattrs.is_empty() {
            flags |= FLAG_NO_XATTRS;
        }
        if compressor.options().is_some() {
            flags |= FLAG_COMPRESSOR_OPTIONS;
        }

        let mkfs_time = self
            .options
            .mkfs_time
            .unwrap_or_else(|| self.fs.root.newest_file().clamp(0, u32::MAX as i64) as u32);

        let superblock = Superblock {
            magic: MAGIC,
            inode_count: (self.nodes.len() as u32).into(),
            modification_time: mkfs_time.into(),
            block_size: self.options.block_size.into(),
            fragment_entry_count: tables.fragment_count.into(),
            compression_id: (compressor.id() as u16).into(),
            block_log: (self.options.block_size.trailing_zeros() as u16).into(),
            flags: flags.into(),
            id_count: (self.ids.len() as u16).into(),
            version_major: VERSION_MAJOR.into(),
            version_minor: VERSION_MINOR.into(),
            root_inode_ref: root.to_raw().into(),
            bytes_used: offsets.end.into(),
            id_table_start: offsets.id_table.into(),
            xattr_id_table_start: offsets.xattr_table.into(),
            inode_table_start: offsets.inode_table.into(),
            directory_table_start: offsets.directory_table.into(),
            fragment_table_start: offsets.fragment_table.into(),
            export_table_start: offsets.export_table.into(),
        };

        let padded = offsets.end.next_multiple_of(DEVBLK_SIZE);
        let padding = vec![0u8; (padded - offsets.end) as usize];
        self.output.write_all(&padding).map_err(fail)?;

        self.output.seek(SeekFrom::Start(0)).map_err(fail)?;
        self.output.write_all(superblock.as_bytes()).map_err(fail)?;
        self.output.seek(SeekFrom::Start(padded)).map_err(fail)?;
        self.output.flush().map_err(fail)?;
        debug!("{superblock:?}");
        Ok(padded)
    }
}

/// Writes `fs` as an image to `output`, replacing whatever it held before.
pub fn write_image<W: ImageOutput>(
    fs: &FileSystem,
    output: &mut W,
    options: &WriterOptions,
    registry: &CompressorRegistry,
) -> Result<ImageSummary, BuildError> {
    let mut writer = ImageWriter {
        fs,
        output,
        options,
        registry,
        stage: None,
        nodes: vec![],
        infos: vec![],
        ids: IdTable::default(),
        xattrs: XattrTable::default(),
        layouts: vec![],
        records: vec![],
        position: 0,
    };

    writer.step(Stage::Scan, |w| w.scan())?;
    writer.step(Stage::AssignIds, |w| w.assign_ids())?;
    let mut tables = writer.step(Stage::PackData, |w| w.pack_data())?;
    writer.step(Stage::EncodeInodes, |w| w.encode_leaves())?;
    let root = writer.step(Stage::PackMetadata, |w| w.pack_metadata(&mut tables))?;
    let offsets = writer.step(Stage::WriteTables, |w| w.write_tables(&tables))?;
    writer.step(Stage::WriteSuperblock, |w| {
        w.write_superblock(&tables, &offsets, root)
    })?;
    writer.stage = Some(Stage::Done);

    Ok(ImageSummary {
        inode_count: writer.nodes.len() as u32,
        bytes_used: offsets.end,
        fragment_count: tables.fragment_count,
        id_count: writer.ids.len(),
        xattr_sets: writer.xattrs.len(),
        data: tables.data,
    })
}

/// Writes `fs` to an in-memory image using the default compressors.
pub fn mkfs_image(fs: &FileSystem, options: &WriterOptions) -> Result<Box<[u8]>, BuildError> {
    let mut output = Cursor::new(vec![]);
    write_image(fs, &mut output, options, &CompressorRegistry::with_defaults())?;
    Ok(output.into_inner().into_boxed_slice())
}
