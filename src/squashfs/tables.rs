//! Deduplicating id and xattr registries, and the lookup tables that persist them.

use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsStr,
    io::Write,
    os::unix::ffi::OsStrExt,
};

use log::trace;
use thiserror::Error;
use zerocopy::IntoBytes;

use super::{
    format::{xattr_prefix, XattrId, XattrIdTable, XattrKey, XattrValue},
    meta::MetaWriter,
};
use crate::compress::{CompressError, Compressor};

#[derive(Error, Debug)]
pub enum TableError {
    #[error("More than {} distinct uids and gids", u16::MAX)]
    TooManyIds,
    #[error("Extended attribute {0:?} has an unsupported prefix")]
    UnsupportedXattr(Box<OsStr>),
    #[error("Extended attribute {0:?} is too large")]
    XattrTooLarge(Box<OsStr>),
    #[error("Failed to compress a table")]
    Compress(#[from] CompressError),
    #[error("Failed to write a table")]
    Io(#[from] std::io::Error),
}

/// Maps uids and gids to indices into the id table.
#[derive(Debug, Default)]
pub struct IdTable {
    ids: Vec<u32>,
    index: HashMap<u32, u16>,
}

impl IdTable {
    pub fn get_or_insert(&mut self, id: u32) -> Result<u16, TableError> {
        if let Some(index) = self.index.get(&id) {
            return Ok(*index);
        }
        let index = u16::try_from(self.ids.len())
            .ok()
            .filter(|i| *i < u16::MAX)
            .ok_or(TableError::TooManyIds)?;
        self.ids.push(id);
        self.index.insert(id, index);
        Ok(index)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub type XattrSet = BTreeMap<Box<OsStr>, Box<[u8]>>;

/// Maps distinct xattr sets to indices into the xattr id table.
#[derive(Debug, Default)]
pub struct XattrTable {
    sets: Vec<XattrSet>,
    index: HashMap<XattrSet, u32>,
}

impl XattrTable {
    /// Registers a set, returning `None` for an empty one.
    pub fn get_or_insert(&mut self, set: &XattrSet) -> Result<Option<u32>, TableError> {
        if set.is_empty() {
            return Ok(None);
        }
        if let Some(index) = self.index.get(set) {
            return Ok(Some(*index));
        }

        for (key, value) in set {
            if xattr_prefix(key.as_bytes()).is_none() {
                return Err(TableError::UnsupportedXattr(key.clone()));
            }
            if key.len() > u16::MAX as usize || value.len() > u32::MAX as usize {
                return Err(TableError::XattrTooLarge(key.clone()));
            }
        }

        let index = self.sets.len() as u32;
        self.sets.push(set.clone());
        self.index.insert(set.clone(), index);
        Ok(Some(index))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Writes a table of fixed-size entries as metadata blocks followed by the list of their
/// absolute offsets.  Returns the offset of that list, which is what the superblock stores,
/// and the position after it.
pub fn write_lookup_table(
    output: &mut impl Write,
    start: u64,
    entries: &[u8],
    compressor: &dyn Compressor,
    store_uncompressed: bool,
) -> Result<(u64, u64), TableError> {
    let mut writer = MetaWriter::new(compressor, store_uncompressed);
    writer.append(entries)?;
    let (blocks, offsets) = writer.finish_with_index()?;
    output.write_all(&blocks)?;

    let list_start = start + blocks.len() as u64;
    for offset in &offsets {
        output.write_all(&(start + offset).to_le_bytes())?;
    }
    trace!(
        "lookup table of {} bytes in {} blocks at {start:#x}",
        entries.len(),
        offsets.len()
    );
    Ok((list_start, list_start + 8 * offsets.len() as u64))
}

/// Writes the xattr key/value table, the xattr id table and its header.  Returns the offset
/// of the header and the position after it.
pub fn write_xattr_table(
    output: &mut impl Write,
    start: u64,
    table: &XattrTable,
    compressor: &dyn Compressor,
    store_uncompressed: bool,
) -> Result<(u64, u64), TableError> {
    let mut kv = MetaWriter::new(compressor, store_uncompressed);
    let mut ids = Vec::with_capacity(table.sets.len() * size_of::<XattrId>());

    for set in &table.sets {
        let mut first = None;
        let mut size = 0u32;
        for (key, value) in set {
            let key = key.as_bytes();
            let (kind, suffix) =
                xattr_prefix(key).ok_or_else(|| TableError::UnsupportedXattr(OsStr::from_bytes(key).into()))?;

            let mut record = XattrKey {
                kind: kind.into(),
                name_size: (suffix.len() as u16).into(),
            }
            .as_bytes()
            .to_vec();
            record.extend_from_slice(suffix);
            record.extend_from_slice(
                XattrValue {
                    size: (value.len() as u32).into(),
                }
                .as_bytes(),
            );
            record.extend_from_slice(value);

            let reference = kv.append(&record)?;
            first.get_or_insert(reference);
            size = size.saturating_add((key.len() + 1 + value.len()) as u32);
        }

        let entry = XattrId {
            xattr_ref: first.unwrap_or_default().to_raw().into(),
            count: (set.len() as u32).into(),
            size: size.into(),
        };
        ids.extend_from_slice(entry.as_bytes());
    }

    let kv = kv.finish()?;
    output.write_all(&kv)?;

    let ids_start = start + kv.len() as u64;
    let mut writer = MetaWriter::new(compressor, store_uncompressed);
    writer.append(&ids)?;
    let (blocks, offsets) = writer.finish_with_index()?;
    output.write_all(&blocks)?;

    let header_start = ids_start + blocks.len() as u64;
    let header = XattrIdTable {
        kv_start: start.into(),
        count: (table.sets.len() as u32).into(),
        unused: 0.into(),
    };
    output.write_all(header.as_bytes())?;
    for offset in &offsets {
        output.write_all(&(ids_start + offset).to_le_bytes())?;
    }

    let end = header_start + size_of::<XattrIdTable>() as u64 + 8 * offsets.len() as u64;
    Ok((header_start, end))
}
