//! Directory listings.
//!
//! A listing is a sequence of runs.  Each run starts with a [`DirectoryHeader`] naming the
//! metadata block that holds the inodes of its entries and a base inode number; the entries
//! then only store the offset within that block and a signed delta to the base.

use zerocopy::IntoBytes;

use super::{
    format::{
        DirectoryEntry, DirectoryHeader, FormatError, InodeType, DIR_MAX_RUN, MAX_NAME_LEN,
    },
    meta::{MetaCursor, MetaRef},
    reader::ReaderError,
};

/// One child as stored in its parent's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry<N> {
    pub name: N,
    pub inode_ref: MetaRef,
    pub inode_number: u32,
    /// Always the basic variant.
    pub inode_type: InodeType,
}

struct Run {
    start: u64,
    base: u32,
    count: usize,
}

impl Run {
    fn fits<N>(&self, entry: &ListingEntry<N>) -> bool {
        let delta = entry.inode_number as i64 - self.base as i64;
        self.count < DIR_MAX_RUN
            && entry.inode_ref.block == self.start
            && i16::try_from(delta).is_ok()
    }
}

/// Encodes the listing of one directory.  `entries` must be sorted by name.
pub fn encode_listing<N: AsRef<[u8]>>(entries: &[ListingEntry<N>]) -> Result<Vec<u8>, FormatError> {
    let mut out = vec![];
    let mut run_starts: Vec<(usize, Run)> = vec![];

    for entry in entries {
        let name = entry.name.as_ref();
        if run_starts.last().is_none_or(|(_, run)| !run.fits(entry)) {
            let start = u32::try_from(entry.inode_ref.block)
                .map_err(|_| FormatError::Overflow("inode table"))?;
            let header = DirectoryHeader {
                count: 0.into(),
                start: start.into(),
                inode_number: entry.inode_number.into(),
            };
            run_starts.push((
                out.len(),
                Run {
                    start: entry.inode_ref.block,
                    base: entry.inode_number,
                    count: 0,
                },
            ));
            out.extend_from_slice(header.as_bytes());
        }

        let last = run_starts.len() - 1;
        let run = &mut run_starts[last].1;
        let delta = (entry.inode_number as i64 - run.base as i64) as i16;
        run.count += 1;

        let record = DirectoryEntry {
            offset: entry.inode_ref.offset.into(),
            inode_offset: delta.into(),
            inode_type: entry.inode_type.basic().into(),
            name_size: ((name.len() - 1) as u16).into(),
        };
        out.extend_from_slice(record.as_bytes());
        out.extend_from_slice(name);
    }

    // patch in the final entry counts
    for (position, run) in run_starts {
        let count = (run.count as u32 - 1).to_le_bytes();
        out[position..position + 4].copy_from_slice(&count);
    }
    Ok(out)
}

fn valid_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.contains(&b'/')
        && name != b"."
        && name != b".."
}

/// Decodes a listing of `len` bytes starting at the cursor.
///
/// Names are checked for validity and must be strictly ascending, which also rejects duplicates.
pub fn decode_listing(
    cursor: &mut MetaCursor,
    len: u32,
) -> Result<Vec<ListingEntry<Box<[u8]>>>, ReaderError> {
    let table = cursor.table();
    let corrupt = |detail: String| ReaderError::corrupt(table, detail);

    let mut entries: Vec<ListingEntry<Box<[u8]>>> = vec![];
    let mut consumed = 0usize;
    let len = len as usize;

    while consumed < len {
        if len - consumed < size_of::<DirectoryHeader>() {
            return Err(corrupt(format!("{} stray bytes after listing", len - consumed)));
        }
        let header: DirectoryHeader = cursor.read()?;
        consumed += size_of::<DirectoryHeader>();
        let count = header.count.get() as usize + 1;
        if count > DIR_MAX_RUN {
            return Err(corrupt(format!("directory run of {count} entries")));
        }

        for _ in 0..count {
            if len - consumed < size_of::<DirectoryEntry>() {
                return Err(corrupt("listing shorter than its runs".into()));
            }
            let entry: DirectoryEntry = cursor.read()?;
            consumed += size_of::<DirectoryEntry>();

            let name_len = entry.name_size.get() as usize + 1;
            if name_len > MAX_NAME_LEN || name_len > len - consumed {
                return Err(corrupt(format!("directory entry name of {name_len} bytes")));
            }
            let name = cursor.read_vec(name_len)?.into_boxed_slice();
            consumed += name_len;

            if !valid_name(&name) {
                return Err(corrupt(format!("invalid name {:?}", name.escape_ascii().to_string())));
            }
            if let Some(prev) = entries.last() {
                if prev.name >= name {
                    return Err(corrupt(format!(
                        "name {:?} is duplicate or out of order",
                        name.escape_ascii().to_string()
                    )));
                }
            }

            let inode_type = InodeType::try_from(entry.inode_type.get())
                .ok()
                .filter(|t| !t.is_extended())
                .ok_or_else(|| {
                    corrupt(format!("entry type {}", entry.inode_type.get()))
                })?;
            let inode_number = header.inode_number.get() as i64 + entry.inode_offset.get() as i64;
            let inode_number = u32::try_from(inode_number)
                .ok()
                .filter(|n| *n != 0)
                .ok_or_else(|| corrupt(format!("inode number {inode_number}")))?;

            entries.push(ListingEntry {
                name,
                inode_ref: MetaRef::new(header.start.get() as u64, entry.offset.get()),
                inode_number,
                inode_type,
            });
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use crate::{
        compress::{Compressor, CompressorConfig, CompressorRegistry},
        squashfs::meta::{MetaTable, MetaWriter},
    };

    fn entry(name: &str, block: u64, offset: u16, inode_number: u32) -> ListingEntry<Vec<u8>> {
        ListingEntry {
            name: name.as_bytes().to_vec(),
            inode_ref: MetaRef::new(block, offset),
            inode_number,
            inode_type: InodeType::RegularFile,
        }
    }

    fn decode_bytes(listing: &[u8]) -> Result<Vec<ListingEntry<Box<[u8]>>>, ReaderError> {
        let compressor: Rc<dyn Compressor> = Rc::from(
            CompressorRegistry::with_defaults()
                .create(&CompressorConfig::default())
                .unwrap(),
        );
        let mut writer = MetaWriter::new(&*compressor, false);
        writer.append(listing).unwrap();
        let table = writer.finish().unwrap();
        let reader = MetaTable::new("directory table", &table, Rc::clone(&compressor));
        decode_listing(&mut reader.cursor(MetaRef::default()), listing.len() as u32)
    }

    #[test]
    fn runs_split_on_block_and_count() {
        let mut entries: Vec<_> = (0..300)
            .map(|i| entry(&format!("f{i:04}"), 0, i as u16 * 32, 10 + i))
            .collect();
        entries.push(entry("g", 8000, 0, 400));
        entries.push(entry("h", 8000, 32, 401));
        // delta out of i16 range
        entries.push(entry("i", 8000, 64, 100_000));

        let listing = encode_listing(&entries).unwrap();
        let headers = 4;
        let names: usize = entries.iter().map(|e| e.name.len()).sum();
        assert_eq!(listing.len(), headers * 12 + entries.len() * 8 + names);
        assert_eq!(&listing[..4], &255u32.to_le_bytes());

        let decoded = decode_bytes(&listing).unwrap();
        assert_eq!(decoded.len(), entries.len());
        for (a, b) in entries.iter().zip(&decoded) {
            assert_eq!(a.name, &*b.name);
            assert_eq!(a.inode_ref, b.inode_ref);
            assert_eq!(a.inode_number, b.inode_number);
            assert_eq!(b.inode_type, InodeType::RegularFile);
        }
    }

    #[test]
    fn empty_listing() {
        let entries: Vec<ListingEntry<Vec<u8>>> = vec![];
        assert!(encode_listing(&entries).unwrap().is_empty());
        assert!(decode_bytes(&[]).unwrap().is_empty());
    }

    #[test]
    fn bad_listings_are_rejected() {
        let dup = encode_listing(&[entry("a", 0, 0, 1), entry("a", 0, 32, 2)]).unwrap();
        assert!(matches!(decode_bytes(&dup), Err(ReaderError::Corrupt { .. })));

        let unsorted = encode_listing(&[entry("b", 0, 0, 1), entry("a", 0, 32, 2)]).unwrap();
        assert!(decode_bytes(&unsorted).is_err());

        let dotdot = encode_listing(&[entry("..", 0, 0, 1)]).unwrap();
        assert!(decode_bytes(&dotdot).is_err());

        let slash = encode_listing(&[entry("a/b", 0, 0, 1)]).unwrap();
        assert!(decode_bytes(&slash).is_err());

        let good = encode_listing(&[entry("a", 0, 0, 1), entry("b", 0, 32, 2)]).unwrap();
        // claims more bytes than the runs contain
        let mut padded = good.clone();
        padded.extend_from_slice(&[0; 5]);
        assert!(decode_bytes(&padded).is_err());
        // name runs past the listing
        let compressor: Rc<dyn Compressor> = Rc::from(
            CompressorRegistry::with_defaults()
                .create(&CompressorConfig::default())
                .unwrap(),
        );
        let mut writer = MetaWriter::new(&*compressor, false);
        writer.append(&good).unwrap();
        let table = writer.finish().unwrap();
        let reader = MetaTable::new("directory table", &table, Rc::clone(&compressor));
        let short = decode_listing(&mut reader.cursor(MetaRef::default()), good.len() as u32 - 1);
        assert!(short.is_err());
    }
}
