use std::{
    cell::RefCell,
    collections::BTreeMap,
    ffi::OsStr,
    fs,
    io::{Cursor, Read, Seek, SeekFrom, Write},
    path::Path,
    process::Command,
    rc::Rc,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use similar_asserts::assert_eq;
use tempfile::NamedTempFile;

use sqfs::{
    compress::{CompressorConfig, CompressorId, CompressorRegistry},
    listing::write_listing,
    squashfs::{
        reader::{self, Image},
        writer::{mkfs_image, write_image, ImageSummary, WriterOptions},
    },
    tree::{Directory, FileSource, FileSystem, Inode, Leaf, LeafContent, Stat},
};

fn stat(mode: u32) -> Stat {
    Stat {
        st_mode: mode,
        st_uid: 0,
        st_gid: 0,
        st_mtim_sec: 0,
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

fn add_leaf(dir: &mut Directory, name: impl AsRef<OsStr>, content: LeafContent) {
    dir.insert(
        name.as_ref(),
        Inode::Leaf(Rc::new(Leaf {
            content,
            stat: stat(0o644),
        })),
    );
}

fn add_file(dir: &mut Directory, name: impl AsRef<OsStr>, data: &[u8]) {
    add_leaf(dir, name, LeafContent::Regular(FileSource::from(data)));
}

/// Deterministic, poorly compressible content.
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random()).collect()
}

fn empty(_fs: &mut FileSystem) {}

fn simple(fs: &mut FileSystem) {
    add_leaf(&mut fs.root, "fifo", LeafContent::Fifo);
    add_file(&mut fs.root, "regular-small", b"hihi");
    add_file(&mut fs.root, "regular-large", &noise(1, 10000));
    add_file(&mut fs.root, "regular-empty", b"");
    add_leaf(
        &mut fs.root,
        "chrdev",
        LeafContent::CharacterDevice(rustix::fs::makedev(1, 3)),
    );
    add_leaf(
        &mut fs.root,
        "blkdev",
        LeafContent::BlockDevice(rustix::fs::makedev(8, 0)),
    );
    add_leaf(&mut fs.root, "socket", LeafContent::Socket);
    add_leaf(
        &mut fs.root,
        "symlink",
        LeafContent::Symlink(OsStr::new("/target").into()),
    );
}

fn nested(fs: &mut FileSystem) {
    let mut inner = Directory::new(stat(0o700));
    add_file(&mut inner, "zeros", &[0; 3 * 4096 + 10]);
    let shared = Rc::new(Leaf {
        content: LeafContent::Regular(FileSource::from(&b"linked"[..])),
        stat: stat(0o600),
    });
    inner.insert(OsStr::new("one"), Inode::Leaf(Rc::clone(&shared)));

    let mut outer = Directory::new(stat(0o755));
    outer.insert(OsStr::new("inner"), Inode::Directory(Box::new(inner)));
    for i in 0..300 {
        add_file(&mut outer, format!("file{i:03}"), format!("{i}").as_bytes());
    }
    fs.root
        .insert(OsStr::new("outer"), Inode::Directory(Box::new(outer)));
    fs.root.insert(OsStr::new("two"), Inode::Leaf(shared));
}

const CASES: [fn(&mut FileSystem); 3] = [empty, simple, nested];

fn foreach_case(f: impl Fn(&FileSystem)) {
    for case in CASES {
        let mut fs = FileSystem::new(stat(0o755));
        case(&mut fs);
        f(&fs);
    }
}

fn write(fs: &FileSystem, options: &WriterOptions) -> (Vec<u8>, ImageSummary) {
    let mut output = Cursor::new(vec![]);
    let summary = write_image(fs, &mut output, options, &CompressorRegistry::with_defaults())
        .unwrap();
    (output.into_inner(), summary)
}

/// A listing of the tree followed by the content of every regular file.
fn describe_image(bytes: &[u8]) -> String {
    let image = Image::open(bytes, &CompressorRegistry::with_defaults()).unwrap();
    let fs = image.read_tree().unwrap();

    let mut out = vec![];
    write_listing(&mut out, &fs, Path::new("/")).unwrap();
    describe_contents(&image, &fs.root, "", &mut out);
    String::from_utf8(out).unwrap()
}

fn describe_contents(image: &Image, dir: &reader::Directory, path: &str, out: &mut Vec<u8>) {
    for (name, inode) in dir.sorted_entries() {
        let path = format!("{path}/{}", name.to_str().unwrap());
        match inode {
            reader::Inode::Directory(dir) => describe_contents(image, dir, &path, out),
            reader::Inode::Leaf(leaf) => {
                if let reader::LeafContent::Regular(layout) = &leaf.content {
                    let data = image.read_file(layout).unwrap();
                    writeln!(out, "{path}: {}", summarize(&data)).unwrap();
                }
            }
        }
    }
}

fn summarize(data: &[u8]) -> String {
    format!("{} bytes, sum {}", data.len(), data.iter().map(|b| *b as u64).sum::<u64>())
}

/// The same description, computed from the tree that was written.
fn describe_tree(fs: &FileSystem) -> String {
    fn contents(dir: &Directory, path: &str, out: &mut Vec<u8>) {
        for (name, inode) in dir.sorted_entries() {
            let path = format!("{path}/{}", name.to_str().unwrap());
            match inode {
                Inode::Directory(dir) => contents(dir, &path, out),
                Inode::Leaf(leaf) => {
                    if let LeafContent::Regular(FileSource::Bytes(data)) = &leaf.content {
                        writeln!(out, "{path}: {}", summarize(data)).unwrap();
                    }
                }
            }
        }
    }
    let mut out = vec![];
    contents(&fs.root, "", &mut out);
    String::from_utf8(out).unwrap()
}

#[test]
fn test_roundtrip() {
    foreach_case(|fs| {
        let image = mkfs_image(fs, &options()).unwrap();
        assert!(describe_image(&image).ends_with(&describe_tree(fs)));
    });
}

#[test]
fn test_simple_listing() {
    let mut fs = FileSystem::new(stat(0o755));
    simple(&mut fs);
    let image = mkfs_image(&fs, &options()).unwrap();
    let image = Image::open(&image, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();
    let mut out = vec![];
    write_listing(&mut out, &read, Path::new("/")).unwrap();

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "drwxr-xr-x 0/0 8 1970-01-01 00:00 /\n\
         brw-r--r-- 0/0 8,0 1970-01-01 00:00 /blkdev\n\
         crw-r--r-- 0/0 1,3 1970-01-01 00:00 /chrdev\n\
         prw-r--r-- 0/0 0 1970-01-01 00:00 /fifo\n\
         -rw-r--r-- 0/0 0 1970-01-01 00:00 /regular-empty\n\
         -rw-r--r-- 0/0 10000 1970-01-01 00:00 /regular-large\n\
         -rw-r--r-- 0/0 4 1970-01-01 00:00 /regular-small\n\
         srw-r--r-- 0/0 0 1970-01-01 00:00 /socket\n\
         lrw-r--r-- 0/0 7 1970-01-01 00:00 /symlink -> /target\n"
    );
}

#[test]
fn test_hardlinks_survive() {
    let mut fs = FileSystem::new(stat(0o755));
    nested(&mut fs);
    let image = mkfs_image(&fs, &options()).unwrap();
    let image = Image::open(&image, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();

    let two = read.root.ref_leaf(OsStr::new("two")).unwrap();
    let one = read
        .root
        .get_directory(OsStr::new("outer/inner"))
        .unwrap()
        .ref_leaf(OsStr::new("one"))
        .unwrap();
    assert!(Rc::ptr_eq(&one, &two));
}

#[test]
fn test_deterministic() {
    foreach_case(|fs| {
        let (single, _) = write(fs, &options());
        let (again, _) = write(fs, &options());
        let (threaded, _) = write(
            fs,
            &WriterOptions {
                workers: 4,
                ..options()
            },
        );
        assert!(single == again, "two builds differ");
        assert!(single == threaded, "threaded build differs");
    });
}

#[test]
fn test_zstd() {
    foreach_case(|fs| {
        let options = WriterOptions {
            compressor: CompressorConfig {
                id: CompressorId::Zstd,
                level: Some(19),
            },
            ..options()
        };
        let (image, _) = write(fs, &options);
        assert!(describe_image(&image).ends_with(&describe_tree(fs)));
    });
}

#[test]
fn test_dedup() {
    let data = noise(2, 3 * 4096);
    let mut fs = FileSystem::new(stat(0o755));
    add_file(&mut fs.root, "a", &data);
    add_file(&mut fs.root, "b", &data);

    let (bytes, summary) = write(&fs, &options());
    assert_eq!(summary.data.blocks_written, 3);
    assert_eq!(summary.data.duplicate_blocks, 3);

    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();
    let a = read.root.get_file(OsStr::new("a")).unwrap();
    let b = read.root.get_file(OsStr::new("b")).unwrap();
    assert_eq!(a.blocks_start, b.blocks_start);
    assert_eq!(image.read_file(b).unwrap(), data);

    let (_, summary) = write(
        &fs,
        &WriterOptions {
            deduplicate: false,
            ..options()
        },
    );
    assert_eq!(summary.data.blocks_written, 6);
    assert_eq!(summary.data.duplicate_blocks, 0);
}

#[test]
fn test_dedup_without_tail_packing() {
    let data = noise(6, 2 * 4096 + 100);
    let mut fs = FileSystem::new(stat(0o755));
    add_file(&mut fs.root, "a", &data);
    add_file(&mut fs.root, "b", &data);
    let options = WriterOptions {
        tail_packing: false,
        ..options()
    };

    let (bytes, summary) = write(&fs, &options);
    assert_eq!(summary.fragment_count, 0);
    assert_eq!(summary.data.blocks_written, 3);
    assert_eq!(summary.data.duplicate_blocks, 3);

    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();
    let a = read.root.get_file(OsStr::new("a")).unwrap();
    let b = read.root.get_file(OsStr::new("b")).unwrap();
    assert_eq!(a.blocks_start, b.blocks_start);
    assert_eq!(a.block_sizes.len(), 3);
    assert_eq!(image.read_file(b).unwrap(), data);

    // the second copy costs no data at all
    let mut single = FileSystem::new(stat(0o755));
    add_file(&mut single.root, "a", &data);
    let (_, alone) = write(&single, &options);
    assert_eq!(alone.data.blocks_written, summary.data.blocks_written);
}

#[test]
fn test_file_output() {
    let data = noise(7, 3 * 4096);
    let mut fs = FileSystem::new(stat(0o755));
    add_file(&mut fs.root, "a", &data);
    add_file(&mut fs.root, "b", &data);

    let mut file = tempfile::tempfile().unwrap();
    let summary =
        write_image(&fs, &mut file, &options(), &CompressorRegistry::with_defaults()).unwrap();
    assert_eq!(summary.data.duplicate_blocks, 3);

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut bytes = vec![];
    file.read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes.len() as u64, summary.bytes_used.next_multiple_of(4096));
    assert_eq!(bytes, mkfs_image(&fs, &options()).unwrap().to_vec());

    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();
    let b = read.root.get_file(OsStr::new("b")).unwrap();
    assert_eq!(image.read_file(b).unwrap(), data);
}

#[test]
fn test_tail_packing() {
    let mut fs = FileSystem::new(stat(0o755));
    add_file(&mut fs.root, "a", &noise(3, 4096 + 100));
    add_file(&mut fs.root, "b", &noise(4, 200));

    let (bytes, summary) = write(&fs, &options());
    assert_eq!(summary.fragment_count, 1);
    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();
    let a = read.root.get_file(OsStr::new("a")).unwrap();
    let b = read.root.get_file(OsStr::new("b")).unwrap();
    let (fa, fb) = (a.fragment.unwrap(), b.fragment.unwrap());
    assert_eq!(fa.index, fb.index);
    assert_ne!(fa.offset, fb.offset);
    assert_eq!(image.read_file(a).unwrap(), noise(3, 4096 + 100));

    let (bytes, summary) = write(
        &fs,
        &WriterOptions {
            tail_packing: false,
            ..options()
        },
    );
    assert_eq!(summary.fragment_count, 0);
    assert_eq!(summary.data.tail_blocks, 2);
    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();
    let a = read.root.get_file(OsStr::new("a")).unwrap();
    let b = read.root.get_file(OsStr::new("b")).unwrap();
    assert_eq!((a.fragment, b.fragment), (None, None));
    assert_eq!(a.block_sizes.len(), 2);
    assert_eq!(b.block_sizes.len(), 1);
    assert_eq!(image.read_file(b).unwrap(), noise(4, 200));
}

#[test]
fn test_sibling_order() {
    let mut fs = FileSystem::new(stat(0o755));
    for name in ["b", "a", "c"] {
        add_file(&mut fs.root, name, name.as_bytes());
    }
    let bytes = mkfs_image(&fs, &options()).unwrap();
    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();

    let listing = image.directory(&image.root_inode().unwrap()).unwrap();
    let names: Vec<_> = listing
        .iter()
        .map(|e| String::from_utf8_lossy(&e.name).into_owned())
        .collect();
    assert_eq!(names, ["a", "b", "c"]);
}

#[test]
fn test_truncated() {
    let mut fs = FileSystem::new(stat(0o755));
    nested(&mut fs);
    simple(&mut fs);
    let bytes = mkfs_image(&fs, &options()).unwrap();
    let registry = CompressorRegistry::with_defaults();

    for len in [0, 95, 96, 97, 500, bytes.len() / 2, bytes.len() - 4097] {
        let result = Image::open(&bytes[..len], &registry).and_then(|image| {
            let fs = image.read_tree()?;
            let layout = fs.root.get_file(OsStr::new("regular-large"))?;
            image.read_file(layout)
        });
        assert!(result.is_err(), "truncated to {len} bytes");
    }
}

#[test]
fn test_corruption_never_panics() {
    let mut fs = FileSystem::new(stat(0o755));
    nested(&mut fs);
    simple(&mut fs);
    let bytes = mkfs_image(&fs, &options()).unwrap();
    let registry = CompressorRegistry::with_defaults();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..200 {
        let mut corrupt = bytes.to_vec();
        for _ in 0..rng.random_range(1..8) {
            let at = rng.random_range(0..corrupt.len());
            corrupt[at] = rng.random();
        }
        // errors are fine, panics and hangs are not
        if let Ok(image) = Image::open(&corrupt, &registry) {
            if let Ok(fs) = image.read_tree() {
                fs.root.inodes().for_each(|_| ());
                if let Ok(layout) = fs.root.get_file(OsStr::new("regular-large")) {
                    let _ = image.read_file(layout);
                }
            }
        }
    }
}

#[test_with::executable(unsquashfs)]
fn test_unsquashfs() {
    let mut fs = FileSystem::new(stat(0o755));
    add_file(&mut fs.root, "small", b"hihi");
    add_file(&mut fs.root, "large", &noise(5, 10000));
    let mut dir = Directory::new(stat(0o755));
    add_file(&mut dir, "zeros", &[0; 9000]);
    fs.root.insert(OsStr::new("dir"), Inode::Directory(Box::new(dir)));

    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&mkfs_image(&fs, &options()).unwrap()).unwrap();
    let td = tempfile::tempdir().unwrap();
    let target = td.path().join("out");

    let status = Command::new("unsquashfs")
        .arg("-no-progress")
        .arg("-d")
        .arg(&target)
        .arg(tmp.path())
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(fs::read(target.join("small")).unwrap(), b"hihi");
    assert_eq!(fs::read(target.join("large")).unwrap(), noise(5, 10000));
    assert_eq!(fs::read(target.join("dir/zeros")).unwrap(), vec![0; 9000]);
}
