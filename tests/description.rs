use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use similar_asserts::assert_eq;

use sqfs::{
    builder::{build, BuildOptions, ScanError},
    compress::CompressorRegistry,
    hooks::XATTR_SECURITY_SELINUX,
    source::{DescriptionError, DescriptionSource},
    squashfs::{
        reader::{Image, LeafContent},
        writer::{mkfs_image, WriterOptions},
    },
};

const DESCRIPTION: &str = r#"
# a small system
dir / 0755 0 0
dir etc 0755 0 0
file etc/hostname 0644 0 0
file etc/motd 0644 0 0 motd.txt
slink etc/localtime 0777 0 0 /usr/share/zoneinfo/UTC
link etc/name etc/hostname
dir dev 0755 0 0
nod dev/null 0666 0 0 c 1 3
pipe run/initctl 0600 0 0
sock run/socket 0600 0 0
file "with space" 0600 1000 1000 motd.txt
"#;

fn setup(dir: &Path) {
    fs::create_dir(dir.join("etc")).unwrap();
    fs::write(dir.join("etc/hostname"), b"box\n").unwrap();
    fs::write(dir.join("motd.txt"), b"welcome\n").unwrap();
    fs::write(dir.join("desc"), DESCRIPTION).unwrap();
}

fn options() -> WriterOptions {
    WriterOptions {
        block_size: 4096,
        workers: 1,
        ..Default::default()
    }
}

#[test]
fn description_roundtrip() {
    let td = tempfile::tempdir().unwrap();
    setup(td.path());

    let mut source = DescriptionSource::load(&td.path().join("desc"), td.path(), 1234).unwrap();
    let fs = build(&mut source, &mut [], 1234).unwrap();
    let bytes = mkfs_image(&fs, &options()).unwrap();

    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();
    assert_eq!(image.superblock_info().modification_time, 1234);
    let read = image.read_tree().unwrap();

    let etc = read.root.get_directory(OsStr::new("etc")).unwrap();
    let hostname = etc.get_file(OsStr::new("hostname")).unwrap();
    assert_eq!(image.read_file(hostname).unwrap(), b"box\n");
    let motd = etc.get_file(OsStr::new("motd")).unwrap();
    assert_eq!(image.read_file(motd).unwrap(), b"welcome\n");

    let name = etc.ref_leaf(OsStr::new("name")).unwrap();
    assert!(std::rc::Rc::ptr_eq(
        &name,
        &etc.ref_leaf(OsStr::new("hostname")).unwrap()
    ));

    let localtime = etc.ref_leaf(OsStr::new("localtime")).unwrap();
    assert!(matches!(
        &localtime.content,
        LeafContent::Symlink(target) if &**target == OsStr::new("/usr/share/zoneinfo/UTC")
    ));

    let null = read
        .root
        .get_directory(OsStr::new("dev"))
        .unwrap()
        .ref_leaf(OsStr::new("null"))
        .unwrap();
    assert!(matches!(
        null.content,
        LeafContent::CharacterDevice(rdev) if rdev == rustix::fs::makedev(1, 3)
    ));
    assert_eq!(null.stat.st_mode, 0o666);

    // implied by run/initctl, never described
    let run = read.root.get_directory(OsStr::new("run")).unwrap();
    assert_eq!(run.stat.st_mode, 0o755);
    assert_eq!(run.len(), 2);

    let spaced = read.root.ref_leaf(OsStr::new("with space")).unwrap();
    assert_eq!((spaced.stat.st_uid, spaced.stat.st_gid), (1000, 1000));
}

#[test]
fn description_errors_have_line_numbers() {
    let td = tempfile::tempdir().unwrap();
    setup(td.path());

    let err = DescriptionSource::parse("dir a 0755 0 0\nfile b 0644 0 0 missing\n", td.path(), 0)
        .unwrap_err();
    assert!(matches!(err, DescriptionError::Location { line: 2, .. }));

    let err = DescriptionSource::parse("\n\nfrob x 0 0 0\n", td.path(), 0).unwrap_err();
    assert!(matches!(err, DescriptionError::Parse { line: 3, .. }));
}

#[test]
fn hooks_relabel_and_add_xattrs() {
    let td = tempfile::tempdir().unwrap();
    setup(td.path());
    fs::write(
        td.path().join("xattrs"),
        "# file: etc/hostname\nuser.origin=\"description\"\nuser.raw=0x0102\n",
    )
    .unwrap();
    fs::write(
        td.path().join("contexts"),
        "/.*        system_u:object_r:default_t:s0\n\
         /etc(/.*)? system_u:object_r:etc_t:s0\n\
         /dev/null  -c system_u:object_r:null_device_t:s0\n",
    )
    .unwrap();

    let options = BuildOptions {
        force_uid: Some(7),
        exclude: vec!["/run(/.*)?".into()],
        xattr_map: Some(td.path().join("xattrs")),
        selinux: Some(td.path().join("contexts")),
        ..Default::default()
    };
    let mut hooks = options.hooks().unwrap();
    let mut source = DescriptionSource::load(&td.path().join("desc"), td.path(), 0).unwrap();
    let fs = build(&mut source, &mut hooks, 0).unwrap();
    let bytes = mkfs_image(&fs, &self::options()).unwrap();

    let image = Image::open(&bytes, &CompressorRegistry::with_defaults()).unwrap();
    let read = image.read_tree().unwrap();
    assert!(read.root.lookup(OsStr::new("run")).is_none());

    let label = |stat: &sqfs::generic_tree::Stat| {
        stat.xattrs
            .borrow()
            .get(OsStr::new(XATTR_SECURITY_SELINUX))
            .map(|v| String::from_utf8(v.to_vec()).unwrap())
    };

    let etc = read.root.get_directory(OsStr::new("etc")).unwrap();
    assert_eq!(etc.stat.st_uid, 7);
    assert_eq!(label(&etc.stat).as_deref(), Some("system_u:object_r:etc_t:s0"));

    let hostname = etc.ref_leaf(OsStr::new("hostname")).unwrap();
    let xattrs = hostname.stat.xattrs.borrow();
    assert_eq!(&**xattrs.get(OsStr::new("user.origin")).unwrap(), b"description");
    assert_eq!(&**xattrs.get(OsStr::new("user.raw")).unwrap(), &[1, 2]);
    drop(xattrs);

    let null = read
        .root
        .get_directory(OsStr::new("dev"))
        .unwrap()
        .ref_leaf(OsStr::new("null"))
        .unwrap();
    assert_eq!(
        label(&null.stat).as_deref(),
        Some("system_u:object_r:null_device_t:s0")
    );
    assert_eq!(
        label(&read.root.stat).as_deref(),
        Some("system_u:object_r:default_t:s0")
    );
}

#[test]
fn missing_link_target_is_reported() {
    let mut source =
        DescriptionSource::parse("pipe a 0600 0 0\nlink b c\n", Path::new("/"), 0).unwrap();
    let err = build(&mut source, &mut [], 0).unwrap_err();
    assert_eq!(err.path(), Some(Path::new("/b")));
    assert!(matches!(err, ScanError::Hardlink { ref target, .. } if target == Path::new("/c")));
}

fn run(program: &str, args: &[&OsStr]) -> Output {
    Command::new(program)
        .args(args)
        .env_remove("SOURCE_DATE_EPOCH")
        .output()
        .unwrap()
}

#[test]
fn command_line_tools() {
    let td = tempfile::tempdir().unwrap();
    setup(td.path());
    let image = td.path().join("image.sqfs");
    let gensqfs = env!("CARGO_BIN_EXE_gensqfs");
    let unsqfs = env!("CARGO_BIN_EXE_unsqfs");

    let output = run(
        gensqfs,
        &[
            OsStr::new("--description"),
            OsStr::new("--compressor=zstd"),
            OsStr::new("--block-size=4096"),
            OsStr::new("--mkfs-time=99"),
            td.path().join("desc").as_os_str(),
            image.as_os_str(),
        ],
    );
    assert!(output.status.success(), "{output:?}");

    let info = run(unsqfs, &[image.as_os_str(), OsStr::new("info")]);
    assert!(info.status.success());
    let info = String::from_utf8(info.stdout).unwrap();
    assert!(info.contains("compressor:        zstd\n"), "{info}");
    assert!(info.contains("modification time: 99\n"), "{info}");

    let cat = run(
        unsqfs,
        &[image.as_os_str(), OsStr::new("cat"), OsStr::new("/etc/motd")],
    );
    assert!(cat.status.success());
    assert_eq!(cat.stdout, b"welcome\n");

    let ls = run(
        unsqfs,
        &[image.as_os_str(), OsStr::new("ls"), OsStr::new("/etc")],
    );
    assert!(ls.status.success());
    assert_eq!(
        String::from_utf8(ls.stdout).unwrap(),
        "drwxr-xr-x 0/0 4 1970-01-01 00:00 /etc\n\
         -rw-r--r-- 0/0 4 1970-01-01 00:00 /etc/hostname\n\
         lrwxrwxrwx 0/0 23 1970-01-01 00:00 /etc/localtime -> /usr/share/zoneinfo/UTC\n\
         -rw-r--r-- 0/0 8 1970-01-01 00:00 /etc/motd\n\
         -rw-r--r-- 0/0 4 1970-01-01 00:00 /etc/name\n"
    );

    // failures exit non-zero and name the offending file
    fs::write(td.path().join("bad"), "file nope 0644 0 0\n").unwrap();
    let output = run(
        gensqfs,
        &[
            OsStr::new("--description"),
            td.path().join("bad").as_os_str(),
            td.path().join("bad.sqfs").as_os_str(),
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("nope"), "{stderr}");
    assert!(!td.path().join("bad.sqfs").exists());
}

#[test]
fn command_line_dedups_into_a_file() {
    let td = tempfile::tempdir().unwrap();
    let source = td.path().join("tree");
    fs::create_dir(&source).unwrap();
    let data: Vec<u8> = (0..3 * 4096u32).map(|i| (i * 7 % 251) as u8).collect();
    fs::write(source.join("a"), &data).unwrap();
    fs::write(source.join("b"), &data).unwrap();
    let image = td.path().join("image.sqfs");

    for packing in [None, Some("--no-tail-packing")] {
        let mut args = vec![OsStr::new("--block-size=4096")];
        args.extend(packing.map(OsStr::new));
        args.extend([source.as_os_str(), image.as_os_str()]);
        let output = run(env!("CARGO_BIN_EXE_gensqfs"), &args);
        assert!(output.status.success(), "{output:?}");
        let summary = String::from_utf8(output.stdout).unwrap();
        assert!(summary.contains("3 blocks, 3 duplicate"), "{summary}");

        let cat = run(
            env!("CARGO_BIN_EXE_unsqfs"),
            &[image.as_os_str(), OsStr::new("cat"), OsStr::new("/b")],
        );
        assert!(cat.status.success());
        assert_eq!(cat.stdout, data);
    }
}
