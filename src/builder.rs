//! Assembling a [`FileSystem`] from a [`DirectorySource`].

use std::{
    collections::HashSet,
    ffi::OsStr,
    path::{Component, Path, PathBuf},
    rc::Rc,
};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    generic_tree::validate_name,
    hooks::{apply_all, Exclude, ForceOwner, HookError, NodeHook, SecurityLabels, XattrMap},
    source::{DirEntry, DirEntryKind, DirSourceOptions, DirectorySource, SourceError},
    tree::{Directory, FileSystem, Inode, Leaf, LeafContent, Stat, TreeError},
};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to enumerate the source")]
    Source(#[from] SourceError),
    #[error("Failed to read the target of symlink {path:?}")]
    ReadLink {
        path: PathBuf,
        #[source]
        source: SourceError,
    },
    #[error("Failed to post-process {path:?}")]
    Hook {
        path: PathBuf,
        #[source]
        source: HookError,
    },
    #[error("Cannot add {path:?} to the tree")]
    Tree {
        path: PathBuf,
        #[source]
        source: TreeError,
    },
    #[error("Hard link {path:?} points at {target:?}, which is not a file in the tree")]
    Hardlink { path: PathBuf, target: PathBuf },
}

impl ScanError {
    /// The image path of the entry that failed, if known.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Source(e) => e.path(),
            Self::ReadLink { path, .. }
            | Self::Hook { path, .. }
            | Self::Tree { path, .. }
            | Self::Hardlink { path, .. } => Some(path),
        }
    }
}

/// How a tree is gathered and post-processed.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub force_uid: Option<u32>,
    pub force_gid: Option<u32>,
    /// Regular expressions over image paths (`/a/b`) of entries to leave out.
    pub exclude: Vec<String>,
    /// Read xattrs from a live source.
    pub xattrs: bool,
    pub one_file_system: bool,
    pub xattr_map: Option<PathBuf>,
    /// A file-contexts file to label the tree with.
    pub selinux: Option<PathBuf>,
    /// Modification time of directories that are implied by an entry but never described.
    pub default_mtime: i64,
}

impl BuildOptions {
    pub fn dir_source_options(&self) -> DirSourceOptions {
        DirSourceOptions {
            xattrs: self.xattrs,
            one_file_system: self.one_file_system,
        }
    }

    /// The post-processing chain these options ask for.
    pub fn hooks(&self) -> Result<Vec<Box<dyn NodeHook>>, HookError> {
        let mut hooks: Vec<Box<dyn NodeHook>> = vec![];
        if !self.exclude.is_empty() {
            hooks.push(Box::new(Exclude::new(&self.exclude)?));
        }
        if self.force_uid.is_some() || self.force_gid.is_some() {
            hooks.push(Box::new(ForceOwner {
                uid: self.force_uid,
                gid: self.force_gid,
            }));
        }
        if let Some(path) = &self.xattr_map {
            hooks.push(Box::new(XattrMap::load(path)?));
        }
        if let Some(path) = &self.selinux {
            hooks.push(Box::new(SecurityLabels::load(path)?));
        }
        Ok(hooks)
    }
}

fn implicit_stat(mtime: i64) -> Stat {
    Stat {
        st_mtim_sec: mtime,
        ..Stat::with_mode(0o755)
    }
}

/// Builds a tree entry by entry.
///
/// Entries may arrive in any order as long as hard link targets come before the links.
/// Parent directories that haven't been seen yet are created with default attributes and take
/// on the real ones if the directory shows up later.
pub struct TreeBuilder<'h> {
    fs: FileSystem,
    hooks: &'h mut [Box<dyn NodeHook>],
    default_mtime: i64,
    /// Directories that came from an entry rather than being implied.
    described: HashSet<PathBuf>,
    excluded: Vec<PathBuf>,
}

impl<'h> TreeBuilder<'h> {
    pub fn new(hooks: &'h mut [Box<dyn NodeHook>], default_mtime: i64) -> Self {
        Self {
            fs: FileSystem::new(implicit_stat(default_mtime)),
            hooks,
            default_mtime,
            described: HashSet::new(),
            excluded: vec![],
        }
    }

    /// Walks to the parent directory of `path`, creating missing directories on the way.
    fn parent_mut(&mut self, path: &Path) -> Result<&mut Directory, TreeError> {
        let mut dir = &mut self.fs.root;
        let Some(parent) = path.parent() else {
            return Ok(dir);
        };
        for component in parent.components() {
            let Component::Normal(name) = component else {
                return Err(TreeError::InvalidFilename(path.as_os_str().into()));
            };
            if dir.lookup(name).is_none() {
                validate_name(name)?;
                let implied = Directory::new(implicit_stat(self.default_mtime));
                dir.insert(name, Inode::Directory(Box::new(implied)));
            }
            dir = dir.get_directory_mut(name)?;
        }
        Ok(dir)
    }

    fn file_name(path: &Path) -> Result<&OsStr, TreeError> {
        path.file_name()
            .ok_or_else(|| TreeError::InvalidFilename(path.as_os_str().into()))
    }

    fn add_directory(&mut self, path: &Path, stat: Stat) -> Result<(), TreeError> {
        if !self.described.insert(path.to_path_buf()) {
            return Err(TreeError::AlreadyExists(path.as_os_str().into()));
        }
        if path.as_os_str().is_empty() {
            self.fs.set_root_stat(stat);
            return Ok(());
        }

        let name = Self::file_name(path)?;
        let parent = self.parent_mut(path)?;
        match parent.get_directory_mut(name) {
            Ok(implied) => {
                implied.stat = stat;
                Ok(())
            }
            Err(TreeError::NotFound(_)) => {
                parent.insert_new(name, Inode::Directory(Box::new(Directory::new(stat))))
            }
            Err(TreeError::NotADirectory(_)) => Err(TreeError::AlreadyExists(name.into())),
            Err(e) => Err(e),
        }
    }

    fn add_leaf(&mut self, path: &Path, leaf: Rc<Leaf>) -> Result<(), TreeError> {
        let name = Self::file_name(path)?;
        self.parent_mut(path)?.insert_new(name, Inode::Leaf(leaf))
    }

    fn find_leaf(&self, target: &Path) -> Option<Rc<Leaf>> {
        let (dir, name) = self.fs.root.split(target.as_os_str()).ok()?;
        dir.ref_leaf(name).ok()
    }

    /// Adds one entry, running the hooks on it first.
    pub fn add(
        &mut self,
        mut entry: DirEntry,
        source: &mut dyn DirectorySource,
    ) -> Result<(), ScanError> {
        let image_path = entry.image_path();
        if self.excluded.iter().any(|e| entry.path.starts_with(e)) {
            return Ok(());
        }

        let keep = apply_all(self.hooks, &mut entry).map_err(|source| ScanError::Hook {
            path: image_path.clone(),
            source,
        })?;
        if !keep {
            if entry.is_dir() {
                self.excluded.push(entry.path);
            }
            return Ok(());
        }

        let tree_error = |source| ScanError::Tree {
            path: image_path.clone(),
            source,
        };
        let content = match entry.kind {
            DirEntryKind::Directory => {
                return self
                    .add_directory(&entry.path, entry.stat)
                    .map_err(tree_error)
            }
            DirEntryKind::Hardlink(target) => {
                let leaf = self.find_leaf(&target).ok_or_else(|| ScanError::Hardlink {
                    path: image_path.clone(),
                    target: Path::new("/").join(&target),
                })?;
                trace!("{image_path:?} is a hard link to {target:?}");
                return self.add_leaf(&entry.path, leaf).map_err(tree_error);
            }
            DirEntryKind::Regular => LeafContent::Regular(source.open_file(&entry.path)?),
            DirEntryKind::Symlink => {
                let target = source.read_link().map_err(|source| ScanError::ReadLink {
                    path: image_path.clone(),
                    source,
                })?;
                LeafContent::Symlink(target)
            }
            DirEntryKind::BlockDevice(rdev) => LeafContent::BlockDevice(rdev),
            DirEntryKind::CharacterDevice(rdev) => LeafContent::CharacterDevice(rdev),
            DirEntryKind::Fifo => LeafContent::Fifo,
            DirEntryKind::Socket => LeafContent::Socket,
        };

        let leaf = Rc::new(Leaf {
            stat: entry.stat,
            content,
        });
        self.add_leaf(&entry.path, leaf).map_err(tree_error)
    }

    /// Consumes every entry of `source`.
    pub fn add_all(&mut self, source: &mut dyn DirectorySource) -> Result<(), ScanError> {
        let mut count = 0usize;
        while let Some(entry) = source.next_entry()? {
            self.add(entry, source)?;
            count += 1;
        }
        debug!("scanned {count} entries");
        Ok(())
    }

    /// Places another tree at `path` (see [`FileSystem::graft()`]).
    pub fn graft(&mut self, path: &Path, other: FileSystem) -> Result<(), ScanError> {
        self.fs
            .graft(path.as_os_str(), other)
            .map_err(|source| ScanError::Tree {
                path: Path::new("/").join(path),
                source,
            })
    }

    pub fn finish(self) -> FileSystem {
        self.fs
    }
}

/// Builds a tree from `source`, running `hooks` on each entry.
///
/// Any failure aborts the build; no partial tree is returned.
pub fn build(
    source: &mut dyn DirectorySource,
    hooks: &mut [Box<dyn NodeHook>],
    default_mtime: i64,
) -> Result<FileSystem, ScanError> {
    let mut builder = TreeBuilder::new(hooks, default_mtime);
    builder.add_all(source)?;
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink};

    use super::*;
    use crate::{
        source::{DescriptionSource, DirSource},
        tree::FileSource,
    };

    fn describe(text: &str, base: &Path) -> FileSystem {
        let mut source = DescriptionSource::parse(text, base, 100).unwrap();
        build(&mut source, &mut [], 5).unwrap()
    }

    fn names(dir: &Directory) -> Vec<String> {
        dir.sorted_entries()
            .map(|(name, _)| name.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn siblings_are_sorted_and_parents_implied() {
        let fs = describe(
            "pipe x/b 0600 0 0\n\
             pipe x/a 0600 0 0\n\
             pipe x/c 0600 0 0\n\
             dir x 0700 1 2\n",
            Path::new("/"),
        );
        let x = fs.root.get_directory(OsStr::new("x")).unwrap();
        assert_eq!(names(x), ["a", "b", "c"]);
        // described after its children, but still takes the described attributes
        assert_eq!((x.stat.st_mode, x.stat.st_uid, x.stat.st_gid), (0o700, 1, 2));
        assert_eq!(fs.root.stat.st_mode, 0o755);
        assert_eq!(fs.root.stat.st_mtim_sec, 5);
    }

    #[test]
    fn hardlinks_share_the_leaf() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("f"), b"content").unwrap();
        let fs = describe(
            "file f 0644 0 0\n\
             link g f\n\
             link sub/h /f\n",
            td.path(),
        );
        let f = fs.root.ref_leaf(OsStr::new("f")).unwrap();
        let g = fs.root.ref_leaf(OsStr::new("g")).unwrap();
        let h = fs
            .root
            .get_directory(OsStr::new("sub"))
            .unwrap()
            .ref_leaf(OsStr::new("h"))
            .unwrap();
        assert!(Rc::ptr_eq(&f, &g));
        assert!(Rc::ptr_eq(&f, &h));
        assert_eq!(Rc::strong_count(&f), 4);
    }

    #[test]
    fn failures_name_the_path() {
        let mut source =
            DescriptionSource::parse("pipe a 0600 0 0\npipe a 0600 0 0\n", Path::new("/"), 0)
                .unwrap();
        let err = build(&mut source, &mut [], 0).unwrap_err();
        assert_eq!(err.path(), Some(Path::new("/a")));
        assert!(matches!(
            err,
            ScanError::Tree {
                source: TreeError::AlreadyExists(_),
                ..
            }
        ));

        let mut source = DescriptionSource::parse("link a b\n", Path::new("/"), 0).unwrap();
        let err = build(&mut source, &mut [], 0).unwrap_err();
        assert!(matches!(err, ScanError::Hardlink { .. }));

        let mut source =
            DescriptionSource::parse("dir d 0755 0 0\ndir d 0755 0 0\n", Path::new("/"), 0)
                .unwrap();
        assert!(build(&mut source, &mut [], 0).is_err());
    }

    /// A source whose symlinks can't be read.
    struct BrokenLinks(DescriptionSource);

    impl DirectorySource for BrokenLinks {
        fn next_entry(&mut self) -> Result<Option<DirEntry>, SourceError> {
            self.0.next_entry()
        }

        fn read_link(&mut self) -> Result<Box<OsStr>, SourceError> {
            Err(SourceError::io(
                "broken",
                std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            ))
        }

        fn open_file(&self, path: &Path) -> Result<FileSource, SourceError> {
            self.0.open_file(path)
        }
    }

    #[test]
    fn unreadable_link_aborts_the_build() {
        let inner =
            DescriptionSource::parse("pipe a 0600 0 0\nslink l 0777 0 0 a\n", Path::new("/"), 0)
                .unwrap();
        let err = build(&mut BrokenLinks(inner), &mut [], 0).unwrap_err();
        assert!(matches!(err, ScanError::ReadLink { ref path, .. } if path == Path::new("/l")));
    }

    #[test]
    fn hooks_exclude_whole_subtrees() {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir_all(td.path().join("skip/deep")).unwrap();
        fs::write(td.path().join("skip/deep/file"), b"x").unwrap();
        fs::write(td.path().join("keep"), b"y").unwrap();
        symlink("keep", td.path().join("link")).unwrap();

        let options = BuildOptions {
            exclude: vec!["/skip".into()],
            force_uid: Some(0),
            force_gid: Some(0),
            ..Default::default()
        };
        let mut hooks = options.hooks().unwrap();
        let mut source = DirSource::open(td.path(), options.dir_source_options()).unwrap();
        let fs = build(&mut source, &mut hooks, 0).unwrap();

        assert_eq!(names(&fs.root), ["keep", "link"]);
        assert_eq!(fs.root.stat.st_uid, 0);
        assert_eq!(
            fs.root.get_file(OsStr::new("keep")).unwrap(),
            &FileSource::Host(td.path().join("keep"))
        );
        let link = fs.root.ref_leaf(OsStr::new("link")).unwrap();
        assert!(matches!(&link.content, LeafContent::Symlink(t) if &**t == OsStr::new("keep")));
    }

    #[test]
    fn grafting_merges_trees() {
        let mut hooks: Vec<Box<dyn NodeHook>> = vec![];
        let mut builder = TreeBuilder::new(&mut hooks, 0);
        let mut source =
            DescriptionSource::parse("pipe opt/a 0600 0 0\n", Path::new("/"), 0).unwrap();
        builder.add_all(&mut source).unwrap();

        let other = describe("pipe b 0600 0 0\n", Path::new("/"));
        builder.graft(Path::new("opt"), other).unwrap();
        let fs = builder.finish();
        assert_eq!(
            names(fs.root.get_directory(OsStr::new("opt")).unwrap()),
            ["a", "b"]
        );
    }
}
