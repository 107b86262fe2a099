//! Textual tree descriptions.
//!
//! One entry per line, fields separated by whitespace:
//!
//! ```text
//! dir   PATH MODE UID GID
//! file  PATH MODE UID GID [LOCATION]
//! slink PATH MODE UID GID TARGET
//! link  PATH TARGET
//! nod   PATH MODE UID GID c|b MAJOR MINOR
//! pipe  PATH MODE UID GID
//! sock  PATH MODE UID GID
//! ```
//!
//! `MODE` is octal.  Fields may be double-quoted, with `\"` and `\\` escapes.  Blank lines and
//! lines starting with `#` are ignored.  A file's content is read from `LOCATION`, or from
//! `PATH` when that is omitted, both relative to the base directory.  Parent directories that
//! aren't described are created by the tree builder with default attributes.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    ffi::OsStr,
    fs, io,
    path::{Component, Path, PathBuf},
    vec,
};

use thiserror::Error;

use super::{DirEntry, DirEntryKind, DirectorySource, SourceError};
use crate::{generic_tree::Stat, tree::FileSource};

#[derive(Error, Debug)]
pub enum DescriptionError {
    #[error("Failed to read description")]
    Read(#[source] io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("line {line}: {path:?}")]
    Location {
        line: usize,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Splits a line into whitespace-separated fields, honouring double quotes.
pub(crate) fn split_fields(line: &str) -> Result<Vec<String>, String> {
    let mut fields = vec![];
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            return Ok(fields);
        };

        let mut field = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c @ ('"' | '\\')) => field.push(c),
                        Some(c) => return Err(format!("unknown escape \\{c}")),
                        None => return Err("unterminated quote".into()),
                    },
                    Some(c) => field.push(c),
                    None => return Err("unterminated quote".into()),
                }
            }
            if chars.peek().is_some_and(|c| !c.is_whitespace()) {
                return Err("missing whitespace after quoted field".into());
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                field.push(c);
            }
        }
        fields.push(field);
    }
}

/// Normalizes a path from a description to the relative form used by [`DirEntry`].
fn relative_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => out.push(name),
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

struct Attributes {
    mode: u32,
    uid: u32,
    gid: u32,
}

fn parse_attributes(fields: &[String]) -> Result<Attributes, String> {
    let [mode, uid, gid] = fields else {
        return Err("expected MODE UID GID".into());
    };
    let mode = u32::from_str_radix(mode, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid mode {mode:?}"))?;
    let uid = uid.parse().map_err(|_| format!("invalid uid {uid:?}"))?;
    let gid = gid.parse().map_err(|_| format!("invalid gid {gid:?}"))?;
    Ok(Attributes { mode, uid, gid })
}

/// A [`DirectorySource`] replaying a parsed description.
#[derive(Debug)]
pub struct DescriptionSource {
    entries: vec::IntoIter<DirEntry>,
    links: HashMap<PathBuf, Box<OsStr>>,
    locations: HashMap<PathBuf, PathBuf>,
    last: Option<PathBuf>,
}

impl DescriptionSource {
    /// Parses `text`.  File locations are resolved against `base` and must exist.  Every entry
    /// gets `mtime` as its modification time.
    pub fn parse(text: &str, base: &Path, mtime: i64) -> Result<Self, DescriptionError> {
        let mut entries = vec![];
        let mut links = HashMap::new();
        let mut locations = HashMap::new();

        for (index, line) in text.lines().enumerate() {
            let line_nr = index + 1;
            let error = |message: String| DescriptionError::Parse {
                line: line_nr,
                message,
            };

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields = split_fields(trimmed).map_err(error)?;
            let [keyword, path, rest @ ..] = &fields[..] else {
                return Err(error("expected an entry type and a path".into()));
            };
            let path =
                relative_path(path).ok_or_else(|| error(format!("invalid path {path:?}")))?;

            if keyword == "link" {
                let [target] = rest else {
                    return Err(error("expected link PATH TARGET".into()));
                };
                let target = relative_path(target)
                    .filter(|t| t.components().next().is_some())
                    .ok_or_else(|| error(format!("invalid link target {target:?}")))?;
                entries.push(DirEntry {
                    path,
                    kind: DirEntryKind::Hardlink(target),
                    stat: Stat::with_mode(0),
                    size: 0,
                });
                continue;
            }

            if rest.len() < 3 {
                return Err(error("expected MODE UID GID".into()));
            }
            let (attributes, extra) = rest.split_at(3);
            let attributes = parse_attributes(attributes).map_err(error)?;

            let mut size = 0;
            let kind = match (keyword.as_str(), extra) {
                ("dir", []) => DirEntryKind::Directory,
                ("file", []) | ("file", [_]) => {
                    let location = match extra {
                        [location] => base.join(location),
                        _ => base.join(&path),
                    };
                    let metadata =
                        fs::metadata(&location).map_err(|source| DescriptionError::Location {
                            line: line_nr,
                            path: location.clone(),
                            source,
                        })?;
                    if !metadata.is_file() {
                        return Err(error(format!("{location:?} is not a regular file")));
                    }
                    size = metadata.len();
                    locations.insert(path.clone(), location);
                    DirEntryKind::Regular
                }
                ("slink", [target]) => {
                    if target.is_empty() {
                        return Err(error("empty symlink target".into()));
                    }
                    links.insert(path.clone(), Box::from(OsStr::new(target)));
                    DirEntryKind::Symlink
                }
                ("nod", [kind, major, minor]) => {
                    let major: u32 = major
                        .parse()
                        .map_err(|_| error(format!("invalid major {major:?}")))?;
                    let minor: u32 = minor
                        .parse()
                        .map_err(|_| error(format!("invalid minor {minor:?}")))?;
                    let device = rustix::fs::makedev(major, minor);
                    match kind.as_str() {
                        "c" => DirEntryKind::CharacterDevice(device),
                        "b" => DirEntryKind::BlockDevice(device),
                        other => return Err(error(format!("invalid device type {other:?}"))),
                    }
                }
                ("pipe", []) => DirEntryKind::Fifo,
                ("sock", []) => DirEntryKind::Socket,
                ("dir" | "file" | "slink" | "nod" | "pipe" | "sock", _) => {
                    return Err(error(format!("wrong number of fields for {keyword}")))
                }
                (other, _) => return Err(error(format!("unknown entry type {other:?}"))),
            };

            if path.as_os_str().is_empty() && kind != DirEntryKind::Directory {
                return Err(error("the root must be a directory".into()));
            }

            entries.push(DirEntry {
                path,
                kind,
                stat: Stat {
                    st_mode: attributes.mode,
                    st_uid: attributes.uid,
                    st_gid: attributes.gid,
                    st_mtim_sec: mtime,
                    xattrs: RefCell::new(BTreeMap::new()),
                },
                size,
            });
        }

        Ok(Self {
            entries: entries.into_iter(),
            links,
            locations,
            last: None,
        })
    }

    pub fn load(path: &Path, base: &Path, mtime: i64) -> Result<Self, DescriptionError> {
        let text = fs::read_to_string(path).map_err(DescriptionError::Read)?;
        Self::parse(&text, base, mtime)
    }
}

impl DirectorySource for DescriptionSource {
    fn next_entry(&mut self) -> Result<Option<DirEntry>, SourceError> {
        let entry = self.entries.next();
        self.last = entry.as_ref().map(|e| e.path.clone());
        Ok(entry)
    }

    fn read_link(&mut self) -> Result<Box<OsStr>, SourceError> {
        let path = self.last.clone().unwrap_or_default();
        self.links
            .get(&path)
            .cloned()
            .ok_or(SourceError::NotASymlink(path))
    }

    fn open_file(&self, path: &Path) -> Result<FileSource, SourceError> {
        self.locations
            .get(path)
            .map(|location| FileSource::Host(location.clone()))
            .ok_or_else(|| {
                SourceError::io(path, io::Error::from(io::ErrorKind::NotFound))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_and_quotes() {
        assert_eq!(
            split_fields("  file \"a b\\\" c\"  0644 0 0 ").unwrap(),
            ["file", "a b\" c", "0644", "0", "0"]
        );
        assert!(split_fields("\"open").is_err());
        assert!(split_fields("\"a\"b").is_err());
        assert!(split_fields("\"\\n\"").is_err());
        assert!(split_fields("").unwrap().is_empty());
    }

    #[test]
    fn parses_every_entry_type() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("payload"), b"12345").unwrap();
        fs::create_dir(td.path().join("etc")).unwrap();
        fs::write(td.path().join("etc/hostname"), b"box\n").unwrap();

        let mut source = DescriptionSource::parse(
            "# comment\n\
             dir / 0755 0 0\n\
             dir etc 0755 0 0\n\
             file etc/hostname 0644 0 0\n\
             file /data 0600 1000 100 payload\n\
             slink bin 0777 0 0 usr/bin\n\
             link data2 /data\n\
             nod dev/null 0666 0 0 c 1 3\n\
             pipe run/fifo 0600 0 0\n\
             sock run/sock 0600 0 0\n",
            td.path(),
            42,
        )
        .unwrap();

        let root = source.next_entry().unwrap().unwrap();
        assert_eq!(root.path, PathBuf::new());
        assert!(root.is_dir());
        assert_eq!(root.stat.st_mtim_sec, 42);

        source.next_entry().unwrap();
        let hostname = source.next_entry().unwrap().unwrap();
        assert_eq!(hostname.size, 4);

        let data = source.next_entry().unwrap().unwrap();
        assert_eq!(data.path, PathBuf::from("data"));
        assert_eq!((data.stat.st_mode, data.stat.st_uid, data.stat.st_gid), (0o600, 1000, 100));
        assert_eq!(
            source.open_file(&data.path).unwrap(),
            FileSource::Host(td.path().join("payload"))
        );
        assert!(source.read_link().is_err());

        let bin = source.next_entry().unwrap().unwrap();
        assert_eq!(bin.kind, DirEntryKind::Symlink);
        assert_eq!(&*source.read_link().unwrap(), OsStr::new("usr/bin"));

        let link = source.next_entry().unwrap().unwrap();
        assert_eq!(link.kind, DirEntryKind::Hardlink(PathBuf::from("data")));

        let null = source.next_entry().unwrap().unwrap();
        assert_eq!(
            null.kind,
            DirEntryKind::CharacterDevice(rustix::fs::makedev(1, 3))
        );
        assert_eq!(source.next_entry().unwrap().unwrap().kind, DirEntryKind::Fifo);
        assert_eq!(source.next_entry().unwrap().unwrap().kind, DirEntryKind::Socket);
        assert!(source.next_entry().unwrap().is_none());
    }

    #[test]
    fn errors_carry_line_numbers() {
        let base = Path::new("/nonexistent");
        let line_of = |text: &str| match DescriptionSource::parse(text, base, 0) {
            Err(DescriptionError::Parse { line, .. } | DescriptionError::Location { line, .. }) => {
                line
            }
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(line_of("dir a 0755 0 0\nbogus b 0 0 0\n"), 2);
        assert_eq!(line_of("\n\ndir a 0999 0 0\n"), 3);
        assert_eq!(line_of("dir a 0755 0\n"), 1);
        assert_eq!(line_of("nod a 0600 0 0 x 1 2\n"), 1);
        assert_eq!(line_of("dir ../up 0755 0 0\n"), 1);
        assert_eq!(line_of("slink / 0777 0 0 x\n"), 1);
        assert_eq!(line_of("# ok\nfile missing 0644 0 0\n"), 2);
    }
}
