//! Per-node post-processing applied while a tree is being built.
//!
//! The tree builder runs every configured [`NodeHook`] on each entry, in order, before the
//! entry is inserted.  The usual chain is [`Exclude`], [`ForceOwner`], [`XattrMap`] and
//! [`SecurityLabels`]; any of them may be left out.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs,
    io::{self, BufRead, BufReader, Read},
    path::{Component, Path, PathBuf},
};

use base64::Engine;
use log::trace;
use regex_automata::{hybrid::dfa, meta, util::syntax, Anchored, Input};
use thiserror::Error;

use crate::{
    source::{DirEntry, DirEntryKind},
    squashfs::{format::xattr_prefix, tables::XattrSet},
};

/// The xattr holding a node's SELinux context.
pub const XATTR_SECURITY_SELINUX: &str = "security.selinux";

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{file:?} line {line}: {message}")]
    Parse {
        file: PathBuf,
        line: usize,
        message: String,
    },
    #[error("Invalid pattern")]
    Pattern(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Pattern matching failed")]
    Match(#[from] regex_automata::MatchError),
}

/// A post-processing step for one tree entry.
pub trait NodeHook {
    /// Inspects and possibly modifies `entry`.  Returns `false` to leave the entry (and
    /// everything below it) out of the tree.
    fn apply(&mut self, entry: &mut DirEntry) -> Result<bool, HookError>;
}

fn image_path_bytes(entry: &DirEntry) -> Vec<u8> {
    entry.image_path().into_os_string().into_encoded_bytes()
}

/// Leaves out entries whose image path (`/a/b`) fully matches one of the patterns.
pub struct Exclude {
    regex: meta::Regex,
}

impl Exclude {
    pub fn new<P: AsRef<str>>(patterns: &[P]) -> Result<Self, HookError> {
        let anchored: Vec<String> = patterns
            .iter()
            .map(|p| format!("^(?:{})$", p.as_ref()))
            .collect();
        let regex = meta::Builder::new()
            .syntax(syntax::Config::new().utf8(false).unicode(false))
            .build_many(&anchored)
            .map_err(|e| HookError::Pattern(e.into()))?;
        Ok(Self { regex })
    }
}

impl NodeHook for Exclude {
    fn apply(&mut self, entry: &mut DirEntry) -> Result<bool, HookError> {
        if entry.path.as_os_str().is_empty() {
            return Ok(true);
        }
        let excluded = self.regex.is_match(Input::new(&image_path_bytes(entry)));
        if excluded {
            trace!("excluding {:?}", entry.path);
        }
        Ok(!excluded)
    }
}

/// Overrides the owner and/or group of every node.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceOwner {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl NodeHook for ForceOwner {
    fn apply(&mut self, entry: &mut DirEntry) -> Result<bool, HookError> {
        if let Some(uid) = self.uid {
            entry.stat.st_uid = uid;
        }
        if let Some(gid) = self.gid {
            entry.stat.st_gid = gid;
        }
        Ok(true)
    }
}

fn relative(path: &str) -> Option<PathBuf> {
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

/// Decodes a value in `getfattr --dump` notation: `"text"` with octal escapes, `0x` hex or
/// `0s` base64.
fn decode_xattr_value(value: &str) -> Result<Vec<u8>, String> {
    if let Some(hex) = value.strip_prefix("0x") {
        return hex::decode(hex).map_err(|e| format!("bad hex value: {e}"));
    }
    if let Some(b64) = value.strip_prefix("0s") {
        return base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| format!("bad base64 value: {e}"));
    }
    let Some(quoted) = value.strip_prefix('"') else {
        return Ok(value.as_bytes().to_vec());
    };
    let Some(quoted) = quoted.strip_suffix('"') else {
        return Err("unterminated quote".into());
    };

    let mut out = vec![];
    let mut bytes = quoted.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(d @ b'0'..=b'7') => {
                let mut code = (d - b'0') as u32;
                for _ in 0..2 {
                    match bytes.next() {
                        Some(d @ b'0'..=b'7') => code = code * 8 + (d - b'0') as u32,
                        _ => return Err("short octal escape".into()),
                    }
                }
                out.push(u8::try_from(code).map_err(|_| "octal escape out of range")?);
            }
            Some(c @ (b'\\' | b'"')) => out.push(c),
            _ => return Err("bad escape".into()),
        }
    }
    Ok(out)
}

/// Extended attributes assigned to paths by a `getfattr --dump` style file.
#[derive(Debug, Default)]
pub struct XattrMap {
    map: HashMap<PathBuf, XattrSet>,
}

impl XattrMap {
    pub fn parse(file: impl Read, name: &Path) -> Result<Self, HookError> {
        let mut map: HashMap<PathBuf, XattrSet> = HashMap::new();
        let mut current: Option<PathBuf> = None;

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| HookError::Io {
                path: name.to_path_buf(),
                source,
            })?;
            let error = |message: String| HookError::Parse {
                file: name.to_path_buf(),
                line: index + 1,
                message,
            };

            let line = line.trim();
            if let Some(path) = line.strip_prefix("# file:") {
                let path = relative(path.trim())
                    .ok_or_else(|| error(format!("invalid path {:?}", path.trim())))?;
                map.entry(path.clone()).or_default();
                current = Some(path);
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(path) = &current else {
                return Err(error("attribute before the first \"# file:\" line".into()));
            };
            let (key, value) = line.split_once('=').unwrap_or((line, "\"\""));
            if xattr_prefix(key.as_bytes()).is_none() {
                return Err(error(format!("unsupported xattr {key:?}")));
            }
            let value = decode_xattr_value(value).map_err(error)?;
            if let Some(set) = map.get_mut(path) {
                set.insert(Box::from(OsStr::new(key)), value.into_boxed_slice());
            }
        }

        Ok(Self { map })
    }

    pub fn load(path: &Path) -> Result<Self, HookError> {
        let file = fs::File::open(path).map_err(|source| HookError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(file, path)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl NodeHook for XattrMap {
    fn apply(&mut self, entry: &mut DirEntry) -> Result<bool, HookError> {
        if let Some(set) = self.map.get(&entry.path) {
            let mut xattrs = entry.stat.xattrs.borrow_mut();
            for (key, value) in set {
                xattrs.insert(key.clone(), value.clone());
            }
        }
        Ok(true)
    }
}

/* All lines of a file-contexts file are built into a single lazy DFA:
 *
 *  - the input is the image path plus one character for the file type, using the codes from
 *    selabel_file(5): 'b', 'c', 'd', 'p', 'l', 's' and '-'
 *
 *  - the pattern ID of the match is the index of the context
 *
 * The DFA reports the first pattern that matches, so the lines are added in reverse to make the
 * last matching line win.
 */

/// SELinux labels from a file-contexts file (`REGEX [-TYPE] CONTEXT` per line).
///
/// Nodes matching a line get its context in `security.selinux`; nodes that match nothing, or
/// whose line says `<<none>>`, lose any label they had.
pub struct SecurityLabels {
    dfa: dfa::DFA,
    cache: dfa::Cache,
    contexts: Vec<String>,
}

impl SecurityLabels {
    pub fn parse(file: impl Read, name: &Path) -> Result<Self, HookError> {
        let mut regexps = vec![];
        let mut contexts = vec![];

        for (index, item) in BufReader::new(file).lines().enumerate() {
            let line = item.map_err(|source| HookError::Io {
                path: name.to_path_buf(),
                source,
            })?;
            let error = |message: &str| HookError::Parse {
                file: name.to_path_buf(),
                line: index + 1,
                message: message.to_string(),
            };

            let mut parts = line.split_whitespace();
            let regex = match parts.next() {
                None => continue,
                Some(comment) if comment.starts_with('#') => continue,
                Some(regex) => regex,
            };
            let Some(next) = parts.next() else {
                return Err(error("missing context"));
            };
            if let Some(ifmt) = next.strip_prefix('-') {
                if !["b", "c", "d", "p", "l", "s", "-"].contains(&ifmt) {
                    return Err(error("invalid type code"));
                }
                let Some(context) = parts.next() else {
                    return Err(error("missing context"));
                };
                regexps.push(format!("^({regex}){ifmt}$"));
                contexts.push(context.to_string());
            } else {
                regexps.push(format!("^({regex}).$"));
                contexts.push(next.to_string());
            }
            if parts.next().is_some() {
                return Err(error("trailing data"));
            }
        }

        regexps.reverse();
        contexts.reverse();

        let mut builder = dfa::Builder::new();
        builder.syntax(
            syntax::Config::new()
                .unicode(false)
                .utf8(false)
                .line_terminator(0),
        );
        builder.configure(
            dfa::Config::new()
                .cache_capacity(10_000_000)
                .skip_cache_capacity_check(true),
        );
        let dfa = builder
            .build_many(&regexps)
            .map_err(|e| HookError::Pattern(e.into()))?;
        let cache = dfa.create_cache();

        Ok(Self {
            dfa,
            cache,
            contexts,
        })
    }

    pub fn load(path: &Path) -> Result<Self, HookError> {
        let file = fs::File::open(path).map_err(|source| HookError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(file, path)
    }

    /// The context for an image path (`/a/b`) with the given type code.
    // mut because it touches the cache
    pub fn lookup(&mut self, path: &[u8], ifmt: u8) -> Result<Option<&str>, HookError> {
        let key = [path, &[ifmt]].concat();
        let input = Input::new(&key).anchored(Anchored::Yes);

        Ok(match self.dfa.try_search_fwd(&mut self.cache, &input)? {
            Some(halfmatch) => match self.contexts[halfmatch.pattern()].as_str() {
                "<<none>>" => None,
                context => Some(context),
            },
            None => None,
        })
    }
}

impl NodeHook for SecurityLabels {
    fn apply(&mut self, entry: &mut DirEntry) -> Result<bool, HookError> {
        let ifmt = match entry.kind {
            DirEntryKind::Directory => b'd',
            DirEntryKind::Regular => b'-',
            DirEntryKind::Symlink => b'l',
            DirEntryKind::BlockDevice(_) => b'b',
            DirEntryKind::CharacterDevice(_) => b'c',
            DirEntryKind::Fifo => b'p', // NB: 'pipe', not 'fifo'
            DirEntryKind::Socket => b's',
            // labelled under its first name
            DirEntryKind::Hardlink(_) => return Ok(true),
        };

        let path = image_path_bytes(entry);
        let label = self.lookup(&path, ifmt)?.map(|l| Box::from(l.as_bytes()));
        let mut xattrs = entry.stat.xattrs.borrow_mut();
        let key = OsStr::new(XATTR_SECURITY_SELINUX);
        match label {
            Some(label) => {
                xattrs.insert(Box::from(key), label);
            }
            None => {
                xattrs.remove(key);
            }
        }
        Ok(true)
    }
}

/// Runs `hooks` on `entry` in order, stopping at the first one that excludes it.
pub fn apply_all(hooks: &mut [Box<dyn NodeHook>], entry: &mut DirEntry) -> Result<bool, HookError> {
    for hook in hooks {
        if !hook.apply(entry)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::BTreeMap};

    use super::*;
    use crate::generic_tree::Stat;

    fn entry(path: &str, kind: DirEntryKind) -> DirEntry {
        DirEntry {
            path: PathBuf::from(path),
            kind,
            stat: Stat {
                st_mode: 0o644,
                st_uid: 1000,
                st_gid: 1000,
                st_mtim_sec: 0,
                xattrs: RefCell::new(BTreeMap::new()),
            },
            size: 0,
        }
    }

    fn xattr(entry: &DirEntry, key: &str) -> Option<Vec<u8>> {
        entry
            .stat
            .xattrs
            .borrow()
            .get(OsStr::new(key))
            .map(|v| v.to_vec())
    }

    #[test]
    fn exclusion_matches_whole_paths() {
        let mut exclude = Exclude::new(&[r"/tmp(/.*)?", r".*\.o"]).unwrap();
        assert!(!exclude.apply(&mut entry("tmp", DirEntryKind::Directory)).unwrap());
        assert!(!exclude.apply(&mut entry("tmp/x", DirEntryKind::Regular)).unwrap());
        assert!(!exclude.apply(&mut entry("src/main.o", DirEntryKind::Regular)).unwrap());
        assert!(exclude.apply(&mut entry("tmpfile", DirEntryKind::Regular)).unwrap());
        assert!(exclude.apply(&mut entry("", DirEntryKind::Directory)).unwrap());

        assert!(matches!(Exclude::new(&["("]), Err(HookError::Pattern(_))));
    }

    #[test]
    fn owner_is_forced() {
        let mut force = ForceOwner {
            uid: Some(0),
            gid: None,
        };
        let mut e = entry("a", DirEntryKind::Regular);
        force.apply(&mut e).unwrap();
        assert_eq!((e.stat.st_uid, e.stat.st_gid), (0, 1000));
    }

    #[test]
    fn xattr_map_values() {
        let text = "# file: etc/passwd\n\
                    user.text=\"a\\012b\\\"\"\n\
                    user.hex=0x00ff\n\
                    \n\
                    # file: /bin\n\
                    trusted.b64=0sAQID\n";
        let mut map = XattrMap::parse(text.as_bytes(), Path::new("map")).unwrap();
        assert_eq!(map.len(), 2);

        let mut passwd = entry("etc/passwd", DirEntryKind::Regular);
        map.apply(&mut passwd).unwrap();
        assert_eq!(xattr(&passwd, "user.text").unwrap(), b"a\nb\"");
        assert_eq!(xattr(&passwd, "user.hex").unwrap(), [0, 0xff]);

        let mut bin = entry("bin", DirEntryKind::Directory);
        map.apply(&mut bin).unwrap();
        assert_eq!(xattr(&bin, "trusted.b64").unwrap(), [1, 2, 3]);

        let bad = XattrMap::parse("# file: a\nsystem.x=1\n".as_bytes(), Path::new("map"));
        assert!(matches!(bad, Err(HookError::Parse { line: 2, .. })));
        let orphan = XattrMap::parse("user.x=1\n".as_bytes(), Path::new("map"));
        assert!(matches!(orphan, Err(HookError::Parse { line: 1, .. })));
        let hex = XattrMap::parse("# file: a\nuser.x=0xzz\n".as_bytes(), Path::new("map"));
        assert!(hex.is_err());
    }

    #[test]
    fn last_matching_context_wins() {
        let contexts = "# comment\n\
                        /.*          system_u:object_r:default_t:s0\n\
                        /usr/bin/.*  -- system_u:object_r:bin_t:s0\n\
                        /usr(/.*)?   -d system_u:object_r:usr_t:s0\n\
                        /tmp/.*      <<none>>\n";
        let mut labels = SecurityLabels::parse(contexts.as_bytes(), Path::new("fc")).unwrap();

        let mut ls = entry("usr/bin/ls", DirEntryKind::Regular);
        labels.apply(&mut ls).unwrap();
        assert_eq!(
            xattr(&ls, XATTR_SECURITY_SELINUX).unwrap(),
            b"system_u:object_r:bin_t:s0"
        );

        let mut usr = entry("usr", DirEntryKind::Directory);
        labels.apply(&mut usr).unwrap();
        assert_eq!(
            xattr(&usr, XATTR_SECURITY_SELINUX).unwrap(),
            b"system_u:object_r:usr_t:s0"
        );

        let mut etc = entry("etc", DirEntryKind::Directory);
        labels.apply(&mut etc).unwrap();
        assert_eq!(
            xattr(&etc, XATTR_SECURITY_SELINUX).unwrap(),
            b"system_u:object_r:default_t:s0"
        );

        let mut tmp = entry("tmp/x", DirEntryKind::Regular);
        tmp.stat.xattrs.borrow_mut().insert(
            Box::from(OsStr::new(XATTR_SECURITY_SELINUX)),
            Box::from(&b"old"[..]),
        );
        labels.apply(&mut tmp).unwrap();
        assert_eq!(xattr(&tmp, XATTR_SECURITY_SELINUX), None);

        let bad = SecurityLabels::parse("/x -q ctx\n".as_bytes(), Path::new("fc"));
        assert!(matches!(bad, Err(HookError::Parse { line: 1, .. })));
    }

    #[test]
    fn chain_stops_at_exclusion() {
        let mut hooks: Vec<Box<dyn NodeHook>> = vec![
            Box::new(Exclude::new(&["/skip"]).unwrap()),
            Box::new(ForceOwner {
                uid: Some(7),
                gid: Some(7),
            }),
        ];
        let mut skip = entry("skip", DirEntryKind::Regular);
        assert!(!apply_all(&mut hooks, &mut skip).unwrap());
        assert_eq!(skip.stat.st_uid, 1000);

        let mut keep = entry("keep", DirEntryKind::Regular);
        assert!(apply_all(&mut hooks, &mut keep).unwrap());
        assert_eq!(keep.stat.st_uid, 7);
    }
}
