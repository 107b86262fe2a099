//! Sort files: the order in which regular files are packed, plus per-file packing flags.
//!
//! Each non-empty line is `PRIORITY PATH [FLAGS]`, where `FLAGS` is a comma-separated subset of
//! `dont_compress`, `dont_fragment` and `dont_deduplicate`.  Lower priorities are packed first.
//! Paths are taken relative to the image root; a leading `/` is optional.  Paths containing
//! whitespace can be written in double quotes.

use std::{
    collections::HashMap,
    fs,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;

use crate::{data::PackFlags, source::description::split_fields};

#[derive(Error, Debug)]
pub enum SortFileError {
    #[error("Failed to read sort file")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortEntry {
    pub priority: i64,
    pub flags: PackFlags,
}

#[derive(Debug, Clone, Default)]
pub struct SortFile {
    entries: HashMap<PathBuf, SortEntry>,
}

/// Turns `a/./b/` or `/a/b` into `/a/b`.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => out.push(name),
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn parse_flags(field: &str) -> Result<PackFlags, String> {
    let mut flags = PackFlags::default();
    for flag in field.split(',').filter(|f| !f.is_empty()) {
        match flag {
            "dont_compress" => flags.dont_compress = true,
            "dont_fragment" => flags.dont_fragment = true,
            "dont_deduplicate" => flags.dont_deduplicate = true,
            other => return Err(format!("unknown flag {other:?}")),
        }
    }
    Ok(flags)
}

impl SortFile {
    pub fn parse(text: &str) -> Result<Self, SortFileError> {
        let mut entries = HashMap::new();

        for (index, line) in text.lines().enumerate() {
            let error = |message: String| SortFileError::Parse {
                line: index + 1,
                message,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = split_fields(line).map_err(error)?;
            let [priority, path, rest @ ..] = &fields[..] else {
                return Err(error("expected PRIORITY PATH [FLAGS]".into()));
            };
            let priority = priority
                .parse()
                .map_err(|_| error(format!("invalid priority {priority:?}")))?;
            let flags = match rest {
                [] => PackFlags::default(),
                [flags] => parse_flags(flags).map_err(error)?,
                _ => return Err(error("trailing data".into())),
            };
            let path = normalize(Path::new(path))
                .ok_or_else(|| error(format!("invalid path {path:?}")))?;

            entries.insert(path, SortEntry { priority, flags });
        }

        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, SortFileError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Looks up an image path in `/a/b` form.
    pub fn get(&self, path: &Path) -> Option<&SortEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
