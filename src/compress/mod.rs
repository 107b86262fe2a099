//! Pluggable block compressors.
//!
//! A [`Compressor`] turns one block into bytes and back.  Which compressors are available is
//! decided by a [`CompressorRegistry`] value that the program creates at start-up and hands to
//! the image writer and reader; nothing here is global state.

use std::{fmt, str::FromStr};

use thiserror::Error;

mod gzip;
mod zstd;

pub use self::gzip::Gzip;
pub use self::zstd::Zstd;

/// Errors that can occur while compressing or decompressing a block.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("I/O error in {compressor} compressor")]
    Io {
        compressor: CompressorId,
        #[source]
        source: std::io::Error,
    },
    #[error("Decompressed block exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("Compressor {0} is not supported")]
    Unsupported(CompressorId),
    #[error("Unknown compressor id {0}")]
    UnknownId(u16),
    #[error("Unknown compressor name {0:?}")]
    UnknownName(String),
    #[error("Invalid {compressor} options: {reason}")]
    InvalidOptions {
        compressor: CompressorId,
        reason: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompressorId {
    Gzip = 1,
    Lzma = 2,
    Lzo = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
}

impl CompressorId {
    const ALL: [CompressorId; 6] = [
        Self::Gzip,
        Self::Lzma,
        Self::Lzo,
        Self::Xz,
        Self::Lz4,
        Self::Zstd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u16> for CompressorId {
    type Error = CompressError;

    fn try_from(value: u16) -> Result<Self, CompressError> {
        Self::ALL
            .into_iter()
            .find(|id| *id as u16 == value)
            .ok_or(CompressError::UnknownId(value))
    }
}

impl FromStr for CompressorId {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, CompressError> {
        Self::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| CompressError::UnknownName(s.to_string()))
    }
}

/// A block compressor.
///
/// Implementations must be shareable between the compression worker threads.
pub trait Compressor: Send + Sync {
    fn id(&self) -> CompressorId;

    /// Compresses one block.  The caller decides whether the result is worth keeping.
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// Decompresses one block, failing if the output would exceed `limit` bytes.
    fn decompress(&self, input: &[u8], limit: usize) -> Result<Vec<u8>, CompressError>;

    /// The options blob to store after the superblock, if the settings differ from the
    /// defaults a reader would otherwise assume.
    fn options(&self) -> Option<Vec<u8>>;
}

/// The compressor to use for a new image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressorConfig {
    pub id: CompressorId,
    /// Compression level; `None` selects the compressor's default.
    pub level: Option<u32>,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            id: CompressorId::Gzip,
            level: None,
        }
    }
}

struct RegistryEntry {
    id: CompressorId,
    create: fn(Option<u32>) -> Result<Box<dyn Compressor>, CompressError>,
    from_options: fn(Option<&[u8]>) -> Result<Box<dyn Compressor>, CompressError>,
}

/// The set of compressors a program can use.
pub struct CompressorRegistry {
    entries: Vec<RegistryEntry>,
}

impl fmt::Debug for CompressorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.id))
            .finish()
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CompressorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A registry with every compressor this crate implements.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(CompressorId::Gzip, Gzip::create, Gzip::from_options);
        registry.register(CompressorId::Zstd, Zstd::create, Zstd::from_options);
        registry
    }

    pub fn register(
        &mut self,
        id: CompressorId,
        create: fn(Option<u32>) -> Result<Box<dyn Compressor>, CompressError>,
        from_options: fn(Option<&[u8]>) -> Result<Box<dyn Compressor>, CompressError>,
    ) {
        self.entries.retain(|entry| entry.id != id);
        self.entries.push(RegistryEntry {
            id,
            create,
            from_options,
        });
    }

    pub fn supported(&self) -> impl Iterator<Item = CompressorId> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    fn entry(&self, id: CompressorId) -> Result<&RegistryEntry, CompressError> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .ok_or(CompressError::Unsupported(id))
    }

    /// Creates a compressor for writing a new image.
    pub fn create(&self, config: &CompressorConfig) -> Result<Box<dyn Compressor>, CompressError> {
        (self.entry(config.id)?.create)(config.level)
    }

    /// Creates a compressor matching an existing image's superblock and options blob.
    pub fn for_image(
        &self,
        id: u16,
        options: Option<&[u8]>,
    ) -> Result<Box<dyn Compressor>, CompressError> {
        let id = CompressorId::try_from(id)?;
        (self.entry(id)?.from_options)(options)
    }
}
