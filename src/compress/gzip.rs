use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use zerocopy::{FromBytes, IntoBytes};

use super::{CompressError, Compressor, CompressorId};
use crate::squashfs::format::GzipOptions;

const DEFAULT_LEVEL: u32 = 9;
const DEFAULT_WINDOW: u16 = 15;

/// zlib-framed deflate, which is what the format calls "gzip".
#[derive(Debug)]
pub struct Gzip {
    level: u32,
}

impl Gzip {
    pub fn create(level: Option<u32>) -> Result<Box<dyn Compressor>, CompressError> {
        let level = level.unwrap_or(DEFAULT_LEVEL);
        if !(1..=9).contains(&level) {
            return Err(CompressError::InvalidOptions {
                compressor: CompressorId::Gzip,
                reason: format!("level {level} is outside 1..=9"),
            });
        }
        Ok(Box::new(Self { level }))
    }

    pub fn from_options(options: Option<&[u8]>) -> Result<Box<dyn Compressor>, CompressError> {
        let Some(options) = options else {
            return Self::create(None);
        };
        let options = GzipOptions::read_from_bytes(options).map_err(|_| {
            CompressError::InvalidOptions {
                compressor: CompressorId::Gzip,
                reason: format!("options blob is {} bytes", options.len()),
            }
        })?;
        // Decompression doesn't depend on the level or strategies, only the window.
        if options.window_size.get() > DEFAULT_WINDOW || options.window_size.get() < 8 {
            return Err(CompressError::InvalidOptions {
                compressor: CompressorId::Gzip,
                reason: format!("window size {}", options.window_size.get()),
            });
        }
        Self::create(Some(options.level.get().clamp(1, 9)))
    }

    fn io_error(source: std::io::Error) -> CompressError {
        CompressError::Io {
            compressor: CompressorId::Gzip,
            source,
        }
    }
}

impl Compressor for Gzip {
    fn id(&self) -> CompressorId {
        CompressorId::Gzip
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CompressError> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(input.len() / 2),
            Compression::new(self.level),
        );
        encoder.write_all(input).map_err(Self::io_error)?;
        encoder.finish().map_err(Self::io_error)
    }

    fn decompress(&self, input: &[u8], limit: usize) -> Result<Vec<u8>, CompressError> {
        let mut output = Vec::with_capacity(limit);
        ZlibDecoder::new(input)
            .take(limit as u64 + 1)
            .read_to_end(&mut output)
            .map_err(Self::io_error)?;
        if output.len() > limit {
            return Err(CompressError::TooLarge { limit });
        }
        Ok(output)
    }

    fn options(&self) -> Option<Vec<u8>> {
        (self.level != DEFAULT_LEVEL).then(|| {
            GzipOptions {
                level: self.level.into(),
                window_size: DEFAULT_WINDOW.into(),
                strategies: 0.into(),
            }
            .as_bytes()
            .to_vec()
        })
    }
}
