use zerocopy::{FromBytes, IntoBytes};

use super::{CompressError, Compressor, CompressorId};
use crate::squashfs::format::ZstdOptions;

const DEFAULT_LEVEL: u32 = 15;
const MAX_LEVEL: u32 = 22;

#[derive(Debug)]
pub struct Zstd {
    level: u32,
}

impl Zstd {
    pub fn create(level: Option<u32>) -> Result<Box<dyn Compressor>, CompressError> {
        let level = level.unwrap_or(DEFAULT_LEVEL);
        if !(1..=MAX_LEVEL).contains(&level) {
            return Err(CompressError::InvalidOptions {
                compressor: CompressorId::Zstd,
                reason: format!("level {level} is outside 1..={MAX_LEVEL}"),
            });
        }
        Ok(Box::new(Self { level }))
    }

    pub fn from_options(options: Option<&[u8]>) -> Result<Box<dyn Compressor>, CompressError> {
        match options {
            None => Self::create(None),
            Some(blob) => {
                let options = ZstdOptions::read_from_bytes(blob).map_err(|_| {
                    CompressError::InvalidOptions {
                        compressor: CompressorId::Zstd,
                        reason: format!("options blob is {} bytes", blob.len()),
                    }
                })?;
                Self::create(Some(options.level.get()))
            }
        }
    }

    fn io_error(source: std::io::Error) -> CompressError {
        CompressError::Io {
            compressor: CompressorId::Zstd,
            source,
        }
    }
}

impl Compressor for Zstd {
    fn id(&self) -> CompressorId {
        CompressorId::Zstd
    }

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CompressError> {
        ::zstd::bulk::compress(input, self.level as i32).map_err(Self::io_error)
    }

    fn decompress(&self, input: &[u8], limit: usize) -> Result<Vec<u8>, CompressError> {
        // bulk::decompress() refuses to write past its capacity, which is exactly the limit we
        // want; frames declaring a larger content size fail up front.
        match ::zstd::zstd_safe::get_frame_content_size(input) {
            Ok(Some(size)) if size > limit as u64 => Err(CompressError::TooLarge { limit }),
            _ => ::zstd::bulk::decompress(input, limit).map_err(Self::io_error),
        }
    }

    fn options(&self) -> Option<Vec<u8>> {
        (self.level != DEFAULT_LEVEL).then(|| {
            ZstdOptions {
                level: self.level.into(),
            }
            .as_bytes()
            .to_vec()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_roundtrip() {
        assert!(Zstd::create(None).unwrap().options().is_none());

        let compressor = Zstd::create(Some(3)).unwrap();
        let blob = compressor.options().unwrap();
        assert_eq!(blob, 3u32.to_le_bytes());
        let restored = Zstd::from_options(Some(&blob)).unwrap();
        assert_eq!(restored.options(), Some(blob));
    }

    #[test]
    fn invalid_levels() {
        assert!(Zstd::create(Some(0)).is_err());
        assert!(Zstd::create(Some(23)).is_err());
        assert!(Zstd::from_options(Some(&[0; 3])).is_err());
    }
}
