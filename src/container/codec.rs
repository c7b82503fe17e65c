//! HDF5 filter pipelines for container datasets.

use sha2::{Digest, Sha256};

use crate::error::ContainerError;
use crate::format::{Compression, EncodeOptions};
use crate::model::PixelBuffer;

use super::layout::THUMBNAIL_DEFLATE_LEVEL;

/// Filter pipeline applied to every chunk of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFilter {
    None,
    /// gzip, level 1-9.
    Deflate { level: u8 },
    /// LZF, the fast filter bundled with h5py.
    Lzf,
    /// Byte shuffle, then gzip.
    ShuffleDeflate { level: u8 },
}

/// Filter used for the thumbnail regardless of the request.
pub const THUMBNAIL_FILTER: ChunkFilter = ChunkFilter::Deflate {
    level: THUMBNAIL_DEFLATE_LEVEL,
};

impl ChunkFilter {
    /// Map an encode request onto a filter pipeline.
    pub fn from_options(options: &EncodeOptions) -> Result<Self, ContainerError> {
        let level = options.compression_level.clamp(1, 9) as u8;
        match options.compression {
            Compression::None => Ok(ChunkFilter::None),
            Compression::LosslessGeneral => Ok(ChunkFilter::Deflate { level }),
            Compression::FastGeneral => Ok(ChunkFilter::Lzf),
            Compression::CombinableFilters => Ok(ChunkFilter::ShuffleDeflate { level }),
            Compression::TiledLossy => Err(ContainerError::UnsupportedCompression(
                "tiled-lossy compression cannot be stored losslessly in a univ container"
                    .to_string(),
            )),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            ChunkFilter::None => "none",
            ChunkFilter::Deflate { .. } => "gzip",
            ChunkFilter::Lzf => "lzf",
            ChunkFilter::ShuffleDeflate { .. } => "shuffle+gzip",
        }
    }
}

/// Hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of the little-endian encoding of `data`.
pub fn sample_checksum(data: &PixelBuffer) -> String {
    checksum(&data.to_le_bytes())
}
