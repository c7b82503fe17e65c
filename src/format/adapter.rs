//! Format adapter contract.
//!
//! Every format plugs into the conversion pipeline through
//! [`FormatAdapter`]: `decode` turns a file into a raw array plus metadata,
//! `encode` writes a canonical pyramid back out. Adapters are looked up by
//! [`SourceFormat`] in an [`AdapterRegistry`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::model::{ImageMetadata, ImagePyramid, RawArray, SceneDescriptor, SceneSelector};

use super::detect::SourceFormat;

// =============================================================================
// Options
// =============================================================================

/// Default compression level for the lossless codec.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 4;

/// Default tile edge for tiling encoders.
pub const DEFAULT_TILE_SIZE: usize = 512;

/// Compression families an encode request can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    /// General-purpose lossless (deflate/zlib), effort set by the level.
    #[default]
    LosslessGeneral,
    /// Fast general-purpose codec (LZF, LZ4).
    FastGeneral,
    /// Lossy per-tile codec. No encoder implements one; requests fail
    /// with `Unsupported`.
    TiledLossy,
    /// Filter pipeline ending in a general codec (shuffle + deflate, shuffle + LZ4, LZW).
    CombinableFilters,
}

impl Compression {
    pub const fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::LosslessGeneral => "lossless-general",
            Compression::FastGeneral => "fast-general",
            Compression::TiledLossy => "tiled-lossy",
            Compression::CombinableFilters => "combinable-filters",
        }
    }
}

/// Options passed to every encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOptions {
    pub include_pyramid: bool,
    pub compression: Compression,
    /// 1-9, used by the lossless codec.
    pub compression_level: u32,
    pub tile_size: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            include_pyramid: true,
            compression: Compression::default(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl EncodeOptions {
    /// Check that the option values are in range.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=9).contains(&self.compression_level) {
            return Err(format!(
                "compression level must be between 1 and 9, got {}",
                self.compression_level
            ));
        }
        if self.tile_size == 0 {
            return Err("tile size must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Decode contract
// =============================================================================

/// What to decode from a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeRequest {
    pub scene: SceneSelector,
}

impl DecodeRequest {
    pub fn scene(scene: SceneSelector) -> Self {
        Self { scene }
    }
}

/// Result of a decode.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// The decoded array in the adapter's declared axis layout.
    pub raw: RawArray,
    pub metadata: ImageMetadata,
    /// Every series of the source, as listed by the decoder.
    pub scenes: Vec<SceneDescriptor>,
    /// Non-fatal findings worth reporting.
    pub warnings: Vec<String>,
    /// Conversion history stored in the source, if any.
    pub history: Option<serde_json::Value>,
}

impl Decoded {
    pub fn new(raw: RawArray, metadata: ImageMetadata) -> Self {
        Self {
            raw,
            metadata,
            scenes: Vec::new(),
            warnings: Vec::new(),
            history: None,
        }
    }

    /// True for sources exposing more than one series.
    pub fn is_multi_series(&self) -> bool {
        self.scenes.len() > 1
    }
}

/// A pluggable translator between one file format and the canonical model.
#[async_trait]
pub trait FormatAdapter: Send + Sync {
    /// Format this adapter handles.
    fn format(&self) -> SourceFormat;

    fn can_decode(&self) -> bool {
        true
    }

    fn can_encode(&self) -> bool {
        true
    }

    /// List the series of a source without decoding pixels.
    async fn list_scenes(&self, path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError>;

    /// Decode the requested series of `path`.
    async fn decode(&self, path: &Path, request: &DecodeRequest) -> Result<Decoded, AdapterError>;

    /// Write `pyramid` and `metadata` to `path`.
    ///
    /// Returns the number of bytes written.
    async fn encode(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        options: &EncodeOptions,
    ) -> Result<u64, AdapterError>;

    /// Like [`encode`](Self::encode), carrying the source's conversion
    /// history along. Formats that do not store history ignore it.
    async fn encode_with_history(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        options: &EncodeOptions,
        _history: Option<&serde_json::Value>,
    ) -> Result<u64, AdapterError> {
        self.encode(pyramid, metadata, path, options).await
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Adapters keyed by format.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceFormat, Arc<dyn FormatAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter`, replacing any adapter for the same format.
    pub fn register(&mut self, adapter: Arc<dyn FormatAdapter>) -> &mut Self {
        self.adapters.insert(adapter.format(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn FormatAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, format: SourceFormat) -> Option<Arc<dyn FormatAdapter>> {
        self.adapters.get(&format).cloned()
    }

    pub fn decoder(&self, format: SourceFormat) -> Option<Arc<dyn FormatAdapter>> {
        self.get(format).filter(|a| a.can_decode())
    }

    pub fn encoder(&self, format: SourceFormat) -> Option<Arc<dyn FormatAdapter>> {
        self.get(format).filter(|a| a.can_encode())
    }

    pub fn formats(&self) -> Vec<SourceFormat> {
        let mut formats: Vec<SourceFormat> = self.adapters.keys().copied().collect();
        formats.sort_by_key(|f| f.name());
        formats
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}
