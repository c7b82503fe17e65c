//! Olympus VSI adapter.
//!
//! VSI pixel data lives in a proprietary layout next to the `.vsi` file, in
//! a `_<stem>_` (or `<stem>.vsi_data`) folder. Decoding goes through a
//! [`SlideBackend`] supplied by the caller; without one the adapter can only
//! write. Output is a VSI-compatible OME-TIFF: LZW pages in 512-row strips.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::AdapterError;
use crate::model::tensor::region_offsets;
use crate::model::{
    file_name_of, AxisLayout, ImageMetadata, ImagePyramid, PhysicalSize, PixelBuffer, PixelType,
    RawArray, SceneDescriptor,
};

use super::adapter::{DecodeRequest, Decoded, EncodeOptions, FormatAdapter};
use super::detect::SourceFormat;
use super::ome_tiff::{write_ome_tiff, PageCompression, TiffWriteSettings};

/// Scenes larger than this are read region by region.
pub const TILED_READ_BYTES: u64 = 3 * (1 << 29); // 1.5 GiB

/// Scenes wider or taller than this are read region by region.
pub const TILED_READ_EXTENT: usize = 10_000;

/// Edge of the regions used for tiled reads.
pub const READ_TILE: usize = 1024;

/// Strip height of VSI-compatible output.
pub const OUTPUT_ROWS_PER_STRIP: u32 = 512;

// =============================================================================
// Backend
// =============================================================================

/// One scene as reported by a slide backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideScene {
    pub name: String,
    /// `(T, C, Z, Y, X, S)`; `S` is samples per pixel.
    pub shape: [usize; 6],
    pub pixel_type: PixelType,
    pub physical_size: PhysicalSize,
    pub channel_names: Vec<String>,
}

impl SlideScene {
    pub fn width(&self) -> usize {
        self.shape[4]
    }

    pub fn height(&self) -> usize {
        self.shape[3]
    }

    /// Decoded size of the whole scene in bytes.
    pub fn expected_bytes(&self) -> u64 {
        self.shape
            .iter()
            .fold(self.pixel_type.element_size() as u64, |acc, &n| {
                acc.saturating_mul(n as u64)
            })
    }

    /// Whether the scene should be read in [`READ_TILE`] regions.
    pub fn needs_tiled_read(&self) -> bool {
        self.expected_bytes() > TILED_READ_BYTES
            || self.height() > TILED_READ_EXTENT
            || self.width() > TILED_READ_EXTENT
    }
}

/// Reader for the proprietary VSI pixel layout.
#[async_trait]
pub trait SlideBackend: Send + Sync {
    /// Every scene of the slide at `path`, in file order.
    async fn scenes(&self, path: &Path) -> Result<Vec<SlideScene>, AdapterError>;

    /// Read rows `y` and columns `x` of every plane of `scene`.
    ///
    /// The result is C-ordered with shape `(T, C, Z, y.len(), x.len(), S)`.
    async fn read_region(
        &self,
        path: &Path,
        scene: usize,
        y: Range<usize>,
        x: Range<usize>,
    ) -> Result<PixelBuffer, AdapterError>;
}

// =============================================================================
// Helpers
// =============================================================================

/// The folder holding the pixel data of `path`, if present.
pub fn find_data_folder(path: &Path) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_string_lossy();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    [
        parent.join(format!("_{}_", stem)),
        path.with_extension("vsi_data"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_dir())
}

/// Read a scene in [`READ_TILE`] regions and stitch them together.
async fn read_tiled(
    backend: &dyn SlideBackend,
    path: &Path,
    index: usize,
    scene: &SlideScene,
) -> Result<PixelBuffer, AdapterError> {
    let shape = scene.shape;
    let total: usize = shape.iter().product();
    let mut data = PixelBuffer::zeros(scene.pixel_type, total);
    let (height, width) = (scene.height(), scene.width());
    let mut regions = 0usize;

    for y0 in (0..height).step_by(READ_TILE) {
        for x0 in (0..width).step_by(READ_TILE) {
            let y = y0..(y0 + READ_TILE).min(height);
            let x = x0..(x0 + READ_TILE).min(width);
            let extent = [shape[0], shape[1], shape[2], y.len(), x.len(), shape[5]];
            let region = backend.read_region(path, index, y, x).await?;
            check_region(&region, scene.pixel_type, extent.iter().product())?;

            let offsets = region_offsets(&shape, &[0, 0, 0, y0, x0, 0], &extent);
            data.scatter(&region, &offsets)?;
            regions += 1;
        }
    }

    debug!("Stitched {} region(s) of scene {}", regions, index);
    Ok(data)
}

fn check_region(region: &PixelBuffer, pixel_type: PixelType, len: usize) -> Result<(), AdapterError> {
    if region.pixel_type() != pixel_type || region.len() != len {
        return Err(AdapterError::Malformed(format!(
            "backend returned {} {:?} samples, expected {} {:?}",
            region.len(),
            region.pixel_type(),
            len,
            pixel_type
        )));
    }
    Ok(())
}

fn descriptors(scenes: &[SlideScene]) -> Vec<SceneDescriptor> {
    scenes
        .iter()
        .enumerate()
        .map(|(i, s)| SceneDescriptor::new(i, s.name.clone(), s.width() as u64, s.height() as u64))
        .collect()
}

// =============================================================================
// Adapter
// =============================================================================

/// VSI reader (through a backend) and VSI-compatible writer.
#[derive(Clone, Default)]
pub struct VsiAdapter {
    backend: Option<Arc<dyn SlideBackend>>,
}

impl VsiAdapter {
    /// An adapter that can write but not read.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn SlideBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&dyn SlideBackend, AdapterError> {
        self.backend.as_deref().ok_or_else(|| {
            AdapterError::BackendUnavailable(
                "no slide backend is linked for VSI input".to_string(),
            )
        })
    }
}

impl std::fmt::Debug for VsiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsiAdapter")
            .field("has_backend", &self.has_backend())
            .finish()
    }
}

#[async_trait]
impl FormatAdapter for VsiAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::Vsi
    }

    async fn list_scenes(&self, path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError> {
        let scenes = self.backend()?.scenes(path).await?;
        Ok(descriptors(&scenes))
    }

    async fn decode(&self, path: &Path, request: &DecodeRequest) -> Result<Decoded, AdapterError> {
        let backend = self.backend()?;
        let mut warnings = Vec::new();

        match find_data_folder(path) {
            Some(folder) => debug!("VSI data folder: {}", folder.display()),
            None => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                warn!("VSI data folder not found next to {}", path.display());
                warnings.push(format!(
                    "VSI data folder not found: expected _{}_ or {}.vsi_data",
                    stem, stem
                ));
            }
        }

        let scenes = backend.scenes(path).await?;
        let listed = descriptors(&scenes);
        let selected = request.scene.resolve(&listed)?;
        let scene = &scenes[selected];

        let data = if scene.needs_tiled_read() {
            debug!(
                "Scene {} is {}x{} ({} bytes), reading in {} px regions",
                selected,
                scene.width(),
                scene.height(),
                scene.expected_bytes(),
                READ_TILE
            );
            read_tiled(backend, path, selected, scene).await?
        } else {
            let region = backend
                .read_region(path, selected, 0..scene.height(), 0..scene.width())
                .await?;
            check_region(&region, scene.pixel_type, scene.shape.iter().product())?;
            region
        };

        let [t, c, z, y, x, s] = scene.shape;
        let raw = if s == 1 {
            RawArray::new(vec![t, c, z, y, x], AxisLayout::TCZYX, data)
        } else {
            RawArray::new(scene.shape.to_vec(), AxisLayout::TCZYXS, data)
        };

        let metadata = ImageMetadata::new(file_name_of(path), SourceFormat::Vsi)
            .with_physical_size(scene.physical_size.clone())
            .with_channel_names(scene.channel_names.clone())
            .with_scene(selected, scene.name.clone());

        let mut decoded = Decoded::new(raw, metadata);
        decoded.scenes = listed;
        decoded.warnings = warnings;
        Ok(decoded)
    }

    async fn encode(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        _options: &EncodeOptions,
    ) -> Result<u64, AdapterError> {
        let settings = TiffWriteSettings {
            compression: PageCompression::Lzw,
            rows_per_strip: Some(OUTPUT_ROWS_PER_STRIP),
        };
        write_ome_tiff(pyramid, metadata, path, &settings)
    }
}
