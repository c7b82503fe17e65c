//! Test utilities for integration tests.
//!
//! Synthetic tensors, an in-memory VSI backend, an adapter wrapper that
//! fails on demand, and helpers that edit container files in place.

use async_trait::async_trait;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use univ_convert::container::h5::set_attr;
use univ_convert::container::layout::{AttrValue, ROOT};
use univ_convert::error::AdapterError;
use univ_convert::format::vsi::{SlideBackend, SlideScene};
use univ_convert::format::{
    DecodeRequest, Decoded, EncodeOptions, FormatAdapter, SourceFormat, UnivAdapter,
};
use univ_convert::model::{
    CanonicalTensor, ImageMetadata, ImagePyramid, PhysicalSize, PixelBuffer, PixelType,
    SceneDescriptor,
};

// =============================================================================
// Synthetic images
// =============================================================================

/// A u16 tensor whose samples encode their own coordinates.
pub fn ramp_u16(shape: [usize; 5]) -> CanonicalTensor {
    let [t, c, z, y, x] = shape;
    let mut data = Vec::with_capacity(shape.iter().product());
    for ti in 0..t {
        for ci in 0..c {
            for zi in 0..z {
                for yi in 0..y {
                    for xi in 0..x {
                        data.push(((ti * 31 + ci * 17 + zi * 13 + yi * 3 + xi) % 65_536) as u16);
                    }
                }
            }
        }
    }
    CanonicalTensor::new(shape, data.into()).unwrap()
}

/// A u8 tensor with a smooth gradient, friendly to lossy codecs.
pub fn gradient_u8(shape: [usize; 5]) -> CanonicalTensor {
    let [_, _, _, y, x] = shape;
    let plane: Vec<u8> = (0..y * x)
        .map(|i| (((i / x) + (i % x)) * 255 / (y + x)) as u8)
        .collect();
    let planes = shape[0] * shape[1] * shape[2];
    let data: Vec<u8> = plane.iter().copied().cycle().take(plane.len() * planes).collect();
    CanonicalTensor::new(shape, data.into()).unwrap()
}

pub fn sample_metadata(channels: usize) -> ImageMetadata {
    ImageMetadata::new("sample.ome.tiff", SourceFormat::OmeTiff)
        .with_physical_size(PhysicalSize::new(Some(0.5), Some(0.5), Some(2.0)))
        .with_channel_names((0..channels).map(|c| format!("Ch{}", c)).collect())
}

/// Write `tensor` as a base-only container.
pub async fn write_container(path: &Path, tensor: CanonicalTensor, options: &EncodeOptions) {
    let channels = tensor.size_c();
    UnivAdapter::new()
        .encode(
            &ImagePyramid::base_only(tensor),
            &sample_metadata(channels),
            path,
            options,
        )
        .await
        .unwrap();
}

/// Every file and directory below `dir`, as paths relative to it.
pub fn list_tree(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            out.push(path.strip_prefix(dir).unwrap().display().to_string());
            if path.is_dir() {
                pending.push(path);
            }
        }
    }
    out.sort();
    out
}

/// Names of the intermediate containers left in `dir`.
pub fn intermediates(dir: &Path) -> Vec<String> {
    list_tree(dir)
        .into_iter()
        .filter(|name| name.ends_with(".temp.univ"))
        .collect()
}

// =============================================================================
// Container surgery
// =============================================================================

/// Set a scalar attribute on the group or dataset at `node` of the
/// container at `path`.
pub fn set_container_attr(path: &Path, node: &str, key: &str, value: AttrValue) {
    let file = hdf5::File::open_rw(path).unwrap();
    if node == ROOT {
        set_attr(&file, key, &value).unwrap();
    } else if let Ok(group) = file.group(node) {
        set_attr(&group, key, &value).unwrap();
    } else {
        set_attr(&file.dataset(node).unwrap(), key, &value).unwrap();
    }
}

/// Set a root schema attribute of the container at `path`.
pub fn restamp(path: &Path, key: &str, value: &str) {
    set_container_attr(path, ROOT, key, AttrValue::from(value));
}

/// Unlink the group or dataset at `node`.
pub fn remove_node(path: &Path, node: &str) {
    let file = hdf5::File::open_rw(path).unwrap();
    file.unlink(node.trim_start_matches('/')).unwrap();
}

/// Offset of the first occurrence of `needle` in the file at `path`.
pub fn find_bytes(path: &Path, needle: &[u8]) -> Option<usize> {
    let bytes = std::fs::read(path).unwrap();
    bytes.windows(needle.len()).position(|w| w == needle)
}

// =============================================================================
// In-memory VSI backend
// =============================================================================

/// One synthetic slide scene, all pixels generated on demand.
pub fn vsi_scene(name: &str, height: usize, width: usize, channels: usize) -> SlideScene {
    SlideScene {
        name: name.to_string(),
        shape: [1, channels, 1, height, width, 1],
        pixel_type: PixelType::Uint16,
        physical_size: PhysicalSize::new(Some(0.25), Some(0.25), Some(1.0)),
        channel_names: (0..channels).map(|c| format!("DAPI{}", c)).collect(),
    }
}

/// Value of pixel `(c, y, x)` of scene `scene`.
pub fn vsi_pixel(scene: usize, c: usize, y: usize, x: usize) -> u16 {
    ((scene * 1000 + c * 100 + y * 7 + x) % 65_536) as u16
}

/// A slide reader holding its scenes in memory.
pub struct MemorySlideBackend {
    scenes: Vec<SlideScene>,
    reads: AtomicUsize,
}

impl MemorySlideBackend {
    pub fn new(scenes: Vec<SlideScene>) -> Self {
        Self {
            scenes,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlideBackend for MemorySlideBackend {
    async fn scenes(&self, _path: &Path) -> Result<Vec<SlideScene>, AdapterError> {
        Ok(self.scenes.clone())
    }

    async fn read_region(
        &self,
        _path: &Path,
        scene: usize,
        y: Range<usize>,
        x: Range<usize>,
    ) -> Result<PixelBuffer, AdapterError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let s = self.scenes.get(scene).ok_or(AdapterError::SceneOutOfRange {
            index: scene,
            count: self.scenes.len(),
        })?;
        let channels = s.shape[1];
        let mut out = Vec::with_capacity(channels * y.len() * x.len());
        for c in 0..channels {
            for yi in y.clone() {
                for xi in x.clone() {
                    out.push(vsi_pixel(scene, c, yi, xi));
                }
            }
        }
        Ok(PixelBuffer::U16(out))
    }
}

// =============================================================================
// Failing adapter
// =============================================================================

/// A univ adapter whose decode always fails; encoding works normally.
#[derive(Debug, Default)]
pub struct FailingUnivDecoder {
    inner: UnivAdapter,
    pub decode_attempts: AtomicUsize,
}

#[async_trait]
impl FormatAdapter for FailingUnivDecoder {
    fn format(&self) -> SourceFormat {
        SourceFormat::Univ
    }

    async fn list_scenes(&self, path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError> {
        self.inner.list_scenes(path).await
    }

    async fn decode(&self, _path: &Path, _request: &DecodeRequest) -> Result<Decoded, AdapterError> {
        self.decode_attempts.fetch_add(1, Ordering::SeqCst);
        Err(AdapterError::Malformed("injected decode failure".to_string()))
    }

    async fn encode(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        options: &EncodeOptions,
    ) -> Result<u64, AdapterError> {
        self.inner.encode(pyramid, metadata, path, options).await
    }
}

/// An adapter that writes nothing and claims success.
#[derive(Debug)]
pub struct HollowEncoder(pub SourceFormat);

#[async_trait]
impl FormatAdapter for HollowEncoder {
    fn format(&self) -> SourceFormat {
        self.0
    }

    fn can_decode(&self) -> bool {
        false
    }

    async fn list_scenes(&self, _path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError> {
        Err(AdapterError::Unsupported("encode only".to_string()))
    }

    async fn decode(&self, _path: &Path, _request: &DecodeRequest) -> Result<Decoded, AdapterError> {
        Err(AdapterError::Unsupported("encode only".to_string()))
    }

    async fn encode(
        &self,
        _pyramid: &ImagePyramid,
        _metadata: &ImageMetadata,
        path: &Path,
        _options: &EncodeOptions,
    ) -> Result<u64, AdapterError> {
        tokio::fs::write(path, b"").await?;
        Ok(0)
    }
}
