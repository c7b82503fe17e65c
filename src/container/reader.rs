//! Container reader.
//!
//! Opening a container checks the HDF5 signature and the root schema stamp
//! before looking at anything else, then loads every attribute and dataset
//! shape into a [`ContainerIndex`]. Samples are only read on request;
//! [`ContainerReader::read_region`] reads only the chunks a window touches.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hdf5::{Dataset, File};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ContainerError, IoError, ShapeError};
use crate::format::SourceFormat;
use crate::io::{LocalFileReader, RangeReader};
use crate::model::tensor::region_offsets;
use crate::model::{
    parse_timestamp, CanonicalTensor, ImageMetadata, PhysicalSize, PixelBuffer, PixelType,
    Thumbnail, DEFAULT_UNIT,
};

use super::codec::sample_checksum;
use super::h5::{read_attrs, read_block, read_samples, read_text, snapshot};
use super::layout::{
    chunk_grid, is_hdf5_signature, level_chunk_shape, ravel, resolution_path, AttrValue, Attrs,
    ContainerIndex, DatasetLayout, CHANNELS, CHECKSUM_ATTR, CONVERSION_HISTORY, DIMENSIONS,
    FORMAT_NAME, HDF5_SIGNATURE, IMAGE_DATA, PHYSICAL_SIZE, PROVENANCE, ROOT, SOURCE,
    SUPPORTED_MAJOR, THUMBNAIL,
};
use super::provenance::Provenance;

/// Decoded chunks kept per open container.
const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 64;

/// Nodes a readable container must have besides the schema stamp.
const REQUIRED_NODES: [&str; 4] = [IMAGE_DATA, DIMENSIONS, PHYSICAL_SIZE, SOURCE];

// =============================================================================
// Schema
// =============================================================================

fn major_version(value: &str) -> Option<u64> {
    value.split('.').next()?.trim().parse().ok()
}

/// Check the root schema stamp: format name and major versions.
pub fn check_schema(root: Option<&Attrs>) -> Result<(), ContainerError> {
    let root = root.ok_or_else(|| ContainerError::SchemaMismatch {
        found: "no root group".to_string(),
        reason: "schema stamp is missing".to_string(),
    })?;

    match root.get("format").and_then(AttrValue::as_str) {
        Some(FORMAT_NAME) => {}
        other => {
            return Err(ContainerError::SchemaMismatch {
                found: format!("format={}", other.unwrap_or("<none>")),
                reason: format!("expected format {}", FORMAT_NAME),
            })
        }
    }

    for key in ["version", "schema_version"] {
        let value = root.get(key).and_then(AttrValue::as_str);
        if value.and_then(major_version) != Some(SUPPORTED_MAJOR) {
            return Err(ContainerError::SchemaMismatch {
                found: format!("{}={}", key, value.unwrap_or("<none>")),
                reason: format!("supported major version is {}", SUPPORTED_MAJOR),
            });
        }
    }
    Ok(())
}

fn check_required(index: &ContainerIndex) -> Result<(), ContainerError> {
    for path in REQUIRED_NODES {
        if !index.contains(path) {
            return Err(ContainerError::CorruptContainer(format!("missing {}", path)));
        }
    }

    let levels = index.level_count();
    if levels == 0 {
        return Err(ContainerError::CorruptContainer(format!(
            "missing {}",
            resolution_path(0)
        )));
    }
    for level in 0..levels {
        let path = resolution_path(level);
        if let Some(layout) = index.dataset(&path) {
            if layout.shape.len() != 5 {
                return Err(ContainerError::CorruptContainer(format!(
                    "{} has rank {}, expected 5",
                    path,
                    layout.shape.len()
                )));
            }
            if layout.dtype.is_none() {
                return Err(ContainerError::CorruptContainer(format!(
                    "{} does not hold uint8, uint16, float32 or float64 samples",
                    path
                )));
            }
        }
    }
    Ok(())
}

fn text_attr(attrs: &Attrs, key: &str) -> Option<String> {
    attrs.get(key).and_then(AttrValue::as_str).map(str::to_string)
}

/// Fail with `CorruptContainer` unless `path` starts with the HDF5 signature.
pub async fn check_signature(path: &Path) -> Result<(), ContainerError> {
    let reader = LocalFileReader::open(path).await?;
    let len = (reader.size() as usize).min(HDF5_SIGNATURE.len());
    let head = reader.read_exact_at(0, len).await?;
    if !is_hdf5_signature(&head) {
        return Err(ContainerError::CorruptContainer(format!(
            "{} is not an HDF5 file",
            path.display()
        )));
    }
    Ok(())
}

/// Run HDF5 work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ContainerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ContainerError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ContainerError::Io(IoError::Io(format!("HDF5 worker failed: {}", e))))?
}

/// Open `path`, check its schema stamp, and load the index.
///
/// The stamp is read and checked on its own; nothing else in the file is
/// touched when it is wrong.
pub async fn open_index(path: &Path) -> Result<(File, ContainerIndex), ContainerError> {
    check_signature(path).await?;
    let path = path.to_path_buf();
    blocking(move || {
        let file = File::open(&path)?;
        check_schema(Some(&read_attrs(&file)?))?;
        let index = snapshot(&file)?;
        Ok((file, index))
    })
    .await
}

// =============================================================================
// ContainerReader
// =============================================================================

/// An open `.univ` container.
pub struct ContainerReader {
    path: PathBuf,
    identifier: String,
    file: File,
    index: ContainerIndex,
    level_count: usize,
    cache: Mutex<LruCache<(usize, usize), Arc<PixelBuffer>>>,
}

impl ContainerReader {
    /// Open a container file.
    ///
    /// Fails with `Io` if the file cannot be read, with `CorruptContainer`
    /// if it is not HDF5, with `SchemaMismatch` if the root stamp is absent
    /// or unsupported, and with `CorruptContainer` if a required group is
    /// missing.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let path = path.as_ref();
        let (file, index) = open_index(path).await?;
        check_required(&index)?;

        let level_count = index.level_count();
        debug!(
            "Opened container {} with {} level(s)",
            path.display(),
            level_count
        );

        let capacity = NonZeroUsize::new(DEFAULT_CHUNK_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            path: path.to_path_buf(),
            identifier: path.display().to_string(),
            file,
            index,
            level_count,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &ContainerIndex {
        &self.index
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn level_count(&self) -> usize {
        self.level_count
    }

    fn level_layout(&self, level: usize) -> Result<&DatasetLayout, ContainerError> {
        if level >= self.level_count {
            return Err(ContainerError::MissingLevel(level));
        }
        self.index
            .dataset(&resolution_path(level))
            .ok_or(ContainerError::MissingLevel(level))
    }

    fn dtype_of(path: &str, layout: &DatasetLayout) -> Result<PixelType, ContainerError> {
        layout.dtype.ok_or_else(|| {
            ContainerError::CorruptContainer(format!("{} does not hold pixel samples", path))
        })
    }

    fn open_dataset(&self, path: &str) -> Result<Dataset, ContainerError> {
        Ok(self.file.dataset(path.trim_start_matches('/'))?)
    }

    /// `(T, C, Z, Y, X)` extents of `level`.
    pub fn level_shape(&self, level: usize) -> Result<[usize; 5], ContainerError> {
        let shape = &self.level_layout(level)?.shape;
        Ok([shape[0], shape[1], shape[2], shape[3], shape[4]])
    }

    pub fn pixel_type(&self) -> Result<PixelType, ContainerError> {
        Self::dtype_of(&resolution_path(0), self.level_layout(0)?)
    }

    /// Read a whole dataset into one buffer.
    async fn read_dataset(&self, path: &str) -> Result<PixelBuffer, ContainerError> {
        let layout = self
            .index
            .dataset(path)
            .ok_or_else(|| ContainerError::CorruptContainer(format!("missing {}", path)))?;
        let dtype = Self::dtype_of(path, layout)?;
        let dataset = self.open_dataset(path)?;
        blocking(move || read_samples(&dataset, dtype)).await
    }

    /// Read the full tensor of `level`.
    pub async fn read_level(&self, level: usize) -> Result<CanonicalTensor, ContainerError> {
        let shape = self.level_shape(level)?;
        let data = self.read_dataset(&resolution_path(level)).await?;
        Ok(CanonicalTensor::new(shape, data)?)
    }

    /// Read the thumbnail, if the container has one.
    pub async fn read_thumbnail(&self) -> Result<Option<Thumbnail>, ContainerError> {
        let Some(layout) = self.index.dataset(THUMBNAIL) else {
            return Ok(None);
        };
        if layout.shape.len() != 3 {
            return Err(ContainerError::CorruptContainer(format!(
                "{} has rank {}, expected 3",
                THUMBNAIL,
                layout.shape.len()
            )));
        }
        let shape = [layout.shape[0], layout.shape[1], layout.shape[2]];
        let data = self.read_dataset(THUMBNAIL).await?;
        Ok(Some(Thumbnail::new(shape, data)?))
    }

    /// Read a `(y, x)` window of one plane of `level`.
    ///
    /// Only the chunks overlapping the window are read; they are kept in a
    /// small per-handle LRU.
    pub async fn read_region(
        &self,
        level: usize,
        plane: (usize, usize, usize),
        y: Range<usize>,
        x: Range<usize>,
    ) -> Result<CanonicalTensor, ContainerError> {
        let path = resolution_path(level);
        let layout = self.level_layout(level)?;
        let dtype = Self::dtype_of(&path, layout)?;
        let shape = self.level_shape(level)?;
        let (t, c, z) = plane;
        if t >= shape[0]
            || c >= shape[1]
            || z >= shape[2]
            || y.start >= y.end
            || x.start >= x.end
            || y.end > shape[3]
            || x.end > shape[4]
        {
            return Err(ShapeError::unsupported(
                &shape,
                format!(
                    "region t={} c={} z={} y={:?} x={:?} is outside the level",
                    t, c, z, y, x
                ),
            )
            .into());
        }

        let cs: [usize; 5] = match layout.chunk_shape.as_deref() {
            Some(&[ct, cc, cz, cy, cx]) => [ct, cc, cz, cy, cx],
            _ => level_chunk_shape(shape),
        };
        let grid = chunk_grid(&shape, &cs);
        let (h, w) = (y.len(), x.len());
        let mut out = PixelBuffer::zeros(dtype, h * w);
        let dataset = self.open_dataset(&path)?;

        for gy in y.start / cs[3]..=(y.end - 1) / cs[3] {
            for gx in x.start / cs[4]..=(x.end - 1) / cs[4] {
                let coords = [t / cs[0], c / cs[1], z / cs[2], gy, gx];
                let origin: [usize; 5] = std::array::from_fn(|i| coords[i] * cs[i]);
                let extent: [usize; 5] = std::array::from_fn(|i| cs[i].min(shape[i] - origin[i]));
                let chunk = ravel(&coords, &grid);
                let data = self
                    .cached_chunk(&dataset, dtype, level, chunk, origin, extent)
                    .await?;

                let y0 = y.start.max(origin[3]);
                let y1 = y.end.min(origin[3] + extent[3]);
                let x0 = x.start.max(origin[4]);
                let x1 = x.end.min(origin[4] + extent[4]);

                let src = region_offsets(
                    &extent,
                    &[t - origin[0], c - origin[1], z - origin[2], y0 - origin[3], x0 - origin[4]],
                    &[1, 1, 1, y1 - y0, x1 - x0],
                );
                let dst = region_offsets(&[h, w], &[y0 - y.start, x0 - x.start], &[y1 - y0, x1 - x0]);
                out.scatter(&data.gather(&src), &dst)?;
            }
        }

        Ok(CanonicalTensor::new([1, 1, 1, h, w], out)?)
    }

    async fn cached_chunk(
        &self,
        dataset: &Dataset,
        dtype: PixelType,
        level: usize,
        chunk: usize,
        origin: [usize; 5],
        extent: [usize; 5],
    ) -> Result<Arc<PixelBuffer>, ContainerError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(data) = cache.get(&(level, chunk)) {
                return Ok(data.clone());
            }
        }

        let dataset = dataset.clone();
        let data = Arc::new(blocking(move || read_block(&dataset, dtype, origin, extent)).await?);
        self.cache.lock().await.put((level, chunk), data.clone());
        Ok(data)
    }

    /// Re-read every sample of the dataset at `path` and compare it with its
    /// recorded SHA-256.
    ///
    /// Returns `false` when the dataset carries no checksum.
    pub async fn verify_dataset(&self, path: &str) -> Result<bool, ContainerError> {
        let data = self.read_dataset(path).await?;
        let Some(expected) = self
            .index
            .attrs_of(path)
            .and_then(|attrs| text_attr(attrs, CHECKSUM_ATTR))
        else {
            return Ok(false);
        };
        if sample_checksum(&data) != expected {
            return Err(ContainerError::ChecksumMismatch {
                path: path.to_string(),
            });
        }
        Ok(true)
    }

    /// Metadata as recorded under `/Metadata`.
    pub fn metadata(&self) -> Result<ImageMetadata, ContainerError> {
        metadata_from_index(&self.index)
    }

    pub fn provenance(&self) -> Option<Provenance> {
        self.index.attrs_of(PROVENANCE).map(Provenance::from_attrs)
    }

    /// Parsed `/Provenance/conversion_history`, if present.
    pub async fn read_conversion_history(
        &self,
    ) -> Result<Option<serde_json::Value>, ContainerError> {
        if self.index.dataset(CONVERSION_HISTORY).is_none() {
            return Ok(None);
        }
        let dataset = self.open_dataset(CONVERSION_HISTORY)?;
        let json = blocking(move || read_text(&dataset)).await?;
        serde_json::from_str(&json).map(Some).map_err(|e| {
            ContainerError::CorruptContainer(format!("{}: {}", CONVERSION_HISTORY, e))
        })
    }
}

/// Rebuild [`ImageMetadata`] from the metadata groups of `index`.
pub fn metadata_from_index(index: &ContainerIndex) -> Result<ImageMetadata, ContainerError> {
    let group = |path: &str| {
        index
            .attrs_of(path)
            .ok_or_else(|| ContainerError::CorruptContainer(format!("missing {}", path)))
    };

    let physical = group(PHYSICAL_SIZE)?;
    let number = |key: &str| physical.get(key).and_then(AttrValue::as_f64);
    let mut physical_size = PhysicalSize::new(number("X"), number("Y"), number("Z"));
    physical_size.unit = text_attr(physical, "Unit").unwrap_or_else(|| DEFAULT_UNIT.to_string());

    let source = group(SOURCE)?;
    let source_format = text_attr(source, "OriginalFormat")
        .and_then(|f| SourceFormat::from_name(&f))
        .unwrap_or(SourceFormat::Univ);
    let mut metadata = ImageMetadata::new(
        text_attr(source, "OriginalFile").unwrap_or_default(),
        source_format,
    )
    .with_physical_size(physical_size);

    if let Some(date) = text_attr(source, "ConversionDate").as_deref().and_then(parse_timestamp) {
        metadata.conversion_date = date;
    }
    metadata.scene_name = text_attr(source, "SceneName");
    metadata.scene_index = source
        .get("SceneIndex")
        .and_then(AttrValue::as_i64)
        .and_then(|v| usize::try_from(v).ok());
    metadata.resolution_level = source
        .get("ResolutionLevel")
        .and_then(AttrValue::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);

    if let Some(channels) = index.attrs_of(CHANNELS) {
        metadata.channel_names = (0..)
            .map_while(|i| text_attr(channels, &format!("Channel_{}", i)))
            .collect();
    }
    Ok(metadata)
}
