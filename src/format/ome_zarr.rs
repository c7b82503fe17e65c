//! OME-Zarr adapter (NGFF 0.4 on a Zarr v2 directory store).
//!
//! ```text
//! image.ome.zarr/
//!   .zgroup                {"zarr_format": 2}
//!   .zattrs                multiscales + omero channel labels
//!   0/.zarray              base level, (T, C, Z, Y, X)
//!   0/t/c/z/y/x            chunks, "/" separated
//!   1/ ...                 pyramid levels
//! ```
//!
//! Arrays are read and written through `zarrs`, which owns the chunk grid,
//! the data types and the codecs. The decoder also accepts a bare array at
//! the store root whose axes are named by `_ARRAY_DIMENSIONS`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use zarrs::array::{Array, ArrayMetadata, DataType};
use zarrs::array_subset::ArraySubset;
use zarrs::group::Group;
use zarrs::storage::store::FilesystemStore;
use zarrs::storage::{
    ReadableStorageTraits, ReadableWritableListableStorage, ReadableWritableListableStorageTraits,
};

use crate::error::{AdapterError, IoError, ShapeError};
use crate::io::path_size;
use crate::model::{
    file_name_of, AxisLayout, CanonicalTensor, ImageMetadata, ImagePyramid, PhysicalSize,
    PixelBuffer, PixelType, RawArray, SceneDescriptor, SceneSelector,
};

use super::adapter::{Compression, DecodeRequest, Decoded, EncodeOptions, FormatAdapter};
use super::detect::SourceFormat;
use super::ome_xml::micrometres_per;

const ZGROUP: &str = ".zgroup";
const ZATTRS: &str = ".zattrs";
const NGFF_VERSION: &str = "0.4";
const SPACE_UNIT: &str = "micrometer";

/// Blosc level used by the fast codecs.
const BLOSC_LEVEL: u32 = 5;

// =============================================================================
// NGFF attributes
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Axis {
    name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    axis_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<String>,
}

/// NGFF 0.3 lists axes as bare names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AxisEntry {
    Full(Axis),
    Name(String),
}

impl AxisEntry {
    fn name(&self) -> &str {
        match self {
            AxisEntry::Full(axis) => &axis.name,
            AxisEntry::Name(name) => name,
        }
    }

    fn unit(&self) -> Option<&str> {
        match self {
            AxisEntry::Full(axis) => axis.unit.as_deref(),
            AxisEntry::Name(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CoordinateTransformation {
    Scale { scale: Vec<f64> },
    Translation { translation: Vec<f64> },
    Identity,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Dataset {
    path: String,

    #[serde(rename = "coordinateTransformations", default)]
    coordinate_transformations: Vec<CoordinateTransformation>,
}

impl Dataset {
    fn scale(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            CoordinateTransformation::Scale { scale } => Some(scale.as_slice()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MultiScale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    downscaling_type: Option<String>,

    #[serde(default)]
    axes: Vec<AxisEntry>,

    // Ordered from highest to lowest resolution.
    datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OmeroChannel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    color: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Omero {
    #[serde(default)]
    channels: Vec<OmeroChannel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RootAttrs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    multiscales: Vec<MultiScale>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    omero: Option<Omero>,

    #[serde(
        rename = "_ARRAY_DIMENSIONS",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    array_dimensions: Option<Vec<String>>,
}

// =============================================================================
// Zarr arrays
// =============================================================================

fn zarr_error(e: impl std::fmt::Display) -> AdapterError {
    AdapterError::Malformed(format!("zarr: {}", e))
}

fn open_store(path: &Path) -> Result<ReadableWritableListableStorage, AdapterError> {
    let store = FilesystemStore::new(path).map_err(zarr_error)?;
    Ok(Arc::new(store))
}

/// Store key of the array at `path` relative to the store root.
fn array_key(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

fn dtype_of(pixel_type: PixelType) -> &'static str {
    match pixel_type {
        PixelType::Uint8 => "|u1",
        PixelType::Uint16 => "<u2",
        PixelType::Float32 => "<f4",
        PixelType::Float64 => "<f8",
    }
}

fn blosc(shuffle: u8) -> Value {
    json!({
        "id": "blosc",
        "cname": "lz4",
        "clevel": BLOSC_LEVEL,
        "shuffle": shuffle,
        "blocksize": 0
    })
}

/// The numcodecs compressor for `options`, `null` when uncompressed.
fn compressor_for(options: &EncodeOptions) -> Result<Value, AdapterError> {
    Ok(match options.compression {
        Compression::None => Value::Null,
        Compression::LosslessGeneral => json!({ "id": "gzip", "level": options.compression_level }),
        Compression::FastGeneral => blosc(0),
        Compression::CombinableFilters => blosc(1),
        Compression::TiledLossy => {
            return Err(AdapterError::Unsupported(
                "tiled-lossy compression has no OME-Zarr codec".to_string(),
            ))
        }
    })
}

/// Zarr v2 metadata of one pyramid level.
fn level_metadata(
    shape: &[usize],
    chunks: &[usize],
    pixel_type: PixelType,
    compressor: &Value,
) -> Result<ArrayMetadata, AdapterError> {
    serde_json::from_value(json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": dtype_of(pixel_type),
        "compressor": compressor,
        "fill_value": 0,
        "order": "C",
        "filters": null,
        "dimension_separator": "/"
    }))
    .map_err(zarr_error)
}

/// Write one level as the array at `/<k>`.
fn write_level(
    store: &ReadableWritableListableStorage,
    k: usize,
    level: &CanonicalTensor,
    tile: usize,
    compressor: &Value,
) -> Result<(), AdapterError> {
    let shape = level.shape();
    let chunks = [1, 1, 1, tile.min(shape[3]).max(1), tile.min(shape[4]).max(1)];
    let metadata = level_metadata(&shape, &chunks, level.pixel_type(), compressor)?;
    let array = Array::new_with_metadata(store.clone(), &array_key(&k.to_string()), metadata)
        .map_err(zarr_error)?;
    array.store_metadata().map_err(zarr_error)?;

    let subset = ArraySubset::new_with_shape(array.shape().to_vec());
    match level.data() {
        PixelBuffer::U8(v) => array.store_array_subset_elements::<u8>(&subset, v),
        PixelBuffer::U16(v) => array.store_array_subset_elements::<u16>(&subset, v),
        PixelBuffer::F32(v) => array.store_array_subset_elements::<f32>(&subset, v),
        PixelBuffer::F64(v) => array.store_array_subset_elements::<f64>(&subset, v),
    }
    .map_err(zarr_error)
}

/// Wider or signed integers saturate into u16.
fn saturated<T: Into<i128>>(values: Vec<T>) -> PixelBuffer {
    PixelBuffer::U16(
        values
            .into_iter()
            .map(|v| {
                let wide: i128 = v.into();
                wide.clamp(0, i128::from(u16::MAX)) as u16
            })
            .collect(),
    )
}

fn shape_of<S: ?Sized>(array: &Array<S>) -> Vec<usize> {
    array.shape().iter().map(|&d| d as usize).collect()
}

/// Read a whole array into memory. Absent chunks read as the fill value.
fn read_elements<S>(array: &Array<S>) -> Result<PixelBuffer, AdapterError>
where
    S: ?Sized + ReadableStorageTraits + 'static,
{
    let subset = ArraySubset::new_with_shape(array.shape().to_vec());
    macro_rules! retrieve {
        ($t:ty) => {
            array
                .retrieve_array_subset_elements::<$t>(&subset)
                .map_err(zarr_error)?
        };
    }

    Ok(match array.data_type() {
        DataType::UInt8 => PixelBuffer::U8(retrieve!(u8)),
        DataType::UInt16 => PixelBuffer::U16(retrieve!(u16)),
        DataType::Float32 => PixelBuffer::F32(retrieve!(f32)),
        DataType::Float64 => PixelBuffer::F64(retrieve!(f64)),
        DataType::UInt32 => saturated(retrieve!(u32)),
        DataType::UInt64 => saturated(retrieve!(u64)),
        DataType::Int8 => saturated(retrieve!(i8)),
        DataType::Int16 => saturated(retrieve!(i16)),
        DataType::Int32 => saturated(retrieve!(i32)),
        DataType::Int64 => saturated(retrieve!(i64)),
        other => {
            return Err(AdapterError::Unsupported(format!(
                "Zarr data type {:?}",
                other
            )))
        }
    })
}

// =============================================================================
// Encoding
// =============================================================================

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AdapterError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| AdapterError::Malformed(format!("cannot serialize {}: {}", path.display(), e)))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn root_attrs(pyramid: &ImagePyramid, metadata: &ImageMetadata) -> RootAttrs {
    let ps = &metadata.physical_size;
    let axis = |name: &str, kind: &str, unit: Option<&str>| {
        AxisEntry::Full(Axis {
            name: name.to_string(),
            axis_type: Some(kind.to_string()),
            unit: unit.map(str::to_string),
        })
    };

    let datasets = (0..pyramid.level_count())
        .map(|k| {
            let factor = (1u64 << k) as f64;
            Dataset {
                path: k.to_string(),
                coordinate_transformations: vec![CoordinateTransformation::Scale {
                    scale: vec![1.0, 1.0, ps.z, ps.y * factor, ps.x * factor],
                }],
            }
        })
        .collect();

    let channels = metadata
        .channel_labels(pyramid.base.size_c())
        .into_iter()
        .map(|label| OmeroChannel {
            label: Some(label),
            color: Some("FFFFFF".to_string()),
            active: true,
        })
        .collect();

    RootAttrs {
        multiscales: vec![MultiScale {
            version: Some(NGFF_VERSION.to_string()),
            name: metadata.scene_name.clone().or_else(|| Some(metadata.source_file.clone())),
            downscaling_type: Some("stride".to_string()),
            axes: vec![
                axis("t", "time", None),
                axis("c", "channel", None),
                axis("z", "space", Some(SPACE_UNIT)),
                axis("y", "space", Some(SPACE_UNIT)),
                axis("x", "space", Some(SPACE_UNIT)),
            ],
            datasets,
        }],
        omero: Some(Omero { channels }),
        array_dimensions: None,
    }
}

/// Write the group metadata and every level of `pyramid` into `path`.
fn write_store(
    path: &Path,
    pyramid: &ImagePyramid,
    metadata: &ImageMetadata,
    options: &EncodeOptions,
) -> Result<(), AdapterError> {
    let compressor = compressor_for(options)?;
    std::fs::create_dir_all(path)?;
    write_json(&path.join(ZGROUP), &json!({ "zarr_format": 2 }))?;
    write_json(&path.join(ZATTRS), &root_attrs(pyramid, metadata))?;

    let store = open_store(path)?;
    for (k, level) in pyramid.iter().enumerate() {
        write_level(&store, k, level, options.tile_size, &compressor)?;
    }
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Map named axes onto a layout the normalizer understands.
fn layout_for_axes(names: &[String], shape: &[usize]) -> Result<(Vec<usize>, AxisLayout), AdapterError> {
    if names.len() != shape.len() {
        return Err(AdapterError::Malformed(format!(
            "{} axis name(s) for an array of rank {}",
            names.len(),
            shape.len()
        )));
    }
    let lower: Vec<String> = names.iter().map(|n| n.to_ascii_lowercase()).collect();
    let joined: String = lower.concat();

    if joined == "zcyx" {
        return Ok((shape.to_vec(), AxisLayout::ZCYX));
    }

    // Any subsequence of t, c, z, y, x pads to the canonical axes.
    let canonical = ["t", "c", "z", "y", "x"];
    let mut padded = [1usize; 5];
    let mut next = 0;
    for (name, &extent) in lower.iter().zip(shape) {
        match canonical[next..].iter().position(|c| c == name) {
            Some(offset) => {
                next += offset;
                padded[next] = extent;
                next += 1;
            }
            None => {
                return Err(AdapterError::Shape(ShapeError::unsupported(
                    shape,
                    format!("axis order '{}'", joined),
                )))
            }
        }
    }
    Ok((padded.to_vec(), AxisLayout::TCZYX))
}

/// Layout of an array: named axes when given, otherwise by rank.
fn layout_for(names: Option<&[String]>, shape: Vec<usize>) -> Result<(Vec<usize>, AxisLayout), AdapterError> {
    match names.filter(|names| !names.is_empty()) {
        Some(names) => layout_for_axes(names, &shape),
        None => {
            let layout = AxisLayout::for_rank(shape.len()).ok_or_else(|| {
                ShapeError::unsupported(&shape, "unnamed axes of unsupported rank")
            })?;
            Ok((shape, layout))
        }
    }
}

fn physical_size_from(axes: &[AxisEntry], scale: Option<&[f64]>) -> PhysicalSize {
    let Some(scale) = scale.filter(|s| s.len() == axes.len()) else {
        return PhysicalSize::default();
    };
    let lookup = |target: &str| {
        axes.iter().zip(scale).find_map(|(axis, &value)| {
            axis.name()
                .eq_ignore_ascii_case(target)
                .then(|| value * axis.unit().map(micrometres_per).unwrap_or(1.0))
        })
    };
    PhysicalSize::new(lookup("x"), lookup("y"), lookup("z"))
}

/// `(width, height)` of the trailing two axes.
fn plane_extent(shape: &[usize]) -> (u64, u64) {
    match shape.len() {
        0 => (0, 0),
        1 => (shape[0] as u64, 1),
        n => (shape[n - 1] as u64, shape[n - 2] as u64),
    }
}

fn scene_name(multiscale: &MultiScale, index: usize) -> String {
    multiscale
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("Image {}", index))
}

fn no_image(path: &Path) -> AdapterError {
    AdapterError::Malformed(format!("{} holds no multiscales or array", path.display()))
}

/// An opened store: its root attributes and a handle for its arrays.
struct ZarrStore {
    path: PathBuf,
    storage: ReadableWritableListableStorage,
    attrs: RootAttrs,
}

impl ZarrStore {
    fn open(path: &Path) -> Result<Self, AdapterError> {
        if !std::fs::metadata(path)?.is_dir() {
            return Err(AdapterError::Malformed(format!(
                "{} is not a Zarr directory",
                path.display()
            )));
        }
        let storage = open_store(path)?;
        // A bare array at the root has no group metadata.
        let attrs = match Group::open(storage.clone(), "/") {
            Ok(group) => serde_json::from_value(Value::Object(group.attributes().clone()))
                .map_err(|e| AdapterError::Malformed(format!("{}: {}", path.display(), e)))?,
            Err(e) => {
                debug!("{}: no root group ({})", path.display(), e);
                RootAttrs::default()
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            storage,
            attrs,
        })
    }

    fn array(&self, path: &str) -> Result<Array<dyn ReadableWritableListableStorageTraits>, AdapterError> {
        Array::open(self.storage.clone(), &array_key(path)).map_err(zarr_error)
    }

    fn scenes(&self) -> Result<Vec<SceneDescriptor>, AdapterError> {
        if self.attrs.multiscales.is_empty() {
            let array = self.array("/").map_err(|_| no_image(&self.path))?;
            let (width, height) = plane_extent(&shape_of(&array));
            return Ok(vec![SceneDescriptor::new(0, file_name_of(&self.path), width, height)]);
        }

        let mut scenes = Vec::with_capacity(self.attrs.multiscales.len());
        for (i, multiscale) in self.attrs.multiscales.iter().enumerate() {
            let dataset = multiscale.datasets.first().ok_or_else(|| {
                AdapterError::Malformed(format!("multiscales[{}] lists no datasets", i))
            })?;
            let (width, height) = plane_extent(&shape_of(&self.array(&dataset.path)?));
            scenes.push(SceneDescriptor::new(i, scene_name(multiscale, i), width, height));
        }
        Ok(scenes)
    }

    fn decode_bare(self, scene: SceneSelector) -> Result<Decoded, AdapterError> {
        let scenes = self.scenes()?;
        scene.resolve(&scenes)?;

        let array = self.array("/")?;
        let data = read_elements(&array)?;
        let names: Option<Vec<String>> = array
            .attributes()
            .get("_ARRAY_DIMENSIONS")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let (shape, layout) = layout_for(names.as_deref(), shape_of(&array))?;

        let metadata = ImageMetadata::new(file_name_of(&self.path), SourceFormat::OmeZarr);
        let mut decoded = Decoded::new(RawArray::new(shape, layout, data), metadata);
        decoded.scenes = scenes;
        Ok(decoded)
    }

    fn decode(mut self, scene: SceneSelector) -> Result<Decoded, AdapterError> {
        if self.attrs.multiscales.is_empty() {
            return self.decode_bare(scene);
        }

        let scenes = self.scenes()?;
        let selected = scene.resolve(&scenes)?;
        let multiscale = self.attrs.multiscales.swap_remove(selected);
        let dataset = &multiscale.datasets[0];

        let array = self.array(&dataset.path)?;
        let data = read_elements(&array)?;
        let names: Vec<String> = multiscale.axes.iter().map(|a| a.name().to_string()).collect();
        let (shape, layout) = layout_for(Some(names.as_slice()), shape_of(&array))?;

        let physical_size = physical_size_from(&multiscale.axes, dataset.scale());
        let channel_names: Vec<String> = self
            .attrs
            .omero
            .take()
            .map(|o| o.channels)
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.label.unwrap_or_else(|| format!("Channel_{}", i)))
            .collect();

        let mut warnings = Vec::new();
        if let Some(version) = multiscale.version.as_deref().filter(|v| *v != NGFF_VERSION) {
            warn!("{}: NGFF version {} read as {}", self.path.display(), version, NGFF_VERSION);
            warnings.push(format!("NGFF version {} read as {}", version, NGFF_VERSION));
        }

        let mut metadata = ImageMetadata::new(file_name_of(&self.path), SourceFormat::OmeZarr)
            .with_physical_size(physical_size)
            .with_channel_names(channel_names);
        if scenes.len() > 1 {
            metadata = metadata.with_scene(selected, scenes[selected].name.clone());
        }

        debug!(
            "Decoded OME-Zarr {} dataset '{}': {:?} as {}",
            self.path.display(),
            dataset.path,
            array.shape(),
            layout.name()
        );

        let mut decoded = Decoded::new(RawArray::new(shape, layout, data), metadata);
        decoded.scenes = scenes;
        decoded.warnings = warnings;
        Ok(decoded)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, AdapterError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AdapterError::Io(IoError::Io(format!("Zarr worker failed: {}", e))))?
}

// =============================================================================
// Adapter
// =============================================================================

/// OME-Zarr reader and writer.
#[derive(Debug, Clone, Default)]
pub struct OmeZarrAdapter;

impl OmeZarrAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FormatAdapter for OmeZarrAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::OmeZarr
    }

    async fn list_scenes(&self, path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError> {
        let path = path.to_path_buf();
        run_blocking(move || ZarrStore::open(&path)?.scenes()).await
    }

    async fn decode(&self, path: &Path, request: &DecodeRequest) -> Result<Decoded, AdapterError> {
        let path = path.to_path_buf();
        let scene = request.scene;
        run_blocking(move || ZarrStore::open(&path)?.decode(scene)).await
    }

    async fn encode(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        options: &EncodeOptions,
    ) -> Result<u64, AdapterError> {
        if pyramid.base.is_empty() {
            return Err(AdapterError::Malformed(format!(
                "refusing to write an empty image of shape {:?}",
                pyramid.base.shape()
            )));
        }
        write_store(path, pyramid, metadata, options)?;
        let written = path_size(path).await?;

        debug!(
            "Wrote OME-Zarr {} with {} level(s), {} bytes",
            path.display(),
            pyramid.level_count(),
            written
        );
        Ok(written)
    }
}
