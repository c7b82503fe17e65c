//! Container writer.
//!
//! A container is written in one pass: image levels, thumbnail, metadata
//! groups, provenance, and finally the root schema stamp. A file without the
//! stamp was never completed.

use std::path::Path;

use hdf5::{File, Group};
use tracing::{debug, warn};

use crate::error::ContainerError;
use crate::format::EncodeOptions;
use crate::io::{path_size, remove_path};
use crate::model::{make_thumbnail, ImageMetadata, ImagePyramid, AXIS_ORDER};

use super::codec::{sample_checksum, ChunkFilter, THUMBNAIL_FILTER};
use super::h5::{set_attr, set_attrs, write_samples, write_text};
use super::layout::{
    attrs, base_chunk_shape, level_chunk_shape, resolution_path, thumbnail_chunk_shape,
    AttrValue, Attrs, CHANNELS, CHECKSUM_ATTR, CONVERSION_HISTORY, DIMENSIONS, FORMAT_NAME,
    FORMAT_VERSION, IMAGE_DATA, METADATA, PHYSICAL_SIZE, PROVENANCE, SCHEMA_VERSION, SOURCE,
    THUMBNAIL,
};
use super::provenance::{ConversionHistory, Provenance};

/// What a finished write produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub bytes_written: u64,
    pub levels: usize,
}

/// Writes canonical pyramids to `.univ` files.
#[derive(Debug, Clone)]
pub struct ContainerWriter {
    filter: ChunkFilter,
    previous_history: Option<serde_json::Value>,
}

impl ContainerWriter {
    pub fn new(filter: ChunkFilter) -> Self {
        Self {
            filter,
            previous_history: None,
        }
    }

    /// Writer for an encode request.
    pub fn from_options(options: &EncodeOptions) -> Result<Self, ContainerError> {
        Ok(Self::new(ChunkFilter::from_options(options)?))
    }

    /// Nest an earlier conversion history under this container's history.
    pub fn with_previous_history(mut self, history: Option<serde_json::Value>) -> Self {
        self.previous_history = history;
        self
    }

    pub fn filter(&self) -> ChunkFilter {
        self.filter
    }

    /// Write `pyramid` and `metadata` to `path`.
    ///
    /// Fails with `EmptyDataset` before touching the filesystem if any level
    /// holds no samples. A failed write removes whatever it created.
    pub async fn write(
        &self,
        path: &Path,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
    ) -> Result<WriteSummary, ContainerError> {
        for (level, tensor) in pyramid.iter().enumerate() {
            if tensor.is_empty() {
                return Err(ContainerError::EmptyDataset(format!(
                    "{} with shape {:?}",
                    resolution_path(level),
                    tensor.shape()
                )));
            }
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::metadata(parent).await?;
        }

        let result = self.write_file(path, pyramid, metadata);
        if result.is_err() {
            if let Err(e) = remove_path(path) {
                warn!("Failed to remove partial container {}: {}", path.display(), e);
            }
        }
        result?;

        Ok(WriteSummary {
            bytes_written: path_size(path).await?,
            levels: pyramid.level_count(),
        })
    }

    fn write_file(
        &self,
        path: &Path,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
    ) -> Result<(), ContainerError> {
        let file = File::create(path)?;

        let image_data = file.create_group(name_of(IMAGE_DATA))?;
        set_attr(&image_data, "levels", &pyramid.level_count().into())?;
        for (level, tensor) in pyramid.iter().enumerate() {
            let shape = tensor.shape();
            let chunk = if level == 0 {
                base_chunk_shape(shape)
            } else {
                level_chunk_shape(shape)
            };
            let dataset = write_samples(
                &image_data,
                &format!("Resolution_{}", level),
                shape,
                chunk,
                self.filter,
                tensor.data(),
            )?;
            set_attrs(
                &dataset,
                &attrs([
                    ("level", AttrValue::from(level)),
                    ("downsample", AttrValue::from(1usize << level)),
                    (CHECKSUM_ATTR, AttrValue::from(sample_checksum(tensor.data()))),
                ]),
            )?;
            debug!(
                "Wrote {} {:?} with {} {:?}",
                resolution_path(level),
                shape,
                self.filter.name(),
                chunk
            );
        }

        let thumbnail = make_thumbnail(&pyramid.base);
        let thumb_shape = thumbnail.shape();
        let dataset = write_samples(
            &file,
            name_of(THUMBNAIL),
            thumb_shape,
            thumbnail_chunk_shape(thumb_shape),
            THUMBNAIL_FILTER,
            thumbnail.data(),
        )?;
        set_attrs(
            &dataset,
            &attrs([
                ("DimensionOrder", AttrValue::from("CYX")),
                (CHECKSUM_ATTR, AttrValue::from(sample_checksum(thumbnail.data()))),
            ]),
        )?;

        let metadata_group = file.create_group(name_of(METADATA))?;
        for (path, group_attrs) in metadata_groups(pyramid.base.shape(), metadata) {
            let group = metadata_group.create_group(name_of(path))?;
            set_attrs(&group, &group_attrs)?;
        }

        write_provenance(&file, metadata, self.previous_history.clone())?;

        set_attrs(
            &file,
            &attrs([
                ("format", FORMAT_NAME),
                ("version", FORMAT_VERSION),
                ("schema_version", SCHEMA_VERSION),
            ]),
        )?;
        file.flush()?;
        Ok(())
    }
}

/// Last component of an absolute node path.
fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn write_provenance(
    file: &File,
    metadata: &ImageMetadata,
    previous: Option<serde_json::Value>,
) -> Result<Group, ContainerError> {
    let group = file.create_group(name_of(PROVENANCE))?;
    set_attrs(&group, &Provenance::for_metadata(metadata).to_attrs())?;

    let history = ConversionHistory::new(metadata, previous);
    let json = serde_json::to_string_pretty(&history).map_err(|e| {
        ContainerError::CorruptContainer(format!("cannot encode conversion history: {}", e))
    })?;
    let dataset = write_text(&group, name_of(CONVERSION_HISTORY), &json)?;
    set_attr(&dataset, "content_type", &"application/json".into())?;
    Ok(group)
}

/// Children of `/Metadata` with their attributes, in write order.
fn metadata_groups(shape: [usize; 5], metadata: &ImageMetadata) -> Vec<(&'static str, Attrs)> {
    let mut source = attrs([
        ("OriginalFile", AttrValue::from(metadata.source_file.as_str())),
        ("OriginalFormat", AttrValue::from(metadata.source_format.name())),
        ("ConversionDate", AttrValue::from(metadata.conversion_date_string())),
        ("ResolutionLevel", AttrValue::from(metadata.resolution_level as i64)),
    ]);
    if let Some(name) = &metadata.scene_name {
        source.insert("SceneName".to_string(), name.as_str().into());
    }
    if let Some(index) = metadata.scene_index {
        source.insert("SceneIndex".to_string(), index.into());
    }

    let physical = &metadata.physical_size;
    vec![
        (
            DIMENSIONS,
            attrs([
                ("SizeT", AttrValue::from(shape[0])),
                ("SizeC", AttrValue::from(shape[1])),
                ("SizeZ", AttrValue::from(shape[2])),
                ("SizeY", AttrValue::from(shape[3])),
                ("SizeX", AttrValue::from(shape[4])),
                ("DimensionOrder", AttrValue::from(AXIS_ORDER)),
            ]),
        ),
        (
            PHYSICAL_SIZE,
            attrs([
                ("X", AttrValue::from(physical.x)),
                ("Y", AttrValue::from(physical.y)),
                ("Z", AttrValue::from(physical.z)),
                ("Unit", AttrValue::from(physical.unit.as_str())),
            ]),
        ),
        (SOURCE, source),
        (
            CHANNELS,
            metadata
                .channel_labels(shape[1])
                .into_iter()
                .enumerate()
                .map(|(i, name)| (format!("Channel_{}", i), AttrValue::from(name)))
                .collect(),
        ),
    ]
}
