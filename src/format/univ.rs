//! Adapter between the `.univ` container and the conversion pipeline.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::container::{ContainerReader, ContainerWriter};
use crate::error::AdapterError;
use crate::model::{file_name_of, ImageMetadata, ImagePyramid, RawArray, SceneDescriptor, SceneSelector};

use super::adapter::{DecodeRequest, Decoded, EncodeOptions, FormatAdapter};
use super::detect::SourceFormat;

/// Reads and writes `.univ` containers.
///
/// A container holds exactly one image; decoding reads the base level and
/// keeps the stored source metadata so chained conversions remember where
/// the pixels came from.
#[derive(Debug, Clone, Default)]
pub struct UnivAdapter;

impl UnivAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn single_scene(path: &Path, shape: [usize; 5]) -> SceneDescriptor {
    SceneDescriptor::new(0, file_name_of(path), shape[4] as u64, shape[3] as u64)
}

#[async_trait]
impl FormatAdapter for UnivAdapter {
    fn format(&self) -> SourceFormat {
        SourceFormat::Univ
    }

    async fn list_scenes(&self, path: &Path) -> Result<Vec<SceneDescriptor>, AdapterError> {
        let reader = ContainerReader::open_path(path).await?;
        Ok(vec![single_scene(path, reader.level_shape(0)?)])
    }

    async fn decode(&self, path: &Path, request: &DecodeRequest) -> Result<Decoded, AdapterError> {
        let reader = ContainerReader::open_path(path).await?;
        let scene = single_scene(path, reader.level_shape(0)?);
        if let SceneSelector::Index(index) = request.scene {
            if index != 0 {
                return Err(AdapterError::SceneOutOfRange { index, count: 1 });
            }
        }

        let tensor = reader.read_level(0).await?;
        let metadata: ImageMetadata = reader.metadata()?;
        let history = reader.read_conversion_history().await?;
        debug!(
            "Decoded {} ({} level(s)), originally {} from {}",
            path.display(),
            reader.level_count(),
            metadata.source_format,
            metadata.source_file
        );

        let mut decoded = Decoded::new(RawArray::from_tensor(tensor), metadata);
        decoded.scenes = vec![scene];
        decoded.history = history;
        Ok(decoded)
    }

    async fn encode(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        options: &EncodeOptions,
    ) -> Result<u64, AdapterError> {
        self.encode_with_history(pyramid, metadata, path, options, None)
            .await
    }

    async fn encode_with_history(
        &self,
        pyramid: &ImagePyramid,
        metadata: &ImageMetadata,
        path: &Path,
        options: &EncodeOptions,
        history: Option<&serde_json::Value>,
    ) -> Result<u64, AdapterError> {
        let writer =
            ContainerWriter::from_options(options)?.with_previous_history(history.cloned());
        let summary = writer.write(path, pyramid, metadata).await?;
        debug!(
            "Wrote {}: {} level(s), {} filter, {} bytes",
            path.display(),
            summary.levels,
            writer.filter().name(),
            summary.bytes_written
        );
        Ok(summary.bytes_written)
    }
}
