use serde::{Deserialize, Serialize};

use crate::model::{format_timestamp, ImageMetadata};

use super::layout::{attrs, AttrValue, Attrs, CREATOR};

/// Attributes of the `/Provenance` group.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub created: String,
    pub creator: String,
    pub source_format: String,
    pub source_file: String,
}

impl Provenance {
    /// Provenance for a container written now from `metadata`.
    pub fn for_metadata(metadata: &ImageMetadata) -> Self {
        Self {
            created: metadata.conversion_date_string(),
            creator: CREATOR.to_string(),
            source_format: metadata.source_format.name().to_string(),
            source_file: metadata.source_file.clone(),
        }
    }

    pub fn to_attrs(&self) -> Attrs {
        attrs([
            ("created", self.created.as_str()),
            ("creator", self.creator.as_str()),
            ("source_format", self.source_format.as_str()),
            ("source_file", self.source_file.as_str()),
        ])
    }

    /// Read back from group attributes; missing entries come back empty.
    pub fn from_attrs(attrs: &Attrs) -> Self {
        let text = |key: &str| {
            attrs
                .get(key)
                .and_then(AttrValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            created: text("created"),
            creator: text("creator"),
            source_format: text("source_format"),
            source_file: text("source_file"),
        }
    }
}

/// JSON document stored at `/Provenance/conversion_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionHistory {
    pub conversion_tool: String,
    pub timestamp: String,
    pub source: String,

    /// History of the container this one was converted from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<serde_json::Value>,
}

impl ConversionHistory {
    pub fn new(metadata: &ImageMetadata, previous: Option<serde_json::Value>) -> Self {
        Self {
            conversion_tool: CREATOR.to_string(),
            timestamp: format_timestamp(&metadata.conversion_date),
            source: metadata.source_file.clone(),
            previous,
        }
    }

    /// Number of conversions recorded, this one included.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut current = self.previous.clone();
        while let Some(value) = current {
            depth += 1;
            current = value.get("previous").cloned();
        }
        depth
    }
}
