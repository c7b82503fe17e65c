//! Container validation.
//!
//! The validator collects every problem it finds instead of stopping at the
//! first one. Strict mode also re-reads every sample dataset and checks it
//! against its recorded SHA-256.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::ContainerError;

use super::layout::{
    resolution_path, AttrValue, ContainerIndex, CHANNELS, DIMENSIONS, IMAGE_DATA, PHYSICAL_SIZE,
    PROVENANCE, SOURCE, THUMBNAIL,
};
use super::reader::{open_index, ContainerReader};

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// What a validation issue is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// File is missing, not HDF5, or its hierarchy cannot be read
    Unreadable,
    /// Root schema stamp absent or unsupported
    SchemaStamp,
    /// A required group or dataset is absent
    MissingGroup,
    /// Image data holds no samples
    EmptyImageData,
    /// Image data is not rank 5
    BadRank,
    /// Image data holds samples of an unsupported type
    BadSampleType,
    /// Dimension attributes disagree with the stored shape
    DimensionMismatch,
    /// A physical size is not a positive finite number
    InvalidPhysicalSize,
    /// A pyramid level is not half of the level before it
    LevelNotHalved,
    /// Channel name count disagrees with SizeC
    ChannelCount,
    /// A dataset could not be read or decoded
    ChunkUnreadable,
    /// A dataset does not match its checksum
    ChunkChecksum,
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
}

/// Outcome of validating one container.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub path: String,
    pub strict: bool,
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    pub fn ok(path: impl Into<String>, strict: bool) -> Self {
        Self {
            path: path.into(),
            strict,
            issues: Vec::new(),
        }
    }

    pub fn add_error(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(Issue {
            severity: Severity::Error,
            kind,
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(Issue {
            severity: Severity::Warning,
            kind,
            message: message.into(),
        });
    }

    /// True when no error-level issue was found.
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    /// The first error as a [`ContainerError`], or `Ok` if valid.
    pub fn into_result(self) -> Result<(), ContainerError> {
        match self.issues.into_iter().find(|i| i.severity == Severity::Error) {
            None => Ok(()),
            Some(issue) => Err(match issue.kind {
                IssueKind::SchemaStamp => ContainerError::SchemaMismatch {
                    found: self.path,
                    reason: issue.message,
                },
                IssueKind::EmptyImageData => ContainerError::EmptyDataset(issue.message),
                _ => ContainerError::CorruptContainer(issue.message),
            }),
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Validate the container file at `path`.
pub async fn validate_path(path: &Path, strict: bool) -> ValidationReport {
    let mut report = ValidationReport::ok(path.display().to_string(), strict);

    let index = match open_index(path).await {
        Ok((_, index)) => index,
        Err(e @ ContainerError::SchemaMismatch { .. }) => {
            report.add_error(IssueKind::SchemaStamp, e.to_string());
            return report;
        }
        Err(e) => {
            report.add_error(IssueKind::Unreadable, e.to_string());
            return report;
        }
    };

    check_index(&index, &mut report);
    if strict && report.is_valid() {
        check_samples(path, &mut report).await;
    }

    debug!(
        "Validated {}: {} error(s), {} warning(s)",
        report.path,
        report.errors().count(),
        report.warnings().count()
    );
    report
}

/// Structural checks over an already loaded index.
pub fn validate(identifier: impl Into<String>, index: &ContainerIndex) -> ValidationReport {
    let mut report = ValidationReport::ok(identifier, false);
    check_index(index, &mut report);
    report
}

fn check_index(index: &ContainerIndex, report: &mut ValidationReport) {
    check_image_data(index, report);
    check_dimensions(index, report);
    check_physical_size(index, report);
    check_presence(index, report);
}

fn check_image_data(index: &ContainerIndex, report: &mut ValidationReport) {
    if !index.contains(IMAGE_DATA) {
        report.add_error(IssueKind::MissingGroup, format!("missing {}", IMAGE_DATA));
    }

    let levels = index.level_count();
    if levels == 0 {
        report.add_error(
            IssueKind::MissingGroup,
            format!("missing {}", resolution_path(0)),
        );
        return;
    }

    let mut previous: Option<&Vec<usize>> = None;
    for level in 0..levels {
        let path = resolution_path(level);
        let Some(layout) = index.dataset(&path) else {
            continue;
        };
        if layout.dtype.is_none() {
            report.add_error(
                IssueKind::BadSampleType,
                format!("{} does not hold uint8, uint16, float32 or float64 samples", path),
            );
        }
        if layout.shape.len() != 5 {
            report.add_error(
                IssueKind::BadRank,
                format!("{} has rank {}, expected 5", path, layout.shape.len()),
            );
            previous = None;
            continue;
        }
        if layout.element_count() == 0 {
            report.add_error(
                IssueKind::EmptyImageData,
                format!("{} has shape {:?}", path, layout.shape),
            );
        }
        if let Some(prev) = previous {
            let halved = layout.shape[..3] == prev[..3]
                && layout.shape[3] == prev[3] / 2
                && layout.shape[4] == prev[4] / 2;
            if !halved {
                report.add_warning(
                    IssueKind::LevelNotHalved,
                    format!("{} {:?} is not half of {:?}", path, layout.shape, prev),
                );
            }
        }
        previous = Some(&layout.shape);
    }
}

fn check_dimensions(index: &ContainerIndex, report: &mut ValidationReport) {
    let Some(dims) = index.attrs_of(DIMENSIONS) else {
        report.add_error(IssueKind::MissingGroup, format!("missing {}", DIMENSIONS));
        return;
    };
    let Some(layout) = index.dataset(&resolution_path(0)) else {
        return;
    };
    if layout.shape.len() != 5 {
        return;
    }

    for (axis, key) in ["SizeT", "SizeC", "SizeZ", "SizeY", "SizeX"].iter().enumerate() {
        let declared = dims.get(*key).and_then(AttrValue::as_i64);
        if declared != Some(layout.shape[axis] as i64) {
            report.add_error(
                IssueKind::DimensionMismatch,
                format!(
                    "{} is {:?}, stored extent is {}",
                    key, declared, layout.shape[axis]
                ),
            );
        }
    }

    if let Some(order) = dims.get("DimensionOrder").and_then(AttrValue::as_str) {
        if order != "TCZYX" {
            report.add_error(
                IssueKind::DimensionMismatch,
                format!("DimensionOrder is {}, expected TCZYX", order),
            );
        }
    }

    if let Some(channels) = index.attrs_of(CHANNELS) {
        let named = channels.len();
        if named != 0 && named != layout.shape[1] {
            report.add_warning(
                IssueKind::ChannelCount,
                format!("{} channel names for {} channels", named, layout.shape[1]),
            );
        }
    }
}

fn check_physical_size(index: &ContainerIndex, report: &mut ValidationReport) {
    let Some(physical) = index.attrs_of(PHYSICAL_SIZE) else {
        report.add_error(IssueKind::MissingGroup, format!("missing {}", PHYSICAL_SIZE));
        return;
    };
    for key in ["X", "Y", "Z"] {
        match physical.get(key).and_then(AttrValue::as_f64) {
            Some(v) if v.is_finite() && v > 0.0 => {}
            other => report.add_error(
                IssueKind::InvalidPhysicalSize,
                format!("PhysicalSize {} is {:?}", key, other),
            ),
        }
    }
}

fn check_presence(index: &ContainerIndex, report: &mut ValidationReport) {
    if !index.contains(SOURCE) {
        report.add_error(IssueKind::MissingGroup, format!("missing {}", SOURCE));
    }
    if !index.contains(PROVENANCE) {
        report.add_error(IssueKind::MissingGroup, format!("missing {}", PROVENANCE));
    }
    if !index.contains(THUMBNAIL) {
        report.add_warning(IssueKind::MissingGroup, format!("missing {}", THUMBNAIL));
    }
}

async fn check_samples(path: &Path, report: &mut ValidationReport) {
    let container = match ContainerReader::open_path(path).await {
        Ok(c) => c,
        Err(e) => {
            report.add_error(IssueKind::Unreadable, e.to_string());
            return;
        }
    };

    let mut paths: Vec<String> = (0..container.level_count()).map(resolution_path).collect();
    if container.index().contains(THUMBNAIL) {
        paths.push(THUMBNAIL.to_string());
    }

    for path in paths {
        match container.verify_dataset(&path).await {
            Ok(true) => debug!("Verified {}", path),
            Ok(false) => report.add_warning(
                IssueKind::ChunkChecksum,
                format!("{} carries no checksum", path),
            ),
            Err(ContainerError::ChecksumMismatch { path }) => report.add_error(
                IssueKind::ChunkChecksum,
                format!("{} does not match its checksum", path),
            ),
            Err(e) => report.add_error(IssueKind::ChunkUnreadable, format!("{}: {}", path, e)),
        }
    }

    if let Err(e) = container.read_conversion_history().await {
        report.add_error(IssueKind::ChunkUnreadable, e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_into_result() {
        let mut report = ValidationReport::ok("x.univ", false);
        report.add_warning(IssueKind::MissingGroup, "missing /Thumbnail");
        assert!(report.is_valid());
        assert!(report.clone().into_result().is_ok());

        report.add_error(IssueKind::SchemaStamp, "bad version");
        assert!(!report.is_valid());
        assert!(matches!(
            report.into_result(),
            Err(ContainerError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.univ");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let report = validate_path(&path, true).await;
        assert!(!report.is_valid());
        assert_eq!(report.issues[0].kind, IssueKind::Unreadable);
    }

    #[test]
    fn test_validate_index_collects_issues() {
        use crate::container::layout::{attrs, DatasetLayout, Node};
        use crate::model::PixelType;

        let group = |path: &str, values| Node::Group {
            path: path.to_string(),
            attrs: values,
        };
        let level = |k: usize, shape: Vec<usize>| Node::Dataset {
            path: resolution_path(k),
            attrs: Default::default(),
            layout: DatasetLayout {
                shape,
                dtype: Some(PixelType::Uint8),
                chunk_shape: None,
            },
        };
        let index = ContainerIndex {
            nodes: vec![
                group(IMAGE_DATA, Default::default()),
                level(0, vec![1, 1, 1, 64, 64]),
                level(1, vec![1, 1, 1, 30, 32]),
                group(
                    DIMENSIONS,
                    attrs([
                        ("SizeT", AttrValue::from(1usize)),
                        ("SizeC", AttrValue::from(1usize)),
                        ("SizeZ", AttrValue::from(1usize)),
                        ("SizeY", AttrValue::from(64usize)),
                        ("SizeX", AttrValue::from(60usize)),
                    ]),
                ),
                group(
                    PHYSICAL_SIZE,
                    attrs([("X", 1.0), ("Y", 0.0), ("Z", 1.0)]),
                ),
                group(SOURCE, Default::default()),
                group(CHANNELS, attrs([("Channel_0", "a"), ("Channel_1", "b")])),
            ],
        };

        let report = validate("mem", &index);
        let errors: Vec<IssueKind> = report.errors().map(|i| i.kind).collect();
        assert!(errors.contains(&IssueKind::DimensionMismatch));
        assert!(errors.contains(&IssueKind::InvalidPhysicalSize));
        assert!(errors.contains(&IssueKind::MissingGroup));
        let warnings: Vec<IssueKind> = report.warnings().map(|i| i.kind).collect();
        assert!(warnings.contains(&IssueKind::LevelNotHalved));
        assert!(warnings.contains(&IssueKind::ChannelCount));
    }

    #[test]
    fn test_report_serializes() {
        let mut report = ValidationReport::ok("x.univ", true);
        report.add_error(IssueKind::ChunkChecksum, "bad");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["issues"][0]["severity"], "error");
        assert_eq!(json["issues"][0]["kind"], "chunk_checksum");
    }
}
