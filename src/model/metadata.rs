use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use crate::format::SourceFormat;

/// Unit recorded for physical pixel sizes.
pub const DEFAULT_UNIT: &str = "µm";

/// Size used when a source does not declare one, or declares a bad one.
pub const DEFAULT_PHYSICAL_SIZE: f64 = 1.0;

/// Physical size of one pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub unit: String,
}

impl PhysicalSize {
    /// Build from optional source values. Missing, zero, negative or
    /// non-finite values become [`DEFAULT_PHYSICAL_SIZE`].
    pub fn new(x: Option<f64>, y: Option<f64>, z: Option<f64>) -> Self {
        Self {
            x: sanitize(x),
            y: sanitize(y),
            z: sanitize(z),
            unit: DEFAULT_UNIT.to_string(),
        }
    }

    /// True if every size is positive and finite.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.z]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }

    /// Sizes after decimating X and Y by `factor`.
    pub fn scaled_xy(&self, factor: f64) -> Self {
        Self {
            x: sanitize(Some(self.x * factor)),
            y: sanitize(Some(self.y * factor)),
            z: self.z,
            unit: self.unit.clone(),
        }
    }
}

impl Default for PhysicalSize {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

fn sanitize(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        _ => DEFAULT_PHYSICAL_SIZE,
    }
}

/// Descriptive metadata carried alongside a canonical tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub physical_size: PhysicalSize,

    /// Ordered channel names. May be empty.
    pub channel_names: Vec<String>,

    /// File name (not path) of the original source.
    pub source_file: String,

    pub source_format: SourceFormat,
    pub scene_name: Option<String>,
    pub scene_index: Option<usize>,

    /// Resolution level of the source the image was exported from.
    pub resolution_level: u32,

    pub conversion_date: DateTime<Utc>,
}

impl ImageMetadata {
    /// Metadata with default sizes, stamped with the current time.
    pub fn new(source_file: impl Into<String>, source_format: SourceFormat) -> Self {
        Self {
            physical_size: PhysicalSize::default(),
            channel_names: Vec::new(),
            source_file: source_file.into(),
            source_format,
            scene_name: None,
            scene_index: None,
            resolution_level: 0,
            conversion_date: Utc::now(),
        }
    }

    pub fn with_physical_size(mut self, physical_size: PhysicalSize) -> Self {
        self.physical_size = physical_size;
        self
    }

    pub fn with_channel_names(mut self, names: Vec<String>) -> Self {
        self.channel_names = names;
        self
    }

    pub fn with_scene(mut self, index: usize, name: impl Into<String>) -> Self {
        self.scene_index = Some(index);
        self.scene_name = Some(name.into());
        self
    }

    /// One label per channel of a `channels`-channel image.
    ///
    /// The stored names are used when their count matches; otherwise every
    /// channel gets a synthesized `Channel_<i>` label.
    pub fn channel_labels(&self, channels: usize) -> Vec<String> {
        if self.channel_names.len() == channels {
            return self.channel_names.clone();
        }
        if !self.channel_names.is_empty() {
            warn!(
                "{} channel name(s) for {} channel(s); labels synthesized",
                self.channel_names.len(),
                channels
            );
        }
        (0..channels).map(|c| format!("Channel_{}", c)).collect()
    }

    /// Conversion date as an ISO-8601 string that parses back losslessly.
    pub fn conversion_date_string(&self) -> String {
        format_timestamp(&self.conversion_date)
    }
}

/// RFC 3339 rendering used for every stored timestamp.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a stored timestamp. Naive timestamps are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// File name component of `path`, falling back to the whole path.
pub fn file_name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
