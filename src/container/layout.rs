//! Group layout of a `.univ` container.
//!
//! A container is an HDF5 file. Everything the reader needs to decide
//! whether it can use a file lives in attributes, which are loaded into a
//! [`ContainerIndex`] before any sample is read.

use std::collections::BTreeMap;

use crate::model::PixelType;

// =============================================================================
// Constants
// =============================================================================

/// First eight bytes of every HDF5 file without a user block.
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

/// Schema stamp written on the root group.
pub const FORMAT_NAME: &str = "univ";
pub const FORMAT_VERSION: &str = "1.0";
pub const SCHEMA_VERSION: &str = "1.0";

/// Major schema version this build reads.
pub const SUPPORTED_MAJOR: u64 = 1;

/// Tool identity recorded in provenance.
pub const CREATOR: &str = concat!("univ-convert ", env!("CARGO_PKG_VERSION"));

/// Dataset attribute holding the SHA-256 of the stored samples.
pub const CHECKSUM_ATTR: &str = "sha256";

/// Deflate level of the thumbnail, whatever the request.
pub const THUMBNAIL_DEFLATE_LEVEL: u8 = 4;

pub const ROOT: &str = "/";
pub const IMAGE_DATA: &str = "/ImageData";
pub const THUMBNAIL: &str = "/Thumbnail";
pub const METADATA: &str = "/Metadata";
pub const DIMENSIONS: &str = "/Metadata/Dimensions";
pub const PHYSICAL_SIZE: &str = "/Metadata/PhysicalSize";
pub const SOURCE: &str = "/Metadata/Source";
pub const CHANNELS: &str = "/Metadata/Channels";
pub const PROVENANCE: &str = "/Provenance";
pub const CONVERSION_HISTORY: &str = "/Provenance/conversion_history";

/// Path of pyramid level `level`.
pub fn resolution_path(level: usize) -> String {
    format!("{}/Resolution_{}", IMAGE_DATA, level)
}

/// Chunk extents for the full-resolution level.
pub fn base_chunk_shape(shape: [usize; 5]) -> [usize; 5] {
    [1, 1, shape[2].min(5), shape[3].min(512), shape[4].min(512)]
}

/// Chunk extents for downsampled levels.
pub fn level_chunk_shape(shape: [usize; 5]) -> [usize; 5] {
    [1, 1, 1, shape[3].min(256), shape[4].min(256)]
}

/// Chunk extents for the `(C, Y, X)` thumbnail.
pub fn thumbnail_chunk_shape(shape: [usize; 3]) -> [usize; 3] {
    [1, shape[1].min(256), shape[2].min(256)]
}

/// True if `bytes` start with the HDF5 signature.
pub fn is_hdf5_signature(bytes: &[u8]) -> bool {
    bytes.len() >= HDF5_SIGNATURE.len() && bytes[..HDF5_SIGNATURE.len()] == HDF5_SIGNATURE
}

/// `parent` joined with a child link name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// Value of a scalar attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value, integers included.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            AttrValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

pub type Attrs = BTreeMap<String, AttrValue>;

/// Build an attribute map from `(name, value)` pairs.
pub fn attrs<I, K, V>(pairs: I) -> Attrs
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<AttrValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// =============================================================================
// Index
// =============================================================================

/// Shape and storage of a dataset, as declared by the file.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLayout {
    pub shape: Vec<usize>,
    /// `None` for datasets whose element type is not a pixel type.
    pub dtype: Option<PixelType>,
    /// `None` for contiguous storage.
    pub chunk_shape: Option<Vec<usize>>,
}

impl DatasetLayout {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One node of the container hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Group {
        path: String,
        attrs: Attrs,
    },
    Dataset {
        path: String,
        attrs: Attrs,
        layout: DatasetLayout,
    },
}

impl Node {
    pub fn path(&self) -> &str {
        match self {
            Node::Group { path, .. } | Node::Dataset { path, .. } => path,
        }
    }

    pub fn attrs(&self) -> &Attrs {
        match self {
            Node::Group { attrs, .. } | Node::Dataset { attrs, .. } => attrs,
        }
    }
}

/// Snapshot of every group, dataset and attribute of a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerIndex {
    pub nodes: Vec<Node>,
}

impl ContainerIndex {
    pub fn find(&self, path: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.path() == path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// Attributes of the node at `path`, whatever its kind.
    pub fn attrs_of(&self, path: &str) -> Option<&Attrs> {
        self.find(path).map(Node::attrs)
    }

    pub fn dataset(&self, path: &str) -> Option<&DatasetLayout> {
        match self.find(path) {
            Some(Node::Dataset { layout, .. }) => Some(layout),
            _ => None,
        }
    }

    /// Number of consecutive `Resolution_k` datasets starting at 0.
    pub fn level_count(&self) -> usize {
        (0..)
            .take_while(|&k| self.dataset(&resolution_path(k)).is_some())
            .count()
    }
}

// =============================================================================
// Chunk grid
// =============================================================================

/// Number of chunks along each axis.
pub fn chunk_grid(shape: &[usize], chunk_shape: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .zip(chunk_shape)
        .map(|(&n, &c)| n.div_ceil(c.max(1)))
        .collect()
}

/// Flat C-order index of `coords` in an array of `dims`.
pub(crate) fn ravel(coords: &[usize], dims: &[usize]) -> usize {
    coords
        .iter()
        .zip(dims)
        .fold(0, |acc, (&c, &n)| acc * n + c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_shapes() {
        assert_eq!(base_chunk_shape([1, 3, 12, 2000, 300]), [1, 1, 5, 512, 300]);
        assert_eq!(level_chunk_shape([1, 3, 12, 1000, 100]), [1, 1, 1, 256, 100]);
        assert_eq!(thumbnail_chunk_shape([3, 256, 90]), [1, 256, 90]);
    }

    #[test]
    fn test_signature() {
        assert!(is_hdf5_signature(b"\x89HDF\r\n\x1a\n\0\0"));
        assert!(!is_hdf5_signature(b"\x89HDF\r\n"));
        assert!(!is_hdf5_signature(b"II*\0\x08\0\0\0"));
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path(ROOT, "ImageData"), IMAGE_DATA);
        assert_eq!(child_path(METADATA, "Source"), SOURCE);
    }

    #[test]
    fn test_chunk_grid_and_ravel() {
        let grid = chunk_grid(&[1, 1, 1, 300, 260], &[1, 1, 1, 256, 256]);
        assert_eq!(grid, vec![1, 1, 1, 2, 2]);
        assert_eq!(ravel(&[0, 0, 0, 1, 1], &grid), 3);
        assert_eq!(ravel(&[0, 0, 0, 1, 0], &grid), 2);
    }

    #[test]
    fn test_attr_value_accessors() {
        let map = attrs([
            ("SizeX", AttrValue::from(10usize)),
            ("X", AttrValue::from(1.0)),
            ("Unit", AttrValue::from("µm")),
        ]);
        assert_eq!(map["X"].as_f64(), Some(1.0));
        assert_eq!(map["SizeX"].as_i64(), Some(10));
        assert_eq!(map["SizeX"].as_f64(), Some(10.0));
        assert_eq!(map["Unit"].as_str(), Some("µm"));
        assert_eq!(map["Unit"].as_f64(), None);
    }

    #[test]
    fn test_index_level_count() {
        let layout = DatasetLayout {
            shape: vec![1, 1, 1, 1, 1],
            dtype: Some(PixelType::Uint8),
            chunk_shape: None,
        };
        let dataset = |path: String| Node::Dataset {
            path,
            attrs: Attrs::new(),
            layout: layout.clone(),
        };
        let index = ContainerIndex {
            nodes: vec![
                dataset(resolution_path(0)),
                dataset(resolution_path(1)),
                dataset(resolution_path(3)),
            ],
        };
        assert_eq!(index.level_count(), 2);
    }
}
