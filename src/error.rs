use thiserror::Error;

/// I/O errors that can occur when reading or writing slide files
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from the filesystem
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File or directory not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            IoError::NotFound(err.to_string())
        } else {
            IoError::Io(err.to_string())
        }
    }
}

/// Errors raised when an array cannot be mapped onto the canonical
/// `(T, C, Z, Y, X)` layout
#[derive(Debug, Clone, Error)]
pub enum ShapeError {
    /// Rank, axis layout or extents are not supported
    #[error("Unsupported shape {shape:?}: {reason}")]
    UnsupportedShape { shape: Vec<usize>, reason: String },
}

impl ShapeError {
    pub(crate) fn unsupported(shape: &[usize], reason: impl Into<String>) -> Self {
        ShapeError::UnsupportedShape {
            shape: shape.to_vec(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the `.univ` container reader, writer and validator
#[derive(Debug, Clone, Error)]
pub enum ContainerError {
    /// I/O error while reading or writing the container
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Schema stamp is absent, names another format, or has an unsupported version
    #[error("Schema mismatch (found {found}): {reason}")]
    SchemaMismatch { found: String, reason: String },

    /// Expected group or dataset is missing, or the layout cannot be parsed
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),

    /// Refused to persist a dataset with zero elements
    #[error("Refusing to write empty dataset {0}")]
    EmptyDataset(String),

    /// Compression scheme cannot be used for this container
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Stored array has an invalid shape
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),

    /// Stored samples do not match their recorded checksum
    #[error("Checksum mismatch in {path}")]
    ChecksumMismatch { path: String },

    /// Requested pyramid level does not exist
    #[error("Resolution level {0} does not exist")]
    MissingLevel(usize),
}

impl From<std::io::Error> for ContainerError {
    fn from(err: std::io::Error) -> Self {
        ContainerError::Io(err.into())
    }
}

impl From<hdf5::Error> for ContainerError {
    fn from(err: hdf5::Error) -> Self {
        ContainerError::CorruptContainer(format!("hdf5: {}", err))
    }
}

/// Errors raised by format adapters while decoding or encoding
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// I/O error while reading or writing
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Error from the univ container codec
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// Decoded array has an invalid shape
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),

    /// Feature of the file or of the request is not supported by this adapter
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// File content is malformed
    #[error("Malformed file: {0}")]
    Malformed(String),

    /// Requested scene index does not exist
    #[error("Scene {index} out of range: source has {count} scene(s)")]
    SceneOutOfRange { index: usize, count: usize },

    /// No decoder backend is linked for this format
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Io(err.into())
    }
}

impl From<tiff::TiffError> for AdapterError {
    fn from(err: tiff::TiffError) -> Self {
        match err {
            tiff::TiffError::IoError(e) => AdapterError::Io(e.into()),
            tiff::TiffError::UnsupportedError(e) => AdapterError::Unsupported(e.to_string()),
            other => AdapterError::Malformed(other.to_string()),
        }
    }
}

/// Errors that terminate a conversion job
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    /// Normalizer rejected the decoded array
    #[error("Unsupported shape: {0}")]
    UnsupportedShape(#[from] ShapeError),

    /// Source adapter failed to decode
    #[error("Failed to decode {format}: {source}")]
    Decode {
        format: &'static str,
        #[source]
        source: AdapterError,
    },

    /// Destination adapter failed to encode
    #[error("Failed to encode {format}: {source}")]
    Encode {
        format: &'static str,
        #[source]
        source: AdapterError,
    },

    /// Output failed the post-write sanity check
    #[error("Verification failed: {0}")]
    Verification(String),

    /// No adapter pair exists and the container fallback is unavailable
    #[error("No conversion route from {from} to {to}")]
    NoDirectRoute { from: &'static str, to: &'static str },

    /// Request is malformed (bad options, same input and output, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ConvertError {
    /// The container-level fault behind a decode/encode failure, if any.
    pub fn container_error(&self) -> Option<&ContainerError> {
        match self {
            ConvertError::Decode {
                source: AdapterError::Container(e),
                ..
            }
            | ConvertError::Encode {
                source: AdapterError::Container(e),
                ..
            } => Some(e),
            _ => None,
        }
    }
}
