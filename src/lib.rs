//! # univ-convert
//!
//! Converter for whole-slide microscopy images.
//!
//! Images from OME-TIFF, OME-Zarr and Olympus VSI sources are brought into
//! one canonical `(T, C, Z, Y, X)` tensor, given a resolution pyramid and a
//! thumbnail, and written to the `.univ` container or to any other
//! supported format.
//!
//! ## Architecture
//!
//! - [`model`] - canonical tensor, axis normalizer, scene selector, pyramid builder
//! - [`container`] - `.univ` layout, writer, reader and validator
//! - [`mod@format`] - format adapters and format detection
//! - [`convert`] - the conversion state machine and routing
//! - [`io`] - range readers over local files and memory
//! - [`config`] - CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use univ_convert::{ConversionRequest, Converter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let converter = Converter::default();
//!     let request = ConversionRequest::new("slide.ome.tiff", "slide.univ");
//!     let result = converter.convert(&request).await;
//!
//!     match result.into_result() {
//!         Ok(summary) => println!("wrote {} bytes", summary.bytes_written),
//!         Err(e) => eprintln!("conversion failed: {}", e),
//!     }
//! }
//! ```

pub mod config;
pub mod container;
pub mod convert;
pub mod error;
pub mod format;
pub mod io;
pub mod model;

// Re-export commonly used types
pub use config::{Cli, Command, CompressionArg, ConvertConfig, InspectConfig, ValidateConfig};
pub use container::{
    validate_path, ContainerReader, ContainerWriter, Issue, IssueKind, Severity,
    ValidationReport,
};
pub use convert::{
    CollectingSink, ConversionRequest, ConversionResult, ConversionState, ConversionSummary,
    Converter, EventSink, NullSink, ProgressEvent, Route, TracingSink,
};
pub use error::{AdapterError, ContainerError, ConvertError, IoError, ShapeError};
pub use format::{
    default_registry, resolve_format, AdapterRegistry, Compression, DecodeRequest, Decoded,
    EncodeOptions, FormatAdapter, SlideBackend, SourceFormat,
};
pub use io::{LocalFileReader, MemoryReader, RangeReader};
pub use model::{
    normalize, select_main_scene, CanonicalTensor, ImageMetadata, ImagePyramid, PhysicalSize,
    PixelType, RawArray, SceneDescriptor, SceneSelector,
};
