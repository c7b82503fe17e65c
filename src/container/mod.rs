//! The `.univ` container.
//!
//! An HDF5 file holding one canonical image, its pyramid, a thumbnail,
//! metadata, provenance, and a root schema stamp:
//!
//! ```text
//! /                               format="univ" version="1.0" schema_version="1.0"
//! /ImageData/Resolution_0..N      T x C x Z x Y x X, chunked
//! /Thumbnail                      C x Y x X, Y,X <= 256, gzip 4
//! /Metadata/{Dimensions, PhysicalSize, Source, Channels}
//! /Provenance                     created, creator, source_format, source_file
//! /Provenance/conversion_history  JSON string
//! ```

pub mod codec;
pub mod h5;
pub mod layout;
mod provenance;
mod reader;
mod validation;
mod writer;

pub use codec::{ChunkFilter, THUMBNAIL_FILTER};
pub use layout::{
    resolution_path, AttrValue, Attrs, ContainerIndex, DatasetLayout, Node, FORMAT_NAME,
    FORMAT_VERSION, SCHEMA_VERSION,
};
pub use provenance::{ConversionHistory, Provenance};
pub use reader::{check_schema, metadata_from_index, open_index, ContainerReader};
pub use validation::{
    validate, validate_path, Issue, IssueKind, Severity, ValidationReport,
};
pub use writer::{ContainerWriter, WriteSummary};
