//! Format adapters.
//!
//! Each supported format translates between its files and the canonical
//! model through [`FormatAdapter`]:
//!
//! - **univ**: the native container, see [`crate::container`]
//! - **OME-TIFF**: BigTIFF with OME-XML, one page per plane
//! - **OME-Zarr**: NGFF 0.4 multiscales on a Zarr v2 directory store
//! - **VSI**: read through a [`SlideBackend`], written as VSI-compatible OME-TIFF
//!
//! Use [`resolve_format`] to identify a path and [`default_registry`] for
//! a registry holding every built-in adapter.

pub mod adapter;
pub mod detect;
pub mod ome_tiff;
pub mod ome_xml;
pub mod ome_zarr;
pub mod univ;
pub mod vsi;

use std::sync::Arc;

pub use adapter::{
    AdapterRegistry, Compression, DecodeRequest, Decoded, EncodeOptions, FormatAdapter,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_TILE_SIZE,
};
pub use detect::{
    is_container_header, is_tiff_header, resolve_format, sniff_format, SourceFormat,
};
pub use ome_tiff::{OmeTiffAdapter, PageCompression, TiffWriteSettings};
pub use ome_zarr::OmeZarrAdapter;
pub use univ::UnivAdapter;
pub use vsi::{find_data_folder, SlideBackend, SlideScene, VsiAdapter};

/// Registry with every built-in adapter. VSI input needs `vsi_backend`;
/// without one VSI can only be written.
pub fn default_registry(vsi_backend: Option<Arc<dyn SlideBackend>>) -> AdapterRegistry {
    let vsi = match vsi_backend {
        Some(backend) => VsiAdapter::with_backend(backend),
        None => VsiAdapter::new(),
    };
    AdapterRegistry::new()
        .with(Arc::new(UnivAdapter::new()))
        .with(Arc::new(OmeTiffAdapter::new()))
        .with(Arc::new(OmeZarrAdapter::new()))
        .with(Arc::new(vsi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_every_format() {
        let registry = default_registry(None);
        for format in SourceFormat::ALL {
            let adapter = registry.get(format).expect("adapter registered");
            assert_eq!(adapter.format(), format);
            assert!(registry.encoder(format).is_some());
        }
        assert_eq!(registry.formats().len(), 4);
    }
}
