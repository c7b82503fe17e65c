//! Source and destination format resolution.
//!
//! A job resolves its formats once, up front: an explicit hint wins, then
//! the file extension, then a look at the leading bytes (or, for
//! directories, the Zarr metadata files).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::container::layout::is_hdf5_signature;
use crate::io::{LocalFileReader, RangeReader};

// =============================================================================
// SourceFormat
// =============================================================================

/// The formats a conversion can read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    /// `.univ` container
    Univ,

    /// OME-TIFF (BigTIFF, one page per plane)
    OmeTiff,

    /// OME-Zarr directory store
    OmeZarr,

    /// Olympus VSI slide (read through a slide backend; written as a
    /// VSI-compatible OME-TIFF)
    Vsi,
}

impl SourceFormat {
    pub const ALL: [SourceFormat; 4] = [
        SourceFormat::Univ,
        SourceFormat::OmeTiff,
        SourceFormat::OmeZarr,
        SourceFormat::Vsi,
    ];

    /// Short identifier, as used on the command line and in metadata.
    pub const fn name(&self) -> &'static str {
        match self {
            SourceFormat::Univ => "univ",
            SourceFormat::OmeTiff => "ome-tiff",
            SourceFormat::OmeZarr => "ome-zarr",
            SourceFormat::Vsi => "vsi",
        }
    }

    /// Human-readable name.
    pub const fn display_name(&self) -> &'static str {
        match self {
            SourceFormat::Univ => "univ container",
            SourceFormat::OmeTiff => "OME-TIFF",
            SourceFormat::OmeZarr => "OME-Zarr",
            SourceFormat::Vsi => "Olympus VSI",
        }
    }

    /// Whether the format is stored as a directory tree.
    pub const fn is_directory(&self) -> bool {
        matches!(self, SourceFormat::OmeZarr)
    }

    pub const fn default_extension(&self) -> &'static str {
        match self {
            SourceFormat::Univ => "univ",
            SourceFormat::OmeTiff => "ome.tiff",
            SourceFormat::OmeZarr => "ome.zarr",
            SourceFormat::Vsi => "vsi",
        }
    }

    /// Parse a format name. Accepts the short identifiers plus common
    /// spellings ("OME-TIFF", "tiff", "zarr", ...), case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "univ" | "univcontainer" => Some(SourceFormat::Univ),
            "ometiff" | "ometif" | "tiff" | "tif" => Some(SourceFormat::OmeTiff),
            "omezarr" | "zarr" => Some(SourceFormat::OmeZarr),
            "vsi" | "olympusvsi" => Some(SourceFormat::Vsi),
            _ => None,
        }
    }

    /// Guess the format from a path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        let name = name.trim_end_matches('/');
        if name.ends_with(".univ") {
            Some(SourceFormat::Univ)
        } else if name.ends_with(".zarr") {
            Some(SourceFormat::OmeZarr)
        } else if name.ends_with(".vsi") {
            Some(SourceFormat::Vsi)
        } else if [".tif", ".tiff", ".btf", ".tf8"]
            .iter()
            .any(|ext| name.ends_with(ext))
        {
            Some(SourceFormat::OmeTiff)
        } else {
            None
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceFormat::from_name(s).ok_or_else(|| format!("unknown format '{}'", s))
    }
}

// =============================================================================
// Sniffing
// =============================================================================

/// Bytes needed to recognise any supported file header.
const SNIFF_BYTES: usize = 16;

/// Check if bytes look like a TIFF or BigTIFF header.
///
/// Byte order mark (II or MM) followed by version 42 or 43.
pub fn is_tiff_header(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    let version = match &bytes[0..2] {
        b"II" => u16::from_le_bytes([bytes[2], bytes[3]]),
        b"MM" => u16::from_be_bytes([bytes[2], bytes[3]]),
        _ => return false,
    };
    version == 42 || version == 43
}

/// Check if bytes start with the HDF5 signature every container carries.
pub fn is_container_header(bytes: &[u8]) -> bool {
    is_hdf5_signature(bytes)
}

/// Identify a file from its leading bytes.
///
/// VSI files are TIFF-structured; a `.vsi` extension is what tells them
/// apart, so sniffing alone reports them as OME-TIFF.
pub async fn sniff_format<R: RangeReader>(reader: &R) -> Option<SourceFormat> {
    let len = (reader.size() as usize).min(SNIFF_BYTES);
    let bytes = reader.read_exact_at(0, len).await.ok()?;
    if is_container_header(&bytes) {
        Some(SourceFormat::Univ)
    } else if is_tiff_header(&bytes) {
        Some(SourceFormat::OmeTiff)
    } else {
        None
    }
}

/// Resolve the format of `path`: `hint`, then extension, then content.
pub async fn resolve_format(path: &Path, hint: Option<SourceFormat>) -> Option<SourceFormat> {
    if hint.is_some() {
        return hint;
    }
    if let Some(format) = SourceFormat::from_path(path) {
        return Some(format);
    }

    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => {
            for marker in [".zgroup", ".zarray", ".zattrs"] {
                if tokio::fs::try_exists(path.join(marker)).await.unwrap_or(false) {
                    return Some(SourceFormat::OmeZarr);
                }
            }
            None
        }
        Ok(_) => {
            let reader = LocalFileReader::open(path).await.ok()?;
            sniff_format(&reader).await
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;

    #[test]
    fn test_is_tiff_header() {
        assert!(is_tiff_header(&[0x49, 0x49, 0x2A, 0x00]));
        assert!(is_tiff_header(&[0x4D, 0x4D, 0x00, 0x2A]));
        assert!(is_tiff_header(&[0x49, 0x49, 0x2B, 0x00]));
        assert!(!is_tiff_header(&[0x49, 0x49, 0x2C, 0x00]));
        assert!(!is_tiff_header(&[0x89, 0x50, 0x4E, 0x47]));
        assert!(!is_tiff_header(&[0x49, 0x49]));
    }

    #[test]
    fn test_from_path() {
        let cases = [
            ("slide.vsi", Some(SourceFormat::Vsi)),
            ("out.ome.tiff", Some(SourceFormat::OmeTiff)),
            ("OUT.TIF", Some(SourceFormat::OmeTiff)),
            ("image.ome.zarr", Some(SourceFormat::OmeZarr)),
            ("data.univ", Some(SourceFormat::Univ)),
            ("notes.txt", None),
        ];
        for (name, expected) in cases {
            assert_eq!(SourceFormat::from_path(Path::new(name)), expected, "{}", name);
        }
    }

    #[test]
    fn test_from_name_is_lenient() {
        assert_eq!(SourceFormat::from_name("OME-TIFF"), Some(SourceFormat::OmeTiff));
        assert_eq!(SourceFormat::from_name("ome_zarr"), Some(SourceFormat::OmeZarr));
        assert_eq!(SourceFormat::from_name("VSI"), Some(SourceFormat::Vsi));
        assert_eq!("univ".parse::<SourceFormat>(), Ok(SourceFormat::Univ));
        assert!("png".parse::<SourceFormat>().is_err());

        for format in SourceFormat::ALL {
            assert_eq!(SourceFormat::from_name(format.name()), Some(format));
        }
    }

    #[tokio::test]
    async fn test_sniff_format() {
        let tiff = MemoryReader::new(vec![0x49, 0x49, 0x2B, 0x00, 8, 0, 0, 0], "t");
        assert_eq!(sniff_format(&tiff).await, Some(SourceFormat::OmeTiff));

        let univ = MemoryReader::new(b"\x89HDF\r\n\x1a\n\x00\x00".to_vec(), "u");
        assert_eq!(sniff_format(&univ).await, Some(SourceFormat::Univ));

        let other = MemoryReader::new(vec![0u8; 3], "o");
        assert_eq!(sniff_format(&other).await, None);
    }

    #[tokio::test]
    async fn test_resolve_format_prefers_hint_then_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_extension");
        std::fs::write(&path, b"\x89HDF\r\n\x1a\n................").unwrap();

        assert_eq!(resolve_format(&path, None).await, Some(SourceFormat::Univ));
        assert_eq!(
            resolve_format(&path, Some(SourceFormat::Vsi)).await,
            Some(SourceFormat::Vsi)
        );

        let store = dir.path().join("store");
        std::fs::create_dir(&store).unwrap();
        std::fs::write(store.join(".zgroup"), b"{\"zarr_format\": 2}").unwrap();
        assert_eq!(resolve_format(&store, None).await, Some(SourceFormat::OmeZarr));
    }
}
