//! Routing between formats.
//!
//! Adapter pairs that convert directly:
//!
//! ```text
//! univ     <-> ome-tiff
//! univ     <-> ome-zarr
//! univ      -> vsi
//! vsi       -> univ | ome-tiff | ome-zarr
//! ```
//!
//! Every other pair goes through an intermediate `.univ` container next to
//! the output.

use std::path::Path;

use tempfile::TempPath;

use crate::error::ConvertError;
use crate::format::SourceFormat;

/// Extension of the intermediate container of a two-hop conversion.
pub const INTERMEDIATE_EXTENSION: &str = "temp.univ";

const DIRECT_PAIRS: &[(SourceFormat, SourceFormat)] = &[
    (SourceFormat::Univ, SourceFormat::OmeTiff),
    (SourceFormat::OmeTiff, SourceFormat::Univ),
    (SourceFormat::Univ, SourceFormat::OmeZarr),
    (SourceFormat::OmeZarr, SourceFormat::Univ),
    (SourceFormat::Univ, SourceFormat::Vsi),
    (SourceFormat::Vsi, SourceFormat::Univ),
    (SourceFormat::Vsi, SourceFormat::OmeTiff),
    (SourceFormat::Vsi, SourceFormat::OmeZarr),
];

/// How a job gets from its source format to its destination format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct {
        from: SourceFormat,
        to: SourceFormat,
    },
    /// `from -> univ -> to`.
    ViaContainer {
        from: SourceFormat,
        to: SourceFormat,
    },
}

impl Route {
    pub fn from(&self) -> SourceFormat {
        match *self {
            Route::Direct { from, .. } | Route::ViaContainer { from, .. } => from,
        }
    }

    pub fn to(&self) -> SourceFormat {
        match *self {
            Route::Direct { to, .. } | Route::ViaContainer { to, .. } => to,
        }
    }

    pub fn hop_count(&self) -> usize {
        match self {
            Route::Direct { .. } => 1,
            Route::ViaContainer { .. } => 2,
        }
    }

    pub fn is_two_hop(&self) -> bool {
        matches!(self, Route::ViaContainer { .. })
    }
}

/// Whether `from -> to` has a direct adapter pair.
pub fn is_direct(from: SourceFormat, to: SourceFormat) -> bool {
    DIRECT_PAIRS.contains(&(from, to))
}

/// Choose the route for `from -> to`.
///
/// Converting a format to itself is not a conversion and has no route.
pub fn plan_route(from: SourceFormat, to: SourceFormat) -> Result<Route, ConvertError> {
    if from == to {
        return Err(ConvertError::NoDirectRoute {
            from: from.name(),
            to: to.name(),
        });
    }
    if is_direct(from, to) {
        return Ok(Route::Direct { from, to });
    }
    if is_direct(from, SourceFormat::Univ) && is_direct(SourceFormat::Univ, to) {
        return Ok(Route::ViaContainer { from, to });
    }
    Err(ConvertError::NoDirectRoute {
        from: from.name(),
        to: to.name(),
    })
}

/// Reserves a fresh intermediate container next to `output`.
///
/// The name is `<stem>.<random>.temp.univ`, so concurrent jobs writing into
/// one directory never share it and no existing file is ever reused. The
/// file is removed when the returned [`TempPath`] drops.
pub fn intermediate_path(output: &Path) -> std::io::Result<TempPath> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file = tempfile::Builder::new()
        .prefix(&format!("{}.", stem))
        .suffix(&format!(".{}", INTERMEDIATE_EXTENSION))
        .tempfile_in(parent)?;
    Ok(file.into_temp_path())
}
