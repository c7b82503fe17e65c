//! Scene classification and selection for multi-series sources.
//!
//! Slide scanners expose the main image next to auxiliary series (label,
//! macro, overview, pre-computed pyramid levels). The selector picks the
//! largest series that is not a label or macro image.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AdapterError;

/// `<base-name> #<integer>`, the auto-numbered series naming.
static NUMBERED_SERIES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.+\s+#\d+$").expect("series pattern is a valid regex"));

/// Classification of one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneKind {
    Main,
    PyramidLevel,
    Overview,
    Label,
    Macro,
    Unknown,
}

impl SceneKind {
    pub const fn name(&self) -> &'static str {
        match self {
            SceneKind::Main => "main",
            SceneKind::PyramidLevel => "pyramid-level",
            SceneKind::Overview => "overview",
            SceneKind::Label => "label",
            SceneKind::Macro => "macro",
            SceneKind::Unknown => "unknown",
        }
    }

    /// Label and macro images are never picked while anything else exists.
    pub const fn is_auxiliary(&self) -> bool {
        matches!(self, SceneKind::Label | SceneKind::Macro)
    }
}

/// Classify a series by name.
pub fn classify_scene(name: &str) -> SceneKind {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return SceneKind::Unknown;
    }

    let lower = trimmed.to_lowercase();
    if lower.contains("label") {
        SceneKind::Label
    } else if lower.contains("macro") {
        SceneKind::Macro
    } else if lower.contains("overview") {
        SceneKind::Overview
    } else if NUMBERED_SERIES.is_match(trimmed) {
        SceneKind::PyramidLevel
    } else {
        SceneKind::Main
    }
}

/// One series of a multi-series source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneDescriptor {
    pub index: usize,
    pub name: String,
    pub width: u64,
    pub height: u64,
    pub pixel_count: u64,
    pub kind: SceneKind,
}

impl SceneDescriptor {
    pub fn new(index: usize, name: impl Into<String>, width: u64, height: u64) -> Self {
        let name = name.into();
        let kind = classify_scene(&name);
        Self {
            index,
            name,
            width,
            height,
            pixel_count: width.saturating_mul(height),
            kind,
        }
    }
}

/// Pick the scene to export, returning its `index`.
///
/// Largest pixel count among non-label/non-macro scenes, ties going to the
/// lowest index. Falls back to the largest scene overall when every scene is
/// auxiliary. `None` only for an empty list.
pub fn select_main_scene(scenes: &[SceneDescriptor]) -> Option<usize> {
    let largest = |candidates: &mut dyn Iterator<Item = &SceneDescriptor>| {
        candidates
            .fold(None::<&SceneDescriptor>, |best, s| match best {
                Some(b)
                    if b.pixel_count > s.pixel_count
                        || (b.pixel_count == s.pixel_count && b.index <= s.index) =>
                {
                    Some(b)
                }
                _ => Some(s),
            })
            .map(|s| s.index)
    };

    largest(&mut scenes.iter().filter(|s| !s.kind.is_auxiliary()))
        .or_else(|| largest(&mut scenes.iter()))
}

/// Which scene of a multi-series source to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneSelector {
    /// Let [`select_main_scene`] decide.
    #[default]
    Auto,
    /// A specific scene index.
    Index(usize),
}

impl SceneSelector {
    /// Resolve against the scenes of a source.
    pub fn resolve(&self, scenes: &[SceneDescriptor]) -> Result<usize, AdapterError> {
        match *self {
            SceneSelector::Index(index) => {
                if scenes.iter().any(|s| s.index == index) {
                    Ok(index)
                } else {
                    Err(AdapterError::SceneOutOfRange {
                        index,
                        count: scenes.len(),
                    })
                }
            }
            SceneSelector::Auto => {
                select_main_scene(scenes).ok_or(AdapterError::SceneOutOfRange {
                    index: 0,
                    count: 0,
                })
            }
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, SceneSelector::Auto)
    }
}

// =============================================================================
// Available resolutions
// =============================================================================

/// Smallest extent a listed resolution may have.
pub const MIN_RESOLUTION_EXTENT: u64 = 512;

/// One exportable resolution of a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOption {
    pub level: u32,
    pub width: u64,
    pub height: u64,
    pub megapixels: f64,
    pub downsample: u64,
}

/// Resolutions obtainable by halving, listed while `min(w, h) >= 512`.
/// The full resolution is always listed.
pub fn available_resolutions(width: u64, height: u64) -> Vec<ResolutionOption> {
    let mut out = Vec::new();
    let (mut w, mut h) = (width, height);
    let mut level = 0u32;

    loop {
        out.push(ResolutionOption {
            level,
            width: w,
            height: h,
            megapixels: (w as f64 * h as f64) / 1_000_000.0,
            downsample: 1u64 << level,
        });
        w /= 2;
        h /= 2;
        level += 1;
        if w.min(h) < MIN_RESOLUTION_EXTENT || level >= 63 {
            break;
        }
    }
    out
}
