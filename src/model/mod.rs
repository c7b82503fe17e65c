//! Canonical image model.
//!
//! - [`tensor`]: the `(T, C, Z, Y, X)` tensor and its pixel buffers
//! - [`normalize`]: maps decoded arrays onto the canonical axes
//! - [`scene`]: classifies and picks series of multi-series sources
//! - [`pyramid`]: downsampled levels and the thumbnail
//! - [`metadata`]: physical sizes, channel names and source information

pub mod metadata;
pub mod normalize;
pub mod pyramid;
pub mod scene;
pub mod tensor;

pub use metadata::{
    file_name_of, format_timestamp, parse_timestamp, ImageMetadata, PhysicalSize, DEFAULT_UNIT,
};
pub use normalize::{fold_channel_names, normalize, AxisLayout, Normalized, RawArray};
pub use pyramid::{
    build_pyramid, decimate_to_level, downsample_by_two, make_thumbnail, should_build_pyramid,
    ImagePyramid, PyramidLevel, PYRAMID_FLOOR, PYRAMID_MIN_BASE, THUMBNAIL_MAX,
};
pub use scene::{
    available_resolutions, classify_scene, select_main_scene, ResolutionOption, SceneDescriptor,
    SceneKind, SceneSelector,
};
pub use tensor::{CanonicalTensor, PixelBuffer, PixelType, Sample, Thumbnail, AXIS_ORDER};
