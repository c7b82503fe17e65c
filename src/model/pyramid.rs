//! Pyramid builder and thumbnail.
//!
//! Levels are produced by stride-2 nearest-neighbour decimation of Y and X,
//! each from the level before it. Generation continues while
//! `min(Y, X) > PYRAMID_FLOOR`, and is skipped entirely for bases whose
//! `min(Y, X) <= PYRAMID_MIN_BASE`.

use crate::error::ShapeError;

use super::tensor::{strided_offsets, CanonicalTensor, Thumbnail};

/// Bases at or below this extent get no pyramid.
pub const PYRAMID_MIN_BASE: usize = 512;

/// Levels are generated while `min(Y, X)` exceeds this.
pub const PYRAMID_FLOOR: usize = 256;

/// Maximum thumbnail extent along Y and X.
pub const THUMBNAIL_MAX: usize = 256;

/// A downsampled copy of the base at `level` (1 = half resolution).
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidLevel {
    pub level: usize,
    pub tensor: CanonicalTensor,
}

/// Base tensor plus its derived levels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePyramid {
    pub base: CanonicalTensor,
    pub levels: Vec<PyramidLevel>,
}

impl ImagePyramid {
    /// A pyramid holding only the base.
    pub fn base_only(base: CanonicalTensor) -> Self {
        Self {
            base,
            levels: Vec::new(),
        }
    }

    /// Number of resolutions, base included.
    pub fn level_count(&self) -> usize {
        1 + self.levels.len()
    }

    /// Tensor at `level`, 0 being the base.
    pub fn level(&self, level: usize) -> Option<&CanonicalTensor> {
        if level == 0 {
            Some(&self.base)
        } else {
            self.levels.get(level - 1).map(|l| &l.tensor)
        }
    }

    /// Every resolution from full to smallest.
    pub fn iter(&self) -> impl Iterator<Item = &CanonicalTensor> {
        std::iter::once(&self.base).chain(self.levels.iter().map(|l| &l.tensor))
    }
}

/// Whether a base of `shape` qualifies for a pyramid.
pub fn should_build_pyramid(shape: [usize; 5]) -> bool {
    shape[3].min(shape[4]) > PYRAMID_MIN_BASE
}

/// Halve Y and X by keeping every even row and column.
///
/// Extents become `floor(n / 2)`.
pub fn downsample_by_two(tensor: &CanonicalTensor) -> CanonicalTensor {
    let shape = tensor.shape();
    let out = [shape[0], shape[1], shape[2], shape[3] / 2, shape[4] / 2];
    let offsets = strided_offsets(&shape, &[0; 5], &out, &[1, 1, 1, 2, 2]);
    CanonicalTensor::from_parts(out, tensor.data().gather(&offsets))
}

/// Reduce `tensor` to resolution `level` by halving it `level` times.
///
/// Fails if an axis would shrink to zero.
pub fn decimate_to_level(tensor: CanonicalTensor, level: u32) -> Result<CanonicalTensor, ShapeError> {
    let mut current = tensor;
    for _ in 0..level {
        if current.size_y() < 2 || current.size_x() < 2 {
            return Err(ShapeError::unsupported(
                &current.shape(),
                format!("too small for resolution level {}", level),
            ));
        }
        current = downsample_by_two(&current);
    }
    Ok(current)
}

/// Build the pyramid for `base`, calling `on_level` as each level is made.
pub fn build_pyramid(
    base: CanonicalTensor,
    mut on_level: impl FnMut(&PyramidLevel),
) -> ImagePyramid {
    let mut levels: Vec<PyramidLevel> = Vec::new();
    if !should_build_pyramid(base.shape()) {
        return ImagePyramid::base_only(base);
    }

    loop {
        let prev = levels.last().map(|l| &l.tensor).unwrap_or(&base);
        if prev.size_y().min(prev.size_x()) <= PYRAMID_FLOOR {
            break;
        }
        let level = PyramidLevel {
            level: levels.len() + 1,
            tensor: downsample_by_two(prev),
        };
        on_level(&level);
        levels.push(level);
    }

    ImagePyramid { base, levels }
}

/// Thumbnail of the first T and Z plane, every channel, with
/// `max(Y, X) <= THUMBNAIL_MAX`.
pub fn make_thumbnail(base: &CanonicalTensor) -> Thumbnail {
    let shape = base.shape();
    let (c, y, x) = (shape[1], shape[3], shape[4]);
    let longest = y.max(x);
    let step = if longest > THUMBNAIL_MAX {
        longest.div_ceil(THUMBNAIL_MAX)
    } else {
        1
    };

    let out = [1, c, 1, y.div_ceil(step), x.div_ceil(step)];
    let offsets = strided_offsets(&shape, &[0; 5], &out, &[1, 1, 1, step, step]);
    Thumbnail::from_parts([c, out[3], out[4]], base.data().gather(&offsets))
}
