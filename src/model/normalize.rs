//! Axis normalizer.
//!
//! Adapters hand over a [`RawArray`] in whatever axis order their format
//! uses, together with a declared [`AxisLayout`]. [`normalize`] maps it onto
//! the canonical `(T, C, Z, Y, X)` tensor:
//!
//! | Layout    | Result                                   |
//! |-----------|------------------------------------------|
//! | `YX`      | `(1, 1, 1, Y, X)`                        |
//! | `CYX`     | `(1, C, 1, Y, X)`                        |
//! | `ZCYX`    | `(1, C, Z, Y, X)` (Z and C swapped)      |
//! | `TCYX`    | `(T, C, 1, Y, X)`                        |
//! | `TCZYX`   | unchanged                                |
//! | `TCZYXS`  | `(T, C*S, Z, Y, X)`, samples folded into C |

use crate::error::ShapeError;

use super::tensor::{permuted_offsets, CanonicalTensor, PixelBuffer};

/// Axis semantics of a decoded array, declared by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisLayout {
    YX,
    CYX,
    ZCYX,
    TCYX,
    TCZYX,
    /// Trailing per-pixel sample axis (interleaved RGB and the like).
    TCZYXS,
}

impl AxisLayout {
    pub const fn rank(&self) -> usize {
        match self {
            AxisLayout::YX => 2,
            AxisLayout::CYX => 3,
            AxisLayout::ZCYX | AxisLayout::TCYX => 4,
            AxisLayout::TCZYX => 5,
            AxisLayout::TCZYXS => 6,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            AxisLayout::YX => "YX",
            AxisLayout::CYX => "CYX",
            AxisLayout::ZCYX => "ZCYX",
            AxisLayout::TCYX => "TCYX",
            AxisLayout::TCZYX => "TCZYX",
            AxisLayout::TCZYXS => "TCZYXS",
        }
    }

    /// Layout assumed for an array of `rank` when the source declares none.
    /// Rank 4 defaults to `TCYX`.
    pub fn for_rank(rank: usize) -> Option<Self> {
        match rank {
            2 => Some(AxisLayout::YX),
            3 => Some(AxisLayout::CYX),
            4 => Some(AxisLayout::TCYX),
            5 => Some(AxisLayout::TCZYX),
            6 => Some(AxisLayout::TCZYXS),
            _ => None,
        }
    }
}

/// A decoded array before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArray {
    pub shape: Vec<usize>,
    pub layout: AxisLayout,
    pub data: PixelBuffer,
}

impl RawArray {
    pub fn new(shape: Vec<usize>, layout: AxisLayout, data: PixelBuffer) -> Self {
        Self {
            shape,
            layout,
            data,
        }
    }

    /// Wrap a canonical tensor so it can go through the same pipeline.
    pub fn from_tensor(tensor: CanonicalTensor) -> Self {
        let shape = tensor.shape().to_vec();
        Self::new(shape, AxisLayout::TCZYX, tensor.into_data())
    }
}

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub tensor: CanonicalTensor,
    pub channel_names: Vec<String>,
}

/// Map `raw` onto the canonical layout.
///
/// `channel_names` are passed through, except for a `TCZYXS` input with more
/// than one sample, where names for the merged channel axis are derived
/// (or synthesized when none were given).
pub fn normalize(raw: RawArray, channel_names: Vec<String>) -> Result<Normalized, ShapeError> {
    let RawArray {
        shape,
        layout,
        data,
    } = raw;

    if !(2..=6).contains(&shape.len()) {
        return Err(ShapeError::unsupported(
            &shape,
            format!("rank {} is not supported", shape.len()),
        ));
    }
    if shape.len() != layout.rank() {
        return Err(ShapeError::unsupported(
            &shape,
            format!("layout {} expects rank {}", layout.name(), layout.rank()),
        ));
    }
    if shape.contains(&0) {
        return Err(ShapeError::unsupported(&shape, "axis with zero extent"));
    }
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(ShapeError::unsupported(
            &shape,
            format!("shape holds {} samples, buffer has {}", expected, data.len()),
        ));
    }

    let (canonical, data, names) = match layout {
        AxisLayout::YX => ([1, 1, 1, shape[0], shape[1]], data, channel_names),
        AxisLayout::CYX => ([1, shape[0], 1, shape[1], shape[2]], data, channel_names),
        AxisLayout::TCYX => (
            [shape[0], shape[1], 1, shape[2], shape[3]],
            data,
            channel_names,
        ),
        AxisLayout::ZCYX => {
            let order = permuted_offsets(&shape, &[1, 0, 2, 3]);
            (
                [1, shape[1], shape[0], shape[2], shape[3]],
                data.gather(&order),
                channel_names,
            )
        }
        AxisLayout::TCZYX => (
            [shape[0], shape[1], shape[2], shape[3], shape[4]],
            data,
            channel_names,
        ),
        AxisLayout::TCZYXS => {
            let (c, s) = (shape[1], shape[5]);
            let data = if s == 1 {
                data
            } else {
                data.gather(&permuted_offsets(&shape, &[0, 1, 5, 2, 3, 4]))
            };
            (
                [shape[0], c * s, shape[2], shape[3], shape[4]],
                data,
                fold_channel_names(&channel_names, c, s),
            )
        }
    };

    Ok(Normalized {
        tensor: CanonicalTensor::new(canonical, data)?,
        channel_names: names,
    })
}

/// Names for the channel axis after folding `samples` into `channels`.
///
/// Merged channel `c * samples + s` keeps source channel `c` and sample `s`.
pub fn fold_channel_names(names: &[String], channels: usize, samples: usize) -> Vec<String> {
    if samples <= 1 {
        return names.to_vec();
    }

    let suffix = |s: usize| -> String {
        if samples == 3 {
            ["R", "G", "B"][s].to_string()
        } else {
            format!("S{}", s)
        }
    };

    if names.len() == channels {
        return names
            .iter()
            .flat_map(|name| (0..samples).map(move |s| (name, s)))
            .map(|(name, s)| format!("{}_{}", name, suffix(s)))
            .collect();
    }

    if channels == 1 {
        return (0..samples).map(suffix).collect();
    }

    (0..channels)
        .flat_map(|c| (0..samples).map(move |s| (c, s)))
        .map(|(c, s)| format!("Channel_{}_{}", c, suffix(s)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tensor::PixelType;

    fn ramp(len: usize) -> PixelBuffer {
        PixelBuffer::U16((0..len as u16).collect())
    }

    #[test]
    fn test_rank2_inserts_tcz() {
        let raw = RawArray::new(vec![3, 4], AxisLayout::YX, ramp(12));
        let out = normalize(raw, vec![]).unwrap();
        assert_eq!(out.tensor.shape(), [1, 1, 1, 3, 4]);
        assert_eq!(out.tensor.data(), &ramp(12));
    }

    #[test]
    fn test_rank3_inserts_tz() {
        let raw = RawArray::new(vec![2, 3, 4], AxisLayout::CYX, ramp(24));
        let out = normalize(raw, vec!["DAPI".into(), "FITC".into()]).unwrap();
        assert_eq!(out.tensor.shape(), [1, 2, 1, 3, 4]);
        assert_eq!(out.channel_names, vec!["DAPI", "FITC"]);
    }

    #[test]
    fn test_rank4_tcyx_inserts_z() {
        let raw = RawArray::new(vec![2, 3, 4, 5], AxisLayout::TCYX, ramp(120));
        let out = normalize(raw, vec![]).unwrap();
        assert_eq!(out.tensor.shape(), [2, 3, 1, 4, 5]);
        assert_eq!(out.tensor.data(), &ramp(120));
    }

    #[test]
    fn test_rank4_zcyx_swaps_axes() {
        // Z=2, C=3, Y=1, X=1: value = z * 3 + c
        let raw = RawArray::new(vec![2, 3, 1, 1], AxisLayout::ZCYX, ramp(6));
        let out = normalize(raw, vec![]).unwrap();
        assert_eq!(out.tensor.shape(), [1, 3, 2, 1, 1]);
        // canonical order walks c then z: (c0,z0)=0 (c0,z1)=3 (c1,z0)=1 ...
        assert_eq!(out.tensor.data(), &PixelBuffer::U16(vec![0, 3, 1, 4, 2, 5]));
    }

    #[test]
    fn test_rank5_is_identity() {
        let tensor =
            CanonicalTensor::new([2, 1, 3, 4, 5], ramp(120)).unwrap();
        let out = normalize(RawArray::from_tensor(tensor.clone()), vec!["a".into()]).unwrap();
        assert_eq!(out.tensor, tensor);
        assert_eq!(out.channel_names, vec!["a"]);

        // and again
        let again = normalize(RawArray::from_tensor(out.tensor.clone()), vec![]).unwrap();
        assert_eq!(again.tensor, tensor);
    }

    #[test]
    fn test_rank6_folds_rgb_samples() {
        // 1x1x1x1x2 pixels, 3 samples each: [r0 g0 b0 r1 g1 b1]
        let data = PixelBuffer::U8(vec![10, 20, 30, 11, 21, 31]);
        let raw = RawArray::new(vec![1, 1, 1, 1, 2, 3], AxisLayout::TCZYXS, data);
        let out = normalize(raw, vec![]).unwrap();

        assert_eq!(out.tensor.shape(), [1, 3, 1, 1, 2]);
        assert_eq!(
            out.tensor.data(),
            &PixelBuffer::U8(vec![10, 11, 20, 21, 30, 31])
        );
        assert_eq!(out.channel_names, vec!["R", "G", "B"]);
    }

    #[test]
    fn test_rank6_merged_channel_order() {
        // C=2, S=2: merged channel index is c * S + s
        let data = PixelBuffer::U8(vec![0, 1, 2, 3]);
        let raw = RawArray::new(vec![1, 2, 1, 1, 1, 2], AxisLayout::TCZYXS, data);
        let out = normalize(raw, vec!["A".into(), "B".into()]).unwrap();
        assert_eq!(out.tensor.shape(), [1, 4, 1, 1, 1]);
        assert_eq!(out.tensor.data(), &PixelBuffer::U8(vec![0, 1, 2, 3]));
        assert_eq!(out.channel_names, vec!["A_S0", "A_S1", "B_S0", "B_S1"]);
    }

    #[test]
    fn test_zero_extent_rejected() {
        let raw = RawArray::new(vec![0, 4], AxisLayout::YX, PixelBuffer::zeros(PixelType::Uint8, 0));
        assert!(matches!(
            normalize(raw, vec![]),
            Err(ShapeError::UnsupportedShape { .. })
        ));
    }

    #[test]
    fn test_rank_layout_mismatch_rejected() {
        let raw = RawArray::new(vec![2, 2, 2], AxisLayout::YX, ramp(8));
        assert!(normalize(raw, vec![]).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let raw = RawArray::new(vec![2, 2], AxisLayout::YX, ramp(3));
        assert!(normalize(raw, vec![]).is_err());
    }

    #[test]
    fn test_layout_for_rank() {
        assert_eq!(AxisLayout::for_rank(4), Some(AxisLayout::TCYX));
        assert_eq!(AxisLayout::for_rank(1), None);
        assert_eq!(AxisLayout::for_rank(7), None);
    }

    #[test]
    fn test_fold_names_multi_channel_rgb() {
        let names = fold_channel_names(&[], 2, 3);
        assert_eq!(
            names,
            vec!["Channel_0_R", "Channel_0_G", "Channel_0_B", "Channel_1_R", "Channel_1_G", "Channel_1_B"]
        );
    }
}
