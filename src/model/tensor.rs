//! Canonical tensor and pixel buffers.
//!
//! Every conversion pivots through [`CanonicalTensor`]: a dense, C-ordered
//! array whose axes are always `(T, C, Z, Y, X)`. Sample storage is one of
//! four element types, held in a [`PixelBuffer`].

use serde::{Deserialize, Serialize};

use crate::error::ShapeError;

/// Canonical axis order of every tensor in the pipeline.
pub const AXIS_ORDER: &str = "TCZYX";

// =============================================================================
// PixelType
// =============================================================================

/// Element type of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    Uint8,
    Uint16,
    Float32,
    Float64,
}

impl PixelType {
    /// Size of one element in bytes.
    pub const fn element_size(&self) -> usize {
        match self {
            PixelType::Uint8 => 1,
            PixelType::Uint16 => 2,
            PixelType::Float32 => 4,
            PixelType::Float64 => 8,
        }
    }

    /// Type name used by OME-XML `Pixels/@Type`.
    pub const fn ome_name(&self) -> &'static str {
        match self {
            PixelType::Uint8 => "uint8",
            PixelType::Uint16 => "uint16",
            PixelType::Float32 => "float",
            PixelType::Float64 => "double",
        }
    }

    /// Parse an OME-XML type name.
    pub fn from_ome_name(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(PixelType::Uint8),
            "uint16" => Some(PixelType::Uint16),
            "float" => Some(PixelType::Float32),
            "double" => Some(PixelType::Float64),
            _ => None,
        }
    }
}

// =============================================================================
// Sample
// =============================================================================

/// A scalar that can live in a [`PixelBuffer`].
pub trait Sample: Copy + Default + PartialEq + Send + Sync + 'static {
    const PIXEL_TYPE: PixelType;

    /// Append the little-endian encoding of `self` to `out`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from the first `size_of::<Self>()` bytes of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_sample {
    ($ty:ty, $variant:ident, $n:expr) => {
        impl Sample for $ty {
            const PIXEL_TYPE: PixelType = PixelType::$variant;

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&bytes[..$n]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_sample!(u8, Uint8, 1);
impl_sample!(u16, Uint16, 2);
impl_sample!(f32, Float32, 4);
impl_sample!(f64, Float64, 8);

fn encode_le<T: Sample>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * std::mem::size_of::<T>());
    for &v in values {
        v.write_le(&mut out);
    }
    out
}

fn decode_le<T: Sample>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(T::read_le)
        .collect()
}

fn scatter_into<T: Sample>(dst: &mut [T], src: &[T], indices: &[usize]) {
    for (&i, &v) in indices.iter().zip(src) {
        dst[i] = v;
    }
}

// =============================================================================
// PixelBuffer
// =============================================================================

/// Flat sample storage, tagged with its element type.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl PixelBuffer {
    /// A buffer of `len` zero samples.
    pub fn zeros(pixel_type: PixelType, len: usize) -> Self {
        match pixel_type {
            PixelType::Uint8 => PixelBuffer::U8(vec![0; len]),
            PixelType::Uint16 => PixelBuffer::U16(vec![0; len]),
            PixelType::Float32 => PixelBuffer::F32(vec![0.0; len]),
            PixelType::Float64 => PixelBuffer::F64(vec![0.0; len]),
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            PixelBuffer::U8(_) => PixelType::Uint8,
            PixelBuffer::U16(_) => PixelType::Uint16,
            PixelBuffer::F32(_) => PixelType::Float32,
            PixelBuffer::F64(_) => PixelType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(v) => v.len(),
            PixelBuffer::U16(v) => v.len(),
            PixelBuffer::F32(v) => v.len(),
            PixelBuffer::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the samples in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.pixel_type().element_size()
    }

    /// Build a new buffer from the samples at `indices`, in that order.
    ///
    /// # Panics
    /// Panics if an index is out of bounds.
    pub fn gather(&self, indices: &[usize]) -> Self {
        match self {
            PixelBuffer::U8(v) => PixelBuffer::U8(indices.iter().map(|&i| v[i]).collect()),
            PixelBuffer::U16(v) => PixelBuffer::U16(indices.iter().map(|&i| v[i]).collect()),
            PixelBuffer::F32(v) => PixelBuffer::F32(indices.iter().map(|&i| v[i]).collect()),
            PixelBuffer::F64(v) => PixelBuffer::F64(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Write the samples of `src` to positions `indices` of `self`.
    ///
    /// Fails if the element types differ or the counts disagree.
    pub fn scatter(&mut self, src: &PixelBuffer, indices: &[usize]) -> Result<(), ShapeError> {
        if src.len() != indices.len() {
            return Err(ShapeError::unsupported(
                &[src.len()],
                format!("expected {} samples", indices.len()),
            ));
        }
        if let Some(&max) = indices.iter().max() {
            if max >= self.len() {
                return Err(ShapeError::unsupported(
                    &[self.len()],
                    format!("index {} out of bounds", max),
                ));
            }
        }
        match (self, src) {
            (PixelBuffer::U8(d), PixelBuffer::U8(s)) => scatter_into(d, s, indices),
            (PixelBuffer::U16(d), PixelBuffer::U16(s)) => scatter_into(d, s, indices),
            (PixelBuffer::F32(d), PixelBuffer::F32(s)) => scatter_into(d, s, indices),
            (PixelBuffer::F64(d), PixelBuffer::F64(s)) => scatter_into(d, s, indices),
            (dst, src) => {
                return Err(ShapeError::unsupported(
                    &[src.len()],
                    format!(
                        "cannot copy {:?} samples into a {:?} buffer",
                        src.pixel_type(),
                        dst.pixel_type()
                    ),
                ))
            }
        }
        Ok(())
    }

    /// Copy `src` into `self` starting at sample `offset`.
    pub fn write_at(&mut self, offset: usize, src: &PixelBuffer) -> Result<(), ShapeError> {
        let end = offset + src.len();
        if end > self.len() {
            return Err(ShapeError::unsupported(
                &[self.len()],
                format!("cannot write {} samples at offset {}", src.len(), offset),
            ));
        }
        match (self, src) {
            (PixelBuffer::U8(d), PixelBuffer::U8(s)) => d[offset..end].copy_from_slice(s),
            (PixelBuffer::U16(d), PixelBuffer::U16(s)) => d[offset..end].copy_from_slice(s),
            (PixelBuffer::F32(d), PixelBuffer::F32(s)) => d[offset..end].copy_from_slice(s),
            (PixelBuffer::F64(d), PixelBuffer::F64(s)) => d[offset..end].copy_from_slice(s),
            (dst, src) => {
                return Err(ShapeError::unsupported(
                    &[src.len()],
                    format!(
                        "cannot copy {:?} samples into a {:?} buffer",
                        src.pixel_type(),
                        dst.pixel_type()
                    ),
                ))
            }
        }
        Ok(())
    }

    /// Little-endian byte encoding of every sample.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            PixelBuffer::U8(v) => v.clone(),
            PixelBuffer::U16(v) => encode_le(v),
            PixelBuffer::F32(v) => encode_le(v),
            PixelBuffer::F64(v) => encode_le(v),
        }
    }

    /// Decode little-endian samples of `pixel_type`.
    pub fn from_le_bytes(pixel_type: PixelType, bytes: &[u8]) -> Result<Self, ShapeError> {
        let size = pixel_type.element_size();
        if bytes.len() % size != 0 {
            return Err(ShapeError::unsupported(
                &[bytes.len()],
                format!("byte length is not a multiple of {}", size),
            ));
        }
        Ok(match pixel_type {
            PixelType::Uint8 => PixelBuffer::U8(bytes.to_vec()),
            PixelType::Uint16 => PixelBuffer::U16(decode_le(bytes)),
            PixelType::Float32 => PixelBuffer::F32(decode_le(bytes)),
            PixelType::Float64 => PixelBuffer::F64(decode_le(bytes)),
        })
    }
}

impl From<Vec<u8>> for PixelBuffer {
    fn from(v: Vec<u8>) -> Self {
        PixelBuffer::U8(v)
    }
}

impl From<Vec<u16>> for PixelBuffer {
    fn from(v: Vec<u16>) -> Self {
        PixelBuffer::U16(v)
    }
}

impl From<Vec<f32>> for PixelBuffer {
    fn from(v: Vec<f32>) -> Self {
        PixelBuffer::F32(v)
    }
}

impl From<Vec<f64>> for PixelBuffer {
    fn from(v: Vec<f64>) -> Self {
        PixelBuffer::F64(v)
    }
}

// =============================================================================
// Index helpers
// =============================================================================

/// C-order strides (in elements) of an array of `shape`.
pub(crate) fn c_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Flat offsets visited by walking `extent` in C order, starting at `base`,
/// moving `strides[d]` elements per step along axis `d`.
pub(crate) fn walk_offsets(extent: &[usize], strides: &[usize], base: usize) -> Vec<usize> {
    let total: usize = extent.iter().product();
    let mut out = Vec::with_capacity(total);
    if total == 0 {
        return out;
    }

    let rank = extent.len();
    let mut idx = vec![0usize; rank];
    loop {
        let offset = base
            + idx
                .iter()
                .zip(strides)
                .map(|(&i, &s)| i * s)
                .sum::<usize>();
        out.push(offset);

        let mut d = rank;
        loop {
            if d == 0 {
                return out;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < extent[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}

/// Flat offsets (C order) of the box `origin .. origin + extent` inside an
/// array of `shape`, taking every `step[d]`-th element along axis `d`.
pub(crate) fn strided_offsets(
    shape: &[usize],
    origin: &[usize],
    extent: &[usize],
    step: &[usize],
) -> Vec<usize> {
    let strides = c_strides(shape);
    let base = origin.iter().zip(&strides).map(|(&o, &s)| o * s).sum();
    let walk: Vec<usize> = strides.iter().zip(step).map(|(&s, &k)| s * k).collect();
    walk_offsets(extent, &walk, base)
}

/// Flat offsets (C order) of the box `origin .. origin + extent` inside an
/// array of `shape`.
pub(crate) fn region_offsets(shape: &[usize], origin: &[usize], extent: &[usize]) -> Vec<usize> {
    let ones = vec![1usize; shape.len()];
    strided_offsets(shape, origin, extent, &ones)
}

/// Gather order that transposes an array of `shape` so output axis `d` is
/// input axis `perm[d]`.
pub(crate) fn permuted_offsets(shape: &[usize], perm: &[usize]) -> Vec<usize> {
    let strides = c_strides(shape);
    let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
    let walk: Vec<usize> = perm.iter().map(|&p| strides[p]).collect();
    walk_offsets(&out_shape, &walk, 0)
}

// =============================================================================
// CanonicalTensor
// =============================================================================

/// A rank-5 `(T, C, Z, Y, X)` image.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTensor {
    shape: [usize; 5],
    data: PixelBuffer,
}

impl CanonicalTensor {
    /// Wrap `data` as a tensor of `shape`.
    ///
    /// Zero extents are allowed here (the container writer rejects them
    /// separately); a sample count that disagrees with the shape is not.
    pub fn new(shape: [usize; 5], data: PixelBuffer) -> Result<Self, ShapeError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ShapeError::unsupported(
                &shape,
                format!("shape holds {} samples, buffer has {}", expected, data.len()),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Wrap `data` without re-checking its length against `shape`.
    pub(crate) fn from_parts(shape: [usize; 5], data: PixelBuffer) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    /// A tensor of zeros.
    pub fn zeros(shape: [usize; 5], pixel_type: PixelType) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: PixelBuffer::zeros(pixel_type, len),
        }
    }

    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn size_t(&self) -> usize {
        self.shape[0]
    }

    pub fn size_c(&self) -> usize {
        self.shape[1]
    }

    pub fn size_z(&self) -> usize {
        self.shape[2]
    }

    pub fn size_y(&self) -> usize {
        self.shape[3]
    }

    pub fn size_x(&self) -> usize {
        self.shape[4]
    }

    pub fn pixel_type(&self) -> PixelType {
        self.data.pixel_type()
    }

    /// Number of samples.
    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the samples in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.byte_len()
    }

    pub fn data(&self) -> &PixelBuffer {
        &self.data
    }

    pub fn into_data(self) -> PixelBuffer {
        self.data
    }

    /// Number of `(Y, X)` planes.
    pub fn plane_count(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// Flat offset of a sample.
    pub fn offset(&self, t: usize, c: usize, z: usize, y: usize, x: usize) -> usize {
        let [_, sc, sz, sy, sx] = self.shape;
        (((t * sc + c) * sz + z) * sy + y) * sx + x
    }

    /// Copy of one `(Y, X)` plane.
    pub fn plane(&self, t: usize, c: usize, z: usize) -> PixelBuffer {
        let start = self.offset(t, c, z, 0, 0);
        let len = self.shape[3] * self.shape[4];
        let indices: Vec<usize> = (start..start + len).collect();
        self.data.gather(&indices)
    }
}

// =============================================================================
// Thumbnail
// =============================================================================

/// A small `(C, Y, X)` preview image.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    shape: [usize; 3],
    data: PixelBuffer,
}

impl Thumbnail {
    pub fn new(shape: [usize; 3], data: PixelBuffer) -> Result<Self, ShapeError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ShapeError::unsupported(
                &shape,
                format!("shape holds {} samples, buffer has {}", expected, data.len()),
            ));
        }
        Ok(Self { shape, data })
    }

    pub(crate) fn from_parts(shape: [usize; 3], data: PixelBuffer) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn data(&self) -> &PixelBuffer {
        &self.data
    }
}

// =============================================================================
// Tests
// =============================================================================
