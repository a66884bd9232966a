//! Tensor codec: packs per-layer K/V tensors into one contiguous blob.
//!
//! The packed blob is role-major, `[2, num_layers, ...]`, where the last three
//! axes are the per-layer tensor axes in the layout's own order:
//!
//! ```text
//! vllm:        [2, num_layers, num_tokens, num_heads, head_size]   token axis 2
//! huggingface: [2, num_layers, num_heads, num_tokens, head_size]   token axis 3
//! ```
//!
//! Bytes are always row-major (last axis fastest). A blob carries no schema:
//! a reader needs the shape and dtype out of band, see [`BlobShape`].

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use half::f16;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{role} tensor {index} is {found_dtype} {found:?}, expected {expected_dtype} {expected:?}")]
    ShapeMismatch {
        index: usize,
        role: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
        expected_dtype: DType,
        found_dtype: DType,
    },

    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("Token range {start}..{end} out of bounds for {len} tokens")]
    OutOfRange { start: usize, end: usize, len: usize },

    #[error("No tensors to pack")]
    Empty,
}

/// Element type of tensor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    F32,
}

impl DType {
    /// Bytes per element.
    pub fn size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
        }
    }
}

/// Axis ordering convention of attention tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KvLayout {
    /// Per-layer `[num_tokens, num_heads, head_size]`.
    #[serde(rename = "vllm")]
    Vllm,
    /// Per-layer `[num_heads, num_tokens, head_size]`.
    #[serde(rename = "huggingface")]
    HuggingFace,
}

impl KvLayout {
    /// Format tag used in cache keys.
    pub fn tag(&self) -> &'static str {
        match self {
            KvLayout::Vllm => "vllm",
            KvLayout::HuggingFace => "huggingface",
        }
    }

    /// Position of the token axis in a packed blob.
    pub fn token_axis(&self) -> usize {
        match self {
            KvLayout::Vllm => 2,
            KvLayout::HuggingFace => 3,
        }
    }

    /// Element type the synthetic generator uses for this layout.
    pub fn default_dtype(&self) -> DType {
        match self {
            KvLayout::Vllm => DType::F16,
            KvLayout::HuggingFace => DType::F32,
        }
    }

    /// Per-layer tensor shape for `num_tokens` tokens.
    pub fn layer_shape(&self, num_tokens: usize, num_heads: usize, head_size: usize) -> [usize; 3] {
        match self {
            KvLayout::Vllm => [num_tokens, num_heads, head_size],
            KvLayout::HuggingFace => [num_heads, num_tokens, head_size],
        }
    }
}

impl fmt::Display for KvLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for KvLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vllm" => Ok(KvLayout::Vllm),
            "huggingface" => Ok(KvLayout::HuggingFace),
            other => Err(format!("unknown KV layout '{other}'")),
        }
    }
}

/// A dense row-major tensor held as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Bytes,
}

impl Tensor {
    /// Wrap raw row-major bytes. Fails if the length disagrees with the shape.
    pub fn new(shape: Vec<usize>, dtype: DType, data: impl Into<Bytes>) -> Result<Self, CodecError> {
        let data = data.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(CodecError::InvalidTensor(format!(
                "{} bytes for {dtype} tensor of shape {shape:?}, expected {expected}",
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    pub fn from_f16(shape: Vec<usize>, values: &[f16]) -> Result<Self, CodecError> {
        Self::new(shape, DType::F16, Bytes::copy_from_slice(bytemuck::cast_slice(values)))
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, CodecError> {
        Self::new(shape, DType::F32, Bytes::copy_from_slice(bytemuck::cast_slice(values)))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Key and value attention tensors of one transformer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerTensorPair {
    pub key: Tensor,
    pub value: Tensor,
}

/// Packed KV state across all layers and both roles.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBlob {
    layout: KvLayout,
    dtype: DType,
    shape: [usize; 5],
    data: Bytes,
}

/// Stack per-layer K/V tensors into one role-major blob.
///
/// All keys come first (layer order), then all values. Every tensor must
/// have the same rank-3 shape and dtype as layer 0's key.
pub fn pack(layers: &[LayerTensorPair], layout: KvLayout) -> Result<TensorBlob, CodecError> {
    let reference = &layers.first().ok_or(CodecError::Empty)?.key;
    let [a, b, c] = <[usize; 3]>::try_from(reference.shape()).map_err(|_| {
        CodecError::InvalidTensor(format!(
            "expected a rank-3 layer tensor, got shape {:?}",
            reference.shape()
        ))
    })?;

    for (index, pair) in layers.iter().enumerate() {
        for (role, t) in [("key", &pair.key), ("value", &pair.value)] {
            if t.shape() != reference.shape() || t.dtype() != reference.dtype() {
                return Err(CodecError::ShapeMismatch {
                    index,
                    role,
                    expected: reference.shape().to_vec(),
                    found: t.shape().to_vec(),
                    expected_dtype: reference.dtype(),
                    found_dtype: t.dtype(),
                });
            }
        }
    }

    let per_layer = reference.as_bytes().len();
    let mut data = BytesMut::with_capacity(2 * layers.len() * per_layer);
    for pair in layers {
        data.extend_from_slice(pair.key.as_bytes());
    }
    for pair in layers {
        data.extend_from_slice(pair.value.as_bytes());
    }

    Ok(TensorBlob {
        layout,
        dtype: reference.dtype(),
        shape: [2, layers.len(), a, b, c],
        data: data.freeze(),
    })
}

impl TensorBlob {
    /// Rebuild a blob from its row-major bytes and out-of-band shape.
    pub fn from_bytes(
        data: impl Into<Bytes>,
        layout: KvLayout,
        dtype: DType,
        shape: [usize; 5],
    ) -> Result<Self, CodecError> {
        let data = data.into();
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(CodecError::InvalidTensor(format!(
                "{} bytes for {dtype} blob of shape {shape:?}, expected {expected}",
                data.len()
            )));
        }
        Ok(Self {
            layout,
            dtype,
            shape,
            data,
        })
    }

    /// Row-major bytes. Cheap: shares the underlying buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn layout(&self) -> KvLayout {
        self.layout
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> [usize; 5] {
        self.shape
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Length of the token axis.
    pub fn num_tokens(&self) -> usize {
        self.shape[self.layout.token_axis()]
    }

    /// Sub-blob covering `range` along the token axis.
    pub fn slice_tokens(&self, range: Range<usize>) -> Result<TensorBlob, CodecError> {
        let len = self.num_tokens();
        if range.start > range.end || range.end > len {
            return Err(CodecError::OutOfRange {
                start: range.start,
                end: range.end,
                len,
            });
        }

        Ok(self.take_tokens(range))
    }

    /// Slice along the token axis. `range` must lie within the axis.
    pub(crate) fn take_tokens(&self, range: Range<usize>) -> TensorBlob {
        let len = self.num_tokens();
        let axis = self.layout.token_axis();
        let (outer, inner) = self.strides(axis);
        let mut out = BytesMut::with_capacity(outer * range.len() * inner);
        for o in 0..outer {
            let base = o * len * inner;
            out.extend_from_slice(&self.data[base + range.start * inner..base + range.end * inner]);
        }

        let mut shape = self.shape;
        shape[axis] = range.len();
        TensorBlob {
            layout: self.layout,
            dtype: self.dtype,
            shape,
            data: out.freeze(),
        }
    }

    /// Suffix starting at token `offset`.
    pub fn slice_from(&self, offset: usize) -> Result<TensorBlob, CodecError> {
        self.slice_tokens(offset..self.num_tokens())
    }

    /// Prefix of `len` tokens.
    pub fn truncate_tokens(&self, len: usize) -> Result<TensorBlob, CodecError> {
        self.slice_tokens(0..len)
    }

    /// Consecutive `chunk_size`-token pieces. A trailing partial piece is dropped.
    pub fn split_tokens(&self, chunk_size: usize) -> Result<Vec<TensorBlob>, CodecError> {
        if chunk_size == 0 {
            return Err(CodecError::InvalidTensor("chunk size must be non-zero".into()));
        }
        (0..self.num_tokens() / chunk_size)
            .map(|i| self.slice_tokens(i * chunk_size..(i + 1) * chunk_size))
            .collect()
    }

    /// Join blobs end to end along the token axis.
    ///
    /// Parts must agree in layout, dtype and every non-token axis.
    pub fn concat(parts: &[TensorBlob]) -> Result<TensorBlob, CodecError> {
        let first = parts.first().ok_or(CodecError::Empty)?;
        let axis = first.layout.token_axis();

        for (index, part) in parts.iter().enumerate() {
            let same_axes = (0..5).all(|i| i == axis || part.shape[i] == first.shape[i]);
            if part.layout != first.layout || part.dtype != first.dtype || !same_axes {
                return Err(CodecError::ShapeMismatch {
                    index,
                    role: "chunk",
                    expected: first.shape.to_vec(),
                    found: part.shape.to_vec(),
                    expected_dtype: first.dtype,
                    found_dtype: part.dtype,
                });
            }
        }

        let total: usize = parts.iter().map(|p| p.num_tokens()).sum();
        let (outer, inner) = first.strides(axis);
        let mut out = BytesMut::with_capacity(outer * total * inner);
        for o in 0..outer {
            for part in parts {
                let run = part.num_tokens() * inner;
                out.extend_from_slice(&part.data[o * run..(o + 1) * run]);
            }
        }

        let mut shape = first.shape;
        shape[axis] = total;
        Ok(TensorBlob {
            layout: first.layout,
            dtype: first.dtype,
            shape,
            data: out.freeze(),
        })
    }

    /// Element count before `axis` and byte width of one step along it.
    fn strides(&self, axis: usize) -> (usize, usize) {
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product::<usize>() * self.dtype.size();
        (outer, inner)
    }
}

/// Model-side metadata needed to interpret a blob's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobShape {
    pub layout: KvLayout,
    pub dtype: DType,
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_size: usize,
}

impl BlobShape {
    /// Packed blob shape for `num_tokens` tokens.
    pub fn shape_for(&self, num_tokens: usize) -> [usize; 5] {
        let [a, b, c] = self.layout.layer_shape(num_tokens, self.num_heads, self.head_size);
        [2, self.num_layers, a, b, c]
    }

    /// Serialized size of a blob holding `num_tokens` tokens.
    pub fn bytes_for(&self, num_tokens: usize) -> usize {
        self.shape_for(num_tokens).iter().product::<usize>() * self.dtype.size()
    }

    /// Decode a blob of `num_tokens` tokens.
    pub fn decode(&self, data: impl Into<Bytes>, num_tokens: usize) -> Result<TensorBlob, CodecError> {
        TensorBlob::from_bytes(data, self.layout, self.dtype, self.shape_for(num_tokens))
    }
}
