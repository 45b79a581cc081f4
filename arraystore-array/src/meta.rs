//! `.zarray` / `.zgroup` documents.

use serde::{Deserialize, Serialize};

use crate::{
    dtype::{ElementType, Scalar},
    error::{ArrayError, ArrayResult},
};

pub const ARRAY_KEY: &str = ".zarray";
pub const GROUP_KEY: &str = ".zgroup";
pub const ZARR_FORMAT: u8 = 2;

/// Deserializing restores the fill value's variant from `dtype`, since JSON numbers do not say
/// whether `0` is signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ArrayDocument")]
pub struct ArrayMetadata {
    pub zarr_format: u8,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: ElementType,
    pub fill_value: Option<Scalar>,
    pub order: String,
    pub compressor: Option<serde_json::Value>,
    pub filters: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct ArrayDocument {
    zarr_format: u8,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    dtype: ElementType,
    fill_value: Option<Scalar>,
    order: String,
    compressor: Option<serde_json::Value>,
    filters: Option<Vec<serde_json::Value>>,
}

impl TryFrom<ArrayDocument> for ArrayMetadata {
    type Error = ArrayError;

    fn try_from(doc: ArrayDocument) -> ArrayResult<Self> {
        let fill_value = doc.fill_value.map(|v| doc.dtype.coerce(v)).transpose()?;
        Ok(Self {
            zarr_format: doc.zarr_format,
            shape: doc.shape,
            chunks: doc.chunks,
            dtype: doc.dtype,
            fill_value,
            order: doc.order,
            compressor: doc.compressor,
            filters: doc.filters,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub zarr_format: u8,
}

impl Default for GroupMetadata {
    fn default() -> Self {
        Self {
            zarr_format: ZARR_FORMAT,
        }
    }
}

impl ArrayMetadata {
    pub fn new(
        path: &str,
        shape: Vec<u64>,
        chunks: Vec<u64>,
        dtype: ElementType,
        fill_value: Option<Scalar>,
    ) -> ArrayResult<Self> {
        let fill_value = fill_value.map(|v| dtype.coerce(v)).transpose()?;
        let meta = Self {
            zarr_format: ZARR_FORMAT,
            shape,
            chunks,
            dtype,
            fill_value,
            order: "C".to_string(),
            compressor: None,
            filters: None,
        };
        meta.validate(path)?;
        Ok(meta)
    }

    pub fn from_json(path: &str, raw: &[u8]) -> ArrayResult<Self> {
        let meta: ArrayMetadata = serde_json::from_slice(raw)
            .map_err(|e| ArrayError::invalid_metadata(path, e.to_string()))?;
        meta.validate(path)?;
        Ok(meta)
    }

    pub fn to_json(&self, path: &str) -> ArrayResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ArrayError::invalid_metadata(path, e.to_string()))
    }

    /// Only uncompressed C-order zarr v2 arrays are supported.
    pub fn validate(&self, path: &str) -> ArrayResult<()> {
        if self.zarr_format != ZARR_FORMAT {
            return Err(ArrayError::invalid_metadata(
                path,
                format!("unsupported zarr_format {}", self.zarr_format),
            ));
        }
        if self.order != "C" {
            return Err(ArrayError::invalid_metadata(path, "only C order is supported"));
        }
        if self.compressor.as_ref().is_some_and(|c| !c.is_null()) {
            return Err(ArrayError::invalid_metadata(path, "compressed chunks are not supported"));
        }
        if self.filters.as_ref().is_some_and(|f| !f.is_empty()) {
            return Err(ArrayError::invalid_metadata(path, "filters are not supported"));
        }
        if self.shape.len() != self.chunks.len() {
            return Err(ArrayError::invalid_metadata(
                path,
                format!(
                    "shape has {} dimensions but chunks has {}",
                    self.shape.len(),
                    self.chunks.len()
                ),
            ));
        }
        if self.chunks.iter().any(|&c| c == 0) {
            return Err(ArrayError::invalid_metadata(path, "chunk sizes must be positive"));
        }
        Ok(())
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn fill(&self) -> Scalar {
        self.fill_value.unwrap_or_else(|| self.dtype.default_fill())
    }

    /// Number of elements in one chunk, edge chunks included.
    pub fn chunk_len(&self) -> usize {
        self.chunks.iter().product::<u64>() as usize
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_len() * self.dtype.item_size()
    }

    /// Number of chunks along each dimension for `shape`.
    pub fn grid_for(&self, shape: &[u64]) -> Vec<u64> {
        shape
            .iter()
            .zip(&self.chunks)
            .map(|(&len, &chunk)| len.div_ceil(chunk))
            .collect()
    }

    /// Chunk index of `point` and its C-order offset inside that chunk.
    pub fn locate(&self, point: &[u64]) -> (Vec<u64>, usize) {
        let mut offset = 0usize;
        let chunk_index = point
            .iter()
            .zip(&self.chunks)
            .map(|(&p, &c)| {
                offset = offset * c as usize + (p % c) as usize;
                p / c
            })
            .collect();
        (chunk_index, offset)
    }

    /// A buffer holding one chunk of fill values.
    pub fn fill_chunk(&self) -> ArrayResult<Vec<u8>> {
        let mut one = Vec::with_capacity(self.dtype.item_size());
        self.dtype.encode(self.fill(), &mut one)?;
        Ok(one.repeat(self.chunk_len()))
    }
}

/// Object name of a chunk: dot-joined indices, `"0"` for zero-dimensional arrays.
pub fn chunk_key(index: &[u64]) -> String {
    if index.is_empty() {
        return "0".to_string();
    }
    index
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

pub fn parse_chunk_key(key: &str, ndim: usize) -> Option<Vec<u64>> {
    if ndim == 0 {
        return (key == "0").then(Vec::new);
    }
    let index = key
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    (index.len() == ndim).then_some(index)
}
