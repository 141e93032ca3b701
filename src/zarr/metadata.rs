use serde::Deserialize;
use serde_json::Value;

use crate::error::FormatError;

use super::compression::Compressor;

/// Numeric element kinds a pyramid level may store.
///
/// The set is closed: every dtype outside it is rejected when the level is
/// opened, so decoding never has to re-dispatch on the element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl ElementKind {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            ElementKind::Int8 | ElementKind::UInt8 => 1,
            ElementKind::Int16 | ElementKind::UInt16 => 2,
            ElementKind::Int32 | ElementKind::UInt32 | ElementKind::Float32 => 4,
            ElementKind::Int64 | ElementKind::UInt64 | ElementKind::Float64 => 8,
        }
    }

    /// Lower-case type name, e.g. `uint16`.
    pub fn name(&self) -> &'static str {
        match self {
            ElementKind::Int8 => "int8",
            ElementKind::UInt8 => "uint8",
            ElementKind::Int16 => "int16",
            ElementKind::UInt16 => "uint16",
            ElementKind::Int32 => "int32",
            ElementKind::UInt32 => "uint32",
            ElementKind::Int64 => "int64",
            ElementKind::UInt64 => "uint64",
            ElementKind::Float32 => "float32",
            ElementKind::Float64 => "float64",
        }
    }
}

/// Byte order of multi-byte elements in a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Parse a Zarr v2 `dtype` string such as `<u2`, `|u1` or `>f4`.
pub fn parse_dtype(dtype: &str) -> Result<(ElementKind, ByteOrder), FormatError> {
    let unsupported = || FormatError::UnsupportedDataType(dtype.to_string());

    let mut chars = dtype.chars();
    let byte_order = match chars.next() {
        Some('<') | Some('|') => ByteOrder::Little,
        Some('>') => ByteOrder::Big,
        Some('=') if cfg!(target_endian = "big") => ByteOrder::Big,
        Some('=') => ByteOrder::Little,
        _ => return Err(unsupported()),
    };
    let kind_char = chars.next().ok_or_else(unsupported)?;
    let size: usize = chars.as_str().parse().map_err(|_| unsupported())?;

    let kind = match (kind_char, size) {
        ('i', 1) => ElementKind::Int8,
        ('u', 1) => ElementKind::UInt8,
        ('i', 2) => ElementKind::Int16,
        ('u', 2) => ElementKind::UInt16,
        ('i', 4) => ElementKind::Int32,
        ('u', 4) => ElementKind::UInt32,
        ('i', 8) => ElementKind::Int64,
        ('u', 8) => ElementKind::UInt64,
        ('f', 4) => ElementKind::Float32,
        ('f', 8) => ElementKind::Float64,
        _ => return Err(unsupported()),
    };

    Ok((kind, byte_order))
}

/// Raw `.zarray` document.
#[derive(Debug, Deserialize)]
struct ZarrayMetadata {
    #[serde(default)]
    zarr_format: Option<u32>,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    dtype: Value,
    #[serde(default)]
    compressor: Option<CompressorMetadata>,
    #[serde(default)]
    fill_value: Value,
    #[serde(default)]
    order: Option<String>,
    #[serde(default)]
    filters: Option<Vec<Value>>,
    #[serde(default)]
    dimension_separator: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompressorMetadata {
    id: String,
}

/// Parsed attributes of one Zarr array (one pyramid level).
///
/// Vectors are in declared (storage) order, slowest-varying axis first.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetAttributes {
    dimensions: Vec<u64>,
    chunks: Vec<u64>,
    kind: ElementKind,
    byte_order: ByteOrder,
    compressor: Compressor,
    separator: String,
    fill_value: Option<f64>,
}

impl DatasetAttributes {
    /// Create attributes directly, with no compression and `.` separator.
    pub fn new(dimensions: Vec<u64>, chunks: Vec<u64>, kind: ElementKind) -> Self {
        Self {
            dimensions,
            chunks,
            kind,
            byte_order: ByteOrder::Little,
            compressor: Compressor::None,
            separator: ".".to_string(),
            fill_value: None,
        }
    }

    /// Parse a `.zarray` document.
    ///
    /// `path` is only used for error messages.
    pub fn from_json(path: &str, data: &[u8]) -> Result<Self, FormatError> {
        let invalid = |reason: String| FormatError::InvalidDatasetAttributes {
            path: path.to_string(),
            reason,
        };

        let meta: ZarrayMetadata =
            serde_json::from_slice(data).map_err(|e| invalid(e.to_string()))?;

        if let Some(version) = meta.zarr_format {
            if version != 2 {
                return Err(invalid(format!("unsupported zarr_format {}", version)));
            }
        }

        if meta.shape.len() != meta.chunks.len() {
            return Err(invalid(format!(
                "shape has {} dimensions but chunks has {}",
                meta.shape.len(),
                meta.chunks.len()
            )));
        }

        if meta.chunks.iter().any(|&c| c == 0) {
            return Err(invalid("chunk extents must be positive".to_string()));
        }

        match meta.order.as_deref() {
            None | Some("C") => {}
            Some(other) => {
                return Err(invalid(format!("unsupported memory order '{}'", other)));
            }
        }

        if meta.filters.as_ref().is_some_and(|f| !f.is_empty()) {
            return Err(FormatError::UnsupportedCompressor(format!(
                "{}: filters are not supported",
                path
            )));
        }

        let dtype = meta
            .dtype
            .as_str()
            .ok_or_else(|| FormatError::UnsupportedDataType(meta.dtype.to_string()))?;
        let (kind, byte_order) = parse_dtype(dtype)?;

        let compressor = Compressor::from_id(meta.compressor.as_ref().map(|c| c.id.as_str()))?;

        let fill_value = match &meta.fill_value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if s == "NaN" => Some(f64::NAN),
            Value::String(s) if s == "Infinity" => Some(f64::INFINITY),
            Value::String(s) if s == "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        };

        Ok(Self {
            dimensions: meta.shape,
            chunks: meta.chunks,
            kind,
            byte_order,
            compressor,
            separator: meta.dimension_separator.unwrap_or_else(|| ".".to_string()),
            fill_value,
        })
    }

    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Array extent per declared axis.
    pub fn dimensions(&self) -> &[u64] {
        &self.dimensions
    }

    /// Nominal chunk extent per declared axis.
    pub fn chunks(&self) -> &[u64] {
        &self.chunks
    }

    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    /// Separator between grid coordinates in chunk keys.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Declared fill value, if numeric.
    ///
    /// Informational only: the cell cache zero-fills missing chunks
    /// whatever this says.
    pub fn fill_value(&self) -> Option<f64> {
        self.fill_value
    }

    /// Number of chunks along each declared axis.
    pub fn grid_dimensions(&self) -> Vec<u64> {
        self.dimensions
            .iter()
            .zip(&self.chunks)
            .map(|(&dim, &chunk)| dim.div_ceil(chunk))
            .collect()
    }

    /// Extent of the chunk at `grid_position`, clipped at the array boundary.
    ///
    /// Returns `None` if the position lies outside the chunk grid.
    pub fn clipped_chunk_shape(&self, grid_position: &[u64]) -> Option<Vec<u64>> {
        if grid_position.len() != self.dimensions.len() {
            return None;
        }

        let mut shape = Vec::with_capacity(grid_position.len());
        for ((&g, &dim), &chunk) in grid_position.iter().zip(&self.dimensions).zip(&self.chunks) {
            let start = g.checked_mul(chunk)?;
            if start >= dim {
                return None;
            }
            shape.push(chunk.min(dim - start));
        }
        Some(shape)
    }
}
