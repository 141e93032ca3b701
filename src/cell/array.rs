use ndarray::{ArrayD, IxDyn};
use num_traits::{ToPrimitive, Zero};

use crate::error::IoError;
use crate::ome::{AxisDescriptor, AxisTag, SPATIAL_TAGS};
use crate::zarr::{ByteOrder, DatasetAttributes, ElementKind};

// =============================================================================
// Element decoding
// =============================================================================

/// A numeric type that can be read from stored chunk bytes.
trait Element: Copy + Zero + ToPrimitive {
    const SIZE: usize;

    /// Read one element from exactly `SIZE` bytes.
    fn read(bytes: &[u8], order: ByteOrder) -> Self;
}

macro_rules! impl_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn read(bytes: &[u8], order: ByteOrder) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    match order {
                        ByteOrder::Little => <$t>::from_le_bytes(buf),
                        ByteOrder::Big => <$t>::from_be_bytes(buf),
                    }
                }
            }
        )*
    };
}

impl_element!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Decoded cell values, one variant per supported element kind.
///
/// Arrays are indexed `[z, y, x]` (or `[y, x]` for planar images), so the
/// last index varies fastest.
#[derive(Debug, Clone, PartialEq)]
pub enum CellData {
    Int8(ArrayD<i8>),
    UInt8(ArrayD<u8>),
    Int16(ArrayD<i16>),
    UInt16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    UInt32(ArrayD<u32>),
    Int64(ArrayD<i64>),
    UInt64(ArrayD<u64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

macro_rules! with_array {
    ($data:expr, $array:ident => $body:expr) => {
        match $data {
            CellData::Int8($array) => $body,
            CellData::UInt8($array) => $body,
            CellData::Int16($array) => $body,
            CellData::UInt16($array) => $body,
            CellData::Int32($array) => $body,
            CellData::UInt32($array) => $body,
            CellData::Int64($array) => $body,
            CellData::UInt64($array) => $body,
            CellData::Float32($array) => $body,
            CellData::Float64($array) => $body,
        }
    };
}

macro_rules! per_kind {
    ($kind:expr, $t:ident => $body:expr) => {
        match $kind {
            ElementKind::Int8 => { type $t = i8; CellData::Int8($body) }
            ElementKind::UInt8 => { type $t = u8; CellData::UInt8($body) }
            ElementKind::Int16 => { type $t = i16; CellData::Int16($body) }
            ElementKind::UInt16 => { type $t = u16; CellData::UInt16($body) }
            ElementKind::Int32 => { type $t = i32; CellData::Int32($body) }
            ElementKind::UInt32 => { type $t = u32; CellData::UInt32($body) }
            ElementKind::Int64 => { type $t = i64; CellData::Int64($body) }
            ElementKind::UInt64 => { type $t = u64; CellData::UInt64($body) }
            ElementKind::Float32 => { type $t = f32; CellData::Float32($body) }
            ElementKind::Float64 => { type $t = f64; CellData::Float64($body) }
        }
    };
}

impl CellData {
    pub fn kind(&self) -> ElementKind {
        match self {
            CellData::Int8(_) => ElementKind::Int8,
            CellData::UInt8(_) => ElementKind::UInt8,
            CellData::Int16(_) => ElementKind::Int16,
            CellData::UInt16(_) => ElementKind::UInt16,
            CellData::Int32(_) => ElementKind::Int32,
            CellData::UInt32(_) => ElementKind::UInt32,
            CellData::Int64(_) => ElementKind::Int64,
            CellData::UInt64(_) => ElementKind::UInt64,
            CellData::Float32(_) => ElementKind::Float32,
            CellData::Float64(_) => ElementKind::Float64,
        }
    }

    /// Array shape, slowest axis first.
    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn len(&self) -> usize {
        with_array!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at an array index (slowest axis first), widened to `f64`.
    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        with_array!(self, a => a.get(IxDyn(index)).and_then(|v| v.to_f64()))
    }

    /// Smallest and largest value, widened to `f64`.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        with_array!(self, a => a.iter().filter_map(|v| v.to_f64()).fold(None, |acc, v| {
            match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
            }
        }))
    }

    fn zeros(kind: ElementKind, shape: &[usize]) -> Self {
        per_kind!(kind, T => ArrayD::<T>::zeros(IxDyn(shape)))
    }
}

// =============================================================================
// Cell geometry
// =============================================================================

/// Where one cell lies inside its stored chunk.
///
/// A stored chunk always has the nominal chunk shape; the cell is the
/// spatial block at the chunk origin, clipped at the array boundary, at a
/// fixed channel and timepoint offset within the chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellGeometry {
    chunk_shape: Vec<usize>,
    offsets: Vec<usize>,
    spatial_axes: [Option<usize>; 3],
    dims: Vec<usize>,
}

impl CellGeometry {
    /// Geometry of the cell at `grid_position` (declared order) for a
    /// channel and timepoint.
    ///
    /// Returns `None` if the position is outside the chunk grid, or if its
    /// channel or time coordinate does not hold `channel` / `timepoint`.
    pub fn for_chunk(
        axes: &AxisDescriptor,
        attrs: &DatasetAttributes,
        grid_position: &[u64],
        channel: u64,
        timepoint: u64,
    ) -> Option<Self> {
        if axes.num_dimensions() != attrs.num_dimensions() {
            return None;
        }
        let clipped = attrs.clipped_chunk_shape(grid_position)?;
        let chunks = attrs.chunks();

        let mut offsets = vec![0usize; chunks.len()];
        for (tag, index) in [(AxisTag::C, channel), (AxisTag::T, timepoint)] {
            if let Some(d) = axes.declared_index(tag) {
                let extent = chunks[d];
                if grid_position[d] != index / extent || index % extent >= clipped[d] {
                    return None;
                }
                offsets[d] = (index % extent) as usize;
            }
        }

        let spatial_axes = SPATIAL_TAGS.map(|tag| axes.declared_index(tag));
        let mut dims: Vec<usize> = spatial_axes
            .iter()
            .map(|d| d.map(|d| clipped[d] as usize).unwrap_or(1))
            .collect();
        if axes.is_planar() {
            dims.truncate(2);
        }

        Some(Self {
            chunk_shape: chunks.iter().map(|&c| c as usize).collect(),
            offsets,
            spatial_axes,
            dims,
        })
    }

    /// Cell extent, `x` first.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    fn chunk_len(&self) -> usize {
        self.chunk_shape.iter().product()
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.chunk_shape.len()];
        for i in (0..self.chunk_shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.chunk_shape[i + 1];
        }
        strides
    }
}

/// Array shape for cell dims (`x` first): the reverse.
fn array_shape(dims: &[usize]) -> Vec<usize> {
    dims.iter().rev().copied().collect()
}

fn decode_typed<T: Element>(
    raw: &[u8],
    order: ByteOrder,
    geometry: &CellGeometry,
) -> Result<ArrayD<T>, IoError> {
    let needed = geometry.chunk_len() * T::SIZE;
    if raw.len() < needed {
        return Err(IoError::Decode(format!(
            "chunk holds {} bytes, expected {}",
            raw.len(),
            needed
        )));
    }

    let strides = geometry.strides();
    let base: usize = geometry
        .offsets
        .iter()
        .zip(&strides)
        .map(|(o, s)| o * s)
        .sum();
    let stride_of = |axis: Option<usize>| axis.map(|d| strides[d]).unwrap_or(0);
    let [sx, sy, sz] = geometry.spatial_axes.map(stride_of);

    let dx = geometry.dims.first().copied().unwrap_or(1);
    let dy = geometry.dims.get(1).copied().unwrap_or(1);
    let dz = geometry.dims.get(2).copied().unwrap_or(1);

    let mut values = Vec::with_capacity(dx * dy * dz);
    for z in 0..dz {
        for y in 0..dy {
            let row = base + z * sz + y * sy;
            for x in 0..dx {
                let offset = (row + x * sx) * T::SIZE;
                values.push(T::read(&raw[offset..offset + T::SIZE], order));
            }
        }
    }

    ArrayD::from_shape_vec(IxDyn(&array_shape(&geometry.dims)), values)
        .map_err(|e| IoError::Decode(e.to_string()))
}

// =============================================================================
// Typed cells
// =============================================================================

/// Immutable decoded content of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedCell {
    dims: Vec<usize>,
    data: CellData,
    valid: bool,
}

impl TypedCell {
    /// Decode a stored chunk into the cell described by `geometry`.
    pub fn decode(
        kind: ElementKind,
        order: ByteOrder,
        raw: &[u8],
        geometry: &CellGeometry,
    ) -> Result<Self, IoError> {
        let data = match kind {
            ElementKind::Int8 => CellData::Int8(decode_typed(raw, order, geometry)?),
            ElementKind::UInt8 => CellData::UInt8(decode_typed(raw, order, geometry)?),
            ElementKind::Int16 => CellData::Int16(decode_typed(raw, order, geometry)?),
            ElementKind::UInt16 => CellData::UInt16(decode_typed(raw, order, geometry)?),
            ElementKind::Int32 => CellData::Int32(decode_typed(raw, order, geometry)?),
            ElementKind::UInt32 => CellData::UInt32(decode_typed(raw, order, geometry)?),
            ElementKind::Int64 => CellData::Int64(decode_typed(raw, order, geometry)?),
            ElementKind::UInt64 => CellData::UInt64(decode_typed(raw, order, geometry)?),
            ElementKind::Float32 => CellData::Float32(decode_typed(raw, order, geometry)?),
            ElementKind::Float64 => CellData::Float64(decode_typed(raw, order, geometry)?),
        };

        Ok(Self {
            dims: geometry.dims.clone(),
            data,
            valid: true,
        })
    }

    /// A cell of the given dims (`x` first) filled with zeros.
    pub fn zero_filled(kind: ElementKind, dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            data: CellData::zeros(kind, &array_shape(dims)),
            valid: true,
        }
    }

    /// A zero-filled stand-in for a cell that is still loading.
    pub fn placeholder(kind: ElementKind, dims: &[usize]) -> Self {
        Self {
            valid: false,
            ..Self::zero_filled(kind, dims)
        }
    }

    /// Cell extent, `x` first.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &CellData {
        &self.data
    }

    pub fn kind(&self) -> ElementKind {
        self.data.kind()
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// False for placeholders handed out while the real cell loads.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Value at a position given `x` first.
    pub fn value_at(&self, position: &[usize]) -> Option<f64> {
        if position.len() != self.dims.len() {
            return None;
        }
        self.data.get_f64(&array_shape(position))
    }
}
