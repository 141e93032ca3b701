use std::fmt;

use serde_json::Value;

use crate::error::FormatError;

/// Semantic role of one declared array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisTag {
    T,
    C,
    Z,
    Y,
    X,
}

impl AxisTag {
    /// Parse a single axis name (`t`, `c`, `z`, `y` or `x`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "t" => Some(AxisTag::T),
            "c" => Some(AxisTag::C),
            "z" => Some(AxisTag::Z),
            "y" => Some(AxisTag::Y),
            "x" => Some(AxisTag::X),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AxisTag::T => "t",
            AxisTag::C => "c",
            AxisTag::Z => "z",
            AxisTag::Y => "y",
            AxisTag::X => "x",
        }
    }
}

impl fmt::Display for AxisTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical spatial roles, fastest-varying first.
pub const SPATIAL_TAGS: [AxisTag; 3] = [AxisTag::X, AxisTag::Y, AxisTag::Z];

/// Ordered axis declaration of an OME-Zarr image.
///
/// Axes are declared slowest-to-fastest (`t, c, z, y, x`), while spatial
/// positions in this crate are written fastest-first (`x, y, z`). Two index
/// spaces follow from that:
///
/// - [`role_index`](Self::role_index): position of a role in the *reversed*
///   declaration (x is 0 for any `...yx` image).
/// - [`declared_index`](Self::declared_index): position in the declaration
///   itself, which is how `.zarray` shapes, chunk keys and per-axis
///   coordinate transformations are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisDescriptor {
    tags: Vec<AxisTag>,
    units: Vec<Option<String>>,
}

impl AxisDescriptor {
    /// Build a descriptor from axis names.
    ///
    /// Fails on an unknown or duplicated tag, or on a count outside `[2, 5]`.
    pub fn decode<T: AsRef<str>>(names: &[T]) -> Result<Self, FormatError> {
        let units = vec![None; names.len()];
        Self::decode_with_units(names, units)
    }

    fn decode_with_units<T: AsRef<str>>(
        names: &[T],
        units: Vec<Option<String>>,
    ) -> Result<Self, FormatError> {
        if !(2..=5).contains(&names.len()) {
            return Err(FormatError::InvalidAxes(format!(
                "expected 2 to 5 axes, found {}",
                names.len()
            )));
        }

        let mut tags = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let tag = AxisTag::from_name(name)
                .ok_or_else(|| FormatError::InvalidAxes(format!("unknown axis '{}'", name)))?;
            if tags.contains(&tag) {
                return Err(FormatError::InvalidAxes(format!("duplicate axis '{}'", name)));
            }
            tags.push(tag);
        }

        Ok(Self { tags, units })
    }

    /// Parse the `axes` entry of a multiscale.
    ///
    /// Accepts both the plain list of names (`["t", "c", "z", "y", "x"]`) and
    /// the list of axis objects (`{"name": "x", "type": "space", "unit": ...}`).
    pub fn from_json(value: &Value) -> Result<Self, FormatError> {
        let entries = value
            .as_array()
            .ok_or_else(|| FormatError::InvalidAxes(format!("expected a list, found {}", value)))?;

        let mut names = Vec::with_capacity(entries.len());
        let mut units = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Value::String(name) => {
                    names.push(name.as_str());
                    units.push(None);
                }
                Value::Object(axis) => {
                    let name = axis.get("name").and_then(Value::as_str).ok_or_else(|| {
                        FormatError::InvalidAxes(format!("axis without a name: {}", entry))
                    })?;
                    names.push(name);
                    units.push(axis.get("unit").and_then(Value::as_str).map(str::to_string));
                }
                other => {
                    return Err(FormatError::InvalidAxes(format!("unexpected axis {}", other)));
                }
            }
        }

        Self::decode_with_units(&names, units)
    }

    /// The five-dimensional default used by containers that predate the
    /// `axes` attribute.
    pub fn tczyx() -> Self {
        Self {
            tags: vec![AxisTag::T, AxisTag::C, AxisTag::Z, AxisTag::Y, AxisTag::X],
            units: vec![None; 5],
        }
    }

    /// Axis names in declared order.
    pub fn encode(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn tags(&self) -> &[AxisTag] {
        &self.tags
    }

    pub fn num_dimensions(&self) -> usize {
        self.tags.len()
    }

    /// Index of `tag` in the reversed (fastest-first) axis order.
    pub fn role_index(&self, tag: AxisTag) -> Option<usize> {
        self.tags.iter().rev().position(|&t| t == tag)
    }

    /// Index of `tag` in the declared (slowest-first) axis order.
    pub fn declared_index(&self, tag: AxisTag) -> Option<usize> {
        self.tags.iter().position(|&t| t == tag)
    }

    pub fn has_z_axis(&self) -> bool {
        self.role_index(AxisTag::Z).is_some()
    }

    pub fn has_channels(&self) -> bool {
        self.role_index(AxisTag::C).is_some()
    }

    pub fn has_timepoints(&self) -> bool {
        self.role_index(AxisTag::T).is_some()
    }

    /// True for images with only `y` and `x` axes.
    pub fn is_planar(&self) -> bool {
        !self.has_z_axis() && !self.has_channels() && !self.has_timepoints()
    }

    /// Unit declared for `tag`, if any.
    pub fn unit(&self, tag: AxisTag) -> Option<&str> {
        self.declared_index(tag)
            .and_then(|i| self.units.get(i))
            .and_then(|u| u.as_deref())
    }

    /// Full grid position, in declared order, for a spatial grid position
    /// (`x, y, z`) plus channel and timepoint coordinates.
    ///
    /// Spatial coordinates missing from `spatial` count as 0; roles the
    /// image does not declare take no slot.
    pub fn grid_position_for(&self, spatial: &[u64], channel: u64, timepoint: u64) -> Vec<u64> {
        let mut position = vec![0; self.tags.len()];

        for (i, &tag) in SPATIAL_TAGS.iter().enumerate() {
            if let Some(d) = self.declared_index(tag) {
                position[d] = spatial.get(i).copied().unwrap_or(0);
            }
        }
        if let Some(d) = self.declared_index(AxisTag::C) {
            position[d] = channel;
        }
        if let Some(d) = self.declared_index(AxisTag::T) {
            position[d] = timepoint;
        }

        position
    }

    /// Pick the `x, y, z` entries out of a declared-order vector, using
    /// `default` for absent roles.
    pub fn spatial_values<T: Copy>(&self, declared: &[T], default: T) -> [T; 3] {
        SPATIAL_TAGS.map(|tag| {
            self.declared_index(tag)
                .and_then(|d| declared.get(d).copied())
                .unwrap_or(default)
        })
    }
}

impl fmt::Display for AxisDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for tag in &self.tags {
            write!(f, "{}", tag)?;
        }
        Ok(())
    }
}
