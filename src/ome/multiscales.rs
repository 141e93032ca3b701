use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::axes::AxisDescriptor;
use crate::error::FormatError;
use crate::io::{join_key, ObjectStore};
use crate::zarr::{DatasetAttributes, ZarrReader};

/// Group attribute holding the pyramid descriptors.
pub const MULTISCALES_KEY: &str = "multiscales";

// =============================================================================
// Descriptor model
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct Multiscale {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    axes: Option<Value>,
    datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, Deserialize)]
struct Dataset {
    path: String,
    #[serde(default, rename = "coordinateTransformations")]
    coordinate_transformations: Vec<CoordinateTransformation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum CoordinateTransformation {
    Scale {
        #[serde(default)]
        scale: Vec<f64>,
    },
    Translation {
        #[serde(default)]
        translation: Vec<f64>,
    },
    #[serde(other)]
    Other,
}

// =============================================================================
// Pyramid levels
// =============================================================================

/// One resolution level of a multiscale image.
///
/// `scale`, `translation` and `resolution` are spatial (`x, y, z`) and
/// default to 1, 0 and 1 for roles the image does not declare.
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    index: usize,
    path: String,
    attributes: DatasetAttributes,
    scale: [f64; 3],
    translation: [f64; 3],
    resolution: [f64; 3],
}

impl PyramidLevel {
    /// Level index, 0 being the full resolution.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Array path from the container root.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn attributes(&self) -> &DatasetAttributes {
        &self.attributes
    }

    /// Array extent in declared order.
    pub fn dimensions(&self) -> &[u64] {
        self.attributes.dimensions()
    }

    /// Chunk shape in declared order.
    pub fn chunk_shape(&self) -> &[u64] {
        self.attributes.chunks()
    }

    /// Declared physical voxel size.
    pub fn scale(&self) -> [f64; 3] {
        self.scale
    }

    /// Declared physical offset.
    pub fn translation(&self) -> [f64; 3] {
        self.translation
    }

    /// Downsampling factor relative to level 0.
    pub fn resolution(&self) -> [f64; 3] {
        self.resolution
    }
}

/// Per-axis downsampling factors between level 0 and another level.
///
/// Each factor is `round(level0 / level)`; axes are independent so
/// anisotropic and non-power-of-two pyramids are handled.
pub fn resolution_factors(level0: &[u64], level: &[u64]) -> Vec<f64> {
    level0
        .iter()
        .zip(level)
        .map(|(&d0, &dl)| (d0 as f64 / dl.max(1) as f64).round())
        .collect()
}

/// Result of resolving the multiscale descriptor of a group.
#[derive(Debug, Clone)]
pub struct MultiscaleMetadata {
    pub name: Option<String>,
    pub axes: AxisDescriptor,
    pub levels: Vec<PyramidLevel>,
}

// =============================================================================
// Resolver
// =============================================================================

/// Parses the `multiscales` attribute of a group and the `.zarray` of each
/// of its levels.
#[derive(Debug, Clone, Default)]
pub struct MultiscaleMetadataResolver {
    preferred: Option<String>,
}

impl MultiscaleMetadataResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the multiscale entry with this name when a group declares
    /// several.
    pub fn with_preferred(mut self, name: Option<String>) -> Self {
        self.preferred = name;
        self
    }

    /// Resolve the pyramid rooted at `group`.
    pub async fn parse<S: ObjectStore>(
        &self,
        reader: &ZarrReader<S>,
        group: &str,
    ) -> Result<MultiscaleMetadata, FormatError> {
        let missing = || FormatError::MissingMultiscales {
            location: format!(
                "{}; path: {}; attribute: {}",
                reader.location(),
                if group.is_empty() { "/" } else { group },
                MULTISCALES_KEY
            ),
        };

        let value = reader
            .attribute(group, MULTISCALES_KEY)
            .await?
            .ok_or_else(missing)?;

        let multiscales: Vec<Multiscale> =
            serde_json::from_value(value).map_err(|e| FormatError::InvalidDatasetAttributes {
                path: join_key(group, MULTISCALES_KEY),
                reason: e.to_string(),
            })?;

        let multiscale = self.select(group, multiscales).ok_or_else(missing)?;

        let axes = match &multiscale.axes {
            Some(value) => AxisDescriptor::from_json(value)?,
            None => AxisDescriptor::tczyx(),
        };

        if multiscale.datasets.is_empty() {
            return Err(FormatError::InvalidDatasetAttributes {
                path: join_key(group, MULTISCALES_KEY),
                reason: "multiscale declares no datasets".to_string(),
            });
        }

        let mut levels: Vec<PyramidLevel> = Vec::with_capacity(multiscale.datasets.len());
        for (index, dataset) in multiscale.datasets.iter().enumerate() {
            let path = join_key(group, &dataset.path);
            let attributes = reader.dataset_attributes(&path).await?;

            if attributes.num_dimensions() != axes.num_dimensions() {
                return Err(FormatError::InvalidAxes(format!(
                    "{} has {} dimensions but axes are '{}'",
                    path,
                    attributes.num_dimensions(),
                    axes
                )));
            }

            if let Some(level0) = levels.first() {
                if attributes.kind() != level0.attributes.kind() {
                    return Err(FormatError::InvalidDatasetAttributes {
                        path,
                        reason: format!(
                            "element type {} differs from level 0 ({})",
                            attributes.kind().name(),
                            level0.attributes.kind().name()
                        ),
                    });
                }
            }

            let (scale, translation) = spatial_transform(&axes, &path, dataset)?;

            let resolution = match levels.first() {
                None => [1.0; 3],
                Some(level0) => {
                    let factors = resolution_factors(level0.dimensions(), attributes.dimensions());
                    axes.spatial_values(&factors, 1.0)
                }
            };

            levels.push(PyramidLevel {
                index,
                path,
                attributes,
                scale,
                translation,
                resolution,
            });
        }

        Ok(MultiscaleMetadata {
            name: multiscale.name,
            axes,
            levels,
        })
    }

    fn select(&self, group: &str, mut multiscales: Vec<Multiscale>) -> Option<Multiscale> {
        if multiscales.len() > 1 {
            let names: Vec<&str> = multiscales
                .iter()
                .map(|m| m.name.as_deref().unwrap_or("<unnamed>"))
                .collect();
            warn!(
                group = group,
                count = multiscales.len(),
                "Group declares several multiscales ({}); only one is used",
                names.join(", ")
            );
        }

        let index = self
            .preferred
            .as_deref()
            .and_then(|wanted| {
                multiscales
                    .iter()
                    .position(|m| m.name.as_deref() == Some(wanted))
            })
            .unwrap_or(0);

        if index < multiscales.len() {
            Some(multiscales.swap_remove(index))
        } else {
            None
        }
    }
}

/// Extract the spatial scale and translation of one dataset.
fn spatial_transform(
    axes: &AxisDescriptor,
    path: &str,
    dataset: &Dataset,
) -> Result<([f64; 3], [f64; 3]), FormatError> {
    let mut scale = [1.0; 3];
    let mut translation = [0.0; 3];

    for transformation in &dataset.coordinate_transformations {
        let (values, target, default) = match transformation {
            CoordinateTransformation::Scale { scale: values } => (values, &mut scale, 1.0),
            CoordinateTransformation::Translation { translation: values } => {
                (values, &mut translation, 0.0)
            }
            CoordinateTransformation::Other => continue,
        };

        if values.is_empty() {
            continue;
        }
        if values.len() != axes.num_dimensions() {
            return Err(FormatError::InvalidDatasetAttributes {
                path: path.to_string(),
                reason: format!(
                    "coordinate transformation has {} values for {} axes",
                    values.len(),
                    axes.num_dimensions()
                ),
            });
        }
        *target = axes.spatial_values(values, default);
    }

    Ok((scale, translation))
}
