use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use super::axes::{AxisDescriptor, AxisTag};
use super::multiscales::{MultiscaleMetadata, MultiscaleMetadataResolver, PyramidLevel};
use crate::error::FormatError;
use crate::io::{join_key, ObjectStore};
use crate::zarr::{ElementKind, ZarrReader};

/// Group holding label images, and the attribute listing them.
pub const LABELS_GROUP: &str = "labels";

/// Scale and translation mapping level-local voxel coordinates to physical
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelTransform {
    pub scale: [f64; 3],
    pub translation: [f64; 3],
}

impl LevelTransform {
    /// Map a voxel position (`x, y, z`).
    pub fn apply(&self, voxel: [f64; 3]) -> [f64; 3] {
        [
            voxel[0] * self.scale[0] + self.translation[0],
            voxel[1] * self.scale[1] + self.translation[1],
            voxel[2] * self.scale[2] + self.translation[2],
        ]
    }
}

/// One logical image of a container: a channel of the root image, or a
/// label volume.
///
/// All geometry is parsed when the setup is built and never changes
/// afterwards, so the getters are plain reads.
#[derive(Debug, Clone)]
pub struct PyramidSetup {
    id: usize,
    name: String,
    group: String,
    channel: u64,
    is_label: bool,
    axes: AxisDescriptor,
    kind: ElementKind,
    num_timepoints: u64,
    levels: Vec<PyramidLevel>,
}

impl PyramidSetup {
    /// Build a setup from a resolved multiscale.
    ///
    /// Element kind and timepoint count are read from level 0.
    pub fn new(
        id: usize,
        group: &str,
        channel: u64,
        is_label: bool,
        metadata: MultiscaleMetadata,
    ) -> Result<Self, FormatError> {
        let MultiscaleMetadata { name, axes, levels } = metadata;

        for tag in [AxisTag::X, AxisTag::Y] {
            if axes.declared_index(tag).is_none() {
                return Err(FormatError::InvalidAxes(format!(
                    "'{}' in {} has no {} axis",
                    axes,
                    display_group(group),
                    tag
                )));
            }
        }

        let level0 = levels.first().ok_or_else(|| FormatError::InvalidDatasetAttributes {
            path: group.to_string(),
            reason: "multiscale declares no datasets".to_string(),
        })?;

        let kind = level0.attributes().kind();
        let num_timepoints = axes
            .declared_index(AxisTag::T)
            .and_then(|t| level0.dimensions().get(t).copied())
            .unwrap_or(1);

        Ok(Self {
            id,
            name: name.unwrap_or_else(|| format!("image {}", id)),
            group: group.to_string(),
            channel,
            is_label,
            axes,
            kind,
            num_timepoints,
            levels,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group path the pyramid is rooted at.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Channel index of this setup within its image.
    pub fn channel(&self) -> u64 {
        self.channel
    }

    pub fn is_label(&self) -> bool {
        self.is_label
    }

    pub fn axes(&self) -> &AxisDescriptor {
        &self.axes
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn num_timepoints(&self) -> u64 {
        self.num_timepoints
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn level(&self, level: usize) -> Option<&PyramidLevel> {
        self.levels.get(level)
    }

    /// Raw array extent of a level, in declared order.
    pub fn image_size(&self, level: usize) -> Option<&[u64]> {
        self.level(level).map(|l| l.dimensions())
    }

    /// Spatial extent (`x, y, z`) of a level; z is 1 for planar images.
    pub fn spatial_image_size(&self, level: usize) -> Option<[u64; 3]> {
        self.level(level)
            .map(|l| self.axes.spatial_values(l.dimensions(), 1))
    }

    /// Spatial chunk shape (`x, y, z`) of a level; z is 1 for planar images.
    pub fn chunk_shape(&self, level: usize) -> Option<[u64; 3]> {
        self.level(level)
            .map(|l| self.axes.spatial_values(l.chunk_shape(), 1))
    }

    /// Number of chunks along `x, y, z` at a level.
    pub fn grid_size(&self, level: usize) -> Option<[u64; 3]> {
        let size = self.spatial_image_size(level)?;
        let chunk = self.chunk_shape(level)?;
        Some([
            size[0].div_ceil(chunk[0]),
            size[1].div_ceil(chunk[1]),
            size[2].div_ceil(chunk[2]),
        ])
    }

    /// Transform of a level.
    ///
    /// Level 0 carries the declared physical scale; coarser levels carry
    /// their downsampling factor relative to level 0. The translation is the
    /// one declared for the level.
    pub fn level_transform(&self, level: usize) -> Option<LevelTransform> {
        let l = self.level(level)?;
        let scale = if level == 0 { l.scale() } else { l.resolution() };
        Some(LevelTransform {
            scale,
            translation: l.translation(),
        })
    }

    /// Downsampling factors of every level.
    pub fn mipmap_resolutions(&self) -> Vec<[f64; 3]> {
        self.levels.iter().map(|l| l.resolution()).collect()
    }

    /// Physical voxel size at full resolution.
    pub fn voxel_size(&self) -> [f64; 3] {
        self.levels[0].scale()
    }

    /// Spatial unit, taken from the `x` axis.
    pub fn unit(&self) -> Option<&str> {
        self.axes.unit(AxisTag::X)
    }
}

/// The setups of one OME-Zarr container.
///
/// Setup ids are dense and follow discovery order: every channel of the
/// root image, then every label listed in `labels/.zattrs`.
#[derive(Debug, Clone)]
pub struct Container {
    setups: Vec<Arc<PyramidSetup>>,
    num_timepoints: u64,
}

impl Container {
    /// Enumerate and parse all setups of the container behind `reader`.
    ///
    /// A group that fails to parse is logged and skipped; opening only
    /// fails when no setup at all could be built.
    pub async fn open<S: ObjectStore>(
        reader: &ZarrReader<S>,
        resolver: &MultiscaleMetadataResolver,
    ) -> Result<Self, FormatError> {
        let mut setups: Vec<Arc<PyramidSetup>> = Vec::new();
        let mut first_error: Option<FormatError> = None;

        match resolver.parse(reader, "").await {
            Ok(metadata) => {
                let num_channels = metadata
                    .axes
                    .declared_index(AxisTag::C)
                    .and_then(|c| metadata.levels.first()?.dimensions().get(c).copied())
                    .unwrap_or(1);

                for channel in 0..num_channels {
                    match PyramidSetup::new(setups.len(), "", channel, false, metadata.clone()) {
                        Ok(setup) => setups.push(Arc::new(setup)),
                        Err(e) => {
                            warn!(group = "/", "Skipping image: {}", e);
                            first_error.get_or_insert(e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(group = "/", "Skipping image: {}", e);
                first_error = Some(e);
            }
        }

        for label in Self::label_names(reader).await {
            let group = join_key(LABELS_GROUP, &label);
            let built = match resolver.parse(reader, &group).await {
                Ok(metadata) => PyramidSetup::new(setups.len(), &group, 0, true, metadata),
                Err(e) => Err(e),
            };
            match built {
                Ok(setup) => setups.push(Arc::new(setup)),
                Err(e) => {
                    warn!(group = group.as_str(), "Skipping label: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if setups.is_empty() {
            return Err(first_error.unwrap_or_else(|| FormatError::MissingMultiscales {
                location: reader.location(),
            }));
        }

        let num_timepoints = setups
            .iter()
            .map(|s| s.num_timepoints())
            .max()
            .unwrap_or(1);

        debug!(
            setups = setups.len(),
            timepoints = num_timepoints,
            "Opened container {}",
            reader.location()
        );

        Ok(Self {
            setups,
            num_timepoints,
        })
    }

    /// Names listed in the `labels` attribute of the labels group.
    async fn label_names<S: ObjectStore>(reader: &ZarrReader<S>) -> Vec<String> {
        let value = match reader.attribute(LABELS_GROUP, LABELS_GROUP).await {
            Ok(Some(value)) => value,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Could not read label list: {}", e);
                return Vec::new();
            }
        };

        match value {
            Value::Array(entries) => entries
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            other => {
                warn!("Ignoring malformed label list: {}", other);
                Vec::new()
            }
        }
    }

    pub fn setups(&self) -> &[Arc<PyramidSetup>] {
        &self.setups
    }

    pub fn setup(&self, id: usize) -> Option<&Arc<PyramidSetup>> {
        self.setups.get(id)
    }

    /// Largest timepoint count over all setups.
    pub fn num_timepoints(&self) -> u64 {
        self.num_timepoints
    }

    /// Largest level count over all setups.
    pub fn max_levels(&self) -> usize {
        self.setups
            .iter()
            .map(|s| s.num_levels())
            .max()
            .unwrap_or(0)
    }
}

fn display_group(group: &str) -> &str {
    if group.is_empty() {
        "/"
    } else {
        group
    }
}
