//! OME-Zarr image metadata: axis declarations, multiscale pyramids and the
//! setups (channels and labels) of a container.

mod axes;
mod multiscales;
mod setup;

pub use axes::{AxisDescriptor, AxisTag, SPATIAL_TAGS};
pub use multiscales::{
    resolution_factors, MultiscaleMetadata, MultiscaleMetadataResolver, PyramidLevel,
    MULTISCALES_KEY,
};
pub use setup::{Container, LevelTransform, PyramidSetup, LABELS_GROUP};
