use bytes::Bytes;
use serde_json::{Map, Value};

use super::DatasetAttributes;
use crate::error::{FormatError, IoError};
use crate::io::{join_key, ObjectStore};

const ATTRIBUTES_FILE: &str = ".zattrs";
const ARRAY_FILE: &str = ".zarray";

/// Zarr v2 reader over any `ObjectStore`.
///
/// Provides the attribute, dataset-attribute, block and listing reads the
/// rest of the crate needs. Paths are group or array paths relative to the
/// container root (`""` is the root group).
pub struct ZarrReader<S> {
    store: S,
}

impl<S: ObjectStore> ZarrReader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Location of the container, for diagnostics.
    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Read all user attributes of the group or array at `path`.
    ///
    /// Returns `Ok(None)` when there is no `.zattrs`.
    pub async fn attributes(&self, path: &str) -> Result<Option<Map<String, Value>>, FormatError> {
        let key = join_key(path, ATTRIBUTES_FILE);
        let Some(data) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let value: Value =
            serde_json::from_slice(&data).map_err(|e| FormatError::InvalidDatasetAttributes {
                path: key.clone(),
                reason: e.to_string(),
            })?;

        match value {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(FormatError::InvalidDatasetAttributes {
                path: key,
                reason: "attributes must be a JSON object".to_string(),
            }),
        }
    }

    /// Read one attribute of the group or array at `path`.
    pub async fn attribute(&self, path: &str, key: &str) -> Result<Option<Value>, FormatError> {
        Ok(self
            .attributes(path)
            .await?
            .and_then(|mut attrs| attrs.remove(key)))
    }

    /// Read and parse the `.zarray` of the array at `path`.
    pub async fn dataset_attributes(&self, path: &str) -> Result<DatasetAttributes, FormatError> {
        let key = join_key(path, ARRAY_FILE);
        let data = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| FormatError::MissingDatasetAttributes {
                location: self.store.location(),
                path: path.to_string(),
            })?;

        DatasetAttributes::from_json(path, &data)
    }

    /// Read and decompress the chunk at `grid_position` of the array at `path`.
    ///
    /// Returns `Ok(None)` if the chunk was never written.
    pub async fn read_block(
        &self,
        path: &str,
        attrs: &DatasetAttributes,
        grid_position: &[u64],
    ) -> Result<Option<Bytes>, IoError> {
        let key = chunk_key(path, attrs, grid_position);
        let Some(data) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let nominal = attrs.chunks().iter().product::<u64>() as usize * attrs.kind().size();
        attrs
            .compressor()
            .decompress(data, nominal)
            .map(Some)
            .map_err(|e| IoError::Decode(format!("{}: {}", key, e)))
    }

    /// List the children of the group at `path`.
    pub async fn list(&self, path: &str) -> Result<Vec<String>, IoError> {
        self.store.list(path).await
    }
}

/// Store key of a chunk: the array path followed by the grid coordinates
/// joined with the array's dimension separator.
pub fn chunk_key(path: &str, attrs: &DatasetAttributes, grid_position: &[u64]) -> String {
    let coords = grid_position
        .iter()
        .map(|g| g.to_string())
        .collect::<Vec<_>>()
        .join(attrs.separator());
    join_key(path, &coords)
}
