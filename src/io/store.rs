use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;

/// Trait for reading whole objects from a key-value store.
///
/// Keys are `/`-separated paths relative to the container root. This is the
/// only dependency the rest of the crate has on a concrete backend;
/// implementations must be thread-safe since one store is shared by every
/// fetch worker.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the object stored under `key`.
    ///
    /// Returns `Ok(None)` if no such object exists, and an error only for
    /// transport-level failures.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, IoError>;

    /// List the immediate children of `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, IoError>;

    /// Human-readable location of the container (for logging and errors).
    ///
    /// For S3, this is typically `s3://bucket/prefix`.
    fn location(&self) -> String;
}

/// Trait for opening a store for a container location.
///
/// The cache calls this every time it (re)opens, so a source should be cheap
/// to hold and open: credentials, endpoints and regions are resolved by
/// whoever constructs the source.
#[async_trait]
pub trait StoreSource: Send + Sync {
    /// The type of store this source opens.
    type Store: ObjectStore + 'static;

    /// Open a store handle for the container.
    async fn open_store(&self) -> Result<Self::Store, IoError>;
}

/// Join a container-relative path and a child name.
///
/// Empty components are skipped so that the root group (`""`) joins
/// cleanly.
pub fn join_key(base: &str, child: &str) -> String {
    let base = base.trim_matches('/');
    let child = child.trim_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, child),
    }
}
