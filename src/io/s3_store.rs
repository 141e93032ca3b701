use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{join_key, ObjectStore, StoreSource};
use crate::error::IoError;

/// S3-backed implementation of `ObjectStore`.
///
/// Reads whole objects from S3 or S3-compatible storage (MinIO, etc.).
/// Keys are resolved below `prefix`, the container path inside the bucket.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
}

impl S3Store {
    /// Create a new S3Store for the container at `prefix` in `bucket`.
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
            endpoint: None,
        }
    }

    /// Record the service endpoint so it appears in diagnostics.
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get the container path inside the bucket.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn object_key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, IoError> {
        let object_key = self.object_key(key);

        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let is_not_found = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);

                // Some S3-compatible services only report a bare 404
                let status_is_404 = e
                    .raw_response()
                    .map(|r| r.status().as_u16() == 404)
                    .unwrap_or(false);

                if is_not_found || status_is_404 {
                    return Ok(None);
                }

                return Err(IoError::S3(format!(
                    "s3://{}/{}: {}",
                    self.bucket, object_key, e
                )));
            }
        };

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| IoError::Connection(e.to_string()))?
            .into_bytes();

        Ok(Some(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, IoError> {
        let dir = self.object_key(prefix);
        let dir = if dir.is_empty() {
            dir
        } else {
            format!("{}/", dir)
        };

        let mut children = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&dir)
                .delimiter("/");

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let result = request
                .send()
                .await
                .map_err(|e| IoError::S3(format!("s3://{}/{}: {}", self.bucket, dir, e)))?;

            for common in result.common_prefixes() {
                if let Some(name) = common.prefix().and_then(|p| p.strip_prefix(dir.as_str())) {
                    let name = name.trim_end_matches('/');
                    if !name.is_empty() {
                        children.push(name.to_string());
                    }
                }
            }

            for obj in result.contents() {
                if let Some(name) = obj.key().and_then(|k| k.strip_prefix(dir.as_str())) {
                    if !name.is_empty() && !name.contains('/') {
                        children.push(name.to_string());
                    }
                }
            }

            if result.is_truncated() == Some(true) {
                continuation_token = result.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        children.sort();
        Ok(children)
    }

    fn location(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!(
                "service endpoint: {}; bucket: {}; container path: {}",
                endpoint, self.bucket, self.prefix
            ),
            None => format!("s3://{}/{}", self.bucket, self.prefix),
        }
    }
}

/// `StoreSource` for a container in an S3 bucket.
#[derive(Clone)]
pub struct S3Source {
    client: Client,
    bucket: String,
    prefix: String,
    endpoint: Option<String>,
}

impl S3Source {
    /// Create a source for the container at `prefix` in `bucket`.
    ///
    /// # Arguments
    /// * `client` - AWS S3 client to use for requests
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Container path inside the bucket (e.g. `images/sample.ome.zarr`)
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            endpoint: None,
        }
    }

    /// Record the service endpoint so it appears in diagnostics.
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl StoreSource for S3Source {
    type Store = S3Store;

    async fn open_store(&self) -> Result<Self::Store, IoError> {
        Ok(
            S3Store::new(self.client.clone(), self.bucket.clone(), self.prefix.clone())
                .with_endpoint(self.endpoint.clone()),
        )
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
///
/// For AWS S3, pass `None` to use the default endpoint:
/// ```ignore
/// let client = create_s3_client(None, "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // For S3-compatible services, we often need to use path-style addressing
    let s3_config = if endpoint_url.is_some() {
        aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build()
    } else {
        aws_sdk_s3::config::Builder::from(&sdk_config).build()
    };

    Client::from_conf(s3_config)
}
