mod fs_store;
mod s3_store;
mod store;

pub use fs_store::{FilesystemSource, FilesystemStore};
pub use s3_store::{create_s3_client, S3Source, S3Store};
pub use store::{join_key, ObjectStore, StoreSource};
