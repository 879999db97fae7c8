use async_trait::async_trait;
use serde::Serialize;

use super::error::StoreError;
use super::multipart::PartResult;

/// Identity of an object written by a put or a completed multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectIdentity {
    pub bucket: String,
    pub key: String,
    pub e_tag: Option<String>,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketInfo {
    pub name: String,
    pub created: Option<String>,
}

/// One entry of an object listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub e_tag: Option<String>,
}

/// A downloaded object
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Object-storage operations used by the uploaders and the walkthrough
///
/// Implemented by [`S3Client`](super::S3Client) for a real service and by
/// [`MemoryStore`](super::MemoryStore) for local runs and tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StoreError>;

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectIdentity, StoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectData, StoreError>;

    /// Returns `None` if the object does not exist
    async fn head_object(&self, bucket: &str, key: &str)
        -> Result<Option<ObjectSummary>, StoreError>;

    /// List every object under `prefix`, following pagination to the end
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, StoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Returns the new upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Returns the part ETag. Uploading a part number again replaces it.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, StoreError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<ObjectIdentity, StoreError>;

    /// Succeeds if the upload is already gone
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;
}
