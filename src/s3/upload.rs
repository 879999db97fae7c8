use std::path::Path;
use tracing::debug;

use super::error::UploadError;
use super::helpers::detect_content_type;
use super::store::{ObjectIdentity, ObjectStore};

/// Upload a local file in a single request
pub async fn put_file(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    local_path: &Path,
) -> Result<ObjectIdentity, UploadError> {
    let body = tokio::fs::read(local_path)
        .await
        .map_err(|source| UploadError::Source {
            path: local_path.display().to_string(),
            source,
        })?;
    let content_type = detect_content_type(local_path);

    debug!(
        "Uploading {} ({} bytes, {}) to s3://{}/{}",
        local_path.display(),
        body.len(),
        content_type,
        bucket,
        key
    );

    store
        .put_object(bucket, key, body, Some(content_type))
        .await
        .map_err(|source| UploadError::PutObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::memory::MemoryStore;
    use std::io::Write;

    #[tokio::test]
    async fn test_put_file() {
        let store = MemoryStore::new();
        store.create_bucket("put-bucket").await.unwrap();

        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"hello\n").unwrap();

        let identity = put_file(&store, "put-bucket", "MyObjectKey", file.path())
            .await
            .unwrap();
        assert_eq!(identity.key, "MyObjectKey");
        assert!(identity.e_tag.is_some());

        let object = store.get_object("put-bucket", "MyObjectKey").await.unwrap();
        assert_eq!(object.body, b"hello\n");
        assert_eq!(object.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_put_file_missing_bucket() {
        let store = MemoryStore::new();
        let file = tempfile::NamedTempFile::new().unwrap();

        let err = put_file(&store, "nope-bucket", "key", file.path())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::PutObject { .. }));
        assert_eq!(err.store_error().and_then(|e| e.code()), Some("NoSuchBucket"));
    }
}
