//! In-process object store with S3 semantics.
//!
//! Backs `--local` runs of the CLI and the unit tests. Multipart calls are
//! recorded so callers can inspect the sequence, and part uploads can be made
//! to fail on demand.

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::error::StoreError;
use super::multipart::{MAX_PARTS, MIN_PART_SIZE, PartResult};
use super::store::{BucketInfo, ObjectData, ObjectIdentity, ObjectStore, ObjectSummary};

/// A multipart call observed by [`MemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    CreateMultipartUpload,
    UploadPart(i32),
    CompleteMultipartUpload,
    AbortMultipartUpload,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    e_tag: String,
    content_type: Option<String>,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    // part# -> (etag, content)
    parts: HashMap<i32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct State {
    // bucket -> (key -> object)
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    // upload-id -> parts received so far
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    // part# -> remaining failures
    part_failures: HashMap<i32, usize>,
    abort_failures: usize,
    calls: Vec<StoreCall>,
}

pub struct MemoryStore {
    state: Mutex<State>, // std Mutex, never held across an await
    min_part_size: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_min_part_size(MIN_PART_SIZE)
    }

    /// Reject completion when a non-final part is smaller than `min_part_size`
    pub fn with_min_part_size(min_part_size: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            min_part_size,
        }
    }

    /// Make the next `times` uploads of `part_number` fail with a 500
    pub fn fail_part(&self, part_number: i32, times: usize) {
        self.lock().part_failures.insert(part_number, times);
    }

    /// Make the next `times` aborts fail with a 403
    pub fn fail_abort(&self, times: usize) {
        self.lock().abort_failures = times;
    }

    /// Multipart calls received so far, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Uploads that were neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("lock valid")
    }
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

fn no_such_bucket(operation: &'static str, bucket: &str) -> StoreError {
    StoreError::service(
        operation,
        "NoSuchBucket",
        format!("The specified bucket does not exist: {}", bucket),
        404,
    )
}

fn no_such_upload(operation: &'static str, upload_id: &str) -> StoreError {
    StoreError::service(
        operation,
        "NoSuchUpload",
        format!("The specified upload does not exist: {}", upload_id),
        404,
    )
}

fn invalid_part(operation: &'static str, message: String) -> StoreError {
    StoreError::service(operation, "InvalidPart", message, 400)
}

impl State {
    fn bucket_mut(
        &mut self,
        operation: &'static str,
        bucket: &str,
    ) -> Result<&mut BTreeMap<String, StoredObject>, StoreError> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(operation, bucket))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.buckets.contains_key(bucket) {
            return Err(StoreError::service(
                "CreateBucket",
                "BucketAlreadyOwnedByYou",
                "Your previous request to create the named bucket succeeded and you already own it.",
                409,
            ));
        }
        state.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StoreError> {
        Ok(self
            .lock()
            .buckets
            .keys()
            .map(|name| BucketInfo {
                name: name.clone(),
                created: None,
            })
            .collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        let objects = state.bucket_mut("DeleteBucket", bucket)?;
        if !objects.is_empty() {
            return Err(StoreError::service(
                "DeleteBucket",
                "BucketNotEmpty",
                "The bucket you tried to delete is not empty",
                409,
            ));
        }
        state.buckets.remove(bucket);
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectIdentity, StoreError> {
        let mut state = self.lock();
        let objects = state.bucket_mut("PutObject", bucket)?;
        let e_tag = format!("\"{}\"", md5_hex(&body));
        objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                e_tag: e_tag.clone(),
                content_type: content_type.map(str::to_string),
            },
        );

        Ok(ObjectIdentity {
            bucket: bucket.to_string(),
            key: key.to_string(),
            e_tag: Some(e_tag),
            version_id: None,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectData, StoreError> {
        let mut state = self.lock();
        let object = state
            .bucket_mut("GetObject", bucket)?
            .get(key)
            .ok_or_else(|| {
                StoreError::service(
                    "GetObject",
                    "NoSuchKey",
                    "The specified key does not exist.",
                    404,
                )
            })?;

        Ok(ObjectData {
            content_type: object.content_type.clone(),
            body: object.data.clone(),
        })
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectSummary>, StoreError> {
        let mut state = self.lock();
        Ok(state
            .bucket_mut("HeadObject", bucket)?
            .get(key)
            .map(|object| ObjectSummary {
                key: key.to_string(),
                size: object.data.len() as u64,
                e_tag: Some(object.e_tag.clone()),
            }))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, StoreError> {
        let mut state = self.lock();
        let prefix = prefix.unwrap_or_default();
        Ok(state
            .bucket_mut("ListObjectsV2", bucket)?
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size: object.data.len() as u64,
                e_tag: Some(object.e_tag.clone()),
            })
            .collect())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        // deleting a missing key is not an error
        state.bucket_mut("DeleteObject", bucket)?.remove(key);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::CreateMultipartUpload);
        state.bucket_mut("CreateMultipartUpload", bucket)?;

        state.next_upload += 1;
        let upload_id = format!("memory-upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
                parts: HashMap::new(),
            },
        );

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::UploadPart(part_number));

        if let Some(remaining) = state.part_failures.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::service(
                    "UploadPart",
                    "InternalError",
                    format!("injected failure for part {}", part_number),
                    500,
                ));
            }
        }

        if !(1..=MAX_PARTS as i32).contains(&part_number) {
            return Err(StoreError::service(
                "UploadPart",
                "InvalidArgument",
                format!("Part number must be between 1 and {}", MAX_PARTS),
                400,
            ));
        }

        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| no_such_upload("UploadPart", upload_id))?;
        let e_tag = format!("\"{}\"", md5_hex(&body));
        upload.parts.insert(part_number, (e_tag.clone(), body));

        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<ObjectIdentity, StoreError> {
        const OP: &str = "CompleteMultipartUpload";

        let mut state = self.lock();
        state.calls.push(StoreCall::CompleteMultipartUpload);

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| no_such_upload(OP, upload_id))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(no_such_upload(OP, upload_id));
        }

        if parts.is_empty() {
            return Err(StoreError::service(
                OP,
                "MalformedXML",
                "The XML you provided was not well-formed",
                400,
            ));
        }

        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(StoreError::service(
                OP,
                "InvalidPartOrder",
                "The list of parts was not in ascending order",
                400,
            ));
        }

        // verify parts and assemble the object
        let mut combined = Vec::new();
        let mut digests = Md5::new();
        for (index, part) in parts.iter().enumerate() {
            let (e_tag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                invalid_part(OP, format!("part {} was never uploaded", part.part_number))
            })?;
            if e_tag.trim_matches('"') != part.e_tag.trim_matches('"') {
                return Err(invalid_part(
                    OP,
                    format!("ETag of part {} does not match", part.part_number),
                ));
            }
            if index + 1 < parts.len() && (data.len() as u64) < self.min_part_size {
                return Err(StoreError::service(
                    OP,
                    "EntityTooSmall",
                    "Your proposed upload is smaller than the minimum allowed object size",
                    400,
                ));
            }
            digests.update(Md5::digest(data));
            combined.extend_from_slice(data);
        }

        let e_tag = format!("\"{:x}-{}\"", digests.finalize(), parts.len());
        let content_type = upload.content_type.clone();
        state.uploads.remove(upload_id);

        let objects = state.bucket_mut(OP, bucket)?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: combined,
                e_tag: e_tag.clone(),
                content_type,
            },
        );

        Ok(ObjectIdentity {
            bucket: bucket.to_string(),
            key: key.to_string(),
            e_tag: Some(e_tag),
            version_id: None,
        })
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::AbortMultipartUpload);
        if state.abort_failures > 0 {
            state.abort_failures -= 1;
            return Err(StoreError::service(
                "AbortMultipartUpload",
                "AccessDenied",
                "Access Denied",
                403,
            ));
        }
        // an unknown id has already been released
        state.uploads.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let store = MemoryStore::new();
        store.create_bucket("demo").await.unwrap();

        let err = store.create_bucket("demo").await.unwrap_err();
        assert_eq!(err.code(), Some("BucketAlreadyOwnedByYou"));

        store
            .put_object("demo", "MyObjectKey", b"hello".to_vec(), Some("text/plain"))
            .await
            .unwrap();
        let err = store.delete_bucket("demo").await.unwrap_err();
        assert_eq!(err.code(), Some("BucketNotEmpty"));

        store.delete_object("demo", "MyObjectKey").await.unwrap();
        store.delete_object("demo", "MyObjectKey").await.unwrap();
        store.delete_bucket("demo").await.unwrap();
        assert!(store.list_buckets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_get_and_list() {
        let store = MemoryStore::new();
        store.create_bucket("demo").await.unwrap();

        let identity = store
            .put_object("demo", "MyObjectKey", b"hello".to_vec(), Some("text/plain"))
            .await
            .unwrap();
        assert_eq!(
            identity.e_tag.as_deref(),
            Some("\"5d41402abc4b2a76b9719d911017c592\"")
        );
        store
            .put_object("demo", "Other", b"x".to_vec(), None)
            .await
            .unwrap();

        let object = store.get_object("demo", "MyObjectKey").await.unwrap();
        assert_eq!(object.body, b"hello");
        assert_eq!(object.content_type.as_deref(), Some("text/plain"));

        let listed = store.list_objects("demo", Some("My")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "MyObjectKey");
        assert_eq!(listed[0].size, 5);
        assert_eq!(store.list_objects("demo", None).await.unwrap().len(), 2);

        let err = store.get_object("demo", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.head_object("demo", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_manifest_order() {
        let store = MemoryStore::with_min_part_size(1);
        store.create_bucket("demo").await.unwrap();
        let upload_id = store
            .create_multipart_upload("demo", "big", None)
            .await
            .unwrap();

        // parts may arrive in any order
        let e2 = store
            .upload_part("demo", "big", &upload_id, 2, b"world".to_vec())
            .await
            .unwrap();
        let e1 = store
            .upload_part("demo", "big", &upload_id, 1, b"hello ".to_vec())
            .await
            .unwrap();

        let parts = vec![
            PartResult {
                part_number: 1,
                e_tag: e1,
                size: 6,
            },
            PartResult {
                part_number: 2,
                e_tag: e2,
                size: 5,
            },
        ];
        store
            .complete_multipart_upload("demo", "big", &upload_id, &parts)
            .await
            .unwrap();

        let object = store.get_object("demo", "big").await.unwrap();
        assert_eq!(object.body, b"hello world");
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_multipart_rejections() {
        let store = MemoryStore::with_min_part_size(1);
        store.create_bucket("demo").await.unwrap();
        let upload_id = store
            .create_multipart_upload("demo", "big", None)
            .await
            .unwrap();
        let e1 = store
            .upload_part("demo", "big", &upload_id, 1, b"abc".to_vec())
            .await
            .unwrap();

        let stale = [PartResult {
            part_number: 1,
            e_tag: "\"stale\"".to_string(),
            size: 3,
        }];
        let err = store
            .complete_multipart_upload("demo", "big", &upload_id, &stale)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("InvalidPart"));

        let unordered = [
            PartResult {
                part_number: 1,
                e_tag: e1.clone(),
                size: 3,
            },
            PartResult {
                part_number: 1,
                e_tag: e1,
                size: 3,
            },
        ];
        let err = store
            .complete_multipart_upload("demo", "big", &upload_id, &unordered)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("InvalidPartOrder"));

        let err = store
            .upload_part("demo", "big", &upload_id, 0, b"x".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("InvalidArgument"));

        // rejected completions leave the upload pending until aborted
        assert_eq!(store.pending_uploads(), 1);
        store
            .abort_multipart_upload("demo", "big", &upload_id)
            .await
            .unwrap();
        store
            .abort_multipart_upload("demo", "big", &upload_id)
            .await
            .unwrap();
        assert_eq!(store.pending_uploads(), 0);

        let upload_id = store
            .create_multipart_upload("demo", "big", None)
            .await
            .unwrap();
        store.fail_abort(1);
        let err = store
            .abort_multipart_upload("demo", "big", &upload_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("AccessDenied"));
        assert_eq!(store.pending_uploads(), 1);
        store
            .abort_multipart_upload("demo", "big", &upload_id)
            .await
            .unwrap();

        let err = store
            .upload_part("demo", "big", &upload_id, 1, b"abc".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NoSuchUpload"));
    }

    #[tokio::test]
    async fn test_injected_part_failure() {
        let store = MemoryStore::with_min_part_size(1);
        store.create_bucket("demo").await.unwrap();
        let upload_id = store
            .create_multipart_upload("demo", "big", None)
            .await
            .unwrap();
        store.fail_part(1, 1);

        let err = store
            .upload_part("demo", "big", &upload_id, 1, b"abc".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        store
            .upload_part("demo", "big", &upload_id, 1, b"abc".to_vec())
            .await
            .unwrap();

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::CreateMultipartUpload,
                StoreCall::UploadPart(1),
                StoreCall::UploadPart(1),
            ]
        );
    }
}
