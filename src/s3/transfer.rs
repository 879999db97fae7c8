//! Managed transfers: pick a single put or a multipart upload by size.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::UploadError;
use super::helpers::detect_content_type;
use super::multipart::{
    MAX_PARTS, MIN_PART_SIZE, MultipartConfig, Orchestrator, ProgressCallback, TransferProgress,
};
use super::source::{ByteSource, FileSource};
use super::store::{ObjectIdentity, ObjectStore};

pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

pub const DEFAULT_TARGET_PART_SIZE: u64 = 8 * 1024 * 1024;

pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Objects of at least this many bytes go through a multipart upload
    pub multipart_threshold: u64,
    pub target_part_size: u64,
    pub concurrency: usize,
    pub min_part_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            target_part_size: DEFAULT_TARGET_PART_SIZE,
            concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            min_part_size: MIN_PART_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferStrategy {
    SinglePut,
    Multipart {
        upload_id: String,
        parts: usize,
        part_size: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub identity: ObjectIdentity,
    pub bytes: u64,
    pub strategy: TransferStrategy,
}

/// Uploads whole objects, choosing the request strategy from their size
pub struct TransferManager {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl TransferManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        Self {
            store,
            config,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Part size for an object of `size` bytes
    ///
    /// Grows past the target so the upload never needs more than 10,000
    /// parts, and never drops below the service minimum.
    pub fn part_size_for(&self, size: u64) -> u64 {
        self.config
            .target_part_size
            .max(size.div_ceil(MAX_PARTS))
            .max(self.config.min_part_size)
    }

    pub async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<TransferOutcome, UploadError> {
        let source = FileSource::open(path)
            .await
            .map_err(|source| UploadError::Source {
                path: path.display().to_string(),
                source,
            })?;
        let content_type = detect_content_type(path);

        self.upload_source(bucket, key, &source, Some(content_type))
            .await
    }

    pub async fn upload_source(
        &self,
        bucket: &str,
        key: &str,
        source: &dyn ByteSource,
        content_type: Option<&str>,
    ) -> Result<TransferOutcome, UploadError> {
        let size = source.size();
        if size < self.config.multipart_threshold {
            return self.single_put(bucket, key, source, content_type).await;
        }

        let part_size = self.part_size_for(size);
        let config = MultipartConfig::builder()
            .min_part_size(self.config.min_part_size)
            .part_size(part_size)
            .concurrency(self.config.concurrency)
            .build()?;

        debug!(
            "Transfer of {} bytes uses multipart with {} byte parts",
            size, part_size
        );

        let mut orchestrator =
            Orchestrator::new(self.store.as_ref(), config).with_cancellation(self.cancel.clone());
        if let Some(progress) = &self.progress {
            orchestrator = orchestrator.with_progress(progress.clone());
        }

        let report = orchestrator.upload(bucket, key, source, content_type).await?;

        Ok(TransferOutcome {
            identity: report.identity,
            bytes: report.bytes,
            strategy: TransferStrategy::Multipart {
                upload_id: report.upload_id,
                parts: report.parts,
                part_size: report.part_size,
            },
        })
    }

    async fn single_put(
        &self,
        bucket: &str,
        key: &str,
        source: &dyn ByteSource,
        content_type: Option<&str>,
    ) -> Result<TransferOutcome, UploadError> {
        let size = source.size();
        let body = source
            .read_range(0, size)
            .await
            .map_err(|source| UploadError::Source {
                path: format!("source of s3://{}/{}", bucket, key),
                source,
            })?;

        let identity = self
            .store
            .put_object(bucket, key, body, content_type)
            .await
            .map_err(|source| UploadError::PutObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source,
            })?;

        if let Some(progress) = &self.progress {
            progress(&TransferProgress {
                part_number: 1,
                bytes_transferred: size,
                total_bytes: size,
            });
        }

        info!("Uploaded s3://{}/{} in a single request ({} bytes)", bucket, key, size);

        Ok(TransferOutcome {
            identity,
            bytes: size,
            strategy: TransferStrategy::SinglePut,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::memory::{MemoryStore, StoreCall};
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    const BUCKET: &str = "transfer-bucket";
    const KEY: &str = "MyObjectKeyTransferManager.zip";

    async fn memory_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::with_min_part_size(1));
        store.create_bucket(BUCKET).await.unwrap();
        store
    }

    fn tiny_config() -> TransferConfig {
        TransferConfig {
            multipart_threshold: 100,
            target_part_size: 40,
            concurrency: 3,
            min_part_size: 1,
        }
    }

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<TransferProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ProgressCallback = Arc::new(move |progress: &TransferProgress| {
            sink.lock().unwrap().push(*progress);
        });
        (callback, events)
    }

    #[test]
    fn test_part_size_for() {
        let manager = TransferManager::new(Arc::new(MemoryStore::new()), TransferConfig::default());

        assert_eq!(manager.part_size_for(20 * 1024 * 1024), DEFAULT_TARGET_PART_SIZE);
        // 200 GB would need more than 10,000 parts at the target size
        let huge = 200 * 1000 * 1000 * 1000;
        assert_eq!(manager.part_size_for(huge), huge.div_ceil(MAX_PARTS));
        assert!(huge.div_ceil(manager.part_size_for(huge)) <= MAX_PARTS);

        let config = TransferConfig {
            target_part_size: 1024,
            ..TransferConfig::default()
        };
        let manager = TransferManager::new(Arc::new(MemoryStore::new()), config);
        assert_eq!(manager.part_size_for(20 * 1024 * 1024), MIN_PART_SIZE);
    }

    #[tokio::test]
    async fn test_small_object_uses_single_put() {
        let store = memory_store().await;
        let (progress, events) = recorder();
        let data = b"tiny payload".to_vec();

        let outcome = TransferManager::new(store.clone(), tiny_config())
            .with_progress(progress)
            .upload_source(BUCKET, KEY, &data, Some("application/zip"))
            .await
            .unwrap();

        assert_eq!(outcome.strategy, TransferStrategy::SinglePut);
        assert_eq!(outcome.bytes, data.len() as u64);
        assert!(store.calls().is_empty()); // no multipart calls
        assert_eq!(store.get_object(BUCKET, KEY).await.unwrap().body, data);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].bytes_transferred, data.len() as u64);
    }

    #[tokio::test]
    async fn test_large_object_uses_multipart() {
        let store = memory_store().await;
        let (progress, events) = recorder();
        let data: Vec<u8> = (0..250u32).map(|i| (i % 7) as u8).collect();

        let outcome = TransferManager::new(store.clone(), tiny_config())
            .with_progress(progress)
            .upload_source(BUCKET, KEY, &data, None)
            .await
            .unwrap();

        match &outcome.strategy {
            TransferStrategy::Multipart {
                parts, part_size, ..
            } => {
                assert_eq!(*parts, 7);
                assert_eq!(*part_size, 40);
            }
            other => panic!("unexpected strategy: {other:?}"),
        }
        assert_eq!(events.lock().unwrap().len(), 7);
        assert_eq!(store.get_object(BUCKET, KEY).await.unwrap().body, data);
        assert_eq!(
            store.calls().last(),
            Some(&StoreCall::CompleteMultipartUpload)
        );
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let store = memory_store().await;
        let data = vec![1u8; 100];

        let outcome = TransferManager::new(store.clone(), tiny_config())
            .upload_source(BUCKET, KEY, &data, None)
            .await
            .unwrap();
        assert!(matches!(outcome.strategy, TransferStrategy::Multipart { .. }));
    }

    #[tokio::test]
    async fn test_upload_file_detects_content_type() {
        let store = memory_store().await;
        let mut file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        file.write_all(&[7u8; 64]).unwrap();

        let outcome = TransferManager::new(store.clone(), tiny_config())
            .upload_file(BUCKET, KEY, file.path())
            .await
            .unwrap();

        assert_eq!(outcome.strategy, TransferStrategy::SinglePut);
        let object = store.get_object(BUCKET, KEY).await.unwrap();
        assert_eq!(object.content_type.as_deref(), Some("application/zip"));
    }

    #[tokio::test]
    async fn test_missing_file_is_source_error() {
        let store = memory_store().await;
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        drop(file);

        let err = TransferManager::new(store, tiny_config())
            .upload_file(BUCKET, KEY, &path)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Source { .. }));
        assert!(err.user_message().contains("File not found"));
    }

    #[tokio::test]
    async fn test_multipart_failure_is_aborted() {
        let store = memory_store().await;
        store.fail_part(3, 1);
        let data = vec![9u8; 200];

        let err = TransferManager::new(store.clone(), tiny_config())
            .upload_source(BUCKET, KEY, &data, None)
            .await
            .unwrap_err();

        assert_eq!(err.failed_part(), Some(3));
        assert_eq!(store.pending_uploads(), 0);
        assert!(store.head_object(BUCKET, KEY).await.unwrap().is_none());
    }
}
