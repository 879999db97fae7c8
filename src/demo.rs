//! The end-to-end S3 walkthrough: buckets, objects, multipart and managed
//! uploads, then cleanup.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt::Display;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::s3::{
    BucketInfo, FileComparison, FileSource, MultipartConfig, ObjectIdentity, ObjectStore,
    ObjectSummary, Orchestrator, StoreError, TransferConfig, TransferManager, TransferOutcome,
    TransferProgress, UploadError, UploadReport, compare_file, helpers::detect_content_type,
    put_file,
};

pub const SAMPLE_KEY: &str = "MyObjectKey";
pub const MULTIPART_KEY: &str = "MyObjectKeyUploadPartRequest.zip";
pub const TRANSFER_KEY: &str = "MyObjectKeyTransferManager.zip";
pub const LIST_PREFIX: &str = "My";

const SAMPLE_LINES: [&str; 5] = [
    "abcdefghijklmnopqrstuvwxyz",
    "01234567890112345678901234",
    "!@#$%^&*()-=[]{};':',.<>/?",
    "01234567890112345678901234",
    "abcdefghijklmnopqrstuvwxyz",
];

#[derive(Debug, Clone, Default)]
pub struct DemoOptions {
    /// Leave the objects and the bucket in place
    pub keep: bool,
    /// No console output, no progress bar
    pub quiet: bool,
    pub multipart: MultipartConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub step: &'static str,
    pub objects: Vec<ObjectSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkthroughReport {
    pub bucket: String,
    pub bucket_created: bool,
    pub buckets: Vec<BucketInfo>,
    pub sample: ObjectIdentity,
    pub sample_content_type: Option<String>,
    pub sample_lines: Vec<String>,
    pub listings: Vec<Listing>,
    pub multipart: UploadReport,
    pub comparison: FileComparison,
    /// `None` when the managed transfer failed, see `transfer_error`
    pub transfer: Option<TransferOutcome>,
    pub transfer_error: Option<String>,
    pub cleaned_up: bool,
}

pub struct Walkthrough {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    options: DemoOptions,
    cancel: CancellationToken,
}

impl Walkthrough {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, options: DemoOptions) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every step against `file`, the payload for the large uploads
    pub async fn run(&self, file: &Path) -> Result<WalkthroughReport> {
        let bucket = self.bucket.as_str();
        self.say(style("Getting Started with Amazon S3").bold());
        self.say(style("═".repeat(70)).dim());

        // 1. bucket
        self.step(format!("Creating bucket {}", bucket))?;
        let bucket_created = self.create_bucket().await?;

        // 2. buckets
        self.step("Listing buckets")?;
        let buckets = self
            .store
            .list_buckets()
            .await
            .context("Failed to list buckets")?;
        for info in &buckets {
            self.say(format!(" - {}", info.name));
        }

        // 3. small object
        self.step("Uploading a new object to S3 from a file")?;
        let sample_file = write_sample_file()?;
        let sample = put_file(self.store.as_ref(), bucket, SAMPLE_KEY, sample_file.path()).await?;

        // 4. read it back
        self.step("Downloading an object")?;
        let object = self
            .store
            .get_object(bucket, SAMPLE_KEY)
            .await
            .with_context(|| format!("Failed to download {}", SAMPLE_KEY))?;
        self.say(format!(
            "Content-Type: {}",
            object.content_type.as_deref().unwrap_or("unknown")
        ));
        let text = String::from_utf8_lossy(&object.body);
        let sample_lines: Vec<String> = text.lines().map(str::to_string).collect();
        for line in &sample_lines {
            self.say(format!("    {}", line));
        }

        // 5. list
        let mut listings = Vec::new();
        listings.push(self.list("after put_object").await?);

        // 6. multipart
        self.step(format!("Multipart upload of {}", file.display()))?;
        let multipart = self.multipart_upload(file).await?;
        for part in &multipart.part_results {
            self.say(format!("    part {:>5}  ETag {}", part.part_number, part.e_tag));
        }
        let comparison = compare_file(self.store.as_ref(), bucket, MULTIPART_KEY, file).await?;
        self.say(format!("Remote copy: {:?}", comparison));

        // 7. list
        listings.push(self.list("after multipart upload").await?);

        // 8. managed transfer, a failure here does not stop the walkthrough
        self.step(format!("Managed transfer of {}", file.display()))?;
        let (transfer, transfer_error) = match self.managed_transfer(file).await {
            Ok(outcome) => (Some(outcome), None),
            Err(err) if self.cancel.is_cancelled() => return Err(err),
            Err(err) => {
                warn!("Managed transfer failed: {:#}", err);
                self.say(style("Unable to upload file, upload was aborted.").red());
                if let Some(detail) = explain(&err) {
                    self.say(detail);
                }
                (None, Some(format!("{:#}", err)))
            }
        };

        // 9. list
        listings.push(self.list("after managed transfer").await?);

        // 10. cleanup
        let cleaned_up = if self.options.keep {
            self.step("Keeping objects and bucket (--keep)")?;
            false
        } else {
            self.step("Deleting objects and bucket")?;
            self.cleanup().await?;
            true
        };

        self.say(style("═".repeat(70)).dim());
        self.say(style("✓ Walkthrough finished").green().bold());

        Ok(WalkthroughReport {
            bucket: bucket.to_string(),
            bucket_created,
            buckets,
            sample,
            sample_content_type: object.content_type,
            sample_lines,
            listings,
            multipart,
            comparison,
            transfer,
            transfer_error,
            cleaned_up,
        })
    }

    async fn create_bucket(&self) -> Result<bool> {
        match self.store.create_bucket(&self.bucket).await {
            Ok(()) => Ok(true),
            Err(err) if matches!(err.code(), Some("BucketAlreadyOwnedByYou" | "BucketAlreadyExists")) => {
                warn!("Bucket {} already exists, reusing it", self.bucket);
                self.say(style(format!("Bucket {} already exists", self.bucket)).yellow());
                Ok(false)
            }
            Err(err) => {
                Err(err).with_context(|| format!("Failed to create bucket {}", self.bucket))
            }
        }
    }

    async fn list(&self, step: &'static str) -> Result<Listing> {
        self.step(format!("Listing objects with prefix '{}'", LIST_PREFIX))?;
        let objects = self
            .store
            .list_objects(&self.bucket, Some(LIST_PREFIX))
            .await
            .context("Failed to list objects")?;
        for object in &objects {
            self.say(format!(" - {}  (size = {})", object.key, object.size));
        }

        Ok(Listing { step, objects })
    }

    async fn multipart_upload(&self, file: &Path) -> Result<UploadReport> {
        let source = FileSource::open(file)
            .await
            .map_err(|source| UploadError::Source {
                path: file.display().to_string(),
                source,
            })?;

        let report = Orchestrator::new(self.store.as_ref(), self.options.multipart)
            .with_cancellation(self.cancel.clone())
            .upload(
                &self.bucket,
                MULTIPART_KEY,
                &source,
                Some(detect_content_type(file)),
            )
            .await?;

        info!(
            "Uploaded {} in {} parts of {} bytes",
            MULTIPART_KEY, report.parts, report.part_size
        );
        Ok(report)
    }

    async fn managed_transfer(&self, file: &Path) -> Result<TransferOutcome> {
        let pb = if self.options.quiet {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
                    .progress_chars("#>-"),
            );
            pb
        };
        pb.set_message(TRANSFER_KEY);

        let bar = pb.clone();
        let outcome = TransferManager::new(self.store.clone(), self.options.transfer)
            .with_cancellation(self.cancel.clone())
            .with_progress(Arc::new(move |progress: &TransferProgress| {
                bar.set_length(progress.total_bytes);
                bar.set_position(progress.bytes_transferred);
            }))
            .upload_file(&self.bucket, TRANSFER_KEY, file)
            .await;

        match outcome {
            Ok(outcome) => {
                pb.finish_with_message(format!("Uploaded {}", TRANSFER_KEY));
                Ok(outcome)
            }
            Err(err) => {
                pb.abandon_with_message(format!("Failed {}", TRANSFER_KEY));
                Err(err.into())
            }
        }
    }

    async fn cleanup(&self) -> Result<()> {
        for key in [SAMPLE_KEY, MULTIPART_KEY, TRANSFER_KEY] {
            self.store
                .delete_object(&self.bucket, key)
                .await
                .with_context(|| format!("Failed to delete {}", key))?;
            self.say(format!(" - deleted {}", key));
        }

        self.store
            .delete_bucket(&self.bucket)
            .await
            .with_context(|| format!("Failed to delete bucket {}", self.bucket))?;
        self.say(format!(" - deleted bucket {}", self.bucket));

        Ok(())
    }

    /// Announce the next step, unless the walkthrough was cancelled
    fn step(&self, title: impl Display) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("Walkthrough cancelled before: {}", title);
        }
        self.say(format!("\n{}", style(title).cyan().bold()));
        Ok(())
    }

    fn say(&self, line: impl Display) {
        if !self.options.quiet {
            println!("{}", line);
        }
    }
}

fn write_sample_file() -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("s3sample-")
        .suffix(".txt")
        .tempfile()
        .context("Failed to create sample file")?;
    for line in SAMPLE_LINES {
        writeln!(file, "{}", line).context("Failed to write sample file")?;
    }
    file.flush().context("Failed to write sample file")?;

    Ok(file)
}

/// Describe the S3 failure behind `err`, if there is one
///
/// Rejections by the service carry the message, HTTP status, error code,
/// error type and request id. Anything else means the request never got an
/// answer.
pub fn explain(err: &anyhow::Error) -> Option<String> {
    let store_err = err.chain().find_map(|cause| {
        cause.downcast_ref::<StoreError>().or_else(|| {
            cause
                .downcast_ref::<UploadError>()
                .and_then(UploadError::store_error)
        })
    })?;

    let detail = match store_err {
        StoreError::Service {
            operation,
            code,
            message,
            status,
            request_id,
        } => format!(
            "The request was rejected by the service.\n  \
             Operation:        {}\n  \
             Error Message:    {}\n  \
             HTTP Status Code: {}\n  \
             Error Code:       {}\n  \
             Error Type:       {}\n  \
             Request ID:       {}",
            operation,
            message,
            status,
            code,
            store_err.error_type().unwrap_or("Unknown"),
            request_id.as_deref().unwrap_or("-")
        ),
        StoreError::Client { operation, message } => format!(
            "The client could not reach the service.\n  \
             Operation:     {}\n  \
             Error Message: {}",
            operation, message
        ),
    };

    let abort = err.chain().find_map(|cause| {
        cause
            .downcast_ref::<UploadError>()
            .and_then(UploadError::abort_error)
    });
    Some(match abort {
        Some(abort) => format!(
            "{}\nThe multipart upload could not be aborted either: {}",
            detail, abort
        ),
        None => detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::{MemoryStore, PartFailure};
    use crate::s3::transfer::TransferStrategy;

    const BUCKET: &str = "walkthrough-bucket";

    fn payload(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 13) as u8).collect();
        file.write_all(&data).unwrap();
        file
    }

    fn quiet_options(keep: bool) -> DemoOptions {
        DemoOptions {
            keep,
            quiet: true,
            multipart: MultipartConfig::builder()
                .min_part_size(1)
                .part_size(16)
                .concurrency(2)
                .build()
                .unwrap(),
            transfer: TransferConfig {
                multipart_threshold: 32,
                target_part_size: 24,
                concurrency: 2,
                min_part_size: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_walkthrough_cleans_up() {
        let store = Arc::new(MemoryStore::with_min_part_size(1));
        let file = payload(50);

        let report = Walkthrough::new(store.clone(), BUCKET, quiet_options(false))
            .run(file.path())
            .await
            .unwrap();

        assert!(report.bucket_created);
        assert_eq!(report.buckets.len(), 1);
        assert_eq!(report.sample_lines, SAMPLE_LINES);
        assert_eq!(report.sample_content_type.as_deref(), Some("text/plain"));
        assert_eq!(report.multipart.parts, 4);
        assert_eq!(report.comparison, FileComparison::Identical);
        assert!(matches!(
            report.transfer.as_ref().unwrap().strategy,
            TransferStrategy::Multipart { parts: 3, .. }
        ));
        assert!(report.transfer_error.is_none());

        let counts: Vec<usize> = report.listings.iter().map(|l| l.objects.len()).collect();
        assert_eq!(counts, vec![1, 2, 3]);

        assert!(report.cleaned_up);
        assert!(store.list_buckets().await.unwrap().is_empty());
        assert_eq!(store.pending_uploads(), 0);
        assert!(serde_json::to_string(&report).is_ok());
    }

    #[tokio::test]
    async fn test_walkthrough_keep_reuses_existing_bucket() {
        let store = Arc::new(MemoryStore::with_min_part_size(1));
        store.create_bucket(BUCKET).await.unwrap();
        let file = payload(20);

        let report = Walkthrough::new(store.clone(), BUCKET, quiet_options(true))
            .run(file.path())
            .await
            .unwrap();

        assert!(!report.bucket_created);
        assert!(!report.cleaned_up);
        assert_eq!(
            report.transfer.as_ref().unwrap().strategy,
            TransferStrategy::SinglePut
        );
        let keys: Vec<String> = store
            .list_objects(BUCKET, Some(LIST_PREFIX))
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec![SAMPLE_KEY, TRANSFER_KEY, MULTIPART_KEY]);
    }

    #[tokio::test]
    async fn test_failed_part_is_explained() {
        let store = Arc::new(MemoryStore::with_min_part_size(1));
        store.fail_part(2, 1);
        let file = payload(50);

        let err = Walkthrough::new(store.clone(), BUCKET, quiet_options(false))
            .run(file.path())
            .await
            .unwrap_err();

        let text = explain(&err).unwrap();
        assert!(text.contains("HTTP Status Code: 500"));
        assert!(text.contains("InternalError"));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfer_still_cleans_up() {
        let store = Arc::new(MemoryStore::with_min_part_size(1));
        // only the managed transfer has a seventh part
        store.fail_part(7, 1);
        let file = payload(50);
        let mut options = quiet_options(false);
        options.transfer.target_part_size = 7;

        let report = Walkthrough::new(store.clone(), BUCKET, options)
            .run(file.path())
            .await
            .unwrap();

        assert_eq!(report.multipart.parts, 4);
        assert!(report.transfer.is_none());
        assert!(report.transfer_error.as_deref().unwrap().contains("part 7"));

        let counts: Vec<usize> = report.listings.iter().map(|l| l.objects.len()).collect();
        assert_eq!(counts, vec![1, 2, 2]);

        assert!(report.cleaned_up);
        assert!(store.list_buckets().await.unwrap().is_empty());
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_walkthrough_stops_between_steps() {
        let store = Arc::new(MemoryStore::with_min_part_size(1));
        let file = payload(50);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Walkthrough::new(store.clone(), BUCKET, quiet_options(false))
            .with_cancellation(cancel)
            .run(file.path())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cancelled"));
        assert!(store.list_buckets().await.unwrap().is_empty());
    }

    #[test]
    fn test_explain_service_details() {
        let err = anyhow::Error::new(
            StoreError::service("PutObject", "AccessDenied", "Access Denied", 403)
                .with_request_id("4442587FB7D0A2F9"),
        )
        .context("Failed to upload");

        let text = explain(&err).unwrap();
        assert!(text.contains("Error Code:       AccessDenied"));
        assert!(text.contains("Error Type:       Client"));
        assert!(text.contains("Request ID:       4442587FB7D0A2F9"));
    }

    #[test]
    fn test_explain_mentions_failed_abort() {
        let err = anyhow::Error::new(UploadError::AbortFailed {
            upload_id: "u-9".to_string(),
            cause: Box::new(UploadError::PartUpload {
                upload_id: "u-9".to_string(),
                part_number: 3,
                source: PartFailure::Store(StoreError::service(
                    "UploadPart",
                    "InternalError",
                    "We encountered an internal error",
                    500,
                )),
            }),
            abort: StoreError::service("AbortMultipartUpload", "AccessDenied", "denied", 403),
        });

        let text = explain(&err).unwrap();
        assert!(text.contains("Error Code:       InternalError"));
        assert!(text.contains("Error Type:       Service"));
        assert!(text.contains("could not be aborted either"));
    }

    #[test]
    fn test_explain_ignores_local_errors() {
        let err = anyhow::anyhow!("disk on fire");
        assert!(explain(&err).is_none());
    }
}
