use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{CompletionFailure, PartFailure, UploadError};
use super::source::ByteSource;
use super::store::{ObjectIdentity, ObjectStore};

// S3 minimum for every part except the last (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

// S3 maximum part size (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts that a single S3 multipart upload supports
pub const MAX_PARTS: u64 = 10_000;

pub const DEFAULT_PART_SIZE: u64 = 10_000_000;

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Validated settings for a multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartConfig {
    part_size: u64,
    concurrency: usize,
    verify_etag: bool,
}

impl MultipartConfig {
    /// Part size and concurrency checked against the S3 limits
    pub fn new(part_size: u64, concurrency: usize) -> Result<Self, UploadError> {
        Self::builder()
            .part_size(part_size)
            .concurrency(concurrency)
            .build()
    }

    pub fn builder() -> MultipartConfigBuilder {
        MultipartConfigBuilder::default()
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn verify_etag(&self) -> bool {
        self.verify_etag
    }

    /// Plan the parts for an object of `total_size` bytes
    pub fn plan(&self, total_size: u64) -> Result<Vec<PartDescriptor>, UploadError> {
        if total_size == 0 {
            return Err(UploadError::Configuration(
                "cannot multipart-upload an empty object, use a single put".to_string(),
            ));
        }

        let count = total_size.div_ceil(self.part_size);
        if count > MAX_PARTS {
            return Err(UploadError::Configuration(format!(
                "{} bytes at {} bytes per part needs {} parts (max {})",
                total_size, self.part_size, count, MAX_PARTS
            )));
        }

        Ok(plan_parts(total_size, self.part_size))
    }
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            verify_etag: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultipartConfigBuilder {
    part_size: u64,
    concurrency: usize,
    verify_etag: bool,
    min_part_size: u64,
}

impl Default for MultipartConfigBuilder {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            verify_etag: false,
            min_part_size: MIN_PART_SIZE,
        }
    }
}

impl MultipartConfigBuilder {
    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Maximum number of parts in flight at once
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Compare each part ETag with the MD5 of its bytes
    ///
    /// Only meaningful for services that return plain MD5 ETags (not SSE-KMS,
    /// not most S3 proxies).
    pub fn verify_etag(mut self, verify_etag: bool) -> Self {
        self.verify_etag = verify_etag;
        self
    }

    /// Minimum part size imposed by the target service (5 MiB for S3)
    pub fn min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn build(self) -> Result<MultipartConfig, UploadError> {
        if self.part_size == 0 || self.part_size < self.min_part_size {
            return Err(UploadError::Configuration(format!(
                "part size {} is below the service minimum of {} bytes",
                self.part_size,
                self.min_part_size.max(1)
            )));
        }

        if self.part_size > MAX_PART_SIZE {
            return Err(UploadError::Configuration(format!(
                "part size {} exceeds the maximum of {} bytes",
                self.part_size, MAX_PART_SIZE
            )));
        }

        if self.concurrency == 0 {
            return Err(UploadError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }

        Ok(MultipartConfig {
            part_size: self.part_size,
            concurrency: self.concurrency,
            verify_etag: self.verify_etag,
        })
    }
}

/// A contiguous byte range of the source, uploaded as one part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartDescriptor {
    // 1-indexed
    pub part_number: i32,
    pub offset: u64,
    pub length: u64,
}

/// Split `total_size` bytes into parts of `part_size`
///
/// Every part but the last is exactly `part_size` bytes; the last holds the
/// remainder and is never empty. An object no larger than `part_size` is a
/// single part, and an empty object has no parts.
///
/// # Panics
///
/// Panics if `part_size` is zero.
pub fn plan_parts(total_size: u64, part_size: u64) -> Vec<PartDescriptor> {
    assert!(part_size > 0, "part size must be non-zero");

    let count = total_size.div_ceil(part_size);
    (0..count)
        .map(|index| {
            let offset = index * part_size;
            PartDescriptor {
                part_number: index as i32 + 1,
                offset,
                length: part_size.min(total_size - offset),
            }
        })
        .collect()
}

/// A successfully uploaded part
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartResult {
    pub part_number: i32,
    pub e_tag: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    Completing = 1,
    Completed = 2,
    Aborted = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Completing,
            2 => Self::Completed,
            _ => Self::Aborted,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Server-side multipart upload opened by [`begin_upload`]
///
/// Owned by the call that created it. Once completed or aborted, no further
/// parts are accepted.
#[derive(Debug)]
pub struct UploadSession {
    bucket: String,
    key: String,
    upload_id: String,
    total_size: u64,
    part_size: u64,
    parts: Vec<PartDescriptor>,
    state: AtomicU8,
}

impl UploadSession {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// The planned parts, ordered by part number
    pub fn parts(&self) -> &[PartDescriptor] {
        &self.parts
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    fn closed(&self, state: SessionState) -> UploadError {
        UploadError::SessionClosed {
            upload_id: self.upload_id.clone(),
            state,
        }
    }

    fn ensure_open(&self) -> Result<(), UploadError> {
        match self.state() {
            SessionState::Open => Ok(()),
            state => Err(self.closed(state)),
        }
    }

    fn planned(&self, part_number: i32) -> Option<&PartDescriptor> {
        let index = usize::try_from(part_number).ok()?.checked_sub(1)?;
        self.parts.get(index)
    }
}

/// Ordered part list submitted to [`complete_upload`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionManifest {
    parts: Vec<PartResult>,
}

impl CompletionManifest {
    /// Wrap a caller-supplied list as is; it is checked on completion
    pub fn new(parts: Vec<PartResult>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[PartResult] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn validate(&self, session: &UploadSession) -> Result<(), CompletionFailure> {
        let mut previous: Option<i32> = None;
        for part in &self.parts {
            if session.planned(part.part_number).is_none() {
                return Err(CompletionFailure::UnknownPart(part.part_number));
            }

            if let Some(previous) = previous {
                if part.part_number == previous {
                    return Err(CompletionFailure::Duplicate(previous));
                }
                if part.part_number < previous {
                    return Err(CompletionFailure::OutOfOrder {
                        previous,
                        next: part.part_number,
                    });
                }
            }
            previous = Some(part.part_number);
        }

        if self.parts.len() != session.parts.len() {
            return Err(CompletionFailure::Incomplete {
                expected: session.parts.len(),
                received: self.parts.len(),
            });
        }

        Ok(())
    }
}

/// Collects part results in part-number order
///
/// Recording a part number again replaces the earlier result, so a re-uploaded
/// part simply wins.
#[derive(Debug, Default)]
pub struct PartTracker {
    results: BTreeMap<i32, PartResult>,
}

impl PartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the replaced result if the part number was already recorded
    pub fn record(&mut self, result: PartResult) -> Option<PartResult> {
        self.results.insert(result.part_number, result)
    }

    /// Planned part numbers without a result yet
    pub fn missing(&self, session: &UploadSession) -> Vec<i32> {
        session
            .parts()
            .iter()
            .map(|part| part.part_number)
            .filter(|number| !self.results.contains_key(number))
            .collect()
    }

    pub fn bytes_recorded(&self) -> u64 {
        self.results.values().map(|part| part.size).sum()
    }

    pub fn into_manifest(self) -> CompletionManifest {
        CompletionManifest::new(self.results.into_values().collect())
    }
}

/// Open a multipart upload session
///
/// The parts are planned first, so a bad configuration fails before any
/// request is sent.
pub async fn begin_upload(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    total_size: u64,
    config: &MultipartConfig,
    content_type: Option<&str>,
) -> Result<UploadSession, UploadError> {
    let parts = config.plan(total_size)?;

    let upload_id = store
        .create_multipart_upload(bucket, key, content_type)
        .await
        .map_err(|source| UploadError::Initiation {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        })?;

    debug!("Multipart upload initiated with ID: {}", upload_id);

    Ok(UploadSession {
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id,
        total_size,
        part_size: config.part_size(),
        parts,
        state: AtomicU8::new(SessionState::Open as u8),
    })
}

/// Upload the bytes of one planned part
///
/// No retry happens here. Calling this again for the same part replaces the
/// earlier upload on the service side.
pub async fn upload_part(
    store: &dyn ObjectStore,
    session: &UploadSession,
    part: &PartDescriptor,
    source: &dyn ByteSource,
    verify_etag: bool,
) -> Result<PartResult, UploadError> {
    session.ensure_open()?;

    let fail = |source: PartFailure| UploadError::PartUpload {
        upload_id: session.upload_id.clone(),
        part_number: part.part_number,
        source,
    };

    if session.planned(part.part_number) != Some(part) {
        return Err(fail(PartFailure::NotPlanned));
    }

    let body = source
        .read_range(part.offset, part.length)
        .await
        .map_err(|err| fail(PartFailure::Read(err)))?;
    if body.len() as u64 != part.length {
        return Err(fail(PartFailure::ShortRead {
            expected: part.length,
            actual: body.len() as u64,
        }));
    }

    let expected_e_tag = verify_etag.then(|| format!("{:x}", Md5::digest(&body)));

    // the session may have been closed while the range was read
    session.ensure_open()?;

    debug!("Uploading part {} ({} bytes)", part.part_number, part.length);

    let e_tag = store
        .upload_part(
            &session.bucket,
            &session.key,
            &session.upload_id,
            part.part_number,
            body,
        )
        .await
        .map_err(|err| fail(PartFailure::Store(err)))?;

    if let Some(expected) = expected_e_tag {
        let actual = e_tag.trim_matches('"');
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(fail(PartFailure::ETagMismatch {
                expected,
                actual: actual.to_string(),
            }));
        }
    }

    Ok(PartResult {
        part_number: part.part_number,
        e_tag,
        size: part.length,
    })
}

/// Commit the upload with an ordered, complete manifest
///
/// The manifest is checked locally before it is sent. A rejected manifest
/// leaves the session open so it can be aborted.
pub async fn complete_upload(
    store: &dyn ObjectStore,
    session: &UploadSession,
    manifest: CompletionManifest,
) -> Result<ObjectIdentity, UploadError> {
    let fail = |source: CompletionFailure| UploadError::Completion {
        upload_id: session.upload_id.clone(),
        source,
    };

    manifest.validate(session).map_err(fail)?;
    session
        .transition(SessionState::Open, SessionState::Completing)
        .map_err(|state| session.closed(state))?;

    match store
        .complete_multipart_upload(
            &session.bucket,
            &session.key,
            &session.upload_id,
            manifest.parts(),
        )
        .await
    {
        Ok(identity) => {
            session.set_state(SessionState::Completed);
            info!(
                "Multipart upload completed: s3://{}/{} ({} parts)",
                session.bucket,
                session.key,
                manifest.len()
            );
            Ok(identity)
        }
        Err(err) => {
            session.set_state(SessionState::Open);
            Err(fail(CompletionFailure::Rejected(err)))
        }
    }
}

/// Abort a multipart upload and release its parts
///
/// Safe to call more than once.
pub async fn abort_upload(
    store: &dyn ObjectStore,
    session: &UploadSession,
) -> Result<(), UploadError> {
    match session.state() {
        SessionState::Open => {}
        SessionState::Aborted => {
            debug!("Multipart upload {} already aborted", session.upload_id);
            return Ok(());
        }
        state => return Err(session.closed(state)),
    }

    store
        .abort_multipart_upload(&session.bucket, &session.key, &session.upload_id)
        .await
        .map_err(|source| UploadError::Abort {
            upload_id: session.upload_id.clone(),
            source,
        })?;

    session.set_state(SessionState::Aborted);
    debug!("Aborted multipart upload {}", session.upload_id);

    Ok(())
}

/// Reported after each part finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub part_number: i32,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Summary of a completed multipart upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub identity: ObjectIdentity,
    pub upload_id: String,
    pub parts: usize,
    pub part_size: u64,
    pub bytes: u64,
    // ordered by part number
    pub part_results: Vec<PartResult>,
}

/// Drives a multipart upload from start to finish
///
/// Parts go out concurrently up to the configured limit. Any failure or
/// cancellation aborts the server-side upload before the error is returned.
/// If that abort fails too, the error is [`UploadError::AbortFailed`] wrapping
/// the original failure.
pub struct Orchestrator<'a> {
    store: &'a dyn ObjectStore,
    config: MultipartConfig,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: MultipartConfig) -> Self {
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

    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        source: &dyn ByteSource,
        content_type: Option<&str>,
    ) -> Result<UploadReport, UploadError> {
        let total_size = source.size();
        let session = begin_upload(
            self.store,
            bucket,
            key,
            total_size,
            &self.config,
            content_type,
        )
        .await?;

        info!(
            "Starting multipart upload for s3://{}/{} ({} bytes, {} parts)",
            bucket,
            key,
            total_size,
            session.parts().len()
        );

        let tracker = match self.upload_parts(&session, source).await {
            Ok(tracker) => tracker,
            Err(err) => return Err(self.abort_after_failure(&session, err).await),
        };

        let manifest = tracker.into_manifest();
        let parts = manifest.len();
        let part_results = manifest.parts().to_vec();
        debug!("All {} parts uploaded, completing multipart upload", parts);

        match complete_upload(self.store, &session, manifest).await {
            Ok(identity) => Ok(UploadReport {
                identity,
                upload_id: session.upload_id().to_string(),
                parts,
                part_size: session.part_size(),
                bytes: total_size,
                part_results,
            }),
            Err(err) => Err(self.abort_after_failure(&session, err).await),
        }
    }

    async fn upload_parts(
        &self,
        session: &UploadSession,
        source: &dyn ByteSource,
    ) -> Result<PartTracker, UploadError> {
        let verify_etag = self.config.verify_etag();
        let mut uploads = stream::iter(session.parts())
            .map(|part| upload_part(self.store, session, part, source, verify_etag))
            .buffer_unordered(self.config.concurrency());

        let mut tracker = PartTracker::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("Multipart upload {} cancelled", session.upload_id());
                    return Err(UploadError::Cancelled {
                        upload_id: session.upload_id().to_string(),
                    });
                }
                next = uploads.next() => next,
            };

            let Some(result) = next else { break };
            let part = result?;
            let part_number = part.part_number;
            if tracker.record(part).is_some() {
                warn!("Part {} recorded twice, keeping the latest", part_number);
            }

            if let Some(progress) = &self.progress {
                progress(&TransferProgress {
                    part_number,
                    bytes_transferred: tracker.bytes_recorded(),
                    total_bytes: session.total_size(),
                });
            }
        }

        let missing = tracker.missing(session);
        if !missing.is_empty() {
            return Err(UploadError::Completion {
                upload_id: session.upload_id().to_string(),
                source: CompletionFailure::Incomplete {
                    expected: session.parts().len(),
                    received: session.parts().len() - missing.len(),
                },
            });
        }

        Ok(tracker)
    }

    async fn abort_after_failure(&self, session: &UploadSession, cause: UploadError) -> UploadError {
        error!(
            "Multipart upload {} failed, aborting: {}",
            session.upload_id(),
            cause
        );

        match abort_upload(self.store, session).await {
            Ok(()) => cause,
            Err(UploadError::Abort { upload_id, source }) => {
                error!(
                    "Multipart upload {} left open, abort failed: {}",
                    upload_id, source
                );
                UploadError::AbortFailed {
                    upload_id,
                    cause: Box::new(cause),
                    abort: source,
                }
            }
            Err(abort_err) => {
                error!("{}", abort_err);
                cause
            }
        }
    }
}
