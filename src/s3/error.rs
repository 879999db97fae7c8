use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::RequestId;
use std::io;
use thiserror::Error;

use super::multipart::SessionState;

/// Errors returned by an [`ObjectStore`](super::store::ObjectStore) call
#[derive(Error, Debug)]
pub enum StoreError {
    /// The request reached the service and was rejected
    #[error("{operation} rejected by service (HTTP {status}, {code}): {message}")]
    Service {
        operation: &'static str,
        code: String,
        message: String,
        status: u16,
        request_id: Option<String>,
    },

    /// The request failed before a response was received
    #[error("{operation} failed: {message}")]
    Client {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn service(
        operation: &'static str,
        code: impl Into<String>,
        message: impl Into<String>,
        status: u16,
    ) -> Self {
        Self::Service {
            operation,
            code: code.into(),
            message: message.into(),
            status,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        if let Self::Service { request_id, .. } = &mut self {
            *request_id = Some(id.into());
        }
        self
    }

    pub fn client(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Client {
            operation,
            message: message.into(),
        }
    }

    /// Convert an AWS SDK error, keeping the service error code and HTTP status
    pub fn from_sdk<E>(operation: &'static str, err: SdkError<E>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        match &err {
            SdkError::ServiceError(ctx) => Self::Service {
                operation,
                code: ctx.err().code().unwrap_or("Unknown").to_string(),
                message: ctx
                    .err()
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
                status: ctx.raw().status().as_u16(),
                request_id: ctx
                    .err()
                    .meta()
                    .request_id()
                    .or_else(|| ctx.raw().headers().get("x-amz-request-id"))
                    .map(str::to_string),
            },
            _ => Self::Client {
                operation,
                message: DisplayErrorContext(&err).to_string(),
            },
        }
    }

    /// Service error code, if the service answered
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code),
            Self::Client { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            Self::Client { .. } => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Service { request_id, .. } => request_id.as_deref(),
            Self::Client { .. } => None,
        }
    }

    /// "Client" for 4xx rejections, "Service" for 5xx
    pub fn error_type(&self) -> Option<&'static str> {
        self.status()
            .map(|status| if status >= 500 { "Service" } else { "Client" })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code(),
            Some("NotFound" | "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload")
        )
    }

    /// Throttling, server-side and transport failures can be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Client { .. } => true,
            Self::Service { status, code, .. } => {
                *status >= 500
                    || *status == 429
                    || matches!(code.as_str(), "SlowDown" | "RequestTimeout")
            }
        }
    }
}

/// Why a single part failed
#[derive(Error, Debug)]
pub enum PartFailure {
    #[error("failed to read part bytes from source")]
    Read(#[source] io::Error),

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ETag mismatch: computed {expected}, service returned {actual}")]
    ETagMismatch { expected: String, actual: String },

    #[error("part is not in the upload plan")]
    NotPlanned,
}

/// Why a completion manifest was refused
#[derive(Error, Debug)]
pub enum CompletionFailure {
    #[error("manifest lists {received} parts but {expected} were planned")]
    Incomplete { expected: usize, received: usize },

    #[error("part {next} is listed after part {previous}")]
    OutOfOrder { previous: i32, next: i32 },

    #[error("part {0} is listed more than once")]
    Duplicate(i32),

    #[error("part {0} is not in the upload plan")]
    UnknownPart(i32),

    #[error("service rejected the manifest")]
    Rejected(#[source] StoreError),
}

/// Errors that can occur during an upload
#[derive(Error, Debug)]
pub enum UploadError {
    /// Invalid part size, concurrency or plan; raised before any network call
    #[error("invalid upload configuration: {0}")]
    Configuration(String),

    /// The store could not allocate an upload id
    #[error("failed to initiate multipart upload for s3://{bucket}/{key}")]
    Initiation {
        bucket: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to upload part {part_number} of upload {upload_id}")]
    PartUpload {
        upload_id: String,
        part_number: i32,
        #[source]
        source: PartFailure,
    },

    #[error("failed to complete multipart upload {upload_id}")]
    Completion {
        upload_id: String,
        #[source]
        source: CompletionFailure,
    },

    #[error("failed to abort multipart upload {upload_id}")]
    Abort {
        upload_id: String,
        #[source]
        source: StoreError,
    },

    #[error("multipart upload {upload_id} is already {state}")]
    SessionClosed {
        upload_id: String,
        state: SessionState,
    },

    #[error("multipart upload {upload_id} was cancelled")]
    Cancelled { upload_id: String },

    #[error("failed to put s3://{bucket}/{key}")]
    PutObject {
        bucket: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to access local file {path}")]
    Source {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The upload failed and the abort that followed failed too; the
    /// multipart upload is still open on the service
    #[error("{cause} (abort of multipart upload {upload_id} also failed: {abort})")]
    AbortFailed {
        upload_id: String,
        #[source]
        cause: Box<UploadError>,
        abort: StoreError,
    },
}

impl UploadError {
    /// Whether repeating the failed step (or the whole upload) may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AbortFailed { cause, .. } => cause.is_retryable(),
            Self::Initiation { .. } | Self::Abort { .. } => true,
            Self::PartUpload { source, .. } => !matches!(source, PartFailure::NotPlanned),
            Self::PutObject { source, .. } => source.is_retryable(),
            Self::Configuration(_)
            | Self::Completion { .. }
            | Self::SessionClosed { .. }
            | Self::Cancelled { .. }
            | Self::Source { .. } => false,
        }
    }

    /// Part number of the failing part, for part upload errors
    pub fn failed_part(&self) -> Option<i32> {
        match self {
            Self::PartUpload { part_number, .. } => Some(*part_number),
            Self::AbortFailed { cause, .. } => cause.failed_part(),
            _ => None,
        }
    }

    /// The store error underneath this failure, if any
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::AbortFailed { cause, .. } => cause.store_error(),
            Self::Initiation { source, .. }
            | Self::Abort { source, .. }
            | Self::PutObject { source, .. } => Some(source),
            Self::PartUpload {
                source: PartFailure::Store(source),
                ..
            } => Some(source),
            Self::Completion {
                source: CompletionFailure::Rejected(source),
                ..
            } => Some(source),
            _ => None,
        }
    }

    /// The failed abort, if the upload was left open on the service
    pub fn abort_error(&self) -> Option<&StoreError> {
        match self {
            Self::AbortFailed { abort, .. } => Some(abort),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration(message) => {
                format!(
                    "Invalid configuration: {}\n\nPossible solutions:\n  \
                     1. Use a part size of at least 5 MiB (S3_PART_SIZE)\n  \
                     2. Use a concurrency of at least 1 (S3_CONCURRENCY)",
                    message
                )
            }
            Self::Initiation { bucket, source, .. } => {
                format!(
                    "Could not start a multipart upload in bucket '{}': {}\n\nPossible solutions:\n  \
                     1. Check your credentials (S3_ACCESS_KEY / S3_SECRET_KEY or AWS_PROFILE)\n  \
                     2. Ensure the bucket exists and S3_ENDPOINT points at the right service\n  \
                     3. Retry the upload",
                    bucket, source
                )
            }
            Self::PartUpload {
                part_number,
                source,
                ..
            } => {
                format!(
                    "Part {} failed: {}\n\nPossible solutions:\n  \
                     1. Check your network connection\n  \
                     2. Try again with --concurrency 1\n  \
                     3. Retry: the upload was aborted, nothing was left behind",
                    part_number, source
                )
            }
            Self::Source { path, source } => match source.kind() {
                io::ErrorKind::NotFound => format!(
                    "File not found: {}\n\nPossible solutions:\n  \
                     1. Check if the file path is correct\n  \
                     2. Verify the file exists: ls -la {}",
                    path, path
                ),
                io::ErrorKind::PermissionDenied => format!(
                    "Permission denied: {}\n\nPossible solutions:\n  \
                     1. Check file permissions: ls -l {}\n  \
                     2. Ensure you have read access to the file",
                    path, path
                ),
                _ => self.to_string(),
            },
            Self::AbortFailed {
                upload_id,
                cause,
                abort,
            } => {
                format!(
                    "{}\n\nThe multipart upload {} could not be aborted ({}) and still holds its parts.\n  \
                     Remove it with: aws s3api abort-multipart-upload --upload-id {}",
                    cause.user_message(),
                    upload_id,
                    abort,
                    upload_id
                )
            }
            _ => self.to_string(),
        }
    }
}
