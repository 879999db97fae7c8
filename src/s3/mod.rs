pub mod client;
pub mod compare;
pub mod error;
pub mod helpers;
pub mod memory;
pub mod multipart;
pub mod source;
pub mod store;
pub mod transfer;
pub mod upload;

pub use client::S3Client;
pub use compare::{FileComparison, compare_file};
pub use error::{CompletionFailure, PartFailure, StoreError, UploadError};
pub use memory::MemoryStore;
pub use multipart::{MultipartConfig, Orchestrator, ProgressCallback, TransferProgress, UploadReport};
pub use source::{ByteSource, FileSource};
pub use store::{BucketInfo, ObjectData, ObjectIdentity, ObjectStore, ObjectSummary};
pub use transfer::{TransferConfig, TransferManager, TransferOutcome, TransferStrategy};
pub use upload::put_file;
