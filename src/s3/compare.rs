use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use super::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileComparison {
    /// Object doesn't exist on S3
    NotFound,
    /// Same size on both sides
    Identical,
    /// Sizes differ
    Different,
}

/// Compare local file with remote S3 object
///
/// Only sizes are compared: a multipart ETag is not the MD5 of the content.
pub async fn compare_file(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    local_path: &Path,
) -> Result<FileComparison> {
    let local_size = tokio::fs::metadata(local_path)
        .await
        .with_context(|| format!("Failed to stat {}", local_path.display()))?
        .len();

    let remote = store
        .head_object(bucket, key)
        .await
        .with_context(|| format!("Failed to inspect s3://{}/{}", bucket, key))?;

    Ok(match remote {
        None => FileComparison::NotFound,
        Some(object) if object.size == local_size => FileComparison::Identical,
        Some(_) => FileComparison::Different,
    })
}
