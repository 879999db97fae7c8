use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::{ByteStream, DateTimeFormat};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use tracing::debug;

use super::error::StoreError;
use super::multipart::PartResult;
use super::store::{BucketInfo, ObjectData, ObjectIdentity, ObjectStore, ObjectSummary};
use crate::config::Config;

// Buckets in this region are created without a location constraint
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Clone)]
pub struct S3Client {
    client: Client,
    pub config: Config,
}

impl S3Client {
    pub async fn new(config: Config) -> Result<Self> {
        let mut aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(profile) = &config.profile {
            aws_config = aws_config.profile_name(profile);
        }

        if let Some(credentials) = &config.credentials {
            aws_config = aws_config.credentials_provider(Credentials::new(
                credentials.access_key.clone(),
                credentials.secret_key.clone(),
                None,
                None,
                "s3sample-static",
            ));
        }

        let sdk_config = aws_config.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config.build());
        debug!(
            "S3 client ready (region: {}, endpoint: {})",
            config.region,
            config.endpoint.as_deref().unwrap_or("default")
        );

        Ok(Self { client, config })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if self.config.endpoint.is_none() && self.config.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(
                        self.config.region.as_str(),
                    ))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("CreateBucket", err))?;
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StoreError> {
        let resp = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("ListBuckets", err))?;

        Ok(resp
            .buckets()
            .iter()
            .map(|bucket| BucketInfo {
                name: bucket.name().unwrap_or_default().to_string(),
                created: bucket
                    .creation_date()
                    .and_then(|date| date.fmt(DateTimeFormat::DateTime).ok()),
            })
            .collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("DeleteBucket", err))?;
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectIdentity, StoreError> {
        let content_length = body.len() as i64;
        let resp = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_length(content_length)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("PutObject", err))?;

        Ok(ObjectIdentity {
            bucket: bucket.to_string(),
            key: key.to_string(),
            e_tag: resp.e_tag().map(str::to_string),
            version_id: resp.version_id().map(str::to_string),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectData, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("GetObject", err))?;

        let content_type = resp.content_type().map(str::to_string);
        let body = resp
            .body
            .collect()
            .await
            .map_err(|err| StoreError::client("GetObject", err.to_string()))?
            .into_bytes()
            .to_vec();

        Ok(ObjectData { content_type, body })
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectSummary>, StoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => Ok(Some(ObjectSummary {
                key: key.to_string(),
                size: head.content_length().unwrap_or(0) as u64,
                e_tag: head.e_tag().map(str::to_string),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(StoreError::from_sdk("HeadObject", err)),
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, StoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.map(str::to_string))
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| StoreError::from_sdk("ListObjectsV2", err))?;
            objects.extend(page.contents().iter().map(|object| ObjectSummary {
                key: object.key().unwrap_or_default().to_string(),
                size: object.size().unwrap_or(0) as u64,
                e_tag: object.e_tag().map(str::to_string),
            }));
        }

        Ok(objects)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("DeleteObject", err))?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, StoreError> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("CreateMultipartUpload", err))?;

        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::client("CreateMultipartUpload", "no upload ID returned"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, StoreError> {
        let content_length = body.len() as i64;
        let resp = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(content_length)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("UploadPart", err))?;

        resp.e_tag()
            .map(str::to_string)
            .ok_or_else(|| StoreError::client("UploadPart", "no ETag returned"))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<ObjectIdentity, StoreError> {
        let completed = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.e_tag)
                    .build()
            })
            .collect();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| StoreError::from_sdk("CompleteMultipartUpload", err))?;

        Ok(ObjectIdentity {
            bucket: bucket.to_string(),
            key: key.to_string(),
            e_tag: resp.e_tag().map(str::to_string),
            version_id: resp.version_id().map(str::to_string),
        })
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => match StoreError::from_sdk("AbortMultipartUpload", err) {
                // already released
                err if err.code() == Some("NoSuchUpload") => Ok(()),
                err => Err(err),
            },
        }
    }
}
