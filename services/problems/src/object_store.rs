use crate::config::S3Config;
use crate::error::{ProblemError, Result};
use crate::models::{content_type_for, ObjectStream, StoredObject};
use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument, warn};

/// Put, get and list-by-bucket against an object store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` at `key`, replacing any existing object
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// Every key in the bucket (first page only)
    async fn list(&self, bucket: &str) -> Result<Vec<String>>;

    /// Open an object for streaming
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject>;

    /// Cheap reachability check
    async fn ping(&self, bucket: &str) -> Result<()>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 client from the default AWS credential chain
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        anyhow::ensure!(
            config.part_size_bytes >= 5 * 1024 * 1024,
            "s3.part_size_bytes must be at least 5MB"
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Single-part upload for small files
    async fn simple_upload(&self, bucket: &str, key: &str, body: Bytes) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type_for(key))
            .send()
            .await
            .context("Failed to upload object to S3")?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, bucket: &str, key: &str, body: Bytes) -> anyhow::Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?;

        match self.upload_parts(bucket, key, upload_id, &body).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;

                Ok(())
            }
            Err(e) => {
                // Orphaned parts are billed until aborted
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        body: &Bytes,
    ) -> anyhow::Result<Vec<CompletedPart>> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in body.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice_ref(chunk)))
                .send()
                .await
                .with_context(|| format!("Failed to upload part {part_number}"))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

/// Adapt an SDK byte stream to a boxed stream of io results
fn byte_stream_to_object_stream(body: ByteStream) -> ObjectStream {
    Box::pin(futures::stream::unfold(body, |mut body| async move {
        body.next()
            .await
            .map(|chunk| (chunk.map_err(std::io::Error::other), body))
    }))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let size = body.len();

        let result = if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(bucket, key, body).await
        } else {
            self.simple_upload(bucket, key, body).await
        };

        result.map_err(|e| ProblemError::storage(format!("upload {key}"), e))?;

        debug!(key = %key, size_bytes = size, "Object uploaded to S3");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, bucket: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .send()
            .await
            .context("Failed to list objects in bucket")
            .map_err(|e| ProblemError::storage("list files", e))?;

        if response.is_truncated().unwrap_or(false) {
            warn!(bucket = %bucket, "Object listing truncated to the first page");
        }

        Ok(response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect())
    }

    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(ProblemError::NotFound(key.to_string()));
                }
                return Err(ProblemError::storage(
                    format!("download {key}"),
                    anyhow::Error::new(e).context("Failed to get object from S3"),
                ));
            }
        };

        let content_type = output
            .content_type()
            .map(String::from)
            .unwrap_or_else(|| content_type_for(key).to_string());
        let content_length = output.content_length().and_then(|len| u64::try_from(len).ok());

        Ok(StoredObject {
            key: key.to_string(),
            content_type,
            content_length,
            body: byte_stream_to_object_stream(output.body),
        })
    }

    async fn ping(&self, bucket: &str) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .context("Failed to reach S3 bucket")
            .map_err(|e| ProblemError::storage("reach object store", e))?;

        Ok(())
    }
}

/// Object store held in process memory, keyed by bucket then key
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn list(&self, bucket: &str) -> Result<Vec<String>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        let data = self
            .buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
            .ok_or_else(|| ProblemError::NotFound(key.to_string()))?;

        Ok(StoredObject {
            key: key.to_string(),
            content_type: content_type_for(key).to_string(),
            content_length: Some(data.len() as u64),
            body: Box::pin(futures::stream::once(async move { Ok(data) })),
        })
    }

    async fn ping(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }
}
