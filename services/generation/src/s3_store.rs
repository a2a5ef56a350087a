use crate::artifact_store::{ObjectStore, StorageError};
use crate::config::S3Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Artifacts are content-addressed by a random key and never rewritten
pub const ARTIFACT_CACHE_CONTROL: &str = "private, max-age=31536000, immutable";

/// S3-compatible object store for durable artifacts
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Static keys take precedence over the provider chain (MinIO)
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "generation-config",
            ));
        }

        let client = S3Client::from_conf(Self::apply_endpoint(s3_config_builder, config).build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = config.endpoint_url.as_deref().unwrap_or("default"),
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Build a client without touching the environment's provider chain
    #[cfg(test)]
    pub(crate) fn with_static_credentials(config: &S3Config, access_key: &str, secret_key: &str) -> Self {
        let builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "generation-static",
            ));

        Self {
            client: S3Client::from_conf(Self::apply_endpoint(builder, config).build()),
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    fn apply_endpoint(mut builder: S3ConfigBuilder, config: &S3Config) -> S3ConfigBuilder {
        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        builder
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .cache_control(ARTIFACT_CACHE_CONTROL)
            .send()
            .await
            .map_err(|e| StorageError::Upload(format!("put_object {key}: {e}")))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .cache_control(ARTIFACT_CACHE_CONTROL)
            .send()
            .await
            .map_err(|e| StorageError::Upload(format!("create_multipart_upload {key}: {e}")))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Upload("No upload ID in response".to_string()))?
            .to_string();

        let result = self.upload_parts(key, &upload_id, &bytes).await;
        if result.is_err() {
            self.abort_multipart_upload(key, &upload_id).await;
        }

        result
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.config.part_size_bytes.max(1)).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| StorageError::Upload(format!("upload_part {part_number} of {key}: {e}")))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| StorageError::Upload(format!("complete_multipart_upload {key}: {e}")))?;

        Ok(())
    }

    /// Drop the parts of an unfinished upload so they are not billed
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => debug!(key = %key, upload_id = %upload_id, "Aborted multipart upload"),
            Err(e) => warn!(key = %key, upload_id = %upload_id, error = %e, "Failed to abort multipart upload"),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        debug!(key = %key, bucket = %self.bucket, "Uploading artifact to S3");

        if bytes.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, bytes, content_type).await
        } else {
            self.simple_upload(key, bytes, content_type).await
        }
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning_config =
            PresigningConfig::expires_in(ttl).map_err(|e| StorageError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::Presign(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{Method, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::Router;
    use std::sync::{Arc, Mutex};

    fn minio_config() -> S3Config {
        S3Config {
            endpoint_url: Some("http://minio:9000".to_string()),
            bucket: "generated".to_string(),
            force_path_style: true,
            ..S3Config::default()
        }
    }

    #[tokio::test]
    async fn test_presign_is_offline_and_bounded() {
        let store = S3ObjectStore::with_static_credentials(&minio_config(), "minio", "minio-secret");

        let url = store
            .presign_get("generated/no-project/abc.png", Duration::from_secs(600))
            .await
            .unwrap();

        assert!(url.starts_with("http://minio:9000/generated/generated/no-project/abc.png?"));
        assert!(url.contains("X-Amz-Expires=600"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_presign_varies_with_ttl() {
        let store = S3ObjectStore::with_static_credentials(&minio_config(), "minio", "minio-secret");
        let key = "generated/project/abc.png";

        let short = store.presign_get(key, Duration::from_secs(60)).await.unwrap();
        let long = store.presign_get(key, Duration::from_secs(3600)).await.unwrap();

        assert_ne!(short, long);
        assert!(short.contains(key) && long.contains(key));
    }

    #[tokio::test]
    async fn test_presign_rejects_expiry_beyond_a_week() {
        let store = S3ObjectStore::with_static_credentials(&minio_config(), "minio", "minio-secret");
        let err = store
            .presign_get("k.png", Duration::from_secs(8 * 24 * 60 * 60))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Presign(_)));
    }

    #[derive(Clone, Default)]
    struct RequestLog(Arc<Mutex<Vec<String>>>);

    async fn failing_part_upload(
        State(log): State<RequestLog>,
        method: Method,
        uri: Uri,
        _body: Bytes,
    ) -> Response {
        let query = uri.query().unwrap_or_default().to_string();
        log.0.lock().unwrap().push(format!("{method} {query}"));

        if method == Method::POST && query.contains("uploads") {
            let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                <InitiateMultipartUploadResult><Bucket>generated</Bucket>\
                <Key>big.png</Key><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>";
            return (StatusCode::OK, body).into_response();
        }
        if method == Method::PUT {
            let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                <Error><Code>InvalidRequest</Code><Message>part rejected</Message></Error>";
            return (StatusCode::BAD_REQUEST, body).into_response();
        }
        StatusCode::NO_CONTENT.into_response()
    }

    #[tokio::test]
    async fn test_failed_part_aborts_multipart_upload() {
        let log = RequestLog::default();
        let router = Router::new().fallback(failing_part_upload).with_state(log.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let config = S3Config {
            endpoint_url: Some(endpoint),
            multipart_threshold_bytes: 16,
            part_size_bytes: 32,
            ..minio_config()
        };
        let store = S3ObjectStore::with_static_credentials(&config, "minio", "minio-secret");

        let err = store.put("big.png", vec![7u8; 64], "image/png").await.unwrap_err();
        assert!(matches!(err, StorageError::Upload(_)));

        let requests = log.0.lock().unwrap().clone();
        assert!(requests
            .iter()
            .any(|r| r.starts_with("DELETE") && r.contains("uploadId=upload-1")));
    }

    #[tokio::test]
    async fn test_bucket_from_config() {
        let store = S3ObjectStore::with_static_credentials(&minio_config(), "a", "b");
        assert_eq!(store.bucket(), "generated");
    }
}
