//! Artifact storage.
//!
//! Two modes sit behind one contract. With durable object storage the
//! reference is an object key and every retrieval presigns a fresh,
//! time-limited URL. Without it, bytes land on the local filesystem and the
//! reference is a permanent URL that needs no signing.

use crate::config::MAX_PRESIGNED_URL_EXPIRY_SECS;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Content type of every stored artifact
pub const ARTIFACT_CONTENT_TYPE: &str = "image/png";

/// Scope used when a request carries no project
pub const UNSCOPED: &str = "no-project";

/// How a reference must be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Object-store key, resolved through a signed URL
    DurableKey,
    /// Permanent URL
    DirectUrl,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::DurableKey => "durable-key",
            StorageMode::DirectUrl => "direct-url",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub storage_mode: StorageMode,
    pub value: String,
    /// Default validity of URLs issued for this reference, in seconds
    pub ttl_hint: Option<u64>,
}

/// A URL the artifact can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalUrl {
    pub url: String,
    /// Seconds until the URL stops working, `None` if it never does
    pub expires_in: Option<u64>,
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to write artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object upload failed: {0}")]
    Upload(String),

    #[error("Failed to sign retrieval URL: {0}")]
    Presign(String),

    #[error("Retrieval TTL of {0}s is outside 1s to 7 days")]
    InvalidTtl(u64),

    #[error("Reference is {actual} but this store only resolves {expected}")]
    ModeMismatch {
        expected: StorageMode,
        actual: StorageMode,
    },
}

/// Durable object store collaborator
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Sign a GET for `key` valid for `ttl`
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Storage abstraction used by the controller
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn mode(&self) -> StorageMode;

    /// Persist PNG bytes under `scope_id` and return their reference
    async fn store(&self, scope_id: &str, bytes: Vec<u8>) -> Result<ArtifactReference, StorageError>;

    /// Produce a URL for `reference`, valid for `ttl` where the mode expires
    async fn retrieve_url(
        &self,
        reference: &ArtifactReference,
        ttl: Duration,
    ) -> Result<RetrievalUrl, StorageError>;
}

/// Scope component for an optional project
pub fn scope_for(project_id: Option<Uuid>) -> String {
    project_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| UNSCOPED.to_string())
}

/// Random file name; never derived from the clock
fn artifact_file_name() -> String {
    format!("{}.png", Uuid::new_v4().simple())
}

/// Sanitize a path component to prevent path traversal
pub(crate) fn sanitize_path_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        UNSCOPED.to_string()
    } else {
        sanitized
    }
}

fn record_stored(mode: StorageMode, size: usize) {
    metrics::counter!("generation.artifacts.stored", "mode" => mode.as_str()).increment(1);
    metrics::histogram!("generation.storage.bytes").record(size as f64);
}

/// Durable-key mode over an [`ObjectStore`]
pub struct DurableArtifactStore {
    objects: Arc<dyn ObjectStore>,
    key_prefix: String,
    default_ttl: Duration,
}

impl DurableArtifactStore {
    pub fn new(objects: Arc<dyn ObjectStore>, key_prefix: &str, default_ttl: Duration) -> Self {
        Self {
            objects,
            key_prefix: key_prefix.trim_matches('/').to_string(),
            default_ttl,
        }
    }

    /// Key layout: {prefix}/{scope}/{random}.png
    pub fn object_key(&self, scope_id: &str) -> String {
        let scope = sanitize_path_component(scope_id);
        if self.key_prefix.is_empty() {
            format!("{}/{}", scope, artifact_file_name())
        } else {
            format!("{}/{}/{}", self.key_prefix, scope, artifact_file_name())
        }
    }
}

#[async_trait]
impl ArtifactStore for DurableArtifactStore {
    fn mode(&self) -> StorageMode {
        StorageMode::DurableKey
    }

    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn store(&self, scope_id: &str, bytes: Vec<u8>) -> Result<ArtifactReference, StorageError> {
        let key = self.object_key(scope_id);
        let size = bytes.len();

        self.objects.put(&key, bytes, ARTIFACT_CONTENT_TYPE).await?;
        record_stored(StorageMode::DurableKey, size);

        info!(key = %key, size_bytes = size, "Artifact stored");

        Ok(ArtifactReference {
            storage_mode: StorageMode::DurableKey,
            value: key,
            ttl_hint: Some(self.default_ttl.as_secs()),
        })
    }

    async fn retrieve_url(
        &self,
        reference: &ArtifactReference,
        ttl: Duration,
    ) -> Result<RetrievalUrl, StorageError> {
        if reference.storage_mode != StorageMode::DurableKey {
            return Err(StorageError::ModeMismatch {
                expected: StorageMode::DurableKey,
                actual: reference.storage_mode,
            });
        }

        let secs = ttl.as_secs();
        if secs == 0 || secs > MAX_PRESIGNED_URL_EXPIRY_SECS {
            return Err(StorageError::InvalidTtl(secs));
        }

        let url = self.objects.presign_get(&reference.value, ttl).await?;
        debug!(key = %reference.value, ttl_secs = secs, "Signed retrieval URL");

        Ok(RetrievalUrl {
            url,
            expires_in: Some(secs),
        })
    }
}

/// Direct-url mode over a local directory
pub struct LocalArtifactStore {
    root: PathBuf,
    base_url: String,
}

impl LocalArtifactStore {
    /// Files go under `root`; URLs are `{base_url}/generated/{scope}/{file}`
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn mode(&self) -> StorageMode {
        StorageMode::DirectUrl
    }

    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn store(&self, scope_id: &str, bytes: Vec<u8>) -> Result<ArtifactReference, StorageError> {
        let scope = sanitize_path_component(scope_id);
        let file_name = artifact_file_name();
        let dir = self.root.join(&scope);
        let size = bytes.len();

        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&file_name), bytes).await?;
        record_stored(StorageMode::DirectUrl, size);

        let url = format!("{}/generated/{}/{}", self.base_url, scope, file_name);
        info!(url = %url, size_bytes = size, "Artifact stored");

        Ok(ArtifactReference {
            storage_mode: StorageMode::DirectUrl,
            value: url,
            ttl_hint: None,
        })
    }

    async fn retrieve_url(
        &self,
        reference: &ArtifactReference,
        _ttl: Duration,
    ) -> Result<RetrievalUrl, StorageError> {
        match reference.storage_mode {
            StorageMode::DirectUrl => Ok(RetrievalUrl {
                url: reference.value.clone(),
                expires_in: None,
            }),
            actual => Err(StorageError::ModeMismatch {
                expected: StorageMode::DirectUrl,
                actual,
            }),
        }
    }
}
