use crate::engine::Precision;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Longest validity S3 accepts for a SigV4 presigned URL.
pub const MAX_PRESIGNED_URL_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// Main configuration for the generation service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Inference engine configuration
    #[serde(default)]
    pub engine: EngineConfig,
    /// Render policy configuration
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Artifact storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Quota configuration
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, text)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which engine implementation backs the lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineBackend {
    /// In-process procedural renderer
    #[default]
    Dryrun,
    /// HTTP inference worker
    Remote,
}

/// Inference engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: EngineBackend,
    /// Model identifier handed to the engine at construction
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Use the accelerator for the primary tier when one is available
    #[serde(default = "default_true")]
    pub prefer_accelerator: bool,
    /// Precision used by the primary tier on the accelerator
    #[serde(default = "default_accelerator_precision")]
    pub accelerator_precision: Precision,
    /// Request memory-efficient attention on top of the standard savers
    #[serde(default)]
    pub enable_xformers: bool,
    /// Concurrent renders admitted per engine tier
    #[serde(default = "default_max_concurrent_renders")]
    pub max_concurrent_renders: usize,
    /// Abandon a render after this many seconds (unset = wait indefinitely)
    #[serde(default)]
    pub render_timeout_secs: Option<u64>,
    #[serde(default)]
    pub remote: RemoteEngineConfig,
    #[serde(default)]
    pub dryrun: DryrunEngineConfig,
}

/// Remote inference worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEngineConfig {
    /// Base URL of the inference worker
    pub endpoint_url: Option<String>,
    /// Per-request timeout in seconds (covers model loading and rendering)
    #[serde(default = "default_remote_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Dry-run engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DryrunEngineConfig {
    /// Pretend an accelerator is present
    #[serde(default)]
    pub accelerator_available: bool,
    /// Largest render the simulated accelerator survives, in megapixels
    #[serde(default)]
    pub accelerator_max_megapixels: Option<f64>,
}

/// Render policy: fixed steps/guidance and the resolution ceilings
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance")]
    pub guidance: f32,
    /// Pixel budget for the primary tier, in megapixels
    #[serde(default = "default_max_megapixels")]
    pub max_megapixels: f64,
    /// Hard cap applied on top of `max_megapixels` for the fallback tier
    #[serde(default = "default_fallback_max_megapixels")]
    pub fallback_max_megapixels: f64,
    /// Render dimensions are multiples of this
    #[serde(default = "default_alignment")]
    pub alignment: u32,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
}

/// Artifact storage configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub local: LocalStorageConfig,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Custom endpoint URL (MinIO, LocalStack, AWS). Durable storage is used only when set.
    pub endpoint_url: Option<String>,
    /// S3 bucket name for artifacts
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Static access key (falls back to the default provider chain)
    pub access_key: Option<String>,
    /// Static secret key
    pub secret_key: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Leading key segment for every artifact
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Local filesystem storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Directory artifacts are written under
    #[serde(default = "default_generated_dir")]
    pub generated_dir: PathBuf,
    /// Public base URL the service is reachable at
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Serve `generated_dir` under `/generated`
    #[serde(default = "default_true")]
    pub serve_files: bool,
}

/// Length of a quota period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    /// Calendar month, UTC, starting at 00:00:00 on the 1st
    #[default]
    CalendarMonth,
}

impl QuotaPeriod {
    /// Start of the period containing `now`
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            QuotaPeriod::CalendarMonth => Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(now),
        }
    }
}

/// Quota configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct QuotaConfig {
    #[serde(default)]
    pub period: QuotaPeriod,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Asset type recorded with each generated artifact
    #[serde(default)]
    pub asset_type_id: Option<Uuid>,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "generation-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_model_id() -> String {
    "stabilityai/sd-turbo".to_string()
}

fn default_accelerator_precision() -> Precision {
    Precision::Half
}

fn default_max_concurrent_renders() -> usize {
    1
}

fn default_remote_request_timeout_secs() -> u64 {
    600
}

fn default_steps() -> u32 {
    12
}

fn default_guidance() -> f32 {
    1.8
}

fn default_max_megapixels() -> f64 {
    1.0
}

fn default_fallback_max_megapixels() -> f64 {
    1.0
}

fn default_alignment() -> u32 {
    64
}

fn default_width() -> u32 {
    768
}

fn default_height() -> u32 {
    1024
}

fn default_bucket() -> String {
    "generated".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "generated".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_generated_dir() -> PathBuf {
    PathBuf::from("generated")
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/generation").required(false))
            .add_source(config::File::with_name("/etc/generation/generation").required(false))
            // Override with environment variables
            // GENERATION__STORAGE__S3__ENDPOINT_URL -> storage.s3.endpoint_url
            .add_source(
                config::Environment::with_prefix("GENERATION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        Ok(config.normalized())
    }

    /// Clamp policy values into their usable ranges
    pub fn normalized(mut self) -> Self {
        self.generation.steps = self.generation.steps.max(1);
        self.generation.guidance = self.generation.guidance.max(0.0);
        self.generation.max_megapixels = self.generation.max_megapixels.max(0.1);
        self.engine.max_concurrent_renders = self.engine.max_concurrent_renders.max(1);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.generation.alignment == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "generation.alignment".to_string(),
                message: "Alignment must be greater than 0".to_string(),
            });
        }

        let unit_area = f64::from(self.generation.alignment).powi(2);
        for (field, ceiling) in [
            ("generation.max_megapixels", self.generation.max_megapixels),
            (
                "generation.fallback_max_megapixels",
                self.generation.fallback_max_megapixels,
            ),
        ] {
            if !(ceiling * 1_000_000.0 >= unit_area) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: format!(
                        "Ceiling must cover at least one {0}x{0} block",
                        self.generation.alignment
                    ),
                });
            }
        }

        if self.engine.backend == EngineBackend::Remote
            && self
                .engine
                .remote
                .endpoint_url
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(ConfigValidationError::MissingField(
                "engine.remote.endpoint_url".to_string(),
            ));
        }

        if self.engine.render_timeout_secs == Some(0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "engine.render_timeout_secs".to_string(),
                message: "Timeout must be greater than 0 when set".to_string(),
            });
        }

        if self.durable_storage_enabled() {
            if self.storage.s3.bucket.is_empty() {
                return Err(ConfigValidationError::MissingField("storage.s3.bucket".to_string()));
            }
            let expiry = self.storage.s3.presigned_url_expiry_secs;
            if expiry == 0 || expiry > MAX_PRESIGNED_URL_EXPIRY_SECS {
                return Err(ConfigValidationError::InvalidValue {
                    field: "storage.s3.presigned_url_expiry_secs".to_string(),
                    message: format!("Expiry must be between 1 and {MAX_PRESIGNED_URL_EXPIRY_SECS}"),
                });
            }
            if self.storage.s3.part_size_bytes < 5 * 1024 * 1024 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "storage.s3.part_size_bytes".to_string(),
                    message: "Multipart parts must be at least 5MB".to_string(),
                });
            }
        } else {
            let base_url = &self.storage.local.base_url;
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err(ConfigValidationError::InvalidValue {
                    field: "storage.local.base_url".to_string(),
                    message: "URL must start with http:// or https://".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Durable object storage is selected by the presence of an endpoint
    pub fn durable_storage_enabled(&self) -> bool {
        self.storage
            .s3
            .endpoint_url
            .as_deref()
            .is_some_and(|endpoint| !endpoint.is_empty())
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.s3.presigned_url_expiry_secs)
    }

    /// Get the render timeout, if one is configured
    pub fn render_timeout(&self) -> Option<Duration> {
        self.engine.render_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::default(),
            model_id: default_model_id(),
            prefer_accelerator: true,
            accelerator_precision: default_accelerator_precision(),
            enable_xformers: false,
            max_concurrent_renders: default_max_concurrent_renders(),
            render_timeout_secs: None,
            remote: RemoteEngineConfig::default(),
            dryrun: DryrunEngineConfig::default(),
        }
    }
}

impl Default for RemoteEngineConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            request_timeout_secs: default_remote_request_timeout_secs(),
        }
    }
}

impl Default for DryrunEngineConfig {
    fn default() -> Self {
        Self {
            accelerator_available: false,
            accelerator_max_megapixels: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            guidance: default_guidance(),
            max_megapixels: default_max_megapixels(),
            fallback_max_megapixels: default_fallback_max_megapixels(),
            alignment: default_alignment(),
            negative_prompt: None,
            default_width: default_width(),
            default_height: default_height(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            bucket: default_bucket(),
            region: default_region(),
            access_key: None,
            secret_key: None,
            force_path_style: false,
            key_prefix: default_key_prefix(),
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            generated_dir: default_generated_dir(),
            base_url: default_base_url(),
            serve_files: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
