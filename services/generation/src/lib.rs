//! Istoria Generation Service
//!
//! Quota-gated image generation under limited accelerator memory. A request
//! is admitted against the requester's monthly plan limit, rendered on the
//! preferred engine tier at a size that fits the pixel budget, retried once
//! on a CPU fallback tier if the preferred tier runs out of memory, upscaled
//! back to the requested size and written through a storage abstraction.
//!
//! ## Features
//!
//! - **Quota Gate**: per-user monthly limits from the active subscription plan
//! - **Resolution Budgeting**: aligned render sizes under a megapixel ceiling
//! - **Engine Lifecycle**: one lazily built engine per tier, shared process-wide
//! - **Graceful Degradation**: out-of-memory and precision failures fall back
//!   one tier instead of failing the request
//! - **Storage Modes**: S3/MinIO keys with presigned URLs, or permanent local URLs
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API
//!      │
//!      ▼
//! ┌──────────────┐   admit    ┌──────────────┐        PostgreSQL
//! │ Generation   │───────────▶│ Quota Gate   │──────▶ plan / usage
//! │ Controller   │            └──────────────┘
//! │              │  generate  ┌──────────────┐        ┌──────────────┐
//! │              │───────────▶│ Degradation  │───────▶│ Engine Pool  │
//! │              │            │ Orchestrator │        │ primary      │
//! │              │            └──────────────┘        │ fallback     │
//! │              │   store    ┌──────────────┐        └──────────────┘
//! │              │───────────▶│ Artifact     │──────▶ S3 / local disk
//! └──────────────┘            │ Store        │
//!                             └──────────────┘
//! ```

pub mod api;
pub mod artifact_store;
pub mod config;
pub mod controller;
pub mod dryrun_engine;
pub mod engine;
pub mod engine_pool;
pub mod orchestrator;
pub mod quota;
pub mod remote_engine;
pub mod resolution;
pub mod s3_store;
pub mod usage_store;

#[cfg(test)]
mod testing;

pub use artifact_store::{
    ArtifactReference, ArtifactStore, DurableArtifactStore, LocalArtifactStore, RetrievalUrl,
    StorageError, StorageMode,
};
pub use config::Config;
pub use controller::{GenerateError, GenerationController, GenerationOutcome};
pub use engine::{Device, EngineError, EngineTier, Precision};
pub use engine_pool::{DevicePolicy, EnginePool};
pub use orchestrator::{DegradationOrchestrator, GeneratedImage, GenerationError, GenerationRequest};
pub use quota::{Admission, DataAccessError, QuotaGate, RejectionReason};
pub use resolution::{RenderPlan, ResolutionBudgeter};
pub use s3_store::S3ObjectStore;
pub use usage_store::PgUsageStore;
