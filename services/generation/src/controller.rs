use crate::artifact_store::{scope_for, ArtifactReference, ArtifactStore, RetrievalUrl, StorageError};
use crate::engine::EngineTier;
use crate::orchestrator::{DegradationOrchestrator, GenerationError, GenerationRequest};
use crate::quota::{Admission, DataAccessError, QuotaGate, RejectionReason};
use crate::usage_store::{ArtifactRecord, ArtifactRecorder};
use axum::http::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of a successful generation
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub reference: ArtifactReference,
    /// Seconds until `url` expires, `None` for permanent URLs
    pub expires_in: Option<u64>,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub tier: EngineTier,
    pub degraded: bool,
    pub record_id: Option<Uuid>,
}

/// Controller failures
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Admission denied: {0}")]
    AdmissionDenied(RejectionReason),

    #[error("Failed to read plan or usage: {0}")]
    DataAccess(#[source] DataAccessError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Failed to store artifact: {0}")]
    Storage(#[from] StorageError),

    #[error("Artifact stored but not recorded: {0}")]
    Record(#[source] DataAccessError),
}

impl GenerateError {
    /// Entitlement problems are 403; everything else is a server fault
    pub fn status_code(&self) -> StatusCode {
        match self {
            GenerateError::AdmissionDenied(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GenerateError::AdmissionDenied(reason) => reason.code(),
            GenerateError::DataAccess(_) => "QUOTA_LOOKUP_ERROR",
            GenerateError::Generation(GenerationError::TimedOut { .. }) => "GENERATION_TIMEOUT",
            GenerateError::Generation(_) => "GENERATION_ERROR",
            GenerateError::Storage(_) => "STORAGE_ERROR",
            GenerateError::Record(_) => "RECORD_ERROR",
        }
    }

    /// Message safe to show the requester
    pub fn public_message(&self) -> &'static str {
        match self {
            GenerateError::AdmissionDenied(reason) => reason.message(),
            GenerateError::DataAccess(_) => "Could not verify your plan. Please try again later.",
            GenerateError::Generation(_) => "Image generation failed.",
            GenerateError::Storage(_) => "Generated image could not be saved.",
            GenerateError::Record(_) => "Generated image could not be recorded.",
        }
    }
}

/// Quota-gated generation: admit, render, store, record
pub struct GenerationController {
    quota: QuotaGate,
    orchestrator: Arc<DegradationOrchestrator>,
    store: Arc<dyn ArtifactStore>,
    recorder: Option<Arc<dyn ArtifactRecorder>>,
    retrieval_ttl: Duration,
}

impl GenerationController {
    pub fn new(
        quota: QuotaGate,
        orchestrator: Arc<DegradationOrchestrator>,
        store: Arc<dyn ArtifactStore>,
        retrieval_ttl: Duration,
    ) -> Self {
        Self {
            quota,
            orchestrator,
            store,
            recorder: None,
            retrieval_ttl,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn ArtifactRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn retrieval_ttl(&self) -> Duration {
        self.retrieval_ttl
    }

    #[instrument(skip(self, request), fields(user_id = %request.requester_id))]
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerateError> {
        let result = self.run(&request).await;

        if let Err(ref e) = result {
            metrics::counter!("generation.requests.failed", "code" => e.code()).increment(1);
            match e {
                GenerateError::AdmissionDenied(_) => {}
                GenerateError::Generation(_) => warn!(error = %e, "Generation request failed"),
                _ => error!(error = %e, "Generation request failed"),
            }
        }

        result
    }

    async fn run(&self, request: &GenerationRequest) -> Result<GenerationOutcome, GenerateError> {
        // Cheap check first; a failed lookup aborts before any rendering
        match self
            .quota
            .admit(request.requester_id)
            .await
            .map_err(GenerateError::DataAccess)?
        {
            Admission::Admitted(state) => {
                info!(
                    plan_limit = ?state.plan_limit,
                    period_usage = state.period_usage,
                    "Request admitted"
                );
            }
            Admission::Rejected(reason) => return Err(GenerateError::AdmissionDenied(reason)),
        }

        let image = self.orchestrator.generate(request).await?;
        let (width, height, tier, degraded) = (image.width, image.height, image.tier, image.degraded());
        let file_size = image.png.len();

        let reference = self
            .store
            .store(&scope_for(request.project_id), image.png)
            .await?;

        // Record before signing so a stored artifact always counts against the plan
        let record_id = match &self.recorder {
            Some(recorder) => Some(
                recorder
                    .record(&ArtifactRecord {
                        user_id: request.requester_id,
                        project_id: request.project_id,
                        url: reference.value.clone(),
                        width,
                        height,
                        file_size,
                    })
                    .await
                    .map_err(GenerateError::Record)?,
            ),
            None => None,
        };

        let retrieval = self.store.retrieve_url(&reference, self.retrieval_ttl).await?;

        info!(
            storage_mode = %reference.storage_mode,
            tier = %tier,
            degraded,
            width,
            height,
            "Generation complete"
        );

        Ok(GenerationOutcome {
            reference,
            expires_in: retrieval.expires_in,
            url: retrieval.url,
            width,
            height,
            tier,
            degraded,
            record_id,
        })
    }

    /// Regenerate a retrieval URL, using the default TTL when none is given
    pub async fn retrieval_url(
        &self,
        reference: &ArtifactReference,
        ttl: Option<Duration>,
    ) -> Result<RetrievalUrl, StorageError> {
        self.store
            .retrieve_url(reference, ttl.unwrap_or(self.retrieval_ttl))
            .await
    }
}
