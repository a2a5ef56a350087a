//! Degradation orchestrator.
//!
//! Drives one generation through the tier chain:
//!
//! ```text
//! Planned ──▶ Rendering(Primary, fitted size) ──────────────────────▶ Done
//!                   │ tier failure (OOM / incompatible)               ▲
//!                   ▼                                                 │
//!             Rendering(Fallback, size under the hard cap) ──────────┘
//!                   │ any failure
//!                   ▼
//!                Failed
//! ```
//!
//! Whatever tier produced the image, the result is resampled to the snapped
//! request size before it is returned. Nothing is written here.

use crate::config::GenerationConfig;
use crate::engine::{EngineError, EngineTier, RenderParams};
use crate::engine_pool::EnginePool;
use crate::resolution::{RenderPlan, ResolutionBudgeter};
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// A request to generate one image. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Reproducible on the tier that renders it only
    pub seed: Option<u64>,
    pub steps: u32,
    pub guidance: f32,
    pub requester_id: Uuid,
    pub project_id: Option<Uuid>,
}

impl GenerationRequest {
    /// Build a request with the policy's steps, guidance and negative prompt
    pub fn new(
        prompt: impl Into<String>,
        width: u32,
        height: u32,
        requester_id: Uuid,
        policy: &GenerationConfig,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: policy.negative_prompt.clone(),
            width,
            height,
            seed: None,
            steps: policy.steps,
            guidance: policy.guidance,
            requester_id,
            project_id: None,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_project(mut self, project_id: Option<Uuid>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn with_negative_prompt(mut self, negative_prompt: Option<String>) -> Self {
        if negative_prompt.is_some() {
            self.negative_prompt = negative_prompt;
        }
        self
    }

    fn render_params(&self, plan: &RenderPlan) -> RenderParams {
        RenderParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            width: plan.render_width,
            height: plan.render_height,
            steps: self.steps,
            guidance: self.guidance,
            seed: self.seed,
        }
    }
}

/// A finished PNG at the requested size
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Tier that rendered the image
    pub tier: EngineTier,
    /// Plan the producing tier rendered
    pub plan: RenderPlan,
}

impl GeneratedImage {
    /// Rendered below the requested size or off the preferred tier
    pub fn degraded(&self) -> bool {
        self.tier == EngineTier::Fallback || self.plan.downscaled
    }
}

/// Terminal generation failures
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Both engine tiers failed (primary: {primary}; fallback: {fallback})")]
    TiersExhausted {
        primary: EngineError,
        fallback: EngineError,
    },

    #[error("Render failed on {tier} tier: {source}")]
    Engine {
        tier: EngineTier,
        #[source]
        source: EngineError,
    },

    #[error("Render on {tier} tier exceeded {timeout:?}")]
    TimedOut { tier: EngineTier, timeout: Duration },

    #[error("Engine produced an unreadable image: {0}")]
    InvalidImage(String),
}

/// Render limits and policy the orchestrator applies
#[derive(Debug, Clone)]
pub struct RenderPolicy {
    pub max_megapixels: f64,
    pub fallback_max_megapixels: f64,
    pub alignment: u32,
    pub render_timeout: Option<Duration>,
}

impl RenderPolicy {
    pub fn from_config(config: &GenerationConfig, render_timeout: Option<Duration>) -> Self {
        Self {
            max_megapixels: config.max_megapixels,
            fallback_max_megapixels: config.fallback_max_megapixels,
            alignment: config.alignment,
            render_timeout,
        }
    }

    /// Ceiling for the fallback tier: never looser than the primary's
    pub fn fallback_ceiling(&self) -> f64 {
        self.max_megapixels.min(self.fallback_max_megapixels)
    }
}

enum Attempt {
    Rendered(Vec<u8>),
    TierFailed(EngineError),
}

/// Orchestrates planning, tiered rendering and upscaling
pub struct DegradationOrchestrator {
    pool: Arc<EnginePool>,
    budgeter: ResolutionBudgeter,
    policy: RenderPolicy,
}

impl DegradationOrchestrator {
    pub fn new(pool: Arc<EnginePool>, policy: RenderPolicy) -> Self {
        Self {
            pool,
            budgeter: ResolutionBudgeter::new(policy.alignment),
            policy,
        }
    }

    pub fn policy(&self) -> &RenderPolicy {
        &self.policy
    }

    /// Produce a PNG for `request`, degrading one tier on failure
    #[instrument(skip(self, request), fields(requester_id = %request.requester_id))]
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerationError> {
        let plan = self
            .budgeter
            .plan(request.width, request.height, self.policy.max_megapixels);

        info!(
            render_width = plan.render_width,
            render_height = plan.render_height,
            target_width = plan.target_width,
            target_height = plan.target_height,
            downscaled = plan.downscaled,
            "Planned primary render"
        );

        let primary_failure = match self.attempt(EngineTier::Primary, request, &plan).await? {
            Attempt::Rendered(bytes) => {
                return self.finish(bytes, EngineTier::Primary, plan).await;
            }
            Attempt::TierFailed(e) => e,
        };

        warn!(
            error = %primary_failure,
            "Primary tier failed, falling back"
        );
        metrics::counter!("generation.fallback.triggered", "cause" => primary_failure.kind())
            .increment(1);

        let fallback_plan = self.budgeter.plan(
            request.width,
            request.height,
            self.policy.fallback_ceiling(),
        );

        info!(
            render_width = fallback_plan.render_width,
            render_height = fallback_plan.render_height,
            "Planned fallback render"
        );

        match self.attempt(EngineTier::Fallback, request, &fallback_plan).await {
            Ok(Attempt::Rendered(bytes)) => self.finish(bytes, EngineTier::Fallback, fallback_plan).await,
            Ok(Attempt::TierFailed(fallback)) | Err(GenerationError::Engine { source: fallback, .. }) => {
                error!(
                    primary = %primary_failure,
                    fallback = %fallback,
                    "Generation failed on every tier"
                );
                Err(GenerationError::TiersExhausted {
                    primary: primary_failure,
                    fallback,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Run one tier. Fallback-class failures come back as `TierFailed`;
    /// anything else is terminal.
    async fn attempt(
        &self,
        tier: EngineTier,
        request: &GenerationRequest,
        plan: &RenderPlan,
    ) -> Result<Attempt, GenerationError> {
        let handle = self.pool.get(tier).await;
        let slot = match &handle {
            Ok(handle) => handle.acquire().await,
            Err(e) => Err(e.clone()),
        };

        // Only the render itself is timed, not the wait for a slot
        let outcome = match slot {
            Ok(slot) => {
                let params = request.render_params(plan);
                match self.policy.render_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, slot.render(&params))
                        .await
                        .map_err(|_| GenerationError::TimedOut { tier, timeout })?,
                    None => slot.render(&params).await,
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(bytes) => Ok(Attempt::Rendered(bytes)),
            Err(e) if e.triggers_fallback() => Ok(Attempt::TierFailed(e)),
            Err(source) => Err(GenerationError::Engine { tier, source }),
        }
    }

    async fn finish(
        &self,
        bytes: Vec<u8>,
        tier: EngineTier,
        plan: RenderPlan,
    ) -> Result<GeneratedImage, GenerationError> {
        let (width, height) = (plan.target_width, plan.target_height);
        let png = tokio::task::spawn_blocking(move || fit_to_target(bytes, width, height))
            .await
            .map_err(|e| GenerationError::InvalidImage(e.to_string()))??;

        Ok(GeneratedImage {
            png,
            width,
            height,
            tier,
            plan,
        })
    }
}

/// Return PNG bytes of exactly `width`x`height`, resampling with Lanczos3 if needed
pub fn fit_to_target(bytes: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>, GenerationError> {
    let reader = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|e| GenerationError::InvalidImage(e.to_string()))?;
    let format = reader.format();
    let (actual_width, actual_height) = reader
        .into_dimensions()
        .map_err(|e| GenerationError::InvalidImage(e.to_string()))?;

    if (actual_width, actual_height) == (width, height) && format == Some(ImageFormat::Png) {
        return Ok(bytes);
    }

    let mut image =
        image::load_from_memory(&bytes).map_err(|e| GenerationError::InvalidImage(e.to_string()))?;
    if (actual_width, actual_height) != (width, height) {
        image = image.resize_exact(width, height, FilterType::Lanczos3);
    }

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| GenerationError::InvalidImage(e.to_string()))?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Device, Precision};
    use crate::engine_pool::DevicePolicy;
    use crate::testing::{png_dimensions, ScriptedFactory};

    fn pool(factory: Arc<ScriptedFactory>) -> Arc<EnginePool> {
        Arc::new(EnginePool::new(
            factory,
            DevicePolicy {
                model_id: "stabilityai/sd-turbo".to_string(),
                prefer_accelerator: true,
                accelerator_precision: Precision::Half,
                enable_xformers: false,
                max_concurrent_renders: 1,
            },
        ))
    }

    fn render_policy(max_megapixels: f64) -> RenderPolicy {
        RenderPolicy {
            max_megapixels,
            fallback_max_megapixels: 1.0,
            alignment: 64,
            render_timeout: None,
        }
    }

    fn request(width: u32, height: u32) -> GenerationRequest {
        GenerationRequest::new(
            "a lighthouse at dusk",
            width,
            height,
            Uuid::new_v4(),
            &GenerationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_primary_success_without_downscale() {
        let factory = Arc::new(ScriptedFactory::new(true));
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), render_policy(1.0));

        let image = orchestrator.generate(&request(800, 1200)).await.unwrap();

        assert_eq!(image.tier, EngineTier::Primary);
        assert!(!image.degraded());
        assert_eq!((image.width, image.height), (768, 1216));
        assert_eq!(png_dimensions(&image.png), (768, 1216));

        let renders = factory.renders();
        assert_eq!(renders.len(), 1);
        assert_eq!(renders[0].device, Device::Cuda);
        assert_eq!((renders[0].params.width, renders[0].params.height), (768, 1216));
        assert_eq!(renders[0].params.steps, 12);
    }

    #[tokio::test]
    async fn test_proactive_downscale_then_upscale() {
        let factory = Arc::new(ScriptedFactory::new(true));
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), render_policy(0.25));

        let image = orchestrator.generate(&request(1024, 1024)).await.unwrap();

        assert_eq!(image.tier, EngineTier::Primary);
        assert!(image.plan.downscaled);
        assert_eq!(png_dimensions(&image.png), (1024, 1024));

        let renders = factory.renders();
        assert_eq!((renders[0].params.width, renders[0].params.height), (448, 448));
    }

    #[tokio::test]
    async fn test_out_of_memory_falls_back_under_hard_cap() {
        let factory = Arc::new(ScriptedFactory::new(true).failing_renders_on(
            Device::Cuda,
            EngineError::ResourceExhausted("CUDA out of memory".to_string()),
        ));
        let mut policy = render_policy(4.0);
        policy.fallback_max_megapixels = 1.0;
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), policy);

        let image = orchestrator.generate(&request(1152, 1152)).await.unwrap();

        assert_eq!(image.tier, EngineTier::Fallback);
        assert!(image.degraded());
        assert_eq!(png_dimensions(&image.png), (1152, 1152));

        let renders = factory.renders();
        assert_eq!(renders.len(), 2);
        assert_eq!(renders[1].device, Device::Cpu);
        assert_eq!(renders[1].precision, Precision::Full);
        let fallback_area = u64::from(renders[1].params.width) * u64::from(renders[1].params.height);
        assert!(fallback_area <= 1_000_000);
    }

    #[tokio::test]
    async fn test_incompatible_precision_falls_back() {
        let factory = Arc::new(ScriptedFactory::new(true).failing_renders_on(
            Device::Cuda,
            EngineError::Incompatible("not implemented for 'Half'".to_string()),
        ));
        let orchestrator = DegradationOrchestrator::new(pool(factory), render_policy(1.0));

        let image = orchestrator.generate(&request(512, 512)).await.unwrap();
        assert_eq!(image.tier, EngineTier::Fallback);
        assert_eq!(png_dimensions(&image.png), (512, 512));
    }

    #[tokio::test]
    async fn test_other_failure_does_not_fall_back() {
        let factory = Arc::new(
            ScriptedFactory::new(true)
                .failing_renders_on(Device::Cuda, EngineError::Other("safety checker crashed".to_string())),
        );
        let engines = pool(factory.clone());
        let orchestrator = DegradationOrchestrator::new(engines.clone(), render_policy(1.0));

        let err = orchestrator.generate(&request(512, 512)).await.unwrap_err();

        assert!(matches!(
            err,
            GenerationError::Engine {
                tier: EngineTier::Primary,
                source: EngineError::Other(_)
            }
        ));
        assert!(!engines.is_loaded(EngineTier::Fallback));
        assert_eq!(factory.renders().len(), 1);
    }

    #[tokio::test]
    async fn test_both_tiers_failing_is_terminal() {
        let factory = Arc::new(
            ScriptedFactory::new(true)
                .failing_renders_on(Device::Cuda, EngineError::ResourceExhausted("oom".to_string()))
                .failing_renders_on(Device::Cpu, EngineError::ResourceExhausted("oom".to_string())),
        );
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), render_policy(1.0));

        let err = orchestrator.generate(&request(512, 512)).await.unwrap_err();

        assert!(matches!(err, GenerationError::TiersExhausted { .. }));
        assert_eq!(factory.renders().len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_render_error_exhausts_tiers() {
        let factory = Arc::new(
            ScriptedFactory::new(true)
                .failing_renders_on(Device::Cuda, EngineError::ResourceExhausted("oom".to_string()))
                .failing_renders_on(Device::Cpu, EngineError::Other("scheduler crashed".to_string())),
        );
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), render_policy(1.0));

        let err = orchestrator.generate(&request(512, 512)).await.unwrap_err();

        match err {
            GenerationError::TiersExhausted { primary, fallback } => {
                assert!(matches!(primary, EngineError::ResourceExhausted(_)));
                assert!(matches!(fallback, EngineError::Other(_)));
            }
            other => panic!("expected TiersExhausted, got {other:?}"),
        }
        assert_eq!(factory.renders().len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_build_error_exhausts_tiers() {
        let factory = Arc::new(
            ScriptedFactory::new(true)
                .failing_renders_on(Device::Cuda, EngineError::ResourceExhausted("oom".to_string()))
                .failing_builds_on(Device::Cpu, EngineError::Other("weights missing".to_string())),
        );
        let engines = pool(factory.clone());
        let orchestrator = DegradationOrchestrator::new(engines.clone(), render_policy(1.0));

        let err = orchestrator.generate(&request(512, 512)).await.unwrap_err();

        assert!(matches!(
            err,
            GenerationError::TiersExhausted {
                fallback: EngineError::Other(_),
                ..
            }
        ));
        assert!(!engines.is_loaded(EngineTier::Fallback));
        assert_eq!(factory.renders().len(), 1);
    }

    #[tokio::test]
    async fn test_primary_build_failure_degrades_to_fallback() {
        let factory = Arc::new(ScriptedFactory::new(true).failing_builds_on(
            Device::Cuda,
            EngineError::ResourceExhausted("CUDA out of memory while loading weights".to_string()),
        ));
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), render_policy(1.0));

        let image = orchestrator.generate(&request(512, 512)).await.unwrap();
        assert_eq!(image.tier, EngineTier::Fallback);
    }

    #[tokio::test]
    async fn test_fallback_engine_is_reused() {
        let factory = Arc::new(ScriptedFactory::new(true).failing_renders_on(
            Device::Cuda,
            EngineError::ResourceExhausted("oom".to_string()),
        ));
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), render_policy(1.0));

        orchestrator.generate(&request(512, 512)).await.unwrap();
        orchestrator.generate(&request(512, 512)).await.unwrap();

        assert_eq!(factory.builds(), 2);
        assert_eq!(factory.renders().len(), 4);
    }

    #[tokio::test]
    async fn test_render_timeout_is_terminal() {
        let factory = Arc::new(ScriptedFactory::new(true).with_render_delay_ms(200));
        let mut policy = render_policy(1.0);
        policy.render_timeout = Some(Duration::from_millis(20));
        let orchestrator = DegradationOrchestrator::new(pool(factory), policy);

        let err = orchestrator.generate(&request(256, 256)).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::TimedOut {
                tier: EngineTier::Primary,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_render_timeout_excludes_slot_wait() {
        let factory = Arc::new(ScriptedFactory::new(true).with_render_delay_ms(150));
        let mut policy = render_policy(1.0);
        policy.render_timeout = Some(Duration::from_millis(250));
        let orchestrator = DegradationOrchestrator::new(pool(factory.clone()), policy);

        let (first_request, second_request) = (request(256, 256), request(256, 256));
        let (first, second) = tokio::join!(
            orchestrator.generate(&first_request),
            orchestrator.generate(&second_request)
        );

        assert_eq!(first.unwrap().tier, EngineTier::Primary);
        assert_eq!(second.unwrap().tier, EngineTier::Primary);
        assert_eq!(factory.renders().len(), 2);
    }

    #[test]
    fn test_fit_to_target_rejects_garbage() {
        let err = fit_to_target(b"definitely not an image".to_vec(), 64, 64).unwrap_err();
        assert!(matches!(err, GenerationError::InvalidImage(_)));
    }

    #[test]
    fn test_seed_is_forwarded() {
        let request = request(512, 512).with_seed(Some(42));
        let plan = ResolutionBudgeter::default().plan(512, 512, 1.0);
        assert_eq!(request.render_params(&plan).seed, Some(42));
    }
}
