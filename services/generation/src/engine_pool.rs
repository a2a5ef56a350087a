use crate::config::EngineConfig;
use crate::engine::{
    Device, EngineError, EngineFactory, EngineSpec, EngineTier, InferenceEngine, MemorySaver,
    Precision, RenderParams,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OnceCell, Semaphore, SemaphorePermit};
use tracing::{debug, info, instrument, warn};

/// Device selection policy for the primary tier
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    pub model_id: String,
    pub prefer_accelerator: bool,
    pub accelerator_precision: Precision,
    pub enable_xformers: bool,
    pub max_concurrent_renders: usize,
}

impl From<&EngineConfig> for DevicePolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            model_id: config.model_id.clone(),
            prefer_accelerator: config.prefer_accelerator,
            accelerator_precision: config.accelerator_precision,
            enable_xformers: config.enable_xformers,
            max_concurrent_renders: config.max_concurrent_renders.max(1),
        }
    }
}

impl DevicePolicy {
    fn savers(&self) -> Vec<MemorySaver> {
        let mut savers = MemorySaver::STANDARD.to_vec();
        if self.enable_xformers {
            savers.push(MemorySaver::XformersAttention);
        }
        savers
    }
}

/// A built engine shared by every request routed to its tier
pub struct EngineHandle {
    tier: EngineTier,
    engine: Box<dyn InferenceEngine>,
    permits: Semaphore,
}

impl EngineHandle {
    pub fn tier(&self) -> EngineTier {
        self.tier
    }

    pub fn spec(&self) -> &EngineSpec {
        self.engine.spec()
    }

    /// Wait for a free render slot on this engine
    pub async fn acquire(&self) -> Result<RenderSlot<'_>, EngineError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Other("engine slot pool closed".to_string()))?;

        Ok(RenderSlot {
            handle: self,
            _permit: permit,
        })
    }

    /// Render on this engine, waiting for a free slot first
    pub async fn render(&self, params: &RenderParams) -> Result<Vec<u8>, EngineError> {
        self.acquire().await?.render(params).await
    }
}

/// A held render slot; the slot is released on drop
pub struct RenderSlot<'a> {
    handle: &'a EngineHandle,
    _permit: SemaphorePermit<'a>,
}

impl RenderSlot<'_> {
    pub async fn render(&self, params: &RenderParams) -> Result<Vec<u8>, EngineError> {
        let tier = self.handle.tier;
        let started = Instant::now();
        let result = self.handle.engine.render(params).await;

        metrics::histogram!("generation.render.duration_seconds", "tier" => tier.as_str())
            .record(started.elapsed().as_secs_f64());
        if result.is_err() {
            metrics::counter!("generation.render.failed", "tier" => tier.as_str()).increment(1);
        }

        result
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("tier", &self.tier)
            .field("spec", self.engine.spec())
            .finish()
    }
}

/// Engine lifecycle manager.
///
/// Holds at most one engine per tier for the lifetime of the process. The
/// first caller for a tier builds it; concurrent callers wait for that build
/// and receive the same handle. A failed build leaves the tier empty so a
/// later call can try again.
pub struct EnginePool {
    factory: Arc<dyn EngineFactory>,
    policy: DevicePolicy,
    primary: OnceCell<Arc<EngineHandle>>,
    fallback: OnceCell<Arc<EngineHandle>>,
}

impl EnginePool {
    pub fn new(factory: Arc<dyn EngineFactory>, policy: DevicePolicy) -> Self {
        Self {
            factory,
            policy,
            primary: OnceCell::new(),
            fallback: OnceCell::new(),
        }
    }

    /// Get the engine for a tier, building it on first use
    pub async fn get(&self, tier: EngineTier) -> Result<Arc<EngineHandle>, EngineError> {
        let cell = match tier {
            EngineTier::Primary => &self.primary,
            EngineTier::Fallback => &self.fallback,
        };

        cell.get_or_try_init(|| self.build(tier))
            .await
            .map(Arc::clone)
    }

    /// Whether a tier has been built
    pub fn is_loaded(&self, tier: EngineTier) -> bool {
        match tier {
            EngineTier::Primary => self.primary.initialized(),
            EngineTier::Fallback => self.fallback.initialized(),
        }
    }

    /// Resolve the device and precision a tier binds to
    pub async fn spec_for(&self, tier: EngineTier) -> EngineSpec {
        let use_accelerator = tier == EngineTier::Primary
            && self.policy.prefer_accelerator
            && self.factory.accelerator_available().await;

        let (device, precision) = if use_accelerator {
            (Device::Cuda, self.policy.accelerator_precision)
        } else {
            (Device::Cpu, Precision::Full)
        };
        EngineSpec::new(self.policy.model_id.clone(), device, precision)
    }

    #[instrument(skip(self))]
    async fn build(&self, tier: EngineTier) -> Result<Arc<EngineHandle>, EngineError> {
        let spec = self.spec_for(tier).await;

        info!(
            tier = %tier,
            model_id = %spec.model_id,
            device = %spec.device,
            precision = %spec.precision,
            "Building inference engine"
        );

        let mut engine = self.factory.build(&spec).await?;

        for saver in self.policy.savers() {
            match engine.enable_memory_saver(saver) {
                Ok(()) => debug!(tier = %tier, saver = saver.as_str(), "Memory saver enabled"),
                Err(e) => warn!(
                    tier = %tier,
                    saver = saver.as_str(),
                    error = %e,
                    "Memory saver unavailable, continuing without it"
                ),
            }
        }

        metrics::counter!("generation.engine.built", "tier" => tier.as_str()).increment(1);

        Ok(Arc::new(EngineHandle {
            tier,
            engine,
            permits: Semaphore::new(self.policy.max_concurrent_renders),
        }))
    }
}
