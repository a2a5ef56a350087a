//! In-process engine that paints a procedural image instead of running a model.
//!
//! Output is a pure function of (seed, prompt, size, precision), so the same
//! seed reproduces on the same tier and differs across tiers. An optional
//! simulated accelerator budget makes large renders fail the way a real GPU
//! runs out of memory.

use crate::config::DryrunEngineConfig;
use crate::engine::{
    Device, EngineError, EngineFactory, EngineSpec, InferenceEngine, MemorySaver, Precision,
    RenderParams,
};
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashSet;
use std::io::Cursor;
use tracing::debug;
use uuid::Uuid;

pub struct DryrunEngineFactory {
    config: DryrunEngineConfig,
}

impl DryrunEngineFactory {
    pub fn new(config: DryrunEngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineFactory for DryrunEngineFactory {
    async fn accelerator_available(&self) -> bool {
        self.config.accelerator_available
    }

    async fn build(&self, spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>, EngineError> {
        if spec.device == Device::Cuda && !self.config.accelerator_available {
            return Err(EngineError::Incompatible(
                "no CUDA device is visible to the dry-run engine".to_string(),
            ));
        }

        let max_area = match spec.device {
            Device::Cuda => self
                .config
                .accelerator_max_megapixels
                .map(|mp| (mp * 1_000_000.0) as u64),
            Device::Cpu => None,
        };

        debug!(model_id = %spec.model_id, device = %spec.device, "Dry-run engine ready");

        Ok(Box::new(DryrunEngine {
            spec: spec.clone(),
            max_area,
            savers: HashSet::new(),
        }))
    }
}

pub struct DryrunEngine {
    spec: EngineSpec,
    max_area: Option<u64>,
    savers: HashSet<MemorySaver>,
}

#[async_trait]
impl InferenceEngine for DryrunEngine {
    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn enable_memory_saver(&mut self, saver: MemorySaver) -> Result<(), EngineError> {
        if saver == MemorySaver::XformersAttention && self.spec.device != Device::Cuda {
            return Err(EngineError::Incompatible(
                "memory-efficient attention needs an accelerator".to_string(),
            ));
        }
        self.savers.insert(saver);
        Ok(())
    }

    async fn render(&self, params: &RenderParams) -> Result<Vec<u8>, EngineError> {
        let area = u64::from(params.width) * u64::from(params.height);
        if let Some(max_area) = self.max_area {
            if area > max_area {
                return Err(EngineError::ResourceExhausted(format!(
                    "CUDA out of memory. Tried to render {}x{} with a {max_area} pixel budget",
                    params.width, params.height
                )));
            }
        }

        let seed = params
            .seed
            .unwrap_or_else(|| Uuid::new_v4().as_u64_pair().0);
        let state = mix(seed, &params.prompt, self.spec.precision);
        let (width, height) = (params.width, params.height);
        debug!(width, height, savers = self.savers.len(), "Dry-run render");

        tokio::task::spawn_blocking(move || paint(state, width, height))
            .await
            .map_err(|e| EngineError::Other(format!("render task failed: {e}")))?
    }
}

fn mix(seed: u64, prompt: &str, precision: Precision) -> u64 {
    // FNV-1a over the prompt, folded into the seed
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in prompt.bytes().chain(precision.as_str().bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    splitmix64(seed ^ hash)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn paint(state: u64, width: u32, height: u32) -> Result<Vec<u8>, EngineError> {
    let [r0, g0, b0, r1, g1, b1, ..] = state.to_le_bytes();
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);

    let image = RgbImage::from_fn(width, height, |x, y| {
        let t = (x as f32 / w + y as f32 / h) / 2.0;
        let lerp = |a: u8, b: u8| (f32::from(a) + (f32::from(b) - f32::from(a)) * t) as u8;
        Rgb([lerp(r0, r1), lerp(g0, g1), lerp(b0, b1)])
    });

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| EngineError::Other(format!("png encoding failed: {e}")))?;
    Ok(png)
}
