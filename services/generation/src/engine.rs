//! Inference engine contract.
//!
//! The diffusion model itself is opaque to this service. An engine is bound to
//! one (device, precision) pair at construction and renders images from a
//! prompt. Failures are tagged so the orchestrator can tell a tier failure
//! (out of memory, unsupported precision) from anything else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device class an engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// GPU accelerator
    Cuda,
    /// General-purpose processor
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric precision of the model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "fp16")]
    Half,
    #[serde(rename = "bf16")]
    BFloat16,
    #[serde(rename = "fp32")]
    Full,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Half => "fp16",
            Precision::BFloat16 => "bf16",
            Precision::Full => "fp32",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTier {
    /// Preferred device and precision, built on first use
    Primary,
    /// CPU at full precision, built on first primary failure
    Fallback,
}

impl EngineTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineTier::Primary => "primary",
            EngineTier::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EngineTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to construct an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    pub model_id: String,
    pub device: Device,
    pub precision: Precision,
}

impl EngineSpec {
    pub fn new(model_id: impl Into<String>, device: Device, precision: Precision) -> Self {
        Self {
            model_id: model_id.into(),
            device,
            precision,
        }
    }
}

/// Optional memory-saving switches applied after construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySaver {
    AttentionSlicing,
    VaeSlicing,
    VaeTiling,
    XformersAttention,
}

impl MemorySaver {
    /// Savers applied to every engine
    pub const STANDARD: [MemorySaver; 3] = [
        MemorySaver::AttentionSlicing,
        MemorySaver::VaeSlicing,
        MemorySaver::VaeTiling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySaver::AttentionSlicing => "attention_slicing",
            MemorySaver::VaeSlicing => "vae_slicing",
            MemorySaver::VaeTiling => "vae_tiling",
            MemorySaver::XformersAttention => "xformers_attention",
        }
    }
}

/// Parameters for a single render call.
///
/// A seed is honoured by whichever tier runs the render. The same seed is
/// reproducible on the same tier only; primary and fallback differ in device
/// and precision and produce different images.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    pub seed: Option<u64>,
}

/// Engine failures, tagged by whether a lower tier could succeed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Incompatible device or precision: {0}")]
    Incompatible(String),

    #[error("Engine failure: {0}")]
    Other(String),
}

impl EngineError {
    /// Out-of-memory and precision/device failures are worth one retry on the fallback tier
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            EngineError::ResourceExhausted(_) | EngineError::Incompatible(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ResourceExhausted(_) => "resource_exhausted",
            EngineError::Incompatible(_) => "incompatible",
            EngineError::Other(_) => "other",
        }
    }

    /// Classify a raw failure message from an engine runtime.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        const EXHAUSTED: [&str; 4] = [
            "cuda out of memory",
            "cudnn_status_alloc_failed",
            "out of memory",
            "oom",
        ];
        const INCOMPATIBLE: [&str; 4] = [
            "expected scalar type",
            "not implemented for 'half'",
            "no kernel image",
            "unsupported dtype",
        ];

        if EXHAUSTED.iter().any(|marker| contains_marker(&lower, marker)) {
            EngineError::ResourceExhausted(message)
        } else if INCOMPATIBLE.iter().any(|marker| lower.contains(marker)) {
            EngineError::Incompatible(message)
        } else {
            EngineError::Other(message)
        }
    }
}

// "oom" must stand alone so words like "room" don't match.
fn contains_marker(haystack: &str, marker: &str) -> bool {
    if marker.contains(' ') || marker.contains('_') {
        return haystack.contains(marker);
    }
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == marker)
}

/// A loaded engine bound to one device and precision
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn spec(&self) -> &EngineSpec;

    /// Turn on a memory-saving switch. Unsupported switches return an error.
    fn enable_memory_saver(&mut self, saver: MemorySaver) -> Result<(), EngineError>;

    /// Render an image and return its encoded bytes
    async fn render(&self, params: &RenderParams) -> Result<Vec<u8>, EngineError>;
}

/// Builds engines for the lifecycle manager
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Whether an accelerator can host the primary tier
    async fn accelerator_available(&self) -> bool;

    async fn build(&self, spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_out_of_memory() {
        let err = EngineError::classify("RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB");
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
        assert!(err.triggers_fallback());

        let err = EngineError::classify("CUDNN_STATUS_ALLOC_FAILED");
        assert!(matches!(err, EngineError::ResourceExhausted(_)));

        let err = EngineError::classify("worker OOM while decoding latents");
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[test]
    fn test_classify_incompatible_precision() {
        let err = EngineError::classify("\"LayerNormKernelImpl\" not implemented for 'Half'");
        assert!(matches!(err, EngineError::Incompatible(_)));
        assert!(err.triggers_fallback());
    }

    #[test]
    fn test_classify_other() {
        let err = EngineError::classify("no room left in the safety checker queue");
        assert!(matches!(err, EngineError::Other(_)));
        assert!(!err.triggers_fallback());
        assert_eq!(err.kind(), "other");
    }

    #[test]
    fn test_precision_serialization() {
        assert_eq!(serde_json::to_string(&Precision::Half).unwrap(), "\"fp16\"");
        let precision: Precision = serde_json::from_str("\"fp32\"").unwrap();
        assert_eq!(precision, Precision::Full);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(EngineTier::Primary.to_string(), "primary");
        assert_eq!(EngineTier::Fallback.to_string(), "fallback");
        assert_eq!(Device::Cuda.to_string(), "cuda");
    }
}
