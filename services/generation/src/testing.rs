//! Scripted collaborators shared by the unit tests.

use crate::artifact_store::{ObjectStore, StorageError};
use crate::engine::{
    Device, EngineError, EngineFactory, EngineSpec, InferenceEngine, MemorySaver, Precision,
    RenderParams,
};
use crate::quota::DataAccessError;
use crate::usage_store::{ArtifactRecord, ArtifactRecorder};
use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Width and height of an encoded image
pub fn png_dimensions(bytes: &[u8]) -> (u32, u32) {
    let image = image::load_from_memory(bytes).unwrap();
    (image.width(), image.height())
}

fn solid_png(width: u32, height: u32) -> Vec<u8> {
    let mut png = Vec::new();
    RgbImage::from_pixel(width, height, Rgb([40, 90, 160]))
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();
    png
}

/// One call that reached an engine
#[derive(Debug, Clone)]
pub struct RenderCall {
    pub device: Device,
    pub precision: Precision,
    pub params: RenderParams,
}

/// Engine factory whose builds and renders follow a script
pub struct ScriptedFactory {
    accelerator: bool,
    build_delay: Duration,
    render_delay: Duration,
    reject_savers: bool,
    failing_first_builds: usize,
    build_failures: HashMap<Device, EngineError>,
    render_failures: HashMap<Device, EngineError>,
    build_attempts: AtomicUsize,
    saver_attempts: Arc<AtomicUsize>,
    renders: Arc<Mutex<Vec<RenderCall>>>,
}

impl ScriptedFactory {
    pub fn new(accelerator: bool) -> Self {
        Self {
            accelerator,
            build_delay: Duration::ZERO,
            render_delay: Duration::ZERO,
            reject_savers: false,
            failing_first_builds: 0,
            build_failures: HashMap::new(),
            render_failures: HashMap::new(),
            build_attempts: AtomicUsize::new(0),
            saver_attempts: Arc::new(AtomicUsize::new(0)),
            renders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_build_delay_ms(mut self, ms: u64) -> Self {
        self.build_delay = Duration::from_millis(ms);
        self
    }

    pub fn with_render_delay_ms(mut self, ms: u64) -> Self {
        self.render_delay = Duration::from_millis(ms);
        self
    }

    pub fn rejecting_memory_savers(mut self) -> Self {
        self.reject_savers = true;
        self
    }

    pub fn failing_first_builds(mut self, count: usize) -> Self {
        self.failing_first_builds = count;
        self
    }

    pub fn failing_builds_on(mut self, device: Device, error: EngineError) -> Self {
        self.build_failures.insert(device, error);
        self
    }

    pub fn failing_renders_on(mut self, device: Device, error: EngineError) -> Self {
        self.render_failures.insert(device, error);
        self
    }

    /// Build attempts, successful or not
    pub fn builds(&self) -> usize {
        self.build_attempts.load(Ordering::SeqCst)
    }

    pub fn saver_attempts(&self) -> usize {
        self.saver_attempts.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> Vec<RenderCall> {
        self.renders.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn accelerator_available(&self) -> bool {
        self.accelerator
    }

    async fn build(&self, spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>, EngineError> {
        let attempt = self.build_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }

        if attempt < self.failing_first_builds {
            return Err(EngineError::Other("scripted build failure".to_string()));
        }
        if let Some(error) = self.build_failures.get(&spec.device) {
            return Err(error.clone());
        }

        Ok(Box::new(ScriptedEngine {
            spec: spec.clone(),
            render_delay: self.render_delay,
            render_failure: self.render_failures.get(&spec.device).cloned(),
            reject_savers: self.reject_savers,
            saver_attempts: self.saver_attempts.clone(),
            renders: self.renders.clone(),
        }))
    }
}

struct ScriptedEngine {
    spec: EngineSpec,
    render_delay: Duration,
    render_failure: Option<EngineError>,
    reject_savers: bool,
    saver_attempts: Arc<AtomicUsize>,
    renders: Arc<Mutex<Vec<RenderCall>>>,
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn enable_memory_saver(&mut self, saver: MemorySaver) -> Result<(), EngineError> {
        self.saver_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_savers {
            return Err(EngineError::Other(format!("{} unsupported", saver.as_str())));
        }
        Ok(())
    }

    async fn render(&self, params: &RenderParams) -> Result<Vec<u8>, EngineError> {
        self.renders.lock().unwrap().push(RenderCall {
            device: self.spec.device,
            precision: self.spec.precision,
            params: params.clone(),
        });

        if !self.render_delay.is_zero() {
            tokio::time::sleep(self.render_delay).await;
        }

        match &self.render_failure {
            Some(error) => Err(error.clone()),
            None => Ok(solid_png(params.width, params.height)),
        }
    }
}

/// Object store kept in memory
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    fail_puts: bool,
    fail_presign: bool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_puts() -> Self {
        Self {
            fail_puts: true,
            ..Self::default()
        }
    }

    pub fn failing_presign() -> Self {
        Self {
            fail_presign: true,
            ..Self::default()
        }
    }

    pub fn object(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        if self.fail_puts {
            return Err(StorageError::Upload("bucket is read-only".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if self.fail_presign {
            return Err(StorageError::Presign("signer unavailable".to_string()));
        }
        Ok(format!("memory://generated/{key}?expires={}", ttl.as_secs()))
    }
}

/// Artifact recorder kept in memory
#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<(Uuid, ArtifactRecord)>>,
    fail: bool,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.records.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl ArtifactRecorder for MemoryRecorder {
    async fn record(&self, artifact: &ArtifactRecord) -> Result<Uuid, DataAccessError> {
        if self.fail {
            return Err(DataAccessError::Unavailable("insert rejected".to_string()));
        }
        let id = Uuid::new_v4();
        self.records.lock().unwrap().push((id, artifact.clone()));
        Ok(id)
    }
}
