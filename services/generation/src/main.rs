use anyhow::{Context, Result};
use generation_service::api::{create_router, start_api_server, AppState};
use generation_service::artifact_store::{ArtifactStore, DurableArtifactStore, LocalArtifactStore};
use generation_service::config::{Config, EngineBackend};
use generation_service::controller::GenerationController;
use generation_service::dryrun_engine::DryrunEngineFactory;
use generation_service::engine::EngineFactory;
use generation_service::engine_pool::{DevicePolicy, EnginePool};
use generation_service::orchestrator::{DegradationOrchestrator, RenderPolicy};
use generation_service::quota::QuotaGate;
use generation_service::remote_engine::RemoteEngineFactory;
use generation_service::s3_store::S3ObjectStore;
use generation_service::usage_store::PgUsageStore;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        "Starting Istoria Generation Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let usage_store = Arc::new(
        PgUsageStore::new(&config.database)
            .await
            .context("Failed to initialize usage store")?,
    );

    let factory: Arc<dyn EngineFactory> = match config.engine.backend {
        EngineBackend::Dryrun => Arc::new(DryrunEngineFactory::new(config.engine.dryrun.clone())),
        EngineBackend::Remote => Arc::new(
            RemoteEngineFactory::new(&config.engine.remote)
                .context("Failed to initialize remote engine backend")?,
        ),
    };

    info!(
        backend = ?config.engine.backend,
        model_id = %config.engine.model_id,
        "Engine backend selected; engines are built on first use"
    );

    let pool = Arc::new(EnginePool::new(factory, DevicePolicy::from(&config.engine)));
    let orchestrator = Arc::new(DegradationOrchestrator::new(
        pool,
        RenderPolicy::from_config(&config.generation, config.render_timeout()),
    ));

    let (store, generated_dir): (Arc<dyn ArtifactStore>, _) = if config.durable_storage_enabled() {
        let objects = S3ObjectStore::new(&config.storage.s3)
            .await
            .context("Failed to initialize S3 object store")?;

        info!(
            mode = "durable-key",
            bucket = %config.storage.s3.bucket,
            "Artifact storage selected"
        );

        let store = DurableArtifactStore::new(
            Arc::new(objects),
            &config.storage.s3.key_prefix,
            config.presigned_url_expiry(),
        );
        (Arc::new(store), None)
    } else {
        let local = &config.storage.local;
        tokio::fs::create_dir_all(&local.generated_dir)
            .await
            .with_context(|| format!("Failed to create {}", local.generated_dir.display()))?;

        info!(
            mode = "direct-url",
            dir = %local.generated_dir.display(),
            base_url = %local.base_url,
            "Artifact storage selected"
        );

        let served = local.serve_files.then(|| local.generated_dir.clone());
        (
            Arc::new(LocalArtifactStore::new(&local.generated_dir, &local.base_url)),
            served,
        )
    };

    let quota = QuotaGate::new(usage_store.clone(), config.quota.period);

    let controller = Arc::new(
        GenerationController::new(quota, orchestrator, store, config.presigned_url_expiry())
            .with_recorder(usage_store.clone()),
    );

    // Create API state
    let api_state = AppState {
        controller,
        defaults: config.generation.clone(),
        usage_store: Some(usage_store),
    };

    let router = create_router(api_state, &config.api, generated_dir);

    info!("Generation service started successfully");

    start_api_server(router, &config.api, shutdown_signal()).await?;

    info!("Generation service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("text") {
        registry.with(fmt::layer()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
