use anyhow::{Context, Result};
use media_service::config::{Config, MediaMode};
use media_service::resolver::validate_filename;
use media_service::{
    start_api_server, AppState, Catalog, CleanupSweeper, Clock, FfmpegTranscoder, LocalMedia,
    MediaKind, MediaResolver, ObjectStore, RateLimiter, RequestValidator, S3Gateway, SystemClock,
    TranscodeCache, VideoProcessor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ffmpeg runs in parallel while prewarming
const PREWARM_CONCURRENCY: usize = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        mode = ?config.media.mode,
        "Starting portfolio media service"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Initialize components
    let catalog = Arc::new(
        Catalog::load(&config.media.catalog_path).context("Failed to load product catalog")?,
    );

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3Gateway::new(&config.storage, config.storage_timeout(), clock.clone())
            .await
            .context("Failed to initialize object store gateway")?,
    );

    if config.media.audit_on_startup {
        match catalog.audit(store.as_ref()).await {
            Ok(missing) if missing.is_empty() => info!("All catalog media present in bucket"),
            Ok(missing) => warn!(
                missing = missing.len(),
                "Catalog references media missing from bucket"
            ),
            Err(e) => warn!(error = %e, "Catalog audit failed"),
        }
    }

    let mut resolver = MediaResolver::new(store, config.presigned_url_expiry());
    if config.media.require_catalog_membership {
        resolver = resolver.with_catalog_membership(catalog.clone());
    }

    let rate_limiter = Arc::new(
        RateLimiter::new(
            config.rate_limit_window(),
            config.security.rate_limit_max_requests,
            clock.clone(),
        )
        .with_trusted_proxy_hops(config.security.trusted_proxy_hops),
    );

    let validator = config
        .security
        .validate_requests
        .then(|| Arc::new(RequestValidator::new(&config.security)));

    let mut sweeper = CleanupSweeper::new(
        config.transcode.processed_videos_dir.clone(),
        config.retention(),
        config.sweeper.memory_high_water_mb,
        clock.clone(),
    )
    .with_rate_limiter(rate_limiter.clone());

    let local = match config.media.mode {
        MediaMode::SignedUrl => None,
        MediaMode::Local => {
            warn!("Local transcoding mode is deprecated, prefer signed_url");

            let ffmpeg = Arc::new(FfmpegTranscoder::new(config.transcode.ffmpeg_path.clone()));
            let cache = Arc::new(TranscodeCache::new(
                ffmpeg.clone(),
                config.transcode.cache_capacity,
                config.transcode.max_dimension,
                config.transcode_timeout(),
            ));
            let videos = Arc::new(
                VideoProcessor::new(
                    ffmpeg,
                    config.transcode.processed_videos_dir.clone(),
                    config.transcode.max_dimension,
                    config.transcode_timeout(),
                )
                .context("Failed to create processed video directory")?,
            );

            sweeper = sweeper.with_cache(cache.clone());

            if !config.transcode.prewarm_widths.is_empty() {
                spawn_prewarm(
                    &catalog,
                    cache.clone(),
                    config.media.images_dir.clone(),
                    config.transcode.prewarm_widths.clone(),
                );
            }

            Some(LocalMedia {
                cache,
                videos,
                images_dir: config.media.images_dir.clone(),
                videos_dir: config.media.videos_dir.clone(),
                default_quality: config.transcode.default_quality,
            })
        }
    };

    // Create API state
    let api_state = AppState {
        catalog,
        resolver: Arc::new(resolver),
        local,
        rate_limiter,
        validator,
        clock,
        environment: config.service.environment.clone(),
        frontend_origin: config.api.frontend_origin.clone(),
        absolute_media_urls: config.api.absolute_media_urls,
    };

    let cancel = CancellationToken::new();

    // Spawn sweeper task
    let sweeper_handle = tokio::spawn(
        Arc::new(sweeper).run(config.sweep_interval(), cancel.clone()),
    );

    // Spawn API server task
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        let shutdown = async move { api_cancel.cancelled().await };
        if let Err(e) =
            start_api_server(api_state, &api_config.host, api_config.port, shutdown).await
        {
            error!(error = %e, "API server error");
        }
    });

    info!("Media service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down media service");

    cancel.cancel();
    let (api_result, sweeper_result) = tokio::join!(api_handle, sweeper_handle);
    if let Err(e) = api_result {
        error!(error = %e, "API server task failed");
    }
    if let Err(e) = sweeper_result {
        error!(error = %e, "Sweeper task failed");
    }

    info!("Media service stopped");

    Ok(())
}

/// Encode every catalog image at the configured widths in the background
fn spawn_prewarm(
    catalog: &Catalog,
    cache: Arc<TranscodeCache>,
    images_dir: PathBuf,
    widths: Vec<u32>,
) {
    let sources: Vec<PathBuf> = catalog
        .all()
        .iter()
        .flat_map(|entry| entry.media.iter())
        .filter(|filename| MediaKind::for_filename(filename) == MediaKind::Image)
        .filter(|filename| validate_filename(filename).is_ok())
        .map(|filename| images_dir.join(filename))
        .collect();

    tokio::spawn(async move {
        let images = sources.len();
        let encoded = cache.prewarm(sources, &widths, PREWARM_CONCURRENCY).await;
        info!(images = images, encoded = encoded, "Transcode cache prewarmed");
    });
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
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
