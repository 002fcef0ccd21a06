//! HTTP surface: health, catalog, and media routes.
//!
//! Media routes answer with a 302 to a signed object storage URL. In
//! local mode they transcode from disk instead.

use crate::catalog::{Catalog, CatalogEntry};
use crate::clock::Clock;
use crate::error::ApiError;
use crate::object_store::{SignedUrlGrant, StorageObjectRef};
use crate::resolver::{MediaKind, MediaResolver};
use crate::security::{cors_layer, rate_limit, validate_request, RateLimiter, RequestValidator};
use crate::transcode::{
    ImageFormat, ImageOptions, TranscodeCache, TranscodeError, VideoOptions, VideoProcessor,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Local-disk delivery, present only in local mode
#[derive(Clone)]
pub struct LocalMedia {
    pub cache: Arc<TranscodeCache>,
    pub videos: Arc<VideoProcessor>,
    pub images_dir: PathBuf,
    pub videos_dir: PathBuf,
    pub default_quality: u8,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub resolver: Arc<MediaResolver>,
    pub local: Option<LocalMedia>,
    pub rate_limiter: Arc<RateLimiter>,
    /// None disables referer/origin/user-agent checks
    pub validator: Option<Arc<RequestValidator>>,
    pub clock: Arc<dyn Clock>,
    pub environment: String,
    pub frontend_origin: String,
    pub absolute_media_urls: bool,
}

/// Query parameters for image requests.
///
/// Values are kept as text and parsed leniently; a malformed number is
/// treated as absent rather than failing the request.
#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    pub width: Option<String>,
    pub height: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
    /// Accepted for old clients, no effect
    pub watermark: Option<String>,
}

/// Query parameters for video requests
#[derive(Debug, Default, Deserialize)]
pub struct VideoQuery {
    pub quality: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
}

/// Positive integer from a query value, `None` when absent or malformed
fn number_param(value: Option<&str>) -> Option<u32> {
    value
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|&n| n > 0)
}

/// Create the API router.
///
/// Media routes capture the rest of the path so names with separators
/// reach filename validation instead of falling through to 404.
pub fn create_router(state: AppState) -> Router {
    let mut media = Router::new()
        .route(
            "/api/media/image/",
            get(empty_filename).fallback(method_not_allowed),
        )
        .route(
            "/api/media/video/",
            get(empty_filename).fallback(method_not_allowed),
        )
        .route(
            "/api/media/info/",
            get(empty_filename).fallback(method_not_allowed),
        )
        .route(
            "/api/media/image/*filename",
            get(serve_image).fallback(method_not_allowed),
        )
        .route(
            "/api/media/video/*filename",
            get(serve_video).fallback(method_not_allowed),
        )
        .route(
            "/api/media/info/*filename",
            get(media_info).fallback(method_not_allowed),
        );

    if let Some(validator) = &state.validator {
        media = media.route_layer(middleware::from_fn_with_state(
            validator.clone(),
            validate_request,
        ));
    }

    // Outermost first: trace, CORP header, rate limit, CORS, then validation
    Router::new()
        .route(
            "/api/health",
            get(health_check).fallback(method_not_allowed),
        )
        .route(
            "/api/products",
            get(list_products).fallback(method_not_allowed),
        )
        .route(
            "/api/products/:id",
            get(get_product).fallback(method_not_allowed),
        )
        .merge(media)
        .fallback(not_found)
        .layer(cors_layer(&state.frontend_origin))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit,
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cross-origin-resource-policy"),
            HeaderValue::from_static("cross-origin"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}

/// The wildcard routes never match an empty filename
async fn empty_filename() -> ApiError {
    ApiError::BadRequest("Invalid filename".to_string())
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let timestamp = DateTime::<Utc>::from(state.clock.now());

    Json(serde_json::json!({
        "status": "OK",
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        "environment": state.environment,
    }))
}

/// Scheme and host prefix for product media URLs, empty for relative URLs
fn media_base_url(state: &AppState, headers: &HeaderMap) -> String {
    if !state.absolute_media_urls {
        return String::new();
    }

    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    match header_str(header::HOST.as_str()) {
        Some(host) => {
            let scheme = header_str("x-forwarded-proto").unwrap_or("http");
            format!("{scheme}://{host}")
        }
        None => String::new(),
    }
}

/// List all products
#[instrument(skip(state, headers))]
async fn list_products(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<Vec<CatalogEntry>> {
    let base = media_base_url(&state, &headers);

    Json(
        state
            .catalog
            .all()
            .iter()
            .map(|entry| entry.with_media_urls(&base))
            .collect(),
    )
}

/// Get one product by id
#[instrument(skip(state, headers))]
async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CatalogEntry>, ApiError> {
    let entry = id
        .parse::<u32>()
        .ok()
        .and_then(|id| state.catalog.get(id))
        .ok_or_else(|| ApiError::NotFound("Product not found".to_string()))?;

    Ok(Json(entry.with_media_urls(&media_base_url(&state, &headers))))
}

/// 302 to a signed URL; the bytes never pass through this service
fn redirect(grant: &SignedUrlGrant) -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, grant.target.as_str()),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (header::X_FRAME_OPTIONS, "DENY"),
        ],
    )
        .into_response()
}

fn media_response(content_type: &str, body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "public, max-age=3600"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (header::X_FRAME_OPTIONS, "DENY"),
        ],
        body,
    )
        .into_response()
}

fn content_type_for(filename: &str) -> &'static str {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn quality_or(requested: Option<&str>, default: u8) -> u8 {
    number_param(requested).map_or(default, |q| q.clamp(1, 100) as u8)
}

/// Serve an image
#[instrument(skip(state))]
async fn serve_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(params): Query<ImageQuery>,
) -> Result<Response, ApiError> {
    let Some(local) = &state.local else {
        let grant = state.resolver.resolve(MediaKind::Image, &filename).await?;
        return Ok(redirect(&grant));
    };

    state.resolver.check(MediaKind::Image, &filename)?;
    let source = local.images_dir.join(&filename);

    let format = params
        .format
        .as_deref()
        .and_then(ImageFormat::from_param)
        .unwrap_or_default();
    let options = ImageOptions {
        width: number_param(params.width.as_deref()),
        height: number_param(params.height.as_deref()),
        quality: quality_or(params.quality.as_deref(), local.default_quality),
        format,
    };

    match local.cache.transform(&source, options).await {
        Ok(encoded) => Ok(media_response(format.content_type(), Body::from(encoded))),
        Err(TranscodeError::NotFound(_)) => Err(ApiError::NotFound("Image not found".to_string())),
        Err(e) => {
            warn!(filename = %filename, error = %e, "Image processing failed, serving original");

            let original = tokio::fs::read(&source)
                .await
                .map_err(|e| ApiError::infrastructure("Failed to serve image", e))?;

            Ok(media_response(content_type_for(&filename), Body::from(original)))
        }
    }
}

/// Serve a video
#[instrument(skip(state))]
async fn serve_video(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(params): Query<VideoQuery>,
) -> Result<Response, ApiError> {
    let Some(local) = &state.local else {
        let grant = state.resolver.resolve(MediaKind::Video, &filename).await?;
        return Ok(redirect(&grant));
    };

    state.resolver.check(MediaKind::Video, &filename)?;
    let source = local.videos_dir.join(&filename);

    let options = VideoOptions {
        quality: quality_or(params.quality.as_deref(), local.default_quality),
        width: number_param(params.width.as_deref()),
        height: number_param(params.height.as_deref()),
    };

    let artifact = process_video(local, &source, &options).await?;
    let file = match tokio::fs::File::open(&artifact).await {
        Ok(file) => file,
        // Swept between processing and open; encode again once
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let artifact = process_video(local, &source, &options).await?;
            tokio::fs::File::open(&artifact)
                .await
                .map_err(|e| ApiError::infrastructure("Failed to process video", e))?
        }
        Err(e) => return Err(ApiError::infrastructure("Failed to process video", e)),
    };

    Ok(media_response(
        "video/mp4",
        Body::from_stream(ReaderStream::new(file)),
    ))
}

async fn process_video(
    local: &LocalMedia,
    source: &std::path::Path,
    options: &VideoOptions,
) -> Result<PathBuf, ApiError> {
    local
        .videos
        .process(source, options.clone())
        .await
        .map_err(|e| match e {
            TranscodeError::NotFound(_) => ApiError::NotFound("Video not found".to_string()),
            other => ApiError::infrastructure("Failed to process video", other),
        })
}

/// Object metadata for diagnostics
#[instrument(skip(state))]
async fn media_info(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<StorageObjectRef>, ApiError> {
    let kind = MediaKind::for_filename(&filename);
    Ok(Json(state.resolver.describe(kind, &filename).await?))
}

/// Start the API server, stopping when `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!(address = %addr, "Starting media API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("API server error")?;

    Ok(())
}
