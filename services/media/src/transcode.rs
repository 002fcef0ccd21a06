//! Local image and video transcoding.
//!
//! This path serves media from local disk and predates signed URL
//! delivery. It is kept for deployments without object storage.
//!
//! - [`TranscodeCache`] re-encodes images and keeps up to `capacity`
//!   results in memory, evicting in insertion order. Entries are never
//!   refreshed, so an edited source keeps serving the old encode until it
//!   is evicted, the cache is cleared, or the process restarts.
//! - [`VideoProcessor`] writes encoded videos to a processed directory,
//!   one artifact per source and option set.
//!
//! Both shell out to `ffmpeg` through [`FfmpegTranscoder`].

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Edge length of catalog thumbnails
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 150;

const THUMBNAIL_QUALITY: u8 = 70;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Source file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Encoder failed: {0}")]
    Encoder(String),

    #[error("Encoder timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output image encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    #[default]
    Webp,
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Parse the `format` query parameter; unknown names yield `None`
    pub fn from_param(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "webp" => Some(ImageFormat::Webp),
            "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Webp => "image/webp",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

/// Image transform request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
    pub format: ImageFormat,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            quality: 80,
            format: ImageFormat::Webp,
        }
    }
}

impl ImageOptions {
    /// Clamp quality to 1..=100 and dimensions to 1..=max_dimension
    pub fn normalized(mut self, max_dimension: u32) -> Self {
        self.quality = self.quality.clamp(1, 100);
        self.width = self.width.map(|w| w.clamp(1, max_dimension));
        self.height = self.height.map(|h| h.clamp(1, max_dimension));
        self
    }
}

/// Video transform request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoOptions {
    pub quality: u8,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            quality: 80,
            width: None,
            height: None,
        }
    }
}

/// Encodes one image into an in-memory buffer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageEncoder: Send + Sync {
    async fn encode(&self, source: &Path, options: &ImageOptions) -> Result<Bytes, TranscodeError>;
}

/// Encodes one video into `output`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn encode(
        &self,
        source: &Path,
        output: &Path,
        options: &VideoOptions,
    ) -> Result<(), TranscodeError>;
}

/// Scale filter that fits the box without upscaling
pub fn image_scale_filter(width: Option<u32>, height: Option<u32>) -> Option<String> {
    match (width, height) {
        (Some(w), Some(h)) => Some(format!(
            "scale=w='min({w},iw)':h='min({h},ih)':force_original_aspect_ratio=decrease"
        )),
        (Some(w), None) => Some(format!("scale=w='min({w},iw)':h=-1")),
        (None, Some(h)) => Some(format!("scale=w=-1:h='min({h},ih)'")),
        (None, None) => None,
    }
}

/// x264 wants even dimensions
pub fn video_scale_filter(width: Option<u32>, height: Option<u32>) -> Option<String> {
    if width.is_none() && height.is_none() {
        return None;
    }
    let w = width.map_or_else(|| "-1".to_string(), |w| w.to_string());
    let h = height.map_or_else(|| "-1".to_string(), |h| h.to_string());
    Some(format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease:force_divisible_by=2"
    ))
}

/// Map 1..=100 quality onto x264 CRF, never below 23
pub fn crf_for_quality(quality: u8) -> u8 {
    (51.0 - f64::from(quality) * 0.33).max(23.0).round() as u8
}

/// Runs the `ffmpeg` binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn image_args(source: &Path, options: &ImageOptions) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            source.to_string_lossy().into_owned(),
            "-frames:v".to_string(),
            "1".to_string(),
        ];

        if let Some(filter) = image_scale_filter(options.width, options.height) {
            args.push("-vf".to_string());
            args.push(filter);
        }

        match options.format {
            ImageFormat::Webp => args.extend(
                [
                    "-c:v",
                    "libwebp",
                    "-quality",
                    options.quality.to_string().as_str(),
                    "-compression_level",
                    "2",
                    "-f",
                    "webp",
                ]
                .map(String::from),
            ),
            ImageFormat::Jpeg => {
                // mjpeg qscale runs 2 (best) to 31 (worst)
                let qscale = 2 + (100 - u32::from(options.quality)) * 29 / 100;
                args.extend(
                    [
                        "-c:v",
                        "mjpeg",
                        "-q:v",
                        qscale.to_string().as_str(),
                        "-f",
                        "image2pipe",
                    ]
                    .map(String::from),
                )
            }
            ImageFormat::Png => {
                args.extend(["-c:v", "png", "-f", "image2pipe"].map(String::from))
            }
        }

        args.push("pipe:1".to_string());
        args
    }

    fn video_args(source: &Path, output: &Path, options: &VideoOptions) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            source.to_string_lossy().into_owned(),
        ];

        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-crf",
                crf_for_quality(options.quality).to_string().as_str(),
                "-c:a",
                "aac",
                "-b:a",
                "96k",
                "-threads",
                "2",
                "-max_muxing_queue_size",
                "1024",
            ]
            .map(String::from),
        );

        if let Some(filter) = video_scale_filter(options.width, options.height) {
            args.push("-vf".to_string());
            args.push(filter);
        }

        args.extend(["-movflags", "+faststart", "-f", "mp4", "-y"].map(String::from));
        args.push(output.to_string_lossy().into_owned());
        args
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, TranscodeError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TranscodeError::Encoder(format!("failed to spawn ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Encoder(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl ImageEncoder for FfmpegTranscoder {
    async fn encode(&self, source: &Path, options: &ImageOptions) -> Result<Bytes, TranscodeError> {
        let stdout = self.run(&Self::image_args(source, options)).await?;
        if stdout.is_empty() {
            return Err(TranscodeError::Encoder("ffmpeg produced no output".to_string()));
        }
        Ok(Bytes::from(stdout))
    }
}

#[async_trait]
impl VideoEncoder for FfmpegTranscoder {
    async fn encode(
        &self,
        source: &Path,
        output: &Path,
        options: &VideoOptions,
    ) -> Result<(), TranscodeError> {
        self.run(&Self::video_args(source, output, options)).await?;
        Ok(())
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, TranscodeError>
where
    F: Future<Output = Result<T, TranscodeError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TranscodeError::Timeout)?
}

async fn ensure_source(source: &Path) -> Result<(), TranscodeError> {
    match tokio::fs::metadata(source).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(TranscodeError::NotFound(source.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(TranscodeError::NotFound(source.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Identity of one cached encode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranscodeKey {
    pub source: PathBuf,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
    pub format: ImageFormat,
}

impl TranscodeKey {
    fn new(source: &Path, options: &ImageOptions) -> Self {
        Self {
            source: source.to_path_buf(),
            width: options.width,
            height: options.height,
            quality: options.quality,
            format: options.format,
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<TranscodeKey, Bytes>,
    /// Insertion order, oldest first
    order: VecDeque<TranscodeKey>,
}

/// Bounded in-memory cache of encoded images
pub struct TranscodeCache {
    encoder: Arc<dyn ImageEncoder>,
    capacity: usize,
    max_dimension: u32,
    timeout: Duration,
    state: Mutex<CacheState>,
}

impl TranscodeCache {
    pub fn new(
        encoder: Arc<dyn ImageEncoder>,
        capacity: usize,
        max_dimension: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            encoder,
            capacity: capacity.max(1),
            max_dimension,
            timeout,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Encoded bytes for `source` under `options`, from cache when present.
    ///
    /// Concurrent misses on the same key each run the encoder; the first
    /// result to finish is kept.
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn transform(
        &self,
        source: &Path,
        options: ImageOptions,
    ) -> Result<Bytes, TranscodeError> {
        ensure_source(source).await?;

        let options = options.normalized(self.max_dimension);
        let key = TranscodeKey::new(source, &options);

        let cached = self.state.lock().entries.get(&key).cloned();
        if let Some(hit) = cached {
            metrics::counter!("transcode_cache_hits_total").increment(1);
            return Ok(hit);
        }
        metrics::counter!("transcode_cache_misses_total").increment(1);

        let encoded = with_timeout(self.timeout, self.encoder.encode(source, &options)).await?;

        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(&key) {
            return Ok(existing.clone());
        }

        if state.entries.len() >= self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
                debug!(evicted = %oldest.source.display(), "Evicted oldest transcode");
            }
        }

        state.order.push_back(key.clone());
        state.entries.insert(key, encoded.clone());

        Ok(encoded)
    }

    /// Encode `source` at each width, skipping widths that fail
    pub async fn responsive_sizes(&self, source: &Path, widths: &[u32]) -> Vec<(u32, Bytes)> {
        let mut results = Vec::with_capacity(widths.len());

        for &width in widths {
            let options = ImageOptions {
                width: Some(width),
                ..ImageOptions::default()
            };
            match self.transform(source, options).await {
                Ok(bytes) => results.push((width, bytes)),
                Err(e) => {
                    warn!(source = %source.display(), width, error = %e, "Failed to generate size")
                }
            }
        }

        results
    }

    /// Square preview of `source` at reduced quality
    pub async fn thumbnail(&self, source: &Path, size: u32) -> Result<Bytes, TranscodeError> {
        let options = ImageOptions {
            width: Some(size),
            height: Some(size),
            quality: THUMBNAIL_QUALITY,
            ..ImageOptions::default()
        };
        self.transform(source, options).await
    }

    /// Encode every source at every width plus its thumbnail,
    /// `concurrency` sources at a time. Returns the number of encodes that
    /// succeeded.
    pub async fn prewarm(&self, sources: Vec<PathBuf>, widths: &[u32], concurrency: usize) -> usize {
        use futures::stream::{self, StreamExt};

        stream::iter(sources)
            .map(|source| async move {
                let sizes = self.responsive_sizes(&source, widths).await.len();
                let thumbnail = self.thumbnail(&source, DEFAULT_THUMBNAIL_SIZE).await.is_ok();
                sizes + usize::from(thumbnail)
            })
            .buffer_unordered(concurrency.max(1))
            .fold(0, |total, encoded| async move { total + encoded })
            .await
    }

    /// Drop every cached encode, returning how many were held
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.order.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Encodes videos into the processed directory and reuses prior output
pub struct VideoProcessor {
    encoder: Arc<dyn VideoEncoder>,
    output_dir: PathBuf,
    max_dimension: u32,
    timeout: Duration,
}

impl VideoProcessor {
    /// Create the processor, creating `output_dir` if needed
    pub fn new(
        encoder: Arc<dyn VideoEncoder>,
        output_dir: impl Into<PathBuf>,
        max_dimension: u32,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            encoder,
            output_dir,
            max_dimension,
            timeout,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<stem>_processed_<id>.mp4`, where the id is derived from the
    /// source name and every option so each option set gets its own file
    pub fn artifact_path(&self, source: &Path, options: &VideoOptions) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let file_name = source
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let identity = format!(
            "{file_name}|q={}|w={:?}|h={:?}",
            options.quality, options.width, options.height
        );
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, identity.as_bytes());

        self.output_dir.join(format!("{stem}_processed_{id}.mp4"))
    }

    /// Path of an encoded copy of `source`, encoding it on first request
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn process(
        &self,
        source: &Path,
        options: VideoOptions,
    ) -> Result<PathBuf, TranscodeError> {
        ensure_source(source).await?;

        let options = VideoOptions {
            quality: options.quality.clamp(1, 100),
            width: options.width.map(|w| w.clamp(2, self.max_dimension)),
            height: options.height.map(|h| h.clamp(2, self.max_dimension)),
        };
        let artifact = self.artifact_path(source, &options);

        if tokio::fs::try_exists(&artifact).await? {
            debug!(artifact = %artifact.display(), "Reusing processed video");
            return Ok(artifact);
        }

        // Unique partial name so concurrent encodes never share a file
        let partial = artifact.with_extension(format!("{}.partial", Uuid::new_v4().simple()));

        let encoded = with_timeout(
            self.timeout,
            self.encoder.encode(source, &partial, &options),
        )
        .await;

        if let Err(e) = encoded {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &artifact).await?;

        info!(artifact = %artifact.display(), "Processed video");
        Ok(artifact)
    }
}
