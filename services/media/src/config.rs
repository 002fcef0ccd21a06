use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the media service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Request validation and rate limiting
    #[serde(default)]
    pub security: SecurityConfig,
    /// Media delivery configuration
    #[serde(default)]
    pub media: MediaConfig,
    /// Local transcoding configuration
    #[serde(default)]
    pub transcode: TranscodeConfig,
    /// Processed artifact cleanup configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Deployment environment name reported by the health endpoint
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3-compatible object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding the protected media
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Region ("auto" for R2)
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (R2, MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    /// Static access key id; falls back to the default AWS chain when unset
    pub access_key_id: Option<String>,
    /// Static secret access key
    pub secret_access_key: Option<String>,
    /// Base URL for objects that are publicly readable
    pub public_url_base: Option<String>,
    /// Force path-style access (required for R2 and MinIO)
    #[serde(default = "default_true")]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Upper bound on a single storage request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Frontend origin allowed by CORS
    #[serde(default = "default_frontend_origin")]
    pub frontend_origin: String,
    /// Prefix product media URLs with the request's scheme and host
    #[serde(default)]
    pub absolute_media_urls: bool,
}

/// Request validation and rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Rate limit window in seconds
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Requests allowed per client within one window
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: usize,
    /// Reverse proxies in front of the service whose X-Forwarded-For
    /// entries are trusted; 0 keys clients by peer address only
    #[serde(default)]
    pub trusted_proxy_hops: usize,
    /// Run referer/origin/user-agent checks on media routes
    #[serde(default = "default_true")]
    pub validate_requests: bool,
    /// Hosts (with optional port) accepted in the Referer header
    #[serde(default = "default_allowed_referer_domains")]
    pub allowed_referer_domains: Vec<String>,
    /// Values accepted in the Origin header
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Case-insensitive user-agent fragments that are rejected
    #[serde(default = "default_blocked_user_agents")]
    pub blocked_user_agents: Vec<String>,
}

/// How media requests are answered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    /// Redirect to a presigned object storage URL
    #[default]
    SignedUrl,
    /// Transcode files from local disk (deprecated)
    Local,
}

/// Media delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub mode: MediaMode,
    /// JSON catalog file loaded at startup
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    /// Only resolve filenames referenced by a catalog entry
    #[serde(default)]
    pub require_catalog_membership: bool,
    /// Log catalog media missing from the bucket at startup
    #[serde(default)]
    pub audit_on_startup: bool,
    /// Source images for local mode
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,
    /// Source videos for local mode
    #[serde(default = "default_videos_dir")]
    pub videos_dir: PathBuf,
}

/// Local transcoding configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeConfig {
    /// Maximum number of encoded images kept in memory
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Quality used when the request does not set one
    #[serde(default = "default_quality")]
    pub default_quality: u8,
    /// Largest width/height a request may ask for
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// Upper bound on a single ffmpeg run
    #[serde(default = "default_transcode_timeout_secs")]
    pub timeout_secs: u64,
    /// ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Where encoded videos are written
    #[serde(default = "default_processed_videos_dir")]
    pub processed_videos_dir: PathBuf,
    /// Widths encoded for every catalog image at startup (local mode)
    #[serde(default)]
    pub prewarm_widths: Vec<u32>,
}

/// Processed artifact cleanup configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Artifacts older than this are deleted
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Resident memory above which the transcode cache is dropped
    #[serde(default = "default_memory_high_water_mb")]
    pub memory_high_water_mb: u64,
}

// Default value functions
fn default_service_name() -> String {
    "media-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bucket() -> String {
    "soluscore-media".to_string()
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3001
}

fn default_frontend_origin() -> String {
    "http://localhost:5173".to_string()
}

fn default_rate_limit_window_secs() -> u64 {
    15 * 60
}

fn default_rate_limit_max_requests() -> usize {
    30
}

fn default_allowed_referer_domains() -> Vec<String> {
    vec![
        "localhost:5173".to_string(),
        "s0va.run".to_string(),
        "www.s0va.run".to_string(),
    ]
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "https://s0va.run".to_string(),
        "https://www.s0va.run".to_string(),
    ]
}

fn default_blocked_user_agents() -> Vec<String> {
    [
        "bot", "crawler", "spider", "scraper", "wget", "curl", "python", "java", "perl", "ruby",
        "php",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("data/products.json")
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("public/images")
}

fn default_videos_dir() -> PathBuf {
    PathBuf::from("public/videos")
}

fn default_cache_capacity() -> usize {
    50
}

fn default_quality() -> u8 {
    80
}

fn default_max_dimension() -> u32 {
    4096
}

fn default_transcode_timeout_secs() -> u64 {
    120
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_processed_videos_dir() -> PathBuf {
    PathBuf::from("processed-videos")
}

fn default_sweep_interval_secs() -> u64 {
    15 * 60
}

fn default_retention_secs() -> u64 {
    2 * 60 * 60
}

fn default_memory_high_water_mb() -> u64 {
    400
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let env = |name: &str| std::env::var(name).ok();

        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/media").required(false))
            .add_source(config::File::with_name("/etc/portfolio/media").required(false))
            // Override with environment variables
            // MEDIA__STORAGE__BUCKET -> storage.bucket
            .add_source(
                config::Environment::with_prefix("MEDIA")
                    .separator("__")
                    .try_parsing(true),
            )
            // Flat variable names used by existing deployments win last
            .set_override_option("storage.endpoint_url", env("R2_ENDPOINT_URL"))?
            .set_override_option("storage.access_key_id", env("R2_ACCESS_KEY_ID"))?
            .set_override_option("storage.secret_access_key", env("R2_SECRET_ACCESS_KEY"))?
            .set_override_option("storage.bucket", env("R2_BUCKET_NAME"))?
            .set_override_option("storage.public_url_base", env("R2_PUBLIC_URL"))?
            .set_override_option("api.frontend_origin", env("FRONTEND_URL"))?
            .set_override_option("api.port", env("PORT"))?
            .set_override_option("service.environment", env("NODE_ENV"))?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.media.mode == MediaMode::SignedUrl && self.storage.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.bucket".to_string(),
            ));
        }

        if let Some(endpoint) = &self.storage.endpoint_url {
            if url::Url::parse(endpoint).is_err() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "storage.endpoint_url".to_string(),
                    message: format!("not a valid URL: {endpoint}"),
                });
            }
        }

        if self.storage.access_key_id.is_some() != self.storage.secret_access_key.is_some() {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.access_key_id/secret_access_key".to_string(),
                message: "Both keys must be set together".to_string(),
            });
        }

        if self.storage.presigned_url_expiry_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.presigned_url_expiry_secs".to_string(),
                message: "Expiry must be greater than 0".to_string(),
            });
        }

        if self.security.rate_limit_window_secs == 0 || self.security.rate_limit_max_requests == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "security.rate_limit_*".to_string(),
                message: "Window and request budget must be greater than 0".to_string(),
            });
        }

        if self.transcode.cache_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "transcode.cache_capacity".to_string(),
                message: "Capacity must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.transcode.default_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "transcode.default_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.transcode.max_dimension < 2 {
            return Err(ConfigValidationError::InvalidValue {
                field: "transcode.max_dimension".to_string(),
                message: "Maximum dimension must be at least 2".to_string(),
            });
        }

        if self.sweeper.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sweeper.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }

    /// Get storage request timeout as Duration
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.request_timeout_secs)
    }

    /// Get rate limit window as Duration
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.security.rate_limit_window_secs)
    }

    /// Get transcode timeout as Duration
    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode.timeout_secs)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.interval_secs)
    }

    /// Get artifact retention as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.sweeper.retention_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            environment: default_environment(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            public_url_base: None,
            force_path_style: true,
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            frontend_origin: default_frontend_origin(),
            absolute_media_urls: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            trusted_proxy_hops: 0,
            validate_requests: true,
            allowed_referer_domains: default_allowed_referer_domains(),
            allowed_origins: default_allowed_origins(),
            blocked_user_agents: default_blocked_user_agents(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            mode: MediaMode::default(),
            catalog_path: default_catalog_path(),
            require_catalog_membership: false,
            audit_on_startup: false,
            images_dir: default_images_dir(),
            videos_dir: default_videos_dir(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            default_quality: default_quality(),
            max_dimension: default_max_dimension(),
            timeout_secs: default_transcode_timeout_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            processed_videos_dir: default_processed_videos_dir(),
            prewarm_widths: Vec::new(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            retention_secs: default_retention_secs(),
            memory_high_water_mb: default_memory_high_water_mb(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_values() {
        assert_eq!(default_presigned_url_expiry_secs(), 3600);
        assert_eq!(default_cache_capacity(), 50);
        assert_eq!(default_rate_limit_max_requests(), 30);
        assert_eq!(default_retention_secs(), 7200);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_ok!(config.validate());
        assert_eq!(config.media.mode, MediaMode::SignedUrl);
        assert_eq!(config.presigned_url_expiry(), Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.transcode.cache_capacity = 0;

        match config.validate() {
            Err(ConfigValidationError::InvalidValue { field, .. }) => {
                assert_eq!(field, "transcode.cache_capacity");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_half_configured_credentials() {
        let mut config = Config::default();
        config.storage.access_key_id = Some("key".to_string());

        assert_err!(config.validate());

        config.storage.secret_access_key = Some("secret".to_string());
        assert_ok!(config.validate());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let mut config = Config::default();
        config.storage.endpoint_url = Some("not a url".to_string());

        assert_err!(config.validate());
    }

    #[test]
    fn test_validate_rejects_tiny_max_dimension() {
        let mut config = Config::default();
        config.transcode.max_dimension = 1;

        assert_err!(config.validate());
    }

    #[test]
    fn test_forwarded_for_is_untrusted_by_default() {
        assert_eq!(SecurityConfig::default().trusted_proxy_hops, 0);

        let config: SecurityConfig =
            serde_json::from_str(r#"{"trusted_proxy_hops": 1}"#).expect("valid security config");
        assert_eq!(config.trusted_proxy_hops, 1);
        assert_eq!(config.rate_limit_max_requests, 30);
    }

    #[test]
    fn test_media_mode_deserializes_snake_case() {
        let config: MediaConfig =
            serde_json::from_str(r#"{"mode": "local"}"#).expect("valid media config");
        assert_eq!(config.mode, MediaMode::Local);
        assert_eq!(config.catalog_path, PathBuf::from("data/products.json"));
    }
}
