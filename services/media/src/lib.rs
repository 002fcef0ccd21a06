//! Portfolio Media Service
//!
//! Backend for an art portfolio site. It serves the artwork catalog and
//! hands out media without exposing the bucket behind it.
//!
//! ## Features
//!
//! - **Catalog**: Read-only product records loaded from JSON at startup,
//!   with media filenames rewritten to API routes
//! - **Signed URL Delivery**: Media requests are validated, checked against
//!   object storage, and answered with a 302 to a short-lived presigned URL
//! - **Request Gatekeeping**: Per-client rate limiting, CORS, and
//!   referer/origin/user-agent checks on media routes
//! - **Local Transcoding** (deprecated): ffmpeg-backed image and video
//!   encoding from local disk with an in-memory image cache
//! - **Cleanup Sweeper**: Periodic removal of stale processed videos and
//!   cache release under memory pressure
//!
//! ## Architecture
//!
//! ```text
//!   Browser
//!      │
//!      ▼
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//! │ Rate Limit / │      │ Media        │      │ Object Store │
//! │ CORS / Check │─────▶│ Resolver     │─────▶│ Gateway (S3) │
//! └──────────────┘      └──────────────┘      └──────────────┘
//!      │                       │ 302 signed URL
//!      ▼                       ▼
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//! │ Catalog      │      │ Transcode    │◀─────│ Cleanup      │
//! │              │      │ Cache (local)│      │ Sweeper      │
//! └──────────────┘      └──────────────┘      └──────────────┘
//! ```

pub mod api;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod object_store;
pub mod resolver;
pub mod security;
pub mod sweeper;
pub mod transcode;

pub use api::{create_router, start_api_server, AppState, LocalMedia};
pub use catalog::{Catalog, CatalogEntry, CatalogError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, MediaMode};
pub use error::ApiError;
pub use object_store::{ObjectStore, S3Gateway, SignedUrlGrant, StorageObjectRef, StoreError};
pub use resolver::{MediaKind, MediaResolver, ResolveError};
pub use security::{RateDecision, RateLimiter, RequestValidator};
pub use sweeper::{CleanupSweeper, SweepReport};
pub use transcode::{
    FfmpegTranscoder, ImageFormat, ImageOptions, TranscodeCache, TranscodeError, VideoOptions,
    VideoProcessor,
};
