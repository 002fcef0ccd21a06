//! Filename to signed URL resolution.
//!
//! Every request is validated before the object store is contacted, so
//! traversal attempts never produce a network call.

use crate::catalog::Catalog;
use crate::object_store::{ObjectStore, SignedUrlGrant, StorageObjectRef, StoreError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "webm"];

/// Kind of media requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Catalog media are videos when the extension is a video extension
    pub fn for_filename(filename: &str) -> Self {
        if validate_extension(MediaKind::Video, filename).is_ok() {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }

    pub fn route_segment(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MediaKind::Image => "Image",
            MediaKind::Video => "Video",
        }
    }

    fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => IMAGE_EXTENSIONS,
            MediaKind::Video => VIDEO_EXTENSIONS,
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Invalid filename")]
    InvalidFilename,

    #[error("Invalid file type")]
    InvalidFileType,

    #[error("{} not found", .0.label())]
    NotFound(MediaKind),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reject empty names, parent references and path separators
pub fn validate_filename(filename: &str) -> Result<(), ResolveError> {
    if filename.is_empty()
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(ResolveError::InvalidFilename);
    }
    Ok(())
}

/// Reject extensions that do not belong to `kind`
pub fn validate_extension(kind: MediaKind, filename: &str) -> Result<(), ResolveError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .ok_or(ResolveError::InvalidFileType)?;

    if kind.allowed_extensions().contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ResolveError::InvalidFileType)
    }
}

/// Resolves media filenames into signed redirect targets
pub struct MediaResolver {
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
    /// When set, only filenames referenced by the catalog resolve
    catalog: Option<Arc<Catalog>>,
}

impl MediaResolver {
    pub fn new(store: Arc<dyn ObjectStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            catalog: None,
        }
    }

    /// Restrict resolution to media listed in `catalog`
    pub fn with_catalog_membership(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Validation shared by every entry point; never touches the network
    pub fn check(&self, kind: MediaKind, filename: &str) -> Result<(), ResolveError> {
        validate_filename(filename)?;
        validate_extension(kind, filename)?;

        if let Some(catalog) = &self.catalog {
            if !catalog.contains_media(filename) {
                debug!(filename = %filename, "Filename not referenced by catalog");
                return Err(ResolveError::NotFound(kind));
            }
        }

        Ok(())
    }

    /// Resolve `filename` to a signed URL
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        kind: MediaKind,
        filename: &str,
    ) -> Result<SignedUrlGrant, ResolveError> {
        self.check(kind, filename)?;

        if !self.store.exists(filename).await? {
            metrics::counter!("media_not_found_total", "kind" => kind.route_segment())
                .increment(1);
            return Err(ResolveError::NotFound(kind));
        }

        let grant = self
            .store
            .issue_signed_url(filename, self.ttl)
            .await
            .map_err(|e| {
                warn!(filename = %filename, error = %e, "Signing failed");
                e
            })?;

        metrics::counter!("media_redirects_total", "kind" => kind.route_segment()).increment(1);

        Ok(grant)
    }

    /// Object metadata for diagnostics
    #[instrument(skip(self))]
    pub async fn describe(
        &self,
        kind: MediaKind,
        filename: &str,
    ) -> Result<StorageObjectRef, ResolveError> {
        self.check(kind, filename)?;

        match self.store.get_metadata(filename).await {
            Ok(object) => Ok(StorageObjectRef {
                public_url: self.store.public_url(filename),
                ..object
            }),
            Err(StoreError::NotFound(_)) => Err(ResolveError::NotFound(kind)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::object_store::MockObjectStore;
    use std::time::SystemTime;

    fn grant_for(key: &str, ttl: Duration) -> SignedUrlGrant {
        SignedUrlGrant {
            target: format!(
                "https://account.r2.cloudflarestorage.com/soluscore-media/{key}?X-Amz-Expires={}",
                ttl.as_secs()
            ),
            issued_at: SystemTime::UNIX_EPOCH,
            ttl,
        }
    }

    fn untouched_store() -> Arc<dyn ObjectStore> {
        let mut store = MockObjectStore::new();
        store.expect_exists().times(0);
        store.expect_issue_signed_url().times(0);
        store.expect_get_metadata().times(0);
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_unsafe_filenames_never_reach_store() {
        let resolver = MediaResolver::new(untouched_store(), Duration::from_secs(3600));

        for filename in [
            "",
            "..",
            "../../etc/passwd",
            "a..b.webp",
            "dir/cat.webp",
            "dir\\cat.webp",
            "/cat.webp",
        ] {
            let result = resolver.resolve(MediaKind::Image, filename).await;
            assert!(
                matches!(result, Err(ResolveError::InvalidFilename)),
                "expected InvalidFilename for {filename:?}, got {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_wrong_extension_rejected_before_store() {
        let resolver = MediaResolver::new(untouched_store(), Duration::from_secs(3600));

        assert!(matches!(
            resolver.resolve(MediaKind::Video, "cat.webp").await,
            Err(ResolveError::InvalidFileType)
        ));
        assert!(matches!(
            resolver.resolve(MediaKind::Image, "README").await,
            Err(ResolveError::InvalidFileType)
        ));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let mut store = MockObjectStore::new();
        store
            .expect_exists()
            .withf(|key| key == "ghost.png")
            .times(1)
            .returning(|_| Ok(false));
        store.expect_issue_signed_url().times(0);

        let resolver = MediaResolver::new(Arc::new(store), Duration::from_secs(3600));

        assert!(matches!(
            resolver.resolve(MediaKind::Image, "ghost.png").await,
            Err(ResolveError::NotFound(MediaKind::Image))
        ));
    }

    #[tokio::test]
    async fn test_existing_object_resolves_to_signed_url() {
        let mut store = MockObjectStore::new();
        store.expect_exists().times(1).returning(|_| Ok(true));
        store
            .expect_issue_signed_url()
            .withf(|key, ttl| key == "cat.webp" && *ttl == Duration::from_secs(3600))
            .times(1)
            .returning(|key, ttl| Ok(grant_for(key, ttl)));

        let resolver = MediaResolver::new(Arc::new(store), Duration::from_secs(3600));
        let grant = resolver.resolve(MediaKind::Image, "cat.webp").await.unwrap();

        assert!(grant.target.contains("cat.webp"));
        assert!(grant.target.contains("X-Amz-Expires=3600"));
        assert_eq!(grant.ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut store = MockObjectStore::new();
        store.expect_exists().returning(|_| Ok(true));
        store
            .expect_issue_signed_url()
            .returning(|_, _| Err(StoreError::Presign("credentials rejected".to_string())));

        let resolver = MediaResolver::new(Arc::new(store), Duration::from_secs(3600));

        assert!(matches!(
            resolver.resolve(MediaKind::Video, "loop.mp4").await,
            Err(ResolveError::Store(StoreError::Presign(_)))
        ));
    }

    #[tokio::test]
    async fn test_catalog_membership_gate() {
        let catalog = Catalog::from_entries(vec![CatalogEntry {
            id: 1,
            name: "Signal Decay".to_string(),
            media: vec!["signal.webp".to_string()],
            collection: "Cache".to_string(),
            has_sensitive_content: false,
            date: None,
            dimensions: None,
            description: None,
            medium: None,
        }])
        .unwrap();

        let mut store = MockObjectStore::new();
        store
            .expect_exists()
            .withf(|key| key == "signal.webp")
            .times(1)
            .returning(|_| Ok(true));
        store
            .expect_issue_signed_url()
            .times(1)
            .returning(|key, ttl| Ok(grant_for(key, ttl)));

        let resolver = MediaResolver::new(Arc::new(store), Duration::from_secs(3600))
            .with_catalog_membership(Arc::new(catalog));

        assert!(matches!(
            resolver.resolve(MediaKind::Image, "unlisted.webp").await,
            Err(ResolveError::NotFound(MediaKind::Image))
        ));
        assert!(resolver.resolve(MediaKind::Image, "signal.webp").await.is_ok());
    }

    #[tokio::test]
    async fn test_describe_maps_not_found() {
        let mut store = MockObjectStore::new();
        store
            .expect_get_metadata()
            .returning(|key| Err(StoreError::NotFound(key.to_string())));

        let resolver = MediaResolver::new(Arc::new(store), Duration::from_secs(3600));

        assert!(matches!(
            resolver.describe(MediaKind::Image, "ghost.png").await,
            Err(ResolveError::NotFound(MediaKind::Image))
        ));
    }

    #[tokio::test]
    async fn test_describe_adds_public_url() {
        let mut store = MockObjectStore::new();
        store.expect_get_metadata().returning(|key| {
            Ok(StorageObjectRef {
                key: key.to_string(),
                content_type: Some("image/webp".to_string()),
                size: Some(512),
                last_modified: None,
                etag: None,
                public_url: None,
            })
        });
        store
            .expect_public_url()
            .returning(|key| Some(format!("https://media.s0va.run/{key}")));

        let resolver = MediaResolver::new(Arc::new(store), Duration::from_secs(3600));
        let object = resolver.describe(MediaKind::Image, "cat.webp").await.unwrap();

        assert_eq!(
            object.public_url.as_deref(),
            Some("https://media.s0va.run/cat.webp")
        );
        assert_eq!(object.size, Some(512));
    }

    #[test]
    fn test_media_kind_for_filename() {
        assert_eq!(MediaKind::for_filename("loop.mp4"), MediaKind::Video);
        assert_eq!(MediaKind::for_filename("cat.webp"), MediaKind::Image);
        assert_eq!(MediaKind::Video.route_segment(), "video");
    }

    #[test]
    fn test_every_video_extension_classifies_as_video() {
        for name in ["clip.mov", "clip.webm", "clip.AVI", "clip.mp4"] {
            let kind = MediaKind::for_filename(name);
            assert_eq!(kind, MediaKind::Video, "{name}");
            assert!(validate_extension(kind, name).is_ok(), "{name}");
        }
        assert_eq!(MediaKind::for_filename("clip.mp4.png"), MediaKind::Image);
    }

    #[test]
    fn test_extension_check_is_case_insensitive() {
        assert!(validate_extension(MediaKind::Image, "CAT.JPG").is_ok());
        assert!(validate_extension(MediaKind::Video, "clip.MOV").is_ok());
    }
}
