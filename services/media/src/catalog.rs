//! Read-only product catalog.
//!
//! The catalog is a JSON array loaded once at startup. Field names on the
//! wire follow what the gallery frontend already consumes (`image` for the
//! media list, `hasViolence` for the sensitive-content flag).

use crate::object_store::{ObjectStore, StoreError};
use crate::resolver::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Duplicate product id {0}")]
    DuplicateId(u32),
}

/// A single artwork/product record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: u32,
    pub name: String,
    /// Ordered media filenames
    #[serde(rename = "image")]
    pub media: Vec<String>,
    #[serde(default)]
    pub collection: String,
    #[serde(rename = "hasViolence", default)]
    pub has_sensitive_content: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Physical medium, e.g. "Oil on canvas"
    #[serde(rename = "media", default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
}

impl CatalogEntry {
    /// Copy of this entry with every media filename rewritten to its API route
    pub fn with_media_urls(&self, base_url: &str) -> CatalogEntry {
        CatalogEntry {
            media: self
                .media
                .iter()
                .map(|filename| media_url(base_url, filename))
                .collect(),
            ..self.clone()
        }
    }
}

/// API route serving `filename`, prefixed with `base_url` (may be empty)
pub fn media_url(base_url: &str, filename: &str) -> String {
    let kind = MediaKind::for_filename(filename);
    format!(
        "{}/api/media/{}/{}",
        base_url.trim_end_matches('/'),
        kind.route_segment(),
        filename
    )
}

/// Older catalogs stored media as `/images/<file>` or `/videos/<file>`;
/// objects live at the bucket root
fn strip_legacy_prefix(filename: &str) -> Option<&str> {
    ["/images/", "/videos/"]
        .iter()
        .find_map(|prefix| filename.strip_prefix(prefix))
}

/// In-memory catalog, immutable after load
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_id: HashMap<u32, usize>,
    media: HashSet<String>,
}

impl Catalog {
    /// Build a catalog from entries, rejecting duplicate ids
    pub fn from_entries(mut entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(entries.len());
        let mut media = HashSet::new();

        for entry in &mut entries {
            for filename in &mut entry.media {
                if let Some(bare) = strip_legacy_prefix(filename) {
                    *filename = bare.to_string();
                }
            }
        }

        for (index, entry) in entries.iter().enumerate() {
            if by_id.insert(entry.id, index).is_some() {
                return Err(CatalogError::DuplicateId(entry.id));
            }
            media.extend(entry.media.iter().cloned());
        }

        Ok(Self {
            entries,
            by_id,
            media,
        })
    }

    /// Load the catalog from a JSON file
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let entries: Vec<CatalogEntry> =
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let catalog = Self::from_entries(entries)?;

        info!(
            path = %path.display(),
            products = catalog.len(),
            media_files = catalog.media.len(),
            "Catalog loaded"
        );

        Ok(catalog)
    }

    pub fn all(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, id: u32) -> Option<&CatalogEntry> {
        self.by_id.get(&id).map(|&index| &self.entries[index])
    }

    /// Whether any entry references `filename`
    pub fn contains_media(&self, filename: &str) -> bool {
        self.media.contains(filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Media filenames referenced by the catalog but absent from the bucket
    #[instrument(skip_all)]
    pub async fn audit(&self, store: &dyn ObjectStore) -> Result<Vec<String>, StoreError> {
        let present: HashSet<String> = store.list_objects("").await?.into_iter().collect();

        let mut missing: Vec<String> = self
            .media
            .iter()
            .filter(|filename| !present.contains(*filename))
            .cloned()
            .collect();
        missing.sort();

        for filename in &missing {
            warn!(filename = %filename, "Catalog media missing from bucket");
        }

        Ok(missing)
    }
}
