//! Content-addressed rendition cache.
//!
//! Two flat namespaces under the cache directory:
//!
//! - `rendered/<key>` — rendition bytes, keyed by the fully resolved
//!   rendering parameters. Two different requests that resolve to the same
//!   parameters share one entry.
//! - `request/<key>` — small indirection records, keyed by the raw request
//!   identity before any resolution. Each record holds the content key of
//!   its rendition, so repeat requests skip parsing-adjacent work entirely
//!   and disk usage stays proportional to distinct renditions.
//!
//! Writes are plain overwrites: concurrent duplicate renders produce
//! identical bytes, so last-writer-wins is harmless.

use crate::config::ProxyConfig;
use crate::crop::CropperKind;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of one rendition: everything that affects the output bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct RenditionIdentity<'a> {
    /// Absolute path of the source file.
    pub source_path: &'a Path,
    pub width: u32,
    pub height: u32,
    pub crop: Option<(u32, u32)>,
    pub cropper: CropperKind,
    pub quality: u32,
    pub mime: &'a str,
    pub progressive: bool,
    pub background: Option<&'a str>,
    pub grayscale: bool,
}

/// Cache key for a rendition, from its fully resolved parameters.
pub fn content_key(identity: &RenditionIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.source_path.as_os_str().as_encoded_bytes());
    hasher.update([0]);
    let (crop_w, crop_h) = identity.crop.unwrap_or((0, 0));
    hasher.update(
        format!(
            "{}x{} crop {}x{} {}",
            identity.width,
            identity.height,
            crop_w,
            crop_h,
            identity.cropper.name(),
        )
        .as_bytes(),
    );
    hasher.update([0]);
    hasher.update(
        format!(
            "q{} {} p{} b{} g{}",
            identity.quality,
            identity.mime,
            identity.progressive,
            identity.background.unwrap_or(""),
            identity.grayscale,
        )
        .as_bytes(),
    );
    hex_digest(hasher)
}

/// Cache key for a raw request, before any parsing or resolution.
///
/// The default cropper is part of the identity: the same URI renders
/// differently under a different configured default.
pub fn request_key(host: &str, uri: &str, default_cropper: CropperKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update([0]);
    hasher.update(uri.as_bytes());
    hasher.update([0]);
    hasher.update(default_cropper.name().as_bytes());
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// An entry is usable only while it is strictly newer than its source.
pub fn is_fresh(entry_mtime: SystemTime, source_mtime: SystemTime) -> bool {
    entry_mtime > source_mtime
}

/// A request-namespace hit: the rendition bytes plus the content key the
/// record pointed at.
#[derive(Debug)]
pub struct RequestHit {
    pub content_key: String,
    pub bytes: Vec<u8>,
}

/// Filesystem store for both cache namespaces.
#[derive(Debug, Clone)]
pub struct CacheStore {
    rendered_dir: PathBuf,
    request_dir: PathBuf,
}

impl CacheStore {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            rendered_dir: config.rendered_cache_dir(),
            request_dir: config.request_cache_dir(),
        }
    }

    /// Create both namespace directories if absent.
    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.rendered_dir)?;
        fs::create_dir_all(&self.request_dir)?;
        Ok(())
    }

    pub fn rendered_path(&self, key: &str) -> PathBuf {
        self.rendered_dir.join(key)
    }

    pub fn request_path(&self, key: &str) -> PathBuf {
        self.request_dir.join(key)
    }

    /// Rendition bytes for a content key, if present and fresh.
    pub fn fetch_rendered(
        &self,
        key: &str,
        source_mtime: SystemTime,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.rendered_path(key);
        let Ok(meta) = fs::metadata(&path) else {
            return Ok(None);
        };
        let entry_mtime = meta.modified()?;
        if !is_fresh(entry_mtime, source_mtime) {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }

    pub fn store_rendered(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.ensure_dirs()?;
        fs::write(self.rendered_path(key), bytes)?;
        Ok(())
    }

    /// Follow a request record to its rendition, if both are usable.
    ///
    /// A dangling record or a stale rendition is a miss; the sweep cleans
    /// dangling records up later.
    pub fn fetch_request(
        &self,
        key: &str,
        source_mtime: SystemTime,
    ) -> Result<Option<RequestHit>, StorageError> {
        let Ok(record) = fs::read_to_string(self.request_path(key)) else {
            return Ok(None);
        };
        let content_key = record.trim().to_string();
        if content_key.is_empty() {
            return Ok(None);
        }
        match self.fetch_rendered(&content_key, source_mtime)? {
            Some(bytes) => Ok(Some(RequestHit { content_key, bytes })),
            None => Ok(None),
        }
    }

    /// Write the request-namespace indirection record.
    pub fn store_request(&self, key: &str, content_key: &str) -> Result<(), StorageError> {
        self.ensure_dirs()?;
        fs::write(self.request_path(key), content_key)?;
        Ok(())
    }

    pub fn rendered_dir(&self) -> &Path {
        &self.rendered_dir
    }

    pub fn request_dir(&self) -> &Path {
        &self.request_dir
    }
}
