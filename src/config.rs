//! Proxy configuration.
//!
//! Handles loading and validating `reframe.toml`. The configuration is an
//! explicit value passed into the [`Pipeline`](crate::pipeline::Pipeline) and
//! its components at construction time — never a process-wide global — so
//! tests can run with isolated configurations concurrently.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! source_root = "."          # Directory request paths are resolved against
//! cache_dir = "cache"        # Holds the rendered/ and request/ namespaces
//! # default_image = "/images/missing.png"  # Served when the requested path is absent
//!
//! [rendering]
//! quality = 80               # JPEG quality when the request omits q
//! progressive = true         # Progressive JPEG when the request omits p
//! cropper = "centered"       # Crop strategy when the request omits one
//!
//! [cache]
//! request_cache = true       # Enable the fast request-identity namespace
//!
//! [gc]
//! probability = 1            # Chance of a sweep per request is
//! divisor = 200              #   probability / divisor (1/200 = 0.5%)
//! max_lifetime = 604800      # Seconds before a cache entry is garbage
//! ```
//!
//! ## Partial Configuration
//!
//! Config files are sparse — override just the values you want. Unknown keys
//! are rejected to catch typos early.

use crate::crop::CropperKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Proxy configuration loaded from `reframe.toml`.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Directory that request image paths are resolved against.
    pub source_root: PathBuf,
    /// Directory holding the `rendered/` and `request/` cache namespaces.
    pub cache_dir: PathBuf,
    /// Request-style path (leading slash, relative to `source_root`) served
    /// when the requested image does not exist. `None` means a missing image
    /// is an error.
    pub default_image: Option<String>,
    /// Defaults applied when the request omits a rendering parameter.
    pub rendering: RenderingConfig,
    /// Cache behavior settings.
    pub cache: CacheConfig,
    /// Garbage collection settings.
    pub gc: GcConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            cache_dir: PathBuf::from("cache"),
            default_image: None,
            rendering: RenderingConfig::default(),
            cache: CacheConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rendering.quality > 100 {
            return Err(ConfigError::Validation(
                "rendering.quality must be 0-100".into(),
            ));
        }
        if self.gc.divisor == 0 {
            return Err(ConfigError::Validation("gc.divisor must be nonzero".into()));
        }
        if self.gc.probability > self.gc.divisor {
            return Err(ConfigError::Validation(
                "gc.probability must not exceed gc.divisor".into(),
            ));
        }
        if let Some(default) = &self.default_image
            && !default.starts_with('/')
        {
            return Err(ConfigError::Validation(
                "default_image must start with a slash".into(),
            ));
        }
        Ok(())
    }

    /// Absolute filesystem path for a request-style path (`/a/b.jpg`).
    pub fn full_source_path(&self, request_path: &str) -> PathBuf {
        self.source_root.join(request_path.trim_start_matches('/'))
    }

    /// `<cache_dir>/rendered` — the content-identity namespace.
    pub fn rendered_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("rendered")
    }

    /// `<cache_dir>/request` — the request-identity namespace.
    pub fn request_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("request")
    }
}

/// Defaults applied when the request omits a rendering parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderingConfig {
    /// JPEG quality (0 = worst, 100 = best) when the request omits `q`.
    pub quality: u32,
    /// Progressive JPEG output when the request omits `p`.
    pub progressive: bool,
    /// Crop strategy when the crop ratio omits one.
    pub cropper: CropperKind,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            quality: 80,
            progressive: true,
            cropper: CropperKind::Centered,
        }
    }
}

/// Cache behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Enable the request-identity namespace as a first-line cache.
    pub request_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            request_cache: true,
        }
    }
}

/// Garbage collection settings.
///
/// The sweep runs on a request with probability `probability / divisor`,
/// e.g. 1/200 means a 0.5% chance per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    pub probability: u32,
    pub divisor: u32,
    /// Seconds after which a cache entry is considered garbage.
    pub max_lifetime: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            probability: 1,
            divisor: 200,
            max_lifetime: 604_800, // 7 days
        }
    }
}

/// Load config from a `reframe.toml` file.
///
/// A missing file yields the stock defaults. Unknown keys are rejected and
/// the result is validated.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    if !path.exists() {
        return Ok(ProxyConfig::default());
    }
    let content = fs::read_to_string(path)?;
    let config: ProxyConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Returns a fully-commented stock `reframe.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# reframe Configuration
# =====================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# Directory that request image paths are resolved against. A request for
# /photos/cat.jpg reads <source_root>/photos/cat.jpg.
source_root = "."

# Directory holding the two cache namespaces (rendered/ and request/).
# Must be writable by the process. Ideally outside any served tree.
cache_dir = "cache"

# Request-style path served when the requested image cannot be found.
# When unset, a missing image is an error.
# default_image = "/images/missing.png"

# ---------------------------------------------------------------------------
# Rendering defaults (used when the request omits the parameter)
# ---------------------------------------------------------------------------
[rendering]
# JPEG quality, 0 (worst, smallest) to 100 (best, largest).
quality = 80
# Whether JPEG output is progressive (interlaced).
progressive = true
# Crop strategy when the crop ratio does not name one.
# One of: "centered", "topcentered", "smart".
cropper = "centered"

# ---------------------------------------------------------------------------
# Caching
# ---------------------------------------------------------------------------
[cache]
# The request-identity namespace answers repeat requests without resolving
# dimensions at all. Disable if the extra directory is unwanted.
request_cache = true

# ---------------------------------------------------------------------------
# Garbage collection
# ---------------------------------------------------------------------------
[gc]
# A sweep runs on a request with probability probability/divisor.
probability = 1
divisor = 200
# Seconds before an unused cache entry may be deleted.
max_lifetime = 604800
"##
}
