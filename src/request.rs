//! Request parsing and validation.
//!
//! Turns a raw request identity (the part of the URL after the proxy mount)
//! into a fully validated [`TransformRequest`]. All validation happens here,
//! eagerly — the rendering pipeline only ever sees valid requests.
//!
//! ## Parameter mini-language
//!
//! Parameters are hyphen-separated `<letter><value>` tokens in the first
//! path segment, followed by the source image path:
//!
//! ```text
//! w300-h300-c1.1.smart/photos/cat.jpg
//! ```
//!
//! | Code | Meaning |
//! |---|---|
//! | `w` | Maximum width |
//! | `h` | Maximum height |
//! | `c` | Crop ratio: `width` `:`/`.`/`x` `height`, optional third token names the cropper |
//! | `q` | Quality (0-100) |
//! | `b` | Background fill color (`RRGGBB` or `RGB`) |
//! | `p` | Progressive (0 or 1) |
//! | `g` | Grayscale (0 or 1) |
//!
//! Numeric values are cast loosely (truncating, `"100.9"` → `100`) and
//! boolean values follow legacy truthiness (`""` and `"0"` are false,
//! anything else — including `"false"` — is true). Both behaviors are kept
//! verbatim for URL compatibility with existing deployments.

use crate::config::ProxyConfig;
use crate::crop::CropperKind;
use percent_encoding::percent_decode_str;
use std::path::PathBuf;
use thiserror::Error;

/// Characters accepted as the crop-ratio delimiter.
const CROP_RATIO_DELIMITERS: [char; 3] = [':', '.', 'x'];

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("not enough parameters in request: {0:?}")]
    MissingParameters(String),
    #[error("dimension must be greater than 0: {0}")]
    InvalidDimension(i64),
    #[error("quality must be between 0 and 100: {0}")]
    InvalidQuality(i64),
    #[error("background fill color must be 3 or 6 hex digits: {0:?}")]
    InvalidColor(String),
    #[error("crop ratio must be [width]x[height] with nonzero parts: {0:?}")]
    InvalidCropRatio(String),
    #[error("unknown cropper: {0:?}")]
    UnknownCropper(String),
    #[error("image path may not contain \"..\", \"<\", \">\", or \":\" in a directory: {0:?}")]
    InsecurePath(String),
    #[error("image does not exist: {0}")]
    ImageNotFound(PathBuf),
}

/// Raw identity of one inbound request, as the transport layer saw it.
///
/// `uri` is the portion after the proxy mount point, e.g.
/// `w300-h300-c1.1/photos/cat.jpg`. The request-cache key is derived from
/// this identity alone, before any parsing or resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub host: String,
    pub uri: String,
}

impl RequestIdentity {
    pub fn new(host: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            uri: uri.into(),
        }
    }
}

/// Requested crop ratio, e.g. `2:1` for a wide rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRatio {
    pub width: f64,
    pub height: f64,
    /// `width / height`.
    pub ratio: f64,
}

/// One validated transformation request.
///
/// Constructed once per inbound request, immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    /// Normalized source path, always with a single leading slash.
    pub path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crop: Option<CropRatio>,
    /// Cropper named in the crop-ratio token, if any.
    pub cropper: Option<CropperKind>,
    pub quality: Option<u32>,
    pub progressive: Option<bool>,
    pub grayscale: bool,
    /// Background fill color, 6 lowercase hex digits.
    pub background: Option<String>,
    /// True when the requested image was missing and the configured default
    /// path was substituted.
    pub using_default_path: bool,
}

impl TransformRequest {
    /// Parse and validate a request from its raw URI form.
    pub fn from_uri(uri: &str, config: &ProxyConfig) -> Result<Self, RequestError> {
        let (param_segment, raw_path) = split_uri(uri)?;
        let params = parse_param_tokens(param_segment);
        Self::from_parts(&params, raw_path, config)
    }

    /// Build a request from pre-split `(code, value)` pairs and a raw path.
    pub fn from_parts(
        params: &[(char, String)],
        raw_path: &str,
        config: &ProxyConfig,
    ) -> Result<Self, RequestError> {
        let mut request = Self {
            path: String::new(),
            width: None,
            height: None,
            crop: None,
            cropper: None,
            quality: None,
            progressive: None,
            grayscale: false,
            background: None,
            using_default_path: false,
        };

        request.set_path(raw_path, config)?;

        for (code, value) in params {
            match code {
                'w' => request.set_width(value)?,
                'h' => request.set_height(value)?,
                'q' => request.set_quality(value)?,
                'p' => request.progressive = Some(loose_bool(value)),
                'g' => request.grayscale = loose_bool(value),
                'b' => request.set_background(value)?,
                'c' => request.set_crop_ratio(value)?,
                // Path aliases and unknown codes are ignored; the path was
                // already taken from the URI tail.
                _ => {}
            }
        }

        Ok(request)
    }

    /// Whether a crop ratio was requested.
    pub fn is_cropping(&self) -> bool {
        self.crop.is_some()
    }

    fn set_width(&mut self, value: &str) -> Result<(), RequestError> {
        let width = loose_int(value);
        if width < 1 {
            return Err(RequestError::InvalidDimension(width));
        }
        self.width = Some(width as u32);
        Ok(())
    }

    fn set_height(&mut self, value: &str) -> Result<(), RequestError> {
        let height = loose_int(value);
        if height < 1 {
            return Err(RequestError::InvalidDimension(height));
        }
        self.height = Some(height as u32);
        Ok(())
    }

    fn set_quality(&mut self, value: &str) -> Result<(), RequestError> {
        let quality = loose_int(value);
        if !(0..=100).contains(&quality) {
            return Err(RequestError::InvalidQuality(quality));
        }
        self.quality = Some(quality as u32);
        Ok(())
    }

    fn set_background(&mut self, value: &str) -> Result<(), RequestError> {
        let decoded = percent_decode_str(value).decode_utf8_lossy();
        let hex: String = decoded
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect::<String>()
            .to_ascii_lowercase();

        let expanded = match hex.len() {
            // Shorthand: each digit doubles ("fa8" -> "ffaa88")
            3 => hex.chars().flat_map(|c| [c, c]).collect(),
            6 => hex,
            _ => return Err(RequestError::InvalidColor(value.to_string())),
        };
        self.background = Some(expanded);
        Ok(())
    }

    fn set_crop_ratio(&mut self, value: &str) -> Result<(), RequestError> {
        let decoded = percent_decode_str(value).decode_utf8_lossy();
        let parts: Vec<&str> = decoded.split(CROP_RATIO_DELIMITERS).collect();
        if parts.len() < 2 {
            return Err(RequestError::InvalidCropRatio(value.to_string()));
        }

        let width = loose_float(parts[0]);
        let height = loose_float(parts[1]);
        if width == 0.0 || height == 0.0 {
            return Err(RequestError::InvalidCropRatio(value.to_string()));
        }

        self.crop = Some(CropRatio {
            width,
            height,
            ratio: width / height,
        });

        // A third part names the cropper; anything after it is ignored.
        if let Some(name) = parts.get(2) {
            self.cropper = Some(
                CropperKind::from_name(name)
                    .ok_or_else(|| RequestError::UnknownCropper(name.to_string()))?,
            );
        }
        Ok(())
    }

    fn set_path(&mut self, raw: &str, config: &ProxyConfig) -> Result<(), RequestError> {
        let decoded = percent_decode_str(raw).decode_utf8_lossy();
        let path = localize_path(&decoded);

        if !is_path_secure(&path) {
            return Err(RequestError::InsecurePath(path));
        }

        let full = config.full_source_path(&path);
        if full.is_file() {
            self.path = path;
            return Ok(());
        }

        // One substitution only: a default that points at another missing
        // file is itself an error.
        if let Some(default) = &config.default_image
            && !self.using_default_path
        {
            self.using_default_path = true;
            return self.set_path(default, config);
        }

        Err(RequestError::ImageNotFound(full))
    }
}

/// Split a request URI into the parameter segment and the image path.
fn split_uri(uri: &str) -> Result<(&str, &str), RequestError> {
    let trimmed = uri.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((params, path)) if !path.is_empty() => Ok((params, path)),
        _ => Err(RequestError::MissingParameters(uri.to_string())),
    }
}

/// Split a hyphen-separated parameter segment into `(code, value)` pairs.
///
/// Tokens shorter than two characters carry no value and are skipped.
fn parse_param_tokens(segment: &str) -> Vec<(char, String)> {
    segment
        .split('-')
        .filter_map(|token| {
            let mut chars = token.chars();
            let code = chars.next()?;
            let value = chars.as_str();
            (!value.is_empty()).then(|| (code, value.to_string()))
        })
        .collect()
}

/// Legacy loose integer cast: parse the leading numeric prefix, truncate.
fn loose_int(value: &str) -> i64 {
    loose_float(value).trunc() as i64
}

/// Legacy loose float cast: parse the leading numeric prefix, 0.0 otherwise.
fn loose_float(value: &str) -> f64 {
    let trimmed = value.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in trimmed.char_indices() {
        match c {
            '+' | '-' if i == 0 => end = i + 1,
            '0'..='9' => end = i + 1,
            '.' if !seen_dot => {
                seen_dot = true;
                end = i + 1;
            }
            _ => break,
        }
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

/// Legacy loose boolean cast: `""` and `"0"` are false, anything else true.
fn loose_bool(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

/// Strip scheme+host and query string, collapse to one leading slash.
fn localize_path(path: &str) -> String {
    let without_domain = strip_protocol_and_domain(path);
    let without_query = without_domain
        .split_once('?')
        .map_or(without_domain, |(p, _)| p);
    format!("/{}", without_query.trim_matches('/'))
}

fn strip_protocol_and_domain(path: &str) -> &str {
    if let Some(scheme_end) = path.find("://") {
        // Only treat it as a URL when the scheme has no slashes of its own
        if !path[..scheme_end].contains('/') {
            let after_scheme = &path[scheme_end + 3..];
            return after_scheme
                .find('/')
                .map_or("", |host_end| &after_scheme[host_end..]);
        }
    }
    path
}

/// Directories may not contain `:`; the whole path may not contain
/// `..`, `<`, or `>`.
fn is_path_secure(path: &str) -> bool {
    if path.contains("..") || path.contains('<') || path.contains('>') {
        return false;
    }
    let dir = path.rsplit_once('/').map_or("", |(dir, _)| dir);
    !dir.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Config rooted in a temp dir containing the given image files.
    fn config_with_images(files: &[&str]) -> (TempDir, ProxyConfig) {
        let tmp = TempDir::new().unwrap();
        for file in files {
            let path = tmp.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"image bytes").unwrap();
        }
        let config = ProxyConfig {
            source_root: tmp.path().to_path_buf(),
            ..ProxyConfig::default()
        };
        (tmp, config)
    }

    fn parse(uri: &str, config: &ProxyConfig) -> Result<TransformRequest, RequestError> {
        TransformRequest::from_uri(uri, config)
    }

    // =========================================================================
    // URI splitting and token parsing
    // =========================================================================

    #[test]
    fn uri_splits_params_from_path() {
        let (_tmp, config) = config_with_images(&["photos/cat.jpg"]);
        let request = parse("w300-h200/photos/cat.jpg", &config).unwrap();
        assert_eq!(request.width, Some(300));
        assert_eq!(request.height, Some(200));
        assert_eq!(request.path, "/photos/cat.jpg");
    }

    #[test]
    fn uri_without_path_is_rejected() {
        let (_tmp, config) = config_with_images(&[]);
        assert!(matches!(
            parse("w300", &config),
            Err(RequestError::MissingParameters(_))
        ));
    }

    #[test]
    fn short_tokens_are_ignored() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("w50--x-/cat.jpg", &config).unwrap();
        assert_eq!(request.width, Some(50));
        assert_eq!(request.height, None);
    }

    #[test]
    fn unknown_codes_are_ignored() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("w50-z9/cat.jpg", &config).unwrap();
        assert_eq!(request.width, Some(50));
    }

    // =========================================================================
    // Dimensions and quality
    // =========================================================================

    #[test]
    fn width_truncates_not_rounds() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("w100.9/cat.jpg", &config).unwrap();
        assert_eq!(request.width, Some(100));
    }

    #[test]
    fn zero_width_is_rejected() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert!(matches!(
            parse("w0/cat.jpg", &config),
            Err(RequestError::InvalidDimension(0))
        ));
    }

    #[test]
    fn non_numeric_height_is_rejected() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert!(matches!(
            parse("habc/cat.jpg", &config),
            Err(RequestError::InvalidDimension(0))
        ));
    }

    #[test]
    fn quality_bounds_are_inclusive() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert_eq!(parse("q0/cat.jpg", &config).unwrap().quality, Some(0));
        assert_eq!(parse("q100/cat.jpg", &config).unwrap().quality, Some(100));
        assert!(matches!(
            parse("q101/cat.jpg", &config),
            Err(RequestError::InvalidQuality(101))
        ));
    }

    // =========================================================================
    // Loose boolean coercion (legacy compatibility)
    // =========================================================================

    #[test]
    fn progressive_zero_and_empty_are_false() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("w50-p0/cat.jpg", &config).unwrap();
        assert_eq!(request.progressive, Some(false));
    }

    #[test]
    fn progressive_false_string_is_true() {
        // Legacy coercion: any non-empty string except "0" is true
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("pfalse/cat.jpg", &config).unwrap();
        assert_eq!(request.progressive, Some(true));
    }

    #[test]
    fn grayscale_one_is_true() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert!(parse("g1/cat.jpg", &config).unwrap().grayscale);
        assert!(!parse("g0/cat.jpg", &config).unwrap().grayscale);
    }

    // =========================================================================
    // Background color
    // =========================================================================

    #[test]
    fn background_shorthand_expands() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("bfa8/cat.jpg", &config).unwrap();
        assert_eq!(request.background.as_deref(), Some("ffaa88"));
    }

    #[test]
    fn background_longhand_passes_through() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("b99AA00/cat.jpg", &config).unwrap();
        assert_eq!(request.background.as_deref(), Some("99aa00"));
    }

    #[test]
    fn background_strips_non_hex_then_validates() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        // "#fa8" -> "fa8" -> expands
        let request = parse("b%23fa8/cat.jpg", &config);
        // %23 is '#': stripped as non-hex before length check
        assert_eq!(
            request.unwrap().background.as_deref(),
            Some("ffaa88"),
        );
    }

    #[test]
    fn background_wrong_length_is_rejected() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert!(matches!(
            parse("bffaa/cat.jpg", &config),
            Err(RequestError::InvalidColor(_))
        ));
    }

    // =========================================================================
    // Crop ratio
    // =========================================================================

    #[test]
    fn crop_ratio_delimiters_are_equivalent() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        for uri in ["c2x1/cat.jpg", "c2:1/cat.jpg", "c2.1/cat.jpg"] {
            let crop = parse(uri, &config).unwrap().crop.unwrap();
            assert_eq!(crop.width, 2.0);
            assert_eq!(crop.height, 1.0);
            assert_eq!(crop.ratio, 2.0);
        }
    }

    #[test]
    fn crop_ratio_zero_part_is_rejected() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert!(matches!(
            parse("c0x1/cat.jpg", &config),
            Err(RequestError::InvalidCropRatio(_))
        ));
        assert!(matches!(
            parse("c2x0/cat.jpg", &config),
            Err(RequestError::InvalidCropRatio(_))
        ));
    }

    #[test]
    fn crop_ratio_single_token_is_rejected() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert!(matches!(
            parse("c2/cat.jpg", &config),
            Err(RequestError::InvalidCropRatio(_))
        ));
    }

    #[test]
    fn crop_ratio_third_token_names_cropper() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("c1.1.smart/cat.jpg", &config).unwrap();
        assert_eq!(request.cropper, Some(CropperKind::Smart));
    }

    #[test]
    fn crop_ratio_extra_tokens_are_ignored() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = parse("c1.1.topcentered.junk/cat.jpg", &config).unwrap();
        assert_eq!(request.cropper, Some(CropperKind::TopCentered));
    }

    #[test]
    fn crop_ratio_unknown_cropper_is_rejected() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        assert!(matches!(
            parse("c1.1.bogus/cat.jpg", &config),
            Err(RequestError::UnknownCropper(_))
        ));
    }

    // =========================================================================
    // Path handling
    // =========================================================================

    #[test]
    fn path_is_percent_decoded() {
        let (_tmp, config) = config_with_images(&["photos/a b.jpg"]);
        let request = parse("w50/photos/a%20b.jpg", &config).unwrap();
        assert_eq!(request.path, "/photos/a b.jpg");
    }

    #[test]
    fn path_strips_protocol_and_domain() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request =
            TransformRequest::from_parts(&[], "http://example.com/cat.jpg", &config).unwrap();
        assert_eq!(request.path, "/cat.jpg");
    }

    #[test]
    fn path_strips_query_string() {
        let (_tmp, config) = config_with_images(&["cat.jpg"]);
        let request = TransformRequest::from_parts(&[], "/cat.jpg?v=3", &config).unwrap();
        assert_eq!(request.path, "/cat.jpg");
    }

    #[test]
    fn path_with_dotdot_is_insecure() {
        let (_tmp, config) = config_with_images(&[]);
        assert!(matches!(
            parse("w50/../etc/passwd", &config),
            Err(RequestError::InsecurePath(_))
        ));
    }

    #[test]
    fn path_with_angle_brackets_is_insecure() {
        let (_tmp, config) = config_with_images(&[]);
        assert!(matches!(
            parse("w50/a<b.jpg", &config),
            Err(RequestError::InsecurePath(_))
        ));
    }

    #[test]
    fn colon_in_directory_is_insecure() {
        let (_tmp, config) = config_with_images(&[]);
        assert!(matches!(
            parse("w50/a:b/cat.jpg", &config),
            Err(RequestError::InsecurePath(_))
        ));
    }

    #[test]
    fn colon_in_filename_is_allowed() {
        let (_tmp, config) = config_with_images(&["12:30.jpg"]);
        let request = parse("w50/12:30.jpg", &config).unwrap();
        assert_eq!(request.path, "/12:30.jpg");
    }

    #[test]
    fn missing_image_without_default_is_not_found() {
        let (_tmp, config) = config_with_images(&[]);
        assert!(matches!(
            parse("w50/gone.jpg", &config),
            Err(RequestError::ImageNotFound(_))
        ));
    }

    #[test]
    fn missing_image_substitutes_default_once() {
        let (_tmp, mut config) = config_with_images(&["missing.png"]);
        config.default_image = Some("/missing.png".into());
        let request = parse("w50/gone.jpg", &config).unwrap();
        assert_eq!(request.path, "/missing.png");
        assert!(request.using_default_path);
    }

    #[test]
    fn missing_default_image_is_an_error() {
        let (_tmp, mut config) = config_with_images(&[]);
        config.default_image = Some("/also-gone.png".into());
        assert!(matches!(
            parse("w50/gone.jpg", &config),
            Err(RequestError::ImageNotFound(_))
        ));
    }

    #[test]
    fn existing_image_does_not_use_default() {
        let (_tmp, mut config) = config_with_images(&["cat.jpg", "missing.png"]);
        config.default_image = Some("/missing.png".into());
        let request = parse("w50/cat.jpg", &config).unwrap();
        assert_eq!(request.path, "/cat.jpg");
        assert!(!request.using_default_path);
    }

    // =========================================================================
    // Loose casts
    // =========================================================================

    #[test]
    fn loose_int_takes_numeric_prefix() {
        assert_eq!(loose_int("12abc"), 12);
        assert_eq!(loose_int("100.9"), 100);
        assert_eq!(loose_int("-5"), -5);
        assert_eq!(loose_int("abc"), 0);
        assert_eq!(loose_int(""), 0);
    }

    #[test]
    fn loose_float_parses_prefix() {
        assert_eq!(loose_float("2.5x"), 2.5);
        assert_eq!(loose_float("x"), 0.0);
    }
}
