//! Crop placement strategies.
//!
//! The resolver decides how big the cut is; a cropper decides where it
//! lands. Every strategy maps an already-resampled image plus the crop
//! dimensions to the top-left corner of the cut.

pub mod smart;

use image::RgbaImage;
use log::warn;
use serde::{Deserialize, Serialize};

/// Available crop placement strategies.
///
/// A fixed registry: the request names one of these, never arbitrary code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropperKind {
    /// Keep the middle of the image.
    Centered,
    /// Keep the top edge, centered horizontally. Good for portraits.
    TopCentered,
    /// Keep the region with the most color contrast.
    Smart,
}

impl CropperKind {
    /// Look up a strategy by its request-parameter name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "centered" => Some(Self::Centered),
            "topcentered" => Some(Self::TopCentered),
            "smart" => Some(Self::Smart),
            _ => None,
        }
    }

    /// Canonical name, as used in request parameters and cache keys.
    pub fn name(self) -> &'static str {
        match self {
            Self::Centered => "centered",
            Self::TopCentered => "topcentered",
            Self::Smart => "smart",
        }
    }
}

/// Top-left corner for cutting `crop` out of `image`.
///
/// `crop` must fit within the image. The smart strategy falls back to
/// centered placement when the image gives it nothing to analyze.
pub fn compute_offset(kind: CropperKind, image: &RgbaImage, crop: (u32, u32)) -> (u32, u32) {
    match kind {
        CropperKind::Centered => centered_offset(image.dimensions(), crop),
        CropperKind::TopCentered => {
            let (x, _) = centered_offset(image.dimensions(), crop);
            (x, 0)
        }
        CropperKind::Smart => match smart::smart_offset(image, crop) {
            Ok(offset) => offset,
            Err(err) => {
                warn!("smart crop analysis failed ({err}), falling back to centered");
                centered_offset(image.dimensions(), crop)
            }
        },
    }
}

fn centered_offset(image: (u32, u32), crop: (u32, u32)) -> (u32, u32) {
    let x = (image.0.saturating_sub(crop.0) as f64 / 2.0).round() as u32;
    let y = (image.1.saturating_sub(crop.1) as f64 / 2.0).round() as u32;
    (x, y)
}
