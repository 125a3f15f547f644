//! Pure dimension and crop resolution.
//!
//! Turns source dimensions plus the requested constraints (max width, max
//! height, crop ratio) into the exact rendered dimensions and crop size.
//! All functions here are pure and testable without any I/O or images.

/// Fully resolved dimensions for one rendering.
///
/// `width`/`height` are the resample target; `crop` is the cut taken out of
/// the resampled image afterwards (already in rendered space). The cropper
/// strategies decide where the cut lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPlan {
    pub width: u32,
    pub height: u32,
    pub crop: Option<(u32, u32)>,
}

impl RenderPlan {
    /// Dimensions of the bytes that actually leave the pipeline.
    pub fn final_dimensions(&self) -> (u32, u32) {
        self.crop.unwrap_or((self.width, self.height))
    }
}

/// Resolve rendered and crop dimensions from source size and constraints.
///
/// A missing maximum, or one larger than the source, is clamped to the
/// source dimension — output is never upscaled. The crop ratio is
/// `width / height` of the desired cut; a ratio equal to the source's own
/// produces no crop.
///
/// The scale factor is chosen in three steps: scale by width if the
/// resulting height fits under `max_height`, otherwise scale by height if
/// the resulting width fits, otherwise (only reachable when cropping) use
/// the larger of the two source-relative factors so the cut itself lands
/// within both maximums.
///
/// Rounding is half-away-from-zero throughout.
///
/// # Examples
/// ```
/// # use reframe::resolve::resolve_render;
/// // 100x200 source, max width 50, square crop → 50x100 resample, 50x50 cut
/// let plan = resolve_render((100, 200), Some(50), None, Some(1.0));
/// assert_eq!((plan.width, plan.height), (50, 100));
/// assert_eq!(plan.crop, Some((50, 50)));
/// ```
pub fn resolve_render(
    source: (u32, u32),
    max_width: Option<u32>,
    max_height: Option<u32>,
    crop_ratio: Option<f64>,
) -> RenderPlan {
    let source_w = source.0 as f64;
    let source_h = source.1 as f64;
    let max_w = (max_width.map_or(source_w, f64::from)).min(source_w);
    let max_h = (max_height.map_or(source_h, f64::from)).min(source_h);

    // Crop box in source space. A ratio taller than the source cuts rows
    // off the height, a wider one cuts columns off the width.
    let source_ratio = source_w / source_h;
    let crop_box = crop_ratio.and_then(|ratio| {
        if ratio == source_ratio {
            None
        } else if ratio > source_ratio {
            Some((source_w, source_w / ratio))
        } else {
            Some((source_h * ratio, source_h))
        }
    });

    let width_factor = max_w / crop_box.map_or(source_w, |(w, _)| w);
    let height_factor = max_h / crop_box.map_or(source_h, |(_, h)| h);

    let factor = if (width_factor * source_h).floor() <= max_h {
        width_factor
    } else if (height_factor * source_w).floor() <= max_w {
        height_factor
    } else {
        // Neither single-axis factor keeps the resampled image inside the
        // box; scale so the cut does, against the uncropped source.
        (max_w / source_w).max(max_h / source_h)
    };

    RenderPlan {
        width: (factor * source_w).round() as u32,
        height: (factor * source_h).round() as u32,
        crop: crop_box.map(|(w, h)| ((factor * w).round() as u32, (factor * h).round() as u32)),
    }
}

/// Sharpening amount for a resample, from source and output pixel areas.
///
/// Smaller outputs lose more detail to the resampler and get sharpened
/// harder. The polynomial and its coefficients are empirically tuned; do not
/// adjust them without re-validating output quality across a range of sizes.
pub fn sharpening_factor(source_area: u64, final_area: u64) -> u32 {
    if source_area == 0 {
        return 0;
    }
    let scaled = (final_area as f64).sqrt() * 750.0 / (source_area as f64).sqrt();
    let amount = 52.0 - 0.278_106_508_875_731_24 * scaled
        + 0.000_473_372_781_065_089_46 * scaled * scaled;
    amount.round().max(0.0) as u32
}
