//! Contrast-seeking crop placement.
//!
//! Scores rows (or columns) by how much their pixels differ from their
//! neighbors in Hunter-Lab space, then plays the near edge against the far
//! edge: each round compares the next candidate row from either side and
//! discards the less interesting one, until enough rows are gone. The
//! surviving window is where the crop lands.
//!
//! Analysis is deterministic for a fixed buffer: sampling positions are
//! fixed by the step size and all scratch state lives in one invocation.

use image::RgbaImage;
use std::collections::HashMap;
use thiserror::Error;

/// Elimination tolerance: a row must beat the other side by this factor to
/// win outright; anything closer is a draw.
const UPPER_TOLERANCE: f64 = 1.5;

/// Final-ratio threshold for the edge bias. Empirically tuned together with
/// the bias amount below; changing either requires re-validating crops
/// across a real image set.
const EDGE_BIAS_THRESHOLD: f64 = 1.875;

/// Fraction of the kept length the edge bias shifts the window by.
const EDGE_BIAS_AMOUNT: f64 = 0.03;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("nothing to analyze in a {0}x{1} crop")]
    DegenerateCrop(u32, u32),
    #[error("crop {0}x{1} exceeds image {2}x{3}")]
    CropTooLarge(u32, u32, u32, u32),
}

/// Top-left offset for the most interesting `crop`-sized window of `image`.
pub fn smart_offset(image: &RgbaImage, crop: (u32, u32)) -> Result<(u32, u32), AnalysisError> {
    let (width, height) = image.dimensions();
    let (crop_w, crop_h) = crop;

    if crop_w == 0 || crop_h == 0 || width == 0 || height == 0 {
        return Err(AnalysisError::DegenerateCrop(crop_w, crop_h));
    }
    if crop_w > width || crop_h > height {
        return Err(AnalysisError::CropTooLarge(crop_w, crop_h, width, height));
    }

    // The axis being reduced: rows come off the top and bottom when the
    // crop is proportionally wider than the image, columns otherwise.
    let top_bottom = crop_w as f64 / crop_h as f64 > width as f64 / height as f64;
    let (length, breadth, original) = if top_bottom {
        (crop_h, crop_w, height)
    } else {
        (crop_w, crop_h, width)
    };

    let rows_to_crop = original - length;
    if rows_to_crop == 0 {
        return Ok((0, 0));
    }

    let step = sampling_step(rows_to_crop, breadth);
    let mut analyzer = Analyzer::new(image, top_bottom);

    let mut near: i64 = 0;
    let mut far: i64 = 0;
    let mut returning_champion: Option<Side> = None;
    let mut ratio = 1.0;

    for _ in 0..rows_to_crop {
        let a = analyzer.row_interest(near as u32, step);
        let b = analyzer.row_interest(original - far as u32 - 1, step);

        ratio = if a == 0.0 && b == 0.0 {
            1.0
        } else if b == 0.0 {
            1.0 + a
        } else {
            a / b
        };

        if ratio > UPPER_TOLERANCE {
            far += 1;
            // Fightback: a side that keeps winning gets to reclaim a row
            // it lost earlier, in case that row was stronger.
            if returning_champion == Some(Side::Near) {
                near -= i64::from(near > 0);
            } else {
                returning_champion = Some(Side::Near);
            }
        } else if ratio < 1.0 / UPPER_TOLERANCE {
            near += 1;
            if returning_champion == Some(Side::Far) {
                far -= i64::from(far > 0);
            } else {
                returning_champion = Some(Side::Far);
            }
        } else {
            // Draw: discard from whichever side has lost the fewest rows
            if near > far {
                far += 1;
            } else {
                near += 1;
            }
            returning_champion = None;
        }
    }

    // A lopsided final round suggests important detail right at the edge;
    // shift the window a little toward the winning side.
    let bias = (length as f64 * EDGE_BIAS_AMOUNT).round() as i64;
    if ratio > EDGE_BIAS_THRESHOLD {
        near -= bias;
    } else if ratio < 1.0 / EDGE_BIAS_THRESHOLD {
        near += bias;
    }

    let offset = (rows_to_crop as i64).min(near.max(0)) as u32;
    Ok(if top_bottom { (0, offset) } else { (offset, 0) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Near,
    Far,
}

/// Spacing between sampled pixels within a row.
///
/// Sampling trades accuracy for speed and scales with the area being
/// cropped away. Steps below 4 save little (the neighbors get read anyway)
/// so they collapse to exhaustive sampling.
fn sampling_step(rows_to_crop: u32, breadth: u32) -> u32 {
    let step = ((rows_to_crop as f64 * breadth as f64).sqrt() / 10.0).round() as u32;
    if step < 4 { 1 } else { step }
}

/// Per-invocation scratch state: memoized color and interest values.
struct Analyzer<'a> {
    image: &'a RgbaImage,
    top_bottom: bool,
    lab: HashMap<(u32, u32), [f64; 3]>,
    interest: HashMap<(u32, u32), f64>,
}

impl<'a> Analyzer<'a> {
    fn new(image: &'a RgbaImage, top_bottom: bool) -> Self {
        Self {
            image,
            top_bottom,
            lab: HashMap::new(),
            interest: HashMap::new(),
        }
    }

    /// Interest score of one row (or column), from sampled pixels.
    ///
    /// The score is the sample sum pushed up toward the maximum, so a row
    /// with one striking detail beats a row of uniform mild noise.
    fn row_interest(&mut self, row: u32, step: u32) -> f64 {
        let span = if self.top_bottom {
            self.image.width()
        } else {
            self.image.height()
        };

        let mut sum = 0.0;
        let mut max = 0.0_f64;
        let mut samples = 0u32;
        for pos in (0..span).step_by(step as usize) {
            let (x, y) = if self.top_bottom { (pos, row) } else { (row, pos) };
            let interest = self.pixel_interest(x, y);
            max = max.max(interest);
            sum += interest;
            samples += 1;
        }
        if samples == 0 {
            return 0.0;
        }
        sum + (max - sum / samples as f64) * samples as f64
    }

    /// Mean color distance from a pixel to its in-bounds neighbors.
    fn pixel_interest(&mut self, x: u32, y: u32) -> f64 {
        if let Some(interest) = self.interest.get(&(x, y)) {
            return *interest;
        }

        let center = self.lab_at(x, y);
        let mut sum = 0.0;
        let mut count = 0u32;
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                if nx < 0
                    || ny < 0
                    || nx >= i64::from(self.image.width())
                    || ny >= i64::from(self.image.height())
                {
                    continue;
                }
                let neighbor = self.lab_at(nx as u32, ny as u32);
                sum += delta_e(center, neighbor);
                count += 1;
            }
        }

        let interest = if count == 0 { 0.0 } else { sum / count as f64 };
        self.interest.insert((x, y), interest);
        interest
    }

    fn lab_at(&mut self, x: u32, y: u32) -> [f64; 3] {
        if let Some(lab) = self.lab.get(&(x, y)) {
            return *lab;
        }
        let pixel = self.image.get_pixel(x, y).0;
        let lab = hunter_lab(pixel[0], pixel[1], pixel[2], pixel[3]);
        self.lab.insert((x, y), lab);
        lab
    }
}

/// Hunter-Lab value of an RGBA pixel, alpha-premultiplied against black.
fn hunter_lab(r: u8, g: u8, b: u8, alpha: u8) -> [f64; 3] {
    let a = alpha as f64 / 255.0;
    xyz_to_hunter_lab(rgb_to_xyz(r as f64 * a, g as f64 * a, b as f64 * a))
}

/// sRGB (0-255 components) to CIE-XYZ, D65 illuminant, 2° observer.
fn rgb_to_xyz(r: f64, g: f64, b: f64) -> [f64; 3] {
    fn linear(channel: f64) -> f64 {
        let c = channel / 255.0;
        let l = if c > 0.04045 {
            ((c + 0.055) / 1.055).powf(2.4)
        } else {
            c / 12.92
        };
        l * 100.0
    }

    let (r, g, b) = (linear(r), linear(g), linear(b));
    [
        r * 0.4124 + g * 0.3576 + b * 0.1805,
        r * 0.2126 + g * 0.7152 + b * 0.0722,
        r * 0.0193 + g * 0.1192 + b * 0.9505,
    ]
}

fn xyz_to_hunter_lab(xyz: [f64; 3]) -> [f64; 3] {
    let [x, y, z] = xyz;
    if y == 0.0 {
        return [0.0, 0.0, 0.0];
    }
    [
        10.0 * y.sqrt(),
        17.5 * ((1.02 * x - y) / y.sqrt()),
        7.0 * ((y - 0.847 * z) / y.sqrt()),
    ]
}

/// Euclidean distance between two Lab colors.
fn delta_e(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
