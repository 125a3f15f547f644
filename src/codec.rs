//! Image decoding, pixel transforms, and encoding.
//!
//! The [`ImageCodec`] trait is the seam between the pipeline and the image
//! library: identify, decode, resample, encode. The production
//! implementation is [`RustCodec`] — pure Rust via the `image` crate,
//! statically linked.
//!
//! The in-between pixel transforms (crop, grayscale, background fill)
//! operate on plain RGBA buffers and live here as free functions, so the
//! pipeline composes them with cropper offsets without caring which codec
//! produced the buffer.

use image::imageops::{self, FilterType};
use image::{ImageFormat as LibFormat, ImageReader, Rgba, RgbaImage};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Source formats the proxy accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
}

impl SourceFormat {
    fn from_lib(format: LibFormat) -> Option<Self> {
        match format {
            LibFormat::Jpeg => Some(Self::Jpeg),
            LibFormat::Png => Some(Self::Png),
            LibFormat::Gif => Some(Self::Gif),
            LibFormat::Bmp => Some(Self::Bmp),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
        }
    }

    /// Format renditions of this source are encoded in. GIF and BMP have no
    /// place on the output side and become PNG.
    pub fn output(self) -> OutputFormat {
        match self {
            Self::Jpeg => OutputFormat::Jpeg,
            Self::Png | Self::Gif | Self::Bmp => OutputFormat::Png,
        }
    }
}

/// Formats renditions are encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// Whether the encoded output can carry an alpha channel. Background
    /// fill only applies to formats that can.
    pub fn supports_transparency(self) -> bool {
        matches!(self, Self::Png)
    }
}

/// Result of identifying a source file without decoding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub format: SourceFormat,
}

/// Encoder settings for one rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// JPEG quality, 0-100. Ignored for PNG.
    pub quality: u32,
    /// Progressive JPEG. Accepted for cache-key fidelity; [`RustCodec`]
    /// encodes baseline because the `image` crate's JPEG encoder has no
    /// progressive mode.
    pub progressive: bool,
}

/// The codec seam: everything the pipeline needs from an image library.
pub trait ImageCodec {
    /// Read dimensions and format from the file header.
    fn identify(&self, path: &Path) -> Result<SourceInfo, CodecError>;

    /// Decode the full image into an RGBA buffer.
    fn decode(&self, path: &Path) -> Result<RgbaImage, CodecError>;

    /// Resample to exactly `width`x`height`, then sharpen by `sharpening`
    /// (0 means no sharpening).
    fn resample(&self, image: &RgbaImage, width: u32, height: u32, sharpening: u32) -> RgbaImage;

    /// Encode the buffer into the output format.
    fn encode(
        &self,
        image: &RgbaImage,
        format: OutputFormat,
        options: &EncodeOptions,
    ) -> Result<Vec<u8>, CodecError>;
}

/// Production codec backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCodec;

impl ImageCodec for RustCodec {
    fn identify(&self, path: &Path) -> Result<SourceInfo, CodecError> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader
            .format()
            .and_then(SourceFormat::from_lib)
            .ok_or_else(|| CodecError::UnsupportedFormat(path.display().to_string()))?;
        let (width, height) = reader.into_dimensions()?;
        Ok(SourceInfo {
            width,
            height,
            format,
        })
    }

    fn decode(&self, path: &Path) -> Result<RgbaImage, CodecError> {
        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        Ok(image.to_rgba8())
    }

    fn resample(&self, image: &RgbaImage, width: u32, height: u32, sharpening: u32) -> RgbaImage {
        let resized = if image.dimensions() == (width, height) {
            image.clone()
        } else {
            imageops::resize(image, width, height, FilterType::Lanczos3)
        };
        sharpen(&resized, sharpening)
    }

    fn encode(
        &self,
        image: &RgbaImage,
        format: OutputFormat,
        options: &EncodeOptions,
    ) -> Result<Vec<u8>, CodecError> {
        let mut bytes = Vec::new();
        match format {
            OutputFormat::Jpeg => {
                // JPEG has no alpha channel; flatten onto black first, the
                // same compositing the premultiplied color math assumes.
                let opaque = image::DynamicImage::ImageRgba8(image.clone()).to_rgb8();
                let encoder =
                    JpegEncoder::new_with_quality(Cursor::new(&mut bytes), options.quality as u8);
                opaque.write_with_encoder(encoder)?;
            }
            OutputFormat::Png => {
                let encoder = PngEncoder::new(Cursor::new(&mut bytes));
                image.write_with_encoder(encoder)?;
            }
        }
        Ok(bytes)
    }
}

/// Unsharpening convolution: a 3x3 kernel whose center outweighs the
/// neighbors by `amount`. Zero leaves the buffer untouched.
fn sharpen(image: &RgbaImage, amount: u32) -> RgbaImage {
    if amount == 0 {
        return image.clone();
    }
    let divisor = amount as f32;
    let center = (amount + 12) as f32 / divisor;
    let edge = -1.0 / divisor;
    let side = -2.0 / divisor;
    let kernel = [edge, side, edge, side, center, side, edge, side, edge];
    imageops::filter3x3(image, &kernel)
}

/// Cut a `width`x`height` region starting at `(x, y)`.
///
/// The region must lie within the buffer; the resolver and croppers
/// guarantee that for pipeline callers.
pub fn crop_region(image: &RgbaImage, x: u32, y: u32, width: u32, height: u32) -> RgbaImage {
    imageops::crop_imm(image, x, y, width, height).to_image()
}

/// Desaturate in place using the Rec. 601 luma weights.
pub fn grayscale_in_place(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        let luma = (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64).round() as u8;
        *pixel = Rgba([luma, luma, luma, a]);
    }
}

/// Composite the buffer over a solid color, discarding transparency.
///
/// `color` is 6 lowercase hex digits, as validated by the request parser.
pub fn flatten_background(image: &mut RgbaImage, color: &str) {
    let Some((r, g, b)) = parse_hex_color(color) else {
        return;
    };
    for pixel in image.pixels_mut() {
        let [pr, pg, pb, pa] = pixel.0;
        let alpha = pa as f64 / 255.0;
        let blend = |fore: u8, back: u8| -> u8 {
            (fore as f64 * alpha + back as f64 * (1.0 - alpha)).round() as u8
        };
        *pixel = Rgba([blend(pr, r), blend(pg, g), blend(pb, b), 255]);
    }
}

/// Mime type of encoded image bytes, from the magic number.
///
/// Cache hits are served without decoding; this is how they get a content
/// type back.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8]) {
        Some("image/jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else {
        None
    }
}

fn parse_hex_color(color: &str) -> Option<(u8, u8, u8)> {
    if color.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&color[0..2], 16).ok()?;
    let g = u8::from_str_radix(&color[2..4], 16).ok()?;
    let b = u8::from_str_radix(&color[4..6], 16).ok()?;
    Some((r, g, b))
}
