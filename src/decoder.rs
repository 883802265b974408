//! Turns one photo identifier into an RGBA raster, optionally subsampled.

use std::io::{self, Cursor};

use anyhow::{Context, Result, anyhow, bail};
use image::{DynamicImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage, imageops};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat};
use tracing::{debug, warn};

use crate::error::Error;
use crate::processing::resize::resize_rgba;
use crate::source::{PhotoId, PhotoSource};

/// Smallest size a decoded photo should keep along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetBound {
    pub width: u32,
    pub height: u32,
}

impl TargetBound {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn transposed(self) -> Self {
        Self::new(self.height, self.width)
    }
}

/// A decoded photo ready to be composited.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    id: PhotoId,
    pixels: RgbaImage,
}

impl DecodedImage {
    pub fn new(id: PhotoId, pixels: RgbaImage) -> Self {
        Self { id, pixels }
    }

    pub fn id(&self) -> &PhotoId {
        &self.id
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Largest power-of-two subsample factor that keeps both halved
/// dimensions at or above `bound`.
pub fn sample_size(width: u32, height: u32, bound: TargetBound) -> u32 {
    let req_w = bound.width.max(1);
    let req_h = bound.height.max(1);
    let mut factor = 1;
    if height > req_h || width > req_w {
        let half_h = height / 2;
        let half_w = width / 2;
        while half_h / factor >= req_h && half_w / factor >= req_w {
            factor *= 2;
        }
    }
    factor
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDecoder {
    apply_orientation: bool,
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self {
            apply_orientation: true,
        }
    }
}

impl ImageDecoder {
    pub fn new(apply_orientation: bool) -> Self {
        Self { apply_orientation }
    }

    /// Decodes `id` from `source`.
    ///
    /// Returns `None` when the photo vanished or cannot be decoded; a
    /// single bad photo never fails the batch it belongs to.
    pub fn decode(
        &self,
        source: &dyn PhotoSource,
        id: &PhotoId,
        bound: Option<TargetBound>,
    ) -> Option<DecodedImage> {
        let bytes = match source.read(id) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(%id, "photo no longer present in source");
                return None;
            }
            Err(err) => {
                let failure = Error::DecodeFailure {
                    id: id.clone(),
                    reason: err.to_string(),
                };
                warn!("{failure}");
                return None;
            }
        };

        match self.decode_bytes(&bytes, bound) {
            Ok(pixels) => {
                debug!(
                    %id,
                    width = pixels.width(),
                    height = pixels.height(),
                    "decoded photo"
                );
                Some(DecodedImage::new(id.clone(), pixels))
            }
            Err(err) => {
                let failure = Error::DecodeFailure {
                    id: id.clone(),
                    reason: format!("{err:#}"),
                };
                warn!("{failure}");
                None
            }
        }
    }

    fn decode_bytes(&self, bytes: &[u8], bound: Option<TargetBound>) -> Result<RgbaImage> {
        let orientation = if self.apply_orientation {
            read_orientation(bytes).unwrap_or(1)
        } else {
            1
        };

        // First pass: header only.
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .context("failed to guess image format")?;
        let format = reader.format();
        let (width, height) = reader
            .into_dimensions()
            .context("failed to read image dimensions")?;

        // Orientations 5..=8 swap the axes once applied.
        let bound = bound.map(|b| if orientation >= 5 { b.transposed() } else { b });
        let factor = bound.map_or(1, |b| sample_size(width, height, b));
        let target_w = (width / factor).max(1);
        let target_h = (height / factor).max(1);

        let mut img = if factor > 1 && format == Some(ImageFormat::Jpeg) {
            match decode_jpeg_scaled(bytes, target_w, target_h) {
                Ok(img) => img,
                Err(err) => {
                    debug!("scaled JPEG decode failed: {err:#}; falling back");
                    decode_generic(bytes)?
                }
            }
        } else {
            decode_generic(bytes)?
        };

        if img.dimensions() != (target_w, target_h) {
            img = resize_rgba(&img, target_w, target_h)?;
        }
        Ok(apply_orientation(img, orientation))
    }
}

fn decode_generic(bytes: &[u8]) -> Result<RgbaImage> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to guess image format")?
        .decode()
        .context("image decode failed")?;
    Ok(img.to_rgba8())
}

/// Lets libjpeg-style DCT scaling do the subsampling; the decoder picks
/// the smallest 1/8 step that still covers the request.
fn decode_jpeg_scaled(bytes: &[u8], target_w: u32, target_h: u32) -> Result<RgbaImage> {
    let jpeg_err = |err: jpeg_decoder::Error| match err {
        jpeg_decoder::Error::Unsupported(feature) => {
            anyhow!("unsupported JPEG feature: {feature:?}")
        }
        other => anyhow!(other),
    };
    let request = |v: u32| v.clamp(1, u32::from(u16::MAX)) as u16;

    let mut decoder = JpegDecoder::new(Cursor::new(bytes));
    decoder
        .scale(request(target_w), request(target_h))
        .map_err(jpeg_err)?;
    let pixels = decoder.decode().map_err(jpeg_err)?;
    let info = decoder.info().context("JPEG header missing after decode")?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));

    let decoded = match info.pixel_format {
        PixelFormat::RGB24 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        PixelFormat::L8 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        PixelFormat::CMYK32 => {
            RgbImage::from_raw(width, height, cmyk_to_rgb(&pixels)).map(DynamicImage::ImageRgb8)
        }
        PixelFormat::L16 => bail!("16-bit grayscale JPEG needs the full decoder"),
    };
    decoded
        .map(|img| img.to_rgba8())
        .context("scaled JPEG buffer does not match its header")
}

fn cmyk_to_rgb(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(4)
        .flat_map(|px| {
            let k = f32::from(px[3]) / 255.0;
            [px[0], px[1], px[2]].map(|v| {
                let c = f32::from(v) / 255.0 * (1.0 - k) + k;
                ((1.0 - c) * 255.0).round().clamp(0.0, 255.0) as u8
            })
        })
        .collect()
}

fn read_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0).map(|v| v as u16)
}

fn apply_orientation(img: RgbaImage, orientation: u16) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        // transpose
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        // transverse
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DirectorySource;
    use base64::Engine;
    use std::path::Path;

    // JPEG 2x1 with EXIF orientation 6 (rotate 90 CW), base64 encoded
    const ORIENT6_JPEG: &str = concat!(
        "/9j/4AAQSkZJRgABAQAAAQABAAD/4QAiRXhpZgAATU0AKgAAAAgAAQESAAMAAAABAAYAAAAAAAD/2wBDAAgGBgcGBQgHBwcJCQgKDBQNDAsLDBkSEw8UHRofHh0aHBwgJC4nICIsIxwcKDcpLDAxNDQ0Hyc5PTgyPC4zNDL/",
        "2wBDAQkJCQwLDBgNDRgyIRwhMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjL/wAARCAABAAIDASIAAhEBAxEB/8QAHwAAAQUBAQEBAQEAAAAAAAAAAAECAwQFBgcICQoL/8QAtRAAAgEDAwIEAwUFBAQAAAF9AQIDAAQRBRIhMUEGE1FhByJxFDKBkaEII0KxwRVS0fAkM2JyggkKFhcYGRolJicoKSo0NTY3ODk6Q0RFRkdISUpTVFVWV1hZWmNkZWZnaGlqc3R1dnd4eXqDhIWGh4iJipKTlJWWl5iZmqKjpKWmp6ipqrKztLW2t7i5usLDxMXGx8jJytLT1NXW19jZ2uHi4+Tl5ufo6erx8vP09fb3+Pn6/8QAHwEAAwEBAQEBAQEBAQAAAAAAAAECAwQFBgcICQoL/8QAtREAAgECBAQDBAcFBAQAAQJ3AAECAxEEBSExBhJBUQdhcRMiMoEIFEKRobHBCSMzUvAVYnLRChYkNOEl8RcYGRomJygpKjU2Nzg5OkNERUZHSElKU1RVVldYWVpjZGVmZ2hpanN0dXZ3eHl6goOEhYaHiImKkpOUlZaXmJmaoqOkpaanqKmqsrO0tba3uLm6wsPExcbHyMnK0tPU1dbX2Nna4uPk5ebn6Onq8vP09fb3+Pn6/9oADAMBAAIRAxEAPwDi6KKK+ZP3E//Z"
    );

    fn source_in(dir: &Path) -> DirectorySource {
        DirectorySource::new(dir.to_path_buf().into(), false)
    }

    #[test]
    fn sample_size_halves_while_both_axes_stay_above_bound() {
        assert_eq!(sample_size(800, 600, TargetBound::new(300, 300)), 2);
        assert_eq!(sample_size(4000, 3000, TargetBound::new(500, 375)), 8);
        assert_eq!(sample_size(200, 100, TargetBound::new(300, 300)), 1);
        assert_eq!(sample_size(800, 600, TargetBound::new(0, 0)), 512);
    }

    #[test]
    fn decode_subsamples_to_bound() {
        let dir = tempfile::tempdir().unwrap();
        RgbaImage::from_pixel(800, 600, image::Rgba([90, 120, 150, 255]))
            .save(dir.path().join("wide.png"))
            .unwrap();
        let source = source_in(dir.path());
        let decoded = ImageDecoder::default()
            .decode(
                &source,
                &PhotoId::new("wide.png"),
                Some(TargetBound::new(300, 300)),
            )
            .expect("photo decodes");
        assert_eq!((decoded.width(), decoded.height()), (400, 300));
        assert_eq!(decoded.id().as_str(), "wide.png");
    }

    #[test]
    fn applies_orientation_six() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ORIENT6_JPEG)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("orient6.jpg"), &bytes).unwrap();
        let source = source_in(dir.path());
        let decoded = ImageDecoder::default()
            .decode(&source, &PhotoId::new("orient6.jpg"), None)
            .unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1, 2));

        let raw = ImageDecoder::new(false)
            .decode(&source, &PhotoId::new("orient6.jpg"), None)
            .unwrap();
        assert_eq!((raw.width(), raw.height()), (2, 1));
    }

    #[test]
    fn large_jpeg_uses_the_scaled_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jpg");
        RgbImage::from_pixel(640, 480, image::Rgb([200, 60, 30]))
            .save(&path)
            .unwrap();
        let bytes = std::fs::read(&path).unwrap();

        let scaled = decode_jpeg_scaled(&bytes, 160, 120).unwrap();
        assert_eq!(scaled.dimensions(), (160, 120));
        let px = scaled.get_pixel(80, 60).0;
        for (got, want) in px.iter().zip([200u8, 60, 30, 255]) {
            assert!(got.abs_diff(want) <= 8, "color drifted: {px:?}");
        }

        let decoded = ImageDecoder::default()
            .decode(
                &source_in(dir.path()),
                &PhotoId::new("big.jpg"),
                Some(TargetBound::new(160, 120)),
            )
            .unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 120));
    }

    #[test]
    fn cmyk_ink_maps_to_rgb() {
        assert_eq!(cmyk_to_rgb(&[0, 0, 0, 0, 0, 0, 0, 255]), [255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn missing_and_corrupt_photos_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let source = source_in(dir.path());
        let decoder = ImageDecoder::default();
        assert!(decoder.decode(&source, &PhotoId::new("gone.jpg"), None).is_none());
        assert!(decoder.decode(&source, &PhotoId::new("broken.jpg"), None).is_none());
    }
}
