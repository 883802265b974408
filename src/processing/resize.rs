use anyhow::{Context, Result, ensure};
use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::RgbaImage;

/// Resamples `source` to exactly `width` × `height` with Catmull-Rom.
pub fn resize_rgba(source: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage> {
    ensure!(width > 0 && height > 0, "cannot resize to {width}x{height}");
    let (src_w, src_h) = source.dimensions();
    if (src_w, src_h) == (width, height) {
        return Ok(source.clone());
    }

    let view = ImageRef::new(src_w, src_h, source.as_raw(), PixelType::U8x4)?;
    let mut resized = Image::new(width, height, PixelType::U8x4);
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::CatmullRom));
    Resizer::new().resize(&view, &mut resized, &options)?;
    RgbaImage::from_raw(width, height, resized.into_vec())
        .with_context(|| format!("resampled buffer does not fill {width}x{height}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resizes_to_requested_dimensions() {
        let src = RgbaImage::from_pixel(40, 20, image::Rgba([10, 20, 30, 255]));
        let out = resize_rgba(&src, 10, 5).unwrap();
        assert_eq!(out.dimensions(), (10, 5));
        let px = out.get_pixel(4, 2).0;
        for (got, want) in px.iter().zip([10u8, 20, 30, 255]) {
            assert!(got.abs_diff(want) <= 1, "channel drifted: {px:?}");
        }
    }

    #[test]
    fn rejects_zero_targets() {
        let src = RgbaImage::new(4, 4);
        assert!(resize_rgba(&src, 0, 4).is_err());
    }
}
