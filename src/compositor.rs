//! Draws a batch of decoded photos into a grid on an RGBA canvas.

use anyhow::Result;
use image::{Rgba, RgbaImage, imageops};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Appearance, GridConfig, ScaleMode};
use crate::decoder::DecodedImage;
use crate::error::Error;
use crate::prefetch::Slot;
use crate::processing::layout::{
    Anchor, CanvasSize, Fit, GridShape, Rect, cell_rect, crop_source_rect, fit_transform,
};
use crate::processing::resize::resize_rgba;
use crate::surface::{Frame, Surface};
use crate::text::TextPainter;

/// What one render pass ended up drawing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOutcome {
    pub cells_drawn: usize,
    pub empty_state: bool,
    pub abandoned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GridCompositor {
    text: TextPainter,
}

impl GridCompositor {
    pub fn new(text: TextPainter) -> Self {
        Self { text }
    }

    pub fn layout(canvas: CanvasSize, shape: GridShape, cell_index: usize) -> Rect {
        cell_rect(canvas, shape, cell_index)
    }

    /// Draws one photo, or the placeholder when it is absent.
    pub fn draw_cell(
        &self,
        canvas: &mut RgbaImage,
        image: Option<&DecodedImage>,
        dst: Rect,
        mode: ScaleMode,
        appearance: &Appearance,
    ) {
        if dst.is_empty() {
            return;
        }
        let Some(image) = image else {
            self.draw_placeholder(canvas, dst, appearance);
            return;
        };
        if let Err(err) = blit(canvas, image.pixels(), dst, mode) {
            warn!(id = %image.id(), "failed to draw photo: {err:#}");
            self.draw_placeholder(canvas, dst, appearance);
        }
    }

    fn draw_placeholder(&self, canvas: &mut RgbaImage, dst: Rect, appearance: &Appearance) {
        self.text.draw_centered(
            canvas,
            dst,
            &appearance.placeholder_text,
            appearance.text_size,
            appearance.text_color,
        );
    }

    /// Clears `canvas` and draws every cell of `shape`.
    ///
    /// `images == None` means no photos are available at all; only the
    /// empty-state message is drawn. Cells past the end of `images` get the
    /// placeholder. Stops between cells once `cancel` fires.
    pub fn render_grid(
        &self,
        canvas: &mut RgbaImage,
        images: Option<&[Slot]>,
        shape: GridShape,
        mode: ScaleMode,
        appearance: &Appearance,
        cancel: &CancellationToken,
    ) -> RenderOutcome {
        let [r, g, b] = appearance.background;
        for px in canvas.pixels_mut() {
            *px = Rgba([r, g, b, 255]);
        }
        let size = CanvasSize::new(canvas.width(), canvas.height());

        let Some(images) = images else {
            self.text.draw_centered(
                canvas,
                Rect::new(0, 0, size.width, size.height),
                &appearance.empty_state_text,
                appearance.text_size,
                appearance.text_color,
            );
            return RenderOutcome {
                empty_state: true,
                ..RenderOutcome::default()
            };
        };

        let mut outcome = RenderOutcome::default();
        for cell in 0..shape.cell_count() {
            if cancel.is_cancelled() {
                debug!(drawn = outcome.cells_drawn, "render abandoned");
                outcome.abandoned = true;
                break;
            }
            let dst = Self::layout(size, shape, cell);
            let image = images.get(cell).and_then(|slot| slot.as_deref());
            self.draw_cell(canvas, image, dst, mode, appearance);
            outcome.cells_drawn += 1;
        }
        outcome
    }

    /// Locks `surface`, renders into it, and posts the result.
    ///
    /// The frame is posted even when the pass is abandoned.
    pub fn render_to(
        &self,
        surface: &mut dyn Surface,
        images: Option<&[Slot]>,
        cfg: &GridConfig,
        cancel: &CancellationToken,
    ) -> Result<RenderOutcome, Error> {
        let mut frame = Frame::acquire(surface)?;
        Ok(self.render_grid(
            &mut frame,
            images,
            cfg.shape,
            cfg.scale_mode,
            &cfg.appearance,
            cancel,
        ))
    }
}

fn blit(canvas: &mut RgbaImage, src: &RgbaImage, dst: Rect, mode: ScaleMode) -> Result<()> {
    let (placed, x, y) = match crop_anchor(mode) {
        Some(anchor) => {
            let window = crop_source_rect(src.width(), src.height(), dst, anchor);
            let cropped =
                imageops::crop_imm(src, window.x, window.y, window.width, window.height).to_image();
            (resize_rgba(&cropped, dst.width, dst.height)?, dst.x, dst.y)
        }
        None => {
            let affine = fit_transform(src.width(), src.height(), dst, fit_rule(mode));
            let area = affine.map_size(src.width(), src.height());
            if area.is_empty() {
                return Ok(());
            }
            (resize_rgba(src, area.width, area.height)?, area.x, area.y)
        }
    };
    imageops::replace(canvas, &placed, i64::from(x), i64::from(y));
    Ok(())
}

fn crop_anchor(mode: ScaleMode) -> Option<Anchor> {
    match mode {
        ScaleMode::CropStart => Some(Anchor::Start),
        ScaleMode::CropCenter => Some(Anchor::Center),
        ScaleMode::CropEnd => Some(Anchor::End),
        _ => None,
    }
}

fn fit_rule(mode: ScaleMode) -> Fit {
    match mode {
        ScaleMode::FitStart => Fit::Aligned(Anchor::Start),
        ScaleMode::FitEnd => Fit::Aligned(Anchor::End),
        ScaleMode::FitFill => Fit::Fill,
        _ => Fit::Aligned(Anchor::Center),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PhotoId;
    use std::sync::Arc;

    const WHITE: [u8; 4] = [255, 255, 255, 255];

    fn solid(name: &str, w: u32, h: u32, rgb: [u8; 3]) -> Slot {
        let pixels = RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]));
        Some(Arc::new(DecodedImage::new(PhotoId::new(name), pixels)))
    }

    fn assert_close(px: &Rgba<u8>, want: [u8; 3]) {
        for (got, want) in px.0.iter().zip(want) {
            assert!(got.abs_diff(want) <= 2, "pixel {px:?} is not close to {want:?}");
        }
    }

    fn compositor() -> GridCompositor {
        GridCompositor::new(TextPainter::without_font())
    }

    #[test]
    fn fills_every_cell_in_column_order() {
        let mut canvas = RgbaImage::new(40, 20);
        let images = vec![
            solid("a", 8, 8, [255, 0, 0]),
            solid("b", 8, 8, [0, 255, 0]),
            solid("c", 8, 8, [0, 0, 255]),
            solid("d", 8, 8, [9, 9, 9]),
        ];
        let outcome = compositor().render_grid(
            &mut canvas,
            Some(images.as_slice()),
            GridShape::new(2, 2),
            ScaleMode::CropCenter,
            &Appearance::default(),
            &CancellationToken::new(),
        );
        assert_eq!(outcome.cells_drawn, 4);
        // Index 1 sits below index 0, index 2 to its right.
        assert_close(canvas.get_pixel(5, 5), [255, 0, 0]);
        assert_close(canvas.get_pixel(5, 15), [0, 255, 0]);
        assert_close(canvas.get_pixel(25, 5), [0, 0, 255]);
        assert_close(canvas.get_pixel(25, 15), [9, 9, 9]);
    }

    #[test]
    fn fit_center_letterboxes_on_background() {
        let mut canvas = RgbaImage::new(20, 20);
        let images = vec![solid("wide", 40, 20, [255, 0, 0])];
        compositor().render_grid(
            &mut canvas,
            Some(images.as_slice()),
            GridShape::new(1, 1),
            ScaleMode::FitCenter,
            &Appearance::default(),
            &CancellationToken::new(),
        );
        assert_eq!(canvas.get_pixel(10, 2).0, WHITE);
        assert_close(canvas.get_pixel(10, 10), [255, 0, 0]);
        assert_eq!(canvas.get_pixel(10, 17).0, WHITE);
    }

    #[test]
    fn missing_slots_get_the_placeholder() {
        let mut canvas = RgbaImage::new(40, 20);
        let images = vec![solid("a", 8, 8, [255, 0, 0])];
        let outcome = compositor().render_grid(
            &mut canvas,
            Some(images.as_slice()),
            GridShape::new(2, 1),
            ScaleMode::CropCenter,
            &Appearance::default(),
            &CancellationToken::new(),
        );
        assert_eq!(outcome.cells_drawn, 2);
        // Placeholder cross through the middle of the second cell.
        assert_eq!(canvas.get_pixel(30, 10).0, [0, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(38, 10).0, WHITE);
    }

    #[test]
    fn no_images_draws_only_the_empty_state() {
        let mut canvas = RgbaImage::new(40, 20);
        let outcome = compositor().render_grid(
            &mut canvas,
            None,
            GridShape::new(2, 2),
            ScaleMode::CropCenter,
            &Appearance::default(),
            &CancellationToken::new(),
        );
        assert!(outcome.empty_state);
        assert_eq!(outcome.cells_drawn, 0);
        // Cell centers stay background; only the canvas center is inked.
        assert_eq!(canvas.get_pixel(10, 5).0, WHITE);
        assert_eq!(canvas.get_pixel(30, 15).0, WHITE);
        assert_eq!(canvas.get_pixel(20, 10).0, [0, 0, 0, 255]);
    }

    #[test]
    fn cancelled_render_stops_before_cells() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut canvas = RgbaImage::new(10, 10);
        let outcome = compositor().render_grid(
            &mut canvas,
            Some(&[][..]),
            GridShape::new(3, 3),
            ScaleMode::FitFill,
            &Appearance::default(),
            &cancel,
        );
        assert!(outcome.abandoned);
        assert_eq!(outcome.cells_drawn, 0);
    }
}
