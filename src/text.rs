use std::fs;

use ab_glyph::{Font, FontArc, PxScale, ScaleFont, point};
use anyhow::{Context, Result, anyhow};
use fontdb::{Database, Family, Query, Source};
use image::{Rgba, RgbaImage};
use tracing::{debug, warn};

use crate::processing::layout::Rect;

/// Draws single-line messages centered in a rectangle.
///
/// Without a usable font a simple cross is drawn instead of the text.
#[derive(Clone, Default)]
pub struct TextPainter {
    font: Option<FontArc>,
}

impl std::fmt::Debug for TextPainter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextPainter")
            .field("has_font", &self.font.is_some())
            .finish()
    }
}

impl TextPainter {
    pub fn with_font(font: FontArc) -> Self {
        Self { font: Some(font) }
    }

    pub fn without_font() -> Self {
        Self { font: None }
    }

    /// Looks up `preferred` among the system fonts, then common sans faces.
    pub fn system(preferred: Option<&str>) -> Self {
        match load_font(preferred) {
            Ok(font) => Self::with_font(font),
            Err(err) => {
                warn!("{err:#}; drawing placeholder glyphs instead of text");
                Self::without_font()
            }
        }
    }

    pub fn draw_centered(
        &self,
        canvas: &mut RgbaImage,
        area: Rect,
        text: &str,
        size: f32,
        color: [u8; 3],
    ) {
        if area.is_empty() {
            return;
        }
        let Some(font) = self.font.as_ref() else {
            draw_cross(canvas, area, size, color);
            return;
        };

        let mut scale = PxScale::from(size);
        let width = measure_text(text, font, scale);
        let max_width = area.width as f32 * 0.9;
        if width > max_width && width > 0.0 {
            scale = PxScale::from(size * max_width / width);
        }
        let width = measure_text(text, font, scale);
        let scaled = font.as_scaled(scale);
        let line_height = scaled.ascent() - scaled.descent();
        let left = area.x as f32 + (area.width as f32 - width) / 2.0;
        let baseline = area.y as f32 + (area.height as f32 - line_height) / 2.0 + scaled.ascent();
        draw_text(canvas, area, font, text, color, left, baseline, scale);
    }
}

fn load_font(preferred: Option<&str>) -> Result<FontArc> {
    let mut db = Database::new();
    db.load_system_fonts();

    let mut families = Vec::new();
    if let Some(name) = preferred {
        families.push(Family::Name(name));
    }
    families.extend([
        Family::Name("Noto Sans"),
        Family::Name("DejaVu Sans"),
        Family::SansSerif,
    ]);

    for family in families {
        if let Some(id) = db.query(&Query {
            families: &[family],
            ..Default::default()
        }) {
            match load_face(&db, id) {
                Ok(font) => return Ok(font),
                Err(err) => debug!("skipping font face: {err:#}"),
            }
        }
    }

    for face in db.faces() {
        if let Ok(font) = load_face(&db, face.id) {
            return Ok(font);
        }
    }

    Err(anyhow!("no usable system font found"))
}

fn load_face(db: &Database, id: fontdb::ID) -> Result<FontArc> {
    let face = db.face(id).context("missing font face in database")?;
    debug!(family = ?face.families.first().map(|f| &f.0), "loading font face");
    let data = match &face.source {
        Source::Binary(data) => data.as_ref().as_ref().to_vec(),
        Source::File(path) => fs::read(path)
            .with_context(|| format!("failed to read font at {}", path.display()))?,
        Source::SharedFile(_, data) => data.as_ref().as_ref().to_vec(),
    };
    FontArc::try_from_vec(data).context("failed to decode font face")
}

fn measure_text(text: &str, font: &FontArc, scale: PxScale) -> f32 {
    let scaled_font = font.as_scaled(scale);
    let mut width = 0.0f32;
    let mut previous = None;
    for ch in text.chars() {
        if ch.is_control() {
            continue;
        }
        let glyph_id = scaled_font.glyph_id(ch);
        if let Some(prev) = previous {
            width += scaled_font.kern(prev, glyph_id);
        }
        width += scaled_font.h_advance(glyph_id);
        previous = Some(glyph_id);
    }
    width.max(0.0)
}

#[allow(clippy::too_many_arguments)]
fn draw_text(
    canvas: &mut RgbaImage,
    clip: Rect,
    font: &FontArc,
    text: &str,
    color: [u8; 3],
    left: f32,
    baseline: f32,
    scale: PxScale,
) {
    let scaled = font.as_scaled(scale);
    let mut cursor_x = left;
    let mut previous = None;
    for ch in text.chars() {
        if ch.is_control() {
            continue;
        }
        let glyph = scaled.glyph_id(ch);
        if let Some(prev) = previous {
            cursor_x += scaled.kern(prev, glyph);
        }
        let advance = scaled.h_advance(glyph);
        let mut positioned = scaled.scaled_glyph(ch);
        positioned.position = point(cursor_x, baseline);
        if let Some(outline) = font.outline_glyph(positioned) {
            let bounds = outline.px_bounds();
            outline.draw(|x, y, coverage| {
                blend_pixel(
                    canvas,
                    clip,
                    bounds.min.x + x as f32,
                    bounds.min.y + y as f32,
                    color,
                    coverage,
                );
            });
        }
        cursor_x += advance;
        previous = Some(glyph);
    }
}

/// Two diagonal strokes, `size` pixels across, centered in `area`.
fn draw_cross(canvas: &mut RgbaImage, area: Rect, size: f32, color: [u8; 3]) {
    let extent = size
        .min(area.width as f32)
        .min(area.height as f32)
        .max(1.0);
    let cx = area.x as f32 + area.width as f32 / 2.0;
    let cy = area.y as f32 + area.height as f32 / 2.0;
    let half = extent / 2.0;
    let thickness = (extent / 10.0).max(1.0);
    let steps = (extent.ceil() as u32).max(1);
    for step in 0..=steps {
        let t = step as f32 / steps as f32 * extent - half;
        for d in 0..thickness.ceil() as u32 {
            let o = d as f32 - thickness / 2.0;
            blend_pixel(canvas, area, cx + t + o, cy + t, color, 1.0);
            blend_pixel(canvas, area, cx + t + o, cy - t, color, 1.0);
        }
    }
}

fn blend_pixel(
    canvas: &mut RgbaImage,
    clip: Rect,
    x: f32,
    y: f32,
    color: [u8; 3],
    coverage: f32,
) {
    if coverage <= 0.0 || x < 0.0 || y < 0.0 {
        return;
    }
    let (xi, yi) = (x.floor() as u32, y.floor() as u32);
    if xi < clip.x
        || yi < clip.y
        || xi >= clip.right().min(canvas.width())
        || yi >= clip.bottom().min(canvas.height())
    {
        return;
    }
    let alpha = coverage.clamp(0.0, 1.0);
    let dst = canvas.get_pixel(xi, yi).0;
    let mix = |s: u8, d: u8| (s as f32 * alpha + d as f32 * (1.0 - alpha)).round() as u8;
    canvas.put_pixel(
        xi,
        yi,
        Rgba([
            mix(color[0], dst[0]),
            mix(color[1], dst[1]),
            mix(color[2], dst[2]),
            255,
        ]),
    );
}
