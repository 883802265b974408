//! Pure geometry for the photo grid: cell partitioning, crop windows, and
//! fit transforms.

use serde::Deserialize;

/// Pixel dimensions of the drawing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl CanvasSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Number of cells across (`width`) and down (`height`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GridShape {
    pub width: u32,
    pub height: u32,
}

impl GridShape {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of one cell; the division truncates.
    pub fn cell_size(&self, canvas: CanvasSize) -> CanvasSize {
        CanvasSize::new(
            canvas.width / self.width.max(1),
            canvas.height / self.height.max(1),
        )
    }
}

impl Default for GridShape {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// Destination rectangle of the cell at (`column`, `row`).
pub fn grid_rect(canvas: CanvasSize, shape: GridShape, column: u32, row: u32) -> Rect {
    let cell = shape.cell_size(canvas);
    Rect::new(cell.width * column, cell.height * row, cell.width, cell.height)
}

/// Destination rectangle for a flat cell index.
///
/// Cells are addressed as `column * shape.height + row`: the row is the
/// fast-varying part of the index.
pub fn cell_rect(canvas: CanvasSize, shape: GridShape, cell_index: usize) -> Rect {
    let height = shape.height.max(1) as usize;
    let column = (cell_index / height) as u32;
    let row = (cell_index % height) as u32;
    grid_rect(canvas, shape, column, row)
}

/// Which part of the source survives a crop, or which edge a fitted
/// image hugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    Center,
    End,
}

impl Anchor {
    fn offset(self, full: u32, kept: u32) -> u32 {
        let spare = full.saturating_sub(kept);
        match self {
            Anchor::Start => 0,
            Anchor::Center => spare / 2,
            Anchor::End => spare,
        }
    }

    fn offset_f(self, spare: f32) -> f32 {
        match self {
            Anchor::Start => 0.0,
            Anchor::Center => spare / 2.0,
            Anchor::End => spare,
        }
    }
}

/// Sub-rectangle of an `img_w` × `img_h` image whose aspect ratio matches
/// `dst`. The full extent is kept along one axis and the other is trimmed
/// around `anchor`.
pub fn crop_source_rect(img_w: u32, img_h: u32, dst: Rect, anchor: Anchor) -> Rect {
    let img_w = img_w.max(1);
    let img_h = img_h.max(1);
    let dst_aspect = dst.aspect_ratio();
    let img_aspect = img_w as f32 / img_h as f32;

    if dst_aspect > img_aspect {
        // Cell is wider than the photo: keep the width, trim the height.
        let new_h = ((img_w as f32 / dst_aspect) as u32).clamp(1, img_h);
        let top = anchor.offset(img_h, new_h);
        Rect::new(0, top, img_w, new_h)
    } else {
        let new_w = ((img_h as f32 * dst_aspect) as u32).clamp(1, img_w);
        let left = anchor.offset(img_w, new_w);
        Rect::new(left, 0, new_w, img_h)
    }
}

/// How a whole image is mapped onto a destination rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Preserve aspect ratio and align to the given edge.
    Aligned(Anchor),
    /// Stretch both axes independently to cover the destination exactly.
    Fill,
}

/// Scale followed by translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub scale_x: f32,
    pub scale_y: f32,
    pub translate_x: f32,
    pub translate_y: f32,
}

impl Affine {
    /// Maps the rectangle `(0, 0, w, h)` and returns its pixel bounds.
    pub fn map_size(&self, w: u32, h: u32) -> Rect {
        let x0 = self.translate_x.round();
        let y0 = self.translate_y.round();
        let x1 = (self.translate_x + w as f32 * self.scale_x).round();
        let y1 = (self.translate_y + h as f32 * self.scale_y).round();
        Rect::new(
            x0.max(0.0) as u32,
            y0.max(0.0) as u32,
            (x1 - x0).max(0.0) as u32,
            (y1 - y0).max(0.0) as u32,
        )
    }
}

/// Transform mapping the full `src_w` × `src_h` image onto `dst`.
pub fn fit_transform(src_w: u32, src_h: u32, dst: Rect, fit: Fit) -> Affine {
    let sw = src_w.max(1) as f32;
    let sh = src_h.max(1) as f32;
    let dw = dst.width as f32;
    let dh = dst.height as f32;
    let sx = dw / sw;
    let sy = dh / sh;

    match fit {
        Fit::Fill => Affine {
            scale_x: sx,
            scale_y: sy,
            translate_x: dst.x as f32,
            translate_y: dst.y as f32,
        },
        Fit::Aligned(anchor) => {
            let scale = sx.min(sy);
            let spare_x = dw - sw * scale;
            let spare_y = dh - sh * scale;
            Affine {
                scale_x: scale,
                scale_y: scale,
                translate_x: dst.x as f32 + anchor.offset_f(spare_x),
                translate_y: dst.y as f32 + anchor.offset_f(spare_y),
            }
        }
    }
}
