//! Contract with the externally owned drawing surface.
//!
//! A surface hands out a canvas on [`Surface::acquire`] and takes it back on
//! [`Surface::post`]. [`Frame`] pairs the two so a canvas is posted on every
//! exit path, including a render abandoned halfway through.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use image::RgbaImage;
use tracing::debug;

use crate::error::Error;
use crate::processing::layout::CanvasSize;

pub trait Surface: Send {
    fn canvas_size(&self) -> CanvasSize;

    /// Locks the canvas for drawing.
    fn acquire(&mut self) -> Result<RgbaImage, Error>;

    /// Unlocks the canvas and shows what was drawn on it.
    fn post(&mut self, canvas: RgbaImage);
}

/// A locked canvas; posted back to its surface on drop.
pub struct Frame<'a> {
    surface: &'a mut dyn Surface,
    canvas: RgbaImage,
}

impl<'a> Frame<'a> {
    pub fn acquire(surface: &'a mut dyn Surface) -> Result<Self, Error> {
        let canvas = surface.acquire()?;
        Ok(Self {
            surface,
            canvas,
        })
    }

    pub fn size(&self) -> CanvasSize {
        CanvasSize::new(self.width(), self.height())
    }
}

impl Deref for Frame<'_> {
    type Target = RgbaImage;

    fn deref(&self) -> &RgbaImage {
        &self.canvas
    }
}

impl DerefMut for Frame<'_> {
    fn deref_mut(&mut self) -> &mut RgbaImage {
        &mut self.canvas
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let canvas = std::mem::take(&mut self.canvas);
        self.surface.post(canvas);
    }
}

/// Offscreen surface that keeps every posted frame in memory.
///
/// Clones share the same state, so a test can keep one handle while the
/// session owns another.
#[derive(Debug, Clone)]
pub struct MemorySurface {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug)]
struct MemoryState {
    size: CanvasSize,
    fail_acquire: bool,
    acquired: usize,
    posted: Vec<RgbaImage>,
}

impl MemorySurface {
    pub fn new(size: CanvasSize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                size,
                fail_acquire: false,
                acquired: 0,
                posted: Vec::new(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_size(&self, size: CanvasSize) {
        self.state().size = size;
    }

    /// Makes subsequent acquisitions fail until reset.
    pub fn set_fail_acquire(&self, fail: bool) {
        self.state().fail_acquire = fail;
    }

    pub fn acquired(&self) -> usize {
        self.state().acquired
    }

    pub fn posted(&self) -> usize {
        self.state().posted.len()
    }

    pub fn last_frame(&self) -> Option<RgbaImage> {
        self.state().posted.last().cloned()
    }
}

impl Surface for MemorySurface {
    fn canvas_size(&self) -> CanvasSize {
        self.state().size
    }

    fn acquire(&mut self) -> Result<RgbaImage, Error> {
        let mut state = self.state();
        if state.fail_acquire {
            return Err(Error::SurfaceAcquireFailure("surface is locked".into()));
        }
        let CanvasSize { width, height } = state.size;
        if width == 0 || height == 0 {
            return Err(Error::SurfaceAcquireFailure(format!(
                "surface has no area ({width}x{height})"
            )));
        }
        state.acquired += 1;
        Ok(RgbaImage::new(width, height))
    }

    fn post(&mut self, canvas: RgbaImage) {
        let mut state = self.state();
        debug!(frame = state.posted.len(), "memory surface posted");
        state.posted.push(canvas);
    }
}
