//! Hosts that drive a session: a desktop window, or an offscreen PNG sink.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use image::RgbaImage;
use softbuffer::{Context as SoftContext, Surface as SoftSurface};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop, EventLoopProxy};
use winit::window::{Window, WindowId};

use crate::error::Error;
use crate::processing::layout::CanvasSize;
use crate::surface::Surface;
use crate::tasks::session::SessionHandle;

#[derive(Debug)]
enum ViewerEvent {
    Frame(RgbaImage),
    Cancelled,
}

type WindowHandle = Arc<Window>;

/// Session-side view of the window: frames travel to the event loop
/// through its proxy.
struct WindowSurface {
    size: Arc<Mutex<CanvasSize>>,
    proxy: EventLoopProxy<ViewerEvent>,
}

impl Surface for WindowSurface {
    fn canvas_size(&self) -> CanvasSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&mut self) -> Result<RgbaImage, Error> {
        let CanvasSize { width, height } = self.canvas_size();
        if width == 0 || height == 0 {
            return Err(Error::SurfaceAcquireFailure("window is minimized".into()));
        }
        Ok(RgbaImage::new(width, height))
    }

    fn post(&mut self, canvas: RgbaImage) {
        if self.proxy.send_event(ViewerEvent::Frame(canvas)).is_err() {
            debug!("viewer event loop closed; dropping frame");
        }
    }
}

struct ViewerApp {
    session: SessionHandle,
    cancel: CancellationToken,
    title: String,
    proxy: EventLoopProxy<ViewerEvent>,
    size: Arc<Mutex<CanvasSize>>,
    window: Option<WindowHandle>,
    context: Option<SoftContext<WindowHandle>>,
    surface: Option<SoftSurface<WindowHandle, WindowHandle>>,
    frame: Option<RgbaImage>,
    frame_pending: bool,
}

impl ViewerApp {
    fn ensure_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        if self.window.is_some() {
            return Ok(());
        }
        let attrs = Window::default_attributes().with_title(self.title.clone());
        let window = WindowHandle::new(
            event_loop
                .create_window(attrs)
                .context("failed to create window")?,
        );
        let context = SoftContext::new(window.clone())
            .map_err(|err| anyhow::anyhow!("failed to create softbuffer context: {err}"))?;
        let surface = SoftSurface::new(&context, window.clone())
            .map_err(|err| anyhow::anyhow!("failed to create softbuffer surface: {err}"))?;
        self.context = Some(context);
        self.surface = Some(surface);
        let size = window.inner_size();
        self.window = Some(window);
        self.handle_resize(size);

        self.session.on_surface_ready(Box::new(WindowSurface {
            size: Arc::clone(&self.size),
            proxy: self.proxy.clone(),
        }));
        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) =
            CanvasSize::new(size.width, size.height);
        if let Some(surface) = self.surface.as_mut()
            && let (Some(width), Some(height)) =
                (NonZeroU32::new(size.width), NonZeroU32::new(size.height))
            && let Err(err) = surface.resize(width, height)
        {
            warn!("failed to resize window surface: {err}");
        }
    }

    fn present(&mut self) {
        let (Some(window), Some(surface)) = (self.window.as_ref(), self.surface.as_mut()) else {
            return;
        };
        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            return;
        }
        let mut buffer = match surface.buffer_mut() {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("failed to map window buffer: {err}");
                return;
            }
        };
        buffer.fill(0);
        if let Some(frame) = self.frame.as_ref() {
            let w = frame.width().min(size.width);
            let h = frame.height().min(size.height);
            for y in 0..h {
                let row = (y * size.width) as usize;
                for x in 0..w {
                    let [r, g, b, _] = frame.get_pixel(x, y).0;
                    buffer[row + x as usize] = (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b);
                }
            }
        }
        if let Err(err) = buffer.present() {
            warn!("failed to present frame: {err}");
        }
    }

    fn close(&mut self, event_loop: &ActiveEventLoop) {
        self.session.on_surface_gone();
        event_loop.exit();
    }
}

impl ApplicationHandler<ViewerEvent> for ViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.cancel.is_cancelled() {
            self.close(event_loop);
            return;
        }
        if let Err(err) = self.ensure_window(event_loop) {
            error!("{err:#}");
            self.close(event_loop);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        if window.id() != window_id {
            return;
        }
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                info!("viewer window closed");
                self.close(event_loop);
            }
            WindowEvent::Resized(size) => {
                self.handle_resize(size);
                self.session.on_redraw_needed();
            }
            WindowEvent::Occluded(occluded) => {
                self.session.on_visibility_changed(!occluded);
            }
            WindowEvent::RedrawRequested => {
                // Requests we did not raise come from the compositor.
                if !std::mem::take(&mut self.frame_pending) {
                    self.session.on_redraw_needed();
                }
                self.present();
            }
            _ => {}
        }
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, event: ViewerEvent) {
        match event {
            ViewerEvent::Frame(frame) => {
                self.frame = Some(frame);
                self.frame_pending = true;
                if let Some(window) = self.window.as_ref() {
                    window.request_redraw();
                }
            }
            ViewerEvent::Cancelled => {
                info!("viewer received cancellation");
                self.close(event_loop);
            }
        }
    }
}

/// Runs a desktop window on the calling thread until it closes or
/// `cancel` fires.
pub fn run_windowed(session: SessionHandle, cancel: CancellationToken, title: &str) -> Result<()> {
    let event_loop = EventLoop::<ViewerEvent>::with_user_event()
        .build()
        .context("failed to build viewer event loop")?;
    let proxy = event_loop.create_proxy();

    let cancel_task = {
        let cancel = cancel.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = proxy.send_event(ViewerEvent::Cancelled);
        })
    };

    let mut app = ViewerApp {
        session,
        cancel,
        title: title.to_string(),
        proxy,
        size: Arc::new(Mutex::new(CanvasSize::new(0, 0))),
        window: None,
        context: None,
        surface: None,
        frame: None,
        frame_pending: false,
    };
    let run_result = event_loop.run_app(&mut app);
    cancel_task.abort();
    run_result.context("viewer event loop failed")
}

/// Offscreen surface that writes each posted frame to a PNG file.
///
/// With `max_frames`, `cancel` fires once that many frames were written.
pub struct PngSurface {
    size: CanvasSize,
    path: PathBuf,
    written: usize,
    max_frames: Option<usize>,
    cancel: CancellationToken,
}

impl PngSurface {
    pub fn new(
        size: CanvasSize,
        path: PathBuf,
        max_frames: Option<usize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            size,
            path,
            written: 0,
            max_frames,
            cancel,
        }
    }
}

impl Surface for PngSurface {
    fn canvas_size(&self) -> CanvasSize {
        self.size
    }

    fn acquire(&mut self) -> Result<RgbaImage, Error> {
        if self.size.width == 0 || self.size.height == 0 {
            return Err(Error::SurfaceAcquireFailure("canvas has no area".into()));
        }
        Ok(RgbaImage::new(self.size.width, self.size.height))
    }

    fn post(&mut self, canvas: RgbaImage) {
        match canvas.save(&self.path) {
            Ok(()) => {
                self.written += 1;
                info!(frame = self.written, path = %self.path.display(), "frame written");
            }
            Err(err) => warn!(path = %self.path.display(), "failed to write frame: {err}"),
        }
        if self.max_frames.is_some_and(|max| self.written >= max) {
            self.cancel.cancel();
        }
    }
}
