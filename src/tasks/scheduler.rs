//! Playback control loop for one display session.

use std::sync::Arc;

use tokio::select;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::compositor::{GridCompositor, RenderOutcome};
use crate::config::{ConfigSource, GridConfig, ReloadKind};
use crate::decoder::TargetBound;
use crate::error::Cancelled;
use crate::events::PlaybackState;
use crate::prefetch::{PrefetchBuffer, PrefetchOptions};
use crate::processing::layout::{CanvasSize, GridShape};
use crate::source::{DirectorySource, PhotoSource};
use crate::surface::Surface;

/// Owns the prefetch pipeline and decides when to decode, swap and draw.
///
/// Every awaiting method is cancellable and commits its effects only once
/// it completes, so a scheduler taken back from an interrupted task can
/// render its last batch and resume.
pub struct PlaybackScheduler {
    config: Arc<dyn ConfigSource>,
    current: GridConfig,
    buffer: PrefetchBuffer,
    compositor: GridCompositor,
    visibility: watch::Receiver<bool>,
    state: Arc<watch::Sender<PlaybackState>>,
    loaded: bool,
}

impl PlaybackScheduler {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        compositor: GridCompositor,
        visibility: watch::Receiver<bool>,
        state: Arc<watch::Sender<PlaybackState>>,
    ) -> Self {
        let current = config.snapshot();
        let buffer = build_buffer(&current);
        Self {
            config,
            current,
            buffer,
            compositor,
            visibility,
            state,
            loaded: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn config(&self) -> &GridConfig {
        &self.current
    }

    pub fn buffer(&self) -> &PrefetchBuffer {
        &self.buffer
    }

    fn set_state(&self, next: PlaybackState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "playback state changed");
        }
    }

    /// Loads on first use, then runs the steady loop until cancelled.
    #[instrument(skip_all)]
    pub async fn play(
        &mut self,
        surface: &mut dyn Surface,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        if !self.loaded {
            self.initial_load(surface.canvas_size(), cancel).await?;
            self.render(surface, cancel);
        }
        self.set_state(PlaybackState::Rendering);
        self.run(surface, cancel).await
    }

    /// Builds the index and fills the first batch from a fresh config.
    pub async fn initial_load(
        &mut self,
        canvas: CanvasSize,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        self.set_state(PlaybackState::InitialLoad);
        let cfg = self.config.snapshot();
        self.reload(cfg, canvas, cancel).await?;
        self.loaded = true;
        info!(
            photos = self.buffer.index_len(),
            cells = self.current.cell_count(),
            "initial batch ready"
        );
        Ok(())
    }

    /// Steady loop: wait visible, refresh, delay, re-check, draw.
    pub async fn run(
        &mut self,
        surface: &mut dyn Surface,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        loop {
            self.wait_visible(cancel).await?;
            let next = self.config.snapshot();
            self.apply(next, surface.canvas_size(), true, cancel)
                .await?;

            select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = sleep(self.current.delay) => {}
            }

            if self.wait_visible(cancel).await? {
                // Settings may have been edited while hidden.
                let next = self.config.snapshot();
                self.apply(next, surface.canvas_size(), false, cancel)
                    .await?;
            }
            self.render(surface, cancel);
        }
    }

    /// Returns once the surface is visible; `true` if it had to wait.
    pub async fn wait_visible(&mut self, cancel: &CancellationToken) -> Result<bool, Cancelled> {
        let mut suspended = false;
        loop {
            // Always the latest value, so a stale "hidden" is seen here
            // before blocking.
            if *self.visibility.borrow_and_update() {
                if suspended {
                    debug!("surface visible again");
                    self.set_state(PlaybackState::Rendering);
                }
                return Ok(suspended);
            }
            if !suspended {
                debug!("surface hidden; pausing playback");
                self.set_state(PlaybackState::WaitingVisible);
                suspended = true;
            }
            select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                changed = self.visibility.changed() => {
                    if changed.is_err() {
                        debug!("visibility sender dropped");
                        return Err(Cancelled);
                    }
                }
            }
        }
    }

    /// Moves to `next`, doing whatever structural work the diff asks for.
    /// With `refresh`, an unchanged layout still gets a new batch.
    async fn apply(
        &mut self,
        next: GridConfig,
        canvas: CanvasSize,
        refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let kind = self.current.reload_kind(&next);
        if kind != ReloadKind::None {
            info!(?kind, "configuration changed");
        }
        match kind {
            ReloadKind::Full => return self.reload(next, canvas, cancel).await,
            ReloadKind::Grow(count) => {
                self.buffer.set_target_bound(cell_bound(canvas, next.shape));
                self.buffer.grow_by(count, cancel).await?;
            }
            ReloadKind::Shrink(count) => self.buffer.shrink_by(count),
            ReloadKind::None if refresh => {
                self.buffer.set_target_bound(cell_bound(canvas, next.shape));
                self.buffer.prefetch_next(next.cell_count(), cancel).await?;
            }
            ReloadKind::None => {}
        }
        self.current = next;
        Ok(())
    }

    /// Full reload into a new pipeline; the old one stays in place until
    /// the new one holds a complete batch.
    async fn reload(
        &mut self,
        next: GridConfig,
        canvas: CanvasSize,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let mut fresh = build_buffer(&next);
        fresh.set_target_bound(cell_bound(canvas, next.shape));
        fresh.load_index(cancel).await?;
        fresh.prefetch_next(next.cell_count(), cancel).await?;
        self.buffer = fresh;
        self.current = next;
        Ok(())
    }

    /// Draws the shown batch. Acquisition failures skip this pass only.
    pub fn render(
        &mut self,
        surface: &mut dyn Surface,
        cancel: &CancellationToken,
    ) -> Option<RenderOutcome> {
        if self.buffer.live_len() != self.current.cell_count() {
            debug!(
                shown = self.buffer.live_len(),
                cells = self.current.cell_count(),
                "rendering with a resize still pending"
            );
        }
        let slots = self.buffer.snapshot();
        // A readable but empty folder still gets a placeholder per cell.
        let images = self.buffer.is_available().then_some(slots.as_slice());
        match self
            .compositor
            .render_to(surface, images, &self.current, cancel)
        {
            Ok(outcome) => {
                debug!(
                    cells = outcome.cells_drawn,
                    empty_state = outcome.empty_state,
                    abandoned = outcome.abandoned,
                    "frame posted"
                );
                Some(outcome)
            }
            Err(err) => {
                warn!("{err}; skipping this pass");
                None
            }
        }
    }

    /// Drops decoded photos; used when the session ends.
    pub fn release(&mut self) {
        self.buffer.release();
        self.loaded = false;
    }
}

fn build_buffer(cfg: &GridConfig) -> PrefetchBuffer {
    let source = cfg.source.clone().map(|location| {
        Arc::new(DirectorySource::new(location, cfg.recursive)) as Arc<dyn PhotoSource>
    });
    PrefetchBuffer::new(source, PrefetchOptions::from_config(cfg))
}

fn cell_bound(canvas: CanvasSize, shape: GridShape) -> Option<TargetBound> {
    let cell = shape.cell_size(canvas);
    (cell.width > 0 && cell.height > 0).then(|| TargetBound::new(cell.width, cell.height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::surface::MemorySurface;
    use crate::text::TextPainter;
    use std::time::Duration;
    use tokio::time::timeout;

    fn scheduler(config: SharedConfig, visible: bool) -> (PlaybackScheduler, watch::Sender<bool>) {
        let (vis_tx, vis_rx) = watch::channel(visible);
        let (state_tx, _) = watch::channel(PlaybackState::Idle);
        let scheduler = PlaybackScheduler::new(
            Arc::new(config),
            GridCompositor::new(TextPainter::without_font()),
            vis_rx,
            Arc::new(state_tx),
        );
        (scheduler, vis_tx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_source_renders_the_empty_state() {
        let (mut scheduler, _vis) = scheduler(SharedConfig::default(), true);
        let cancel = CancellationToken::new();
        let mut surface = MemorySurface::new(CanvasSize::new(40, 20));
        scheduler
            .initial_load(CanvasSize::new(40, 20), &cancel)
            .await
            .unwrap();
        let outcome = scheduler.render(&mut surface, &cancel).unwrap();
        assert!(outcome.empty_state);
        assert_eq!(surface.posted(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_folder_draws_a_placeholder_per_cell() {
        let dir = tempfile::tempdir().unwrap();
        let config = SharedConfig::new(GridConfig {
            source: Some(dir.path().to_path_buf().into()),
            ..GridConfig::default()
        });
        let (mut scheduler, _vis) = scheduler(config, true);
        let cancel = CancellationToken::new();
        let mut surface = MemorySurface::new(CanvasSize::new(40, 40));
        scheduler
            .initial_load(surface.canvas_size(), &cancel)
            .await
            .unwrap();
        assert!(scheduler.buffer().is_available());
        assert_eq!(scheduler.buffer().index_len(), 0);
        assert_eq!(scheduler.buffer().live_len(), 4);

        let outcome = scheduler.render(&mut surface, &cancel).unwrap();
        assert!(!outcome.empty_state);
        assert_eq!(outcome.cells_drawn, 4);
    }

    fn shown(slots: &[crate::prefetch::Slot]) -> Vec<String> {
        slots
            .iter()
            .map(|slot| slot.as_ref().map_or("-".into(), |img| img.id().to_string()))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shrinking_the_grid_reuses_the_dropped_photos_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            image::RgbaImage::new(8, 8)
                .save(dir.path().join(format!("{i:02}.png")))
                .unwrap();
        }
        let config = SharedConfig::new(GridConfig {
            source: Some(dir.path().to_path_buf().into()),
            shape: GridShape::new(2, 2),
            ..GridConfig::default()
        });
        let (mut scheduler, _vis) = scheduler(config.clone(), true);
        let cancel = CancellationToken::new();
        let canvas = CanvasSize::new(40, 40);
        scheduler.initial_load(canvas, &cancel).await.unwrap();
        assert_eq!(scheduler.buffer().cursor(), 4);

        config.update(|cfg| cfg.shape = GridShape::new(1, 2));
        scheduler
            .apply(config.snapshot(), canvas, true, &cancel)
            .await
            .unwrap();
        assert_eq!(shown(&scheduler.buffer().snapshot()), ["00.png", "01.png"]);
        assert_eq!(shown(scheduler.buffer().staged()), ["02.png", "03.png"]);
        assert_eq!(scheduler.buffer().cursor(), 2);

        let mut surface = MemorySurface::new(canvas);
        assert_eq!(scheduler.render(&mut surface, &cancel).unwrap().cells_drawn, 2);

        scheduler
            .apply(config.snapshot(), canvas, true, &cancel)
            .await
            .unwrap();
        assert_eq!(shown(&scheduler.buffer().snapshot()), ["02.png", "03.png"]);
        assert!(scheduler.buffer().staged().is_empty());
        assert_eq!(scheduler.buffer().cursor(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_failure_skips_the_pass() {
        let (mut scheduler, _vis) = scheduler(SharedConfig::default(), true);
        let cancel = CancellationToken::new();
        let mut surface = MemorySurface::new(CanvasSize::new(40, 20));
        surface.set_fail_acquire(true);
        assert!(scheduler.render(&mut surface, &cancel).is_none());
        assert_eq!(surface.posted(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_visible_sees_a_queued_hide_before_blocking() {
        let (mut scheduler, vis) = scheduler(SharedConfig::default(), true);
        let cancel = CancellationToken::new();
        assert!(!scheduler.wait_visible(&cancel).await.unwrap());

        vis.send_replace(false);
        let waiter = tokio::spawn(async move {
            let suspended = scheduler.wait_visible(&cancel).await;
            (scheduler, suspended)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        vis.send_replace(true);
        let (scheduler, suspended) = timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(suspended, Ok(true));
        assert_eq!(*scheduler.state.borrow(), PlaybackState::Rendering);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_wait_returns_promptly() {
        let (mut scheduler, _vis) = scheduler(SharedConfig::default(), false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(scheduler.wait_visible(&cancel).await, Err(Cancelled));
    }
}
