//! Turns host lifecycle signals into scheduler work.
//!
//! While playback runs, the scheduler and the surface are owned by a
//! spawned task. Redraws, surface swaps and shutdown cancel that task,
//! take both back, act on them directly and, unless stopping, respawn it.

use std::sync::Arc;

use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::compositor::GridCompositor;
use crate::config::ConfigSource;
use crate::events::{PlaybackState, SurfaceEvent};
use crate::surface::Surface;
use crate::tasks::scheduler::PlaybackScheduler;

type Parked = (PlaybackScheduler, Box<dyn Surface>);

/// Host-facing side of a session. Every method returns immediately.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SurfaceEvent>,
    state: watch::Receiver<PlaybackState>,
}

impl SessionHandle {
    pub fn on_surface_ready(&self, surface: Box<dyn Surface>) {
        self.send(SurfaceEvent::Ready(surface));
    }

    pub fn on_surface_gone(&self) {
        self.send(SurfaceEvent::Gone);
    }

    pub fn on_visibility_changed(&self, visible: bool) {
        self.send(SurfaceEvent::VisibilityChanged(visible));
    }

    pub fn on_redraw_needed(&self) {
        self.send(SurfaceEvent::RedrawNeeded);
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }

    fn send(&self, event: SurfaceEvent) {
        if let Err(err) = self.events.send(event) {
            debug!(event = ?err.0, "session already stopped; dropping event");
        }
    }
}

/// Starts a session task. It ends on surface-gone or when `cancel` fires.
pub fn spawn(
    config: Arc<dyn ConfigSource>,
    compositor: GridCompositor,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(PlaybackState::Idle);
    let handle = SessionHandle {
        events: events_tx,
        state: state_rx,
    };
    let task = tokio::spawn(run(events_rx, config, compositor, Arc::new(state_tx), cancel));
    (handle, task)
}

#[instrument(skip_all)]
pub async fn run(
    mut events: mpsc::UnboundedReceiver<SurfaceEvent>,
    config: Arc<dyn ConfigSource>,
    compositor: GridCompositor,
    state: Arc<watch::Sender<PlaybackState>>,
    cancel: CancellationToken,
) {
    let (visibility_tx, visibility_rx) = watch::channel(true);
    let mut session = Session {
        config,
        compositor,
        visibility: visibility_rx,
        state,
        cancel: cancel.clone(),
        scheduler: None,
        surface: None,
        playing: None,
    };

    loop {
        let event = select! {
            _ = cancel.cancelled() => SurfaceEvent::Gone,
            event = events.recv() => event.unwrap_or(SurfaceEvent::Gone),
        };
        debug!(?event, "surface event");
        match event {
            SurfaceEvent::Ready(surface) => {
                session.park().await;
                info!(size = ?surface.canvas_size(), "surface ready");
                session.surface = Some(surface);
                session.redraw_if_loaded();
                session.resume();
            }
            SurfaceEvent::RedrawNeeded => {
                if !session.is_showing() {
                    debug!("redraw ignored until the first batch is ready");
                    continue;
                }
                session.park().await;
                session.redraw_if_loaded();
                session.resume();
            }
            SurfaceEvent::VisibilityChanged(visible) => {
                visibility_tx.send_replace(visible);
            }
            SurfaceEvent::Gone => break,
        }
    }

    session.park().await;
    if let Some(scheduler) = session.scheduler.as_mut() {
        scheduler.release();
    }
    session.scheduler = None;
    session.surface = None;
    session.state.send_replace(PlaybackState::Stopped);
    info!("session stopped");
}

struct Session {
    config: Arc<dyn ConfigSource>,
    compositor: GridCompositor,
    visibility: watch::Receiver<bool>,
    state: Arc<watch::Sender<PlaybackState>>,
    cancel: CancellationToken,
    scheduler: Option<PlaybackScheduler>,
    surface: Option<Box<dyn Surface>>,
    playing: Option<(CancellationToken, JoinHandle<Parked>)>,
}

impl Session {
    fn is_showing(&self) -> bool {
        matches!(
            *self.state.borrow(),
            PlaybackState::Rendering | PlaybackState::WaitingVisible
        )
    }

    /// Stops the playback task and takes back what it owned.
    async fn park(&mut self) {
        let Some((token, task)) = self.playing.take() else {
            return;
        };
        token.cancel();
        match task.await {
            Ok((scheduler, surface)) => {
                self.scheduler = Some(scheduler);
                self.surface = Some(surface);
            }
            Err(err) => error!("playback task failed: {err}"),
        }
    }

    fn redraw_if_loaded(&mut self) {
        if let (Some(scheduler), Some(surface)) = (self.scheduler.as_mut(), self.surface.as_mut())
            && scheduler.is_loaded()
        {
            scheduler.render(surface.as_mut(), &self.cancel);
        }
    }

    /// Hands the scheduler and surface to a new playback task.
    fn resume(&mut self) {
        let Some(mut surface) = self.surface.take() else {
            return;
        };
        let mut scheduler = self.scheduler.take().unwrap_or_else(|| {
            PlaybackScheduler::new(
                Arc::clone(&self.config),
                self.compositor.clone(),
                self.visibility.clone(),
                Arc::clone(&self.state),
            )
        });
        let token = self.cancel.child_token();
        let task = tokio::spawn({
            let token = token.clone();
            async move {
                if scheduler.play(surface.as_mut(), &token).await.is_err() {
                    debug!("playback interrupted");
                }
                (scheduler, surface)
            }
        });
        self.playing = Some((token, task));
    }
}
