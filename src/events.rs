use std::fmt;

use crate::surface::Surface;

/// Lifecycle signals raised by the host that owns the drawing surface.
pub enum SurfaceEvent {
    Ready(Box<dyn Surface>),
    Gone,
    VisibilityChanged(bool),
    RedrawNeeded,
}

impl fmt::Debug for SurfaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(surface) => f
                .debug_tuple("Ready")
                .field(&surface.canvas_size())
                .finish(),
            Self::Gone => f.write_str("Gone"),
            Self::VisibilityChanged(visible) => {
                f.debug_tuple("VisibilityChanged").field(visible).finish()
            }
            Self::RedrawNeeded => f.write_str("RedrawNeeded"),
        }
    }
}

/// Where a display session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    InitialLoad,
    Rendering,
    WaitingVisible,
    Stopped,
}
