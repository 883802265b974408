use thiserror::Error;

use crate::source::PhotoId;

/// Failures raised inside the image pipeline.
///
/// None of these are fatal to a session: each one is absorbed where it
/// happens and shows up on screen as a placeholder cell or the empty-state
/// message.
#[derive(Debug, Error)]
pub enum Error {
    /// The source location is missing, unreadable, or not a folder.
    #[error("photo source unavailable at {location}: {reason}")]
    SourceUnavailable { location: String, reason: String },

    /// A single photo could not be read or decoded.
    #[error("failed to decode {id}: {reason}")]
    DecodeFailure { id: PhotoId, reason: String },

    /// The drawing surface could not be locked for this pass.
    #[error("surface acquisition failed: {0}")]
    SurfaceAcquireFailure(String),

    /// A configuration value was malformed; a default was used instead.
    #[error("invalid configuration value for {field}: {reason}")]
    ConfigParseFailure { field: &'static str, reason: String },
}

/// Returned by operations that observed a cancellation request before
/// committing any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;
