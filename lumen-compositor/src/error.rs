//! Error types for the compositor.

use thiserror::Error;

use crate::display::DisplayId;
use crate::layer::LayerId;
use lumen_buffer_queue::QueueError;

/// Errors surfaced by scene mutation and the composition loop.
///
/// Loop-internal failures (a display that cannot present, a layer whose
/// fence never signals) are logged and skip the affected display or layer
/// for the current frame; they never terminate the loop. This type covers
/// the caller-facing surface.
#[derive(Debug, Error)]
pub enum CompositorError {
    /// A scene mutation referenced a layer id that is not in the scene.
    #[error("unknown layer {0:?}")]
    UnknownLayer(LayerId),

    /// A scene mutation referenced a display id that is not in the scene.
    #[error("unknown display {0:?}")]
    UnknownDisplay(DisplayId),

    /// The display driver rejected a present.
    #[error("display driver failure: {0}")]
    Driver(String),

    /// A buffer queue operation failed during latch or release.
    #[error(transparent)]
    Queue(#[from] QueueError),
}
