//! The Lumen compositor: scene management and frame scheduling.
//!
//! Composition is organized around two ideas:
//!
//! - **Double-buffered scene state** ([`scene`]): clients mutate the
//!   current state through transactions; the loop composites only from a
//!   drawing snapshot that changes atomically at commit.
//! - **A vsync-gated loop** ([`scheduler`]): one thread waits for work or
//!   the next display pulse, commits, latches newly queued layer buffers
//!   ([`layer`]), recomposites the damaged parts of each display
//!   ([`display`]) and presents. Vsync delivery ([`vsync`]) runs only
//!   while frames are pending.

pub mod display;
pub mod error;
pub mod layer;
pub mod scene;
pub mod scheduler;
pub mod vsync;

pub use display::{DisplayConfig, DisplayDriver, DisplayId, PresentedFrame, SoftwareDisplayDriver};
pub use error::CompositorError;
pub use layer::{LayerEntry, LayerId, LayerSource};
pub use scene::{SceneHandle, SceneState, TransactionFlags};
pub use scheduler::{CompositorHandle, CompositorLoop, LoopMessage};
pub use vsync::{CadenceEstimator, VsyncControl};
