//! Buffer handoff between a rendering client and the compositor.
//!
//! This crate implements the producer/consumer halves of the shared-memory
//! graphics buffer queue:
//!
//! - [`buffer`]: immutable-dimension [`buffer::GraphicsBuffer`] handles and
//!   the [`buffer::BufferAllocator`] seam to the allocator driver.
//! - [`fence`]: [`fence::Fence`] synchronization tokens gating safe access
//!   to buffer memory across process boundaries.
//! - [`queue`]: the slot table and the [`queue::BufferProducer`] protocol,
//!   implemented by [`queue::BufferQueue`].
//! - [`surface`]: the producer-facing [`surface::Surface`] client with the
//!   direct-pixel lock/unlock-and-post path and copy-back dirty tracking.

pub mod buffer;
pub mod error;
pub mod fence;
pub mod queue;
pub mod surface;

pub use buffer::{
    BufferAllocator, BufferUsage, CpuAllocator, GraphicsBuffer, MappedPixels, PixelFormat,
};
pub use error::QueueError;
pub use fence::{Fence, FenceError, FenceSignaler};
pub use queue::{
    AcquiredBuffer, BufferProducer, BufferQueue, ConnectApi, DequeueFlags, DequeueResult,
    QueueBufferInput, QueueBufferOutput, QueueQuery, ScalingMode, Transform, DEFAULT_BUFFER_COUNT,
    MAX_BUFFER_SLOTS,
};
pub use surface::{LockedBuffer, PerformReply, Surface, WindowOp};
