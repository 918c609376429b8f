//! Layers: the unit of composition.
//!
//! A layer splits into two halves. [`LayerEntry`] is the transactional
//! half: plain values (position, z, stack, opacity) that live inside the
//! scene state and change only through committed transactions.
//! [`LayerSource`] is the runtime half: the layer's buffer queue and the
//! buffer currently latched from it. Latching is a main-loop activity
//! driven by frame arrival, not by transactions, so it deliberately sits
//! outside the double-buffered state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lumen_core::types::{Rect, Region};
use lumen_buffer_queue::{BufferQueue, Fence, GraphicsBuffer};
use tracing::{trace, warn};

/// Stable identifier for a layer within a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

impl LayerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Latched {
    slot: Option<usize>,
    buffer: Option<GraphicsBuffer>,
    /// Producer completion fence; waited on at first read during
    /// composition, not at latch time.
    acquire_fence: Fence,
    /// Fence handed back by the display after the buffer last appeared on
    /// screen; gates the release of the previous slot.
    release_fence: Fence,
    crop: Rect,
    frame_count: u64,
}

/// The runtime content side of a layer: its queue and latched buffer.
pub struct LayerSource {
    queue: Arc<BufferQueue>,
    latched: Mutex<Latched>,
}

impl LayerSource {
    pub fn new(queue: Arc<BufferQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            latched: Mutex::new(Latched {
                slot: None,
                buffer: None,
                acquire_fence: Fence::signaled(),
                release_fence: Fence::signaled(),
                crop: Rect::default(),
                frame_count: 0,
            }),
        })
    }

    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    fn lock_latched(&self) -> MutexGuard<'_, Latched> {
        self.latched.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the producer has queued a frame we have not latched yet.
    pub fn has_queued_frame(&self) -> bool {
        self.queue.pending_buffer_count() > 0
    }

    /// Acquires the next queued buffer, making it the layer's current
    /// content, and returns the damage it brings in layer-local
    /// coordinates. The previously latched slot goes back to the queue
    /// gated by the display's release fence.
    ///
    /// Returns `None` when nothing is queued.
    pub fn latch(&self) -> Option<Region> {
        let acquired = self.queue.acquire_buffer()?;
        let mut latched = self.lock_latched();

        if let Some(previous) = latched.slot.take() {
            let release = std::mem::replace(&mut latched.release_fence, Fence::signaled());
            if let Err(err) = self.queue.release_buffer(previous, release) {
                warn!(%err, slot = previous, "failed to release previous buffer");
            }
        }

        let damage = if acquired.dirty_region.is_empty() {
            Region::from_rect(acquired.crop)
        } else {
            acquired.dirty_region.clone()
        };

        latched.slot = Some(acquired.slot);
        latched.buffer = Some(acquired.buffer);
        latched.acquire_fence = acquired.fence;
        latched.crop = acquired.crop;
        latched.frame_count += 1;
        trace!(
            slot = acquired.slot,
            frame = latched.frame_count,
            "buffer latched"
        );
        Some(damage)
    }

    /// The latched buffer and the fence to wait on before reading it.
    pub fn content_for_read(&self) -> Option<(GraphicsBuffer, Fence)> {
        let latched = self.lock_latched();
        let buffer = latched.buffer.clone()?;
        Some((buffer, latched.acquire_fence.clone()))
    }

    /// Crop of the latched buffer, i.e. the layer's content size.
    pub fn crop(&self) -> Option<Rect> {
        let latched = self.lock_latched();
        latched.buffer.as_ref().map(|_| latched.crop)
    }

    /// Number of frames latched so far.
    pub fn frame_count(&self) -> u64 {
        self.lock_latched().frame_count
    }

    /// Called after the display presented a frame containing this layer.
    /// The fence gates when the producer may reuse the buffer's slot.
    pub fn on_displayed(&self, release_fence: Fence) {
        self.lock_latched().release_fence = release_fence;
    }
}

impl std::fmt::Debug for LayerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerSource").finish_non_exhaustive()
    }
}

/// A layer's transactional attributes, stored by value in the scene state.
///
/// Cloning the scene clones these values, so a committed snapshot is
/// immune to later mutation of the current state.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    pub id: LayerId,
    pub name: String,
    /// Display group this layer belongs to.
    pub layer_stack: u32,
    /// Depth; higher z composites on top.
    pub z: i32,
    pub x: i32,
    pub y: i32,
    /// Opaque layers occlude everything below them within their bounds.
    pub opaque: bool,
    pub hidden: bool,
    pub source: Arc<LayerSource>,
}

impl LayerEntry {
    /// On-screen bounds: the latched content's crop placed at the layer
    /// position. Empty until a first buffer is latched.
    pub fn bounds(&self) -> Rect {
        match self.source.crop() {
            Some(crop) => Rect::new(self.x, self.y, crop.width, crop.height),
            None => Rect::default(),
        }
    }
}
