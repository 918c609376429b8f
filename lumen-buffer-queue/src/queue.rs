//! The buffer slot table and the producer/consumer handoff protocol.
//!
//! A [`BufferQueue`] owns a fixed-capacity table of slots. The slot index
//! is the sole cross-process identifier for a buffer: the producer side
//! dequeues and queues by slot, the consumer side acquires and releases by
//! slot. Each slot is in exactly one ownership state at any time, so a
//! buffer can never be written by the producer while the compositor reads
//! it.
//!
//! The producer half is the [`BufferProducer`] trait, implemented here by
//! [`BufferQueue`] and consumed by [`crate::surface::Surface`]. The
//! consumer half (acquire, release, frame-available notification) consists
//! of inherent methods used by compositor layers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use bitflags::bitflags;
use lumen_core::types::{Rect, Region};
use tracing::{debug, trace, warn};

use crate::buffer::{BufferAllocator, BufferUsage, GraphicsBuffer, PixelFormat};
use crate::error::QueueError;
use crate::fence::Fence;

/// Hard upper bound on the slot table size.
pub const MAX_BUFFER_SLOTS: usize = 16;

/// Slot count used until the producer negotiates another via
/// [`BufferProducer::set_buffer_count`]. Triple buffering keeps one buffer
/// on screen, one queued, and one free for the producer.
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// Queued-but-unconsumed depth at which the producer is told the consumer
/// is running behind.
const RUNNING_BEHIND_THRESHOLD: usize = 2;

bitflags! {
    /// Conditions reported by [`BufferProducer::dequeue_buffer`] that the
    /// client must handle before using the returned slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DequeueFlags: u32 {
        /// The slot's buffer was (re)allocated; any cached handle for this
        /// slot is stale and must be refetched with `request_buffer`.
        const NEEDS_REALLOCATION  = 1 << 0;
        /// The whole pool was invalidated (buffer count change, reconnect);
        /// the client must drop every cached slot handle.
        const RELEASE_ALL_BUFFERS = 1 << 1;
    }
}

bitflags! {
    /// Presentation transform applied by the compositor when scanning out
    /// a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Transform: u32 {
        const FLIP_H = 1 << 0;
        const FLIP_V = 1 << 1;
        const ROT_90 = 1 << 2;
        const ROT_180 = Self::FLIP_H.bits() | Self::FLIP_V.bits();
        const ROT_270 = Self::ROT_180.bits() | Self::ROT_90.bits();
    }
}

/// Rendering API a producer binds to the queue with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectApi {
    /// Direct-pixel software rendering (the `Surface` lock path).
    Cpu,
    /// GPU rendering.
    Gpu,
    /// Media decoder output.
    Media,
}

/// How the compositor scales a buffer whose size differs from the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Content is frozen at buffer size; mismatched buffers are rejected.
    #[default]
    Freeze,
    /// Buffer is scaled to the window size.
    ScaleToWindow,
    /// Buffer is scaled, cropped to preserve aspect ratio.
    ScaleCrop,
}

/// Introspection queries answered by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueQuery {
    Format,
    DefaultWidth,
    DefaultHeight,
    TransformHint,
    ConsumerRunningBehind,
    /// Identifies the concrete queue implementation behind a generic
    /// windowing handle.
    ConcreteType,
    /// Whether buffers queued here are accepted by the compositor.
    ComposerAuthentication,
}

/// Answer for [`QueueQuery::ConcreteType`].
pub const CONCRETE_TYPE_BUFFER_QUEUE: i32 = 1;

/// Everything the producer attaches to a queued buffer.
#[derive(Debug, Clone)]
pub struct QueueBufferInput {
    /// Presentation timestamp. `None` means auto: the queue stamps the
    /// buffer with the wall-clock time of the call.
    pub timestamp: Option<SystemTime>,
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
    /// Queued without blocking the producer on consumer pace.
    pub is_async: bool,
    /// Signals when the producer's writes to the buffer complete.
    pub fence: Fence,
    /// Pixels changed since this buffer was last composited.
    pub dirty_region: Region,
}

/// Feedback returned to the producer by `connect` and `queue_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueBufferOutput {
    pub default_width: u32,
    pub default_height: u32,
    pub transform_hint: Transform,
    /// Buffers queued but not yet acquired by the consumer.
    pub pending_buffers: usize,
}

/// Result of a successful dequeue.
#[derive(Debug)]
pub struct DequeueResult {
    pub slot: usize,
    /// Release fence from the consumer; wait before writing pixels.
    pub fence: Fence,
    pub flags: DequeueFlags,
}

/// A buffer handed to the consumer, with its presentation attributes.
#[derive(Debug)]
pub struct AcquiredBuffer {
    pub slot: usize,
    pub buffer: GraphicsBuffer,
    /// Producer's completion fence; wait before reading pixels.
    pub fence: Fence,
    pub timestamp: SystemTime,
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
    /// Queued without blocking on consumer pace; a consumer may drop this
    /// frame in favor of a newer one.
    pub is_async: bool,
    pub dirty_region: Region,
}

/// Producer-facing half of the buffer handoff protocol.
///
/// `Surface` talks to the queue exclusively through this trait, so a
/// remote-transport proxy can stand in for the in-process queue.
pub trait BufferProducer: Send + Sync {
    /// Binds the producer to the queue. One producer at a time.
    fn connect(&self, api: ConnectApi) -> Result<QueueBufferOutput, QueueError>;

    /// Unbinds the producer and frees all buffers. The api must match the
    /// one passed to `connect`.
    fn disconnect(&self, api: ConnectApi) -> Result<(), QueueError>;

    /// Claims a free slot sized per the request, reallocating its buffer
    /// when geometry, format or usage changed. Zero width/height request
    /// the queue's default size.
    fn dequeue_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<DequeueResult, QueueError>;

    /// Fetches the buffer object backing a dequeued slot. Needed after a
    /// dequeue reported [`DequeueFlags::NEEDS_REALLOCATION`].
    fn request_buffer(&self, slot: usize) -> Result<GraphicsBuffer, QueueError>;

    /// Submits a dequeued buffer for composition.
    fn queue_buffer(
        &self,
        slot: usize,
        input: QueueBufferInput,
    ) -> Result<QueueBufferOutput, QueueError>;

    /// Returns a dequeued buffer to the free pool unmodified. The fence
    /// gates reuse of the buffer memory.
    fn cancel_buffer(&self, slot: usize, fence: Fence) -> Result<(), QueueError>;

    /// Changes the active slot count and invalidates the whole pool.
    fn set_buffer_count(&self, count: usize) -> Result<(), QueueError>;

    /// Read-only introspection.
    fn query(&self, what: QueueQuery) -> Result<i32, QueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Dequeued,
    Queued,
    Displayed,
}

#[derive(Debug)]
struct QueuedData {
    timestamp: SystemTime,
    crop: Rect,
    scaling_mode: ScalingMode,
    transform: Transform,
    is_async: bool,
    dirty_region: Region,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    buffer: Option<GraphicsBuffer>,
    /// Release fence left by the consumer while the slot is free, or the
    /// producer's completion fence while queued.
    fence: Fence,
    queued: Option<QueuedData>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            buffer: None,
            fence: Fence::signaled(),
            queued: None,
        }
    }

    fn reset(&mut self) {
        self.state = SlotState::Free;
        self.buffer = None;
        self.fence = Fence::signaled();
        self.queued = None;
    }
}

#[derive(Debug)]
struct QueueCore {
    slots: Vec<Slot>,
    buffer_count: usize,
    connected_api: Option<ConnectApi>,
    default_width: u32,
    default_height: u32,
    default_format: PixelFormat,
    transform_hint: Transform,
    /// FIFO of queued slot indices, in submission order.
    pending: VecDeque<usize>,
    /// Next dequeue must report [`DequeueFlags::RELEASE_ALL_BUFFERS`].
    release_all_pending: bool,
}

impl QueueCore {
    fn output(&self) -> QueueBufferOutput {
        QueueBufferOutput {
            default_width: self.default_width,
            default_height: self.default_height,
            transform_hint: self.transform_hint,
            pending_buffers: self.pending.len(),
        }
    }

    fn free_all_buffers(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.pending.clear();
        self.release_all_pending = true;
    }
}

type FrameAvailableCallback = Box<dyn Fn() + Send + Sync>;

/// In-process implementation of the buffer handoff protocol.
pub struct BufferQueue {
    allocator: Arc<dyn BufferAllocator>,
    core: Mutex<QueueCore>,
    /// Invoked after every `queue_buffer`, outside the core lock, so the
    /// consumer loop can be woken without lock-order hazards.
    frame_available: Mutex<Option<FrameAvailableCallback>>,
}

impl BufferQueue {
    pub fn new(allocator: Arc<dyn BufferAllocator>, default_width: u32, default_height: u32) -> Self {
        let slots = (0..MAX_BUFFER_SLOTS).map(|_| Slot::new()).collect();
        Self {
            allocator,
            core: Mutex::new(QueueCore {
                slots,
                buffer_count: DEFAULT_BUFFER_COUNT,
                connected_api: None,
                default_width,
                default_height,
                default_format: PixelFormat::Argb8888,
                transform_hint: Transform::empty(),
                pending: VecDeque::new(),
                release_all_pending: false,
            }),
            frame_available: Mutex::new(None),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, QueueCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_frame_available(&self) {
        let guard = self
            .frame_available
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = guard.as_ref() {
            callback();
        }
    }

    // Consumer half.

    /// Registers the callback invoked whenever a buffer is queued.
    pub fn set_frame_available_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut guard = self
            .frame_available
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(Box::new(callback));
    }

    /// Takes the oldest queued buffer, if any, transferring it to the
    /// consumer. The returned fence must be waited on before the first
    /// read of buffer memory, not before.
    pub fn acquire_buffer(&self) -> Option<AcquiredBuffer> {
        let mut core = self.lock_core();
        let slot_index = core.pending.pop_front()?;
        let slot = &mut core.slots[slot_index];
        debug_assert_eq!(slot.state, SlotState::Queued);
        slot.state = SlotState::Displayed;
        let data = slot.queued.take()?;
        let buffer = slot.buffer.clone()?;
        let fence = std::mem::replace(&mut slot.fence, Fence::signaled());
        trace!(slot = slot_index, "buffer acquired by consumer");
        Some(AcquiredBuffer {
            slot: slot_index,
            buffer,
            fence,
            timestamp: data.timestamp,
            crop: data.crop,
            scaling_mode: data.scaling_mode,
            transform: data.transform,
            is_async: data.is_async,
            dirty_region: data.dirty_region,
        })
    }

    /// Returns a displayed buffer to the free pool. The release fence
    /// signals when the consumer's reads complete.
    pub fn release_buffer(&self, slot: usize, release_fence: Fence) -> Result<(), QueueError> {
        let mut core = self.lock_core();
        let slot_entry = core
            .slots
            .get_mut(slot)
            .ok_or(QueueError::BadValue("slot index out of range"))?;
        if slot_entry.state != SlotState::Displayed {
            return Err(QueueError::InvalidOperation(
                "released a slot the consumer does not own",
            ));
        }
        slot_entry.state = SlotState::Free;
        slot_entry.fence = release_fence;
        trace!(slot, "buffer released to free pool");
        Ok(())
    }

    /// Number of buffers queued but not yet acquired.
    pub fn pending_buffer_count(&self) -> usize {
        self.lock_core().pending.len()
    }

    /// Sets the size used when a dequeue requests zero dimensions.
    pub fn set_default_buffer_size(&self, width: u32, height: u32) -> Result<(), QueueError> {
        if width == 0 || height == 0 {
            return Err(QueueError::BadValue("default buffer size must be non-zero"));
        }
        let mut core = self.lock_core();
        core.default_width = width;
        core.default_height = height;
        Ok(())
    }

    /// Hints the producer to pre-rotate content, avoiding a compositor
    /// transform pass.
    pub fn set_transform_hint(&self, hint: Transform) {
        self.lock_core().transform_hint = hint;
    }
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue").finish_non_exhaustive()
    }
}

impl BufferProducer for BufferQueue {
    fn connect(&self, api: ConnectApi) -> Result<QueueBufferOutput, QueueError> {
        let mut core = self.lock_core();
        if core.connected_api.is_some() {
            return Err(QueueError::InvalidOperation(
                "queue already has a connected producer",
            ));
        }
        core.connected_api = Some(api);
        debug!(?api, "producer connected");
        Ok(core.output())
    }

    fn disconnect(&self, api: ConnectApi) -> Result<(), QueueError> {
        let mut core = self.lock_core();
        match core.connected_api {
            None => Err(QueueError::InvalidOperation(
                "disconnect without a connected producer",
            )),
            Some(connected) if connected != api => {
                Err(QueueError::BadValue("disconnect api does not match connect"))
            }
            Some(_) => {
                core.connected_api = None;
                core.free_all_buffers();
                debug!(?api, "producer disconnected, pool invalidated");
                Ok(())
            }
        }
    }

    fn dequeue_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<DequeueResult, QueueError> {
        let mut core = self.lock_core();
        if core.connected_api.is_none() {
            return Err(QueueError::InvalidOperation("dequeue before connect"));
        }
        let width = if width == 0 { core.default_width } else { width };
        let height = if height == 0 { core.default_height } else { height };

        let mut flags = DequeueFlags::empty();
        if core.release_all_pending {
            flags |= DequeueFlags::RELEASE_ALL_BUFFERS;
            core.release_all_pending = false;
        }

        // Prefer a free slot whose buffer already fits the request.
        let count = core.buffer_count;
        let matching = core.slots[..count].iter().position(|slot| {
            slot.state == SlotState::Free
                && slot
                    .buffer
                    .as_ref()
                    .is_some_and(|b| b.matches(width, height, format, usage))
        });
        let slot_index = match matching.or_else(|| {
            core.slots[..count]
                .iter()
                .position(|slot| slot.state == SlotState::Free)
        }) {
            Some(index) => index,
            None => {
                // Not an error the queue can fix; the producer retries
                // after the consumer releases a buffer.
                return Err(QueueError::OutOfBuffers);
            }
        };

        let needs_allocation = !core.slots[slot_index]
            .buffer
            .as_ref()
            .is_some_and(|b| b.matches(width, height, format, usage));
        if needs_allocation {
            let buffer = self
                .allocator
                .allocate(width, height, format, usage)
                .map_err(|e| match e {
                    QueueError::BadValue(msg) => QueueError::BadValue(msg),
                    other => QueueError::AllocationFailed(other.to_string()),
                })?;
            trace!(
                slot = slot_index,
                width,
                height,
                generation = buffer.generation(),
                "slot buffer reallocated"
            );
            core.slots[slot_index].buffer = Some(buffer);
            flags |= DequeueFlags::NEEDS_REALLOCATION;
        }

        let slot = &mut core.slots[slot_index];
        slot.state = SlotState::Dequeued;
        let fence = std::mem::replace(&mut slot.fence, Fence::signaled());
        Ok(DequeueResult {
            slot: slot_index,
            fence,
            flags,
        })
    }

    fn request_buffer(&self, slot: usize) -> Result<GraphicsBuffer, QueueError> {
        let core = self.lock_core();
        let entry = core
            .slots
            .get(slot)
            .ok_or(QueueError::BadValue("slot index out of range"))?;
        if entry.state != SlotState::Dequeued {
            return Err(QueueError::InvalidOperation(
                "requested a slot the producer does not own",
            ));
        }
        entry
            .buffer
            .clone()
            .ok_or(QueueError::InvalidOperation("slot has no buffer"))
    }

    fn queue_buffer(
        &self,
        slot: usize,
        input: QueueBufferInput,
    ) -> Result<QueueBufferOutput, QueueError> {
        let output = {
            let mut core = self.lock_core();
            if core.connected_api.is_none() {
                return Err(QueueError::InvalidOperation("queue before connect"));
            }
            let entry = core
                .slots
                .get_mut(slot)
                .ok_or(QueueError::BadValue("slot index out of range"))?;
            if entry.state != SlotState::Dequeued {
                return Err(QueueError::InvalidOperation(
                    "queued a slot that was not dequeued",
                ));
            }
            let buffer = entry
                .buffer
                .as_ref()
                .ok_or(QueueError::InvalidOperation("slot has no buffer"))?;

            let bounds = Rect::new(0, 0, buffer.width() as i32, buffer.height() as i32);
            let crop = if input.crop.is_empty() {
                bounds
            } else {
                input.crop.intersection(&bounds)
            };

            entry.state = SlotState::Queued;
            entry.fence = input.fence;
            entry.queued = Some(QueuedData {
                timestamp: input.timestamp.unwrap_or_else(SystemTime::now),
                crop,
                scaling_mode: input.scaling_mode,
                transform: input.transform,
                is_async: input.is_async,
                dirty_region: input.dirty_region,
            });
            core.pending.push_back(slot);
            if core.pending.len() >= RUNNING_BEHIND_THRESHOLD {
                warn!(
                    pending = core.pending.len(),
                    "consumer running behind producer"
                );
            }
            core.output()
        };
        self.notify_frame_available();
        Ok(output)
    }

    fn cancel_buffer(&self, slot: usize, fence: Fence) -> Result<(), QueueError> {
        let mut core = self.lock_core();
        let entry = core
            .slots
            .get_mut(slot)
            .ok_or(QueueError::BadValue("slot index out of range"))?;
        if entry.state != SlotState::Dequeued {
            return Err(QueueError::InvalidOperation(
                "canceled a slot that was not dequeued",
            ));
        }
        entry.state = SlotState::Free;
        entry.fence = fence;
        Ok(())
    }

    fn set_buffer_count(&self, count: usize) -> Result<(), QueueError> {
        if !(2..=MAX_BUFFER_SLOTS).contains(&count) {
            return Err(QueueError::BadValue("buffer count out of range"));
        }
        let mut core = self.lock_core();
        if core
            .slots
            .iter()
            .any(|slot| slot.state == SlotState::Dequeued)
        {
            return Err(QueueError::InvalidOperation(
                "cannot change buffer count while buffers are dequeued",
            ));
        }
        core.buffer_count = count;
        core.free_all_buffers();
        debug!(count, "buffer count changed, pool invalidated");
        Ok(())
    }

    fn query(&self, what: QueueQuery) -> Result<i32, QueueError> {
        let core = self.lock_core();
        let value = match what {
            QueueQuery::Format => format_code(core.default_format),
            QueueQuery::DefaultWidth => core.default_width as i32,
            QueueQuery::DefaultHeight => core.default_height as i32,
            QueueQuery::TransformHint => core.transform_hint.bits() as i32,
            QueueQuery::ConsumerRunningBehind => {
                i32::from(core.pending.len() >= RUNNING_BEHIND_THRESHOLD)
            }
            QueueQuery::ConcreteType => CONCRETE_TYPE_BUFFER_QUEUE,
            QueueQuery::ComposerAuthentication => 1,
        };
        Ok(value)
    }
}

fn format_code(format: PixelFormat) -> i32 {
    match format {
        PixelFormat::Argb8888 => 1,
        PixelFormat::Xrgb8888 => 2,
        PixelFormat::Rgb565 => 4,
    }
}

impl QueueBufferInput {
    /// Input for a synchronously written buffer: auto timestamp, full
    /// crop, no fence.
    pub fn auto(dirty_region: Region) -> Self {
        Self {
            timestamp: None,
            crop: Rect::default(),
            scaling_mode: ScalingMode::Freeze,
            transform: Transform::empty(),
            is_async: false,
            fence: Fence::signaled(),
            dirty_region,
        }
    }
}
