//! Producer-facing window client.
//!
//! [`Surface`] wraps a [`BufferProducer`] with the client-side state a
//! rendering application needs: requested buffer geometry, crop, scaling
//! and transform configuration, a per-slot cache of buffer handles, and
//! the direct-pixel `lock` / `unlock_and_post` path with copy-back dirty
//! tracking for partial redraws.
//!
//! Copy-back is the interesting part: when an application redraws only a
//! small dirty rectangle each frame, `lock` blits the still-clean pixels
//! from the previously posted buffer into the freshly dequeued one, so the
//! application never has to repaint content it did not change. The
//! fallback is always conservative: whenever the previous buffer cannot be
//! trusted (first frame, geometry or format change), the whole buffer is
//! marked dirty and the per-slot history is discarded.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use lumen_core::types::{Rect, Region};
use tracing::{debug, trace, warn};

use crate::buffer::{BufferUsage, GraphicsBuffer, PixelFormat};
use crate::error::QueueError;
use crate::fence::Fence;
use crate::queue::{
    BufferProducer, ConnectApi, DequeueFlags, QueueBufferInput, QueueQuery, ScalingMode,
    Transform, MAX_BUFFER_SLOTS,
};

/// A buffer mapped for direct pixel access between `lock` and
/// `unlock_and_post`.
///
/// The dirty region tells the caller which pixels it must draw; everything
/// outside it already holds the previous frame's content.
#[derive(Debug, Clone)]
pub struct LockedBuffer {
    buffer: GraphicsBuffer,
    dirty: Region,
}

impl LockedBuffer {
    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    /// Row pitch in pixels.
    pub fn stride(&self) -> u32 {
        self.buffer.stride()
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.format()
    }

    /// The region the caller must redraw.
    pub fn dirty_region(&self) -> &Region {
        &self.dirty
    }

    /// Bounding rectangle of the dirty region.
    pub fn dirty_bounds(&self) -> Rect {
        self.dirty.bounds()
    }

    /// Maps the pixels for reading.
    pub fn pixels(&self) -> Result<crate::buffer::MappedPixels<'_>, QueueError> {
        self.buffer.map_read()
    }

    /// Maps the pixels for writing.
    pub fn pixels_mut(&self) -> Result<crate::buffer::MappedPixels<'_>, QueueError> {
        self.buffer.map_write()
    }
}

/// Typed request for callers that only hold a generic windowing handle.
///
/// Every configuration, lifecycle and direct-pixel operation of the
/// surface is reachable through [`Surface::perform`] with one of these.
#[derive(Debug, Clone)]
pub enum WindowOp {
    Connect(ConnectApi),
    Disconnect(ConnectApi),
    SetBuffersDimensions { width: i32, height: i32 },
    SetBuffersUserDimensions { width: i32, height: i32 },
    SetBuffersFormat(PixelFormat),
    SetBuffersTransform(Transform),
    /// `None` selects auto timestamping at queue time.
    SetBuffersTimestamp(Option<SystemTime>),
    SetScalingMode(ScalingMode),
    /// `None` clears the crop.
    SetCrop(Option<Rect>),
    SetUsage(BufferUsage),
    SetSwapInterval(u32),
    SetBufferCount(usize),
    Lock { dirty: Option<Rect> },
    UnlockAndPost,
    Query(QueueQuery),
}

/// Result of a [`Surface::perform`] dispatch.
#[derive(Debug)]
pub enum PerformReply {
    Done,
    Locked(LockedBuffer),
    Value(i32),
}

#[derive(Debug)]
struct SurfaceInner {
    req_width: u32,
    req_height: u32,
    req_format: PixelFormat,
    req_usage: BufferUsage,
    user_width: u32,
    user_height: u32,
    crop: Rect,
    scaling_mode: ScalingMode,
    transform: Transform,
    /// `None` means auto: stamp with wall-clock time at queue.
    timestamp: Option<SystemTime>,
    swap_interval: u32,
    connected_api: Option<ConnectApi>,
    /// Client-side mirror of the slot table.
    slot_buffers: Vec<Option<GraphicsBuffer>>,
    /// Dirty contribution each slot's buffer made to `dirty_region`.
    slot_dirty: Vec<Region>,
    /// Union of recent frames' dirty regions across all slots.
    dirty_region: Region,
    /// Slot and buffer held by the caller between lock and unlock.
    locked: Option<(usize, GraphicsBuffer)>,
    /// Last posted buffer, the copy-back source.
    posted: Option<GraphicsBuffer>,
    consumer_running_behind: bool,
    default_width: u32,
    default_height: u32,
    transform_hint: Transform,
}

impl SurfaceInner {
    fn reset_requested_state(&mut self) {
        self.req_width = 0;
        self.req_height = 0;
        self.req_format = PixelFormat::Argb8888;
        self.req_usage = BufferUsage::empty();
        self.crop = Rect::default();
        self.scaling_mode = ScalingMode::Freeze;
        self.transform = Transform::empty();
    }

    fn drop_cached_buffers(&mut self) {
        for cached in &mut self.slot_buffers {
            *cached = None;
        }
    }
}

/// Application-side window handle over a buffer queue.
///
/// Individual calls are internally synchronized, but `lock` and
/// `unlock_and_post` belong to a single logical owner thread; interleaving
/// them from two threads fails the second lock rather than corrupting
/// state.
pub struct Surface {
    producer: Arc<dyn BufferProducer>,
    inner: Mutex<SurfaceInner>,
}

impl Surface {
    pub fn new(producer: Arc<dyn BufferProducer>) -> Self {
        Self {
            producer,
            inner: Mutex::new(SurfaceInner {
                req_width: 0,
                req_height: 0,
                req_format: PixelFormat::Argb8888,
                req_usage: BufferUsage::empty(),
                user_width: 0,
                user_height: 0,
                crop: Rect::default(),
                scaling_mode: ScalingMode::Freeze,
                transform: Transform::empty(),
                timestamp: None,
                swap_interval: 1,
                connected_api: None,
                slot_buffers: vec![None; MAX_BUFFER_SLOTS],
                slot_dirty: vec![Region::new(); MAX_BUFFER_SLOTS],
                dirty_region: Region::new(),
                locked: None,
                posted: None,
                consumer_running_behind: false,
                default_width: 0,
                default_height: 0,
                transform_hint: Transform::empty(),
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, SurfaceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Binds this surface to one rendering API.
    pub fn connect(&self, api: ConnectApi) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        self.connect_locked(&mut inner, api)
    }

    fn connect_locked(
        &self,
        inner: &mut SurfaceInner,
        api: ConnectApi,
    ) -> Result<(), QueueError> {
        if inner.connected_api.is_some() {
            return Err(QueueError::InvalidOperation("surface already connected"));
        }
        let output = self.producer.connect(api)?;
        inner.connected_api = Some(api);
        inner.default_width = output.default_width;
        inner.default_height = output.default_height;
        inner.transform_hint = output.transform_hint;
        inner.consumer_running_behind = output.pending_buffers >= 2;
        debug!(?api, "surface connected");
        Ok(())
    }

    /// Unbinds the surface, frees cached buffers and resets the requested
    /// geometry, crop, scaling mode and transform to defaults.
    pub fn disconnect(&self, api: ConnectApi) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        match inner.connected_api {
            None => Err(QueueError::InvalidOperation("surface not connected")),
            Some(connected) if connected != api => {
                Err(QueueError::BadValue("disconnect api does not match connect"))
            }
            Some(_) => {
                self.producer.disconnect(api)?;
                inner.connected_api = None;
                inner.drop_cached_buffers();
                inner.reset_requested_state();
                debug!(?api, "surface disconnected");
                Ok(())
            }
        }
    }

    /// Sets the buffer size requested on the next dequeue. Zero for both
    /// dimensions restores the queue default.
    pub fn set_buffers_dimensions(&self, width: i32, height: i32) -> Result<(), QueueError> {
        let (width, height) = validate_dimensions(width, height)?;
        let mut inner = self.lock_inner();
        inner.req_width = width;
        inner.req_height = height;
        Ok(())
    }

    /// Sets the fallback size used when no explicit request is set.
    pub fn set_buffers_user_dimensions(&self, width: i32, height: i32) -> Result<(), QueueError> {
        let (width, height) = validate_dimensions(width, height)?;
        let mut inner = self.lock_inner();
        inner.user_width = width;
        inner.user_height = height;
        Ok(())
    }

    pub fn set_buffers_format(&self, format: PixelFormat) -> Result<(), QueueError> {
        self.lock_inner().req_format = format;
        Ok(())
    }

    pub fn set_buffers_transform(&self, transform: Transform) -> Result<(), QueueError> {
        self.lock_inner().transform = transform;
        Ok(())
    }

    /// Sets the presentation timestamp for subsequently queued buffers;
    /// `None` reverts to auto timestamping.
    pub fn set_buffers_timestamp(&self, timestamp: Option<SystemTime>) -> Result<(), QueueError> {
        self.lock_inner().timestamp = timestamp;
        Ok(())
    }

    pub fn set_scaling_mode(&self, mode: ScalingMode) -> Result<(), QueueError> {
        self.lock_inner().scaling_mode = mode;
        Ok(())
    }

    /// Sets the crop applied to queued buffers; intersected with buffer
    /// bounds at queue time. `None` clears it.
    pub fn set_crop(&self, crop: Option<Rect>) -> Result<(), QueueError> {
        self.lock_inner().crop = crop.unwrap_or_default();
        Ok(())
    }

    pub fn set_usage(&self, usage: BufferUsage) -> Result<(), QueueError> {
        self.lock_inner().req_usage = usage;
        Ok(())
    }

    /// Sets the swap interval, silently clamped to 0 or 1. Interval 0
    /// queues buffers asynchronously.
    pub fn set_swap_interval(&self, interval: u32) -> Result<(), QueueError> {
        self.lock_inner().swap_interval = interval.min(1);
        Ok(())
    }

    /// Changes the queue's slot count; drops all cached buffer handles.
    pub fn set_buffer_count(&self, count: usize) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        self.producer.set_buffer_count(count)?;
        inner.drop_cached_buffers();
        Ok(())
    }

    /// Claims a free buffer sized per the current request, refreshing the
    /// cached handle when the queue reallocated. The caller must wait on
    /// the returned fence before touching buffer memory.
    pub fn dequeue_buffer(&self) -> Result<(usize, Fence), QueueError> {
        let mut inner = self.lock_inner();
        self.dequeue_locked(&mut inner)
    }

    fn dequeue_locked(&self, inner: &mut SurfaceInner) -> Result<(usize, Fence), QueueError> {
        let width = if inner.req_width != 0 { inner.req_width } else { inner.user_width };
        let height = if inner.req_height != 0 { inner.req_height } else { inner.user_height };

        let result = self
            .producer
            .dequeue_buffer(width, height, inner.req_format, inner.req_usage)?;
        if result.flags.contains(DequeueFlags::RELEASE_ALL_BUFFERS) {
            trace!("queue invalidated the pool, dropping cached handles");
            inner.drop_cached_buffers();
        }
        if result.flags.contains(DequeueFlags::NEEDS_REALLOCATION)
            || inner.slot_buffers[result.slot].is_none()
        {
            inner.slot_buffers[result.slot] = Some(self.producer.request_buffer(result.slot)?);
        }
        Ok((result.slot, result.fence))
    }

    /// Submits a dequeued buffer for composition with the current crop,
    /// scaling mode, transform and timestamp policy.
    pub fn queue_buffer(&self, slot: usize, fence: Fence) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        self.queue_locked(&mut inner, slot, fence)
    }

    fn queue_locked(
        &self,
        inner: &mut SurfaceInner,
        slot: usize,
        fence: Fence,
    ) -> Result<(), QueueError> {
        let dirty = inner
            .slot_dirty
            .get(slot)
            .cloned()
            .ok_or(QueueError::BadValue("slot index out of range"))?;
        let input = QueueBufferInput {
            timestamp: Some(inner.timestamp.unwrap_or_else(SystemTime::now)),
            crop: inner.crop,
            scaling_mode: inner.scaling_mode,
            transform: inner.transform,
            is_async: inner.swap_interval == 0,
            fence,
            dirty_region: dirty,
        };
        let output = self.producer.queue_buffer(slot, input)?;
        inner.default_width = output.default_width;
        inner.default_height = output.default_height;
        inner.transform_hint = output.transform_hint;
        inner.consumer_running_behind = output.pending_buffers >= 2;
        Ok(())
    }

    /// Returns a dequeued buffer to the free pool unmodified.
    pub fn cancel_buffer(&self, slot: usize, fence: Fence) -> Result<(), QueueError> {
        self.producer.cancel_buffer(slot, fence)
    }

    /// Direct-pixel path: dequeues a buffer, preserves still-clean content
    /// from the last posted frame, and maps the pixels for the caller.
    ///
    /// `dirty` is the rectangle the caller intends to redraw; `None` means
    /// the whole buffer. The returned [`LockedBuffer`] reports the region
    /// that actually must be drawn, which can be larger than requested
    /// when the previous frame's content could not be preserved.
    pub fn lock(&self, dirty: Option<Rect>) -> Result<LockedBuffer, QueueError> {
        let mut inner = self.lock_inner();
        if inner.locked.is_some() {
            return Err(QueueError::InvalidOperation(
                "surface is already locked",
            ));
        }
        if inner.connected_api.is_none() {
            inner.req_usage |= BufferUsage::CPU_READ | BufferUsage::CPU_WRITE;
            self.connect_locked(&mut inner, ConnectApi::Cpu)?;
        }

        let (slot, fence) = self.dequeue_locked(&mut inner)?;
        if let Err(err) = fence.wait_forever() {
            warn!(%err, slot, "fence wait failed, canceling buffer");
            if let Err(cancel_err) = self.producer.cancel_buffer(slot, Fence::signaled()) {
                warn!(%cancel_err, slot, "cancel after fence failure also failed");
            }
            return Err(err.into());
        }
        let back = inner.slot_buffers[slot]
            .clone()
            .ok_or(QueueError::InvalidOperation("dequeued slot has no buffer"))?;

        let bounds = Rect::new(0, 0, back.width() as i32, back.height() as i32);
        let mut new_dirty = Region::new();
        match dirty {
            Some(rect) => {
                new_dirty.set(rect);
                new_dirty.intersect_rect(bounds);
            }
            None => new_dirty.set(bounds),
        }

        // Copy-back eligibility looks at geometry and format only, not at
        // which buffer backs the slot. A reallocated buffer with identical
        // geometry would still pass; generation counters exist but are
        // intentionally not consulted here.
        let front = inner.posted.clone().filter(|front| {
            front.width() == back.width()
                && front.height() == back.height()
                && front.format() == back.format()
        });

        if let Some(front) = front {
            // When the queue handed back the very slot we last posted, the
            // clean content is already in place.
            if !front.same_buffer(&back) {
                let copyback = inner.dirty_region.difference(&new_dirty);
                if !copyback.is_empty() {
                    trace!(slot, rects = copyback.rect_count(), "copy-back blit");
                    copy_blt(&back, &front, &copyback)?;
                }
            }
        } else {
            new_dirty.set(bounds);
            inner.dirty_region.clear();
            for slot_dirty in &mut inner.slot_dirty {
                slot_dirty.clear();
            }
        }

        let old = std::mem::replace(&mut inner.slot_dirty[slot], new_dirty.clone());
        inner.dirty_region.subtract(&old);
        inner.dirty_region.union_with(&new_dirty);

        // Verify the mapping up front so the caller's pixel access cannot
        // fail later.
        back.map_write()?;
        inner.locked = Some((slot, back.clone()));
        Ok(LockedBuffer {
            buffer: back,
            dirty: new_dirty,
        })
    }

    /// Queues the locked buffer for composition and remembers it as the
    /// copy-back source for the next lock.
    ///
    /// Direct-pixel writes are synchronous with the mapping, so the buffer
    /// is queued with an auto timestamp and no external fence.
    pub fn unlock_and_post(&self) -> Result<(), QueueError> {
        let mut inner = self.lock_inner();
        let (slot, buffer) = inner
            .locked
            .take()
            .ok_or(QueueError::InvalidOperation("surface is not locked"))?;
        self.queue_locked(&mut inner, slot, Fence::signaled())?;
        inner.posted = Some(buffer);
        Ok(())
    }

    /// Read-only introspection. Answers from client state where it is
    /// authoritative, otherwise delegates to the queue.
    pub fn query(&self, what: QueueQuery) -> Result<i32, QueueError> {
        let inner = self.lock_inner();
        match what {
            QueueQuery::Format => Ok(format_code(inner.req_format)),
            QueueQuery::TransformHint => Ok(inner.transform_hint.bits() as i32),
            QueueQuery::ConsumerRunningBehind => Ok(i32::from(inner.consumer_running_behind)),
            QueueQuery::DefaultWidth if inner.user_width != 0 => Ok(inner.user_width as i32),
            QueueQuery::DefaultHeight if inner.user_height != 0 => Ok(inner.user_height as i32),
            other => self.producer.query(other),
        }
    }

    /// Single dispatch point for callers holding a generic windowing
    /// handle. Each operation carries its typed payload.
    pub fn perform(&self, op: WindowOp) -> Result<PerformReply, QueueError> {
        match op {
            WindowOp::Connect(api) => self.connect(api).map(|_| PerformReply::Done),
            WindowOp::Disconnect(api) => self.disconnect(api).map(|_| PerformReply::Done),
            WindowOp::SetBuffersDimensions { width, height } => self
                .set_buffers_dimensions(width, height)
                .map(|_| PerformReply::Done),
            WindowOp::SetBuffersUserDimensions { width, height } => self
                .set_buffers_user_dimensions(width, height)
                .map(|_| PerformReply::Done),
            WindowOp::SetBuffersFormat(format) => {
                self.set_buffers_format(format).map(|_| PerformReply::Done)
            }
            WindowOp::SetBuffersTransform(transform) => self
                .set_buffers_transform(transform)
                .map(|_| PerformReply::Done),
            WindowOp::SetBuffersTimestamp(timestamp) => self
                .set_buffers_timestamp(timestamp)
                .map(|_| PerformReply::Done),
            WindowOp::SetScalingMode(mode) => {
                self.set_scaling_mode(mode).map(|_| PerformReply::Done)
            }
            WindowOp::SetCrop(crop) => self.set_crop(crop).map(|_| PerformReply::Done),
            WindowOp::SetUsage(usage) => self.set_usage(usage).map(|_| PerformReply::Done),
            WindowOp::SetSwapInterval(interval) => {
                self.set_swap_interval(interval).map(|_| PerformReply::Done)
            }
            WindowOp::SetBufferCount(count) => {
                self.set_buffer_count(count).map(|_| PerformReply::Done)
            }
            WindowOp::Lock { dirty } => self.lock(dirty).map(PerformReply::Locked),
            WindowOp::UnlockAndPost => self.unlock_and_post().map(|_| PerformReply::Done),
            WindowOp::Query(what) => self.query(what).map(PerformReply::Value),
        }
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface").finish_non_exhaustive()
    }
}

fn validate_dimensions(width: i32, height: i32) -> Result<(u32, u32), QueueError> {
    if width < 0 || height < 0 {
        return Err(QueueError::BadValue("dimensions must not be negative"));
    }
    if (width == 0) != (height == 0) {
        return Err(QueueError::BadValue(
            "width and height must be set together",
        ));
    }
    Ok((width as u32, height as u32))
}

fn format_code(format: PixelFormat) -> i32 {
    match format {
        PixelFormat::Argb8888 => 1,
        PixelFormat::Xrgb8888 => 2,
        PixelFormat::Rgb565 => 4,
    }
}

/// Copies `region` from `src` into `dst`, row by row. Both buffers must
/// share format; strides may differ.
fn copy_blt(dst: &GraphicsBuffer, src: &GraphicsBuffer, region: &Region) -> Result<(), QueueError> {
    let bpp = src.format().bytes_per_pixel();
    let src_pixels = src.map_read()?;
    let mut dst_pixels = dst.map_write()?;
    for rect in region.rects() {
        let row_bytes = rect.width as usize * bpp;
        for row in 0..rect.height {
            let src_offset = src.byte_offset(rect.x, rect.y + row);
            let dst_offset = dst.byte_offset(rect.x, rect.y + row);
            dst_pixels[dst_offset..dst_offset + row_bytes]
                .copy_from_slice(&src_pixels[src_offset..src_offset + row_bytes]);
        }
    }
    Ok(())
}
