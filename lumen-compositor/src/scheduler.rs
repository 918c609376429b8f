//! The composition loop: a single scheduler thread driven by a message
//! queue and the vsync pulse.
//!
//! Each frame walks the same stations. Wait for a message or the vsync
//! deadline; commit any pending transaction; latch newly queued layer
//! buffers and merge their damage into the affected displays; if anything
//! changed, recompute visible regions and recomposite only the damaged
//! area; present; hand the release fence back to every contributing
//! layer. Idle frames, where nothing was committed and nothing latched,
//! skip composition entirely and let hardware vsync power down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use lumen_core::types::{Rect, Region};
use lumen_core::CompositorConfig;
use lumen_buffer_queue::{
    BufferAllocator, BufferProducer, BufferQueue, GraphicsBuffer, QueueError,
};
use tracing::{debug, info, trace, warn};

use crate::display::{DisplayDevice, DisplayDriver, DisplayId};
use crate::error::CompositorError;
use crate::layer::LayerEntry;
use crate::scene::{SceneHandle, SceneState, TransactionFlags};
use crate::vsync::VsyncControl;

/// Upper bound on waiting for a producer's completion fence during
/// composition. A layer whose fence misses this is skipped for the frame.
const ACQUIRE_FENCE_WAIT: Duration = Duration::from_millis(100);

/// Wakeups delivered to the composition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMessage {
    /// Something may have changed: commit transactions and latch buffers.
    Invalidate,
    /// Recomposite damaged displays and present.
    Refresh,
    /// Leave the loop.
    Shutdown,
}

/// Cloneable handle for waking and mutating the compositor from other
/// threads.
#[derive(Clone)]
pub struct CompositorHandle {
    tx: Sender<LoopMessage>,
    scene: Arc<SceneHandle>,
    allocator: Arc<dyn BufferAllocator>,
    buffer_count: usize,
}

impl CompositorHandle {
    /// Scene mutation entry point; every change is transactional.
    pub fn scene(&self) -> &Arc<SceneHandle> {
        &self.scene
    }

    /// Builds a buffer queue for a new layer. The slot count comes from
    /// the compositor configuration, and frame arrival wakes the loop so
    /// the producer never has to signal it explicitly.
    pub fn create_layer_queue(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Arc<BufferQueue>, QueueError> {
        let queue = Arc::new(BufferQueue::new(self.allocator.clone(), width, height));
        queue.set_buffer_count(self.buffer_count)?;
        let tx = self.tx.clone();
        queue.set_frame_available_callback(move || {
            let _ = tx.send(LoopMessage::Invalidate);
        });
        Ok(queue)
    }

    /// Wakes the loop to commit and latch. Buffer queues feeding layers
    /// should call this from their frame-available callbacks.
    pub fn invalidate(&self) {
        let _ = self.tx.send(LoopMessage::Invalidate);
    }

    /// Forces a composition pass on the next iteration.
    pub fn refresh(&self) {
        let _ = self.tx.send(LoopMessage::Refresh);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopMessage::Shutdown);
    }
}

impl std::fmt::Debug for CompositorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorHandle")
            .field("buffer_count", &self.buffer_count)
            .finish_non_exhaustive()
    }
}

/// The frame scheduler. Owns the drawing state, the per-display devices
/// and the vsync gate; runs on one thread.
pub struct CompositorLoop {
    scene: Arc<SceneHandle>,
    rx: Receiver<LoopMessage>,
    tx: Sender<LoopMessage>,
    /// The snapshot being composited. Mutated only by committed
    /// transactions inside this loop.
    drawing: SceneState,
    devices: HashMap<DisplayId, DisplayDevice>,
    allocator: Arc<dyn BufferAllocator>,
    driver: Arc<dyn DisplayDriver>,
    vsync: VsyncControl,
    max_dirty_rects: usize,
    buffer_count: usize,
}

impl CompositorLoop {
    /// Builds the loop and its handle. `hardware_vsync_period` is `None`
    /// when the display cannot deliver pulses; the loop then free-runs on
    /// the configured software cadence.
    pub fn new(
        config: &CompositorConfig,
        allocator: Arc<dyn BufferAllocator>,
        driver: Arc<dyn DisplayDriver>,
        hardware_vsync_period: Option<Duration>,
    ) -> (Self, CompositorHandle) {
        let (tx, rx) = unbounded();
        let scene = SceneHandle::new();
        let wakeup = tx.clone();
        scene.set_notify(move || {
            let _ = wakeup.send(LoopMessage::Invalidate);
        });
        let handle = CompositorHandle {
            tx: tx.clone(),
            scene: scene.clone(),
            allocator: allocator.clone(),
            buffer_count: config.buffer_count,
        };
        let scheduler = Self {
            scene,
            rx,
            tx,
            drawing: SceneState::new(),
            devices: HashMap::new(),
            allocator,
            driver,
            vsync: VsyncControl::new(config.vsync_period(), hardware_vsync_period),
            max_dirty_rects: config.max_dirty_rects,
            buffer_count: config.buffer_count,
        };
        (scheduler, handle)
    }

    pub fn handle(&self) -> CompositorHandle {
        CompositorHandle {
            tx: self.tx.clone(),
            scene: self.scene.clone(),
            allocator: self.allocator.clone(),
            buffer_count: self.buffer_count,
        }
    }

    /// Runs until shutdown. Blocks on the message queue with the next
    /// vsync deadline as timeout, so an idle compositor sleeps a full
    /// period at a time.
    pub fn run(mut self) {
        info!("compositor loop started");
        loop {
            let deadline = self.vsync.next_deadline(Instant::now());
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                Ok(LoopMessage::Shutdown) => break,
                Ok(message) => self.dispatch(message),
                Err(RecvTimeoutError::Timeout) => self.on_vsync(Instant::now()),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("compositor loop stopped");
    }

    /// Processes one message. `Shutdown` is a no-op here; only [`run`]
    /// acts on it.
    ///
    /// [`run`]: CompositorLoop::run
    pub fn dispatch(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Invalidate => self.handle_invalidate(),
            LoopMessage::Refresh => self.handle_refresh(),
            LoopMessage::Shutdown => {}
        }
    }

    /// A vsync tick behaves like an invalidate, plus cadence bookkeeping.
    pub fn on_vsync(&mut self, at: Instant) {
        if self.vsync.hardware_enabled() {
            self.vsync.on_hardware_pulse(at);
        }
        self.handle_invalidate();
    }

    /// Drains and processes already-queued messages without blocking.
    pub fn run_until_idle(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            if message == LoopMessage::Shutdown {
                return;
            }
            self.dispatch(message);
        }
    }

    /// Marks every display fully damaged and schedules a composition
    /// pass, e.g. after resuming from a blank screen.
    pub fn repaint_everything(&mut self) {
        for device in self.devices.values_mut() {
            device.damage.set(device.config.bounds());
        }
        let _ = self.tx.send(LoopMessage::Refresh);
    }

    pub fn vsync(&self) -> &VsyncControl {
        &self.vsync
    }

    fn handle_invalidate(&mut self) {
        let mut refresh_needed = self.handle_transaction();
        refresh_needed |= self.handle_page_flip();
        if refresh_needed {
            self.vsync.enable_hardware();
            let _ = self.tx.send(LoopMessage::Refresh);
        } else {
            trace!("nothing changed, idle frame");
            self.vsync.disable_hardware();
        }
    }

    /// Commits pending scene changes into the drawing state and marks the
    /// affected displays damaged. Only displays showing a touched layer
    /// stack are invalidated; a change on one display does not force the
    /// others to recomposite.
    fn handle_transaction(&mut self) -> bool {
        let Some(committed) = self.scene.commit() else {
            return false;
        };
        self.drawing = committed.state;
        if committed.flags.contains(TransactionFlags::DISPLAY) {
            self.sync_displays();
        }
        for device in self.devices.values_mut() {
            let affected = committed.flags.contains(TransactionFlags::DISPLAY)
                || committed.dirty_stacks.contains(&device.config.layer_stack);
            if affected {
                device.damage.set(device.config.bounds());
            }
        }
        true
    }

    /// Reconciles the device table with the committed display configs.
    fn sync_displays(&mut self) {
        let drawing = &self.drawing;
        self.devices
            .retain(|id, _| drawing.displays.contains_key(id));

        for (id, config) in &self.drawing.displays {
            let needs_device = match self.devices.get(id) {
                None => true,
                Some(device) => {
                    device.config.width != config.width || device.config.height != config.height
                }
            };
            if needs_device {
                match DisplayDevice::new(config.clone(), &self.allocator) {
                    Ok(device) => {
                        debug!(?id, width = config.width, height = config.height, "display device created");
                        self.devices.insert(*id, device);
                    }
                    Err(err) => {
                        warn!(%err, ?id, "display framebuffer allocation failed, display skipped");
                    }
                }
            } else if let Some(device) = self.devices.get_mut(id) {
                device.config = config.clone();
            }
        }
    }

    /// Latches one newly queued buffer per layer and merges the resulting
    /// damage, translated into display coordinates, into every display
    /// showing that layer's stack.
    fn handle_page_flip(&mut self) -> bool {
        let mut latched_any = false;
        for layer in &self.drawing.layers {
            if layer.hidden || !layer.source.has_queued_frame() {
                continue;
            }
            let Some(damage) = layer.source.latch() else {
                continue;
            };
            latched_any = true;
            for device in self.devices.values_mut() {
                if device.config.layer_stack != layer.layer_stack {
                    continue;
                }
                let display_bounds = device.config.bounds();
                for rect in damage.rects() {
                    let on_display = rect
                        .translate(layer.x, layer.y)
                        .intersection(&display_bounds);
                    if !on_display.is_empty() {
                        device.damage.add_rect(on_display);
                    }
                }
                device.damage.collapse_if_complex(self.max_dirty_rects);
            }
        }
        latched_any
    }

    /// Recomposites and presents every damaged display. A failing display
    /// is skipped for this frame; the loop carries on.
    fn handle_refresh(&mut self) {
        let ids: Vec<DisplayId> = self.devices.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.compose_display(id) {
                warn!(%err, ?id, "display skipped this frame");
            }
        }
    }

    fn compose_display(&mut self, id: DisplayId) -> Result<(), CompositorError> {
        let (damage, bounds, stack, framebuffer) = {
            let device = self
                .devices
                .get_mut(&id)
                .ok_or(CompositorError::UnknownDisplay(id))?;
            if device.damage.is_empty() {
                trace!(?id, "no damage, composition skipped");
                return Ok(());
            }
            let damage = std::mem::replace(&mut device.damage, Region::new());
            (
                damage,
                device.config.bounds(),
                device.config.layer_stack,
                device.framebuffer.clone(),
            )
        };

        let layers: Vec<LayerEntry> = self
            .drawing
            .layers_for_stack(stack)
            .into_iter()
            .cloned()
            .collect();
        let visible = compute_visible_regions(&layers, bounds);

        let mut composited: Vec<&LayerEntry> = Vec::new();
        for (layer, layer_visible) in layers.iter().zip(&visible) {
            // visible ∩ damage
            let target = layer_visible.difference(&layer_visible.difference(&damage));
            if target.is_empty() {
                continue;
            }
            let Some((buffer, fence)) = layer.source.content_for_read() else {
                continue;
            };
            if let Err(err) = fence.wait(ACQUIRE_FENCE_WAIT) {
                warn!(%err, layer = ?layer.id, "acquire fence not ready, layer skipped");
                continue;
            }
            if buffer.format() != framebuffer.format() {
                warn!(layer = ?layer.id, "layer format does not match framebuffer, skipped");
                continue;
            }
            let crop = layer.source.crop().unwrap_or_default();
            let src_dx = crop.x - layer.x;
            let src_dy = crop.y - layer.y;
            let mut blitted = false;
            for rect in target.rects() {
                match blit_rect(&framebuffer, &buffer, *rect, src_dx, src_dy) {
                    Ok(()) => blitted = true,
                    Err(err) => {
                        warn!(%err, layer = ?layer.id, "layer blit failed");
                        break;
                    }
                }
            }
            if blitted {
                composited.push(layer);
            }
        }

        match self.driver.present(id, &framebuffer, &damage) {
            Ok(release_fence) => {
                for layer in composited {
                    layer.source.on_displayed(release_fence.clone());
                }
                trace!(?id, rects = damage.rect_count(), "frame presented");
                Ok(())
            }
            Err(err) => {
                // Keep the damage so the next pass retries the area.
                if let Some(device) = self.devices.get_mut(&id) {
                    device.damage.union_with(&damage);
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for CompositorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorLoop")
            .field("displays", &self.devices.len())
            .field("layers", &self.drawing.layers.len())
            .finish_non_exhaustive()
    }
}

/// Per-layer visible regions within `bounds`, index-aligned with
/// `layers` (bottom to top). Walks top-down accumulating opaque coverage,
/// so content fully hidden behind an opaque layer is never composited.
fn compute_visible_regions(layers: &[LayerEntry], bounds: Rect) -> Vec<Region> {
    let mut coverage = Region::new();
    let mut visible = vec![Region::new(); layers.len()];
    for (index, layer) in layers.iter().enumerate().rev() {
        let layer_bounds = layer.bounds().intersection(&bounds);
        if layer_bounds.is_empty() {
            continue;
        }
        let mut layer_visible = Region::from_rect(layer_bounds);
        layer_visible.subtract(&coverage);
        visible[index] = layer_visible;
        if layer.opaque {
            coverage.add_rect(layer_bounds);
        }
    }
    visible
}

/// Copies one display-space rectangle from a layer buffer into the
/// framebuffer. The source pixel for display (x, y) is (x + dx, y + dy).
fn blit_rect(
    dst: &GraphicsBuffer,
    src: &GraphicsBuffer,
    rect: Rect,
    dx: i32,
    dy: i32,
) -> Result<(), QueueError> {
    let bpp = dst.format().bytes_per_pixel();
    let src_pixels = src.map_read()?;
    let mut dst_pixels = dst.map_write()?;
    let row_bytes = rect.width as usize * bpp;
    for row in 0..rect.height {
        let src_offset = src.byte_offset(rect.x + dx, rect.y + row + dy);
        let dst_offset = dst.byte_offset(rect.x, rect.y + row);
        dst_pixels[dst_offset..dst_offset + row_bytes]
            .copy_from_slice(&src_pixels[src_offset..src_offset + row_bytes]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{DisplayConfig, SoftwareDisplayDriver};
    use crate::layer::LayerSource;
    use lumen_buffer_queue::{
        BufferProducer, BufferQueue, BufferUsage, ConnectApi, CpuAllocator, Fence, PixelFormat,
        QueueBufferInput,
    };

    fn test_config() -> CompositorConfig {
        CompositorConfig::default()
    }

    fn test_loop() -> (CompositorLoop, CompositorHandle, Arc<SoftwareDisplayDriver>) {
        let driver = SoftwareDisplayDriver::new();
        let (scheduler, handle) = CompositorLoop::new(
            &test_config(),
            Arc::new(CpuAllocator::new()),
            driver.clone(),
            None,
        );
        (scheduler, handle, driver)
    }

    fn display_config(id: u32, size: u32, stack: u32) -> DisplayConfig {
        DisplayConfig {
            id: DisplayId(id),
            name: format!("display-{id}"),
            width: size,
            height: size,
            layer_stack: stack,
        }
    }

    fn producer_queue(size: u32) -> Arc<BufferQueue> {
        let queue = Arc::new(BufferQueue::new(Arc::new(CpuAllocator::new()), size, size));
        queue.connect(ConnectApi::Cpu).unwrap();
        queue
    }

    fn submit_frame(queue: &BufferQueue, fill: u8, dirty: Region) -> usize {
        let result = queue
            .dequeue_buffer(
                0,
                0,
                PixelFormat::Argb8888,
                BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
            )
            .unwrap();
        let buffer = queue.request_buffer(result.slot).unwrap();
        {
            let mut pixels = buffer.map_write().unwrap();
            for byte in pixels.iter_mut() {
                *byte = fill;
            }
        }
        queue
            .queue_buffer(result.slot, QueueBufferInput::auto(dirty))
            .unwrap();
        result.slot
    }

    #[test]
    fn transaction_commit_replaces_the_drawing_state_wholesale() {
        let (mut scheduler, handle, _driver) = test_loop();
        let scene = handle.scene();
        let first = scene.create_layer("first", 0, 1, LayerSource::new(producer_queue(8)));
        scheduler.run_until_idle();
        assert_eq!(scheduler.drawing.layers.len(), 1);

        scene.set_layer_z(first, 7).unwrap();
        scene.create_layer("second", 0, 2, LayerSource::new(producer_queue(8)));
        // Before the commit, the drawing state still shows the old batch.
        assert_eq!(scheduler.drawing.layers.len(), 1);
        assert_eq!(scheduler.drawing.layer(first).unwrap().z, 1);

        scheduler.dispatch(LoopMessage::Invalidate);
        assert_eq!(scheduler.drawing.layers.len(), 2);
        assert_eq!(scheduler.drawing.layer(first).unwrap().z, 7);
    }

    #[test]
    fn latched_damage_merges_as_a_union_on_the_display() {
        let (mut scheduler, handle, _driver) = test_loop();
        let queue = producer_queue(20);
        queue.disconnect(ConnectApi::Cpu).unwrap();
        queue.set_buffer_count(2).unwrap();
        queue.connect(ConnectApi::Cpu).unwrap();

        handle
            .scene()
            .create_layer("app", 0, 0, LayerSource::new(queue.clone()));
        handle.scene().add_display(display_config(0, 20, 0));
        scheduler.run_until_idle();
        // The initial transaction fully damaged and presented the display.
        assert!(scheduler.devices[&DisplayId(0)].damage.is_empty());

        let first = queue
            .dequeue_buffer(
                0,
                0,
                PixelFormat::Argb8888,
                BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
            )
            .unwrap();
        let second = queue
            .dequeue_buffer(
                0,
                0,
                PixelFormat::Argb8888,
                BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
            )
            .unwrap();
        let mut dirty_a = Region::new();
        dirty_a.add_rect(Rect::new(0, 0, 10, 10));
        let mut dirty_b = Region::new();
        dirty_b.add_rect(Rect::new(5, 5, 15, 15));
        queue
            .queue_buffer(first.slot, QueueBufferInput::auto(dirty_a))
            .unwrap();
        queue
            .queue_buffer(second.slot, QueueBufferInput::auto(dirty_b))
            .unwrap();

        // One latch per invalidate; both before the composition pass.
        scheduler.dispatch(LoopMessage::Invalidate);
        scheduler.dispatch(LoopMessage::Invalidate);

        let mut expected = Region::new();
        expected.add_rect(Rect::new(0, 0, 10, 10));
        expected.add_rect(Rect::new(5, 5, 15, 15));
        assert_eq!(scheduler.devices[&DisplayId(0)].damage, expected);
    }

    #[test]
    fn composited_pixels_land_in_the_presented_frame() {
        let (mut scheduler, handle, driver) = test_loop();
        let queue = producer_queue(10);
        handle
            .scene()
            .create_layer("app", 0, 0, LayerSource::new(queue.clone()));
        handle.scene().add_display(display_config(0, 20, 0));

        submit_frame(&queue, 0x5A, Region::new());
        scheduler.run_until_idle();

        let frame = driver.last_frame().expect("a presented frame");
        let framebuffer = &scheduler.devices[&DisplayId(0)].framebuffer;
        let stride = framebuffer.stride() as usize;
        // Inside the 10x10 layer.
        assert_eq!(frame.pixels[(5 * stride + 5) * 4], 0x5A);
        // Outside it.
        assert_eq!(frame.pixels[(15 * stride + 15) * 4], 0x00);
    }

    #[test]
    fn idle_frames_skip_composition() {
        let (mut scheduler, handle, driver) = test_loop();
        handle.scene().add_display(display_config(0, 8, 0));
        scheduler.run_until_idle();
        let frames = driver.frame_count();
        assert!(frames >= 1);

        // No transaction, no queued buffer: no present.
        scheduler.dispatch(LoopMessage::Invalidate);
        scheduler.run_until_idle();
        assert_eq!(driver.frame_count(), frames);
    }

    #[test]
    fn opaque_layers_occlude_content_below() {
        let (mut scheduler, handle, _driver) = test_loop();
        let bottom_queue = producer_queue(20);
        let top_queue = producer_queue(10);
        let bottom_source = LayerSource::new(bottom_queue.clone());
        let top_source = LayerSource::new(top_queue.clone());
        handle.scene().create_layer("bottom", 0, 0, bottom_source);
        let top = handle.scene().create_layer("top", 0, 1, top_source);
        handle.scene().set_layer_opaque(top, true).unwrap();
        handle.scene().add_display(display_config(0, 20, 0));

        submit_frame(&bottom_queue, 0x11, Region::new());
        submit_frame(&top_queue, 0x22, Region::new());
        scheduler.run_until_idle();

        let layers: Vec<LayerEntry> = scheduler.drawing.layers_for_stack(0).into_iter().cloned().collect();
        let visible = compute_visible_regions(&layers, Rect::new(0, 0, 20, 20));
        // Bottom layer loses the 10x10 area under the opaque top layer.
        assert_eq!(visible[0].area(), 20 * 20 - 10 * 10);
        assert_eq!(visible[1].area(), 10 * 10);
    }

    #[test]
    fn failing_display_is_skipped_without_killing_the_loop() {
        struct FailingDriver;
        impl DisplayDriver for FailingDriver {
            fn present(
                &self,
                _display: DisplayId,
                _framebuffer: &GraphicsBuffer,
                _damage: &Region,
            ) -> Result<Fence, CompositorError> {
                Err(CompositorError::Driver("link down".into()))
            }
        }

        let (mut scheduler, handle) = CompositorLoop::new(
            &test_config(),
            Arc::new(CpuAllocator::new()),
            Arc::new(FailingDriver),
            None,
        );
        handle.scene().add_display(display_config(0, 8, 0));
        scheduler.run_until_idle();

        // The present failed; damage is retained for a later retry and
        // the loop stays usable.
        assert!(!scheduler.devices[&DisplayId(0)].damage.is_empty());
        scheduler.dispatch(LoopMessage::Invalidate);
        scheduler.dispatch(LoopMessage::Refresh);
    }

    #[test]
    fn hardware_vsync_tracks_frame_activity() {
        let driver = SoftwareDisplayDriver::new();
        let (mut scheduler, handle) = CompositorLoop::new(
            &test_config(),
            Arc::new(CpuAllocator::new()),
            driver,
            Some(Duration::from_millis(16)),
        );
        assert!(!scheduler.vsync().hardware_enabled());

        handle.scene().add_display(display_config(0, 8, 0));
        scheduler.dispatch(LoopMessage::Invalidate);
        assert!(scheduler.vsync().hardware_enabled());

        scheduler.run_until_idle();
        scheduler.dispatch(LoopMessage::Invalidate);
        assert!(!scheduler.vsync().hardware_enabled());
    }

    #[test]
    fn repaint_everything_damages_all_displays() {
        let (mut scheduler, handle, driver) = test_loop();
        handle.scene().add_display(display_config(0, 8, 0));
        handle.scene().add_display(display_config(1, 8, 1));
        scheduler.run_until_idle();
        let before = driver.frame_count();

        scheduler.repaint_everything();
        scheduler.run_until_idle();
        assert_eq!(driver.frame_count(), before + 2);
    }

    #[test]
    fn layer_queues_take_the_configured_buffer_count() {
        let driver = SoftwareDisplayDriver::new();
        let mut config = test_config();
        config.buffer_count = 2;
        let (mut scheduler, handle) = CompositorLoop::new(
            &config,
            Arc::new(CpuAllocator::new()),
            driver.clone(),
            None,
        );
        let queue = handle.create_layer_queue(8, 8).unwrap();
        handle
            .scene()
            .create_layer("app", 0, 0, LayerSource::new(queue.clone()));
        handle.scene().add_display(display_config(0, 8, 0));
        scheduler.run_until_idle();

        queue.connect(ConnectApi::Cpu).unwrap();
        let usage = BufferUsage::CPU_READ | BufferUsage::CPU_WRITE;
        queue
            .dequeue_buffer(0, 0, PixelFormat::Argb8888, usage)
            .unwrap();
        let second = queue
            .dequeue_buffer(0, 0, PixelFormat::Argb8888, usage)
            .unwrap();
        // Two slots per the configuration, not the built-in three.
        assert!(matches!(
            queue.dequeue_buffer(0, 0, PixelFormat::Argb8888, usage),
            Err(QueueError::OutOfBuffers)
        ));

        // Queueing a frame wakes the loop without an explicit invalidate.
        let before = driver.frame_count();
        queue
            .queue_buffer(second.slot, QueueBufferInput::auto(Region::new()))
            .unwrap();
        scheduler.run_until_idle();
        assert_eq!(driver.frame_count(), before + 1);
    }

    #[test]
    fn removed_display_drops_its_device() {
        let (mut scheduler, handle, _driver) = test_loop();
        handle.scene().add_display(display_config(0, 8, 0));
        scheduler.run_until_idle();
        assert_eq!(scheduler.devices.len(), 1);

        handle.scene().remove_display(DisplayId(0)).unwrap();
        scheduler.run_until_idle();
        assert!(scheduler.devices.is_empty());
    }
}
