//! Displays: configuration, the driver seam, and per-display runtime state.

use std::sync::{Arc, Mutex};

use lumen_core::types::{Rect, Region};
use lumen_buffer_queue::{
    BufferAllocator, BufferUsage, Fence, GraphicsBuffer, PixelFormat, QueueError,
};

use crate::error::CompositorError;

/// Stable identifier for a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(pub u32);

/// Transactional display attributes, stored by value in the scene state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayConfig {
    pub id: DisplayId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Layers whose `layer_stack` matches are composited to this display.
    pub layer_stack: u32,
}

impl DisplayConfig {
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }
}

/// Seam to the presentation hardware.
pub trait DisplayDriver: Send + Sync {
    /// Submits a composited framebuffer for scanout. The returned fence
    /// signals when the display no longer reads the frame's sources.
    fn present(
        &self,
        display: DisplayId,
        framebuffer: &GraphicsBuffer,
        damage: &Region,
    ) -> Result<Fence, CompositorError>;
}

/// One presented frame, as recorded by [`SoftwareDisplayDriver`].
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    pub display: DisplayId,
    pub damage: Region,
    /// Copy of the framebuffer bytes at present time.
    pub pixels: Vec<u8>,
}

/// Reference driver that records presented frames for inspection.
#[derive(Debug, Default)]
pub struct SoftwareDisplayDriver {
    frames: Mutex<Vec<PresentedFrame>>,
}

impl SoftwareDisplayDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn last_frame(&self) -> Option<PresentedFrame> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl DisplayDriver for SoftwareDisplayDriver {
    fn present(
        &self,
        display: DisplayId,
        framebuffer: &GraphicsBuffer,
        damage: &Region,
    ) -> Result<Fence, CompositorError> {
        let pixels = framebuffer
            .map_read()
            .map_err(|e| CompositorError::Driver(e.to_string()))?
            .to_vec();
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        frames.push(PresentedFrame {
            display,
            damage: damage.clone(),
            pixels,
        });
        Ok(Fence::signaled())
    }
}

/// Runtime state the loop keeps per connected display: the framebuffer it
/// composites into and the damage accumulated since the last present.
#[derive(Debug)]
pub(crate) struct DisplayDevice {
    pub(crate) config: DisplayConfig,
    pub(crate) framebuffer: GraphicsBuffer,
    pub(crate) damage: Region,
}

impl DisplayDevice {
    pub(crate) fn new(
        config: DisplayConfig,
        allocator: &Arc<dyn BufferAllocator>,
    ) -> Result<Self, QueueError> {
        let framebuffer = allocator.allocate(
            config.width,
            config.height,
            PixelFormat::Argb8888,
            BufferUsage::CPU_READ | BufferUsage::CPU_WRITE | BufferUsage::COMPOSER,
        )?;
        Ok(Self {
            config,
            framebuffer,
            damage: Region::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_buffer_queue::CpuAllocator;

    #[test]
    fn software_driver_records_presented_frames() {
        let allocator: Arc<dyn BufferAllocator> = Arc::new(CpuAllocator::new());
        let config = DisplayConfig {
            id: DisplayId(0),
            name: "internal".into(),
            width: 8,
            height: 8,
            layer_stack: 0,
        };
        let device = DisplayDevice::new(config, &allocator).unwrap();
        let driver = SoftwareDisplayDriver::new();

        let mut damage = Region::new();
        damage.add_rect(Rect::new(0, 0, 4, 4));
        let fence = driver
            .present(DisplayId(0), &device.framebuffer, &damage)
            .unwrap();
        assert!(!fence.is_pending());
        assert_eq!(driver.frame_count(), 1);

        let frame = driver.last_frame().unwrap();
        assert_eq!(frame.display, DisplayId(0));
        assert_eq!(frame.damage.bounds(), Rect::new(0, 0, 4, 4));
        assert!(!frame.pixels.is_empty());
    }
}
