//! Graphics buffer handles and the allocator driver seam.
//!
//! A [`GraphicsBuffer`] is an immutable-dimension handle to a block of
//! pixel memory. The handle is cheap to clone; producer and compositor
//! hold clones of the same handle while a buffer lives in a slot.
//! Dimensions, format and usage never change after creation; a queue
//! reallocates the slot instead when its requirements change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;

use crate::error::QueueError;

bitflags! {
    /// Intended usage of a buffer's memory, negotiated at allocation time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        /// CPU will read pixel data (software composition, copy-back).
        const CPU_READ   = 1 << 0;
        /// CPU will write pixel data (direct-pixel rendering).
        const CPU_WRITE  = 1 << 1;
        /// GPU renders into the buffer.
        const GPU_RENDER = 1 << 2;
        /// The compositor reads the buffer during composition.
        const COMPOSER   = 1 << 3;
    }
}

/// Pixel formats supported by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit ARGB, 8 bits per channel, alpha first.
    Argb8888,
    /// 32-bit XRGB, 8 bits per channel, alpha ignored.
    Xrgb8888,
    /// 16-bit RGB, 5-6-5.
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct BufferInner {
    width: u32,
    height: u32,
    /// Row pitch in pixels; at least `width`.
    stride: u32,
    format: PixelFormat,
    usage: BufferUsage,
    /// Monotonically increasing allocation id. Distinguishes a reallocated
    /// buffer from the one previously backing the same slot.
    generation: u64,
    memory: Mutex<Vec<u8>>,
}

/// Handle to a block of pixel memory with immutable geometry.
#[derive(Debug, Clone)]
pub struct GraphicsBuffer {
    inner: Arc<BufferInner>,
}

/// RAII mapping of a buffer's pixel memory.
///
/// Dereferences to the raw bytes: `stride * bytes_per_pixel` per row,
/// `height` rows.
pub struct MappedPixels<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl std::ops::Deref for MappedPixels<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for MappedPixels<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl GraphicsBuffer {
    pub(crate) fn new(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Self {
        let size = stride as usize * height as usize * format.bytes_per_pixel();
        Self {
            inner: Arc::new(BufferInner {
                width,
                height,
                stride,
                format,
                usage,
                generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
                memory: Mutex::new(vec![0; size]),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// Row pitch in pixels.
    pub fn stride(&self) -> u32 {
        self.inner.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Whether two handles refer to the same underlying memory.
    pub fn same_buffer(&self, other: &GraphicsBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this buffer satisfies the given requirements without
    /// reallocation. A zero requested dimension means "keep current".
    pub fn matches(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> bool {
        (width == 0 || self.inner.width == width)
            && (height == 0 || self.inner.height == height)
            && self.inner.format == format
            && self.inner.usage.contains(usage)
    }

    /// Maps the buffer for reading.
    pub fn map_read(&self) -> Result<MappedPixels<'_>, QueueError> {
        if !self.inner.usage.contains(BufferUsage::CPU_READ) {
            return Err(QueueError::InvalidOperation(
                "buffer not allocated for CPU reads",
            ));
        }
        Ok(MappedPixels {
            guard: self.inner.memory.lock().unwrap_or_else(|e| e.into_inner()),
        })
    }

    /// Maps the buffer for reading and writing.
    pub fn map_write(&self) -> Result<MappedPixels<'_>, QueueError> {
        if !self.inner.usage.contains(BufferUsage::CPU_WRITE) {
            return Err(QueueError::InvalidOperation(
                "buffer not allocated for CPU writes",
            ));
        }
        Ok(MappedPixels {
            guard: self.inner.memory.lock().unwrap_or_else(|e| e.into_inner()),
        })
    }

    /// Byte offset of pixel (x, y) within the mapped memory.
    pub fn byte_offset(&self, x: i32, y: i32) -> usize {
        let bpp = self.inner.format.bytes_per_pixel();
        (y as usize * self.inner.stride as usize + x as usize) * bpp
    }

    /// Row pitch in bytes.
    pub fn bytes_per_row(&self) -> usize {
        self.inner.stride as usize * self.inner.format.bytes_per_pixel()
    }
}

/// Seam to the buffer allocator driver.
pub trait BufferAllocator: Send + Sync {
    /// Allocates a buffer of at least the given geometry. The returned
    /// stride may exceed `width`.
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<GraphicsBuffer, QueueError>;
}

/// Reference allocator backing buffers with plain heap memory.
///
/// Rows are padded so each row starts on a 16-byte boundary, as real
/// allocator drivers commonly require.
#[derive(Debug, Default)]
pub struct CpuAllocator;

impl CpuAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl BufferAllocator for CpuAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<GraphicsBuffer, QueueError> {
        if width == 0 || height == 0 {
            return Err(QueueError::BadValue("buffer dimensions must be non-zero"));
        }
        let bpp = format.bytes_per_pixel() as u32;
        let row_bytes = (width * bpp + 15) & !15;
        let stride = row_bytes / bpp;
        Ok(GraphicsBuffer::new(width, height, stride, format, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_allocator_pads_stride_to_alignment() {
        let allocator = CpuAllocator::new();
        let buffer = allocator
            .allocate(30, 10, PixelFormat::Argb8888, BufferUsage::CPU_WRITE)
            .unwrap();
        assert_eq!(buffer.width(), 30);
        assert!(buffer.stride() >= 30);
        assert_eq!((buffer.stride() * 4) % 16, 0);
    }

    #[test]
    fn cpu_allocator_rejects_zero_dimensions() {
        let allocator = CpuAllocator::new();
        let result = allocator.allocate(0, 10, PixelFormat::Argb8888, BufferUsage::CPU_WRITE);
        assert!(matches!(result, Err(QueueError::BadValue(_))));
    }

    #[test]
    fn map_write_requires_cpu_write_usage() {
        let allocator = CpuAllocator::new();
        let buffer = allocator
            .allocate(8, 8, PixelFormat::Xrgb8888, BufferUsage::GPU_RENDER)
            .unwrap();
        assert!(matches!(
            buffer.map_write(),
            Err(QueueError::InvalidOperation(_))
        ));
    }

    #[test]
    fn mapped_writes_are_visible_to_reads() {
        let allocator = CpuAllocator::new();
        let buffer = allocator
            .allocate(
                4,
                4,
                PixelFormat::Argb8888,
                BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
            )
            .unwrap();
        {
            let mut pixels = buffer.map_write().unwrap();
            pixels[0] = 0xAB;
        }
        let pixels = buffer.map_read().unwrap();
        assert_eq!(pixels[0], 0xAB);
    }

    #[test]
    fn generations_are_unique_per_allocation() {
        let allocator = CpuAllocator::new();
        let a = allocator
            .allocate(4, 4, PixelFormat::Argb8888, BufferUsage::CPU_WRITE)
            .unwrap();
        let b = allocator
            .allocate(4, 4, PixelFormat::Argb8888, BufferUsage::CPU_WRITE)
            .unwrap();
        assert_ne!(a.generation(), b.generation());
        assert!(!a.same_buffer(&b));
        assert!(a.same_buffer(&a.clone()));
    }

    #[test]
    fn matches_checks_geometry_format_and_usage_superset() {
        let allocator = CpuAllocator::new();
        let buffer = allocator
            .allocate(
                16,
                16,
                PixelFormat::Argb8888,
                BufferUsage::CPU_READ | BufferUsage::CPU_WRITE,
            )
            .unwrap();
        assert!(buffer.matches(16, 16, PixelFormat::Argb8888, BufferUsage::CPU_WRITE));
        assert!(buffer.matches(0, 0, PixelFormat::Argb8888, BufferUsage::empty()));
        assert!(!buffer.matches(16, 16, PixelFormat::Rgb565, BufferUsage::CPU_WRITE));
        assert!(!buffer.matches(8, 16, PixelFormat::Argb8888, BufferUsage::CPU_WRITE));
        assert!(!buffer.matches(16, 16, PixelFormat::Argb8888, BufferUsage::GPU_RENDER));
    }
}
