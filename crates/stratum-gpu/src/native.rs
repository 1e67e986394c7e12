//! Native buffers and images bound to allocator memory.
//!
//! Both are shared through `Arc` between the resource that owns them and any
//! in-flight [`Load`](crate::transfer::Load) that references them, so the
//! native object and its memory outlive every GPU use.

use crate::backend::{Backend, BufferId, BufferInfo, ImageId, ImageInfo, ImageLayout};
use crate::error::{GpuError, Result};
use crate::memory::{AllocationPolicy, Allocator, Handle};
use parking_lot::Mutex;
use std::sync::Arc;
use stratum_core::ResourceType;

/// Queue family and layout as of the last recorded command.
///
/// Tracked at record time; generations execute in the order they were
/// recorded, so this is the state the next recorded command will see.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackedState {
    pub owner: Option<u32>,
    pub layout: ImageLayout,
}

/// A native buffer with its memory.
pub struct GpuBuffer {
    backend: Arc<dyn Backend>,
    buffer: BufferId,
    info: BufferInfo,
    handle: Handle,
    state: Mutex<TrackedState>,
}

impl GpuBuffer {
    /// Create a buffer and bind freshly allocated memory to it.
    pub fn new(
        allocator: &Allocator,
        name: &str,
        ty: ResourceType,
        info: BufferInfo,
        policy: AllocationPolicy,
    ) -> Result<Arc<Self>> {
        let backend = Arc::clone(allocator.backend());
        let buffer = backend.create_buffer(&info, name)?;
        let handle = match allocator.allocate_for_buffer(name, ty, buffer, policy) {
            Ok(handle) => handle,
            Err(e) => {
                backend.destroy_buffer(buffer);
                return Err(e);
            }
        };
        Ok(Arc::new(Self {
            backend,
            buffer,
            info,
            handle,
            state: Mutex::new(TrackedState::default()),
        }))
    }

    #[inline]
    pub const fn id(&self) -> BufferId {
        self.buffer
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.info.size
    }

    #[inline]
    pub const fn info(&self) -> &BufferInfo {
        &self.info
    }

    #[inline]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Queue family that last used the buffer.
    pub fn owner(&self) -> Option<u32> {
        self.state.lock().owner
    }

    pub(crate) fn set_owner(&self, owner: u32) {
        self.state.lock().owner = Some(owner);
    }

    pub(crate) fn tracked(&self) -> TrackedState {
        *self.state.lock()
    }

    pub(crate) fn restore(&self, state: TrackedState) {
        *self.state.lock() = state;
    }

    /// Mapped memory of a host-visible buffer.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.handle.mapped_ptr().map(crate::backend::MappedPtr::as_ptr)
    }

    /// The mapped contents as a mutable slice.
    ///
    /// # Safety
    /// No other reference to the mapped range may be alive, and the GPU must
    /// not be accessing it.
    pub(crate) unsafe fn mapped_slice_mut(&self) -> Result<&mut [u8]> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        // SAFETY: the mapping covers `size` bytes; exclusivity is forwarded to the caller.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.info.size as usize) })
    }

    /// Write raw bytes at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidArgument("Offset overflow".to_string()))?;
        if end > self.info.size {
            return Err(GpuError::InvalidArgument(format!(
                "write of {} bytes at {offset} overruns a {} byte buffer",
                data.len(),
                self.info.size
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        self.flush(offset, data.len() as u64)
    }

    /// Write typed data at the given offset (must be host-visible).
    pub fn write_range<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Copy the mapped contents out (must be host-visible).
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        if offset.checked_add(len).map_or(true, |end| end > self.info.size) {
            return Err(GpuError::InvalidArgument(format!(
                "read of {len} bytes at {offset} overruns a {} byte buffer",
                self.info.size
            )));
        }
        if self.handle.needs_flush() {
            self.backend.invalidate_memory(
                self.handle.allocation_info().memory,
                self.handle.offset() + offset,
                len,
            )?;
        }
        // SAFETY: bounds checked above.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.add(offset as usize), len as usize) };
        Ok(bytes.to_vec())
    }

    /// Make host writes visible to the device on non-coherent memory.
    pub fn flush(&self, offset: u64, len: u64) -> Result<()> {
        if self.handle.needs_flush() {
            self.backend.flush_memory(
                self.handle.allocation_info().memory,
                self.handle.offset() + offset,
                len,
            )?;
        }
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        // The handle field drops after this, freeing the memory once the
        // buffer no longer references it.
        self.backend.destroy_buffer(self.buffer);
    }
}

/// A native image with its memory.
pub struct GpuImage {
    backend: Arc<dyn Backend>,
    image: ImageId,
    info: ImageInfo,
    handle: Handle,
    state: Mutex<TrackedState>,
}

impl GpuImage {
    /// Create an image and bind freshly allocated memory to it.
    pub fn new(
        allocator: &Allocator,
        name: &str,
        ty: ResourceType,
        info: ImageInfo,
        policy: AllocationPolicy,
    ) -> Result<Arc<Self>> {
        let backend = Arc::clone(allocator.backend());
        let image = backend.create_image(&info, name)?;
        let handle = match allocator.allocate_for_image(name, ty, image, policy) {
            Ok(handle) => handle,
            Err(e) => {
                backend.destroy_image(image);
                return Err(e);
            }
        };
        Ok(Arc::new(Self {
            backend,
            image,
            info,
            handle,
            state: Mutex::new(TrackedState::default()),
        }))
    }

    #[inline]
    pub const fn id(&self) -> ImageId {
        self.image
    }

    #[inline]
    pub const fn info(&self) -> &ImageInfo {
        &self.info
    }

    #[inline]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Layout and owning queue family as of the last recorded command.
    pub fn state(&self) -> TrackedState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, owner: u32, layout: ImageLayout) {
        *self.state.lock() = TrackedState {
            owner: Some(owner),
            layout,
        };
    }

    pub(crate) fn restore(&self, state: TrackedState) {
        *self.state.lock() = state;
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        self.backend.destroy_image(self.image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BufferUsage;
    use crate::headless::HeadlessBackend;
    use stratum_core::AllocatorConfig;

    #[test]
    fn dropping_buffer_destroys_object_and_memory() {
        let backend = Arc::new(HeadlessBackend::default());
        let allocator = Allocator::new(backend.clone(), &AllocatorConfig::default()).unwrap();
        let buffer = GpuBuffer::new(
            &allocator,
            "upload",
            ResourceType::Staging,
            BufferInfo {
                size: 32,
                usage: BufferUsage::TRANSFER_SRC,
                concurrent: true,
            },
            AllocationPolicy::cpu_to_gpu(),
        )
        .unwrap();
        buffer.write_range(4, &[1u32, 2, 3]).unwrap();
        assert_eq!(buffer.read_bytes(4, 4).unwrap(), 1u32.to_ne_bytes());
        assert!(buffer.write_bytes(30, &[0; 4]).is_err());
        assert_eq!(backend.live_objects(), (1, 0, 1));

        drop(buffer);
        assert_eq!(backend.live_objects(), (0, 0, 0));
        assert_eq!(allocator.stats().total.count, 0);
    }

    #[test]
    fn failed_allocation_destroys_the_buffer() {
        let backend = Arc::new(HeadlessBackend::default());
        backend.set_failing_memory_types(u32::MAX);
        let allocator = Allocator::new(backend.clone(), &AllocatorConfig::default()).unwrap();
        let result = GpuBuffer::new(
            &allocator,
            "doomed",
            ResourceType::Vertex,
            BufferInfo {
                size: 64,
                usage: BufferUsage::VERTEX,
                concurrent: false,
            },
            AllocationPolicy::gpu_only(),
        );
        assert!(result.is_err());
        assert_eq!(backend.live_objects(), (0, 0, 0));
    }
}
