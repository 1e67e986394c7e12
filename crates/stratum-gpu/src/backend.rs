//! Native API abstraction.
//!
//! The allocator, resources and transfer queue only talk to the GPU through
//! [`Backend`]. Native objects are referred to by opaque 64-bit ids so the
//! core logic never depends on which backend is active.

use crate::error::Result;
use bitflags::bitflags;
use std::ptr::NonNull;
use stratum_core::format::mip_extent;
use stratum_core::Format;

macro_rules! native_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            #[repr(transparent)]
            pub struct $name(pub u64);
        )*
    };
}

native_id!(
    /// A native buffer object.
    BufferId,
    /// A native image object.
    ImageId,
    /// A native device memory allocation.
    MemoryId,
    /// A native command buffer.
    CommandBufferId,
    /// A native fence.
    FenceId,
    /// A native binary semaphore.
    SemaphoreId,
);

bitflags! {
    /// Memory property flags. Bit-identical to `VkMemoryPropertyFlags`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MemoryFlags: u32 {
        const DEVICE_LOCAL = 0x1;
        const HOST_VISIBLE = 0x2;
        const HOST_COHERENT = 0x4;
        const HOST_CACHED = 0x8;
        const LAZILY_ALLOCATED = 0x10;
    }
}

bitflags! {
    /// Native buffer usage. Bit-identical to `VkBufferUsageFlags`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const UNIFORM_TEXEL = 0x4;
        const STORAGE_TEXEL = 0x8;
        const UNIFORM = 0x10;
        const STORAGE = 0x20;
        const INDEX = 0x40;
        const VERTEX = 0x80;
        const INDIRECT = 0x100;
    }
}

bitflags! {
    /// Native image usage. Bit-identical to `VkImageUsageFlags`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 0x1;
        const TRANSFER_DST = 0x2;
        const SAMPLED = 0x4;
        const STORAGE = 0x8;
        const COLOR_ATTACHMENT = 0x10;
        const DEPTH_STENCIL_ATTACHMENT = 0x20;
    }
}

/// A memory type exposed by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub flags: MemoryFlags,
    pub heap_index: u32,
}

/// A memory heap exposed by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

/// Static properties of the device the backend drives.
#[derive(Clone, Debug)]
pub struct DeviceProperties {
    /// Device name.
    pub device_name: String,
    /// Integrated GPU sharing physical memory with the host.
    pub integrated: bool,
    /// Memory types, indexed by memory type index.
    pub memory_types: Vec<MemoryType>,
    /// Memory heaps, indexed by heap index.
    pub memory_heaps: Vec<MemoryHeap>,
    /// Minimum offset alignment for uniform buffer bindings.
    pub min_uniform_buffer_alignment: u64,
    /// Linear and optimal-tiling resources bound to one memory object must
    /// not share a page of this size.
    pub buffer_image_granularity: u64,
    /// Queue family used for graphics work.
    pub graphics_family: u32,
    /// Queue family used for uploads.
    pub transfer_family: u32,
}

impl DeviceProperties {
    /// Whether uploads run on a different queue family than graphics.
    #[inline]
    pub const fn has_dedicated_transfer(&self) -> bool {
        self.graphics_family != self.transfer_family
    }

    /// Queue family index for a queue kind.
    #[inline]
    pub const fn family(&self, queue: QueueKind) -> u32 {
        match queue {
            QueueKind::Graphics => self.graphics_family,
            QueueKind::Transfer => self.transfer_family,
        }
    }

    /// Whether a memory type lives in a device-local heap.
    pub fn is_device_local_type(&self, memory_type: u32) -> bool {
        self.memory_types
            .get(memory_type as usize)
            .and_then(|ty| self.memory_heaps.get(ty.heap_index as usize))
            .is_some_and(|heap| heap.device_local)
    }
}

/// Size, alignment and allowed memory types for a native object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Pointer to persistently mapped memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to driver-owned mapped memory that stays valid
// until the owning memory object is freed; access is coordinated by the
// allocation that hands out disjoint ranges.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Wrap a raw mapped pointer.
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// The pointer offset by `offset` bytes.
    ///
    /// # Safety
    /// `offset` must stay within the mapped range.
    #[inline]
    pub unsafe fn add(self, offset: u64) -> Self {
        // SAFETY: forwarded to the caller.
        Self(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)) })
    }

    /// The raw pointer.
    #[inline]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// A raw device memory allocation returned by a backend.
#[derive(Clone, Copy, Debug)]
pub struct RawMemory {
    pub id: MemoryId,
    pub size: u64,
    pub memory_type: u32,
    /// Start of the persistent mapping for host-visible memory.
    pub mapped: Option<MappedPtr>,
}

/// Parameters for a native buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: BufferUsage,
    /// Shared between the graphics and transfer families without ownership
    /// transfers. Used for host-written staging and readback buffers.
    pub concurrent: bool,
}

/// Parameters for a native 2D (array) image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub usage: ImageUsage,
}

/// Location of one subresource in a tightly packed linear image layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceFootprint {
    pub mip_level: u32,
    pub array_layer: u32,
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

impl ImageInfo {
    /// Number of subresources.
    #[inline]
    pub const fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    /// Tightly packed layout, layer-major then mip.
    pub fn footprints(&self) -> Vec<SubresourceFootprint> {
        let mut offset = 0;
        let mut footprints = Vec::with_capacity(self.subresource_count() as usize);
        for array_layer in 0..self.array_layers {
            for mip_level in 0..self.mip_levels {
                let width = mip_extent(self.width, mip_level);
                let height = mip_extent(self.height, mip_level);
                let size = self.format.surface_size(width, height);
                footprints.push(SubresourceFootprint {
                    mip_level,
                    array_layer,
                    offset,
                    width,
                    height,
                    size,
                });
                offset += size;
            }
        }
        footprints
    }

    /// Total size of the tightly packed layout.
    pub fn linear_size(&self) -> u64 {
        self.footprints().iter().map(|f| f.size).sum()
    }

    /// One buffer-image copy region per subresource, covering everything.
    pub fn full_copy_regions(&self) -> Vec<BufferImageCopy> {
        self.footprints()
            .into_iter()
            .map(|f| BufferImageCopy {
                buffer_offset: f.offset,
                mip_level: f.mip_level,
                array_layer: f.array_layer,
                x: 0,
                y: 0,
                width: f.width,
                height: f.height,
            })
            .collect()
    }
}

/// Queue a command buffer is submitted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

/// Image layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    TransferSrc,
    TransferDst,
    ShaderReadOnly,
    ColorAttachment,
    DepthStencilAttachment,
}

/// Pipeline access scope on one side of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// Nothing to wait for / make available.
    None,
    TransferRead,
    TransferWrite,
    /// Any shader or fixed-function read on the graphics queue.
    ShaderRead,
    HostRead,
    /// Every stage and access.
    All,
}

/// Queue family ownership semantics of a barrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// No ownership change.
    #[default]
    Keep,
    /// Release half of a transfer, recorded on the `from` queue.
    Release { from: u32, to: u32 },
    /// Acquire half of a transfer, recorded on the `to` queue.
    Acquire { from: u32, to: u32 },
}

/// Resource a barrier applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierTarget {
    Buffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    Image {
        image: ImageId,
        format: Format,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        mip_levels: u32,
        array_layers: u32,
    },
}

/// A pipeline barrier on one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub target: BarrierTarget,
    pub src: Access,
    pub dst: Access,
    pub ownership: Ownership,
    /// Previous contents are not needed; the resource is fully overwritten.
    pub discard_contents: bool,
}

/// Buffer-to-buffer copy region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Copy region between a tightly packed buffer and one image subresource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub array_layer: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Image-to-image copy region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCopy {
    pub src_mip_level: u32,
    pub src_array_layer: u32,
    pub dst_mip_level: u32,
    pub dst_array_layer: u32,
    pub width: u32,
    pub height: u32,
}

/// A command recorded into a command buffer.
///
/// Image copies expect the source in `TransferSrc` and the destination in
/// `TransferDst` layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToImage {
        src: BufferId,
        dst: ImageId,
        format: Format,
        regions: Vec<BufferImageCopy>,
    },
    CopyImage {
        src: ImageId,
        dst: ImageId,
        format: Format,
        regions: Vec<ImageCopy>,
    },
    CopyImageToBuffer {
        src: ImageId,
        dst: BufferId,
        format: Format,
        regions: Vec<BufferImageCopy>,
    },
    Barrier(Vec<Barrier>),
}

/// A queue submission of one command buffer.
#[derive(Clone, Debug, Default)]
pub struct Submission {
    pub command_buffers: Vec<CommandBufferId>,
    pub wait_semaphores: Vec<(SemaphoreId, Access)>,
    pub signal_semaphores: Vec<SemaphoreId>,
    pub fence: Option<FenceId>,
}

/// The native graphics API as seen by the resource core.
///
/// Implementations must be safe to call from multiple threads. Command
/// buffers are externally synchronized: a command buffer is only recorded by
/// one thread at a time.
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Device properties.
    fn properties(&self) -> &DeviceProperties;

    /// Allocate device memory of one memory type, mapping it when `map` is set.
    fn allocate_memory(&self, memory_type: u32, size: u64, map: bool) -> Result<RawMemory>;

    /// Free device memory. The memory must no longer be bound to live objects.
    fn free_memory(&self, memory: MemoryId);

    /// Make host writes to non-coherent memory visible to the device.
    fn flush_memory(&self, memory: MemoryId, offset: u64, size: u64) -> Result<()>;

    /// Make device writes to non-coherent memory visible to the host.
    fn invalidate_memory(&self, memory: MemoryId, offset: u64, size: u64) -> Result<()>;

    fn create_buffer(&self, info: &BufferInfo, name: &str) -> Result<BufferId>;
    fn buffer_requirements(&self, buffer: BufferId) -> MemoryRequirements;
    fn bind_buffer_memory(&self, buffer: BufferId, memory: MemoryId, offset: u64) -> Result<()>;
    fn destroy_buffer(&self, buffer: BufferId);

    fn create_image(&self, info: &ImageInfo, name: &str) -> Result<ImageId>;
    fn image_requirements(&self, image: ImageId) -> MemoryRequirements;
    fn bind_image_memory(&self, image: ImageId, memory: MemoryId, offset: u64) -> Result<()>;
    fn destroy_image(&self, image: ImageId);

    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferId>;
    fn destroy_command_buffer(&self, command_buffer: CommandBufferId);

    /// Reset and begin recording.
    fn begin_commands(&self, command_buffer: CommandBufferId) -> Result<()>;
    fn record(&self, command_buffer: CommandBufferId, command: &Command) -> Result<()>;
    fn end_commands(&self, command_buffer: CommandBufferId) -> Result<()>;

    fn create_fence(&self, signaled: bool) -> Result<FenceId>;
    fn destroy_fence(&self, fence: FenceId);
    fn wait_fences(&self, fences: &[FenceId], timeout_ns: u64) -> Result<()>;
    fn reset_fences(&self, fences: &[FenceId]) -> Result<()>;
    fn fence_signaled(&self, fence: FenceId) -> Result<bool>;

    fn create_semaphore(&self) -> Result<SemaphoreId>;
    fn destroy_semaphore(&self, semaphore: SemaphoreId);

    /// Submit to a queue.
    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<()>;

    /// Block until the device is idle.
    fn wait_idle(&self) -> Result<()>;
}
