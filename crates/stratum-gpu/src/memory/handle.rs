//! RAII ownership of one allocation.

use super::AllocatorShared;
use crate::backend::{MappedPtr, MemoryFlags, MemoryId};
use std::fmt;
use std::sync::Arc;
use stratum_core::ResourceType;

/// Where an allocation lives. Immutable for the allocation's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationInfo {
    pub ty: ResourceType,
    /// Native memory object the allocation is carved from.
    pub memory: MemoryId,
    pub size: u64,
    pub memory_flags: MemoryFlags,
    pub memory_type: u32,
}

/// One live GPU allocation.
///
/// There is exactly one `Handle` per allocation. Dropping it returns the
/// memory to the allocator; the owning resource must make sure the GPU is
/// done with it first.
pub struct Handle {
    pub(super) name: String,
    pub(super) allocator: Arc<AllocatorShared>,
    pub(super) offset: u64,
    pub(super) info: AllocationInfo,
    pub(super) block_id: u64,
    pub(super) mapped: Option<MappedPtr>,
}

impl Handle {
    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset inside the native memory object.
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub const fn allocation_info(&self) -> &AllocationInfo {
        &self.info
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.info.size
    }

    /// Start of this allocation in persistently mapped memory.
    #[inline]
    pub const fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.mapped
    }

    /// Whether writes through the mapping need an explicit flush.
    #[inline]
    pub const fn needs_flush(&self) -> bool {
        !self.info.memory_flags.contains(MemoryFlags::HOST_COHERENT)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .field("info", &self.info)
            .field("block_id", &self.block_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.allocator.free(self);
    }
}
