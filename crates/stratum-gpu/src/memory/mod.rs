//! GPU memory management.
//!
//! Small allocations are carved out of coarse memory blocks so that whole
//! blocks can be returned to the driver once empty; large ones get a block of
//! their own. Every allocation is owned by a [`Handle`] that frees it on drop.

mod block;
mod handle;
mod stats;

pub use block::{AllocationKind, AllocationStrategy};
pub use handle::{AllocationInfo, Handle};
pub use stats::{Stats, Tally};

use crate::backend::{Backend, BufferId, ImageId, MemoryFlags, MemoryRequirements};
use crate::error::{GpuError, Result};
use block::MemoryBlock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stratum_core::math::format_bytes;
use stratum_core::{AllocatorConfig, ResourceType};

/// Intended CPU/GPU access pattern of an allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Only the GPU touches the memory.
    #[default]
    GpuOnly,
    /// The CPU writes, the GPU reads. Persistently mapped.
    CpuToGpu,
    /// The GPU writes, the CPU reads back. Persistently mapped.
    GpuToCpu,
}

/// How an allocation should be placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AllocationPolicy {
    pub location: MemoryLocation,
    pub strategy: AllocationStrategy,
    /// Always give the allocation its own block.
    pub dedicated: bool,
}

impl AllocationPolicy {
    pub const fn gpu_only() -> Self {
        Self {
            location: MemoryLocation::GpuOnly,
            strategy: AllocationStrategy::BestFit,
            dedicated: false,
        }
    }

    pub const fn cpu_to_gpu() -> Self {
        Self {
            location: MemoryLocation::CpuToGpu,
            ..Self::gpu_only()
        }
    }

    pub const fn gpu_to_cpu() -> Self {
        Self {
            location: MemoryLocation::GpuToCpu,
            ..Self::gpu_only()
        }
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_dedicated(mut self, dedicated: bool) -> Self {
        self.dedicated = dedicated;
        self
    }
}

/// Device-local memory usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VramUsage {
    /// Bytes handed out to live allocations.
    pub used: u64,
    /// Bytes held in blocks, used or not.
    pub reserved: u64,
    pub allocation_count: u64,
    pub block_count: u64,
    /// Size of all device-local heaps.
    pub total: u64,
    /// `total` minus `reserved`.
    pub available: u64,
}

pub(crate) struct AllocatorShared {
    backend: Arc<dyn Backend>,
    block_size: u64,
    dedicated_threshold: u64,
    buffer_image_granularity: u64,
    /// Blocks per memory type.
    pools: Mutex<Vec<Vec<MemoryBlock>>>,
    stats: Mutex<Stats>,
    next_block_id: AtomicU64,
}

/// Sub-allocating GPU memory allocator.
///
/// Cheap to clone; clones share the same pools.
#[derive(Clone)]
pub struct Allocator {
    shared: Arc<AllocatorShared>,
}

impl Allocator {
    /// Create an allocator over a backend.
    pub fn new(backend: Arc<dyn Backend>, config: &AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let memory_type_count = backend.properties().memory_types.len();
        let block_size = config.effective_block_size();
        let buffer_image_granularity = backend.properties().buffer_image_granularity;
        tracing::debug!(
            "Allocator: {} blocks, dedicated above {}",
            format_bytes(block_size),
            format_bytes(config.effective_dedicated_threshold())
        );
        Ok(Self {
            shared: Arc::new(AllocatorShared {
                backend,
                block_size,
                dedicated_threshold: config.effective_dedicated_threshold(),
                buffer_image_granularity,
                pools: Mutex::new((0..memory_type_count).map(|_| Vec::new()).collect()),
                stats: Mutex::new(Stats::default()),
                next_block_id: AtomicU64::new(1),
            }),
        })
    }

    /// Allocate memory for a native buffer and bind it.
    ///
    /// Failure is recoverable: the caller may retry with a relaxed policy.
    pub fn allocate_for_buffer(
        &self,
        name: &str,
        ty: ResourceType,
        buffer: BufferId,
        policy: AllocationPolicy,
    ) -> Result<Handle> {
        let backend = &self.shared.backend;
        let requirements = backend.buffer_requirements(buffer);
        let handle = self.allocate(name, ty, requirements, AllocationKind::Linear, policy)?;
        backend
            .bind_buffer_memory(buffer, handle.info.memory, handle.offset)
            .map_err(|e| GpuError::allocation(name, requirements.size, e.to_string()))?;
        Ok(handle)
    }

    /// Allocate memory for a native image and bind it.
    pub fn allocate_for_image(
        &self,
        name: &str,
        ty: ResourceType,
        image: ImageId,
        policy: AllocationPolicy,
    ) -> Result<Handle> {
        let backend = &self.shared.backend;
        let requirements = backend.image_requirements(image);
        let handle = self.allocate(name, ty, requirements, AllocationKind::Optimal, policy)?;
        backend
            .bind_image_memory(image, handle.info.memory, handle.offset)
            .map_err(|e| GpuError::allocation(name, requirements.size, e.to_string()))?;
        Ok(handle)
    }

    /// Allocate memory matching `requirements` without binding it.
    ///
    /// `kind` is the tiling of the resource that will be bound, so linear
    /// and optimal neighbours end up on separate granularity pages.
    pub fn allocate(
        &self,
        name: &str,
        ty: ResourceType,
        requirements: MemoryRequirements,
        kind: AllocationKind,
        policy: AllocationPolicy,
    ) -> Result<Handle> {
        let shared = &self.shared;
        let size = requirements.size;
        if size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "zero-sized allocation '{name}'"
            )));
        }

        let candidates = shared.candidate_types(requirements.memory_type_bits, policy.location);
        if candidates.is_empty() {
            tracing::warn!("No memory type for '{name}' ({}, {size} bytes)", ty.name());
            return Err(GpuError::allocation(name, size, "no compatible memory type"));
        }

        let dedicated = policy.dedicated || size > shared.dedicated_threshold;
        let mut last_error = None;
        for memory_type in candidates {
            match shared.allocate_from_type(
                memory_type,
                size,
                requirements.alignment,
                kind,
                policy.strategy,
                dedicated,
            ) {
                Ok((block_id, offset, memory, mapped)) => {
                    let memory_flags = shared.backend.properties().memory_types
                        [memory_type as usize]
                        .flags;
                    shared.stats.lock().record(name, ty, memory_flags, size);
                    return Ok(Handle {
                        name: name.to_string(),
                        allocator: Arc::clone(shared),
                        offset,
                        info: AllocationInfo {
                            ty,
                            memory,
                            size,
                            memory_flags,
                            memory_type,
                        },
                        block_id,
                        mapped,
                    });
                }
                Err(e) => {
                    tracing::debug!("Memory type {memory_type} failed for '{name}': {e}");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string());
        tracing::warn!(
            "Allocation of '{name}' ({}, {}) failed: {reason}",
            ty.name(),
            format_bytes(size)
        );
        Err(GpuError::allocation(name, size, reason))
    }

    /// Snapshot of the live allocation statistics.
    pub fn stats(&self) -> Stats {
        self.shared.stats.lock().clone()
    }

    /// Text report of the live allocations.
    pub fn report(&self) -> String {
        let vram = self.vram();
        let mut report = format!(
            "VRAM: {} used, {} reserved in {} blocks, {} of {} available\n",
            format_bytes(vram.used),
            format_bytes(vram.reserved),
            vram.block_count,
            format_bytes(vram.available),
            format_bytes(vram.total),
        );
        report.push_str(&self.stats().report());
        report
    }

    /// Device-local memory usage. Host-visible heaps are ignored, so the
    /// numbers stay meaningful on unified memory devices.
    pub fn vram(&self) -> VramUsage {
        let properties = self.shared.backend.properties();
        let total = properties
            .memory_heaps
            .iter()
            .filter(|heap| heap.device_local)
            .map(|heap| heap.size)
            .sum();

        let mut usage = VramUsage {
            total,
            ..VramUsage::default()
        };
        let pools = self.shared.pools.lock();
        for (memory_type, blocks) in pools.iter().enumerate() {
            if !properties.is_device_local_type(memory_type as u32) {
                continue;
            }
            for block in blocks {
                usage.used += block.used();
                usage.reserved += block.memory.size;
                usage.allocation_count += u64::from(block.allocation_count());
                usage.block_count += 1;
            }
        }
        usage.available = usage.total.saturating_sub(usage.reserved);
        usage
    }

    /// The backend this allocator draws from.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }
}

type Placement = (u64, u64, crate::backend::MemoryId, Option<crate::backend::MappedPtr>);

impl AllocatorShared {
    /// Memory types to try for a location, best first.
    fn candidate_types(&self, type_bits: u32, location: MemoryLocation) -> Vec<u32> {
        let properties = self.backend.properties();
        let (required, preferred) = match location {
            MemoryLocation::GpuOnly if properties.integrated => {
                (MemoryFlags::empty(), MemoryFlags::HOST_VISIBLE)
            }
            MemoryLocation::GpuOnly => (MemoryFlags::empty(), MemoryFlags::DEVICE_LOCAL),
            MemoryLocation::CpuToGpu => (
                MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT,
                MemoryFlags::HOST_CACHED,
            ),
            MemoryLocation::GpuToCpu => (MemoryFlags::HOST_VISIBLE, MemoryFlags::HOST_CACHED),
        };

        let compatible: Vec<(u32, MemoryFlags)> = properties
            .memory_types
            .iter()
            .enumerate()
            .filter(|(index, ty)| type_bits & (1 << index) != 0 && ty.flags.contains(required))
            .map(|(index, ty)| (index as u32, ty.flags))
            .collect();

        // Fewest unrequested flags first within each tier.
        let wanted = required | preferred;
        let extra = |flags: MemoryFlags| flags.difference(wanted).bits().count_ones();
        let mut preferred_tier: Vec<_> = compatible
            .iter()
            .filter(|(_, flags)| flags.contains(preferred))
            .copied()
            .collect();
        let mut fallback_tier: Vec<_> = compatible
            .iter()
            .filter(|(_, flags)| !flags.contains(preferred))
            .copied()
            .collect();
        preferred_tier.sort_by_key(|(_, flags)| extra(*flags));
        fallback_tier.sort_by_key(|(_, flags)| extra(*flags));

        preferred_tier
            .into_iter()
            .chain(fallback_tier)
            .map(|(index, _)| index)
            .collect()
    }

    fn allocate_from_type(
        &self,
        memory_type: u32,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
        strategy: AllocationStrategy,
        dedicated: bool,
    ) -> Result<Placement> {
        let properties = self.backend.properties();
        let host_visible = properties.memory_types[memory_type as usize]
            .flags
            .contains(MemoryFlags::HOST_VISIBLE);

        let mut pools = self.pools.lock();
        let pool = &mut pools[memory_type as usize];

        if !dedicated {
            for block in pool.iter_mut().filter(|block| !block.dedicated) {
                if let Some(offset) = block.allocate(size, alignment, kind, strategy) {
                    return Ok((block.id, offset, block.memory.id, mapped_at(block, offset)));
                }
            }
        }

        let block_size = if dedicated {
            size
        } else {
            self.block_size.max(size)
        };
        let memory = self
            .backend
            .allocate_memory(memory_type, block_size, host_visible)?;
        let id = self.next_block_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Created {}memory block {id}: type {memory_type}, {}",
            if dedicated { "dedicated " } else { "" },
            format_bytes(block_size)
        );

        let granularity = if dedicated {
            1
        } else {
            self.buffer_image_granularity
        };
        let mut block = MemoryBlock::new(id, memory, dedicated, granularity);
        let offset = block
            .allocate(size, alignment, kind, strategy)
            .ok_or_else(|| GpuError::Other(format!("fresh block {id} cannot hold {size} bytes")))?;
        let placement = (id, offset, memory.id, mapped_at(&block, offset));
        pool.push(block);
        Ok(placement)
    }

    pub(crate) fn free(&self, handle: &Handle) {
        let info = handle.allocation_info();
        let released = {
            let mut pools = self.pools.lock();
            let pool = &mut pools[info.memory_type as usize];
            match pool.iter().position(|block| block.id == handle.block_id) {
                Some(index) => {
                    pool[index].free(handle.offset, info.size);
                    if pool[index].is_empty() {
                        Some(pool.swap_remove(index))
                    } else {
                        None
                    }
                }
                None => {
                    tracing::error!(
                        "Freeing '{}' from unknown block {}",
                        handle.name(),
                        handle.block_id
                    );
                    return;
                }
            }
        };

        if let Some(block) = released {
            tracing::debug!(
                "Released memory block {}: type {}, {}",
                block.id,
                info.memory_type,
                format_bytes(block.memory.size)
            );
            self.backend.free_memory(block.memory.id);
        }

        self.stats
            .lock()
            .release(handle.name(), info.ty, info.memory_flags, info.size);
    }
}

fn mapped_at(block: &MemoryBlock, offset: u64) -> Option<crate::backend::MappedPtr> {
    // SAFETY: offset lies inside the block, which is mapped in full.
    block.memory.mapped.map(|ptr| unsafe { ptr.add(offset) })
}

impl Drop for AllocatorShared {
    fn drop(&mut self) {
        // Handles keep the allocator alive, so any block left is empty.
        for block in self.pools.get_mut().drain(..).flatten() {
            self.backend.free_memory(block.memory.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferInfo, BufferUsage, ImageInfo, ImageUsage};
    use crate::headless::{HeadlessBackend, HeadlessProfile};
    use stratum_core::Format;

    fn allocator(profile: &HeadlessProfile, config: &AllocatorConfig) -> (Arc<HeadlessBackend>, Allocator) {
        let backend = Arc::new(HeadlessBackend::new(profile));
        let allocator = Allocator::new(backend.clone(), config).unwrap();
        (backend, allocator)
    }

    fn buffer(backend: &HeadlessBackend, size: u64) -> BufferId {
        backend
            .create_buffer(
                &BufferInfo {
                    size,
                    usage: BufferUsage::VERTEX,
                    concurrent: false,
                },
                "test",
            )
            .unwrap()
    }

    #[test]
    fn gpu_only_prefers_device_local_on_discrete() {
        let (_backend, allocator) = allocator(&HeadlessProfile::discrete(), &AllocatorConfig::default());
        let order = allocator.shared.candidate_types(u32::MAX, MemoryLocation::GpuOnly);
        assert_eq!(order[0], 0);
        assert_eq!(order[1], 3);
        let order = allocator.shared.candidate_types(u32::MAX, MemoryLocation::CpuToGpu);
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn gpu_only_prefers_host_visible_on_integrated() {
        let (_backend, allocator) =
            allocator(&HeadlessProfile::integrated(), &AllocatorConfig::default());
        let order = allocator.shared.candidate_types(u32::MAX, MemoryLocation::GpuOnly);
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn small_allocations_share_a_block() {
        let (backend, allocator) = allocator(&HeadlessProfile::discrete(), &AllocatorConfig::default());
        let a = buffer(&backend, 1000);
        let b = buffer(&backend, 1000);
        let ha = allocator
            .allocate_for_buffer("a", ResourceType::Vertex, a, AllocationPolicy::gpu_only())
            .unwrap();
        let hb = allocator
            .allocate_for_buffer("b", ResourceType::Vertex, b, AllocationPolicy::gpu_only())
            .unwrap();
        assert_eq!(ha.allocation_info().memory, hb.allocation_info().memory);
        assert_ne!(ha.offset(), hb.offset());
        assert_eq!(allocator.vram().block_count, 1);
        assert_eq!(allocator.vram().allocation_count, 2);

        drop(ha);
        assert_eq!(allocator.vram().block_count, 1);
        drop(hb);
        assert_eq!(allocator.vram(), VramUsage {
            total: HeadlessProfile::discrete().device_local_heap,
            available: HeadlessProfile::discrete().device_local_heap,
            ..VramUsage::default()
        });
        assert_eq!(backend.live_objects().2, 0);
        backend.destroy_buffer(a);
        backend.destroy_buffer(b);
    }

    #[test]
    fn large_allocations_get_a_dedicated_block() {
        let config = AllocatorConfig::default().with_block_size(1 << 20);
        let (backend, allocator) = allocator(&HeadlessProfile::discrete(), &config);
        let big = buffer(&backend, 768 * 1024);
        let handle = allocator
            .allocate_for_buffer("big", ResourceType::Structured, big, AllocationPolicy::gpu_only())
            .unwrap();
        let vram = allocator.vram();
        assert_eq!(vram.reserved, 768 * 1024);
        assert_eq!(handle.offset(), 0);
        drop(handle);
        backend.destroy_buffer(big);
    }

    #[test]
    fn failing_memory_type_falls_through() {
        let (backend, allocator) = allocator(&HeadlessProfile::discrete(), &AllocatorConfig::default());
        backend.set_failing_memory_types(1 << 0);
        let id = buffer(&backend, 256);
        let handle = allocator
            .allocate_for_buffer("fallback", ResourceType::Index, id, AllocationPolicy::gpu_only())
            .unwrap();
        assert_eq!(handle.allocation_info().memory_type, 3);
        drop(handle);
        backend.destroy_buffer(id);
    }

    #[test]
    fn exhausted_memory_is_recoverable() {
        let (backend, allocator) = allocator(&HeadlessProfile::discrete(), &AllocatorConfig::default());
        backend.set_failing_memory_types(u32::MAX);
        let id = buffer(&backend, 256);
        let err = allocator
            .allocate_for_buffer("oom", ResourceType::Index, id, AllocationPolicy::gpu_only())
            .unwrap_err();
        assert!(matches!(err, GpuError::AllocationFailed { .. }));
        assert!(!err.is_fatal());
        assert_eq!(allocator.stats().total.count, 0);
        backend.destroy_buffer(id);
    }

    #[test]
    fn host_visible_allocations_are_mapped() {
        let (backend, allocator) = allocator(&HeadlessProfile::discrete(), &AllocatorConfig::default());
        let id = buffer(&backend, 64);
        let handle = allocator
            .allocate_for_buffer("staging", ResourceType::Staging, id, AllocationPolicy::cpu_to_gpu())
            .unwrap();
        assert!(handle.mapped_ptr().is_some());
        assert!(handle
            .allocation_info()
            .memory_flags
            .contains(MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT));
        // Host memory does not count as VRAM on a discrete device.
        assert_eq!(allocator.vram().allocation_count, 0);
        assert_eq!(allocator.stats().by_type(ResourceType::Staging).count, 1);
        drop(handle);
        backend.destroy_buffer(id);
    }

    #[test]
    fn buffers_and_images_keep_to_their_own_pages() {
        const PAGE: u64 = 64 * 1024;
        let profile = HeadlessProfile::discrete().with_buffer_image_granularity(PAGE);
        let (backend, allocator) = allocator(&profile, &AllocatorConfig::default());
        let image = backend
            .create_image(
                &ImageInfo {
                    width: 32,
                    height: 32,
                    mip_levels: 1,
                    array_layers: 1,
                    format: Format::Rgba8Unorm,
                    usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
                },
                "albedo",
            )
            .unwrap();
        let mesh = buffer(&backend, 256);

        let hi = allocator
            .allocate_for_image("albedo", ResourceType::Texture, image, AllocationPolicy::gpu_only())
            .unwrap();
        let hb = allocator
            .allocate_for_buffer("mesh", ResourceType::Vertex, mesh, AllocationPolicy::gpu_only())
            .unwrap();
        assert_eq!(hi.allocation_info().memory, hb.allocation_info().memory);
        assert_eq!(hi.offset(), 0);
        assert_eq!(hb.offset(), PAGE);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());

        // Binding a buffer on the image's page by hand is reported.
        let stray = buffer(&backend, 256);
        backend
            .bind_buffer_memory(stray, hi.allocation_info().memory, 4096)
            .unwrap();
        assert_eq!(backend.take_violations().len(), 1);

        backend.destroy_buffer(stray);
        drop(hb);
        drop(hi);
        backend.destroy_buffer(mesh);
        backend.destroy_image(image);
    }
}
