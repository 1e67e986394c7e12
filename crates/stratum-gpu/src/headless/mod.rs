//! Headless backend: a CPU simulation of a Vulkan-style device.
//!
//! Memory is real host memory, so copies and mapped writes can be inspected.
//! Submissions are queued and executed lazily, in submission order, when a
//! fence is waited on, the device is idled or [`HeadlessBackend::complete_all`]
//! is called. Execution validates the same rules a driver's validation layer
//! would care about for this workload and records every violation:
//!
//! - queue family ownership of exclusive resources, including matching
//!   release/acquire pairs
//! - image layouts expected by copies and barriers
//! - semaphores waited on without a prior signal
//! - objects destroyed or freed while a pending submission references them
//! - command buffers re-recorded while pending

mod execute;

use crate::backend::{
    Backend, BufferId, BufferInfo, Command, CommandBufferId, DeviceProperties, FenceId, ImageId,
    ImageInfo, ImageLayout, MemoryFlags, MemoryHeap, MemoryId, MemoryRequirements, MemoryType,
    QueueKind, RawMemory, SemaphoreId, Submission,
};
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use stratum_core::math::align_up;

const BUFFER_ALIGNMENT: u64 = 256;
const IMAGE_ALIGNMENT: u64 = 1024;

/// Shape of the simulated device.
#[derive(Clone, Debug)]
pub struct HeadlessProfile {
    pub name: String,
    pub integrated: bool,
    pub dedicated_transfer: bool,
    pub min_uniform_buffer_alignment: u64,
    pub buffer_image_granularity: u64,
    pub device_local_heap: u64,
    pub host_heap: u64,
}

impl Default for HeadlessProfile {
    fn default() -> Self {
        Self::discrete()
    }
}

impl HeadlessProfile {
    /// A discrete GPU with separate VRAM and host heaps.
    pub fn discrete() -> Self {
        Self {
            name: "Headless Discrete".to_string(),
            integrated: false,
            dedicated_transfer: true,
            min_uniform_buffer_alignment: 256,
            buffer_image_granularity: 1024,
            device_local_heap: 256 * 1024 * 1024,
            host_heap: 512 * 1024 * 1024,
        }
    }

    /// An integrated GPU where every memory type lives in one device-local heap.
    pub fn integrated() -> Self {
        Self {
            name: "Headless Integrated".to_string(),
            integrated: true,
            dedicated_transfer: false,
            device_local_heap: 1024 * 1024 * 1024,
            host_heap: 0,
            ..Self::discrete()
        }
    }

    /// Expose a transfer queue family separate from graphics.
    pub fn with_dedicated_transfer(mut self, dedicated: bool) -> Self {
        self.dedicated_transfer = dedicated;
        self
    }

    /// Set the minimum uniform buffer offset alignment.
    pub fn with_min_uniform_alignment(mut self, alignment: u64) -> Self {
        self.min_uniform_buffer_alignment = alignment;
        self
    }

    /// Set the page size linear and optimal resources may not share.
    pub fn with_buffer_image_granularity(mut self, granularity: u64) -> Self {
        self.buffer_image_granularity = granularity;
        self
    }

    /// Set the size of the device-local heap.
    pub fn with_device_local_heap(mut self, size: u64) -> Self {
        self.device_local_heap = size;
        self
    }

    fn properties(&self) -> DeviceProperties {
        let (memory_types, memory_heaps) = if self.integrated {
            let local = MemoryFlags::DEVICE_LOCAL;
            let shared = local | MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT;
            (
                vec![
                    MemoryType {
                        flags: local,
                        heap_index: 0,
                    },
                    MemoryType {
                        flags: shared,
                        heap_index: 0,
                    },
                    MemoryType {
                        flags: shared | MemoryFlags::HOST_CACHED,
                        heap_index: 0,
                    },
                ],
                vec![MemoryHeap {
                    size: self.device_local_heap,
                    device_local: true,
                }],
            )
        } else {
            let host = MemoryFlags::HOST_VISIBLE | MemoryFlags::HOST_COHERENT;
            (
                vec![
                    MemoryType {
                        flags: MemoryFlags::DEVICE_LOCAL,
                        heap_index: 0,
                    },
                    MemoryType {
                        flags: host,
                        heap_index: 1,
                    },
                    MemoryType {
                        flags: host | MemoryFlags::HOST_CACHED,
                        heap_index: 1,
                    },
                    MemoryType {
                        flags: MemoryFlags::DEVICE_LOCAL | host,
                        heap_index: 0,
                    },
                ],
                vec![
                    MemoryHeap {
                        size: self.device_local_heap,
                        device_local: true,
                    },
                    MemoryHeap {
                        size: self.host_heap,
                        device_local: false,
                    },
                ],
            )
        };

        DeviceProperties {
            device_name: self.name.clone(),
            integrated: self.integrated,
            memory_types,
            memory_heaps,
            min_uniform_buffer_alignment: self.min_uniform_buffer_alignment,
            buffer_image_granularity: self.buffer_image_granularity,
            graphics_family: 0,
            transfer_family: u32::from(self.dedicated_transfer),
        }
    }
}

/// Zeroed host memory standing in for a device memory object.
struct HostAllocation {
    ptr: NonNull<u8>,
    size: usize,
    memory_type: u32,
    heap: usize,
}

// SAFETY: the allocation is uniquely owned by the backend state and only
// touched under its mutex or through pointers handed to the allocator.
unsafe impl Send for HostAllocation {}

impl HostAllocation {
    fn new(size: usize, memory_type: u32, heap: usize) -> Self {
        let boxed = vec![0u8; size].into_boxed_slice();
        let ptr = Box::into_raw(boxed).cast::<u8>();
        Self {
            // SAFETY: Box::into_raw never returns null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            size,
            memory_type,
            heap,
        }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from Box::into_raw of a boxed slice of this size.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.size,
            )));
        }
    }
}

/// Queue family ownership of an exclusive resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct QueueOwnership {
    owner: Option<u32>,
    released_to: Option<u32>,
}

struct SimBuffer {
    name: String,
    info: BufferInfo,
    binding: Option<(MemoryId, u64)>,
    ownership: QueueOwnership,
}

struct SimImage {
    name: String,
    info: ImageInfo,
    binding: Option<(MemoryId, u64)>,
    layout: ImageLayout,
    ownership: QueueOwnership,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
    Pending,
}

struct SimCommandBuffer {
    queue: QueueKind,
    state: RecordState,
    commands: Vec<Command>,
}

#[derive(Default)]
struct SimSemaphore {
    signaled: bool,
    pending_signals: u32,
}

struct PendingSubmission {
    queue: QueueKind,
    submission: Submission,
}

#[derive(Default)]
struct State {
    next_id: u64,
    memories: HashMap<u64, HostAllocation>,
    buffers: HashMap<u64, SimBuffer>,
    images: HashMap<u64, SimImage>,
    command_buffers: HashMap<u64, SimCommandBuffer>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, SimSemaphore>,
    pending: VecDeque<PendingSubmission>,
    heap_used: Vec<u64>,
    violations: Vec<String>,
    submissions: u64,
    failing_memory_types: u32,
    failing_submits: u32,
    heap_budget: Option<u64>,
    auto_complete: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn violation(&mut self, message: String) {
        tracing::warn!("headless validation: {message}");
        self.violations.push(message);
    }

    /// Report a new binding that shares a granularity page with a resource
    /// of the other tiling kind on the same memory object.
    fn check_granularity(
        &mut self,
        granularity: u64,
        memory: MemoryId,
        (offset, size): (u64, u64),
        linear: bool,
        what: &str,
    ) {
        if granularity <= 1 || size == 0 {
            return;
        }
        let pages = |offset: u64, size: u64| (offset / granularity, (offset + size - 1) / granularity);
        let (first, last) = pages(offset, size);
        let clashes = |binding: Option<(MemoryId, u64)>, size: u64| {
            binding.is_some_and(|(m, o)| {
                if m != memory || size == 0 {
                    return false;
                }
                let (other_first, other_last) = pages(o, size);
                other_first <= last && first <= other_last
            })
        };
        let neighbours: Vec<String> = if linear {
            self.images
                .values()
                .filter(|i| clashes(i.binding, i.info.linear_size()))
                .map(|i| format!("image '{}'", i.name))
                .collect()
        } else {
            self.buffers
                .values()
                .filter(|b| clashes(b.binding, b.info.size))
                .map(|b| format!("buffer '{}'", b.name))
                .collect()
        };
        for neighbour in neighbours {
            self.violation(format!(
                "{what} at {offset} shares a {granularity}-byte page of memory {} with {neighbour}",
                memory.0
            ));
        }
    }

    fn pending_commands(&self) -> impl Iterator<Item = &Command> {
        self.pending
            .iter()
            .flat_map(|p| p.submission.command_buffers.iter())
            .filter_map(|cmd| self.command_buffers.get(&cmd.0))
            .flat_map(|cmd| cmd.commands.iter())
    }

    fn buffer_in_flight(&self, buffer: BufferId) -> bool {
        self.pending_commands().any(|command| match command {
            Command::CopyBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
            Command::CopyBufferToImage { src, .. } => *src == buffer,
            Command::CopyImageToBuffer { dst, .. } => *dst == buffer,
            Command::CopyImage { .. } => false,
            Command::Barrier(barriers) => barriers.iter().any(|b| {
                matches!(b.target, crate::backend::BarrierTarget::Buffer { buffer: id, .. } if id == buffer)
            }),
        })
    }

    fn image_in_flight(&self, image: ImageId) -> bool {
        self.pending_commands().any(|command| match command {
            Command::CopyBufferToImage { dst, .. } => *dst == image,
            Command::CopyImageToBuffer { src, .. } => *src == image,
            Command::CopyImage { src, dst, .. } => *src == image || *dst == image,
            Command::CopyBuffer { .. } => false,
            Command::Barrier(barriers) => barriers.iter().any(|b| {
                matches!(b.target, crate::backend::BarrierTarget::Image { image: id, .. } if id == image)
            }),
        })
    }

    fn memory_in_flight(&self, memory: MemoryId) -> bool {
        let bound = |binding: Option<(MemoryId, u64)>| binding.is_some_and(|(m, _)| m == memory);
        self.buffers
            .iter()
            .filter(|(_, b)| bound(b.binding))
            .any(|(id, _)| self.buffer_in_flight(BufferId(*id)))
            || self
                .images
                .iter()
                .filter(|(_, i)| bound(i.binding))
                .any(|(id, _)| self.image_in_flight(ImageId(*id)))
    }

    fn command_buffer_pending(&self, command_buffer: CommandBufferId) -> bool {
        self.command_buffers
            .get(&command_buffer.0)
            .is_some_and(|cmd| cmd.state == RecordState::Pending)
    }

    /// Execute the oldest pending submission. Returns false when none is left.
    fn complete_next(&mut self, properties: &DeviceProperties) -> bool {
        let Some(pending) = self.pending.pop_front() else {
            return false;
        };
        self.execute(properties, pending);
        true
    }

    fn fences_signaled(&self, fences: &[FenceId]) -> Result<bool> {
        let mut all = true;
        for fence in fences {
            match self.fences.get(&fence.0) {
                Some(signaled) => all &= *signaled,
                None => {
                    return Err(GpuError::InvalidArgument(format!(
                        "unknown fence {}",
                        fence.0
                    )))
                }
            }
        }
        Ok(all)
    }

    fn live_buffer_binding(&self, buffer: BufferId) -> Option<(MemoryId, u64)> {
        self.buffers.get(&buffer.0).and_then(|b| b.binding)
    }

    fn bytes_at(&self, memory: MemoryId, offset: u64, size: u64) -> Option<*mut u8> {
        let allocation = self.memories.get(&memory.0)?;
        let end = offset.checked_add(size)?;
        if end > allocation.size as u64 {
            return None;
        }
        // SAFETY: offset + size is within the allocation.
        Some(unsafe { allocation.ptr.as_ptr().add(offset as usize) })
    }
}

/// CPU-simulated device.
pub struct HeadlessBackend {
    properties: DeviceProperties,
    state: Mutex<State>,
}

impl HeadlessBackend {
    /// Create a simulated device with the given profile.
    pub fn new(profile: &HeadlessProfile) -> Self {
        let properties = profile.properties();
        let state = State {
            heap_used: vec![0; properties.memory_heaps.len()],
            ..State::default()
        };
        tracing::info!("Created headless device: {}", properties.device_name);
        Self {
            properties,
            state: Mutex::new(state),
        }
    }

    /// Execute submissions immediately instead of lazily.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        let mut state = self.state.lock();
        state.auto_complete = auto_complete;
        if auto_complete {
            while state.complete_next(&self.properties) {}
        }
    }

    /// Make allocations from the memory types in `mask` fail.
    pub fn set_failing_memory_types(&self, mask: u32) {
        self.state.lock().failing_memory_types = mask;
    }

    /// Make the next `count` queue submissions fail.
    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().failing_submits = count;
    }

    /// Cap every heap at `budget` bytes. `None` uses the heap sizes.
    pub fn set_heap_budget(&self, budget: Option<u64>) {
        self.state.lock().heap_budget = budget;
    }

    /// Execute every pending submission.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while state.complete_next(&self.properties) {}
    }

    /// Number of submissions not yet executed.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Total number of queue submissions made.
    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    /// Validation violations recorded so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Take and clear the recorded violations.
    pub fn take_violations(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().violations)
    }

    /// Number of live (buffers, images, memory objects).
    pub fn live_objects(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.buffers.len(), state.images.len(), state.memories.len())
    }

    /// Bytes of device memory currently allocated from a heap.
    pub fn heap_used(&self, heap: usize) -> u64 {
        self.state.lock().heap_used.get(heap).copied().unwrap_or(0)
    }

    /// Current contents of a buffer.
    pub fn read_buffer(&self, buffer: BufferId) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.0)?.info.size;
        let (memory, offset) = state.live_buffer_binding(buffer)?;
        let ptr = state.bytes_at(memory, offset, size)?;
        // SAFETY: bounds checked by bytes_at; the state lock is held.
        Some(unsafe { std::slice::from_raw_parts(ptr, size as usize) }.to_vec())
    }

    /// Current contents of an image in its tightly packed layout.
    pub fn read_image(&self, image: ImageId) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let sim = state.images.get(&image.0)?;
        let size = sim.info.linear_size();
        let (memory, offset) = sim.binding?;
        let ptr = state.bytes_at(memory, offset, size)?;
        // SAFETY: bounds checked by bytes_at; the state lock is held.
        Some(unsafe { std::slice::from_raw_parts(ptr, size as usize) }.to_vec())
    }

    /// Queue family currently owning a buffer.
    pub fn buffer_owner(&self, buffer: BufferId) -> Option<u32> {
        self.state
            .lock()
            .buffers
            .get(&buffer.0)
            .and_then(|b| b.ownership.owner)
    }

    /// Current layout and owning queue family of an image.
    pub fn image_state(&self, image: ImageId) -> Option<(ImageLayout, Option<u32>)> {
        self.state
            .lock()
            .images
            .get(&image.0)
            .map(|i| (i.layout, i.ownership.owner))
    }

    /// Debug name a buffer was created with.
    pub fn buffer_name(&self, buffer: BufferId) -> Option<String> {
        self.state.lock().buffers.get(&buffer.0).map(|b| b.name.clone())
    }

    fn heap_budget(&self, state: &State, heap: usize) -> u64 {
        let size = self.properties.memory_heaps[heap].size;
        state.heap_budget.map_or(size, |budget| budget.min(size))
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(&HeadlessProfile::default())
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn allocate_memory(&self, memory_type: u32, size: u64, map: bool) -> Result<RawMemory> {
        let ty = self
            .properties
            .memory_types
            .get(memory_type as usize)
            .copied()
            .ok_or_else(|| GpuError::InvalidArgument(format!("memory type {memory_type}")))?;
        if size == 0 {
            return Err(GpuError::InvalidArgument(
                "zero-sized memory allocation".to_string(),
            ));
        }
        if map && !ty.flags.contains(MemoryFlags::HOST_VISIBLE) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED.into());
        }

        let mut state = self.state.lock();
        if state.failing_memory_types & (1 << memory_type) != 0 {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
        }
        let heap = ty.heap_index as usize;
        if state.heap_used[heap] + size > self.heap_budget(&state, heap) {
            return Err(if self.properties.memory_heaps[heap].device_local {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into()
            } else {
                vk::Result::ERROR_OUT_OF_HOST_MEMORY.into()
            });
        }

        let allocation = HostAllocation::new(size as usize, memory_type, heap);
        let mapped = map.then(|| crate::backend::MappedPtr::new(allocation.ptr.as_ptr()));
        let id = state.next_id();
        state.heap_used[heap] += size;
        state.memories.insert(id, allocation);

        Ok(RawMemory {
            id: MemoryId(id),
            size,
            memory_type,
            mapped: mapped.flatten(),
        })
    }

    fn free_memory(&self, memory: MemoryId) {
        let mut state = self.state.lock();
        if state.memory_in_flight(memory) {
            state.violation(format!(
                "memory {} freed while a pending submission uses it",
                memory.0
            ));
        }
        if let Some(allocation) = state.memories.remove(&memory.0) {
            state.heap_used[allocation.heap] -= allocation.size as u64;
            debug_assert!(
                (allocation.memory_type as usize) < self.properties.memory_types.len()
            );
        } else {
            state.violation(format!("memory {} freed twice", memory.0));
        }
    }

    fn flush_memory(&self, memory: MemoryId, offset: u64, size: u64) -> Result<()> {
        let state = self.state.lock();
        state
            .bytes_at(memory, offset, size)
            .map(|_| ())
            .ok_or_else(|| GpuError::InvalidArgument(format!("flush outside memory {}", memory.0)))
    }

    fn invalidate_memory(&self, memory: MemoryId, offset: u64, size: u64) -> Result<()> {
        self.flush_memory(memory, offset, size)
    }

    fn create_buffer(&self, info: &BufferInfo, name: &str) -> Result<BufferId> {
        if info.size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{name}' has zero size"
            )));
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        state.buffers.insert(
            id,
            SimBuffer {
                name: name.to_string(),
                info: *info,
                binding: None,
                ownership: QueueOwnership::default(),
            },
        );
        Ok(BufferId(id))
    }

    fn buffer_requirements(&self, buffer: BufferId) -> MemoryRequirements {
        let size = self
            .state
            .lock()
            .buffers
            .get(&buffer.0)
            .map_or(0, |b| b.info.size);
        MemoryRequirements {
            size: align_up(size, BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: (1 << self.properties.memory_types.len()) - 1,
        }
    }

    fn bind_buffer_memory(&self, buffer: BufferId, memory: MemoryId, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        let (size, what) = state
            .buffers
            .get(&buffer.0)
            .map(|b| (b.info.size, format!("buffer '{}'", b.name)))
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown buffer {}", buffer.0)))?;
        if state.bytes_at(memory, offset, size).is_none() {
            return Err(GpuError::InvalidArgument(format!(
                "binding buffer {} at {offset} overruns memory {}",
                buffer.0, memory.0
            )));
        }
        state.check_granularity(
            self.properties.buffer_image_granularity,
            memory,
            (offset, size),
            true,
            &what,
        );
        if let Some(sim) = state.buffers.get_mut(&buffer.0) {
            sim.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        if state.buffer_in_flight(buffer) {
            state.violation(format!(
                "buffer {} destroyed while a pending submission uses it",
                buffer.0
            ));
        }
        state.buffers.remove(&buffer.0);
    }

    fn create_image(&self, info: &ImageInfo, name: &str) -> Result<ImageId> {
        if info.width == 0 || info.height == 0 || info.mip_levels == 0 || info.array_layers == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "image '{name}' has a zero extent"
            )));
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        state.images.insert(
            id,
            SimImage {
                name: name.to_string(),
                info: *info,
                binding: None,
                layout: ImageLayout::Undefined,
                ownership: QueueOwnership::default(),
            },
        );
        Ok(ImageId(id))
    }

    fn image_requirements(&self, image: ImageId) -> MemoryRequirements {
        let size = self
            .state
            .lock()
            .images
            .get(&image.0)
            .map_or(0, |i| i.info.linear_size());
        MemoryRequirements {
            size: align_up(size, IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: (1 << self.properties.memory_types.len()) - 1,
        }
    }

    fn bind_image_memory(&self, image: ImageId, memory: MemoryId, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        let (size, what) = state
            .images
            .get(&image.0)
            .map(|i| (i.info.linear_size(), format!("image '{}'", i.name)))
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown image {}", image.0)))?;
        if state.bytes_at(memory, offset, size).is_none() {
            return Err(GpuError::InvalidArgument(format!(
                "binding image {} at {offset} overruns memory {}",
                image.0, memory.0
            )));
        }
        state.check_granularity(
            self.properties.buffer_image_granularity,
            memory,
            (offset, size),
            false,
            &what,
        );
        if let Some(sim) = state.images.get_mut(&image.0) {
            sim.binding = Some((memory, offset));
        }
        Ok(())
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.state.lock();
        if state.image_in_flight(image) {
            let name = state
                .images
                .get(&image.0)
                .map(|i| i.name.clone())
                .unwrap_or_default();
            state.violation(format!(
                "image {} '{name}' destroyed while a pending submission uses it",
                image.0
            ));
        }
        state.images.remove(&image.0);
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferId> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.command_buffers.insert(
            id,
            SimCommandBuffer {
                queue,
                state: RecordState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(CommandBufferId(id))
    }

    fn destroy_command_buffer(&self, command_buffer: CommandBufferId) {
        let mut state = self.state.lock();
        if state.command_buffer_pending(command_buffer) {
            state.violation(format!(
                "command buffer {} destroyed while pending",
                command_buffer.0
            ));
        }
        state.command_buffers.remove(&command_buffer.0);
    }

    fn begin_commands(&self, command_buffer: CommandBufferId) -> Result<()> {
        let mut state = self.state.lock();
        if state.command_buffer_pending(command_buffer) {
            let message = format!("command buffer {} re-recorded while pending", command_buffer.0);
            state.violation(message.clone());
            return Err(GpuError::InvalidState(message));
        }
        let cmd = state
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown command buffer {}", command_buffer.0)))?;
        cmd.state = RecordState::Recording;
        cmd.commands.clear();
        Ok(())
    }

    fn record(&self, command_buffer: CommandBufferId, command: &Command) -> Result<()> {
        let mut state = self.state.lock();
        let cmd = state
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown command buffer {}", command_buffer.0)))?;
        if cmd.state != RecordState::Recording {
            return Err(GpuError::InvalidState(format!(
                "command buffer {} is not recording",
                command_buffer.0
            )));
        }
        cmd.commands.push(command.clone());
        Ok(())
    }

    fn end_commands(&self, command_buffer: CommandBufferId) -> Result<()> {
        let mut state = self.state.lock();
        let cmd = state
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown command buffer {}", command_buffer.0)))?;
        if cmd.state != RecordState::Recording {
            return Err(GpuError::InvalidState(format!(
                "command buffer {} is not recording",
                command_buffer.0
            )));
        }
        cmd.state = RecordState::Executable;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceId> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.fences.insert(id, signaled);
        Ok(FenceId(id))
    }

    fn destroy_fence(&self, fence: FenceId) {
        let mut state = self.state.lock();
        let pending = state
            .pending
            .iter()
            .any(|p| p.submission.fence == Some(fence));
        if pending {
            state.violation(format!("fence {} destroyed while pending", fence.0));
        }
        state.fences.remove(&fence.0);
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait_fences(&self, fences: &[FenceId], _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.fences_signaled(fences)? {
                return Ok(());
            }
            if !state.complete_next(&self.properties) {
                // Nothing left that could signal the fence.
                return Err(GpuError::Timeout);
            }
        }
    }

    fn reset_fences(&self, fences: &[FenceId]) -> Result<()> {
        let mut state = self.state.lock();
        for fence in fences {
            let pending = state
                .pending
                .iter()
                .any(|p| p.submission.fence == Some(*fence));
            if pending {
                state.violation(format!("fence {} reset while pending", fence.0));
            }
            match state.fences.get_mut(&fence.0) {
                Some(signaled) => *signaled = false,
                None => {
                    return Err(GpuError::InvalidArgument(format!(
                        "unknown fence {}",
                        fence.0
                    )))
                }
            }
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceId) -> Result<bool> {
        self.state.lock().fences_signaled(&[fence])
    }

    fn create_semaphore(&self) -> Result<SemaphoreId> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.semaphores.insert(id, SimSemaphore::default());
        Ok(SemaphoreId(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        let mut state = self.state.lock();
        let pending = state.pending.iter().any(|p| {
            p.submission.signal_semaphores.contains(&semaphore)
                || p.submission
                    .wait_semaphores
                    .iter()
                    .any(|(s, _)| *s == semaphore)
        });
        if pending {
            state.violation(format!(
                "semaphore {} destroyed while pending",
                semaphore.0
            ));
        }
        state.semaphores.remove(&semaphore.0);
    }

    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY.into());
        }

        for cmd in &submission.command_buffers {
            let Some(sim) = state.command_buffers.get(&cmd.0) else {
                return Err(GpuError::InvalidArgument(format!(
                    "unknown command buffer {}",
                    cmd.0
                )));
            };
            if sim.queue != queue {
                let message = format!(
                    "command buffer {} allocated for {:?} submitted to {queue:?}",
                    cmd.0, sim.queue
                );
                state.violation(message.clone());
                return Err(GpuError::InvalidState(message));
            }
            if sim.state != RecordState::Executable {
                let message = format!(
                    "command buffer {} submitted in state {:?}",
                    cmd.0, sim.state
                );
                state.violation(message.clone());
                return Err(GpuError::InvalidState(message));
            }
        }

        if let Some(fence) = submission.fence {
            let signaled = state.fences.get(&fence.0).copied().ok_or_else(|| {
                GpuError::InvalidArgument(format!("unknown fence {}", fence.0))
            })?;
            let pending = state
                .pending
                .iter()
                .any(|p| p.submission.fence == Some(fence));
            if signaled || pending {
                let message = format!("fence {} submitted while signaled or pending", fence.0);
                state.violation(message.clone());
                return Err(GpuError::InvalidState(message));
            }
        }

        for (semaphore, _) in &submission.wait_semaphores {
            let ready = state
                .semaphores
                .get(&semaphore.0)
                .is_some_and(|s| s.signaled || s.pending_signals > 0);
            if !ready {
                state.violation(format!(
                    "submission waits on semaphore {} that nothing signals",
                    semaphore.0
                ));
            }
        }

        for semaphore in &submission.signal_semaphores {
            if let Some(sim) = state.semaphores.get_mut(&semaphore.0) {
                sim.pending_signals += 1;
            }
        }
        for cmd in &submission.command_buffers {
            if let Some(sim) = state.command_buffers.get_mut(&cmd.0) {
                sim.state = RecordState::Pending;
            }
        }

        state.submissions += 1;
        state.pending.push_back(PendingSubmission {
            queue,
            submission: submission.clone(),
        });
        if state.auto_complete {
            while state.complete_next(&self.properties) {}
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.complete_all();
        Ok(())
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.memories.is_empty() || !state.buffers.is_empty() || !state.images.is_empty() {
            tracing::warn!(
                "Headless device dropped with {} memory objects, {} buffers, {} images alive",
                state.memories.len(),
                state.buffers.len(),
                state.images.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferCopy, BufferUsage};

    fn buffer(backend: &HeadlessBackend, size: u64, memory_type: u32) -> (BufferId, RawMemory) {
        let id = backend
            .create_buffer(
                &BufferInfo {
                    size,
                    usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                    concurrent: false,
                },
                "test",
            )
            .unwrap();
        let memory = backend
            .allocate_memory(memory_type, align_up(size, BUFFER_ALIGNMENT), memory_type != 0)
            .unwrap();
        backend.bind_buffer_memory(id, memory.id, 0).unwrap();
        (id, memory)
    }

    #[test]
    fn submissions_complete_lazily_on_fence_wait() {
        let backend = HeadlessBackend::default();
        let (src, src_memory) = buffer(&backend, 16, 1);
        let (dst, _) = buffer(&backend, 16, 0);
        let mapped = src_memory.mapped.unwrap();
        unsafe { std::ptr::write_bytes(mapped.as_ptr(), 7, 16) };

        let cmd = backend.create_command_buffer(QueueKind::Graphics).unwrap();
        backend.begin_commands(cmd).unwrap();
        backend
            .record(
                cmd,
                &Command::CopyBuffer {
                    src,
                    dst,
                    regions: vec![BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: 16,
                    }],
                },
            )
            .unwrap();
        backend.end_commands(cmd).unwrap();
        let fence = backend.create_fence(false).unwrap();
        backend
            .submit(
                QueueKind::Graphics,
                &Submission {
                    command_buffers: vec![cmd],
                    fence: Some(fence),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(backend.read_buffer(dst).unwrap(), vec![0; 16]);
        assert!(!backend.fence_signaled(fence).unwrap());
        backend.wait_fences(&[fence], u64::MAX).unwrap();
        assert_eq!(backend.read_buffer(dst).unwrap(), vec![7; 16]);
        assert!(backend.violations().is_empty());
    }

    #[test]
    fn rerecording_pending_command_buffer_is_rejected() {
        let backend = HeadlessBackend::default();
        let cmd = backend.create_command_buffer(QueueKind::Transfer).unwrap();
        backend.begin_commands(cmd).unwrap();
        backend.end_commands(cmd).unwrap();
        backend
            .submit(
                QueueKind::Transfer,
                &Submission {
                    command_buffers: vec![cmd],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(backend.begin_commands(cmd).is_err());
        assert_eq!(backend.violations().len(), 1);
        backend.complete_all();
        assert!(backend.begin_commands(cmd).is_ok());
    }

    #[test]
    fn waiting_on_unsignaled_semaphore_is_reported() {
        let backend = HeadlessBackend::default();
        let semaphore = backend.create_semaphore().unwrap();
        let cmd = backend.create_command_buffer(QueueKind::Graphics).unwrap();
        backend.begin_commands(cmd).unwrap();
        backend.end_commands(cmd).unwrap();
        backend
            .submit(
                QueueKind::Graphics,
                &Submission {
                    command_buffers: vec![cmd],
                    wait_semaphores: vec![(semaphore, crate::backend::Access::TransferRead)],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!backend.violations().is_empty());
    }

    #[test]
    fn heap_budget_limits_allocation() {
        let backend = HeadlessBackend::default();
        backend.set_heap_budget(Some(4096));
        assert!(backend.allocate_memory(0, 4096, false).is_ok());
        assert!(matches!(
            backend.allocate_memory(0, 1, false),
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        ));
    }

    #[test]
    fn integrated_profile_has_single_device_local_heap() {
        let backend = HeadlessBackend::new(&HeadlessProfile::integrated());
        let properties = backend.properties();
        assert!(properties.integrated);
        assert_eq!(properties.memory_heaps.len(), 1);
        assert!(!properties.has_dedicated_transfer());
        assert!((0..properties.memory_types.len() as u32).all(|t| properties.is_device_local_type(t)));
    }
}
