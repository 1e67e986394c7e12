//! Vulkan backend on ash.
//!
//! Native handles are passed through the [`Backend`] ids as their raw 64-bit
//! values. Barriers and submits use synchronization2.

mod capabilities;
mod command;
mod instance;
mod queues;
mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use queues::QueueFamilyIndices;

use crate::backend::{
    Backend, BufferId, BufferInfo, Command, CommandBufferId, DeviceProperties, FenceId, ImageId,
    ImageInfo, MappedPtr, MemoryFlags, MemoryHeap, MemoryId, MemoryRequirements, MemoryType,
    QueueKind, RawMemory, SemaphoreId, Submission,
};
use crate::error::{GpuError, Result};
use ash::vk;
use ash::vk::Handle;
use command::CommandPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use stratum_core::math::{align_down, align_up};
use stratum_core::DeviceConfig;

/// Builder for a [`VulkanBackend`].
pub struct VulkanBackendBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for VulkanBackendBuilder {
    fn default() -> Self {
        Self {
            app_name: "Stratum".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl VulkanBackendBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the application name and validation setting from a device config.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new()
            .app_name(config.app_name.clone())
            .validation(config.validation)
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Load Vulkan, pick a GPU and create the logical device.
    pub fn build(self) -> Result<VulkanBackend> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;
        let instance =
            unsafe { instance::create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let selected = unsafe { instance::select_physical_device(&instance) };
        let (physical_device, capabilities) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let families = unsafe {
            QueueFamilyIndices::select(
                &instance.get_physical_device_queue_family_properties(physical_device),
            )
        };
        let created = families.and_then(|families| {
            let created = unsafe { queues::create_device(&instance, physical_device, families) };
            created.map(|created| (families, created))
        });
        let (families, (device, graphics_queue, transfer_queue)) = match created {
            Ok(created) => created,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        tracing::debug!(
            "Queue families: graphics {}, transfer {}",
            families.graphics,
            families.transfer
        );

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = DeviceProperties {
            device_name: capabilities.device_name.clone(),
            integrated: capabilities.is_integrated(),
            memory_types: memory_properties
                .memory_types
                .iter()
                .take(memory_properties.memory_type_count as usize)
                .map(|ty| MemoryType {
                    flags: MemoryFlags::from_bits_truncate(ty.property_flags.as_raw()),
                    heap_index: ty.heap_index,
                })
                .collect(),
            memory_heaps: memory_properties
                .memory_heaps
                .iter()
                .take(memory_properties.memory_heap_count as usize)
                .map(|heap| MemoryHeap {
                    size: heap.size,
                    device_local: heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
                })
                .collect(),
            min_uniform_buffer_alignment: capabilities.min_uniform_buffer_alignment,
            buffer_image_granularity: capabilities.buffer_image_granularity,
            graphics_family: families.graphics,
            transfer_family: families.transfer,
        };

        Ok(VulkanBackend {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            properties,
            graphics_queue: Mutex::new(graphics_queue),
            transfer_queue: transfer_queue.map(Mutex::new),
            memory_sizes: Mutex::new(HashMap::new()),
            command_pools: Mutex::new(HashMap::new()),
        })
    }
}

/// [`Backend`] driving a Vulkan 1.3 device.
pub struct VulkanBackend {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: GpuCapabilities,
    properties: DeviceProperties,
    graphics_queue: Mutex<vk::Queue>,
    /// `None` when uploads share the graphics queue.
    transfer_queue: Option<Mutex<vk::Queue>>,
    /// Size of every live memory object, for clamping flush ranges.
    memory_sizes: Mutex<HashMap<u64, u64>>,
    command_pools: Mutex<HashMap<u64, CommandPool>>,
}

impl VulkanBackend {
    /// Create a backend with default settings.
    pub fn builder() -> VulkanBackendBuilder {
        VulkanBackendBuilder::new()
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<vk::Queue> {
        match kind {
            QueueKind::Graphics => &self.graphics_queue,
            QueueKind::Transfer => self.transfer_queue.as_ref().unwrap_or(&self.graphics_queue),
        }
    }

    fn sharing_families(&self) -> Option<[u32; 2]> {
        self.properties
            .has_dedicated_transfer()
            .then_some([self.properties.graphics_family, self.properties.transfer_family])
    }

    /// Flush/invalidate range rounded out to the non-coherent atom size.
    fn mapped_range(&self, memory: MemoryId, offset: u64, size: u64) -> vk::MappedMemoryRange<'static> {
        let atom = self.capabilities.non_coherent_atom_size.max(1);
        let start = align_down(offset, atom);
        let total = self.memory_sizes.lock().get(&memory.0).copied().unwrap_or(u64::MAX);
        let end = align_up(offset + size, atom);
        let size = if end >= total { vk::WHOLE_SIZE } else { end - start };
        vk::MappedMemoryRange::default()
            .memory(vk::DeviceMemory::from_raw(memory.0))
            .offset(start)
            .size(size)
    }

    fn with_pool<T>(&self, command_buffer: CommandBufferId, f: impl FnOnce(&CommandPool) -> Result<T>) -> Result<T> {
        let pools = self.command_pools.lock();
        let pool = pools.get(&command_buffer.0).ok_or_else(|| {
            GpuError::InvalidState(format!("unknown command buffer {:#x}", command_buffer.0))
        })?;
        f(pool)
    }
}

impl Backend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn allocate_memory(&self, memory_type: u32, size: u64, map: bool) -> Result<RawMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        let memory = unsafe { self.device.allocate_memory(&info, None)? };

        let mapped = if map {
            match unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            } {
                Ok(ptr) => MappedPtr::new(ptr.cast()),
                Err(e) => {
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        self.memory_sizes.lock().insert(memory.as_raw(), size);
        Ok(RawMemory {
            id: MemoryId(memory.as_raw()),
            size,
            memory_type,
            mapped,
        })
    }

    fn free_memory(&self, memory: MemoryId) {
        self.memory_sizes.lock().remove(&memory.0);
        // Freeing implicitly unmaps.
        unsafe {
            self.device
                .free_memory(vk::DeviceMemory::from_raw(memory.0), None);
        }
    }

    fn flush_memory(&self, memory: MemoryId, offset: u64, size: u64) -> Result<()> {
        let range = self.mapped_range(memory, offset, size);
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn invalidate_memory(&self, memory: MemoryId, offset: u64, size: u64) -> Result<()> {
        let range = self.mapped_range(memory, offset, size);
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn create_buffer(&self, info: &BufferInfo, name: &str) -> Result<BufferId> {
        let families = self.sharing_families();
        let mut create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(vk::BufferUsageFlags::from_raw(info.usage.bits()));
        create_info = match (info.concurrent, families.as_ref()) {
            (true, Some(families)) => create_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(families),
            _ => create_info.sharing_mode(vk::SharingMode::EXCLUSIVE),
        };
        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };
        tracing::trace!("Created buffer '{name}' ({} bytes)", info.size);
        Ok(BufferId(buffer.as_raw()))
    }

    fn buffer_requirements(&self, buffer: BufferId) -> MemoryRequirements {
        let requirements = unsafe {
            self.device
                .get_buffer_memory_requirements(vk::Buffer::from_raw(buffer.0))
        };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn bind_buffer_memory(&self, buffer: BufferId, memory: MemoryId, offset: u64) -> Result<()> {
        unsafe {
            self.device.bind_buffer_memory(
                vk::Buffer::from_raw(buffer.0),
                vk::DeviceMemory::from_raw(memory.0),
                offset,
            )?;
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        unsafe {
            self.device
                .destroy_buffer(vk::Buffer::from_raw(buffer.0), None);
        }
    }

    fn create_image(&self, info: &ImageInfo, name: &str) -> Result<ImageId> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(command::vk_format(info.format))
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::from_raw(info.usage.bits()))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None)? };
        tracing::trace!(
            "Created image '{name}' ({}x{}, {} mips, {:?})",
            info.width,
            info.height,
            info.mip_levels,
            info.format
        );
        Ok(ImageId(image.as_raw()))
    }

    fn image_requirements(&self, image: ImageId) -> MemoryRequirements {
        let requirements = unsafe {
            self.device
                .get_image_memory_requirements(vk::Image::from_raw(image.0))
        };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn bind_image_memory(&self, image: ImageId, memory: MemoryId, offset: u64) -> Result<()> {
        unsafe {
            self.device.bind_image_memory(
                vk::Image::from_raw(image.0),
                vk::DeviceMemory::from_raw(memory.0),
                offset,
            )?;
        }
        Ok(())
    }

    fn destroy_image(&self, image: ImageId) {
        unsafe { self.device.destroy_image(vk::Image::from_raw(image.0), None) };
    }

    fn create_command_buffer(&self, queue: QueueKind) -> Result<CommandBufferId> {
        let pool = unsafe { CommandPool::new(&self.device, self.properties.family(queue))? };
        let id = pool.command_buffer().as_raw();
        self.command_pools.lock().insert(id, pool);
        Ok(CommandBufferId(id))
    }

    fn destroy_command_buffer(&self, command_buffer: CommandBufferId) {
        if let Some(pool) = self.command_pools.lock().remove(&command_buffer.0) {
            unsafe { pool.destroy(&self.device) };
        }
    }

    fn begin_commands(&self, command_buffer: CommandBufferId) -> Result<()> {
        self.with_pool(command_buffer, |pool| unsafe { pool.begin(&self.device) })
    }

    fn record(&self, command_buffer: CommandBufferId, command: &Command) -> Result<()> {
        unsafe {
            command::record_command(
                &self.device,
                vk::CommandBuffer::from_raw(command_buffer.0),
                command,
            );
        }
        Ok(())
    }

    fn end_commands(&self, command_buffer: CommandBufferId) -> Result<()> {
        unsafe {
            self.device
                .end_command_buffer(vk::CommandBuffer::from_raw(command_buffer.0))?;
        }
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceId> {
        let fence = unsafe { sync::create_fence(&self.device, signaled)? };
        Ok(FenceId(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: FenceId) {
        unsafe { self.device.destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn wait_fences(&self, fences: &[FenceId], timeout_ns: u64) -> Result<()> {
        let fences: Vec<vk::Fence> = fences.iter().map(|f| vk::Fence::from_raw(f.0)).collect();
        unsafe { sync::wait_for_fences(&self.device, &fences, timeout_ns) }
    }

    fn reset_fences(&self, fences: &[FenceId]) -> Result<()> {
        let fences: Vec<vk::Fence> = fences.iter().map(|f| vk::Fence::from_raw(f.0)).collect();
        unsafe { sync::reset_fences(&self.device, &fences) }
    }

    fn fence_signaled(&self, fence: FenceId) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(vk::Fence::from_raw(fence.0))? })
    }

    fn create_semaphore(&self) -> Result<SemaphoreId> {
        let semaphore = unsafe { sync::create_semaphore(&self.device)? };
        Ok(SemaphoreId(semaphore.as_raw()))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        unsafe {
            self.device
                .destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None);
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<()> {
        let waits: Vec<vk::SemaphoreSubmitInfo> = submission
            .wait_semaphores
            .iter()
            .map(|(semaphore, access)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(vk::Semaphore::from_raw(semaphore.0))
                    .stage_mask(command::scope(*access).0)
            })
            .collect();
        let signals: Vec<vk::SemaphoreSubmitInfo> = submission
            .signal_semaphores
            .iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(vk::Semaphore::from_raw(semaphore.0))
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let command_buffers: Vec<vk::CommandBufferSubmitInfo> = submission
            .command_buffers
            .iter()
            .map(|cmd| {
                vk::CommandBufferSubmitInfo::default()
                    .command_buffer(vk::CommandBuffer::from_raw(cmd.0))
            })
            .collect();
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);
        let fence = submission
            .fence
            .map_or(vk::Fence::null(), |f| vk::Fence::from_raw(f.0));

        let queue = self.queue(queue).lock();
        unsafe { self.device.queue_submit2(*queue, &[submit_info], fence)? };
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait_idle(&self) -> Result<()> {
        let _graphics = self.graphics_queue.lock();
        let _transfer = self.transfer_queue.as_ref().map(Mutex::lock);
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for (_, pool) in self.command_pools.get_mut().drain() {
                pool.destroy(&self.device);
            }
            let leaked = self.memory_sizes.get_mut().len();
            if leaked > 0 {
                tracing::warn!("{leaked} device memory objects still allocated at shutdown");
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
