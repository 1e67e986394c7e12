//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// What the resource core needs to know about a physical device.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    /// Synchronization2 barriers and submits (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub max_memory_allocation_count: u32,
    pub min_uniform_buffer_alignment: u64,
    /// Page size separating linear and optimal resources in one allocation
    pub buffer_image_granularity: u64,
    /// Granularity of flushes to non-coherent memory
    pub non_coherent_atom_size: u64,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        let supports_synchronization2 = features13.synchronization2 == vk::TRUE;

        // SAFETY: the driver returns a NUL-terminated device name.
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            supports_synchronization2,
            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            min_uniform_buffer_alignment: properties.limits.min_uniform_buffer_offset_alignment,
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
        }
    }

    /// Vulkan 1.3 with synchronization2.
    pub fn meets_requirements(&self) -> bool {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        (major, minor) >= (1, 3) && self.supports_synchronization2
    }

    /// Selection score: discrete first, then more VRAM.
    pub fn score(&self) -> i64 {
        let kind = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        // +1 per GB
        kind + (self.device_local_memory_mb / 1024) as i64
    }

    /// Whether the device shares memory with the host.
    pub fn is_integrated(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(device_type: vk::PhysicalDeviceType, api_version: u32) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".into(),
            device_type,
            api_version,
            driver_version: 0,
            supports_synchronization2: true,
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            min_uniform_buffer_alignment: 256,
            buffer_image_granularity: 1024,
            non_coherent_atom_size: 64,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn requires_vulkan_1_3() {
        let old = capabilities(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_2);
        assert!(!old.meets_requirements());
        let current = capabilities(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_3);
        assert!(current.meets_requirements());
    }

    #[test]
    fn discrete_scores_higher() {
        let discrete = capabilities(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_3);
        let integrated = capabilities(vk::PhysicalDeviceType::INTEGRATED_GPU, vk::API_VERSION_1_3);
        assert!(discrete.score() > integrated.score());
        assert!(integrated.is_integrated());
    }
}
