//! Queue family selection and logical device creation.

use crate::error::{GpuError, Result};
use ash::vk;

/// Queue family indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Pick a graphics family and, when present, a dedicated transfer family.
    ///
    /// Prefers a transfer-only family (DMA engine), then any non-graphics
    /// family with transfer support, then the graphics family itself.
    pub fn select(families: &[vk::QueueFamilyProperties]) -> Result<Self> {
        let mut graphics = None;
        let mut transfer_only = None;
        let mut async_transfer = None;

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            let flags = family.queue_flags;
            if family.queue_count == 0 {
                continue;
            }
            if flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics.get_or_insert(i);
            } else if flags.contains(vk::QueueFlags::TRANSFER)
                || flags.contains(vk::QueueFlags::COMPUTE)
            {
                // Compute queues implicitly support transfer.
                if flags.contains(vk::QueueFlags::COMPUTE) {
                    async_transfer.get_or_insert(i);
                } else {
                    transfer_only.get_or_insert(i);
                }
            }
        }

        let graphics = graphics.ok_or(GpuError::NoSuitableDevice)?;
        Ok(Self {
            graphics,
            transfer: transfer_only.or(async_transfer).unwrap_or(graphics),
        })
    }

    /// Whether uploads get their own family.
    pub const fn is_dedicated(&self) -> bool {
        self.graphics != self.transfer
    }
}

/// Create the logical device and retrieve the graphics and transfer queues.
///
/// The transfer queue is `None` when it would share the graphics family.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilyIndices,
) -> Result<(ash::Device, vk::Queue, Option<vk::Queue>)> {
    let queue_priority = 1.0_f32;
    let mut unique = vec![families.graphics];
    if families.is_dedicated() {
        unique.push(families.transfer);
    }
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::from)?;

    let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
    let transfer_queue = families
        .is_dedicated()
        .then(|| unsafe { device.get_device_queue(families.transfer, 0) });

    Ok((device, graphics_queue, transfer_queue))
}
