//! Synchronization primitives.

use crate::error::Result;
use ash::vk;

/// Create a binary semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    Ok(unsafe { device.create_semaphore(&create_info, None)? })
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let create_info = vk::FenceCreateInfo::default().flags(flags);
    Ok(unsafe { device.create_fence(&create_info, None)? })
}

/// Wait for every fence to be signaled.
///
/// # Safety
/// The device and fences must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fences(device: &ash::Device, fences: &[vk::Fence], timeout_ns: u64) -> Result<()> {
    if fences.is_empty() {
        return Ok(());
    }
    unsafe { device.wait_for_fences(fences, true, timeout_ns)? };
    Ok(())
}

/// Reset fences to the unsignaled state.
///
/// # Safety
/// The device and fences must be valid and not pending.
pub unsafe fn reset_fences(device: &ash::Device, fences: &[vk::Fence]) -> Result<()> {
    if fences.is_empty() {
        return Ok(());
    }
    unsafe { device.reset_fences(fences)? };
    Ok(())
}
