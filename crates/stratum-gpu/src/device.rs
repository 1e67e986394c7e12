//! Device facade bundling the backend, allocator and transfer queue.

use crate::backend::{Backend, DeviceProperties};
use crate::error::Result;
use crate::headless::{HeadlessBackend, HeadlessProfile};
use crate::memory::Allocator;
use crate::transfer::TransferQueue;
use crate::vulkan::VulkanBackendBuilder;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stratum_core::DeviceConfig;

struct DeviceShared {
    // Dropped first: draining the queue releases the loads' memory back to
    // the allocator.
    transfer: TransferQueue,
    allocator: Allocator,
    backend: Arc<dyn Backend>,
    config: DeviceConfig,
    frame_index: AtomicU64,
}

/// Shared handle to a device. Cheap to clone; every component takes one
/// explicitly.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Build a device on top of an existing backend.
    pub fn new(backend: Arc<dyn Backend>, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let allocator = Allocator::new(Arc::clone(&backend), &config.allocator)?;
        let transfer = TransferQueue::new(Arc::clone(&backend), config.frame_queue_depth)?;

        let properties = backend.properties();
        tracing::info!(
            "Device ready: {} ({}, {} frames in flight, {} transfer family)",
            properties.device_name,
            backend.name(),
            config.frame_queue_depth,
            if properties.has_dedicated_transfer() {
                "dedicated"
            } else {
                "shared"
            }
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                transfer,
                allocator,
                backend,
                config,
                frame_index: AtomicU64::new(0),
            }),
        })
    }

    /// A device on the CPU-simulated backend.
    pub fn headless(config: DeviceConfig) -> Result<Self> {
        let profile =
            HeadlessProfile::discrete().with_dedicated_transfer(config.dedicated_transfer_queue);
        Self::new(Arc::new(HeadlessBackend::new(&profile)), config)
    }

    /// A device on the first suitable Vulkan GPU.
    pub fn vulkan(config: DeviceConfig) -> Result<Self> {
        let backend = VulkanBackendBuilder::from_config(&config).build()?;
        Self::new(Arc::new(backend), config)
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    #[inline]
    pub fn allocator(&self) -> &Allocator {
        &self.shared.allocator
    }

    #[inline]
    pub fn transfer(&self) -> &TransferQueue {
        &self.shared.transfer
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn properties(&self) -> &DeviceProperties {
        self.shared.backend.properties()
    }

    /// Number of frames that may be in flight.
    #[inline]
    pub fn frame_queue_depth(&self) -> u32 {
        self.shared.config.frame_queue_depth
    }

    /// Index of the frame being built.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.shared.frame_index.load(Ordering::Acquire)
    }

    /// Move on to the next frame. Returns the new frame index.
    pub fn advance_frame(&self) -> u64 {
        self.shared.frame_index.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Flush this frame's uploads and advance the frame index.
    pub fn end_frame(&self) -> Result<u64> {
        self.flush()?;
        Ok(self.advance_frame())
    }

    /// Submit gathered uploads.
    pub fn flush(&self) -> Result<()> {
        self.shared.transfer.flush()
    }

    /// Wait for the most recent flush.
    pub fn wait(&self) -> Result<()> {
        self.shared.transfer.wait()
    }

    /// Wait for every flush in flight.
    pub fn wait_all(&self) -> Result<()> {
        self.shared.transfer.wait_all()
    }

    /// Flush, then block until the device has no work left.
    pub fn wait_idle(&self) -> Result<()> {
        self.flush()?;
        self.wait_all()?;
        self.shared.backend.wait_idle()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.shared.backend.name())
            .field("frame_index", &self.frame_index())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_advances_on_end_frame() {
        let device = Device::headless(DeviceConfig::default()).unwrap();
        assert_eq!(device.frame_index(), 0);
        assert_eq!(device.end_frame().unwrap(), 1);
        assert_eq!(device.advance_frame(), 2);
        assert_eq!(device.transfer().generation_count(), 4);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = DeviceConfig::default().with_frame_queue_depth(0);
        assert!(Device::headless(config).is_err());
    }

    #[test]
    fn shared_transfer_family() {
        let device =
            Device::headless(DeviceConfig::default().with_dedicated_transfer_queue(false)).unwrap();
        assert!(!device.properties().has_dedicated_transfer());
        device.wait_idle().unwrap();
    }
}
