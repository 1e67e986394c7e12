//! Headless device fixtures and comparison helpers.
//!
//! A [`TestDevice`] pairs a [`Device`] with the [`HeadlessBackend`] it runs
//! on, so tests can read device memory back and inspect the ownership and
//! lifetime violations the simulation records.

use image::{ImageBuffer, Rgba};
use std::sync::Arc;

use stratum_core::{DeviceConfig, ResourceType};
use stratum_gpu::backend::{BufferInfo, BufferUsage};
use stratum_gpu::{AllocationPolicy, Device, GpuBuffer, GpuError, GpuImage, HeadlessBackend, HeadlessProfile};

use crate::{Result, TestError};

/// A device on the headless backend.
pub struct TestDevice {
    device: Device,
    backend: Arc<HeadlessBackend>,
}

impl TestDevice {
    /// A discrete GPU with a dedicated transfer family and default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(DeviceConfig::new("stratum-test"))
    }

    /// A discrete GPU with the given settings.
    pub fn with_config(config: DeviceConfig) -> Result<Self> {
        let profile =
            HeadlessProfile::discrete().with_dedicated_transfer(config.dedicated_transfer_queue);
        Self::with_profile(&profile, config)
    }

    /// A simulated device of the given shape.
    pub fn with_profile(profile: &HeadlessProfile, config: DeviceConfig) -> Result<Self> {
        let backend = Arc::new(HeadlessBackend::new(profile));
        let device = Device::new(backend.clone(), config)?;
        Ok(Self { device, backend })
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn backend(&self) -> &HeadlessBackend {
        &self.backend
    }

    /// Fail if the simulation recorded any violation since the last check.
    pub fn check_violations(&self) -> Result<()> {
        let violations = self.backend.take_violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(TestError::Violations(violations))
        }
    }

    /// Device contents of a buffer.
    pub fn buffer_contents(&self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        self.backend.read_buffer(buffer.id()).ok_or_else(|| {
            GpuError::InvalidState(format!("buffer {:?} has no bound memory", buffer.id())).into()
        })
    }

    /// Device contents of an image, tightly packed.
    pub fn image_contents(&self, image: &GpuImage) -> Result<Vec<u8>> {
        self.backend.read_image(image.id()).ok_or_else(|| {
            GpuError::InvalidState(format!("image {:?} has no bound memory", image.id())).into()
        })
    }

    /// A mapped staging buffer holding `data`.
    pub fn staging(&self, name: &str, data: &[u8]) -> Result<Arc<GpuBuffer>> {
        let buffer = GpuBuffer::new(
            self.device.allocator(),
            name,
            ResourceType::Staging,
            BufferInfo {
                size: data.len() as u64,
                usage: BufferUsage::TRANSFER_SRC,
                concurrent: true,
            },
            AllocationPolicy::cpu_to_gpu(),
        )?;
        buffer.write_bytes(0, data)?;
        Ok(buffer)
    }

    /// An empty device-local buffer that can be copied into.
    pub fn destination(&self, name: &str, size: u64) -> Result<Arc<GpuBuffer>> {
        Ok(GpuBuffer::new(
            self.device.allocator(),
            name,
            ResourceType::Structured,
            BufferInfo {
                size,
                usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                concurrent: false,
            },
            AllocationPolicy::gpu_only(),
        )?)
    }
}

/// Deterministic byte pattern that differs per `seed`.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Compare two images and return the normalized difference (0.0-1.0).
pub fn compare_images(
    a: &ImageBuffer<Rgba<u8>, Vec<u8>>,
    b: &ImageBuffer<Rgba<u8>, Vec<u8>>,
) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            pa.0.iter()
                .zip(pb.0.iter())
                .map(|(&x, &y)| u64::from(x.abs_diff(y)))
                .sum::<u64>()
        })
        .sum();

    let max_diff = (u64::from(a.width()) * u64::from(a.height()) * 4 * 255) as f64;
    Ok(total_diff as f64 / max_diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_is_clean() {
        let test = TestDevice::new().unwrap();
        assert_eq!(test.device().frame_index(), 0);
        assert!(test.device().properties().has_dedicated_transfer());
        test.check_violations().unwrap();
    }

    #[test]
    fn patterns_differ_by_seed() {
        assert_eq!(pattern(4, 0), vec![0, 31, 62, 93]);
        assert_ne!(pattern(16, 1), pattern(16, 2));
    }

    #[test]
    fn image_difference_is_normalized() {
        let black = ImageBuffer::from_pixel(2, 2, Rgba([0, 0, 0, 0]));
        let white = ImageBuffer::from_pixel(2, 2, Rgba([255, 255, 255, 255]));
        assert!((compare_images(&black, &white).unwrap() - 1.0).abs() < f64::EPSILON);
        assert_eq!(compare_images(&white, &white).unwrap(), 0.0);
        let small = ImageBuffer::from_pixel(1, 1, Rgba([0, 0, 0, 0]));
        assert!(matches!(
            compare_images(&black, &small),
            Err(TestError::ImageComparison(_))
        ));
    }
}
