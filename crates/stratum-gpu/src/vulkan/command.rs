//! Command pools and translation of recorded commands into Vulkan calls.

use crate::backend::{
    Access, Barrier, BarrierTarget, BufferImageCopy, Command, ImageCopy, ImageLayout, Ownership,
};
use crate::error::Result;
use ash::vk;
use ash::vk::Handle;
use stratum_core::Format;

/// A command pool owning exactly one primary command buffer.
///
/// Resetting the pool is the cheapest way to reset its buffer.
pub struct CommandPool {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl CommandPool {
    /// Create a pool for `queue_family` and allocate its command buffer.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self {
            pool,
            command_buffer,
        })
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Reset the pool and begin a one-time-submit recording.
    ///
    /// # Safety
    /// The device must be valid and the command buffer must not be pending.
    pub unsafe fn begin(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.command_buffer, &begin_info)?;
        }
        Ok(())
    }

    /// Destroy the pool together with its command buffer.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

pub fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::Bc1RgbaUnorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Format::Bc3RgbaUnorm => vk::Format::BC3_UNORM_BLOCK,
        Format::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
    }
}

pub const fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub const fn vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    }
}

/// Stage and access masks for one side of a barrier.
pub fn scope(access: Access) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match access {
        Access::None => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        Access::TransferRead => (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_READ),
        Access::TransferWrite => (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE),
        Access::ShaderRead => (
            vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER
                | vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_READ,
        ),
        Access::HostRead => (vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ),
        Access::All => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}

const fn queue_families(ownership: Ownership) -> (u32, u32) {
    match ownership {
        Ownership::Keep => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
        Ownership::Release { from, to } | Ownership::Acquire { from, to } => (from, to),
    }
}

fn subresource_layers(format: Format, mip_level: u32, array_layer: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(aspect(format))
        .mip_level(mip_level)
        .base_array_layer(array_layer)
        .layer_count(1)
}

fn buffer_image_copies(format: Format, regions: &[BufferImageCopy]) -> Vec<vk::BufferImageCopy> {
    regions
        .iter()
        .map(|r| {
            vk::BufferImageCopy::default()
                .buffer_offset(r.buffer_offset)
                .image_subresource(subresource_layers(format, r.mip_level, r.array_layer))
                .image_offset(vk::Offset3D {
                    x: r.x as i32,
                    y: r.y as i32,
                    z: 0,
                })
                .image_extent(vk::Extent3D {
                    width: r.width,
                    height: r.height,
                    depth: 1,
                })
        })
        .collect()
}

fn image_copies(format: Format, regions: &[ImageCopy]) -> Vec<vk::ImageCopy> {
    regions
        .iter()
        .map(|r| {
            vk::ImageCopy::default()
                .src_subresource(subresource_layers(format, r.src_mip_level, r.src_array_layer))
                .dst_subresource(subresource_layers(format, r.dst_mip_level, r.dst_array_layer))
                .extent(vk::Extent3D {
                    width: r.width,
                    height: r.height,
                    depth: 1,
                })
        })
        .collect()
}

/// Record a pipeline barrier with synchronization2.
///
/// # Safety
/// The device, command buffer and every barrier target must be valid.
unsafe fn record_barriers(device: &ash::Device, cmd: vk::CommandBuffer, barriers: &[Barrier]) {
    let mut buffer_barriers = Vec::new();
    let mut image_barriers = Vec::new();

    for barrier in barriers {
        let (src_stage, src_access) = scope(barrier.src);
        let (dst_stage, dst_access) = scope(barrier.dst);
        let (src_family, dst_family) = queue_families(barrier.ownership);
        match barrier.target {
            BarrierTarget::Buffer {
                buffer,
                offset,
                size,
            } => buffer_barriers.push(
                vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .buffer(vk::Buffer::from_raw(buffer.0))
                    .offset(offset)
                    .size(size),
            ),
            BarrierTarget::Image {
                image,
                format,
                old_layout,
                new_layout,
                mip_levels,
                array_layers,
            } => image_barriers.push(
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .old_layout(vk_layout(old_layout))
                    .new_layout(vk_layout(new_layout))
                    .image(vk::Image::from_raw(image.0))
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(aspect(format))
                            .base_mip_level(0)
                            .level_count(mip_levels)
                            .base_array_layer(0)
                            .layer_count(array_layers),
                    ),
            ),
        }
    }

    let dependency_info = vk::DependencyInfo::default()
        .buffer_memory_barriers(&buffer_barriers)
        .image_memory_barriers(&image_barriers);
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

/// Record one command.
///
/// # Safety
/// The device and command buffer must be valid and recording; every object
/// the command names must be alive.
pub unsafe fn record_command(device: &ash::Device, cmd: vk::CommandBuffer, command: &Command) {
    match command {
        Command::CopyBuffer { src, dst, regions } => {
            let regions: Vec<vk::BufferCopy> = regions
                .iter()
                .map(|r| {
                    vk::BufferCopy::default()
                        .src_offset(r.src_offset)
                        .dst_offset(r.dst_offset)
                        .size(r.size)
                })
                .collect();
            unsafe {
                device.cmd_copy_buffer(
                    cmd,
                    vk::Buffer::from_raw(src.0),
                    vk::Buffer::from_raw(dst.0),
                    &regions,
                );
            }
        }
        Command::CopyBufferToImage {
            src,
            dst,
            format,
            regions,
        } => unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                vk::Buffer::from_raw(src.0),
                vk::Image::from_raw(dst.0),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &buffer_image_copies(*format, regions),
            );
        },
        Command::CopyImage {
            src,
            dst,
            format,
            regions,
        } => unsafe {
            device.cmd_copy_image(
                cmd,
                vk::Image::from_raw(src.0),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::Image::from_raw(dst.0),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &image_copies(*format, regions),
            );
        },
        Command::CopyImageToBuffer {
            src,
            dst,
            format,
            regions,
        } => unsafe {
            device.cmd_copy_image_to_buffer(
                cmd,
                vk::Image::from_raw(src.0),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::Buffer::from_raw(dst.0),
                &buffer_image_copies(*format, regions),
            );
        },
        Command::Barrier(barriers) => unsafe { record_barriers(device, cmd, barriers) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_maps_to_queue_families() {
        assert_eq!(
            queue_families(Ownership::Keep),
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        );
        assert_eq!(queue_families(Ownership::Release { from: 1, to: 0 }), (1, 0));
        assert_eq!(queue_families(Ownership::Acquire { from: 1, to: 0 }), (1, 0));
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(aspect(Format::D32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
        assert_eq!(vk_format(Format::Bc7Unorm), vk::Format::BC7_UNORM_BLOCK);
    }

    #[test]
    fn release_side_waits_on_nothing_downstream() {
        let (stage, access) = scope(Access::None);
        assert_eq!(stage, vk::PipelineStageFlags2::NONE);
        assert_eq!(access, vk::AccessFlags2::NONE);
    }
}
