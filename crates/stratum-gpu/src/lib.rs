//! GPU resource layer of the Stratum engine.
//!
//! This crate provides:
//! - Block sub-allocation of device memory with usage statistics
//! - Multi-buffered buffers and textures with lock/unlock CPU access
//! - A per-frame constant buffer ring for uniform blocks
//! - A transfer queue batching uploads into fenced generations
//! - A Vulkan backend and a headless backend for tests and tooling

pub mod backend;
pub mod constant;
pub mod device;
pub mod error;
pub mod headless;
pub mod memory;
pub mod native;
pub mod resource;
pub mod transfer;
pub mod vulkan;

pub use backend::{Backend, DeviceProperties, QueueKind};
pub use constant::{ConstantAllocation, ConstantBuffer, ConstantContext};
pub use device::Device;
pub use error::{GpuError, Result};
pub use headless::{HeadlessBackend, HeadlessProfile};
pub use memory::{
    AllocationInfo, AllocationKind, AllocationPolicy, AllocationStrategy, Allocator, Handle,
    MemoryLocation, Stats, Tally, VramUsage,
};
pub use native::{GpuBuffer, GpuImage};
pub use resource::{Buffer, BufferDesc, Readback, Texture, TextureDesc};
pub use transfer::{GenerationState, Load, TransferQueue, UploadPath};
pub use vulkan::{GpuCapabilities, GpuVendor, VulkanBackend, VulkanBackendBuilder};
