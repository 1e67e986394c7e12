//! Core types, formats and configuration for the Stratum GPU resource layer.
//!
//! This crate provides the backend-independent vocabulary shared by the
//! device layer:
//! - Resource types, usage hints, memory pools and lock modes
//! - Texel formats and surface size math
//! - Device, allocator and constant-buffer configuration
//! - Alignment helpers and common error types

pub mod config;
pub mod error;
pub mod format;
pub mod math;
pub mod types;

pub use config::{AllocatorConfig, ConstantBufferConfig, DeviceConfig};
pub use error::{Error, Result};
pub use format::Format;
pub use types::{LockMode, Pool, ResourceType, Usage};

/// Engine-wide constants
pub mod constants {
    /// Number of frames that may be in flight by default.
    pub const DEFAULT_FRAME_QUEUE_DEPTH: u32 = 3;
    /// Default size of a pooled memory block.
    pub const DEFAULT_BLOCK_SIZE: u64 = 2 * 1024 * 1024;
    /// Pooled memory block size on memory-constrained targets.
    pub const CONSTRAINED_BLOCK_SIZE: u64 = 1024 * 1024;
    /// Default per-frame constant buffer budget.
    pub const DEFAULT_CONSTANT_BUFFER_SIZE: u64 = 4 * 1024 * 1024;
    /// Default chunk size claimed by a recording thread from the constant buffer.
    pub const DEFAULT_LOCAL_BLOCK_SIZE: u64 = 64 * 1024;
    /// Timeout used for GPU fence waits, effectively "until done".
    pub const FENCE_TIMEOUT_NS: u64 = u64::MAX;
}
