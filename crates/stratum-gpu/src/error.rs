//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed. Recoverable: the caller may retry with
    /// relaxed constraints.
    #[error("Memory allocation failed for '{name}' ({size} bytes): {reason}")]
    AllocationFailed {
        name: String,
        size: u64,
        reason: String,
    },

    /// A fixed budget was exceeded (constant buffer overflow, oversized
    /// per-draw block).
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A fence wait timed out.
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// The device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// Error from the core crate.
    #[error(transparent)]
    Core(#[from] stratum_core::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the error indicates a broken invariant rather than a
    /// transient condition.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded(_) | Self::InvalidState(_) | Self::DeviceLost
        )
    }

    pub(crate) fn allocation(name: &str, size: u64, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            name: name.to_string(),
            size,
            reason: reason.into(),
        }
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::TIMEOUT => Self::Timeout,
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_results_map_to_specific_variants() {
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::Vulkan(_)
        ));
    }

    #[test]
    fn fatal_classification() {
        assert!(GpuError::CapacityExceeded("overflow".into()).is_fatal());
        assert!(!GpuError::allocation("mesh", 16, "out of memory").is_fatal());
    }
}
