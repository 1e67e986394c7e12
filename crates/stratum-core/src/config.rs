//! Device, allocator and constant-buffer configuration.

use crate::constants::{
    CONSTRAINED_BLOCK_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_CONSTANT_BUFFER_SIZE,
    DEFAULT_FRAME_QUEUE_DEPTH, DEFAULT_LOCAL_BLOCK_SIZE,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Memory allocator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Size of a pooled memory block.
    pub block_size: u64,
    /// Allocations larger than this get a dedicated block.
    ///
    /// `None` means half a block.
    pub dedicated_threshold: Option<u64>,
    /// Memory-constrained target (mobile); forces the smaller block size.
    pub memory_constrained: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            dedicated_threshold: None,
            memory_constrained: false,
        }
    }
}

impl AllocatorConfig {
    /// Preset for memory-constrained targets.
    pub fn memory_constrained() -> Self {
        Self {
            block_size: CONSTRAINED_BLOCK_SIZE,
            memory_constrained: true,
            ..Default::default()
        }
    }

    /// Set the pooled block size.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the dedicated allocation threshold.
    pub fn with_dedicated_threshold(mut self, threshold: u64) -> Self {
        self.dedicated_threshold = Some(threshold);
        self
    }

    /// Block size actually used by the allocator.
    pub fn effective_block_size(&self) -> u64 {
        if self.memory_constrained {
            self.block_size.min(CONSTRAINED_BLOCK_SIZE)
        } else {
            self.block_size
        }
    }

    /// Size above which an allocation bypasses pooling.
    pub fn effective_dedicated_threshold(&self) -> u64 {
        let block_size = self.effective_block_size();
        self.dedicated_threshold
            .unwrap_or(block_size / 2)
            .min(block_size)
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "block_size must be a non-zero power of two, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

/// Constant buffer ring sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantBufferConfig {
    /// Bytes available per frame slot.
    pub max_size: u64,
    /// Chunk size a recording thread claims from the shared cursor.
    pub local_block_size: u64,
}

impl Default for ConstantBufferConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CONSTANT_BUFFER_SIZE,
            local_block_size: DEFAULT_LOCAL_BLOCK_SIZE,
        }
    }
}

impl ConstantBufferConfig {
    /// Create a config with the given per-frame budget and chunk size.
    pub fn new(max_size: u64, local_block_size: u64) -> Self {
        Self {
            max_size,
            local_block_size,
        }
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 || self.local_block_size == 0 {
            return Err(Error::InvalidConfig(
                "constant buffer sizes must be non-zero".to_string(),
            ));
        }
        if self.local_block_size > self.max_size {
            return Err(Error::InvalidConfig(format!(
                "local_block_size ({}) exceeds max_size ({})",
                self.local_block_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable validation layers (default: debug builds only).
    pub validation: bool,
    /// Number of frames that may be in flight at once.
    pub frame_queue_depth: u32,
    /// Memory allocator tuning.
    pub allocator: AllocatorConfig,
    /// Headless backend only: expose a separate transfer queue family.
    pub dedicated_transfer_queue: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "Stratum".to_string(),
            validation: cfg!(debug_assertions),
            frame_queue_depth: DEFAULT_FRAME_QUEUE_DEPTH,
            allocator: AllocatorConfig::default(),
            dedicated_transfer_queue: true,
        }
    }
}

impl DeviceConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the frame queue depth.
    pub fn with_frame_queue_depth(mut self, depth: u32) -> Self {
        self.frame_queue_depth = depth;
        self
    }

    /// Set the allocator configuration.
    pub fn with_allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    /// Expose a separate transfer queue family (headless backend).
    pub fn with_dedicated_transfer_queue(mut self, dedicated: bool) -> Self {
        self.dedicated_transfer_queue = dedicated;
        self
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.frame_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "frame_queue_depth must be at least 1".to_string(),
            ));
        }
        self.allocator.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(DeviceConfig::default().validate().is_ok());
        assert!(ConstantBufferConfig::default().validate().is_ok());
        assert_eq!(DeviceConfig::default().frame_queue_depth, 3);
    }

    #[test]
    fn rejects_zero_depth() {
        let config = DeviceConfig::default().with_frame_queue_depth(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_blocks() {
        let config = AllocatorConfig::default().with_block_size(3 * 1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn constrained_preset_uses_small_blocks() {
        let config = AllocatorConfig::memory_constrained().with_block_size(8 * 1024 * 1024);
        assert_eq!(config.effective_block_size(), CONSTRAINED_BLOCK_SIZE);
        assert_eq!(
            AllocatorConfig::default().effective_dedicated_threshold(),
            DEFAULT_BLOCK_SIZE / 2
        );
    }

    #[test]
    fn local_block_must_fit_budget() {
        assert!(ConstantBufferConfig::new(1024, 4096).validate().is_err());
        assert!(ConstantBufferConfig::new(64 * 1024, 64 * 1024).validate().is_ok());
    }
}
