//! Resource classification types.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// What a GPU allocation is used for.
///
/// Used to bucket allocator statistics; it does not affect placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    RenderTarget,
    Texture,
    Index,
    Vertex,
    Uniform,
    Staging,
    Structured,
    Texel,
    ByteAddress,
}

impl ResourceType {
    /// Every resource type, in statistics order.
    pub const ALL: [Self; 9] = [
        Self::RenderTarget,
        Self::Texture,
        Self::Index,
        Self::Vertex,
        Self::Uniform,
        Self::Staging,
        Self::Structured,
        Self::Texel,
        Self::ByteAddress,
    ];

    /// Number of resource types.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index for per-type tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name used in reports.
    pub const fn name(self) -> &'static str {
        match self {
            Self::RenderTarget => "RenderTarget",
            Self::Texture => "Texture",
            Self::Index => "Index",
            Self::Vertex => "Vertex",
            Self::Uniform => "Uniform",
            Self::Staging => "Staging",
            Self::Structured => "Structured",
            Self::Texel => "Texel",
            Self::ByteAddress => "ByteAddress",
        }
    }
}

bitflags! {
    /// Usage hints that decide how many copies of a resource exist.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Usage: u32 {
        /// The CPU rewrites the contents every frame.
        ///
        /// Gets one staging copy per frame in flight and uploads on the
        /// graphics queue.
        const DYNAMIC = 1 << 0;
        /// Used as an atomic counter; needs a CPU-writable shadow copy.
        const ATOMIC_COUNTER = 1 << 1;
        /// Written fresh every frame while earlier frames may still read it.
        ///
        /// Gets one device-resident copy per frame in flight.
        const PER_FRAME = 1 << 2;
    }
}

impl Usage {
    /// Whether the usage implies CPU-side writes.
    #[inline]
    pub const fn needs_host_copy(self) -> bool {
        self.intersects(Self::DYNAMIC.union(Self::ATOMIC_COUNTER))
    }
}

/// Memory pool a resource is placed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pool {
    /// Device-resident memory.
    #[default]
    Default,
    /// Device-resident memory with a driver-managed shadow.
    Managed,
    /// System memory visible to the CPU.
    SystemMem,
}

/// How a resource is locked for CPU access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Write access; previous contents are preserved.
    #[default]
    Write,
    /// Write access to a fresh slot; previous contents are not preserved.
    Discard,
    /// Read access; unlocking uploads nothing.
    ReadOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_indices_are_dense() {
        for (i, ty) in ResourceType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
        assert_eq!(ResourceType::COUNT, 9);
    }

    #[test]
    fn host_copy_requirements() {
        assert!(Usage::DYNAMIC.needs_host_copy());
        assert!(Usage::ATOMIC_COUNTER.needs_host_copy());
        assert!(!Usage::PER_FRAME.needs_host_copy());
        assert!(!Usage::empty().needs_host_copy());
    }
}
