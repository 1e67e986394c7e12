//! Texel formats and surface size math.

use serde::{Deserialize, Serialize};

/// Texel format of an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    #[default]
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    R16Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    D32Float,
    Bc1RgbaUnorm,
    Bc3RgbaUnorm,
    Bc7Unorm,
}

impl Format {
    /// Block dimensions in texels (1x1 for uncompressed formats).
    #[inline]
    pub const fn block_extent(self) -> (u32, u32) {
        if self.is_compressed() {
            (4, 4)
        } else {
            (1, 1)
        }
    }

    /// Bytes per block (per texel for uncompressed formats).
    pub const fn block_size(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float => 2,
            Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::R32Float
            | Self::D32Float => 4,
            Self::Rgba16Float | Self::Bc1RgbaUnorm => 8,
            Self::Rgba32Float | Self::Bc3RgbaUnorm | Self::Bc7Unorm => 16,
        }
    }

    /// Whether this is a block-compressed format.
    #[inline]
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Bc1RgbaUnorm | Self::Bc3RgbaUnorm | Self::Bc7Unorm)
    }

    /// Whether this is a depth format.
    #[inline]
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D32Float)
    }

    /// Number of block rows and bytes per row for a surface of the given size.
    pub const fn pitch(self, width: u32, height: u32) -> (u32, u64) {
        let (bw, bh) = self.block_extent();
        let blocks_wide = width.div_ceil(bw);
        let blocks_high = height.div_ceil(bh);
        (blocks_high, blocks_wide as u64 * self.block_size() as u64)
    }

    /// Size in bytes of one tightly packed surface.
    pub const fn surface_size(self, width: u32, height: u32) -> u64 {
        let (rows, row_bytes) = self.pitch(width, height);
        rows as u64 * row_bytes
    }
}

/// Extent of a mip level, never smaller than one texel.
#[inline]
pub const fn mip_extent(extent: u32, level: u32) -> u32 {
    let shifted = extent >> level;
    if shifted == 0 {
        1
    } else {
        shifted
    }
}

/// Number of mip levels in a full chain for the given size.
#[inline]
pub const fn full_mip_count(width: u32, height: u32) -> u32 {
    let largest = if width > height { width } else { height };
    u32::BITS - largest.leading_zeros()
}
