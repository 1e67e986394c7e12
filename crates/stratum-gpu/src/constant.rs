//! Per-frame ring allocator for small uniform blocks.
//!
//! Each frame slot is one mapped uniform buffer with a shared cursor.
//! Recording threads claim `local_block_size` chunks from the cursor under a
//! short lock and then bump-allocate from their own chunk through a
//! [`ConstantContext`] without locking.

use crate::backend::{BufferId, BufferInfo, BufferUsage};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::AllocationPolicy;
use crate::native::GpuBuffer;
use parking_lot::Mutex;
use std::sync::Arc;
use stratum_core::math::align_up;
use stratum_core::{ConstantBufferConfig, ResourceType};

/// A recording thread's cached chunk.
///
/// Create one per worker with [`ConstantBuffer::context`]. It invalidates
/// itself when the frame counter moves on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantContext {
    local_offset: u64,
    local_available: u64,
    local_frame: u64,
}

impl Default for ConstantContext {
    fn default() -> Self {
        Self {
            local_offset: 0,
            local_available: 0,
            local_frame: u64::MAX,
        }
    }
}

/// A uniform block handed out for one draw.
pub struct ConstantAllocation<'a> {
    pub buffer: BufferId,
    pub offset: u64,
    pub size: u64,
    pub data: &'a mut [u8],
}

impl ConstantAllocation<'_> {
    /// Copy a value into the start of the block.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) -> Result<()> {
        let bytes = bytemuck::bytes_of(value);
        let dst = self.data.get_mut(..bytes.len()).ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "{} byte value does not fit a {} byte constant block",
                bytes.len(),
                self.size
            ))
        })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

/// Ring of per-frame uniform buffers.
pub struct ConstantBuffer {
    buffers: Vec<Arc<GpuBuffer>>,
    cursors: Vec<Mutex<u64>>,
    frame: u64,
    alignment: u64,
    max_size: u64,
    local_block_size: u64,
}

impl ConstantBuffer {
    /// One buffer of `max_size` bytes per frame in flight.
    pub fn new(device: &Device, config: &ConstantBufferConfig) -> Result<Self> {
        config.validate()?;
        let alignment = device.properties().min_uniform_buffer_alignment.max(1);
        let count = device.frame_queue_depth() as usize;
        let mut buffers = Vec::with_capacity(count);
        for i in 0..count {
            buffers.push(GpuBuffer::new(
                device.allocator(),
                &format!("constants[{i}]"),
                ResourceType::Uniform,
                BufferInfo {
                    size: config.max_size,
                    usage: BufferUsage::UNIFORM,
                    concurrent: true,
                },
                AllocationPolicy::cpu_to_gpu(),
            )?);
        }
        Ok(Self {
            buffers,
            cursors: (0..count).map(|_| Mutex::new(0)).collect(),
            frame: 0,
            alignment,
            max_size: config.max_size,
            local_block_size: align_up(config.local_block_size, alignment),
        })
    }

    /// A fresh per-thread context.
    #[inline]
    pub fn context(&self) -> ConstantContext {
        ConstantContext::default()
    }

    /// Frames reset so far.
    #[inline]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    fn slot(&self) -> usize {
        (self.frame % self.buffers.len() as u64) as usize
    }

    /// Buffer serving the current frame.
    pub fn buffer(&self) -> BufferId {
        self.buffers[self.slot()].id()
    }

    /// Bytes claimed from the current frame's buffer.
    pub fn used(&self) -> u64 {
        *self.cursors[self.slot()].lock()
    }

    /// Hand out `size` bytes, rounded up to the uniform alignment.
    pub fn allocate<'a>(&'a self, ctx: &mut ConstantContext, size: u64) -> Result<ConstantAllocation<'a>> {
        let size = align_up(size.max(1), self.alignment);
        if size > self.local_block_size {
            tracing::error!(
                "Constant block of {size} bytes exceeds the {} byte local block",
                self.local_block_size
            );
            return Err(GpuError::CapacityExceeded(format!(
                "constant block of {size} bytes exceeds the {} byte local block",
                self.local_block_size
            )));
        }

        if ctx.local_frame != self.frame || ctx.local_available < size {
            self.allocate_slow(ctx, size)?;
        }
        let offset = ctx.local_offset;
        ctx.local_offset += size;
        ctx.local_available -= size;

        let buffer = &self.buffers[self.slot()];
        let ptr = buffer
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("constant buffer is not mapped".to_string()))?;
        // SAFETY: [offset, offset + size) lies inside the mapping and was
        // claimed by exactly one context this frame.
        let data = unsafe { std::slice::from_raw_parts_mut(ptr.add(offset as usize), size as usize) };
        Ok(ConstantAllocation {
            buffer: buffer.id(),
            offset,
            size,
            data,
        })
    }

    /// Claim a new chunk for `ctx`, extending its current one when the shared
    /// cursor has not moved since.
    fn allocate_slow(&self, ctx: &mut ConstantContext, size: u64) -> Result<()> {
        let mut cursor = self.cursors[self.slot()].lock();
        let contiguous = ctx.local_frame == self.frame && ctx.local_offset + ctx.local_available == *cursor;
        let start = if contiguous { ctx.local_offset } else { *cursor };
        let end = *cursor + self.local_block_size;
        if end > self.max_size || end - start < size {
            drop(cursor);
            tracing::error!(
                "Constant buffer overflow: frame {} needs more than {} bytes",
                self.frame,
                self.max_size
            );
            return Err(GpuError::CapacityExceeded(format!(
                "constant buffer overflow ({} bytes per frame)",
                self.max_size
            )));
        }
        *cursor = end;
        ctx.local_offset = start;
        ctx.local_available = end - start;
        ctx.local_frame = self.frame;
        Ok(())
    }

    /// Start the next frame: rewind the next slot's cursor and bump the
    /// frame counter, invalidating every context.
    ///
    /// The caller waits for the frame that last used the slot before this.
    pub fn reset(&mut self) {
        self.frame += 1;
        let slot = self.slot();
        *self.cursors[slot].get_mut() = 0;
    }
}
