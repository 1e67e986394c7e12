//! Buffers and textures with multi-buffered device and host copies.
//!
//! A resource owns `remote_count` device-resident copies and `host_count`
//! persistently mapped staging copies. CPU writes go through
//! [`lock`](Buffer::lock)/[`unlock`](Buffer::unlock): the lock hands out the
//! staging slot of the current frame, the unlock enqueues a
//! [`Load`](crate::transfer::Load) copying it to the current remote.

mod buffer;
mod texture;

pub use buffer::{Buffer, BufferDesc};
pub use texture::{Readback, Texture, TextureDesc};

use crate::backend::{BufferInfo, BufferUsage};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::AllocationPolicy;
use crate::native::GpuBuffer;
use std::sync::Arc;
use stratum_core::{LockMode, Pool, ResourceType, Usage};

/// Device copies a resource needs.
pub(crate) const fn remote_count(usage: Usage, frame_queue_depth: u32) -> usize {
    if usage.contains(Usage::PER_FRAME) {
        frame_queue_depth as usize
    } else {
        1
    }
}

/// Host staging copies a resource needs.
pub(crate) const fn host_count(usage: Usage, pool: Pool, frame_queue_depth: u32) -> usize {
    if usage.contains(Usage::DYNAMIC) {
        frame_queue_depth as usize
    } else if usage.needs_host_copy() || matches!(pool, Pool::SystemMem) {
        1
    } else {
        0
    }
}

/// An outstanding lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LockState {
    pub slot: usize,
    pub offset: u64,
    pub size: u64,
    pub mode: LockMode,
}

/// The staging slots of a resource and the lock bookkeeping over them.
pub(crate) struct HostCopies {
    slots: Vec<Arc<GpuBuffer>>,
    /// Serial of the last upload read from each slot.
    serials: Vec<u64>,
    /// Slot holding the newest contents. `None` while all slots agree.
    last_written: Option<usize>,
    locked: Option<LockState>,
}

impl HostCopies {
    pub fn new(device: &Device, name: &str, ty: ResourceType, size: u64, count: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(GpuBuffer::new(
                device.allocator(),
                &format!("{name} (host {i})"),
                ty,
                BufferInfo {
                    size,
                    usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                    concurrent: true,
                },
                AllocationPolicy::cpu_to_gpu(),
            )?);
        }
        Ok(Self {
            serials: vec![0; count],
            slots,
            last_written: None,
            locked: None,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub const fn is_locked(&self) -> bool {
        self.locked.is_some()
    }

    pub fn slot(&self, index: usize) -> &Arc<GpuBuffer> {
        &self.slots[index]
    }

    /// Copy `data` into every slot.
    pub fn fill(&mut self, data: &[u8]) -> Result<()> {
        for slot in &self.slots {
            slot.write_bytes(0, data)?;
        }
        self.last_written = None;
        Ok(())
    }

    /// Hand out `size` bytes at `offset` of the current frame's slot.
    ///
    /// A `size` of 0 locks everything from `offset` to the end.
    pub fn lock(
        &mut self,
        device: &Device,
        name: &str,
        offset: u64,
        size: u64,
        mode: LockMode,
    ) -> Result<&mut [u8]> {
        if self.slots.is_empty() {
            return Err(GpuError::InvalidState(format!("'{name}' has no host copy to lock")));
        }
        if mode == LockMode::Discard && self.slots.len() <= 1 {
            return Err(GpuError::InvalidState(format!(
                "'{name}' is single-buffered and cannot be locked with DISCARD"
            )));
        }
        if let Some(locked) = self.locked {
            return Err(GpuError::InvalidState(format!(
                "'{name}' is already locked (slot {})",
                locked.slot
            )));
        }

        let total = self.slots[0].size();
        let size = if size == 0 { total.saturating_sub(offset) } else { size };
        if size == 0 || offset.checked_add(size).map_or(true, |end| end > total) {
            return Err(GpuError::InvalidArgument(format!(
                "lock of {size} bytes at {offset} is outside '{name}' ({total} bytes)"
            )));
        }

        let current = (device.frame_index() % self.slots.len() as u64) as usize;
        let slot = match mode {
            LockMode::ReadOnly => self.last_written.unwrap_or(current),
            LockMode::Write | LockMode::Discard => {
                device.transfer().wait_serial(self.serials[current])?;
                if mode == LockMode::Write {
                    self.preserve(current)?;
                }
                current
            }
        };

        self.locked = Some(LockState {
            slot,
            offset,
            size,
            mode,
        });
        // SAFETY: `locked` stops a second lock from aliasing the slot and the
        // slot's last upload has been waited on.
        let bytes = unsafe { self.slots[slot].mapped_slice_mut()? };
        Ok(&mut bytes[offset as usize..(offset + size) as usize])
    }

    /// Carry the newest contents into `slot`.
    fn preserve(&mut self, slot: usize) -> Result<()> {
        let Some(source) = self.last_written else {
            return Ok(());
        };
        if source == slot {
            return Ok(());
        }
        let contents = self.slots[source].read_bytes(0, self.slots[source].size())?;
        self.slots[slot].write_bytes(0, &contents)
    }

    /// End the outstanding lock. Returns it unless nothing needs uploading.
    pub fn unlock(&mut self, name: &str) -> Result<Option<LockState>> {
        let locked = self
            .locked
            .take()
            .ok_or_else(|| GpuError::InvalidState(format!("'{name}' is not locked")))?;
        if locked.mode == LockMode::ReadOnly {
            return Ok(None);
        }
        self.slots[locked.slot].flush(locked.offset, locked.size)?;
        self.last_written = Some(locked.slot);
        Ok(Some(locked))
    }

    /// Remember the flush that reads `slot`.
    pub fn record_upload(&mut self, slot: usize, serial: u64) {
        self.serials[slot] = serial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_counts_follow_usage() {
        assert_eq!(remote_count(Usage::empty(), 3), 1);
        assert_eq!(remote_count(Usage::PER_FRAME, 3), 3);
        assert_eq!(host_count(Usage::empty(), Pool::Default, 3), 0);
        assert_eq!(host_count(Usage::DYNAMIC, Pool::Default, 3), 3);
        assert_eq!(host_count(Usage::ATOMIC_COUNTER, Pool::Default, 3), 1);
        assert_eq!(host_count(Usage::empty(), Pool::SystemMem, 2), 1);
        assert_eq!(host_count(Usage::DYNAMIC | Usage::ATOMIC_COUNTER, Pool::Default, 2), 2);
    }
}
