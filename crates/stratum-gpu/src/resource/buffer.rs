//! Logical buffers.

use super::{host_count, remote_count, HostCopies};
use crate::backend::{BufferCopy, BufferInfo, BufferUsage};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::AllocationPolicy;
use crate::native::GpuBuffer;
use crate::transfer::{Load, UploadPath};
use std::sync::Arc;
use stratum_core::{LockMode, Pool, ResourceType, Usage};

/// Description of a logical buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub ty: ResourceType,
    pub usage: Usage,
    pub pool: Pool,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, ty: ResourceType, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            ty,
            usage: Usage::empty(),
            pool: Pool::Default,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = pool;
        self
    }
}

fn native_usage(ty: ResourceType) -> BufferUsage {
    let usage = match ty {
        ResourceType::Index => BufferUsage::INDEX,
        ResourceType::Vertex => BufferUsage::VERTEX,
        ResourceType::Uniform => BufferUsage::UNIFORM,
        ResourceType::Texel => BufferUsage::UNIFORM_TEXEL | BufferUsage::STORAGE_TEXEL,
        ResourceType::ByteAddress => BufferUsage::STORAGE | BufferUsage::INDIRECT,
        ResourceType::Structured | ResourceType::RenderTarget | ResourceType::Texture => {
            BufferUsage::STORAGE
        }
        ResourceType::Staging => BufferUsage::empty(),
    };
    usage | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST
}

/// A buffer with its device copies and staging copies.
pub struct Buffer {
    device: Device,
    desc: BufferDesc,
    remotes: Vec<Arc<GpuBuffer>>,
    hosts: HostCopies,
    last_upload: u64,
}

impl Buffer {
    /// Create the buffer, uploading `initial` to every device copy.
    pub fn new(device: &Device, desc: BufferDesc, initial: Option<&[u8]>) -> Result<Self> {
        if desc.size == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }
        if let Some(data) = initial {
            if data.len() as u64 > desc.size {
                return Err(GpuError::InvalidArgument(format!(
                    "{} bytes of initial data for the {} byte buffer '{}'",
                    data.len(),
                    desc.size,
                    desc.name
                )));
            }
        }

        let depth = device.frame_queue_depth();
        let remote_count = remote_count(desc.usage, depth);
        let policy = if desc.pool == Pool::SystemMem {
            AllocationPolicy::cpu_to_gpu()
        } else {
            AllocationPolicy::gpu_only()
        };
        let info = BufferInfo {
            size: desc.size,
            usage: native_usage(desc.ty),
            concurrent: false,
        };
        let mut remotes = Vec::with_capacity(remote_count);
        for i in 0..remote_count {
            let name = if remote_count == 1 {
                desc.name.clone()
            } else {
                format!("{}[{i}]", desc.name)
            };
            remotes.push(GpuBuffer::new(device.allocator(), &name, desc.ty, info, policy)?);
        }

        let hosts = HostCopies::new(
            device,
            &desc.name,
            desc.ty,
            desc.size,
            host_count(desc.usage, desc.pool, depth),
        )?;

        let mut buffer = Self {
            device: device.clone(),
            desc,
            remotes,
            hosts,
            last_upload: 0,
        };
        if let Some(data) = initial {
            buffer.upload_initial(data)?;
        }
        Ok(buffer)
    }

    fn upload_initial(&mut self, data: &[u8]) -> Result<()> {
        let staging = GpuBuffer::new(
            self.device.allocator(),
            &format!("{} (initial)", self.desc.name),
            ResourceType::Staging,
            BufferInfo {
                size: data.len() as u64,
                usage: BufferUsage::TRANSFER_SRC,
                concurrent: true,
            },
            AllocationPolicy::cpu_to_gpu(),
        )?;
        staging.write_bytes(0, data)?;

        let mut padded = data.to_vec();
        padded.resize(self.desc.size as usize, 0);
        self.hosts.fill(&padded)?;

        for remote in &self.remotes {
            self.last_upload = self.device.transfer().add(Load::CopyToBuffer {
                src: Arc::clone(&staging),
                dst: Arc::clone(remote),
                regions: vec![BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: data.len() as u64,
                }],
                path: UploadPath::Transfer,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    #[inline]
    pub const fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.desc.size
    }

    #[inline]
    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    #[inline]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    #[inline]
    pub const fn is_locked(&self) -> bool {
        self.hosts.is_locked()
    }

    /// Serial of the flush carrying the most recent upload.
    #[inline]
    pub const fn last_upload(&self) -> u64 {
        self.last_upload
    }

    fn remote_index(&self) -> usize {
        (self.device.frame_index() % self.remotes.len() as u64) as usize
    }

    /// Device copy the current frame reads.
    pub fn remote(&self) -> &Arc<GpuBuffer> {
        &self.remotes[self.remote_index()]
    }

    /// Every device copy.
    pub fn remotes(&self) -> &[Arc<GpuBuffer>] {
        &self.remotes
    }

    /// Staging slot `index`.
    pub fn host(&self, index: usize) -> Option<&Arc<GpuBuffer>> {
        (index < self.hosts.len()).then(|| self.hosts.slot(index))
    }

    /// Map `size` bytes at `offset` of the current frame's staging copy.
    ///
    /// A `size` of 0 maps to the end of the buffer.
    pub fn lock(&mut self, offset: u64, size: u64, mode: LockMode) -> Result<&mut [u8]> {
        self.hosts
            .lock(&self.device, &self.desc.name, offset, size, mode)
    }

    /// Enqueue the upload of the locked range.
    pub fn unlock(&mut self) -> Result<()> {
        let Some(locked) = self.hosts.unlock(&self.desc.name)? else {
            return Ok(());
        };

        let dynamic = self.desc.usage.contains(Usage::DYNAMIC);
        // Per-frame copies may hold older contents outside the range.
        let region = if dynamic && self.remotes.len() == 1 {
            BufferCopy {
                src_offset: locked.offset,
                dst_offset: locked.offset,
                size: locked.size,
            }
        } else {
            BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: self.desc.size,
            }
        };
        let load = Load::CopyToBuffer {
            src: Arc::clone(self.hosts.slot(locked.slot)),
            dst: Arc::clone(self.remote()),
            regions: vec![region],
            path: if dynamic {
                UploadPath::Graphics
            } else {
                UploadPath::Transfer
            },
        };
        let serial = self.device.transfer().add(load);
        self.hosts.record_upload(locked.slot, serial);
        self.last_upload = serial;
        Ok(())
    }

    /// Lock, copy `data` in and unlock.
    pub fn write(&mut self, offset: u64, data: &[u8], mode: LockMode) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let bytes = self.lock(offset, data.len() as u64, mode)?;
        bytes.copy_from_slice(data);
        self.unlock()
    }

    /// Typed variant of [`write`](Self::write).
    pub fn write_pod<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T], mode: LockMode) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(data), mode)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("desc", &self.desc)
            .field("remotes", &self.remotes.len())
            .field("hosts", &self.hosts.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.hosts.is_locked() {
            tracing::warn!("Buffer '{}' dropped while locked", self.desc.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, QueueKind};
    use crate::headless::HeadlessBackend;
    use stratum_core::DeviceConfig;

    fn device() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone(), DeviceConfig::default()).unwrap();
        (backend, device)
    }

    fn contents(backend: &HeadlessBackend, buffer: &GpuBuffer) -> Vec<u8> {
        backend.read_buffer(buffer.id()).unwrap()
    }

    #[test]
    fn initial_data_reaches_every_copy() {
        let (backend, device) = device();
        let desc = BufferDesc::new("verts", ResourceType::Vertex, 32).with_usage(Usage::PER_FRAME);
        let buffer = Buffer::new(&device, desc, Some(&[7; 32])).unwrap();
        assert_eq!(buffer.remote_count(), 3);
        assert_eq!(buffer.host_count(), 0);

        device.flush().unwrap();
        device.wait().unwrap();
        for remote in buffer.remotes() {
            assert_eq!(contents(&backend, remote), vec![7; 32]);
            assert_eq!(
                backend.buffer_owner(remote.id()),
                Some(backend.properties().family(QueueKind::Graphics))
            );
        }
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn lock_errors() {
        let (_backend, device) = device();
        let mut fixed = Buffer::new(
            &device,
            BufferDesc::new("fixed", ResourceType::Index, 64),
            None,
        )
        .unwrap();
        assert!(matches!(
            fixed.lock(0, 0, LockMode::Write),
            Err(GpuError::InvalidState(_))
        ));

        let mut counter = Buffer::new(
            &device,
            BufferDesc::new("counter", ResourceType::ByteAddress, 64)
                .with_usage(Usage::ATOMIC_COUNTER),
            None,
        )
        .unwrap();
        assert!(matches!(
            counter.lock(0, 16, LockMode::Discard),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            counter.lock(60, 16, LockMode::Write),
            Err(GpuError::InvalidArgument(_))
        ));
        counter.lock(0, 16, LockMode::Write).unwrap();
        assert!(matches!(
            counter.lock(16, 16, LockMode::Write),
            Err(GpuError::InvalidState(_))
        ));
        counter.unlock().unwrap();
        assert!(counter.unlock().is_err());
        assert!(Buffer::new(&device, BufferDesc::new("empty", ResourceType::Vertex, 0), None).is_err());
    }

    #[test]
    fn static_write_goes_through_the_transfer_queue() {
        let (backend, device) = device();
        let mut buffer = Buffer::new(
            &device,
            BufferDesc::new("params", ResourceType::Structured, 16).with_pool(Pool::SystemMem),
            Some(&[1; 16]),
        )
        .unwrap();
        buffer.write(4, &[9; 4], LockMode::Write).unwrap();
        device.flush().unwrap();
        device.wait().unwrap();

        let mut expected = vec![1; 16];
        expected[4..8].copy_from_slice(&[9; 4]);
        assert_eq!(contents(&backend, buffer.remote()), expected);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn dynamic_write_preserves_other_bytes() {
        let (backend, device) = device();
        let mut buffer = Buffer::new(
            &device,
            BufferDesc::new("instances", ResourceType::Vertex, 16).with_usage(Usage::DYNAMIC),
            Some(&[2; 16]),
        )
        .unwrap();
        assert_eq!(buffer.host_count(), 3);
        device.end_frame().unwrap();

        // Frame 1 uses host slot 1, seeded from the initial contents.
        buffer.write_pod(0, &[0xAABB_CCDDu32], LockMode::Write).unwrap();
        device.end_frame().unwrap();
        buffer.write(12, &[5; 4], LockMode::Write).unwrap();
        device.flush().unwrap();
        device.wait_all().unwrap();

        let mut expected = vec![2; 16];
        expected[..4].copy_from_slice(&0xAABB_CCDDu32.to_ne_bytes());
        expected[12..].copy_from_slice(&[5; 4]);
        assert_eq!(contents(&backend, buffer.remote()), expected);
        let read = buffer.lock(0, 0, LockMode::ReadOnly).unwrap().to_vec();
        buffer.unlock().unwrap();
        assert_eq!(read, expected);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }
}
