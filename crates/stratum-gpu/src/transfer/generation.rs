//! One ring slot of the transfer queue.

use super::load::{Load, Recorder, Snapshot};
use crate::backend::{
    Access, Backend, CommandBufferId, FenceId, QueueKind, SemaphoreId, Submission,
};
use crate::error::{GpuError, Result};
use stratum_core::constants::FENCE_TIMEOUT_NS;

/// Lifecycle of a generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationState {
    /// Nothing outstanding; command buffers may be recorded.
    Idle,
    /// Loads are being recorded.
    Recording,
    /// Submitted; fences must be waited on before reuse.
    Submitted,
}

/// A graphics + transfer command buffer pair with its fences, the semaphore
/// linking them and the loads they carry.
pub(crate) struct Generation {
    index: usize,
    graphics_cmd: CommandBufferId,
    transfer_cmd: CommandBufferId,
    graphics_fence: FenceId,
    transfer_fence: FenceId,
    semaphore: SemaphoreId,
    loads: Vec<Load>,
    /// Tracked state before recording, until the batch is submitted.
    snapshot: Option<Snapshot>,
    state: GenerationState,
    serial: u64,
    used_graphics: bool,
    used_transfer: bool,
}

impl Generation {
    pub fn new(backend: &dyn Backend, index: usize) -> Result<Self> {
        Ok(Self {
            index,
            graphics_cmd: backend.create_command_buffer(QueueKind::Graphics)?,
            transfer_cmd: backend.create_command_buffer(QueueKind::Transfer)?,
            graphics_fence: backend.create_fence(false)?,
            transfer_fence: backend.create_fence(false)?,
            semaphore: backend.create_semaphore()?,
            loads: Vec::new(),
            snapshot: None,
            state: GenerationState::Idle,
            serial: 0,
            used_graphics: false,
            used_transfer: false,
        })
    }

    #[inline]
    pub const fn state(&self) -> GenerationState {
        self.state
    }

    /// Serial of the flush last recorded here; 0 if never used.
    #[inline]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Loads currently held by the generation.
    #[inline]
    pub fn load_count(&self) -> usize {
        self.loads.len()
    }

    /// Take and record `loads` in order. An empty batch leaves the
    /// generation idle.
    ///
    /// A rejected batch is left in `loads`. Once recording has started the
    /// loads stay here on failure until [`abandon`](Self::abandon).
    pub fn push(&mut self, backend: &dyn Backend, loads: &mut Vec<Load>, serial: u64) -> Result<()> {
        if self.state != GenerationState::Idle {
            return Err(GpuError::InvalidState(format!(
                "generation {} recorded while {:?}",
                self.index, self.state
            )));
        }
        if loads.is_empty() {
            return Ok(());
        }

        let loads = std::mem::take(loads);
        self.state = GenerationState::Recording;
        self.serial = serial;
        self.snapshot = Some(Snapshot::take(&loads));
        let recorded = self.record(backend, &loads);
        self.loads = loads;
        recorded
    }

    /// Drop an unsubmitted batch: tracked state is rolled back and the loads
    /// are handed back.
    pub fn abandon(&mut self) -> Vec<Load> {
        if self.state != GenerationState::Recording {
            return Vec::new();
        }
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.restore();
        }
        self.used_graphics = false;
        self.used_transfer = false;
        self.state = GenerationState::Idle;
        std::mem::take(&mut self.loads)
    }

    fn record(&mut self, backend: &dyn Backend, loads: &[Load]) -> Result<()> {
        backend.begin_commands(self.graphics_cmd)?;
        backend.begin_commands(self.transfer_cmd)?;

        let mut recorder = Recorder::new(backend, self.graphics_cmd, self.transfer_cmd);
        for load in loads {
            load.record(&mut recorder)?;
        }
        self.used_graphics = recorder.used_graphics;
        self.used_transfer = recorder.used_transfer;

        backend.end_commands(self.graphics_cmd)?;
        backend.end_commands(self.transfer_cmd)?;
        Ok(())
    }

    /// Submit the transfer half (signalling the semaphore), then the graphics
    /// half waiting on it.
    pub fn submit(&mut self, backend: &dyn Backend) -> Result<()> {
        match self.state {
            GenerationState::Recording => {}
            GenerationState::Idle => return Ok(()),
            GenerationState::Submitted => {
                return Err(GpuError::InvalidState(format!(
                    "generation {} submitted twice",
                    self.index
                )))
            }
        }

        let link = self.used_transfer && self.used_graphics;
        if self.used_transfer {
            backend.submit(
                QueueKind::Transfer,
                &Submission {
                    command_buffers: vec![self.transfer_cmd],
                    signal_semaphores: if link { vec![self.semaphore] } else { Vec::new() },
                    fence: Some(self.transfer_fence),
                    ..Default::default()
                },
            )?;
        }
        if self.used_graphics {
            let submitted = backend.submit(
                QueueKind::Graphics,
                &Submission {
                    command_buffers: vec![self.graphics_cmd],
                    wait_semaphores: if link {
                        vec![(self.semaphore, Access::All)]
                    } else {
                        Vec::new()
                    },
                    fence: Some(self.graphics_fence),
                    ..Default::default()
                },
            );
            if let Err(e) = submitted {
                if self.used_transfer {
                    // The transfer half is already queued; drain it so the
                    // command buffers can be recorded again.
                    let fence = [self.transfer_fence];
                    if let Err(wait) = backend
                        .wait_fences(&fence, FENCE_TIMEOUT_NS)
                        .and_then(|()| backend.reset_fences(&fence))
                    {
                        tracing::error!("Generation {} transfer half did not drain: {wait}", self.index);
                    }
                }
                return Err(e);
            }
        }
        self.snapshot = None;
        self.state = GenerationState::Submitted;
        tracing::trace!(
            "Submitted generation {} (serial {}, {} loads, transfer: {}, graphics: {})",
            self.index,
            self.serial,
            self.loads.len(),
            self.used_transfer,
            self.used_graphics
        );
        Ok(())
    }

    fn fences(&self) -> Vec<FenceId> {
        let mut fences = Vec::with_capacity(2);
        if self.used_transfer {
            fences.push(self.transfer_fence);
        }
        if self.used_graphics {
            fences.push(self.graphics_fence);
        }
        fences
    }

    /// Whether a submitted generation's fences have signalled.
    pub fn is_complete(&self, backend: &dyn Backend) -> Result<bool> {
        if self.state != GenerationState::Submitted {
            return Ok(true);
        }
        for fence in self.fences() {
            if !backend.fence_signaled(fence)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Block on both fences, then release the loads.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&mut self, backend: &dyn Backend) -> Result<()> {
        if self.state != GenerationState::Submitted {
            return Ok(());
        }
        let fences = self.fences();
        backend.wait_fences(&fences, FENCE_TIMEOUT_NS)?;
        backend.reset_fences(&fences)?;
        self.loads.clear();
        self.used_graphics = false;
        self.used_transfer = false;
        self.state = GenerationState::Idle;
        Ok(())
    }

    /// Destroy the native objects. The generation must be idle.
    pub fn destroy(&mut self, backend: &dyn Backend) {
        backend.destroy_command_buffer(self.graphics_cmd);
        backend.destroy_command_buffer(self.transfer_cmd);
        backend.destroy_fence(self.graphics_fence);
        backend.destroy_fence(self.transfer_fence);
        backend.destroy_semaphore(self.semaphore);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferCopy, BufferInfo, BufferUsage};
    use crate::headless::HeadlessBackend;
    use crate::memory::{AllocationPolicy, Allocator};
    use crate::native::GpuBuffer;
    use crate::transfer::UploadPath;
    use std::sync::Arc;
    use stratum_core::{AllocatorConfig, ResourceType};

    fn upload(allocator: &Allocator, data: &[u8]) -> (Arc<GpuBuffer>, Load) {
        let size = data.len() as u64;
        let src = GpuBuffer::new(
            allocator,
            "staging",
            ResourceType::Staging,
            BufferInfo {
                size,
                usage: BufferUsage::TRANSFER_SRC,
                concurrent: true,
            },
            AllocationPolicy::cpu_to_gpu(),
        )
        .unwrap();
        src.write_bytes(0, data).unwrap();
        let dst = GpuBuffer::new(
            allocator,
            "dst",
            ResourceType::Vertex,
            BufferInfo {
                size,
                usage: BufferUsage::TRANSFER_DST | BufferUsage::VERTEX,
                concurrent: false,
            },
            AllocationPolicy::gpu_only(),
        )
        .unwrap();
        let load = Load::CopyToBuffer {
            src,
            dst: dst.clone(),
            regions: vec![BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
            path: UploadPath::Transfer,
        };
        (dst, load)
    }

    #[test]
    fn state_machine_cycles_through_idle() {
        let backend = Arc::new(HeadlessBackend::default());
        let allocator = Allocator::new(backend.clone(), &AllocatorConfig::default()).unwrap();
        let mut generation = Generation::new(backend.as_ref(), 0).unwrap();
        let (dst, load) = upload(&allocator, &[9; 32]);

        assert_eq!(generation.state(), GenerationState::Idle);
        generation.push(backend.as_ref(), &mut vec![load], 1).unwrap();
        assert_eq!(generation.state(), GenerationState::Recording);
        generation.submit(backend.as_ref()).unwrap();
        assert_eq!(generation.state(), GenerationState::Submitted);
        assert_eq!(backend.submission_count(), 2);

        let (_, second) = upload(&allocator, &[1; 32]);
        let mut rejected = vec![second];
        assert!(generation.push(backend.as_ref(), &mut rejected, 2).is_err());
        assert_eq!(rejected.len(), 1);

        generation.wait(backend.as_ref()).unwrap();
        assert_eq!(generation.state(), GenerationState::Idle);
        assert_eq!(generation.load_count(), 0);
        assert_eq!(backend.read_buffer(dst.id()).unwrap(), vec![9; 32]);
        assert_eq!(backend.buffer_owner(dst.id()), Some(0));
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        generation.destroy(backend.as_ref());
    }

    #[test]
    fn empty_push_stays_idle() {
        let backend = HeadlessBackend::default();
        let mut generation = Generation::new(&backend, 0).unwrap();
        generation.push(&backend, &mut Vec::new(), 1).unwrap();
        generation.submit(&backend).unwrap();
        assert_eq!(generation.state(), GenerationState::Idle);
        assert_eq!(backend.submission_count(), 0);
        generation.destroy(&backend);
    }

    #[test]
    fn failed_submit_rolls_back_tracked_state() {
        let backend = Arc::new(HeadlessBackend::default());
        let allocator = Allocator::new(backend.clone(), &AllocatorConfig::default()).unwrap();
        let mut generation = Generation::new(backend.as_ref(), 0).unwrap();
        let (dst, load) = upload(&allocator, &[4; 32]);

        backend.fail_next_submits(1);
        generation.push(backend.as_ref(), &mut vec![load], 1).unwrap();
        assert_eq!(dst.owner(), Some(0));
        assert!(generation.submit(backend.as_ref()).is_err());

        let mut loads = generation.abandon();
        assert_eq!(loads.len(), 1);
        assert_eq!(dst.owner(), None);
        assert_eq!(generation.state(), GenerationState::Idle);

        generation.push(backend.as_ref(), &mut loads, 2).unwrap();
        generation.submit(backend.as_ref()).unwrap();
        generation.wait(backend.as_ref()).unwrap();
        assert_eq!(backend.read_buffer(dst.id()).unwrap(), vec![4; 32]);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        generation.destroy(backend.as_ref());
    }
}
