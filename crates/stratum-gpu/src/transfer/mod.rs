//! Batched uploads across the transfer and graphics queues.
//!
//! Producers [`add`](TransferQueue::add) loads from any thread. Once per
//! frame one thread [`flush`](TransferQueue::flush)es the gathered loads into
//! the next generation of a `frame_queue_depth + 1` ring and submits them.
//! A generation is waited on before it is recorded again, so the ring
//! pipelines uploads `frame_queue_depth` frames deep without blocking the
//! recording thread.

mod generation;
mod load;

pub use generation::GenerationState;
pub use load::{Load, UploadPath};

use crate::backend::Backend;
use crate::error::Result;
use generation::Generation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct TransferState {
    gathered: Vec<Load>,
    /// Generation the next flush records into.
    cursor: usize,
    /// Serial the next flush will carry.
    next_serial: u64,
    last_flushed: Option<usize>,
}

/// Ring of generations plus the gathered list.
pub struct TransferQueue {
    backend: Arc<dyn Backend>,
    state: Mutex<TransferState>,
    generations: Vec<Mutex<Generation>>,
    completed_serial: AtomicU64,
}

impl TransferQueue {
    /// Create `frame_queue_depth + 1` generations.
    pub fn new(backend: Arc<dyn Backend>, frame_queue_depth: u32) -> Result<Self> {
        let count = frame_queue_depth as usize + 1;
        let mut generations = Vec::with_capacity(count);
        for index in 0..count {
            generations.push(Mutex::new(Generation::new(backend.as_ref(), index)?));
        }
        tracing::debug!("Transfer queue with {count} generations on {}", backend.name());
        Ok(Self {
            backend,
            state: Mutex::new(TransferState {
                gathered: Vec::new(),
                cursor: 0,
                next_serial: 1,
                last_flushed: None,
            }),
            generations,
            completed_serial: AtomicU64::new(0),
        })
    }

    /// Number of generations in the ring.
    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    /// Queue a load for the next flush. Returns the serial of that flush.
    pub fn add(&self, load: Load) -> u64 {
        let mut state = self.state.lock();
        state.gathered.push(load);
        state.next_serial
    }

    /// Loads gathered since the last flush.
    pub fn pending(&self) -> usize {
        self.state.lock().gathered.len()
    }

    /// Record and submit everything gathered into the next generation.
    ///
    /// Blocks only if that generation's previous submission is still running.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.gathered.is_empty() {
            return Ok(());
        }
        let serial = state.next_serial;
        let index = state.cursor;

        let mut generation = self.generations[index].lock();
        self.wait_generation(&mut generation)?;
        let backend = self.backend.as_ref();
        if let Err(e) = generation
            .push(backend, &mut state.gathered, serial)
            .and_then(|()| generation.submit(backend))
        {
            // Keep the batch for the next flush.
            let mut abandoned = generation.abandon();
            abandoned.append(&mut state.gathered);
            state.gathered = abandoned;
            tracing::warn!("Flush of {} loads failed: {e}", state.gathered.len());
            return Err(e);
        }

        state.next_serial += 1;
        state.cursor = (index + 1) % self.generations.len();
        state.last_flushed = Some(index);
        Ok(())
    }

    /// Wait for the most recently flushed generation.
    pub fn wait(&self) -> Result<()> {
        let last = self.state.lock().last_flushed;
        if let Some(index) = last {
            self.wait_generation(&mut self.generations[index].lock())?;
        }
        Ok(())
    }

    /// Wait for every generation.
    pub fn wait_all(&self) -> Result<()> {
        for generation in &self.generations {
            self.wait_generation(&mut generation.lock())?;
        }
        Ok(())
    }

    /// Wait until the flush carrying `serial` has completed.
    ///
    /// Serials that have not been flushed yet return immediately; their loads
    /// are still in the gathered list and will observe later writes.
    pub fn wait_serial(&self, serial: u64) -> Result<()> {
        if serial == 0 || serial <= self.completed_serial() {
            return Ok(());
        }
        if serial >= self.state.lock().next_serial {
            return Ok(());
        }
        for generation in &self.generations {
            let mut generation = generation.lock();
            if generation.serial() == serial {
                return self.wait_generation(&mut generation);
            }
        }
        // The generation was reused, so it was waited on.
        Ok(())
    }

    /// Whether the flush carrying `serial` has happened.
    pub fn is_flushed(&self, serial: u64) -> bool {
        serial < self.state.lock().next_serial
    }

    /// Highest serial whose generation has been waited on.
    pub fn completed_serial(&self) -> u64 {
        self.completed_serial.load(Ordering::Acquire)
    }

    /// Poll whether the flush carrying `serial` finished, without blocking.
    pub fn is_complete(&self, serial: u64) -> Result<bool> {
        if serial <= self.completed_serial() {
            return Ok(true);
        }
        if !self.is_flushed(serial) {
            return Ok(false);
        }
        for generation in &self.generations {
            let generation = generation.lock();
            if generation.serial() == serial {
                return generation.is_complete(self.backend.as_ref());
            }
        }
        Ok(true)
    }

    /// State of each generation, in ring order.
    pub fn generation_states(&self) -> Vec<GenerationState> {
        self.generations.iter().map(|g| g.lock().state()).collect()
    }

    fn wait_generation(&self, generation: &mut Generation) -> Result<()> {
        if generation.state() != GenerationState::Submitted {
            return Ok(());
        }
        generation.wait(self.backend.as_ref())?;
        self.completed_serial
            .fetch_max(generation.serial(), Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        if let Err(e) = self.wait_all() {
            tracing::error!("Failed to drain transfer queue: {e}");
        }
        let pending = self.state.get_mut().gathered.len();
        if pending > 0 {
            tracing::warn!("Dropping {pending} loads that were never flushed");
        }
        for generation in &mut self.generations {
            generation.get_mut().destroy(self.backend.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferCopy, BufferInfo, BufferUsage};
    use crate::headless::HeadlessBackend;
    use crate::memory::{AllocationPolicy, Allocator};
    use crate::native::GpuBuffer;
    use stratum_core::{AllocatorConfig, ResourceType};

    struct Fixture {
        backend: Arc<HeadlessBackend>,
        allocator: Allocator,
        queue: TransferQueue,
    }

    fn fixture(depth: u32) -> Fixture {
        let backend = Arc::new(HeadlessBackend::default());
        let allocator = Allocator::new(backend.clone(), &AllocatorConfig::default()).unwrap();
        let queue = TransferQueue::new(backend.clone(), depth).unwrap();
        Fixture {
            backend,
            allocator,
            queue,
        }
    }

    fn buffer(allocator: &Allocator, size: u64, host: bool) -> Arc<GpuBuffer> {
        let (usage, policy) = if host {
            (BufferUsage::TRANSFER_SRC, AllocationPolicy::cpu_to_gpu())
        } else {
            (BufferUsage::TRANSFER_DST, AllocationPolicy::gpu_only())
        };
        GpuBuffer::new(
            allocator,
            if host { "staging" } else { "dst" },
            ResourceType::Staging,
            BufferInfo {
                size,
                usage,
                concurrent: host,
            },
            policy,
        )
        .unwrap()
    }

    fn copy(src: &Arc<GpuBuffer>, dst: &Arc<GpuBuffer>, dst_offset: u64) -> Load {
        Load::CopyToBuffer {
            src: src.clone(),
            dst: dst.clone(),
            regions: vec![BufferCopy {
                src_offset: 0,
                dst_offset,
                size: src.size(),
            }],
            path: UploadPath::Transfer,
        }
    }

    #[test]
    fn flush_takes_the_gathered_list() {
        let f = fixture(2);
        let src = buffer(&f.allocator, 16, true);
        let dst = buffer(&f.allocator, 16, false);
        assert_eq!(f.queue.add(copy(&src, &dst, 0)), 1);
        assert_eq!(f.queue.pending(), 1);
        f.queue.flush().unwrap();
        assert_eq!(f.queue.pending(), 0);
        assert!(f.queue.is_flushed(1));
        assert!(!f.queue.is_complete(1).unwrap());
        f.queue.wait().unwrap();
        assert_eq!(f.queue.completed_serial(), 1);
    }

    #[test]
    fn empty_flush_submits_nothing() {
        let f = fixture(2);
        f.queue.flush().unwrap();
        f.queue.wait().unwrap();
        assert_eq!(f.backend.submission_count(), 0);
        assert!(f
            .queue
            .generation_states()
            .iter()
            .all(|s| *s == GenerationState::Idle));
    }

    #[test]
    fn generations_are_waited_before_reuse() {
        let depth = 2;
        let f = fixture(depth);
        let src = buffer(&f.allocator, 16, true);
        let dst = buffer(&f.allocator, 16, false);

        for _ in 0..=depth {
            f.queue.add(copy(&src, &dst, 0));
            f.queue.flush().unwrap();
        }
        // Every generation holds an unfinished submission.
        assert_eq!(f.backend.pending_submissions(), 2 * (depth as usize + 1));
        assert_eq!(f.queue.completed_serial(), 0);

        // The next flush lands on generation 0 again and must wait for it first.
        f.queue.add(copy(&src, &dst, 0));
        f.queue.flush().unwrap();
        assert_eq!(f.queue.completed_serial(), 1);
        assert!(f.backend.violations().is_empty(), "{:?}", f.backend.violations());
        f.queue.wait_all().unwrap();
        assert_eq!(f.queue.completed_serial(), u64::from(depth) + 2);
    }

    #[test]
    fn wait_serial_targets_one_generation() {
        let f = fixture(3);
        let src = buffer(&f.allocator, 16, true);
        let dst = buffer(&f.allocator, 64, false);
        let first = f.queue.add(copy(&src, &dst, 0));
        f.queue.flush().unwrap();
        let second = f.queue.add(copy(&src, &dst, 16));
        f.queue.wait_serial(second).unwrap();
        f.queue.flush().unwrap();

        f.queue.wait_serial(first).unwrap();
        assert_eq!(f.queue.completed_serial(), first);
        assert!(!f.queue.is_complete(second).unwrap());
        f.queue.wait_all().unwrap();
    }

    #[test]
    fn staging_memory_lives_until_the_generation_is_waited() {
        let f = fixture(1);
        let src = buffer(&f.allocator, 16, true);
        let dst = buffer(&f.allocator, 16, false);
        src.write_bytes(0, &[5; 16]).unwrap();
        f.queue.add(copy(&src, &dst, 0));
        drop(src);
        f.queue.flush().unwrap();
        // The load still holds the staging buffer.
        assert_eq!(f.backend.live_objects().0, 2);
        f.queue.wait().unwrap();
        assert_eq!(f.backend.live_objects().0, 1);
        assert_eq!(f.backend.read_buffer(dst.id()).unwrap(), vec![5; 16]);
        assert!(f.backend.violations().is_empty(), "{:?}", f.backend.violations());
    }

    #[test]
    fn failed_flush_keeps_the_batch() {
        let f = fixture(2);
        let src = buffer(&f.allocator, 16, true);
        let dst = buffer(&f.allocator, 16, false);
        src.write_bytes(0, &[7; 16]).unwrap();
        let serial = f.queue.add(copy(&src, &dst, 0));

        f.backend.fail_next_submits(1);
        assert!(f.queue.flush().is_err());
        assert_eq!(f.queue.pending(), 1);
        assert!(!f.queue.is_flushed(serial));
        assert_eq!(dst.owner(), None);

        f.queue.flush().unwrap();
        f.queue.wait_serial(serial).unwrap();
        assert_eq!(f.queue.completed_serial(), serial);
        assert_eq!(f.backend.read_buffer(dst.id()).unwrap(), vec![7; 16]);
        assert!(f.backend.violations().is_empty(), "{:?}", f.backend.violations());
    }
}
