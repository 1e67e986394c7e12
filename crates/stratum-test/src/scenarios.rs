//! End-to-end scenarios on the headless backend.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;

use image::{ImageBuffer, Rgba, RgbaImage};
use stratum_core::{
    ConstantBufferConfig, DeviceConfig, Format, LockMode, Pool, ResourceType, Usage,
};
use stratum_gpu::backend::BufferCopy;
use stratum_gpu::{
    Buffer, BufferDesc, ConstantBuffer, GenerationState, GpuError, Load, Texture, TextureDesc,
    UploadPath,
};

use crate::{compare_images, pattern, TestDevice};

/// Xorshift64 sequence; the same seed yields the same values.
struct Sequence(u64);

impl Sequence {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0 % bound
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 40) as u8, (y * 40) as u8, 128, 255])
    });
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

#[test]
fn dropped_resources_return_their_memory() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let before = device.allocator().stats().total;
    let used_before = device.allocator().vram().used;
    let objects_before = test.backend().live_objects();

    let data = pattern(4096, 7);
    let buffer = Buffer::new(
        device,
        BufferDesc::new("mesh", ResourceType::Vertex, 4096).with_usage(Usage::DYNAMIC),
        Some(&data),
    )
    .unwrap();
    let texture = Texture::from_bytes(device, "albedo", &png(8, 8)).unwrap();
    device.flush().unwrap();
    assert!(device.allocator().stats().total.bytes > before.bytes);

    drop(buffer);
    drop(texture);
    // In-flight loads keep the staging copies alive until their generation is waited.
    device.wait_all().unwrap();

    let stats = device.allocator().stats();
    assert_eq!(stats.total, before);
    assert!(!stats.per_name.contains_key("mesh"));
    assert_eq!(device.allocator().vram().used, used_before);
    assert_eq!(test.backend().live_objects(), objects_before);

    // The freed range is handed out again.
    let again = Buffer::new(device, BufferDesc::new("mesh", ResourceType::Vertex, 4096), None)
        .unwrap();
    assert_eq!(again.size(), 4096);
    test.check_violations().unwrap();
}

#[test]
fn one_lock_per_slot_at_a_time() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let mut buffer = Buffer::new(
        device,
        BufferDesc::new("instances", ResourceType::Vertex, 256).with_usage(Usage::DYNAMIC),
        None,
    )
    .unwrap();

    for frame in 0..6u8 {
        buffer.lock(0, 64, LockMode::Discard).unwrap().fill(frame);
        assert!(matches!(
            buffer.lock(0, 64, LockMode::Discard),
            Err(GpuError::InvalidState(_))
        ));
        buffer.unlock().unwrap();
        assert!(matches!(buffer.unlock(), Err(GpuError::InvalidState(_))));
        device.end_frame().unwrap();
    }
    device.wait_all().unwrap();
    test.check_violations().unwrap();
}

#[test]
fn uploads_are_visible_after_wait() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let mut buffer = Buffer::new(
        device,
        BufferDesc::new("params", ResourceType::Structured, 1024).with_usage(Usage::ATOMIC_COUNTER),
        Some(&[0; 1024]),
    )
    .unwrap();

    let data = pattern(512, 3);
    buffer.write(256, &data, LockMode::Write).unwrap();
    let serial = buffer.last_upload();
    device.flush().unwrap();
    device.wait().unwrap();
    assert!(device.transfer().completed_serial() >= serial);

    let contents = test.buffer_contents(buffer.remote()).unwrap();
    assert_eq!(&contents[..256], &[0; 256][..]);
    assert_eq!(&contents[256..768], &data[..]);
    assert_eq!(&contents[768..], &[0; 256][..]);
    test.check_violations().unwrap();
}

#[test]
fn staging_outlives_the_resource_until_waited() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let data = pattern(2048, 11);
    let staging = test.staging("upload", &data).unwrap();
    let dst = test.destination("target", 2048).unwrap();
    device.transfer().add(Load::CopyToBuffer {
        src: Arc::clone(&staging),
        dst: Arc::clone(&dst),
        regions: vec![BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 2048,
        }],
        path: UploadPath::Transfer,
    });
    drop(staging);
    device.flush().unwrap();
    assert!(device.allocator().stats().per_name.contains_key("upload"));

    device.wait().unwrap();
    assert!(!device.allocator().stats().per_name.contains_key("upload"));
    assert_eq!(test.buffer_contents(&dst).unwrap(), data);
    test.check_violations().unwrap();
}

#[test]
fn ring_offsets_are_disjoint_and_replayable() {
    let test = TestDevice::new().unwrap();
    let mut ring =
        ConstantBuffer::new(test.device(), &ConstantBufferConfig::new(64 * 1024, 4096)).unwrap();
    let mut sequence = Sequence(0x9e37_79b9_7f4a_7c15);
    // At most 768 bytes each once aligned, so 80 always fit.
    let sizes: Vec<u64> = (0..80).map(|_| sequence.next(600)).collect();

    let replay = |ring: &ConstantBuffer| {
        let mut ctx = ring.context();
        let mut blocks = Vec::new();
        for &size in &sizes {
            let block = ring.allocate(&mut ctx, size).unwrap();
            assert!(block.offset + block.size <= 64 * 1024);
            assert_eq!(block.offset % 256, 0);
            blocks.push((block.offset, block.size));
        }
        blocks
    };

    let first = replay(&ring);
    for pair in first.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0);
    }
    ring.reset();
    assert_eq!(replay(&ring), first);
}

#[test]
fn generations_are_waited_before_reuse() {
    let config = DeviceConfig::new("stratum-test").with_frame_queue_depth(2);
    let test = TestDevice::with_config(config).unwrap();
    let device = test.device();
    assert_eq!(device.transfer().generation_count(), 3);

    let dst = test.destination("ring", 64).unwrap();
    for round in 0..7u8 {
        let staging = test.staging("frame data", &[round; 64]).unwrap();
        device.transfer().add(Load::CopyToBuffer {
            src: staging,
            dst: Arc::clone(&dst),
            regions: vec![BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 64,
            }],
            path: UploadPath::Transfer,
        });
        device.end_frame().unwrap();
        let submitted = device
            .transfer()
            .generation_states()
            .into_iter()
            .filter(|state| *state == GenerationState::Submitted)
            .count();
        assert_eq!(submitted, usize::from(round + 1).min(3));
        // Re-recording an in-flight command buffer is reported as a violation.
        test.check_violations().unwrap();
    }

    device.wait_all().unwrap();
    assert_eq!(test.buffer_contents(&dst).unwrap(), vec![6; 64]);
    assert_eq!(test.backend().pending_submissions(), 0);
}

#[test]
fn corrupt_texture_becomes_placeholder() {
    let test = TestDevice::new().unwrap();
    let texture = Texture::from_bytes(test.device(), "broken", b"definitely not a png").unwrap();
    assert_eq!((texture.desc().width, texture.desc().height), (1, 1));
    assert_eq!(texture.name(), "placeholder");
    assert_eq!(texture.read_back().unwrap().data().unwrap(), vec![255, 0, 255, 255]);
    test.check_violations().unwrap();
}

#[test]
fn decoded_texture_round_trips() {
    let test = TestDevice::new().unwrap();
    let bytes = png(4, 3);
    let texture = Texture::from_bytes(test.device(), "checker", &bytes).unwrap();
    let expected = image::load_from_memory(&bytes).unwrap().to_rgba8();

    let data = texture.read_back().unwrap().data().unwrap();
    let actual: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_raw(4, 3, data).unwrap();
    assert_eq!(compare_images(&expected, &actual).unwrap(), 0.0);
    test.check_violations().unwrap();
}

#[test]
fn reads_stay_ahead_of_later_writes_in_one_batch() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let desc =
        |name: &str| TextureDesc::new(name, 1, 1, Format::Rgba8Unorm).with_pool(Pool::SystemMem);
    let mut source = Texture::new(device, desc("source"), Some(&[1; 4])).unwrap();
    let mut copy = Texture::new(device, desc("copy"), None).unwrap();
    device.flush().unwrap();
    device.wait_all().unwrap();

    // Both reads of `source` are queued before the write that replaces it.
    let before = source.read_back().unwrap();
    copy.copy_from(&source).unwrap();
    source.lock(0, 4, LockMode::Write).unwrap().copy_from_slice(&[9; 4]);
    source.unlock().unwrap();
    assert_eq!(device.transfer().pending(), 3);
    device.flush().unwrap();
    device.wait_all().unwrap();

    assert_eq!(before.data().unwrap(), vec![1; 4]);
    assert_eq!(copy.read_back().unwrap().data().unwrap(), vec![1; 4]);
    assert_eq!(source.read_back().unwrap().data().unwrap(), vec![9; 4]);
    test.check_violations().unwrap();
}

#[test]
fn shared_transfer_family_uploads_and_reads_back() {
    let config = DeviceConfig::new("stratum-test").with_dedicated_transfer_queue(false);
    let test = TestDevice::with_config(config).unwrap();
    let device = test.device();
    assert!(!device.properties().has_dedicated_transfer());

    let data = pattern(1024, 5);
    let mesh = Buffer::new(
        device,
        BufferDesc::new("mesh", ResourceType::Vertex, 1024),
        Some(&data),
    )
    .unwrap();
    let mut particles = Buffer::new(
        device,
        BufferDesc::new("particles", ResourceType::Vertex, 256).with_usage(Usage::DYNAMIC),
        Some(&[0; 256]),
    )
    .unwrap();
    particles.write(0, &[3; 128], LockMode::Discard).unwrap();
    let bytes = png(4, 4);
    let texture = Texture::from_bytes(device, "albedo", &bytes).unwrap();
    let readback = texture.read_back().unwrap();
    device.flush().unwrap();
    device.wait_all().unwrap();

    assert_eq!(test.buffer_contents(mesh.remote()).unwrap(), data);
    let remote = test.buffer_contents(particles.remote()).unwrap();
    assert_eq!(&remote[..128], &[3; 128][..]);
    let expected = image::load_from_memory(&bytes).unwrap().to_rgba8();
    assert_eq!(readback.data().unwrap(), expected.into_raw());
    assert_eq!(test.backend().pending_submissions(), 0);
    test.check_violations().unwrap();
}

#[test]
fn constant_ring_offsets_restart_each_frame() {
    let test = TestDevice::new().unwrap();
    let mut ring =
        ConstantBuffer::new(test.device(), &ConstantBufferConfig::new(64 * 1024, 64 * 1024))
            .unwrap();
    let mut ctx = ring.context();
    assert_eq!(ring.allocate(&mut ctx, 256).unwrap().offset, 0);
    assert_eq!(ring.allocate(&mut ctx, 256).unwrap().offset, 256);
    ring.reset();
    assert_eq!(ring.allocate(&mut ctx, 256).unwrap().offset, 0);
}

#[test]
fn discard_keeps_other_frames_intact() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let mut buffer = Buffer::new(
        device,
        BufferDesc::new("particles", ResourceType::Vertex, 256).with_usage(Usage::DYNAMIC),
        Some(&[0; 256]),
    )
    .unwrap();
    assert_eq!(buffer.host_count(), 3);

    buffer.lock(0, 64, LockMode::Discard).unwrap().fill(0xAA);
    buffer.unlock().unwrap();
    // Same frame index again, before the ring has come around.
    buffer.lock(0, 64, LockMode::Discard).unwrap().fill(0xDD);
    buffer.unlock().unwrap();

    let host = |i: usize| buffer.host(i).unwrap().read_bytes(0, 256).unwrap();
    assert_eq!(&host(0)[..64], &[0xDD; 64][..]);
    assert_eq!(host(1), vec![0; 256]);
    assert_eq!(host(2), vec![0; 256]);

    device.end_frame().unwrap();
    buffer.write(0, &[0xBB; 64], LockMode::Discard).unwrap();
    device.end_frame().unwrap();
    buffer.write(0, &[0xCC; 64], LockMode::Discard).unwrap();
    device.end_frame().unwrap();
    // Frame 3 wraps onto slot 0 and must wait for its last upload.
    buffer.write(0, &[0xEE; 64], LockMode::Discard).unwrap();

    let host = |i: usize| buffer.host(i).unwrap().read_bytes(0, 64).unwrap();
    assert_eq!(host(0), vec![0xEE; 64]);
    assert_eq!(host(1), vec![0xBB; 64]);
    assert_eq!(host(2), vec![0xCC; 64]);

    device.flush().unwrap();
    device.wait().unwrap();
    let remote = test.buffer_contents(buffer.remote()).unwrap();
    assert_eq!(&remote[..64], &[0xEE; 64][..]);
    test.check_violations().unwrap();
}

#[test]
fn five_loads_land_after_one_flush() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let dst = test.destination("batch", 5 * 64).unwrap();
    let mut expected = Vec::new();
    for i in 0..5u8 {
        let data = pattern(64, i * 50);
        expected.extend_from_slice(&data);
        let src = test.staging(&format!("load {i}"), &data).unwrap();
        device.transfer().add(Load::CopyToBuffer {
            src,
            dst: Arc::clone(&dst),
            regions: vec![BufferCopy {
                src_offset: 0,
                dst_offset: u64::from(i) * 64,
                size: 64,
            }],
            path: UploadPath::Transfer,
        });
    }
    assert_eq!(device.transfer().pending(), 5);

    device.flush().unwrap();
    assert_eq!(device.transfer().pending(), 0);
    device.wait().unwrap();
    assert_eq!(test.buffer_contents(&dst).unwrap(), expected);
    test.check_violations().unwrap();
}

#[test]
fn workers_share_the_device() {
    let test = TestDevice::new().unwrap();
    let device = test.device();
    let ring =
        ConstantBuffer::new(device, &ConstantBufferConfig::new(1024 * 1024, 16 * 1024)).unwrap();

    let offsets: Vec<Vec<(u64, u64)>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4u8)
            .map(|worker| {
                let ring = &ring;
                scope.spawn(move || {
                    let _mesh = Buffer::new(
                        device,
                        BufferDesc::new(format!("worker {worker}"), ResourceType::Vertex, 512),
                        Some(&[worker; 512]),
                    )
                    .unwrap();

                    let mut ctx = ring.context();
                    (0..64)
                        .map(|_| {
                            let block = ring.allocate(&mut ctx, 200).unwrap();
                            block.data.fill(worker);
                            (block.offset, block.size)
                        })
                        .collect()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let mut seen = BTreeSet::new();
    for (offset, size) in offsets.into_iter().flatten() {
        assert_eq!(size, 256);
        assert!(seen.insert(offset), "offset {offset} handed out twice");
    }
    assert_eq!(seen.len(), 4 * 64);
    assert_eq!(device.transfer().pending(), 4);
    device.flush().unwrap();
    device.wait_all().unwrap();
    test.check_violations().unwrap();
}

#[test]
fn uploads_from_several_threads() {
    let test = TestDevice::new().unwrap();
    let device = test.device();

    let buffers: Vec<Buffer> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4u8)
            .map(|worker| {
                scope.spawn(move || {
                    let mut buffer = Buffer::new(
                        device,
                        BufferDesc::new(format!("upload {worker}"), ResourceType::Index, 128)
                            .with_usage(Usage::DYNAMIC),
                        Some(&[0; 128]),
                    )
                    .unwrap();
                    buffer.write(0, &[worker + 1; 128], LockMode::Discard).unwrap();
                    buffer
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    device.flush().unwrap();
    device.wait().unwrap();
    for (i, buffer) in buffers.iter().enumerate() {
        let contents = test.buffer_contents(buffer.remote()).unwrap();
        assert_eq!(contents, vec![i as u8 + 1; 128]);
    }
    test.check_violations().unwrap();
}
