//! Stratum frame-loop benchmark
//!
//! Drives the device the way a renderer would: every frame several workers
//! allocate per-draw constants and rewrite a dynamic vertex buffer in
//! parallel, a streamed texture is updated, and the frame's uploads are
//! flushed. Allocator statistics are logged at the end.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p stratum-bench --release -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames <N>`: Frames to run (default: 1000)
//! - `--workers <N>`: Parallel recording workers (default: 4)
//! - `--draws <N>`: Constant blocks per worker and frame (default: 64)
//! - `--depth <N>`: Frames in flight (default: 3)
//! - `--constrained`: Use the memory-constrained allocator preset
//! - `--vulkan`: Run on the first suitable Vulkan GPU instead of the headless device
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{bail, Context};
use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;
use stratum_core::math::format_bytes;
use stratum_core::{
    AllocatorConfig, ConstantBufferConfig, DeviceConfig, Format, LockMode, ResourceType, Usage,
};
use stratum_gpu::{Buffer, BufferDesc, ConstantBuffer, Device, Texture, TextureDesc};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERTICES_PER_MESH: usize = 1024;
const TEXTURE_SIZE: u32 = 128;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct DrawConstants {
    transform: [f32; 16],
    color: [f32; 4],
}

#[derive(Debug)]
struct Options {
    frames: u64,
    workers: usize,
    draws: usize,
    depth: u32,
    constrained: bool,
    vulkan: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            frames: 1000,
            workers: 4,
            draws: 64,
            depth: 3,
            constrained: false,
            vulkan: false,
        }
    }
}

fn parse_args() -> anyhow::Result<Options> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .with_context(|| format!("{name} expects a value"))
        };
        match arg.as_str() {
            "--frames" => options.frames = value("--frames")?.parse()?,
            "--workers" => options.workers = value("--workers")?.parse()?,
            "--draws" => options.draws = value("--draws")?.parse()?,
            "--depth" => options.depth = value("--depth")?.parse()?,
            "--constrained" => options.constrained = true,
            "--vulkan" => options.vulkan = true,
            other => bail!("unknown argument '{other}' (see --help)"),
        }
    }
    if options.workers == 0 {
        bail!("--workers must be at least 1");
    }
    Ok(options)
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = parse_args()?;
    info!("Stratum frame-loop benchmark: {options:?}");

    let mut config = DeviceConfig::new("stratum-bench").with_frame_queue_depth(options.depth);
    if options.constrained {
        config = config.with_allocator(AllocatorConfig::memory_constrained());
    }
    let device = if options.vulkan {
        Device::vulkan(config)?
    } else {
        Device::headless(config)?
    };

    run(&device, &options)?;

    device.wait_idle()?;
    info!("{}", device.allocator().report());
    Ok(())
}

fn run(device: &Device, options: &Options) -> anyhow::Result<()> {
    let mut ring = ConstantBuffer::new(device, &ConstantBufferConfig::default())?;
    let mesh_size = (VERTICES_PER_MESH * std::mem::size_of::<[f32; 4]>()) as u64;
    let mut meshes = (0..options.workers)
        .map(|i| {
            Buffer::new(
                device,
                BufferDesc::new(format!("mesh {i}"), ResourceType::Vertex, mesh_size)
                    .with_usage(Usage::DYNAMIC),
                None,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut streamed = Texture::new(
        device,
        TextureDesc::new("streamed", TEXTURE_SIZE, TEXTURE_SIZE, Format::Rgba8Unorm)
            .with_usage(Usage::DYNAMIC),
        None,
    )?;

    // Serial of each frame still in flight, oldest first.
    let mut in_flight = VecDeque::new();
    let start = Instant::now();
    for frame in 0..options.frames {
        let serials = meshes
            .par_iter_mut()
            .enumerate()
            .map(|(worker, mesh)| -> anyhow::Result<u64> {
                let mut ctx = ring.context();
                for draw in 0..options.draws {
                    let mut block =
                        ring.allocate(&mut ctx, std::mem::size_of::<DrawConstants>() as u64)?;
                    block.write_pod(&draw_constants(frame, worker, draw))?;
                }
                mesh.write_pod(0, &mesh_vertices(frame, worker), LockMode::Discard)?;
                Ok(mesh.last_upload())
            })
            .collect::<anyhow::Result<Vec<u64>>>()?;

        let texels = streamed.lock(0, 0, LockMode::Discard)?;
        for (i, texel) in texels.chunks_exact_mut(4).enumerate() {
            texel.copy_from_slice(&[(frame as u8).wrapping_add(i as u8), 0, 0, 255]);
        }
        streamed.unlock()?;

        in_flight.push_back(serials.into_iter().chain([streamed.last_upload()]).max().unwrap_or(0));
        device.end_frame()?;

        // The ring slot reused next frame was last read `depth` frames ago.
        if in_flight.len() >= options.depth as usize {
            if let Some(serial) = in_flight.pop_front() {
                device.transfer().wait_serial(serial)?;
            }
        }
        ring.reset();

        if frame > 0 && frame % 250 == 0 {
            let vram = device.allocator().vram();
            info!(
                "frame {frame}: {} used in {} blocks, {} constants this frame",
                format_bytes(vram.used),
                vram.block_count,
                format_bytes(ring.used())
            );
        }
    }

    let elapsed = start.elapsed();
    info!(
        "{} frames in {:.2?} ({:.3} ms/frame)",
        options.frames,
        elapsed,
        elapsed.as_secs_f64() * 1000.0 / options.frames.max(1) as f64
    );
    Ok(())
}

fn draw_constants(frame: u64, worker: usize, draw: usize) -> DrawConstants {
    let mut transform = [0.0; 16];
    for i in 0..4 {
        transform[i * 5] = 1.0;
    }
    transform[12] = draw as f32;
    transform[13] = worker as f32;
    transform[14] = frame as f32;
    DrawConstants {
        transform,
        color: [1.0, 0.5, 0.25, 1.0],
    }
}

fn mesh_vertices(frame: u64, worker: usize) -> Vec<[f32; 4]> {
    let phase = frame as f32 * 0.01 + worker as f32;
    (0..VERTICES_PER_MESH)
        .map(|i| {
            let t = i as f32 / VERTICES_PER_MESH as f32;
            [t, t.mul_add(std::f32::consts::TAU, phase).sin(), 0.0, 1.0]
        })
        .collect()
}

fn print_help() {
    eprintln!(
        "Stratum frame-loop benchmark

USAGE:
    cargo run -p stratum-bench --release -- [OPTIONS]

OPTIONS:
    --frames <N>    Frames to run (default: 1000)
    --workers <N>   Parallel recording workers (default: 4)
    --draws <N>     Constant blocks per worker and frame (default: 64)
    --depth <N>     Frames in flight (default: 3)
    --constrained   Use the memory-constrained allocator preset
    --vulkan        Run on the first suitable Vulkan GPU instead of the headless device
    -h, --help      Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG        Set log level (e.g., info, debug, trace)"
    );
}
