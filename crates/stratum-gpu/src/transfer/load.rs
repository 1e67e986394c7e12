//! Deferred copy and transition operations.

use crate::backend::{
    Access, Backend, Barrier, BarrierTarget, BufferCopy, BufferImageCopy, Command,
    CommandBufferId, ImageCopy, ImageLayout, Ownership, QueueKind,
};
use crate::error::{GpuError, Result};
use crate::native::{GpuBuffer, GpuImage, TrackedState};
use std::collections::HashSet;
use std::sync::Arc;

/// Queue an upload is recorded on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UploadPath {
    /// The transfer queue, handing ownership to graphics afterwards.
    #[default]
    Transfer,
    /// Directly on the graphics queue with an in-queue barrier.
    Graphics,
}

/// A copy or layout transition waiting to be recorded by the transfer queue.
///
/// Holds strong references to every native object involved, so staging
/// memory and destinations stay alive until the generation that carries the
/// load has been waited on.
pub enum Load {
    CopyToBuffer {
        src: Arc<GpuBuffer>,
        dst: Arc<GpuBuffer>,
        regions: Vec<BufferCopy>,
        path: UploadPath,
    },
    CopyToImage {
        src: Arc<GpuBuffer>,
        dst: Arc<GpuImage>,
        regions: Vec<BufferImageCopy>,
        path: UploadPath,
    },
    CopyImageToImage {
        src: Arc<GpuImage>,
        dst: Arc<GpuImage>,
        regions: Vec<ImageCopy>,
    },
    CopyImageToData {
        src: Arc<GpuImage>,
        dst: Arc<GpuBuffer>,
        regions: Vec<BufferImageCopy>,
    },
    TransitionImage {
        image: Arc<GpuImage>,
        layout: ImageLayout,
    },
}

impl std::fmt::Debug for Load {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CopyToBuffer { src, dst, path, .. } => f
                .debug_struct("CopyToBuffer")
                .field("src", &src.id())
                .field("dst", &dst.id())
                .field("path", path)
                .finish(),
            Self::CopyToImage { src, dst, path, .. } => f
                .debug_struct("CopyToImage")
                .field("src", &src.id())
                .field("dst", &dst.id())
                .field("path", path)
                .finish(),
            Self::CopyImageToImage { src, dst, .. } => f
                .debug_struct("CopyImageToImage")
                .field("src", &src.id())
                .field("dst", &dst.id())
                .finish(),
            Self::CopyImageToData { src, dst, .. } => f
                .debug_struct("CopyImageToData")
                .field("src", &src.id())
                .field("dst", &dst.id())
                .finish(),
            Self::TransitionImage { image, layout } => f
                .debug_struct("TransitionImage")
                .field("image", &image.id())
                .field("layout", layout)
                .finish(),
        }
    }
}

/// Tracked owner and layout of every resource a batch records commands for.
pub(crate) struct Snapshot(Vec<Tracked>);

enum Tracked {
    Buffer(Arc<GpuBuffer>, TrackedState),
    Image(Arc<GpuImage>, TrackedState),
}

impl Snapshot {
    pub fn take(loads: &[Load]) -> Self {
        let buffer = |b: &Arc<GpuBuffer>| Tracked::Buffer(Arc::clone(b), b.tracked());
        let image = |i: &Arc<GpuImage>| Tracked::Image(Arc::clone(i), i.state());
        let mut tracked = Vec::with_capacity(loads.len() * 2);
        for load in loads {
            match load {
                Load::CopyToBuffer { dst, .. } => tracked.push(buffer(dst)),
                Load::CopyToImage { dst, .. } => tracked.push(image(dst)),
                Load::CopyImageToImage { src, dst, .. } => {
                    tracked.push(image(src));
                    tracked.push(image(dst));
                }
                Load::CopyImageToData { src, .. } => tracked.push(image(src)),
                Load::TransitionImage { image: target, .. } => tracked.push(image(target)),
            }
        }
        Self(tracked)
    }

    /// Put every resource back the way it was when the snapshot was taken.
    pub fn restore(self) {
        for tracked in self.0 {
            match tracked {
                Tracked::Buffer(buffer, state) => buffer.restore(state),
                Tracked::Image(image, state) => image.restore(state),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Touched {
    Buffer(u64),
    Image(u64),
}

/// Records loads into one generation's command buffer pair.
pub(crate) struct Recorder<'a> {
    backend: &'a dyn Backend,
    graphics_cmd: CommandBufferId,
    transfer_cmd: CommandBufferId,
    graphics_family: u32,
    transfer_family: u32,
    pub used_graphics: bool,
    pub used_transfer: bool,
    /// Resources read or written on the graphics command buffer so far.
    graphics_touched: HashSet<Touched>,
}

impl<'a> Recorder<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        graphics_cmd: CommandBufferId,
        transfer_cmd: CommandBufferId,
    ) -> Self {
        let properties = backend.properties();
        Self {
            backend,
            graphics_cmd,
            transfer_cmd,
            graphics_family: properties.graphics_family,
            transfer_family: properties.transfer_family,
            used_graphics: false,
            used_transfer: false,
            graphics_touched: HashSet::new(),
        }
    }

    const fn cross_queue(&self) -> bool {
        self.graphics_family != self.transfer_family
    }

    const fn family(&self, queue: QueueKind) -> u32 {
        match queue {
            QueueKind::Graphics => self.graphics_family,
            QueueKind::Transfer => self.transfer_family,
        }
    }

    fn record(&mut self, queue: QueueKind, command: &Command) -> Result<()> {
        let cmd = match queue {
            QueueKind::Graphics => {
                self.used_graphics = true;
                self.graphics_cmd
            }
            QueueKind::Transfer => {
                self.used_transfer = true;
                self.transfer_cmd
            }
        };
        self.backend.record(cmd, command)
    }

    fn barrier(&mut self, queue: QueueKind, barrier: Barrier) -> Result<()> {
        self.record(queue, &Command::Barrier(vec![barrier]))
    }

    /// Queue a write to `target` should be recorded on.
    ///
    /// A transfer-path write falls back to graphics when the graphics command
    /// buffer already touched the destination in this generation (the
    /// transfer submission runs first and would reorder the writes) or when a
    /// partial write has to preserve contents the graphics family owns.
    fn route(&self, path: UploadPath, target: Touched, whole: bool, owner: Option<u32>) -> QueueKind {
        if path == UploadPath::Graphics || self.graphics_touched.contains(&target) {
            return QueueKind::Graphics;
        }
        if !whole && self.cross_queue() && owner == Some(self.graphics_family) {
            return QueueKind::Graphics;
        }
        QueueKind::Transfer
    }

    /// Whether a write on `queue` left commands for its destination on the
    /// graphics command buffer, either the write itself or the acquire.
    const fn acquired_on_graphics(&self, queue: QueueKind) -> bool {
        matches!(queue, QueueKind::Graphics) || self.cross_queue()
    }

    /// Barriers finishing a write on `queue`; hands ownership to graphics when
    /// the write ran on a separate transfer family.
    fn finish_write(&mut self, queue: QueueKind, target: BarrierTarget) -> Result<()> {
        let dst_access = Access::ShaderRead;
        if queue == QueueKind::Transfer && self.cross_queue() {
            let from = self.transfer_family;
            let to = self.graphics_family;
            self.barrier(
                QueueKind::Transfer,
                Barrier {
                    target,
                    src: Access::TransferWrite,
                    dst: Access::None,
                    ownership: Ownership::Release { from, to },
                    discard_contents: false,
                },
            )?;
            self.barrier(
                QueueKind::Graphics,
                Barrier {
                    target,
                    src: Access::None,
                    dst: dst_access,
                    ownership: Ownership::Acquire { from, to },
                    discard_contents: false,
                },
            )
        } else {
            self.barrier(
                queue,
                Barrier {
                    target,
                    src: Access::TransferWrite,
                    dst: dst_access,
                    ownership: Ownership::Keep,
                    discard_contents: false,
                },
            )
        }
    }

    fn copy_to_buffer(
        &mut self,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        regions: &[BufferCopy],
        path: UploadPath,
    ) -> Result<()> {
        let touched = Touched::Buffer(dst.id().0);
        let whole = covers_buffer(regions, dst.size());
        let queue = self.route(path, touched, whole, dst.owner());
        let target = BarrierTarget::Buffer {
            buffer: dst.id(),
            offset: 0,
            size: dst.size(),
        };

        // Pre: wait for earlier reads; contents are dropped for full overwrites.
        self.barrier(
            queue,
            Barrier {
                target,
                src: if queue == QueueKind::Graphics {
                    Access::All
                } else {
                    Access::None
                },
                dst: Access::TransferWrite,
                ownership: Ownership::Keep,
                discard_contents: whole,
            },
        )?;
        self.record(
            queue,
            &Command::CopyBuffer {
                src: src.id(),
                dst: dst.id(),
                regions: regions.to_vec(),
            },
        )?;
        self.finish_write(queue, target)?;

        dst.set_owner(self.graphics_family);
        if self.acquired_on_graphics(queue) {
            self.graphics_touched.insert(touched);
        }
        Ok(())
    }

    fn copy_to_image(
        &mut self,
        src: &GpuBuffer,
        dst: &GpuImage,
        regions: &[BufferImageCopy],
        path: UploadPath,
    ) -> Result<()> {
        let touched = Touched::Image(dst.id().0);
        let whole = covers_image(regions, dst);
        let state = dst.state();
        let queue = self.route(path, touched, whole, state.owner);
        let info = dst.info();
        let old_layout = if whole {
            ImageLayout::Undefined
        } else {
            state.layout
        };

        self.barrier(
            queue,
            Barrier {
                target: image_target(dst, old_layout, ImageLayout::TransferDst),
                src: if queue == QueueKind::Graphics {
                    Access::All
                } else {
                    Access::None
                },
                dst: Access::TransferWrite,
                ownership: Ownership::Keep,
                discard_contents: whole,
            },
        )?;
        self.record(
            queue,
            &Command::CopyBufferToImage {
                src: src.id(),
                dst: dst.id(),
                format: info.format,
                regions: regions.to_vec(),
            },
        )?;
        self.finish_write(
            queue,
            image_target(dst, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly),
        )?;

        dst.set_state(self.graphics_family, ImageLayout::ShaderReadOnly);
        if self.acquired_on_graphics(queue) {
            self.graphics_touched.insert(touched);
        }
        Ok(())
    }

    fn copy_image_to_image(
        &mut self,
        src: &GpuImage,
        dst: &GpuImage,
        regions: &[ImageCopy],
    ) -> Result<()> {
        let queue = QueueKind::Graphics;
        let src_layout = src.state().layout;
        self.record(
            queue,
            &Command::Barrier(vec![
                Barrier {
                    target: image_target(src, src_layout, ImageLayout::TransferSrc),
                    src: Access::All,
                    dst: Access::TransferRead,
                    ownership: Ownership::Keep,
                    discard_contents: false,
                },
                Barrier {
                    target: image_target(dst, ImageLayout::Undefined, ImageLayout::TransferDst),
                    src: Access::All,
                    dst: Access::TransferWrite,
                    ownership: Ownership::Keep,
                    discard_contents: true,
                },
            ]),
        )?;
        self.record(
            queue,
            &Command::CopyImage {
                src: src.id(),
                dst: dst.id(),
                format: dst.info().format,
                regions: regions.to_vec(),
            },
        )?;
        self.record(
            queue,
            &Command::Barrier(vec![
                Barrier {
                    target: image_target(src, ImageLayout::TransferSrc, ImageLayout::ShaderReadOnly),
                    src: Access::TransferRead,
                    dst: Access::ShaderRead,
                    ownership: Ownership::Keep,
                    discard_contents: false,
                },
                Barrier {
                    target: image_target(dst, ImageLayout::TransferDst, ImageLayout::ShaderReadOnly),
                    src: Access::TransferWrite,
                    dst: Access::ShaderRead,
                    ownership: Ownership::Keep,
                    discard_contents: false,
                },
            ]),
        )?;

        let family = self.family(queue);
        src.set_state(family, ImageLayout::ShaderReadOnly);
        dst.set_state(family, ImageLayout::ShaderReadOnly);
        self.graphics_touched.insert(Touched::Image(src.id().0));
        self.graphics_touched.insert(Touched::Image(dst.id().0));
        Ok(())
    }

    fn copy_image_to_data(
        &mut self,
        src: &GpuImage,
        dst: &GpuBuffer,
        regions: &[BufferImageCopy],
    ) -> Result<()> {
        let queue = QueueKind::Graphics;
        let src_layout = src.state().layout;
        self.barrier(
            queue,
            Barrier {
                target: image_target(src, src_layout, ImageLayout::TransferSrc),
                src: Access::All,
                dst: Access::TransferRead,
                ownership: Ownership::Keep,
                discard_contents: false,
            },
        )?;
        self.record(
            queue,
            &Command::CopyImageToBuffer {
                src: src.id(),
                dst: dst.id(),
                format: src.info().format,
                regions: regions.to_vec(),
            },
        )?;
        self.record(
            queue,
            &Command::Barrier(vec![
                Barrier {
                    target: image_target(src, ImageLayout::TransferSrc, ImageLayout::ShaderReadOnly),
                    src: Access::TransferRead,
                    dst: Access::ShaderRead,
                    ownership: Ownership::Keep,
                    discard_contents: false,
                },
                Barrier {
                    target: BarrierTarget::Buffer {
                        buffer: dst.id(),
                        offset: 0,
                        size: dst.size(),
                    },
                    src: Access::TransferWrite,
                    dst: Access::HostRead,
                    ownership: Ownership::Keep,
                    discard_contents: false,
                },
            ]),
        )?;

        src.set_state(self.family(queue), ImageLayout::ShaderReadOnly);
        self.graphics_touched.insert(Touched::Image(src.id().0));
        self.graphics_touched.insert(Touched::Buffer(dst.id().0));
        Ok(())
    }

    fn transition(&mut self, image: &GpuImage, layout: ImageLayout) -> Result<()> {
        let queue = QueueKind::Graphics;
        let current = image.state().layout;
        if current == layout {
            return Ok(());
        }
        self.barrier(
            queue,
            Barrier {
                target: image_target(image, current, layout),
                src: Access::All,
                dst: Access::All,
                ownership: Ownership::Keep,
                discard_contents: current == ImageLayout::Undefined,
            },
        )?;
        image.set_state(self.family(queue), layout);
        self.graphics_touched.insert(Touched::Image(image.id().0));
        Ok(())
    }
}

fn image_target(image: &GpuImage, old_layout: ImageLayout, new_layout: ImageLayout) -> BarrierTarget {
    let info = image.info();
    BarrierTarget::Image {
        image: image.id(),
        format: info.format,
        old_layout,
        new_layout,
        mip_levels: info.mip_levels,
        array_layers: info.array_layers,
    }
}

fn covers_buffer(regions: &[BufferCopy], size: u64) -> bool {
    let mut ranges: Vec<(u64, u64)> = regions
        .iter()
        .map(|r| (r.dst_offset, r.dst_offset + r.size))
        .collect();
    ranges.sort_unstable();
    let mut covered = 0;
    for (start, end) in ranges {
        if start > covered {
            return false;
        }
        covered = covered.max(end);
    }
    covered >= size
}

fn covers_image(regions: &[BufferImageCopy], image: &GpuImage) -> bool {
    image.info().footprints().iter().all(|f| {
        regions.iter().any(|r| {
            r.mip_level == f.mip_level
                && r.array_layer == f.array_layer
                && r.x == 0
                && r.y == 0
                && r.width >= f.width
                && r.height >= f.height
        })
    })
}

impl Load {
    /// Record the pre-barrier, the operation and the post-barrier.
    pub(crate) fn record(&self, recorder: &mut Recorder<'_>) -> Result<()> {
        match self {
            Self::CopyToBuffer {
                src,
                dst,
                regions,
                path,
            } => recorder.copy_to_buffer(src, dst, regions, *path),
            Self::CopyToImage {
                src,
                dst,
                regions,
                path,
            } => recorder.copy_to_image(src, dst, regions, *path),
            Self::CopyImageToImage { src, dst, regions } => {
                if Arc::ptr_eq(src, dst) {
                    return Err(GpuError::InvalidArgument(
                        "image copy onto itself".to_string(),
                    ));
                }
                recorder.copy_image_to_image(src, dst, regions)
            }
            Self::CopyImageToData { src, dst, regions } => {
                recorder.copy_image_to_data(src, dst, regions)
            }
            Self::TransitionImage { image, layout } => recorder.transition(image, *layout),
        }
    }
}
