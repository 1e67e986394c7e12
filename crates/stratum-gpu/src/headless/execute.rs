//! Command execution and validation for the headless backend.

use super::{PendingSubmission, QueueOwnership, RecordState, State};
use crate::backend::{
    Barrier, BarrierTarget, BufferCopy, BufferId, BufferImageCopy, Command, DeviceProperties,
    ImageCopy, ImageId, ImageLayout, Ownership,
};
use stratum_core::Format;

impl QueueOwnership {
    fn use_on(&mut self, family: u32) -> Result<(), String> {
        if let Some(to) = self.released_to {
            return Err(format!(
                "used on family {family} after release to family {to} without acquire"
            ));
        }
        match self.owner {
            Some(owner) if owner != family => Err(format!(
                "used on family {family} while owned by family {owner}"
            )),
            _ => {
                self.owner = Some(family);
                Ok(())
            }
        }
    }

    fn discard(&mut self, family: u32) {
        self.owner = Some(family);
        self.released_to = None;
    }

    fn release(&mut self, family: u32, from: u32, to: u32) -> Result<(), String> {
        if family != from {
            return Err(format!(
                "release from family {from} recorded on family {family}"
            ));
        }
        if self.released_to.is_some() {
            return Err("released twice without acquire".to_string());
        }
        if let Some(owner) = self.owner {
            if owner != from {
                return Err(format!(
                    "released by family {from} while owned by family {owner}"
                ));
            }
        }
        self.released_to = Some(to);
        Ok(())
    }

    fn acquire(&mut self, family: u32, from: u32, to: u32) -> Result<(), String> {
        if family != to {
            return Err(format!("acquire for family {to} recorded on family {family}"));
        }
        if self.released_to != Some(to) {
            return Err(format!(
                "acquire on family {to} without a matching release from family {from}"
            ));
        }
        self.owner = Some(to);
        self.released_to = None;
        Ok(())
    }
}

/// Byte offsets of the rows a copy region covers inside a tightly packed
/// subresource, and the packed row length.
fn region_rows(
    format: Format,
    subresource_width: u32,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> (Vec<u64>, u64) {
    let (block_w, block_h) = format.block_extent();
    let block_size = u64::from(format.block_size());
    let pitch = u64::from(subresource_width.div_ceil(block_w)) * block_size;
    let row_bytes = u64::from(width.div_ceil(block_w)) * block_size;
    let first_row = u64::from(y / block_h);
    let column = u64::from(x / block_w) * block_size;
    let rows = (0..u64::from(height.div_ceil(block_h)))
        .map(|row| (first_row + row) * pitch + column)
        .collect();
    (rows, row_bytes)
}

impl State {
    pub(super) fn execute(&mut self, properties: &DeviceProperties, pending: PendingSubmission) {
        let family = properties.family(pending.queue);
        let submission = pending.submission;

        for (semaphore, _) in &submission.wait_semaphores {
            match self.semaphores.get_mut(&semaphore.0) {
                Some(sim) if sim.signaled => sim.signaled = false,
                _ => self.violation(format!(
                    "semaphore {} waited on before it was signaled",
                    semaphore.0
                )),
            }
        }

        for cmd in &submission.command_buffers {
            let commands = match self.command_buffers.get_mut(&cmd.0) {
                Some(sim) => {
                    sim.state = RecordState::Executable;
                    sim.commands.clone()
                }
                None => {
                    self.violation(format!("command buffer {} destroyed before execution", cmd.0));
                    continue;
                }
            };
            for command in &commands {
                self.execute_command(family, command);
            }
        }

        for semaphore in &submission.signal_semaphores {
            if let Some(sim) = self.semaphores.get_mut(&semaphore.0) {
                sim.pending_signals = sim.pending_signals.saturating_sub(1);
                sim.signaled = true;
            }
        }
        if let Some(fence) = submission.fence {
            if let Some(signaled) = self.fences.get_mut(&fence.0) {
                *signaled = true;
            }
        }
    }

    fn execute_command(&mut self, family: u32, command: &Command) {
        match command {
            Command::CopyBuffer { src, dst, regions } => {
                self.copy_buffer(family, *src, *dst, regions);
            }
            Command::CopyBufferToImage {
                src,
                dst,
                format,
                regions,
            } => self.copy_buffer_image(family, *src, *dst, *format, regions, true),
            Command::CopyImageToBuffer {
                src,
                dst,
                format,
                regions,
            } => self.copy_buffer_image(family, *dst, *src, *format, regions, false),
            Command::CopyImage {
                src,
                dst,
                format,
                regions,
            } => self.copy_image(family, *src, *dst, *format, regions),
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    self.barrier(family, barrier);
                }
            }
        }
    }

    /// Validate queue use of a buffer and return its bound base pointer and size.
    fn use_buffer(&mut self, family: u32, buffer: BufferId) -> Option<(*mut u8, u64)> {
        let Some(sim) = self.buffers.get_mut(&buffer.0) else {
            self.violation(format!("buffer {} destroyed before execution", buffer.0));
            return None;
        };
        let size = sim.info.size;
        let binding = sim.binding;
        let ownership = if sim.info.concurrent {
            Ok(())
        } else {
            sim.ownership.use_on(family)
        };
        let name = sim.name.clone();
        if let Err(message) = ownership {
            self.violation(format!("buffer '{name}' {message}"));
        }
        let Some((memory, offset)) = binding else {
            self.violation(format!("buffer '{name}' used without memory"));
            return None;
        };
        let ptr = self.bytes_at(memory, offset, size);
        if ptr.is_none() {
            self.violation(format!("buffer '{name}' memory was freed"));
        }
        ptr.map(|ptr| (ptr, size))
    }

    fn use_image(
        &mut self,
        family: u32,
        image: ImageId,
        expected: ImageLayout,
    ) -> Option<(*mut u8, crate::backend::ImageInfo)> {
        let Some(sim) = self.images.get_mut(&image.0) else {
            self.violation(format!("image {} destroyed before execution", image.0));
            return None;
        };
        let ownership = sim.ownership.use_on(family);
        let layout = sim.layout;
        let info = sim.info;
        let binding = sim.binding;
        let name = sim.name.clone();
        if let Err(message) = ownership {
            self.violation(format!("image '{name}' {message}"));
        }
        if layout != expected && layout != ImageLayout::General {
            self.violation(format!(
                "image '{name}' used as {expected:?} while in layout {layout:?}"
            ));
        }
        let Some((memory, offset)) = binding else {
            self.violation(format!("image '{name}' used without memory"));
            return None;
        };
        let ptr = self.bytes_at(memory, offset, info.linear_size());
        if ptr.is_none() {
            self.violation(format!("image '{name}' memory was freed"));
        }
        ptr.map(|ptr| (ptr, info))
    }

    fn copy_buffer(&mut self, family: u32, src: BufferId, dst: BufferId, regions: &[BufferCopy]) {
        let Some((src_ptr, src_size)) = self.use_buffer(family, src) else {
            return;
        };
        let Some((dst_ptr, dst_size)) = self.use_buffer(family, dst) else {
            return;
        };
        for region in regions {
            if region.src_offset + region.size > src_size || region.dst_offset + region.size > dst_size
            {
                self.violation(format!("buffer copy {region:?} out of bounds"));
                continue;
            }
            // SAFETY: both ranges were bounds checked against live memory.
            unsafe {
                std::ptr::copy(
                    src_ptr.add(region.src_offset as usize),
                    dst_ptr.add(region.dst_offset as usize),
                    region.size as usize,
                );
            }
        }
    }

    fn copy_buffer_image(
        &mut self,
        family: u32,
        buffer: BufferId,
        image: ImageId,
        format: Format,
        regions: &[BufferImageCopy],
        to_image: bool,
    ) {
        let Some((buffer_ptr, buffer_size)) = self.use_buffer(family, buffer) else {
            return;
        };
        let expected = if to_image {
            ImageLayout::TransferDst
        } else {
            ImageLayout::TransferSrc
        };
        let Some((image_ptr, info)) = self.use_image(family, image, expected) else {
            return;
        };
        if info.format != format {
            self.violation(format!(
                "copy format {format:?} does not match image format {:?}",
                info.format
            ));
            return;
        }
        let footprints = info.footprints();
        for region in regions {
            let Some(footprint) = footprints
                .iter()
                .find(|f| f.mip_level == region.mip_level && f.array_layer == region.array_layer)
            else {
                self.violation(format!("copy region {region:?} names a missing subresource"));
                continue;
            };
            if region.x + region.width > footprint.width || region.y + region.height > footprint.height {
                self.violation(format!("copy region {region:?} exceeds the subresource"));
                continue;
            }
            let (rows, row_bytes) = region_rows(
                format,
                footprint.width,
                region.x,
                region.y,
                region.width,
                region.height,
            );
            if region.buffer_offset + row_bytes * rows.len() as u64 > buffer_size {
                self.violation(format!("copy region {region:?} overruns the buffer"));
                continue;
            }
            for (i, row_offset) in rows.iter().enumerate() {
                let buffer_offset = (region.buffer_offset + i as u64 * row_bytes) as usize;
                let image_offset = (footprint.offset + row_offset) as usize;
                // SAFETY: both rows lie inside the checked buffer and subresource.
                unsafe {
                    if to_image {
                        std::ptr::copy(
                            buffer_ptr.add(buffer_offset),
                            image_ptr.add(image_offset),
                            row_bytes as usize,
                        );
                    } else {
                        std::ptr::copy(
                            image_ptr.add(image_offset),
                            buffer_ptr.add(buffer_offset),
                            row_bytes as usize,
                        );
                    }
                }
            }
        }
    }

    fn copy_image(
        &mut self,
        family: u32,
        src: ImageId,
        dst: ImageId,
        format: Format,
        regions: &[ImageCopy],
    ) {
        let Some((src_ptr, src_info)) = self.use_image(family, src, ImageLayout::TransferSrc) else {
            return;
        };
        let Some((dst_ptr, dst_info)) = self.use_image(family, dst, ImageLayout::TransferDst) else {
            return;
        };
        if src_info.format != format || dst_info.format != format {
            self.violation(format!("image copy with mismatched format {format:?}"));
            return;
        }
        let src_footprints = src_info.footprints();
        let dst_footprints = dst_info.footprints();
        for region in regions {
            let src_fp = src_footprints.iter().find(|f| {
                f.mip_level == region.src_mip_level && f.array_layer == region.src_array_layer
            });
            let dst_fp = dst_footprints.iter().find(|f| {
                f.mip_level == region.dst_mip_level && f.array_layer == region.dst_array_layer
            });
            let (Some(src_fp), Some(dst_fp)) = (src_fp, dst_fp) else {
                self.violation(format!("image copy {region:?} names a missing subresource"));
                continue;
            };
            let fits = |w: u32, h: u32| region.width <= w && region.height <= h;
            if !fits(src_fp.width, src_fp.height) || !fits(dst_fp.width, dst_fp.height) {
                self.violation(format!("image copy {region:?} exceeds a subresource"));
                continue;
            }
            let (src_rows, row_bytes) =
                region_rows(format, src_fp.width, 0, 0, region.width, region.height);
            let (dst_rows, _) = region_rows(format, dst_fp.width, 0, 0, region.width, region.height);
            for (src_row, dst_row) in src_rows.iter().zip(&dst_rows) {
                // SAFETY: rows lie inside the checked subresources.
                unsafe {
                    std::ptr::copy(
                        src_ptr.add((src_fp.offset + src_row) as usize),
                        dst_ptr.add((dst_fp.offset + dst_row) as usize),
                        row_bytes as usize,
                    );
                }
            }
        }
    }

    fn barrier(&mut self, family: u32, barrier: &Barrier) {
        match barrier.target {
            BarrierTarget::Buffer { buffer, .. } => {
                let Some(sim) = self.buffers.get_mut(&buffer.0) else {
                    self.violation(format!("barrier on destroyed buffer {}", buffer.0));
                    return;
                };
                if sim.info.concurrent {
                    return;
                }
                let result = match barrier.ownership {
                    Ownership::Keep if barrier.discard_contents => {
                        sim.ownership.discard(family);
                        Ok(())
                    }
                    Ownership::Keep => sim.ownership.use_on(family),
                    Ownership::Release { from, to } => sim.ownership.release(family, from, to),
                    Ownership::Acquire { from, to } => sim.ownership.acquire(family, from, to),
                };
                if let Err(message) = result {
                    let name = sim.name.clone();
                    self.violation(format!("buffer '{name}' barrier {message}"));
                }
            }
            BarrierTarget::Image {
                image,
                old_layout,
                new_layout,
                ..
            } => {
                let Some(sim) = self.images.get_mut(&image.0) else {
                    self.violation(format!("barrier on destroyed image {}", image.0));
                    return;
                };
                let mut problems = Vec::new();
                if old_layout != ImageLayout::Undefined && sim.layout != old_layout {
                    problems.push(format!(
                        "expects layout {old_layout:?} but image is in {:?}",
                        sim.layout
                    ));
                }
                let result = match barrier.ownership {
                    Ownership::Keep if barrier.discard_contents => {
                        sim.ownership.discard(family);
                        sim.layout = new_layout;
                        Ok(())
                    }
                    Ownership::Keep => {
                        sim.layout = new_layout;
                        sim.ownership.use_on(family)
                    }
                    // The layout transition happens once, with the acquire.
                    Ownership::Release { from, to } => sim.ownership.release(family, from, to),
                    Ownership::Acquire { from, to } => {
                        sim.layout = new_layout;
                        sim.ownership.acquire(family, from, to)
                    }
                };
                if let Err(message) = result {
                    problems.push(message);
                }
                if !problems.is_empty() {
                    let name = sim.name.clone();
                    for problem in problems {
                        self.violation(format!("image '{name}' barrier {problem}"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_requires_matching_release() {
        let mut ownership = QueueOwnership::default();
        ownership.discard(1);
        assert!(ownership.use_on(0).is_err());
        assert!(ownership.release(1, 1, 0).is_ok());
        assert!(ownership.use_on(1).is_err());
        assert!(ownership.acquire(0, 1, 0).is_ok());
        assert!(ownership.use_on(0).is_ok());
        assert!(ownership.acquire(0, 1, 0).is_err());
    }

    #[test]
    fn unowned_resources_are_claimed_by_first_use() {
        let mut ownership = QueueOwnership::default();
        assert!(ownership.use_on(0).is_ok());
        assert_eq!(ownership.owner, Some(0));
    }

    #[test]
    fn region_rows_follow_block_layout() {
        let (rows, row_bytes) = region_rows(Format::Rgba8Unorm, 8, 2, 1, 4, 2);
        assert_eq!(row_bytes, 16);
        assert_eq!(rows, vec![32 + 8, 64 + 8]);

        let (rows, row_bytes) = region_rows(Format::Bc1RgbaUnorm, 8, 0, 0, 8, 8);
        assert_eq!(row_bytes, 16);
        assert_eq!(rows, vec![0, 16]);
    }
}
