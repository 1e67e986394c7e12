//! Logical textures.

use super::{host_count, remote_count, HostCopies};
use crate::backend::{BufferInfo, BufferUsage, ImageCopy, ImageInfo, ImageLayout, ImageUsage};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::AllocationPolicy;
use crate::native::{GpuBuffer, GpuImage};
use crate::transfer::{Load, UploadPath};
use std::sync::Arc;
use stratum_core::format::full_mip_count;
use stratum_core::{Format, LockMode, Pool, ResourceType, Usage};

/// Texels of the fallback texture.
const PLACEHOLDER_TEXEL: [u8; 4] = [255, 0, 255, 255];

/// Description of a logical texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// 0 selects the full mip chain.
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub usage: Usage,
    pub pool: Pool,
    pub render_target: bool,
}

impl TextureDesc {
    pub fn new(name: impl Into<String>, width: u32, height: u32, format: Format) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage: Usage::empty(),
            pool: Pool::Default,
            render_target: false,
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = pool;
        self
    }

    pub fn as_render_target(mut self) -> Self {
        self.render_target = true;
        self
    }

    fn image_info(&self) -> ImageInfo {
        let mut usage = ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED;
        if self.render_target {
            usage |= if self.format.is_depth() {
                ImageUsage::DEPTH_STENCIL_ATTACHMENT
            } else {
                ImageUsage::COLOR_ATTACHMENT
            };
        }
        ImageInfo {
            width: self.width,
            height: self.height,
            mip_levels: if self.mip_levels == 0 {
                full_mip_count(self.width, self.height)
            } else {
                self.mip_levels
            },
            array_layers: self.array_layers,
            format: self.format,
            usage,
        }
    }

    const fn resource_type(&self) -> ResourceType {
        if self.render_target {
            ResourceType::RenderTarget
        } else {
            ResourceType::Texture
        }
    }
}

/// A texture with its device copies and staging copies.
///
/// Staging memory holds every subresource tightly packed, layer-major then
/// mip, the layout [`ImageInfo::footprints`] describes.
pub struct Texture {
    device: Device,
    desc: TextureDesc,
    info: ImageInfo,
    remotes: Vec<Arc<GpuImage>>,
    hosts: HostCopies,
    last_upload: u64,
}

impl Texture {
    /// Create the texture. `initial` must cover every subresource.
    pub fn new(device: &Device, desc: TextureDesc, initial: Option<&[u8]>) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "texture '{}' has zero size ({}x{}x{})",
                desc.name, desc.width, desc.height, desc.array_layers
            )));
        }
        let info = desc.image_info();
        let linear_size = info.linear_size();
        if let Some(data) = initial {
            if data.len() as u64 != linear_size {
                return Err(GpuError::InvalidArgument(format!(
                    "texture '{}' needs {linear_size} bytes of initial data, got {}",
                    desc.name,
                    data.len()
                )));
            }
        }

        let depth = device.frame_queue_depth();
        let count = remote_count(desc.usage, depth);
        let ty = desc.resource_type();
        let mut remotes = Vec::with_capacity(count);
        for i in 0..count {
            let name = if count == 1 {
                desc.name.clone()
            } else {
                format!("{}[{i}]", desc.name)
            };
            remotes.push(GpuImage::new(
                device.allocator(),
                &name,
                ty,
                info,
                AllocationPolicy::gpu_only().with_dedicated(desc.render_target),
            )?);
        }
        let hosts = HostCopies::new(
            device,
            &desc.name,
            ty,
            linear_size,
            host_count(desc.usage, desc.pool, depth),
        )?;

        let mut texture = Self {
            device: device.clone(),
            desc,
            info,
            remotes,
            hosts,
            last_upload: 0,
        };
        if let Some(data) = initial {
            texture.upload_initial(data)?;
        }
        Ok(texture)
    }

    /// Decode an encoded image into an RGBA8 texture.
    ///
    /// Bytes that fail to decode produce the placeholder texture.
    pub fn from_bytes(device: &Device, name: &str, bytes: &[u8]) -> Result<Self> {
        match image::load_from_memory(bytes) {
            Ok(decoded) => {
                let rgba = decoded.to_rgba8();
                let desc = TextureDesc::new(name, rgba.width(), rgba.height(), Format::Rgba8Unorm);
                Self::new(device, desc, Some(rgba.as_raw()))
            }
            Err(e) => {
                tracing::warn!("Failed to decode texture '{name}', using placeholder: {e}");
                Self::placeholder(device)
            }
        }
    }

    /// A 1x1 magenta texture.
    pub fn placeholder(device: &Device) -> Result<Self> {
        Self::new(
            device,
            TextureDesc::new("placeholder", 1, 1, Format::Rgba8Unorm),
            Some(&PLACEHOLDER_TEXEL),
        )
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
        self.hosts.fill(data)?;

        for remote in &self.remotes {
            self.last_upload = self.device.transfer().add(Load::CopyToImage {
                src: Arc::clone(&staging),
                dst: Arc::clone(remote),
                regions: self.info.full_copy_regions(),
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
    pub const fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    /// Native image parameters, with the mip count resolved.
    #[inline]
    pub const fn info(&self) -> &ImageInfo {
        &self.info
    }

    #[inline]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    #[inline]
    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    #[inline]
    pub const fn last_upload(&self) -> u64 {
        self.last_upload
    }

    /// Device copy the current frame reads.
    pub fn remote(&self) -> &Arc<GpuImage> {
        let index = self.device.frame_index() % self.remotes.len() as u64;
        &self.remotes[index as usize]
    }

    pub fn remotes(&self) -> &[Arc<GpuImage>] {
        &self.remotes
    }

    /// Map a byte range of the current frame's staging image.
    pub fn lock(&mut self, offset: u64, size: u64, mode: LockMode) -> Result<&mut [u8]> {
        self.hosts
            .lock(&self.device, &self.desc.name, offset, size, mode)
    }

    /// Enqueue the upload of the staging image to the current device copy.
    pub fn unlock(&mut self) -> Result<()> {
        let Some(locked) = self.hosts.unlock(&self.desc.name)? else {
            return Ok(());
        };
        let load = Load::CopyToImage {
            src: Arc::clone(self.hosts.slot(locked.slot)),
            dst: Arc::clone(self.remote()),
            regions: self.info.full_copy_regions(),
            path: if self.desc.usage.contains(Usage::DYNAMIC) {
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

    /// Copy every subresource of `src` into every device copy.
    pub fn copy_from(&mut self, src: &Self) -> Result<u64> {
        if src.info.width != self.info.width
            || src.info.height != self.info.height
            || src.info.format != self.info.format
            || src.info.mip_levels != self.info.mip_levels
            || src.info.array_layers != self.info.array_layers
        {
            return Err(GpuError::InvalidArgument(format!(
                "cannot copy '{}' into '{}': shapes differ",
                src.desc.name, self.desc.name
            )));
        }
        let regions: Vec<ImageCopy> = self
            .info
            .footprints()
            .into_iter()
            .map(|f| ImageCopy {
                src_mip_level: f.mip_level,
                src_array_layer: f.array_layer,
                dst_mip_level: f.mip_level,
                dst_array_layer: f.array_layer,
                width: f.width,
                height: f.height,
            })
            .collect();
        for remote in &self.remotes {
            self.last_upload = self.device.transfer().add(Load::CopyImageToImage {
                src: Arc::clone(src.remote()),
                dst: Arc::clone(remote),
                regions: regions.clone(),
            });
        }
        Ok(self.last_upload)
    }

    /// Copy the current device copy into host-readable memory.
    pub fn read_back(&self) -> Result<Readback> {
        let buffer = GpuBuffer::new(
            self.device.allocator(),
            &format!("{} (readback)", self.desc.name),
            ResourceType::Staging,
            BufferInfo {
                size: self.info.linear_size(),
                usage: BufferUsage::TRANSFER_DST,
                concurrent: true,
            },
            AllocationPolicy::gpu_to_cpu(),
        )?;
        let serial = self.device.transfer().add(Load::CopyImageToData {
            src: Arc::clone(self.remote()),
            dst: Arc::clone(&buffer),
            regions: self.info.full_copy_regions(),
        });
        Ok(Readback {
            device: self.device.clone(),
            buffer,
            serial,
        })
    }

    /// Move every device copy into `layout`.
    pub fn transition(&self, layout: ImageLayout) -> u64 {
        let mut serial = 0;
        for remote in &self.remotes {
            serial = self.device.transfer().add(Load::TransitionImage {
                image: Arc::clone(remote),
                layout,
            });
        }
        serial
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("desc", &self.desc)
            .field("remotes", &self.remotes.len())
            .field("hosts", &self.hosts.len())
            .finish_non_exhaustive()
    }
}

/// Texture contents on their way back to the host.
pub struct Readback {
    device: Device,
    buffer: Arc<GpuBuffer>,
    serial: u64,
}

impl Readback {
    /// Serial of the flush carrying the copy.
    #[inline]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether the copy has finished, without blocking.
    pub fn is_ready(&self) -> Result<bool> {
        self.device.transfer().is_complete(self.serial)
    }

    /// Block until the copy has finished, flushing it first if needed.
    pub fn wait(&self) -> Result<()> {
        let transfer = self.device.transfer();
        if !transfer.is_flushed(self.serial) {
            transfer.flush()?;
        }
        transfer.wait_serial(self.serial)
    }

    /// The tightly packed texture contents.
    pub fn data(&self) -> Result<Vec<u8>> {
        self.wait()?;
        self.buffer.read_bytes(0, self.buffer.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use stratum_core::DeviceConfig;

    fn device() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone(), DeviceConfig::default()).unwrap();
        (backend, device)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([x as u8, y as u8, 7, 255])
        });
        let mut bytes = std::io::Cursor::new(Vec::new());
        image.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn decodes_png() {
        let (backend, device) = device();
        let texture = Texture::from_bytes(&device, "gradient", &png(4, 2)).unwrap();
        assert_eq!((texture.info().width, texture.info().height), (4, 2));
        device.flush().unwrap();
        device.wait().unwrap();
        let pixels = backend.read_image(texture.remote().id()).unwrap();
        assert_eq!(&pixels[4..8], &[1, 0, 7, 255]);
        assert_eq!(
            backend.image_state(texture.remote().id()).unwrap().0,
            ImageLayout::ShaderReadOnly
        );
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn corrupt_bytes_fall_back_to_placeholder() {
        let (_backend, device) = device();
        let texture = Texture::from_bytes(&device, "broken", b"definitely not a png").unwrap();
        assert_eq!(texture.name(), "placeholder");
        assert_eq!((texture.info().width, texture.info().height), (1, 1));
    }

    #[test]
    fn rejects_bad_sizes() {
        let (_backend, device) = device();
        let zero = TextureDesc::new("zero", 0, 4, Format::R8Unorm);
        assert!(matches!(
            Texture::new(&device, zero, None),
            Err(GpuError::InvalidArgument(_))
        ));
        let short = TextureDesc::new("short", 4, 4, Format::R8Unorm);
        assert!(Texture::new(&device, short, Some(&[0; 8])).is_err());
    }

    #[test]
    fn full_mip_chain_staging_size() {
        let (_backend, device) = device();
        let desc = TextureDesc::new("mips", 8, 8, Format::R8Unorm)
            .with_mip_levels(0)
            .with_usage(Usage::DYNAMIC);
        let mut texture = Texture::new(&device, desc, None).unwrap();
        assert_eq!(texture.info().mip_levels, 4);
        assert_eq!(texture.lock(0, 0, LockMode::Discard).unwrap().len(), 64 + 16 + 4 + 1);
        texture.unlock().unwrap();
    }

    #[test]
    fn copy_and_read_back() {
        let (backend, device) = device();
        let data: Vec<u8> = (0..16u8).collect();
        let src = Texture::new(
            &device,
            TextureDesc::new("src", 2, 2, Format::Rgba8Unorm),
            Some(&data),
        )
        .unwrap();
        let mut dst = Texture::new(&device, TextureDesc::new("dst", 2, 2, Format::Rgba8Unorm), None)
            .unwrap();
        dst.copy_from(&src).unwrap();
        let readback = dst.read_back().unwrap();
        assert_eq!(readback.data().unwrap(), data);
        assert!(readback.is_ready().unwrap());

        let other = Texture::new(&device, TextureDesc::new("other", 4, 4, Format::Rgba8Unorm), None)
            .unwrap();
        assert!(dst.copy_from(&other).is_err());
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }
}
