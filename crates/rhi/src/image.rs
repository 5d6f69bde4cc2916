//! Image, sampler and layout descriptions.

use crate::error::{RhiError, RhiResult};

/// Width and height of a 2D surface in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized surface.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Extent of the next mip level: half of each side, never below one.
    #[inline]
    pub fn mip(&self, level: u32) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
        }
    }

    #[inline]
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

impl From<[u32; 2]> for Extent2D {
    fn from(value: [u32; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

/// Pixel formats used by the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8Srgb,
    Rgba8Unorm,
    Bgra8Srgb,
    D32Float,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ImageFormat::Rgba8Srgb
            | ImageFormat::Rgba8Unorm
            | ImageFormat::Bgra8Srgb
            | ImageFormat::D32Float => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, ImageFormat::D32Float)
    }
}

/// How an image will be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageUsage {
    /// Sampled in shaders, filled by transfer.
    Sampled,
    /// Depth attachment.
    DepthAttachment,
    /// Color attachment.
    ColorAttachment,
}

/// Image layouts tracked across barriers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    ShaderReadOnly,
    DepthAttachment,
    ColorAttachment,
    PresentSrc,
}

/// Creation parameters for a 2D image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: Extent2D,
    pub format: ImageFormat,
    pub mip_levels: u32,
    pub usage: ImageUsage,
    pub label: String,
}

impl ImageDesc {
    /// Describes a sampled texture with `mip_levels` levels.
    pub fn texture(extent: Extent2D, format: ImageFormat, mip_levels: u32, label: &str) -> Self {
        Self {
            extent,
            format,
            mip_levels,
            usage: ImageUsage::Sampled,
            label: label.to_string(),
        }
    }

    /// Describes a single-level depth attachment.
    pub fn depth(extent: Extent2D, label: &str) -> Self {
        Self {
            extent,
            format: ImageFormat::D32Float,
            mip_levels: 1,
            usage: ImageUsage::DepthAttachment,
            label: label.to_string(),
        }
    }

    /// Checks the description before it reaches the backend.
    pub fn validate(&self) -> RhiResult<()> {
        if self.extent.is_empty() {
            return Err(RhiError::InvalidUsage(format!(
                "Image '{}' has empty extent {}x{}",
                self.label, self.extent.width, self.extent.height
            )));
        }
        let max_levels = 32 - self.extent.width.max(self.extent.height).leading_zeros();
        if self.mip_levels == 0 || self.mip_levels > max_levels {
            return Err(RhiError::InvalidUsage(format!(
                "Image '{}' requests {} mip levels, at most {} allowed",
                self.label, self.mip_levels, max_levels
            )));
        }
        if (self.usage == ImageUsage::DepthAttachment) != self.format.is_depth() {
            return Err(RhiError::InvalidUsage(format!(
                "Image '{}' format {:?} does not match usage {:?}",
                self.label, self.format, self.usage
            )));
        }
        Ok(())
    }

    /// Total bytes across all mip levels.
    pub fn byte_size(&self) -> u64 {
        (0..self.mip_levels)
            .map(|level| {
                let e = self.extent.mip(level);
                e.width as u64 * e.height as u64 * self.format.bytes_per_pixel() as u64
            })
            .sum()
    }
}

/// Texture filtering mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

/// Texture addressing mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    ClampToEdge,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_mode: AddressMode,
}

impl SamplerDesc {
    pub fn nearest() -> Self {
        Self::default()
    }

    pub fn linear() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            address_mode: AddressMode::Repeat,
        }
    }
}
