//! Platform-neutral descriptions of transient resources.

use bitflags::bitflags;

/// A render-graph pass ordinal.
pub type PassIndex = u32;

bitflags! {
    /// How a resource will be used by the GPU.
    #[derive(Default)]
    pub struct ResourceUsage: u32 {
        /// Bound as a render target.
        const RENDER_TARGET = 1 << 0;
        /// Bound as a depth stencil target.
        const DEPTH_STENCIL = 1 << 1;
        /// Read and written through unordered access views.
        const UNORDERED_ACCESS = 1 << 2;
        /// Read through shader resource views.
        const SHADER_RESOURCE = 1 << 3;
    }
}

/// A texel format, using DXGI format codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Format(pub u32);

impl Format {
    /// No format; used for buffers.
    pub const UNKNOWN: Format = Format(0);
    /// Four 16-bit float channels.
    pub const R16G16B16A16_FLOAT: Format = Format(10);
    /// Four 8-bit normalized channels.
    pub const R8G8B8A8_UNORM: Format = Format(28);
    /// 32-bit float depth.
    pub const D32_FLOAT: Format = Format(40);
    /// One 32-bit float channel.
    pub const R32_FLOAT: Format = Format(41);
}

/// The shape of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    /// A linear buffer.
    Buffer,
    /// A one dimensional texture.
    Texture1D,
    /// A two dimensional texture.
    Texture2D,
    /// A volume texture.
    Texture3D,
}

/// Description of a transient texture or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    /// Resource shape.
    pub dimension: ResourceDimension,
    /// Width in texels, or size in bytes for buffers.
    pub width: u64,
    /// Height in texels.
    pub height: u32,
    /// Depth for volume textures, array size otherwise.
    pub depth_or_array_size: u16,
    /// Number of mip levels.
    pub mip_levels: u16,
    /// Texel format.
    pub format: Format,
    /// MSAA sample count.
    pub sample_count: u32,
    /// Usage flags.
    pub usage: ResourceUsage,
}

impl ResourceDesc {
    /// A buffer of `size` bytes.
    pub fn buffer(size: u64, usage: ResourceUsage) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: Format::UNKNOWN,
            sample_count: 1,
            usage,
        }
    }

    /// A single-mip 2D texture.
    pub fn texture_2d(width: u32, height: u32, format: Format, usage: ResourceUsage) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width: width as u64,
            height,
            depth_or_array_size: 1,
            mip_levels: 1,
            format,
            sample_count: 1,
            usage,
        }
    }

    /// Set the number of mip levels.
    pub fn with_mip_levels(mut self, mip_levels: u16) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Set the MSAA sample count.
    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    /// Whether the resource is a buffer.
    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    /// Whether the resource is a render target or depth stencil texture.
    pub fn is_render_target(&self) -> bool {
        !self.is_buffer()
            && self
                .usage
                .intersects(ResourceUsage::RENDER_TARGET | ResourceUsage::DEPTH_STENCIL)
    }

    /// The heap category the resource needs when categories cannot be mixed.
    pub fn category(&self) -> HeapCategory {
        if self.is_buffer() {
            HeapCategory::Buffers
        } else if self.is_render_target() {
            HeapCategory::RenderTargets
        } else {
            HeapCategory::Textures
        }
    }

    /// The state the resource is created in.
    pub fn initial_state(&self) -> ResourceState {
        if self.is_buffer() {
            ResourceState::UnorderedAccess
        } else if self.usage.contains(ResourceUsage::RENDER_TARGET) {
            ResourceState::RenderTarget
        } else if self.usage.contains(ResourceUsage::DEPTH_STENCIL) {
            ResourceState::DepthWrite
        } else {
            ResourceState::UnorderedAccess
        }
    }
}

/// Initial GPU access state of a placed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Writable as a render target.
    RenderTarget,
    /// Writable as a depth stencil target.
    DepthWrite,
    /// Readable and writable through unordered access.
    UnorderedAccess,
}

/// Which resources a transient heap accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapCategory {
    /// Buffers only.
    Buffers,
    /// Textures that are neither render targets nor depth stencils.
    Textures,
    /// Render target and depth stencil textures.
    RenderTargets,
    /// Any resource.
    Mixed,
}

/// Size and alignment of a resource inside a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationInfo {
    /// Size in bytes.
    pub size: u64,
    /// Required placement alignment in bytes; a power of two.
    pub alignment: u64,
}
