//! Traits implemented by the GPU backend.
//!
//! The allocators never talk to a graphics API directly. Heap creation,
//! descriptor copies, placed resource creation and fence queries all go
//! through the traits in this module, which the `d3d12` module implements
//! for Direct3D 12 on Windows.

use std::time::Duration;

use crate::error::HeapAllocatorError;
use crate::resource::{AllocationInfo, HeapCategory, ResourceDesc, ResourceState};

/// The kind of descriptors stored in a descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Constant buffer, shader resource and unordered access views.
    ResourceView,
    /// Samplers.
    Sampler,
    /// Render target views.
    RenderTarget,
    /// Depth stencil views.
    DepthStencil,
}

impl DescriptorHeapType {
    /// Whether heaps of this type may be made visible to shaders.
    pub fn can_be_shader_visible(self) -> bool {
        matches!(
            self,
            DescriptorHeapType::ResourceView | DescriptorHeapType::Sampler
        )
    }
}

/// A CPU address of a descriptor slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuDescriptorHandle {
    /// The raw address.
    pub ptr: usize,
}

impl CpuDescriptorHandle {
    /// The handle `slots` descriptors after this one.
    pub fn offset(self, slots: u32, stride: u32) -> Self {
        Self {
            ptr: self.ptr + slots as usize * stride as usize,
        }
    }
}

/// A GPU address of a descriptor slot in a shader-visible heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuDescriptorHandle {
    /// The raw address.
    pub ptr: u64,
}

impl GpuDescriptorHandle {
    /// The handle `slots` descriptors after this one.
    pub fn offset(self, slots: u32, stride: u32) -> Self {
        Self {
            ptr: self.ptr + slots as u64 * stride as u64,
        }
    }
}

/// Description of a physical descriptor heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    /// The descriptor type stored in the heap.
    pub ty: DescriptorHeapType,
    /// Number of slots in the heap.
    pub num_descriptors: u32,
    /// Whether the heap is visible to shaders.
    pub shader_visible: bool,
    /// Debug name applied to the native heap.
    pub name: Option<String>,
}

impl DescriptorHeapDesc {
    /// A CPU-only heap description.
    pub fn new(ty: DescriptorHeapType, num_descriptors: u32) -> Self {
        Self {
            ty,
            num_descriptors,
            shader_visible: false,
            name: None,
        }
    }

    /// Make the heap shader visible.
    pub fn shader_visible(mut self) -> Self {
        self.shader_visible = true;
        self
    }

    /// Attach a debug name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A native descriptor heap as returned by the device.
#[derive(Debug)]
pub struct RawDescriptorHeap<H> {
    /// The native heap object.
    pub handle: H,
    /// CPU address of slot 0.
    pub cpu_start: CpuDescriptorHandle,
    /// GPU address of slot 0, present only for shader-visible heaps.
    pub gpu_start: Option<GpuDescriptorHandle>,
}

/// A device able to create descriptor heaps.
pub trait DescriptorDevice {
    /// The native descriptor heap object.
    type DescriptorHeap;

    /// The size in bytes of one descriptor of the given type.
    fn descriptor_stride(&self, ty: DescriptorHeapType) -> u32;

    /// Create a physical descriptor heap.
    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
    ) -> Result<RawDescriptorHeap<Self::DescriptorHeap>, HeapAllocatorError>;

    /// Copy `count` descriptors from `source` to `dest`.
    ///
    /// ## Safety
    /// Both ranges must be valid descriptor ranges of type `ty`, and no GPU
    /// work may be reading `dest` while it is overwritten.
    unsafe fn copy_descriptors(
        &self,
        dest: CpuDescriptorHandle,
        source: CpuDescriptorHandle,
        count: u32,
        ty: DescriptorHeapType,
    );
}

/// A monotonically increasing GPU completion counter.
pub trait SyncPoint {
    /// The most recent value the GPU has signaled.
    fn current_value(&self) -> u64;

    /// Whether the GPU has signaled at least `value`. Never blocks.
    fn has_signaled(&self, value: u64) -> bool {
        self.current_value() >= value
    }

    /// Block until `value` is signaled or `timeout` elapses.
    ///
    /// Returns whether the value was signaled.
    fn wait(&self, value: u64, timeout: Duration) -> bool;
}

/// Hardware support for mixing resource categories in one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceHeapTier {
    /// Buffers, non-target textures and render target textures need separate heaps.
    Tier1,
    /// Any resource may be placed in any heap.
    Tier2,
}

/// Description of a physical transient memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientHeapDesc {
    /// Heap size in bytes.
    pub size: u64,
    /// Heap alignment in bytes.
    pub alignment: u64,
    /// Which resources may be placed in the heap.
    pub category: HeapCategory,
    /// Skip zero-initialising the heap memory.
    pub not_zeroed: bool,
    /// Raise the residency priority so the heap is not paged out.
    pub high_residency_priority: bool,
}

/// A native transient heap as returned by the device.
#[derive(Debug)]
pub struct RawTransientHeap<H> {
    /// The native heap object.
    pub handle: H,
    /// GPU virtual address of the first byte, where the platform exposes one.
    pub gpu_virtual_address: Option<u64>,
}

/// A device able to create memory heaps and resources placed inside them.
pub trait TransientDevice {
    /// The native heap object.
    type Heap;
    /// The native resource object.
    type Resource;

    /// The resource heap tier of the hardware.
    fn resource_heap_tier(&self) -> ResourceHeapTier;

    /// Whether heaps can be created without zero-initialising their memory.
    fn supports_not_zeroed_heaps(&self) -> bool;

    /// Create a physical heap.
    fn create_heap(
        &self,
        desc: &TransientHeapDesc,
    ) -> Result<RawTransientHeap<Self::Heap>, HeapAllocatorError>;

    /// The size and alignment a resource needs inside a heap.
    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo;

    /// Create a resource aliasing `heap` at byte `offset`.
    fn create_placed_resource(
        &self,
        heap: &Self::Heap,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        debug_name: &str,
    ) -> Result<Self::Resource, HeapAllocatorError>;
}
