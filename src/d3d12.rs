//! Direct3D 12 implementations of the device traits.
//!
//! `ID3D12Device` can create descriptor heaps, transient heaps and placed
//! resources directly. [`D3D12Fence`] adapts an `ID3D12Fence` to
//! [`SyncPoint`].

use std::time::Duration;

use windows::core::{Interface, HSTRING, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use crate::error::HeapAllocatorError;
use crate::platform::{
    CpuDescriptorHandle, DescriptorDevice, DescriptorHeapDesc, DescriptorHeapType,
    GpuDescriptorHandle, RawDescriptorHeap, RawTransientHeap, ResourceHeapTier, SyncPoint,
    TransientDevice, TransientHeapDesc,
};
use crate::resource::{
    AllocationInfo, HeapCategory, ResourceDesc, ResourceDimension, ResourceState, ResourceUsage,
};

fn native_heap_type(ty: DescriptorHeapType) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match ty {
        DescriptorHeapType::ResourceView => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapType::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapType::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapType::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

fn native_heap_flags(category: HeapCategory) -> D3D12_HEAP_FLAGS {
    match category {
        HeapCategory::Buffers => D3D12_HEAP_FLAG_ALLOW_ONLY_BUFFERS,
        HeapCategory::Textures => D3D12_HEAP_FLAG_ALLOW_ONLY_NON_RT_DS_TEXTURES,
        HeapCategory::RenderTargets => D3D12_HEAP_FLAG_ALLOW_ONLY_RT_DS_TEXTURES,
        HeapCategory::Mixed => D3D12_HEAP_FLAG_ALLOW_ALL_BUFFERS_AND_TEXTURES,
    }
}

fn native_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
    }
}

fn native_resource_flags(desc: &ResourceDesc) -> D3D12_RESOURCE_FLAGS {
    if desc.is_buffer() {
        return D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }

    let mut flags = D3D12_RESOURCE_FLAG_NONE;
    if desc.usage.contains(ResourceUsage::RENDER_TARGET) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if desc.usage.contains(ResourceUsage::DEPTH_STENCIL) {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        if !desc.usage.contains(ResourceUsage::SHADER_RESOURCE) {
            flags |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
        }
    }
    // Resources without a target usage start out in the unordered access state.
    if desc.usage.contains(ResourceUsage::UNORDERED_ACCESS) || !desc.is_render_target() {
        flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    flags
}

fn native_resource_desc(desc: &ResourceDesc) -> D3D12_RESOURCE_DESC {
    let dimension = match desc.dimension {
        ResourceDimension::Buffer => D3D12_RESOURCE_DIMENSION_BUFFER,
        ResourceDimension::Texture1D => D3D12_RESOURCE_DIMENSION_TEXTURE1D,
        ResourceDimension::Texture2D => D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        ResourceDimension::Texture3D => D3D12_RESOURCE_DIMENSION_TEXTURE3D,
    };
    let layout = if desc.is_buffer() {
        D3D12_TEXTURE_LAYOUT_ROW_MAJOR
    } else {
        D3D12_TEXTURE_LAYOUT_UNKNOWN
    };

    D3D12_RESOURCE_DESC {
        Dimension: dimension,
        Alignment: 0,
        Width: desc.width,
        Height: desc.height,
        DepthOrArraySize: desc.depth_or_array_size,
        MipLevels: desc.mip_levels,
        Format: DXGI_FORMAT(desc.format.0 as i32),
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: desc.sample_count,
            Quality: 0,
        },
        Layout: layout,
        Flags: native_resource_flags(desc),
    }
}

unsafe fn set_name(object: &ID3D12Object, name: &str) -> windows::core::Result<()> {
    let name = HSTRING::from(name);
    unsafe { object.SetName(PCWSTR(name.as_ptr())) }
}

impl DescriptorDevice for ID3D12Device {
    type DescriptorHeap = ID3D12DescriptorHeap;

    fn descriptor_stride(&self, ty: DescriptorHeapType) -> u32 {
        unsafe { self.GetDescriptorHandleIncrementSize(native_heap_type(ty)) }
    }

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
    ) -> Result<RawDescriptorHeap<ID3D12DescriptorHeap>, HeapAllocatorError> {
        let native = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: native_heap_type(desc.ty),
            NumDescriptors: desc.num_descriptors,
            Flags: if desc.shader_visible {
                D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            },
            NodeMask: 0,
        };

        unsafe {
            let heap: ID3D12DescriptorHeap = self.CreateDescriptorHeap(&native)?;
            if let Some(name) = &desc.name {
                set_name(&heap.cast()?, name)?;
            }

            let cpu_start = heap.GetCPUDescriptorHandleForHeapStart();
            let gpu_start = if desc.shader_visible {
                Some(heap.GetGPUDescriptorHandleForHeapStart())
            } else {
                None
            };

            Ok(RawDescriptorHeap {
                handle: heap,
                cpu_start: CpuDescriptorHandle { ptr: cpu_start.ptr },
                gpu_start: gpu_start.map(|start| GpuDescriptorHandle { ptr: start.ptr }),
            })
        }
    }

    unsafe fn copy_descriptors(
        &self,
        dest: CpuDescriptorHandle,
        source: CpuDescriptorHandle,
        count: u32,
        ty: DescriptorHeapType,
    ) {
        unsafe {
            self.CopyDescriptorsSimple(
                count,
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dest.ptr },
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: source.ptr },
                native_heap_type(ty),
            )
        }
    }
}

/// An `ID3D12Fence` used as a [`SyncPoint`].
#[derive(Debug, Clone)]
pub struct D3D12Fence {
    fence: ID3D12Fence,
}

impl D3D12Fence {
    /// Create a fence with the given initial value.
    pub fn new(device: &ID3D12Device, initial_value: u64) -> Result<Self, HeapAllocatorError> {
        let fence: ID3D12Fence = unsafe { device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)? };
        Ok(Self { fence })
    }

    /// Wrap an existing fence, such as the one a queue signals.
    pub fn from_raw(fence: ID3D12Fence) -> Self {
        Self { fence }
    }

    /// The native fence.
    pub fn raw(&self) -> &ID3D12Fence {
        &self.fence
    }
}

impl SyncPoint for D3D12Fence {
    fn current_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait(&self, value: u64, timeout: Duration) -> bool {
        if self.has_signaled(value) {
            return true;
        }

        // One event per wait, so concurrent waiters never steal each other's signal.
        let Ok(event) = (unsafe { CreateEventW(None, false, false, PCWSTR::null()) }) else {
            return false;
        };

        let millis = timeout.as_millis().min((INFINITE - 1) as u128) as u32;
        let signaled = unsafe {
            self.fence.SetEventOnCompletion(value, event).is_ok()
                && WaitForSingleObject(event, millis) == WAIT_OBJECT_0
        };

        unsafe {
            let _ = CloseHandle(event);
        }
        signaled
    }
}

/// A transient heap created on a Direct3D 12 device.
#[derive(Debug)]
pub struct D3D12TransientHeap {
    heap: ID3D12Heap,
    // Spans the whole heap so that it has a GPU virtual address.
    buffer: Option<ID3D12Resource>,
}

impl D3D12TransientHeap {
    /// The native heap.
    pub fn heap(&self) -> &ID3D12Heap {
        &self.heap
    }

    /// A buffer covering the whole heap, for heaps that may hold buffers.
    pub fn buffer(&self) -> Option<&ID3D12Resource> {
        self.buffer.as_ref()
    }
}

impl TransientDevice for ID3D12Device {
    type Heap = D3D12TransientHeap;
    type Resource = ID3D12Resource;

    fn resource_heap_tier(&self) -> ResourceHeapTier {
        let mut options = D3D12_FEATURE_DATA_D3D12_OPTIONS::default();
        let queried = unsafe {
            self.CheckFeatureSupport(
                D3D12_FEATURE_D3D12_OPTIONS,
                <*mut D3D12_FEATURE_DATA_D3D12_OPTIONS>::cast(&mut options),
                std::mem::size_of_val(&options) as u32,
            )
        };

        match queried {
            Ok(()) if options.ResourceHeapTier.0 >= D3D12_RESOURCE_HEAP_TIER_2.0 => {
                ResourceHeapTier::Tier2
            }
            Ok(()) => ResourceHeapTier::Tier1,
            Err(err) => {
                tracing::warn!(%err, "could not query the resource heap tier, assuming tier 1");
                ResourceHeapTier::Tier1
            }
        }
    }

    fn supports_not_zeroed_heaps(&self) -> bool {
        self.cast::<ID3D12Device8>().is_ok()
    }

    fn create_heap(
        &self,
        desc: &TransientHeapDesc,
    ) -> Result<RawTransientHeap<D3D12TransientHeap>, HeapAllocatorError> {
        let mut flags = native_heap_flags(desc.category);
        if desc.not_zeroed {
            flags |= D3D12_HEAP_FLAG_CREATE_NOT_ZEROED;
        }

        let native = D3D12_HEAP_DESC {
            SizeInBytes: desc.size,
            Properties: D3D12_HEAP_PROPERTIES {
                Type: D3D12_HEAP_TYPE_DEFAULT,
                ..Default::default()
            },
            Alignment: desc.alignment,
            Flags: flags,
        };

        let mut heap: Option<ID3D12Heap> = None;
        unsafe { self.CreateHeap(&native, &mut heap)? };
        let heap = heap.ok_or_else(|| {
            HeapAllocatorError::Platform("ID3D12Device::CreateHeap returned no heap".into())
        })?;

        if desc.high_residency_priority {
            if let Ok(device) = self.cast::<ID3D12Device1>() {
                let pageable: Option<ID3D12Pageable> = Some(heap.cast()?);
                unsafe { device.SetResidencyPriority(1, &pageable, &D3D12_RESIDENCY_PRIORITY_HIGH)? };
            }
        }

        let buffer = match desc.category {
            HeapCategory::Buffers | HeapCategory::Mixed => {
                let span = ResourceDesc::buffer(desc.size, ResourceUsage::UNORDERED_ACCESS);
                let mut buffer: Option<ID3D12Resource> = None;
                unsafe {
                    self.CreatePlacedResource(
                        &heap,
                        0,
                        &native_resource_desc(&span),
                        D3D12_RESOURCE_STATE_COMMON,
                        None,
                        &mut buffer,
                    )?
                };
                buffer
            }
            HeapCategory::Textures | HeapCategory::RenderTargets => None,
        };
        let gpu_virtual_address = buffer
            .as_ref()
            .map(|buffer| unsafe { buffer.GetGPUVirtualAddress() });

        Ok(RawTransientHeap {
            handle: D3D12TransientHeap { heap, buffer },
            gpu_virtual_address,
        })
    }

    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        let native = native_resource_desc(desc);
        let info = unsafe { self.GetResourceAllocationInfo(0, std::slice::from_ref(&native)) };
        AllocationInfo {
            size: info.SizeInBytes,
            alignment: info.Alignment,
        }
    }

    fn create_placed_resource(
        &self,
        heap: &D3D12TransientHeap,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        debug_name: &str,
    ) -> Result<ID3D12Resource, HeapAllocatorError> {
        let native = native_resource_desc(desc);
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.CreatePlacedResource(
                &heap.heap,
                offset,
                &native,
                native_state(initial_state),
                None,
                &mut resource,
            )?
        };
        let resource = resource.ok_or_else(|| {
            HeapAllocatorError::Platform("ID3D12Device::CreatePlacedResource returned no resource".into())
        })?;

        if !debug_name.is_empty() {
            unsafe { set_name(&resource.cast()?, debug_name)? };
        }
        Ok(resource)
    }
}
