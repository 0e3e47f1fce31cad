//! In-process stand-ins for the GPU collaborators, used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::HeapAllocatorError;
use crate::platform::{
    CpuDescriptorHandle, DescriptorDevice, DescriptorHeapDesc, DescriptorHeapType,
    GpuDescriptorHandle, RawDescriptorHeap, RawTransientHeap, ResourceHeapTier, SyncPoint,
    TransientDevice, TransientHeapDesc,
};
use crate::resource::{AllocationInfo, ResourceDesc, ResourceState};

const CPU_ADDRESS_SPACING: usize = 0x0100_0000;
const GPU_ADDRESS_BASE: u64 = 0x7f00_0000_0000;

#[derive(Debug)]
pub struct MockDescriptorHeap {
    pub index: usize,
    pub desc: DescriptorHeapDesc,
}

#[derive(Debug, Default)]
struct DescriptorDeviceState {
    heaps_created: usize,
    fail_after: Option<usize>,
    copies: Vec<(CpuDescriptorHandle, CpuDescriptorHandle, u32)>,
}

/// Hands out heaps at distinct, widely spaced fake addresses.
#[derive(Debug, Clone, Default)]
pub struct MockDescriptorDevice {
    state: Arc<Mutex<DescriptorDeviceState>>,
}

impl MockDescriptorDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every heap creation after the first `heaps`.
    pub fn fail_after(self, heaps: usize) -> Self {
        self.state.lock().fail_after = Some(heaps);
        self
    }

    pub fn heaps_created(&self) -> usize {
        self.state.lock().heaps_created
    }

    pub fn copies(&self) -> Vec<(CpuDescriptorHandle, CpuDescriptorHandle, u32)> {
        self.state.lock().copies.clone()
    }
}

impl DescriptorDevice for MockDescriptorDevice {
    type DescriptorHeap = MockDescriptorHeap;

    fn descriptor_stride(&self, ty: DescriptorHeapType) -> u32 {
        match ty {
            DescriptorHeapType::ResourceView => 32,
            DescriptorHeapType::Sampler => 16,
            DescriptorHeapType::RenderTarget => 32,
            DescriptorHeapType::DepthStencil => 8,
        }
    }

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc,
    ) -> Result<RawDescriptorHeap<MockDescriptorHeap>, HeapAllocatorError> {
        let mut state = self.state.lock();
        if state.fail_after.map_or(false, |limit| state.heaps_created >= limit) {
            return Err(HeapAllocatorError::Platform("out of descriptor memory".into()));
        }

        let index = state.heaps_created;
        state.heaps_created += 1;

        let cpu_start = CpuDescriptorHandle {
            ptr: (index + 1) * CPU_ADDRESS_SPACING,
        };
        let gpu_start = desc.shader_visible.then(|| GpuDescriptorHandle {
            ptr: GPU_ADDRESS_BASE + ((index + 1) * CPU_ADDRESS_SPACING) as u64,
        });

        Ok(RawDescriptorHeap {
            handle: MockDescriptorHeap {
                index,
                desc: desc.clone(),
            },
            cpu_start,
            gpu_start,
        })
    }

    unsafe fn copy_descriptors(
        &self,
        dest: CpuDescriptorHandle,
        source: CpuDescriptorHandle,
        count: u32,
        _ty: DescriptorHeapType,
    ) {
        self.state.lock().copies.push((dest, source, count));
    }
}

/// A fence advanced by hand.
#[derive(Debug, Clone, Default)]
pub struct MockFence {
    completed: Arc<AtomicU64>,
    signal_on_wait: Arc<AtomicBool>,
}

impl MockFence {
    pub fn new(completed: u64) -> Self {
        let fence = Self::default();
        fence.signal(completed);
        fence
    }

    pub fn signal(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Make `wait` behave as if the GPU caught up while the caller slept.
    pub fn signal_on_wait(&self, enabled: bool) {
        self.signal_on_wait.store(enabled, Ordering::Release);
    }
}

impl SyncPoint for MockFence {
    fn current_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    fn wait(&self, value: u64, _timeout: Duration) -> bool {
        if self.signal_on_wait.load(Ordering::Acquire) {
            self.signal(value);
        }
        self.has_signaled(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockHeap {
    pub index: usize,
    pub desc: TransientHeapDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResource {
    pub heap: usize,
    pub offset: u64,
    pub desc: ResourceDesc,
    pub state: ResourceState,
    pub name: String,
}

#[derive(Debug, Default)]
struct TransientDeviceState {
    heaps: Vec<TransientHeapDesc>,
    resources_created: usize,
    fail_heaps: bool,
}

/// Sizes resources by their byte footprint and a fixed placement alignment.
#[derive(Debug, Clone)]
pub struct MockTransientDevice {
    tier: ResourceHeapTier,
    alignment: u64,
    not_zeroed: bool,
    state: Arc<Mutex<TransientDeviceState>>,
}

impl MockTransientDevice {
    pub fn new(tier: ResourceHeapTier) -> Self {
        Self {
            tier,
            alignment: 64 * 1024,
            not_zeroed: true,
            state: Arc::default(),
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn without_not_zeroed(mut self) -> Self {
        self.not_zeroed = false;
        self
    }

    pub fn fail_heap_creation(&self, fail: bool) {
        self.state.lock().fail_heaps = fail;
    }

    pub fn heaps(&self) -> Vec<TransientHeapDesc> {
        self.state.lock().heaps.clone()
    }

    pub fn resources_created(&self) -> usize {
        self.state.lock().resources_created
    }
}

impl TransientDevice for MockTransientDevice {
    type Heap = MockHeap;
    type Resource = MockResource;

    fn resource_heap_tier(&self) -> ResourceHeapTier {
        self.tier
    }

    fn supports_not_zeroed_heaps(&self) -> bool {
        self.not_zeroed
    }

    fn create_heap(
        &self,
        desc: &TransientHeapDesc,
    ) -> Result<RawTransientHeap<MockHeap>, HeapAllocatorError> {
        let mut state = self.state.lock();
        if state.fail_heaps {
            return Err(HeapAllocatorError::Platform("out of video memory".into()));
        }

        let index = state.heaps.len();
        state.heaps.push(*desc);

        Ok(RawTransientHeap {
            handle: MockHeap { index, desc: *desc },
            gpu_virtual_address: Some(GPU_ADDRESS_BASE + (index as u64) * (1 << 32)),
        })
    }

    fn allocation_info(&self, desc: &ResourceDesc) -> AllocationInfo {
        let texel_bytes = if desc.is_buffer() { 1 } else { 4 };
        let size = desc.width
            * desc.height as u64
            * desc.depth_or_array_size as u64
            * desc.sample_count as u64
            * texel_bytes;

        AllocationInfo {
            size,
            alignment: self.alignment,
        }
    }

    fn create_placed_resource(
        &self,
        heap: &MockHeap,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        debug_name: &str,
    ) -> Result<MockResource, HeapAllocatorError> {
        self.state.lock().resources_created += 1;

        Ok(MockResource {
            heap: heap.index,
            offset,
            desc: *desc,
            state: initial_state,
            name: debug_name.to_owned(),
        })
    }
}
