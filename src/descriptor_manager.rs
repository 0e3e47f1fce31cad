use parking_lot::Mutex;

use crate::descriptor_heap::{DescriptorHeap, HeapId};
use crate::error::HeapAllocatorError;
use crate::platform::{CpuDescriptorHandle, DescriptorDevice, DescriptorHeapDesc, GpuDescriptorHandle};
use crate::range_allocator::FixedRangeAllocator;

/// A single descriptor allocated from a [`DescriptorManager`].
///
/// The handle does not free itself; pass it back to
/// [`DescriptorManager::free_descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    heap: HeapId,
    index: u32,
}

impl DescriptorHandle {
    /// Get the index of the descriptor within the heap.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The heap the descriptor was allocated from.
    pub fn heap_id(&self) -> HeapId {
        self.heap
    }
}

/// A run of contiguous descriptors allocated from a [`DescriptorManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    heap: HeapId,
    start: u32,
    count: u32,
}

impl DescriptorRange {
    /// Index of the first descriptor.
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Number of descriptors in the run.
    pub fn len(&self) -> u32 {
        self.count
    }

    /// Whether the run is empty. Allocated runs never are.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The heap the run was allocated from.
    pub fn heap_id(&self) -> HeapId {
        self.heap
    }

    /// Handle to the `i`th descriptor of the run.
    pub fn handle(&self, i: u32) -> DescriptorHandle {
        assert!(i < self.count, "descriptor {i} outside run of {}", self.count);
        DescriptorHandle {
            heap: self.heap,
            index: self.start + i,
        }
    }
}

/// Allocator for long-lived descriptors in one fixed-size heap.
///
/// Allocation is first-fit over the heap's slots. The heap never grows;
/// when it is full allocation fails with
/// [`HeapAllocatorError::HeapOverflow`] and the caller decides whether to
/// create a larger manager or defer the request.
pub struct DescriptorManager<D: DescriptorDevice> {
    device: D,
    heap: DescriptorHeap<D::DescriptorHeap>,
    allocator: Mutex<FixedRangeAllocator>,
}

impl<D: DescriptorDevice> DescriptorManager<D> {
    /// Create a manager backed by a new physical heap.
    pub fn new(device: D, desc: &DescriptorHeapDesc) -> Result<Self, HeapAllocatorError> {
        let heap = DescriptorHeap::new(&device, desc)?;
        Ok(Self::from_heap(device, heap))
    }

    /// Create a manager over an existing heap or heap sub-range.
    pub fn from_heap(device: D, heap: DescriptorHeap<D::DescriptorHeap>) -> Self {
        let allocator = Mutex::new(FixedRangeAllocator::new(heap.len()));
        Self {
            device,
            heap,
            allocator,
        }
    }

    /// Allocate a descriptor.
    ///
    /// If there are no more free descriptors, returns an error with the number of
    /// descriptors in this descriptor heap.
    pub fn allocate_descriptor(&self) -> Result<DescriptorHandle, HeapAllocatorError> {
        self.allocate_descriptors(1).map(|range| range.handle(0))
    }

    /// Allocate `count` contiguous descriptors.
    pub fn allocate_descriptors(&self, count: u32) -> Result<DescriptorRange, HeapAllocatorError> {
        let start = self.allocator.lock().allocate(count);

        match start {
            Some(start) => Ok(DescriptorRange {
                heap: self.heap.id(),
                start,
                count,
            }),
            None => {
                tracing::warn!(
                    heap = ?self.heap.id(),
                    capacity = self.heap.len(),
                    requested = count,
                    "descriptor heap exhausted"
                );
                Err(HeapAllocatorError::HeapOverflow {
                    capacity: self.heap.len() as usize,
                    requested: count as usize,
                })
            }
        }
    }

    /// Return a descriptor to the heap.
    ///
    /// ## Panics
    /// Panics if the handle belongs to another heap or is already free.
    pub fn free_descriptor(&self, handle: DescriptorHandle) {
        self.free_descriptors(DescriptorRange {
            heap: handle.heap,
            start: handle.index,
            count: 1,
        });
    }

    /// Return a run of descriptors to the heap.
    ///
    /// ## Panics
    /// Panics if the run belongs to another heap or any of it is already free.
    pub fn free_descriptors(&self, range: DescriptorRange) {
        assert_eq!(
            range.heap,
            self.heap.id(),
            "descriptors freed to a heap they were not allocated from"
        );
        self.allocator.lock().free(range.start, range.count);
    }

    /// CPU address of a slot. Never fails.
    pub fn cpu_address(&self, slot: u32) -> CpuDescriptorHandle {
        self.heap.cpu_slot_address(slot)
    }

    /// GPU address of a slot, if the heap is shader visible.
    pub fn gpu_address(&self, slot: u32) -> Option<GpuDescriptorHandle> {
        self.heap.gpu_slot_address(slot)
    }

    /// CPU address of an allocated descriptor.
    pub fn cpu_handle(&self, handle: DescriptorHandle) -> CpuDescriptorHandle {
        debug_assert_eq!(handle.heap, self.heap.id());
        self.cpu_address(handle.index)
    }

    /// Copy the source handle to an allocated descriptor.
    ///
    /// ## Safety
    /// The type of the resource that the source descriptor handle is for must match
    /// the type of the heap, and no in-flight GPU work may be reading the slot.
    pub unsafe fn copy_descriptor(&self, handle: DescriptorHandle, source: CpuDescriptorHandle) {
        unsafe {
            self.device
                .copy_descriptors(self.cpu_handle(handle), source, 1, self.heap.ty())
        }
    }

    /// Number of free slots.
    pub fn free_count(&self) -> u32 {
        self.allocator.lock().free_count()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> u32 {
        self.heap.len()
    }

    /// The backing heap.
    pub fn heap(&self) -> &DescriptorHeap<D::DescriptorHeap> {
        &self.heap
    }
}
