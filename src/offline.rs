use bitvec::bitvec;
use bitvec::boxed::BitBox;
use bitvec::order::Lsb0;
use parking_lot::Mutex;

use crate::descriptor_heap::DescriptorHeap;
use crate::error::HeapAllocatorError;
use crate::platform::{CpuDescriptorHandle, DescriptorDevice, DescriptorHeapDesc, DescriptorHeapType};

/// Configuration of an [`OfflineDescriptorManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineDescriptorManagerDesc {
    /// Descriptor type of every backing heap.
    pub ty: DescriptorHeapType,
    /// Slots per backing heap.
    pub heap_size: u32,
}

impl OfflineDescriptorManagerDesc {
    /// Default number of slots in each backing heap.
    pub const DEFAULT_HEAP_SIZE: u32 = 256;

    /// A description with the default heap size.
    pub fn new(ty: DescriptorHeapType) -> Self {
        Self {
            ty,
            heap_size: Self::DEFAULT_HEAP_SIZE,
        }
    }
}

/// A CPU-only descriptor slot allocated from an [`OfflineDescriptorManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OfflineSlot {
    /// CPU address of the slot.
    pub address: CpuDescriptorHandle,
    /// The backing heap the slot lives in.
    pub heap_index: u32,
}

struct OfflineHeap<H> {
    heap: DescriptorHeap<H>,
    occupied: BitBox<usize, Lsb0>,
    // Every slot before this index is occupied.
    search_start: usize,
    free_count: u32,
}

impl<H> OfflineHeap<H> {
    fn new(heap: DescriptorHeap<H>) -> Self {
        let len = heap.len();
        Self {
            occupied: bitvec![usize, Lsb0; 0; len as usize].into_boxed_bitslice(),
            search_start: 0,
            free_count: len,
            heap,
        }
    }

    fn take_slot(&mut self) -> Option<u32> {
        let index = self.occupied[self.search_start..].first_zero()? + self.search_start;
        self.occupied.set(index, true);
        self.search_start = index + 1;
        self.free_count -= 1;
        Some(index as u32)
    }

    fn release_slot(&mut self, index: u32) {
        let index = index as usize;
        assert!(self.occupied[index], "offline descriptor slot {index} freed twice");
        self.occupied.set(index, false);
        self.search_start = self.search_start.min(index);
        self.free_count += 1;
    }
}

struct OfflineState<H> {
    heaps: Vec<OfflineHeap<H>>,
    // Heaps with at least one free slot; the most recently used is last.
    available: Vec<u32>,
}

/// A growable pool of CPU-only descriptor heaps.
///
/// Descriptors allocated here are never read by the GPU directly; they are
/// staging copies that get copied into shader-visible heaps. Freed slots can
/// therefore be reused as soon as [`free_heap_slot`](Self::free_heap_slot)
/// returns.
pub struct OfflineDescriptorManager<D: DescriptorDevice> {
    device: D,
    desc: OfflineDescriptorManagerDesc,
    state: Mutex<OfflineState<D::DescriptorHeap>>,
}

impl<D: DescriptorDevice> OfflineDescriptorManager<D> {
    /// Create an empty pool; heaps are created on first use.
    pub fn new(device: D, desc: OfflineDescriptorManagerDesc) -> Self {
        assert!(desc.heap_size > 0, "offline heaps must hold at least one slot");
        Self {
            device,
            desc,
            state: Mutex::new(OfflineState {
                heaps: Vec::new(),
                available: Vec::new(),
            }),
        }
    }

    /// Allocate one slot, creating a new backing heap if every heap is full.
    pub fn allocate_heap_slot(&self) -> Result<OfflineSlot, HeapAllocatorError> {
        let mut state = self.state.lock();
        self.take_slot(&mut state)
    }

    /// Allocate `NUM_DESC` slots at once.
    ///
    /// Either every slot is allocated or none is.
    pub fn allocate_heap_slots<const NUM_DESC: usize>(
        &self,
    ) -> Result<[OfflineSlot; NUM_DESC], HeapAllocatorError> {
        let mut state = self.state.lock();

        // Grow up front so that taking the slots below cannot fail half way.
        let mut free: usize = state.heaps.iter().map(|h| h.free_count as usize).sum();
        while free < NUM_DESC {
            self.grow(&mut state)?;
            free += self.desc.heap_size as usize;
        }

        array_init::try_array_init(|_| self.take_slot(&mut state))
    }

    /// Return a slot to the heap it came from. The slot may be reused at once.
    ///
    /// ## Panics
    /// Panics if the slot was not allocated from this manager or is already free.
    pub fn free_heap_slot(&self, slot: OfflineSlot) {
        let mut state = self.state.lock();
        let state = &mut *state;

        let heap = state
            .heaps
            .get_mut(slot.heap_index as usize)
            .unwrap_or_else(|| panic!("offline heap {} does not exist", slot.heap_index));
        let index = heap
            .heap
            .slot_of(slot.address)
            .unwrap_or_else(|| {
                panic!("{:?} is not a slot of heap {}", slot.address, slot.heap_index)
            });

        let was_full = heap.free_count == 0;
        heap.release_slot(index);
        if was_full {
            state.available.push(slot.heap_index);
        }
    }

    /// Number of backing heaps created so far.
    pub fn heap_count(&self) -> usize {
        self.state.lock().heaps.len()
    }

    /// Number of free slots across all backing heaps.
    pub fn free_slot_count(&self) -> usize {
        self.state
            .lock()
            .heaps
            .iter()
            .map(|heap| heap.free_count as usize)
            .sum()
    }

    /// The backing heap with the given index.
    pub fn with_heap<R>(
        &self,
        heap_index: u32,
        f: impl FnOnce(&DescriptorHeap<D::DescriptorHeap>) -> R,
    ) -> Option<R> {
        let state = self.state.lock();
        state.heaps.get(heap_index as usize).map(|heap| f(&heap.heap))
    }

    fn take_slot(
        &self,
        state: &mut OfflineState<D::DescriptorHeap>,
    ) -> Result<OfflineSlot, HeapAllocatorError> {
        let heap_index = match state.available.last() {
            Some(&index) => index,
            None => self.grow(state)?,
        };

        let heap = &mut state.heaps[heap_index as usize];
        let Some(slot) = heap.take_slot() else {
            unreachable!("offline heap {heap_index} is listed as available but is full")
        };
        let address = heap.heap.cpu_slot_address(slot);

        if heap.free_count == 0 {
            state.available.pop();
        }

        Ok(OfflineSlot {
            address,
            heap_index,
        })
    }

    fn grow(&self, state: &mut OfflineState<D::DescriptorHeap>) -> Result<u32, HeapAllocatorError> {
        let heap_index = state.heaps.len() as u32;
        let desc = DescriptorHeapDesc::new(self.desc.ty, self.desc.heap_size)
            .with_name(format!("offline {:?} heap {heap_index}", self.desc.ty));
        let heap = DescriptorHeap::new(&self.device, &desc)?;

        tracing::debug!(
            ty = ?self.desc.ty,
            heaps = heap_index + 1,
            "grew offline descriptor pool"
        );

        state.heaps.push(OfflineHeap::new(heap));
        state.available.push(heap_index);
        Ok(heap_index)
    }
}
