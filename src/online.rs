//! Shader-visible descriptor blocks with GPU-gated reuse.
//!
//! The online heap is the one table bound while recording command lists, so
//! it is split into equal blocks that recording threads take, fill and hand
//! back. A block handed back is not reused until the sync point it was
//! released with has signaled, because the GPU may still be reading the
//! descriptors written into it.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::descriptor_heap::{DescriptorHeap, HeapId};
use crate::descriptor_manager::DescriptorManager;
use crate::error::HeapAllocatorError;
use crate::platform::{
    CpuDescriptorHandle, DescriptorDevice, DescriptorHeapDesc, DescriptorHeapType,
    GpuDescriptorHandle, SyncPoint,
};

/// Configuration of an [`OnlineDescriptorManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineDescriptorManagerDesc {
    /// Descriptor type; must be shader visible capable.
    pub ty: DescriptorHeapType,
    /// Total number of slots in the heap.
    pub total_size: u32,
    /// Slots per block.
    pub block_size: u32,
    /// Slots at the end of the heap set aside for persistent descriptors.
    pub reserved: u32,
    /// Debug name of the heap.
    pub name: String,
}

impl Default for OnlineDescriptorManagerDesc {
    fn default() -> Self {
        Self {
            ty: DescriptorHeapType::ResourceView,
            total_size: 500_000,
            block_size: 2_000,
            reserved: 0,
            name: "online descriptor heap".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Free,
    Allocated,
    PendingRelease(u64),
}

struct OnlineState {
    blocks: Vec<BlockState>,
    free: VecDeque<u32>,
    pending: Vec<u32>,
}

impl OnlineState {
    fn update_free_blocks(&mut self, sync: &impl SyncPoint) -> usize {
        let OnlineState {
            blocks,
            free,
            pending,
        } = self;

        let before = free.len();
        pending.retain(|&block| {
            let state = blocks[block as usize];
            match state {
                BlockState::PendingRelease(value) if sync.has_signaled(value) => {
                    blocks[block as usize] = BlockState::Free;
                    free.push_back(block);
                    false
                }
                _ => true,
            }
        });

        let recycled = free.len() - before;
        if recycled > 0 {
            tracing::trace!(
                recycled,
                pending = pending.len(),
                "recycled online descriptor blocks"
            );
        }
        recycled
    }

    fn oldest_pending_value(&self) -> Option<u64> {
        self.pending
            .iter()
            .filter_map(|&block| match self.blocks[block as usize] {
                BlockState::PendingRelease(value) => Some(value),
                _ => None,
            })
            .min()
    }
}

/// A block of contiguous shader-visible descriptors.
///
/// The block is exclusively owned by the caller between
/// [`OnlineDescriptorManager::allocate_heap_block`] and
/// [`OnlineDescriptorManager::free_heap_block`].
#[derive(Debug, PartialEq, Eq)]
pub struct OnlineDescriptorBlock {
    heap: HeapId,
    index: u32,
    base_slot: u32,
    size: u32,
    used: u32,
    stride: u32,
    cpu_start: CpuDescriptorHandle,
    gpu_start: GpuDescriptorHandle,
}

impl OnlineDescriptorBlock {
    /// Index of the block within its manager.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// First slot of the block in the online heap.
    pub fn base_slot(&self) -> u32 {
        self.base_slot
    }

    /// Number of slots in the block.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of slots handed out by [`allocate_slots`](Self::allocate_slots).
    pub fn slots_used(&self) -> u32 {
        self.used
    }

    /// Number of slots still available.
    pub fn slots_remaining(&self) -> u32 {
        self.size - self.used
    }

    /// Take `count` consecutive slots from the block, returning the first
    /// one's index within the block.
    pub fn allocate_slots(&mut self, count: u32) -> Option<u32> {
        if count > self.slots_remaining() {
            return None;
        }
        let first = self.used;
        self.used += count;
        Some(first)
    }

    /// CPU address of slot `i` of the block.
    pub fn cpu_slot_handle(&self, i: u32) -> CpuDescriptorHandle {
        debug_assert!(i < self.size);
        self.cpu_start.offset(i, self.stride)
    }

    /// GPU address of slot `i` of the block.
    pub fn gpu_slot_handle(&self, i: u32) -> GpuDescriptorHandle {
        debug_assert!(i < self.size);
        self.gpu_start.offset(i, self.stride)
    }
}

/// Allocator of shader-visible descriptor blocks, reusing blocks only once
/// the GPU has finished with them.
pub struct OnlineDescriptorManager<D: DescriptorDevice, S: SyncPoint> {
    device: D,
    sync: S,
    heap: HeapId,
    blocks: Vec<DescriptorHeap<D::DescriptorHeap>>,
    reserved: Option<DescriptorManager<D>>,
    state: Mutex<OnlineState>,
}

impl<D: DescriptorDevice + Clone, S: SyncPoint> OnlineDescriptorManager<D, S> {
    /// Create the online heap and split it into blocks.
    ///
    /// `desc.total_size - desc.reserved` must be a multiple of
    /// `desc.block_size`.
    pub fn new(
        device: D,
        sync: S,
        desc: &OnlineDescriptorManagerDesc,
    ) -> Result<Self, HeapAllocatorError> {
        assert!(desc.block_size > 0, "online blocks must hold at least one slot");

        let heap_desc = DescriptorHeapDesc::new(desc.ty, desc.total_size)
            .shader_visible()
            .with_name(desc.name.clone());
        let heap = DescriptorHeap::new(&device, &heap_desc)?;
        if heap.gpu_slot_address(0).is_none() {
            return Err(HeapAllocatorError::Platform(
                "shader visible descriptor heap has no GPU address".into(),
            ));
        }

        let heap_id = heap.id();
        let partitioned = heap.partition(desc.block_size, desc.reserved)?;
        let block_count = partitioned.partitioned.len();
        let reserved = partitioned
            .reserved
            .map(|heap| DescriptorManager::from_heap(device.clone(), heap));

        tracing::debug!(
            heap = ?heap_id,
            blocks = block_count,
            block_size = desc.block_size,
            reserved = desc.reserved,
            "partitioned online descriptor heap"
        );

        Ok(Self {
            device,
            sync,
            heap: heap_id,
            blocks: partitioned.partitioned,
            reserved,
            state: Mutex::new(OnlineState {
                blocks: vec![BlockState::Free; block_count],
                free: (0..block_count as u32).collect(),
                pending: Vec::new(),
            }),
        })
    }
}

impl<D: DescriptorDevice, S: SyncPoint> OnlineDescriptorManager<D, S> {
    /// Move every pending block whose sync point has signaled back to the free
    /// queue. Polls the sync point; never waits.
    ///
    /// Returns the number of blocks recycled.
    pub fn update_free_blocks(&self) -> usize {
        self.state.lock().update_free_blocks(&self.sync)
    }

    /// Take a free block.
    ///
    /// Returns [`HeapAllocatorError::NoFreeBlock`] if every block is allocated
    /// or still waiting for the GPU.
    pub fn allocate_heap_block(&self) -> Result<OnlineDescriptorBlock, HeapAllocatorError> {
        let mut state = self.state.lock();
        state.update_free_blocks(&self.sync);

        let Some(index) = state.free.pop_front() else {
            tracing::warn!(
                heap = ?self.heap,
                blocks = self.blocks.len(),
                pending = state.pending.len(),
                "no free online descriptor block"
            );
            return Err(HeapAllocatorError::NoFreeBlock(self.blocks.len()));
        };

        debug_assert_eq!(state.blocks[index as usize], BlockState::Free);
        state.blocks[index as usize] = BlockState::Allocated;
        drop(state);

        Ok(self.make_block(index))
    }

    /// Take a free block, waiting up to `timeout` for the oldest pending block
    /// to be released by the GPU if none is free.
    pub fn allocate_heap_block_or_wait(
        &self,
        timeout: Duration,
    ) -> Result<OnlineDescriptorBlock, HeapAllocatorError> {
        match self.allocate_heap_block() {
            Err(HeapAllocatorError::NoFreeBlock(blocks)) => {
                let Some(value) = self.state.lock().oldest_pending_value() else {
                    return Err(HeapAllocatorError::NoFreeBlock(blocks));
                };

                tracing::debug!(value, ?timeout, "waiting for online descriptor block");
                if !self.sync.wait(value, timeout) {
                    return Err(HeapAllocatorError::NoFreeBlock(blocks));
                }
                self.allocate_heap_block()
            }
            result => result,
        }
    }

    /// Retire a block. It is reused once `sync_value` has signaled.
    ///
    /// ## Panics
    /// Panics if the block came from another manager.
    pub fn free_heap_block(&self, block: OnlineDescriptorBlock, sync_value: u64) {
        assert_eq!(
            block.heap, self.heap,
            "online descriptor block freed to a manager it was not allocated from"
        );

        let mut state = self.state.lock();
        let entry = &mut state.blocks[block.index as usize];
        assert_eq!(
            *entry,
            BlockState::Allocated,
            "online descriptor block {} is not allocated",
            block.index
        );
        *entry = BlockState::PendingRelease(sync_value);
        state.pending.push(block.index);
    }

    /// Copy `count` descriptors from `source` into the block starting at `slot`.
    ///
    /// ## Panics
    /// Panics if the block came from another manager or the copy overruns it.
    ///
    /// ## Safety
    /// `source` must point at `count` valid descriptors of the heap's type.
    pub unsafe fn copy_descriptors(
        &self,
        block: &OnlineDescriptorBlock,
        slot: u32,
        source: CpuDescriptorHandle,
        count: u32,
    ) {
        assert_eq!(
            block.heap, self.heap,
            "descriptors copied into a block of another manager"
        );
        assert!(
            count <= block.size && slot <= block.size - count,
            "copy of {count} descriptors at slot {slot} overruns block of {}",
            block.size
        );

        unsafe {
            self.device.copy_descriptors(
                block.cpu_slot_handle(slot),
                source,
                count,
                self.blocks[block.index as usize].ty(),
            )
        }
    }

    /// The manager for the reserved range at the end of the heap, if any.
    pub fn reserved(&self) -> Option<&DescriptorManager<D>> {
        self.reserved.as_ref()
    }

    /// The native online heap.
    pub fn raw_heap(&self) -> Option<&D::DescriptorHeap> {
        self.blocks
            .first()
            .map(DescriptorHeap::raw)
            .or_else(|| self.reserved.as_ref().map(|reserved| reserved.heap().raw()))
    }

    /// The sync point gating block reuse.
    pub fn sync_point(&self) -> &S {
        &self.sync
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks ready to be allocated, without polling the sync point.
    pub fn free_block_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of blocks waiting for their sync point.
    pub fn pending_block_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn make_block(&self, index: u32) -> OnlineDescriptorBlock {
        let heap = &self.blocks[index as usize];
        OnlineDescriptorBlock {
            heap: self.heap,
            index,
            base_slot: heap.parent().map_or(0, |parent| parent.offset),
            size: heap.len(),
            used: 0,
            stride: heap.stride(),
            cpu_start: heap.cpu_slot_address(0),
            gpu_start: heap.gpu_slot_address(0).unwrap_or_default(),
        }
    }
}
