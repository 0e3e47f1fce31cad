//! Placement of render-graph scoped textures and buffers into shared heaps.
//!
//! A [`TransientHeapCache`] owns the physical heaps across frames. Each frame
//! gets a [`TransientResourceAllocator`] which places resources into those
//! heaps, letting resources whose pass lifetimes do not overlap alias the
//! same memory.

mod allocator;
mod heap;

pub use allocator::{
    HeapPooling, TransientAllocation, TransientAllocatorStats, TransientHeapCache,
    TransientHeapCacheDesc, TransientHeapStats, TransientResource, TransientResourceAllocator,
};
pub use heap::TransientHeap;
