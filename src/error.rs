/// Error type for heap allocation failures.
///
/// Exhaustion errors are recoverable: the caller may grow capacity, fall back
/// to another manager, or defer the request to a later frame. Misuse of the
/// allocators (double frees, foreign handles) is not reported here; it panics.
#[derive(Debug, thiserror::Error)]
pub enum HeapAllocatorError {
    /// The heap has no more available descriptors
    #[error("The descriptor heap of size {capacity} has no room for {requested} more descriptors")]
    HeapOverflow {
        /// The number of descriptors in the heap.
        capacity: usize,
        /// The number of contiguous descriptors that were requested.
        requested: usize,
    },
    /// Every online descriptor block is either handed out or still awaiting its sync point.
    #[error("All {0} online descriptor blocks are in use or awaiting GPU completion")]
    NoFreeBlock(usize),
    /// The heap is too small to fit the number of requested reserved descriptors.
    #[error("The heap only has {available} descriptors free but {requested} reserved descriptors were requested.")]
    HeapUndersized {
        /// The number of requested reserved descriptors.
        requested: usize,
        /// The number of descriptors available.
        available: usize,
    },
    /// The partition scheme requested is not total, and there are remaining available descriptors
    #[error("The requested partitioning is incomplete with {0} remainder descriptors.")]
    IncompletePartitioning(usize),
    /// The transient allocator was frozen and accepts no further requests for this frame.
    #[error("The transient resource allocator has been frozen for this frame")]
    Frozen,
    /// The platform failed to create a heap or resource.
    #[error("Platform allocation failed: {0}")]
    Platform(String),
    /// A Direct3D 12 call failed.
    #[cfg(windows)]
    #[error(transparent)]
    Windows(#[from] windows::core::Error),
}

impl HeapAllocatorError {
    /// Whether the error reports exhaustion that the caller can recover from.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            HeapAllocatorError::HeapOverflow { .. } | HeapAllocatorError::NoFreeBlock(_)
        )
    }
}
