use std::ops::Range;

/// A first-fit free-list allocator over the index space `[0, capacity)`.
///
/// The allocator only hands out indices; it owns no storage. Free ranges are
/// kept sorted and adjacent ranges are merged when freed, so a fully released
/// allocator always collapses back to a single range.
///
/// The allocator is not synchronized. Owners serialize access to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedRangeAllocator {
    capacity: u32,
    free: Vec<Range<u32>>,
}

impl FixedRangeAllocator {
    /// Create an allocator with every index free.
    pub fn new(capacity: u32) -> Self {
        let mut allocator = Self {
            capacity: 0,
            free: Vec::new(),
        };
        allocator.reset(capacity);
        allocator
    }

    /// Forget all allocations and resize to `capacity`.
    pub fn reset(&mut self, capacity: u32) {
        self.capacity = capacity;
        self.free.clear();
        if capacity > 0 {
            self.free.push(0..capacity);
        }
    }

    /// Allocate `count` contiguous indices, returning the first.
    ///
    /// Returns `None` if no free range is long enough.
    ///
    /// ## Panics
    /// Panics if `count` is zero.
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        assert!(count > 0, "cannot allocate an empty range");

        let index = self
            .free
            .iter()
            .position(|range| range.end - range.start >= count)?;

        let range = &mut self.free[index];
        let start = range.start;
        range.start += count;
        if range.is_empty() {
            self.free.remove(index);
        }

        Some(start)
    }

    /// Return `count` indices starting at `start`.
    ///
    /// ## Panics
    /// Panics if the range lies outside the allocator or overlaps indices that
    /// are already free. Either means the caller freed something it did not own.
    pub fn free(&mut self, start: u32, count: u32) {
        assert!(count > 0, "cannot free an empty range");
        assert!(
            start < self.capacity && count <= self.capacity - start,
            "range {start}+{count} lies outside the allocator capacity {}",
            self.capacity
        );

        let end = start + count;
        // First free range ending after `start`; everything before it ends at or before `start`.
        let index = self.free.partition_point(|range| range.end <= start);

        if let Some(next) = self.free.get(index) {
            assert!(
                next.start >= end,
                "range {start}..{end} overlaps free range {next:?}; freed twice?"
            );
        }

        let merge_prev = index > 0 && self.free[index - 1].end == start;
        let merge_next = self.free.get(index).map_or(false, |next| next.start == end);

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].end = next.end;
            }
            (true, false) => self.free[index - 1].end = end,
            (false, true) => self.free[index].start = start,
            (false, false) => self.free.insert(index, start..end),
        }
    }

    /// Total number of indices.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of free indices.
    pub fn free_count(&self) -> u32 {
        self.free.iter().map(|range| range.end - range.start).sum()
    }

    /// Number of allocated indices.
    pub fn allocated_count(&self) -> u32 {
        self.capacity - self.free_count()
    }

    /// Length of the longest free range, the largest request that can succeed.
    pub fn largest_free_range(&self) -> u32 {
        self.free
            .iter()
            .map(|range| range.end - range.start)
            .max()
            .unwrap_or(0)
    }

    /// The free ranges in ascending order.
    pub fn free_ranges(&self) -> impl Iterator<Item = Range<u32>> + '_ {
        self.free.iter().cloned()
    }
}
