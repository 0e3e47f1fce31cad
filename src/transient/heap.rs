use crate::resource::{HeapCategory, PassIndex};

/// One physical memory heap that transient resources are placed in.
///
/// Heaps are created on demand by the
/// [`TransientHeapCache`](super::TransientHeapCache) and shared with every
/// resource placed in them.
#[derive(Debug)]
pub struct TransientHeap<H> {
    raw: H,
    id: u64,
    size: u64,
    alignment: u64,
    category: HeapCategory,
    gpu_virtual_address: Option<u64>,
}

impl<H> TransientHeap<H> {
    pub(crate) fn new(
        raw: H,
        id: u64,
        size: u64,
        alignment: u64,
        category: HeapCategory,
        gpu_virtual_address: Option<u64>,
    ) -> Self {
        Self {
            raw,
            id,
            size,
            alignment,
            category,
            gpu_virtual_address,
        }
    }

    /// The native heap object.
    pub fn raw(&self) -> &H {
        &self.raw
    }

    /// Identity of the heap within its cache.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Alignment of the heap's base address.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Which resources may be placed in the heap.
    pub fn category(&self) -> HeapCategory {
        self.category
    }

    /// GPU virtual address of the first byte, where the platform exposes one.
    pub fn gpu_virtual_address(&self) -> Option<u64> {
        self.gpu_virtual_address
    }

    /// Whether a resource of `alignment` needing a heap of `category` fits
    /// this heap's rules.
    pub(crate) fn accepts(&self, category: HeapCategory, alignment: u64) -> bool {
        self.category == category && alignment <= self.alignment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    offset: u64,
    size: u64,
    first_pass: PassIndex,
    last_pass: Option<PassIndex>,
}

impl Placement {
    // Live placements conflict with everything after them.
    fn conflicts_with(&self, first_pass: PassIndex) -> bool {
        self.last_pass.map_or(true, |last| last >= first_pass)
    }
}

/// Byte ranges placed in one heap during one frame.
///
/// A range may be reused by a request whose first pass comes after the
/// range's last pass. Placement is first-fit: the lowest aligned offset that
/// does not intersect a conflicting range wins.
#[derive(Debug, Default)]
pub(crate) struct HeapPlacements {
    placements: Vec<Placement>,
    high_water_mark: u64,
    allocated_bytes: u64,
}

impl HeapPlacements {
    /// Find an offset for `size` bytes aligned to `alignment` that is free
    /// from `first_pass` onwards.
    pub(crate) fn find_offset(
        &self,
        heap_size: u64,
        size: u64,
        alignment: u64,
        first_pass: PassIndex,
    ) -> Option<u64> {
        let mut busy: Vec<(u64, u64)> = self
            .placements
            .iter()
            .filter(|placement| placement.conflicts_with(first_pass))
            .map(|placement| (placement.offset, placement.offset + placement.size))
            .collect();
        busy.sort_unstable();

        let mut cursor = 0;
        for (start, end) in busy {
            let candidate = align_up(cursor, alignment);
            if candidate + size <= start {
                return Some(candidate);
            }
            cursor = cursor.max(end);
        }

        let candidate = align_up(cursor, alignment);
        (candidate + size <= heap_size).then_some(candidate)
    }

    /// Record a placement, returning its index.
    pub(crate) fn insert(&mut self, offset: u64, size: u64, first_pass: PassIndex) -> usize {
        self.placements.push(Placement {
            offset,
            size,
            first_pass,
            last_pass: None,
        });
        self.high_water_mark = self.high_water_mark.max(offset + size);
        self.allocated_bytes += size;
        self.placements.len() - 1
    }

    /// Mark a placement's range reusable after `last_pass`.
    ///
    /// ## Panics
    /// Panics if the placement was already released, or if `last_pass`
    /// precedes the pass it was allocated in.
    pub(crate) fn release(&mut self, index: usize, last_pass: PassIndex) {
        let placement = &mut self.placements[index];
        assert!(
            placement.last_pass.is_none(),
            "transient allocation at offset {} released twice",
            placement.offset
        );
        assert!(
            last_pass >= placement.first_pass,
            "transient allocation released at pass {last_pass} before its first pass {}",
            placement.first_pass
        );
        placement.last_pass = Some(last_pass);
    }

    pub(crate) fn high_water_mark(&self) -> u64 {
        self.high_water_mark
    }

    pub(crate) fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.placements.len()
    }

    pub(crate) fn is_used(&self) -> bool {
        !self.placements.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn ranges(&self) -> impl Iterator<Item = (u64, u64, PassIndex, PassIndex)> + '_ {
        self.placements.iter().map(|placement| {
            (
                placement.offset,
                placement.offset + placement.size,
                placement.first_pass,
                placement.last_pass.unwrap_or(PassIndex::MAX),
            )
        })
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
