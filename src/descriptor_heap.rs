use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::HeapAllocatorError;
use crate::platform::{
    CpuDescriptorHandle, DescriptorDevice, DescriptorHeapDesc, DescriptorHeapType,
    GpuDescriptorHandle, RawDescriptorHeap,
};
use crate::Arc;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of a descriptor heap or heap sub-range.
///
/// Handles carry the id of the heap they came from so that managers can
/// reject handles from other heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapId(u32);

impl HeapId {
    fn next() -> Self {
        HeapId(NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a sub-range heap lives inside its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapParent {
    /// The parent heap.
    pub id: HeapId,
    /// Slot offset of the sub-range's first slot in its immediate parent.
    pub offset: u32,
}

/// A table of fixed-size descriptor slots.
///
/// Either owns a physical heap, or is a sub-range of one. Sub-ranges share
/// the native heap object with their parent and compute addresses against
/// their own base, which is itself offset into the parent.
#[derive(Debug)]
pub struct DescriptorHeap<H> {
    raw: Arc<H>,
    id: HeapId,
    ty: DescriptorHeapType,
    shader_visible: bool,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,
    stride: u32,
    num_descriptors: u32,
    parent: Option<HeapParent>,
}

/// A descriptor heap partitioned into multiple parts.
#[derive(Debug)]
pub struct PartitionedHeap<H> {
    /// The equally-sized partitioned portions of the heap,
    pub partitioned: Vec<DescriptorHeap<H>>,
    /// The reserved portion at the end of the heap
    pub reserved: Option<DescriptorHeap<H>>,
}

impl<H> DescriptorHeap<H> {
    /// Create a physical heap on `device`.
    pub fn new<D>(device: &D, desc: &DescriptorHeapDesc) -> Result<Self, HeapAllocatorError>
    where
        D: DescriptorDevice<DescriptorHeap = H>,
    {
        assert!(
            !desc.shader_visible || desc.ty.can_be_shader_visible(),
            "{:?} heaps cannot be shader visible",
            desc.ty
        );

        let raw = device.create_descriptor_heap(desc)?;
        let stride = device.descriptor_stride(desc.ty);
        let heap = Self::from_raw(raw, desc, stride);

        tracing::debug!(
            heap = ?heap.id,
            ty = ?desc.ty,
            slots = desc.num_descriptors,
            shader_visible = desc.shader_visible,
            name = desc.name.as_deref().unwrap_or(""),
            "created descriptor heap"
        );

        Ok(heap)
    }

    /// Wrap a native heap created elsewhere.
    pub fn from_raw(raw: RawDescriptorHeap<H>, desc: &DescriptorHeapDesc, stride: u32) -> Self {
        let gpu_start = if desc.shader_visible {
            raw.gpu_start
        } else {
            None
        };

        DescriptorHeap {
            raw: Arc::new(raw.handle),
            id: HeapId::next(),
            ty: desc.ty,
            shader_visible: desc.shader_visible,
            cpu_start: raw.cpu_start,
            gpu_start,
            stride,
            num_descriptors: desc.num_descriptors,
            parent: None,
        }
    }

    /// CPU address of `slot`.
    pub fn cpu_slot_address(&self, slot: u32) -> CpuDescriptorHandle {
        debug_assert!(slot < self.num_descriptors, "slot {slot} out of range");
        self.cpu_start.offset(slot, self.stride)
    }

    /// GPU address of `slot`, if the heap is shader visible.
    pub fn gpu_slot_address(&self, slot: u32) -> Option<GpuDescriptorHandle> {
        debug_assert!(slot < self.num_descriptors, "slot {slot} out of range");
        self.gpu_start.map(|start| start.offset(slot, self.stride))
    }

    /// The slot that `address` points at, if it belongs to this heap.
    pub fn slot_of(&self, address: CpuDescriptorHandle) -> Option<u32> {
        let offset = address.ptr.checked_sub(self.cpu_start.ptr)?;
        let stride = self.stride as usize;
        // A zero stride maps every slot to the base address.
        if offset.checked_rem(stride)? != 0 {
            return None;
        }

        u32::try_from(offset / stride)
            .ok()
            .filter(|&slot| slot < self.num_descriptors)
    }

    /// Carve out `count` slots starting at `offset` as a child heap.
    pub fn sub_range(&self, offset: u32, count: u32) -> Result<Self, HeapAllocatorError> {
        if offset > self.num_descriptors || count > self.num_descriptors - offset {
            return Err(HeapAllocatorError::HeapUndersized {
                requested: offset as usize + count as usize,
                available: self.num_descriptors as usize,
            });
        }

        Ok(DescriptorHeap {
            raw: Arc::clone(&self.raw),
            id: HeapId::next(),
            ty: self.ty,
            shader_visible: self.shader_visible,
            cpu_start: self.cpu_start.offset(offset, self.stride),
            gpu_start: self.gpu_start.map(|start| start.offset(offset, self.stride)),
            stride: self.stride,
            num_descriptors: count,
            parent: Some(HeapParent {
                id: self.id,
                offset,
            }),
        })
    }

    /// Partitions this heap into equally sized chunks, followed by a number of
    /// reserved descriptors at the end of the heap.
    ///
    /// The partitioning must be **total**; that is the size of each partition must divide equally
    /// into the size of the heap, minus the number of reserved descriptors.
    pub fn partition(
        self,
        size: u32,
        reserved: u32,
    ) -> Result<PartitionedHeap<H>, HeapAllocatorError> {
        assert!(size > 0, "partitions must hold at least one descriptor");

        if reserved > self.num_descriptors {
            return Err(HeapAllocatorError::HeapUndersized {
                requested: reserved as usize,
                available: self.num_descriptors as usize,
            });
        }

        let num_descriptors = self.num_descriptors - reserved;
        let remainder = num_descriptors % size;
        if remainder != 0 {
            return Err(HeapAllocatorError::IncompletePartitioning(remainder as usize));
        }

        let partitioned = (0..num_descriptors / size)
            .map(|i| self.sub_range(i * size, size))
            .collect::<Result<Vec<_>, _>>()?;

        let reserved = if reserved != 0 {
            Some(self.sub_range(num_descriptors, reserved)?)
        } else {
            None
        };

        Ok(PartitionedHeap {
            partitioned,
            reserved,
        })
    }

    /// The native heap object.
    pub fn raw(&self) -> &H {
        &self.raw
    }

    /// The heap's identity.
    pub fn id(&self) -> HeapId {
        self.id
    }

    /// The descriptor type.
    pub fn ty(&self) -> DescriptorHeapType {
        self.ty
    }

    /// Whether the heap is shader visible.
    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }

    /// Number of slots.
    pub fn len(&self) -> u32 {
        self.num_descriptors
    }

    /// Whether the heap has no slots.
    pub fn is_empty(&self) -> bool {
        self.num_descriptors == 0
    }

    /// Size of one slot in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// The parent heap if this is a sub-range.
    pub fn parent(&self) -> Option<HeapParent> {
        self.parent
    }
}
