use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::heap::{align_up, HeapPlacements, TransientHeap};
use crate::error::HeapAllocatorError;
use crate::platform::{ResourceHeapTier, TransientDevice, TransientHeapDesc};
use crate::resource::{AllocationInfo, HeapCategory, PassIndex, ResourceDesc};
use crate::Arc;

const MIB: u64 = 1024 * 1024;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration of a [`TransientHeapCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientHeapCacheDesc {
    /// Smallest heap the cache creates, in bytes.
    pub minimum_heap_size: u64,
    /// Base alignment of every heap, in bytes. Must be a power of two.
    pub heap_alignment: u64,
    /// Largest single resource the cache accepts, in bytes.
    pub maximum_heap_size: u64,
    /// Frames a heap may go unused before it is released.
    pub garbage_collect_latency: u64,
}

impl Default for TransientHeapCacheDesc {
    fn default() -> Self {
        Self {
            minimum_heap_size: 128 * MIB,
            heap_alignment: 64 * 1024,
            maximum_heap_size: 1024 * MIB,
            garbage_collect_latency: 16,
        }
    }
}

/// How heaps are split between resource categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapPooling {
    /// Every resource shares one pool of [`HeapCategory::Mixed`] heaps.
    Shared,
    /// Buffers, textures and render targets each get their own heaps.
    PerCategory,
}

impl HeapPooling {
    /// The pooling a resource heap tier allows.
    pub fn for_tier(tier: ResourceHeapTier) -> Self {
        match tier {
            ResourceHeapTier::Tier1 => HeapPooling::PerCategory,
            ResourceHeapTier::Tier2 => HeapPooling::Shared,
        }
    }
}

#[derive(Debug)]
struct CachedHeap<H> {
    heap: Arc<TransientHeap<H>>,
    last_used_frame: u64,
}

#[derive(Debug)]
struct CacheState<H> {
    heaps: Vec<CachedHeap<H>>,
    next_heap_id: u64,
}

/// The set of physical heaps transient resources are placed in.
///
/// Heaps outlive frames. Each frame gets a fresh
/// [`TransientResourceAllocator`] from [`begin_frame`](Self::begin_frame)
/// that places that frame's resources into the cached heaps, creating more
/// when nothing fits. Heaps that have not been used for
/// [`garbage_collect_latency`](TransientHeapCacheDesc::garbage_collect_latency)
/// frames are released at the start of a frame.
pub struct TransientHeapCache<D: TransientDevice> {
    id: u64,
    device: D,
    desc: TransientHeapCacheDesc,
    pooling: HeapPooling,
    not_zeroed: bool,
    frame: u64,
    state: Mutex<CacheState<D::Heap>>,
}

impl<D: TransientDevice> TransientHeapCache<D> {
    /// Create an empty cache. The device's heap tier is queried once here.
    pub fn new(device: D, desc: TransientHeapCacheDesc) -> Self {
        assert!(
            desc.heap_alignment.is_power_of_two(),
            "transient heap alignment {} is not a power of two",
            desc.heap_alignment
        );
        assert!(
            desc.minimum_heap_size <= desc.maximum_heap_size,
            "minimum transient heap size exceeds the maximum"
        );

        let tier = device.resource_heap_tier();
        let pooling = HeapPooling::for_tier(tier);
        let not_zeroed = device.supports_not_zeroed_heaps();
        tracing::debug!(?tier, ?pooling, not_zeroed, "created transient heap cache");

        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            device,
            desc,
            pooling,
            not_zeroed,
            frame: 0,
            state: Mutex::new(CacheState {
                heaps: Vec::new(),
                next_heap_id: 0,
            }),
        }
    }

    /// Start a new frame, releasing heaps that have been idle for too long.
    pub fn begin_frame(&mut self) -> TransientResourceAllocator<'_, D> {
        self.frame += 1;
        let frame = self.frame;
        let latency = self.desc.garbage_collect_latency;

        let state = self.state.get_mut();
        let before = state.heaps.len();
        state
            .heaps
            .retain(|cached| frame - cached.last_used_frame <= latency);

        let collected = before - state.heaps.len();
        if collected > 0 {
            tracing::info!(
                frame,
                collected,
                remaining = state.heaps.len(),
                "released idle transient heaps"
            );
        }

        let heaps = state
            .heaps
            .iter()
            .map(|cached| FrameHeap::new(Arc::clone(&cached.heap)))
            .collect();

        TransientResourceAllocator {
            cache: self,
            frame,
            state: Mutex::new(FrameState {
                heaps,
                frozen: false,
            }),
        }
    }

    /// Whether one heap may hold every category of resource.
    pub fn supports_all_heap_flags(&self) -> bool {
        self.pooling == HeapPooling::Shared
    }

    /// How heaps are split between resource categories.
    pub fn pooling(&self) -> HeapPooling {
        self.pooling
    }

    /// The number of frames begun so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Number of heaps in the cache.
    pub fn heap_count(&self) -> usize {
        self.state.lock().heaps.len()
    }

    /// Sum of the sizes of every heap in the cache.
    pub fn total_heap_bytes(&self) -> u64 {
        self.state
            .lock()
            .heaps
            .iter()
            .map(|cached| cached.heap.size())
            .sum()
    }

    /// The device heaps and resources are created on.
    pub fn device(&self) -> &D {
        &self.device
    }

    fn create_heap(
        &self,
        category: HeapCategory,
        info: &AllocationInfo,
    ) -> Result<Arc<TransientHeap<D::Heap>>, HeapAllocatorError> {
        let alignment = self.desc.heap_alignment.max(info.alignment);
        let size = align_up(info.size, alignment).max(self.desc.minimum_heap_size);
        let desc = TransientHeapDesc {
            size,
            alignment,
            category,
            not_zeroed: self.not_zeroed,
            high_residency_priority: true,
        };

        let raw = self.device.create_heap(&desc).map_err(|err| {
            tracing::warn!(size, ?category, %err, "failed to create transient heap");
            err
        })?;

        let mut state = self.state.lock();
        let id = state.next_heap_id;
        state.next_heap_id += 1;

        let heap = Arc::new(TransientHeap::new(
            raw.handle,
            id,
            size,
            alignment,
            category,
            raw.gpu_virtual_address,
        ));
        state.heaps.push(CachedHeap {
            heap: Arc::clone(&heap),
            last_used_frame: self.frame,
        });

        tracing::debug!(
            id,
            size,
            alignment,
            ?category,
            heaps = state.heaps.len(),
            "created transient heap"
        );
        Ok(heap)
    }
}

/// Where a transient resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientAllocation {
    cache: u64,
    heap_id: u64,
    offset: u64,
    size: u64,
    first_pass: PassIndex,
    frame: u64,
    slot: usize,
    placement: usize,
}

impl TransientAllocation {
    /// The heap the resource was placed in.
    pub fn heap_id(&self) -> u64 {
        self.heap_id
    }

    /// Byte offset of the resource inside its heap.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the resource in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The first pass the resource is used in.
    pub fn first_pass(&self) -> PassIndex {
        self.first_pass
    }

    /// The frame the resource was allocated in.
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

/// A resource placed in a transient heap.
///
/// The heap stays alive for as long as the resource does, even if the cache
/// releases it in the meantime.
#[derive(Debug)]
pub struct TransientResource<R, H> {
    resource: R,
    heap: Arc<TransientHeap<H>>,
    allocation: TransientAllocation,
}

impl<R, H> TransientResource<R, H> {
    /// The native resource.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// The heap the resource aliases.
    pub fn heap(&self) -> &TransientHeap<H> {
        &self.heap
    }

    /// Where the resource lives in its heap.
    pub fn allocation(&self) -> &TransientAllocation {
        &self.allocation
    }

    /// GPU virtual address of the first byte, where the platform exposes one.
    pub fn gpu_virtual_address(&self) -> Option<u64> {
        self.heap
            .gpu_virtual_address()
            .map(|base| base + self.allocation.offset)
    }

    /// Take the native resource, dropping the heap reference.
    pub fn into_resource(self) -> R {
        self.resource
    }
}

/// Usage of one heap during a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientHeapStats {
    /// The heap.
    pub heap_id: u64,
    /// Which resources the heap accepts.
    pub category: HeapCategory,
    /// Heap size in bytes.
    pub size: u64,
    /// End of the highest byte range placed this frame.
    pub high_water_mark: u64,
    /// Sum of the sizes of every placement, counting aliased bytes once per resource.
    pub allocated_bytes: u64,
    /// Number of resources placed this frame.
    pub allocation_count: usize,
}

impl TransientHeapStats {
    /// Fraction of the heap below the high-water mark.
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.high_water_mark as f64 / self.size as f64
    }
}

/// Statistics of a frozen frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TransientAllocatorStats {
    /// The frame the statistics describe.
    pub frame: u64,
    /// Sum of the sizes of every heap available to the frame.
    pub total_heap_bytes: u64,
    /// Sum of the sizes of every resource placed during the frame.
    pub total_allocated_bytes: u64,
    /// Per heap usage, in heap creation order.
    pub heaps: Vec<TransientHeapStats>,
}

impl TransientAllocatorStats {
    /// Fraction of all heap memory below the heaps' high-water marks.
    pub fn utilization(&self) -> f64 {
        if self.total_heap_bytes == 0 {
            return 0.0;
        }
        let used: u64 = self.heaps.iter().map(|heap| heap.high_water_mark).sum();
        used as f64 / self.total_heap_bytes as f64
    }
}

#[derive(Debug)]
struct FrameHeap<H> {
    heap: Arc<TransientHeap<H>>,
    placements: HeapPlacements,
}

impl<H> FrameHeap<H> {
    fn new(heap: Arc<TransientHeap<H>>) -> Self {
        Self {
            heap,
            placements: HeapPlacements::default(),
        }
    }
}

#[derive(Debug)]
struct FrameState<H> {
    heaps: Vec<FrameHeap<H>>,
    frozen: bool,
}

/// Places one frame's transient resources into a [`TransientHeapCache`].
///
/// Resources whose pass lifetimes do not overlap may share memory. A range
/// becomes reusable for passes after the one given to
/// [`deallocate_memory`](Self::deallocate_memory); until then it is never
/// handed out again.
pub struct TransientResourceAllocator<'a, D: TransientDevice> {
    cache: &'a TransientHeapCache<D>,
    frame: u64,
    state: Mutex<FrameState<D::Heap>>,
}

impl<'a, D: TransientDevice> TransientResourceAllocator<'a, D> {
    /// Place a texture first used in `pass`.
    pub fn create_texture(
        &self,
        desc: &ResourceDesc,
        debug_name: &str,
        pass: PassIndex,
    ) -> Result<TransientResource<D::Resource, D::Heap>, HeapAllocatorError> {
        debug_assert!(!desc.is_buffer(), "{debug_name:?} is a buffer");
        self.create_resource(desc, debug_name, pass)
    }

    /// Place a buffer first used in `pass`.
    pub fn create_buffer(
        &self,
        desc: &ResourceDesc,
        debug_name: &str,
        pass: PassIndex,
    ) -> Result<TransientResource<D::Resource, D::Heap>, HeapAllocatorError> {
        debug_assert!(desc.is_buffer(), "{debug_name:?} is not a buffer");
        self.create_resource(desc, debug_name, pass)
    }

    /// Mark the resource's memory reusable by passes after `pass`.
    ///
    /// The native resource is not destroyed and its heap stays alive.
    ///
    /// ## Panics
    /// Panics if the resource was allocated by another cache or in another
    /// frame, was already deallocated, or if `pass` precedes its first pass.
    pub fn deallocate_memory(
        &self,
        resource: &TransientResource<D::Resource, D::Heap>,
        pass: PassIndex,
    ) {
        let allocation = &resource.allocation;
        assert_eq!(
            allocation.cache, self.cache.id,
            "transient resource deallocated in a cache it was not allocated from"
        );
        assert_eq!(
            allocation.frame, self.frame,
            "transient resource belongs to frame {}, not {}",
            allocation.frame, self.frame
        );

        let mut state = self.state.lock();
        let frame_heap = state
            .heaps
            .get_mut(allocation.slot)
            .filter(|frame_heap| frame_heap.heap.id() == allocation.heap_id);
        let Some(frame_heap) = frame_heap else {
            panic!(
                "transient heap {} is not in slot {} of this frame",
                allocation.heap_id, allocation.slot
            );
        };
        frame_heap
            .placements
            .release(allocation.placement, pass);
    }

    /// Finish the frame and report how the heaps were used.
    ///
    /// Any request made afterwards fails with [`HeapAllocatorError::Frozen`].
    pub fn freeze(&self) -> TransientAllocatorStats {
        let mut state = self.state.lock();
        state.frozen = true;

        let heaps: Vec<_> = state
            .heaps
            .iter()
            .map(|frame_heap| TransientHeapStats {
                heap_id: frame_heap.heap.id(),
                category: frame_heap.heap.category(),
                size: frame_heap.heap.size(),
                high_water_mark: frame_heap.placements.high_water_mark(),
                allocated_bytes: frame_heap.placements.allocated_bytes(),
                allocation_count: frame_heap.placements.allocation_count(),
            })
            .collect();

        let stats = TransientAllocatorStats {
            frame: self.frame,
            total_heap_bytes: heaps.iter().map(|heap| heap.size).sum(),
            total_allocated_bytes: heaps.iter().map(|heap| heap.allocated_bytes).sum(),
            heaps,
        };

        tracing::info!(
            frame = stats.frame,
            heaps = stats.heaps.len(),
            total_heap_bytes = stats.total_heap_bytes,
            total_allocated_bytes = stats.total_allocated_bytes,
            utilization = stats.utilization(),
            "froze transient resource allocator"
        );
        stats
    }

    /// The frame this allocator places resources for.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Whether [`freeze`](Self::freeze) has been called.
    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        debug_name: &str,
        pass: PassIndex,
    ) -> Result<TransientResource<D::Resource, D::Heap>, HeapAllocatorError> {
        let mut state = self.state.lock();
        if state.frozen {
            return Err(HeapAllocatorError::Frozen);
        }

        let cache = self.cache;
        let info = cache.device.allocation_info(desc);
        assert!(
            info.size <= cache.desc.maximum_heap_size,
            "transient resource {debug_name:?} of {} bytes exceeds the maximum heap size of {}",
            info.size,
            cache.desc.maximum_heap_size
        );

        let category = match cache.pooling {
            HeapPooling::Shared => HeapCategory::Mixed,
            HeapPooling::PerCategory => desc.category(),
        };

        let found = state
            .heaps
            .iter()
            .enumerate()
            .filter(|(_, frame_heap)| frame_heap.heap.accepts(category, info.alignment))
            .find_map(|(slot, frame_heap)| {
                frame_heap
                    .placements
                    .find_offset(frame_heap.heap.size(), info.size, info.alignment, pass)
                    .map(|offset| (slot, offset))
            });

        let (slot, offset) = match found {
            Some(found) => found,
            None => {
                let heap = cache.create_heap(category, &info)?;
                state.heaps.push(FrameHeap::new(heap));
                (state.heaps.len() - 1, 0)
            }
        };

        let frame_heap = &mut state.heaps[slot];
        let resource = cache.device.create_placed_resource(
            frame_heap.heap.raw(),
            offset,
            desc,
            desc.initial_state(),
            debug_name,
        )?;
        let placement = frame_heap.placements.insert(offset, info.size, pass);

        tracing::trace!(
            name = debug_name,
            heap = frame_heap.heap.id(),
            offset,
            size = info.size,
            pass,
            "placed transient resource"
        );

        Ok(TransientResource {
            resource,
            heap: Arc::clone(&frame_heap.heap),
            allocation: TransientAllocation {
                cache: cache.id,
                heap_id: frame_heap.heap.id(),
                offset,
                size: info.size,
                first_pass: pass,
                frame: self.frame,
                slot,
                placement,
            },
        })
    }
}

impl<D: TransientDevice> Drop for TransientResourceAllocator<'_, D> {
    fn drop(&mut self) {
        let used: Vec<u64> = self
            .state
            .get_mut()
            .heaps
            .iter()
            .filter(|frame_heap| frame_heap.placements.is_used())
            .map(|frame_heap| frame_heap.heap.id())
            .collect();

        let mut cache = self.cache.state.lock();
        for cached in &mut cache.heaps {
            if used.contains(&cached.heap.id()) {
                cached.last_used_frame = self.frame;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::mock::{MockHeap, MockResource, MockTransientDevice};
    use crate::resource::{Format, ResourceState, ResourceUsage};

    type Resource = TransientResource<MockResource, MockHeap>;

    fn cache(
        device: &MockTransientDevice,
        minimum_heap_size: u64,
    ) -> TransientHeapCache<MockTransientDevice> {
        TransientHeapCache::new(
            device.clone(),
            TransientHeapCacheDesc {
                minimum_heap_size,
                ..Default::default()
            },
        )
    }

    fn buffer(size: u64) -> ResourceDesc {
        ResourceDesc::buffer(size, ResourceUsage::UNORDERED_ACCESS)
    }

    #[test]
    fn retired_ranges_are_reused_by_later_passes() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2).with_alignment(256);
        let mut cache = cache(&device, 4 * MIB);
        let allocator = cache.begin_frame();

        // 512 x 512 x 4 bytes is exactly 1 MiB.
        let texture = ResourceDesc::texture_2d(
            512,
            512,
            Format::R8G8B8A8_UNORM,
            ResourceUsage::SHADER_RESOURCE,
        );
        let first = allocator.create_texture(&texture, "bloom", 2).unwrap();
        allocator.deallocate_memory(&first, 5);

        let second = allocator.create_buffer(&buffer(MIB), "histogram", 6).unwrap();

        assert_eq!(second.allocation().offset(), first.allocation().offset());
        assert_eq!(second.allocation().heap_id(), first.allocation().heap_id());
        assert_eq!(device.heaps().len(), 1);
    }

    #[test]
    fn overlapping_lifetimes_never_alias() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2).with_alignment(256);
        let mut cache = cache(&device, 4 * MIB);
        let allocator = cache.begin_frame();

        let first = allocator.create_buffer(&buffer(MIB), "a", 2).unwrap();
        allocator.deallocate_memory(&first, 5);
        let second = allocator.create_buffer(&buffer(MIB), "b", 5).unwrap();
        let third = allocator.create_buffer(&buffer(MIB), "c", 3).unwrap();

        assert_eq!(first.allocation().offset(), 0);
        assert_eq!(second.allocation().offset(), MIB);
        assert_eq!(third.allocation().offset(), 2 * MIB);
    }

    #[test]
    fn tier1_keeps_categories_apart() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier1);
        let mut cache = cache(&device, 4 * MIB);
        assert!(!cache.supports_all_heap_flags());
        let allocator = cache.begin_frame();

        let target = ResourceDesc::texture_2d(
            64,
            64,
            Format::R16G16B16A16_FLOAT,
            ResourceUsage::RENDER_TARGET,
        );
        let texture =
            ResourceDesc::texture_2d(64, 64, Format::R32_FLOAT, ResourceUsage::SHADER_RESOURCE);

        let a = allocator.create_buffer(&buffer(4096), "a", 0).unwrap();
        let b = allocator.create_texture(&target, "b", 0).unwrap();
        let c = allocator.create_texture(&texture, "c", 0).unwrap();
        let d = allocator.create_buffer(&buffer(4096), "d", 0).unwrap();

        assert_eq!(a.heap().category(), HeapCategory::Buffers);
        assert_eq!(b.heap().category(), HeapCategory::RenderTargets);
        assert_eq!(c.heap().category(), HeapCategory::Textures);
        assert_eq!(d.heap().id(), a.heap().id());
        assert_eq!(device.heaps().len(), 3);
    }

    #[test]
    fn tier2_shares_one_heap() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, 4 * MIB);
        assert!(cache.supports_all_heap_flags());
        let allocator = cache.begin_frame();

        let target = ResourceDesc::texture_2d(64, 64, Format::D32_FLOAT, ResourceUsage::DEPTH_STENCIL);
        let a = allocator.create_buffer(&buffer(4096), "a", 0).unwrap();
        let b = allocator.create_texture(&target, "b", 0).unwrap();

        assert_eq!(a.heap().id(), b.heap().id());
        assert_eq!(a.heap().category(), HeapCategory::Mixed);
    }

    #[test]
    fn heaps_are_sized_for_large_requests() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, MIB);
        let allocator = cache.begin_frame();

        allocator.create_buffer(&buffer(3 * MIB + 1), "big", 0).unwrap();
        let small = allocator.create_buffer(&buffer(1), "small", 0).unwrap();

        let heaps = device.heaps();
        assert_eq!(heaps[0].size, 3 * MIB + 64 * 1024);
        // The big buffer's last aligned block is taken, so the small one needs a fresh heap.
        assert_eq!(heaps[1].size, MIB);
        assert_eq!(small.allocation().heap_id(), 1);
        assert_eq!(small.allocation().offset(), 0);
    }

    #[test]
    fn heaps_request_not_zeroed_memory_where_supported() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, MIB);
        cache.begin_frame().create_buffer(&buffer(16), "a", 0).unwrap();

        let plain = MockTransientDevice::new(ResourceHeapTier::Tier2).without_not_zeroed();
        let mut plain_cache = self::cache(&plain, MIB);
        plain_cache.begin_frame().create_buffer(&buffer(16), "b", 0).unwrap();

        assert!(device.heaps()[0].not_zeroed);
        assert!(!plain.heaps()[0].not_zeroed);
        assert!(device.heaps()[0].high_residency_priority);
    }

    #[test]
    fn resources_start_in_the_state_their_usage_implies() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, MIB);
        let allocator = cache.begin_frame();

        let color = ResourceDesc::texture_2d(8, 8, Format::R8G8B8A8_UNORM, ResourceUsage::RENDER_TARGET);
        let depth = ResourceDesc::texture_2d(8, 8, Format::D32_FLOAT, ResourceUsage::DEPTH_STENCIL);
        let storage = ResourceDesc::texture_2d(8, 8, Format::R32_FLOAT, ResourceUsage::UNORDERED_ACCESS);

        let color = allocator.create_texture(&color, "gbuffer albedo", 0).unwrap();
        let depth = allocator.create_texture(&depth, "depth", 0).unwrap();
        let storage = allocator.create_texture(&storage, "ssao", 0).unwrap();

        assert_eq!(color.resource().state, ResourceState::RenderTarget);
        assert_eq!(depth.resource().state, ResourceState::DepthWrite);
        assert_eq!(storage.resource().state, ResourceState::UnorderedAccess);
        assert_eq!(color.resource().name, "gbuffer albedo");
        assert_eq!(
            depth.gpu_virtual_address(),
            depth
                .heap()
                .gpu_virtual_address()
                .map(|base| base + depth.allocation().offset())
        );
    }

    #[test]
    fn frozen_frames_reject_requests() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, 2 * MIB);
        let allocator = cache.begin_frame();

        allocator.create_buffer(&buffer(MIB), "a", 0).unwrap();
        allocator.create_buffer(&buffer(MIB / 2), "b", 0).unwrap();

        let stats = allocator.freeze();
        assert!(allocator.is_frozen());
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.total_heap_bytes, 2 * MIB);
        assert_eq!(stats.total_allocated_bytes, MIB + MIB / 2);
        assert_eq!(stats.heaps[0].high_water_mark, MIB + MIB / 2);
        assert_eq!(stats.heaps[0].allocation_count, 2);
        assert!((stats.utilization() - 0.75).abs() < 1e-9);

        let err = allocator.create_buffer(&buffer(16), "late", 1).unwrap_err();
        assert!(matches!(err, HeapAllocatorError::Frozen));
    }

    #[test]
    fn heaps_persist_across_frames() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, MIB);

        let first = cache.begin_frame().create_buffer(&buffer(MIB), "a", 0).unwrap();
        let second = cache.begin_frame().create_buffer(&buffer(MIB), "a", 0).unwrap();

        assert_eq!(first.allocation().heap_id(), second.allocation().heap_id());
        assert_eq!(second.allocation().offset(), 0);
        assert_eq!(device.heaps().len(), 1);
        assert_eq!(cache.frame(), 2);
    }

    #[test]
    fn idle_heaps_are_collected() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = TransientHeapCache::new(
            device.clone(),
            TransientHeapCacheDesc {
                minimum_heap_size: MIB,
                garbage_collect_latency: 2,
                ..Default::default()
            },
        );

        let survivor = cache.begin_frame().create_buffer(&buffer(16), "a", 0).unwrap();
        assert_eq!(cache.heap_count(), 1);

        drop(cache.begin_frame());
        drop(cache.begin_frame());
        assert_eq!(cache.heap_count(), 1);

        drop(cache.begin_frame());
        assert_eq!(cache.heap_count(), 0);
        assert_eq!(cache.total_heap_bytes(), 0);

        // Resources keep their heap alive after the cache lets go of it.
        assert_eq!(survivor.heap().size(), MIB);
    }

    #[test]
    fn platform_failures_leave_no_placement() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, MIB);
        let allocator = cache.begin_frame();

        device.fail_heap_creation(true);
        let err = allocator.create_buffer(&buffer(16), "a", 0).unwrap_err();
        assert!(matches!(err, HeapAllocatorError::Platform(_)));
        assert_eq!(device.resources_created(), 0);

        device.fail_heap_creation(false);
        let resource = allocator.create_buffer(&buffer(16), "a", 0).unwrap();
        assert_eq!(resource.allocation().offset(), 0);
        assert_eq!(device.resources_created(), 1);
        assert_eq!(allocator.freeze().heaps[0].allocation_count, 1);
    }

    #[test]
    #[should_panic(expected = "exceeds the maximum heap size")]
    fn oversized_requests_panic() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, MIB);
        let allocator = cache.begin_frame();
        let _ = allocator.create_buffer(&buffer(2048 * MIB), "huge", 0);
    }

    #[test]
    #[should_panic(expected = "belongs to frame")]
    fn stale_resources_are_rejected() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, MIB);
        let stale = cache.begin_frame().create_buffer(&buffer(16), "a", 0).unwrap();
        cache.begin_frame().deallocate_memory(&stale, 1);
    }

    #[test]
    #[should_panic(expected = "not allocated from")]
    fn resources_of_another_cache_are_rejected() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut ours = cache(&device, MIB);
        let mut theirs = cache(&device, MIB);

        let allocator = ours.begin_frame();
        let live = allocator.create_buffer(&buffer(MIB), "live", 0).unwrap();
        let foreign = theirs.begin_frame().create_buffer(&buffer(MIB), "foreign", 0).unwrap();

        // Same frame number, same heap id and slot: only the cache tells them apart.
        assert_eq!(foreign.allocation().frame(), allocator.frame());
        assert_eq!(foreign.allocation().heap_id(), live.allocation().heap_id());
        allocator.deallocate_memory(&foreign, 0);
    }

    #[test]
    fn random_lifetimes_never_alias() {
        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, 2 * MIB);
        let allocator = cache.begin_frame();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let mut live: Vec<(PassIndex, Resource)> = Vec::new();
        for pass in 0..64 {
            for _ in 0..rng.gen_range(0..4) {
                let size = rng.gen_range(1..=16u64) * 64 * 1024;
                let resource = allocator.create_buffer(&buffer(size), "scratch", pass).unwrap();
                live.push((pass + rng.gen_range(0..6), resource));
            }
            live.retain(|(last_pass, resource)| {
                if *last_pass == pass {
                    allocator.deallocate_memory(resource, pass);
                    false
                } else {
                    true
                }
            });
        }

        let state = allocator.state.lock();
        for frame_heap in &state.heaps {
            let ranges: Vec<_> = frame_heap.placements.ranges().collect();
            for (i, a) in ranges.iter().enumerate() {
                for b in &ranges[i + 1..] {
                    let passes_meet = a.2 <= b.3 && b.2 <= a.3;
                    let bytes_meet = a.0 < b.1 && b.0 < a.1;
                    assert!(!(passes_meet && bytes_meet), "{a:?} aliases {b:?}");
                }
            }
        }
        drop(state);

        let stats = allocator.freeze();
        assert!(stats.total_allocated_bytes > stats.total_heap_bytes);
    }

    #[test]
    fn concurrent_passes_get_disjoint_ranges() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 16;

        let device = MockTransientDevice::new(ResourceHeapTier::Tier2);
        let mut cache = cache(&device, 4 * MIB);
        let allocator = cache.begin_frame();
        let resources = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    let mine: Vec<_> = (0..PER_THREAD)
                        .map(|_| allocator.create_buffer(&buffer(128 * 1024), "t", 3).unwrap())
                        .collect();
                    resources.lock().extend(mine);
                });
            }
        });

        let mut ranges: Vec<_> = resources
            .into_inner()
            .iter()
            .map(|r| (r.allocation().heap_id(), r.allocation().offset()))
            .collect();
        ranges.sort_unstable();
        ranges.dedup();
        assert_eq!(ranges.len(), THREADS * PER_THREAD);
    }
}
