// Paged device-memory allocation
//
// Each page owns one vkAllocateMemory slab and sub-allocates it with a
// first-fit block allocator over the zero-based range [0, pageSize).
// Frees are deferred through a per-frame garbage ring so memory is
// only reclaimed once the GPU has moved past the frame that last
// referenced it.

use ash::vk;
use bitflags::bitflags;

use std::collections::{BTreeMap, HashMap};

use crate::types::ResourceMemoryUsage;
use crate::vulkan::adapter::find_memory_type;
use crate::vulkan::commons::align_up;
use crate::{Result, StratusError};

/// Default page size for each device-memory slab.
pub const PAGE_SIZE_BYTES: u64 = 256 * 1024 * 1024;

/// One sub-allocated block of device memory.
///
/// `device_memory` is the heap the block came from, not the block's
/// own address; `offset_bytes` is the block's address within that
/// heap. `base_ptr` is the heap's persistent mapping, null for
/// GPU-only heaps.
#[derive(Copy, Clone, Debug)]
pub struct VulkanMemory {
    pub device_memory: vk::DeviceMemory,
    pub offset_bytes: u64,
    pub size_bytes: u64,
    pub base_ptr: *mut u8,
    pub allocator_index: u32,
    pub memory_type_index: u32,
}

// Only vulkan handles and a persistently mapped pointer in here.
unsafe impl Send for VulkanMemory {}
unsafe impl Sync for VulkanMemory {}

impl VulkanMemory {
    pub fn null() -> Self {
        Self {
            device_memory: vk::DeviceMemory::null(),
            offset_bytes: 0,
            size_bytes: 0,
            base_ptr: std::ptr::null_mut(),
            allocator_index: 0,
            memory_type_index: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.device_memory == vk::DeviceMemory::null()
    }
}

/// Two blocks alias a bufferImageGranularity page when their
/// granularity-page indices overlap.
fn on_separate_granularity_pages(end_a: u64, start_b: u64, granularity: u64) -> bool {
    if granularity <= 1 {
        return true;
    }
    let end_page_a = end_a & !(granularity - 1);
    let start_page_b = start_b & !(granularity - 1);
    end_page_a < start_page_b
}

#[derive(Copy, Clone, Debug)]
struct AllocatedBlock {
    size: u64,
    linear: bool,
}

/// First-fit sub-allocator over the virtual range [0, size).
///
/// Tracks each live block's tiling class so a linear and a non-linear
/// neighbor that would share a bufferImageGranularity page get pushed
/// apart by an alignment bump at the boundary.
pub struct BlockAllocator {
    size: u64,
    used: u64,
    free: Vec<(u64, u64)>,
    allocated: BTreeMap<u64, AllocatedBlock>,
}

impl BlockAllocator {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            used: 0,
            free: vec![(0, size)],
            allocated: BTreeMap::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.size
    }

    pub fn used_size(&self) -> u64 {
        self.used
    }

    /// True if any single free block can hold `size` bytes.
    pub fn has_space(&self, size: u64) -> bool {
        self.free.iter().any(|&(_, sz)| sz >= size)
    }

    /// Allocate `size` bytes aligned to `align`. When the nearest
    /// preceding live block has a different tiling class and would
    /// share a granularity page, the base is bumped to the next
    /// granularity multiple.
    pub fn allocate(
        &mut self,
        size: u64,
        align: u64,
        granularity: u64,
        linear: bool,
    ) -> Result<u64> {
        if size == 0 {
            return Err(StratusError::INVALID_ARGS);
        }

        for i in 0..self.free.len() {
            let (start, free_size) = self.free[i];
            let end = start + free_size;

            let mut base = align_up(start, align);

            if let Some((prev_off, prev)) = self.allocated.range(..base + 1).next_back() {
                let prev_end = prev_off + prev.size - 1;
                if prev.linear != linear
                    && !on_separate_granularity_pages(prev_end, base, granularity)
                {
                    base = align_up(base, granularity.max(1));
                }
            }

            if base + size > end {
                continue;
            }

            // Carve [base, base + size) out of the free block. Any
            // alignment padding in front stays on the free list.
            self.free.remove(i);
            let mut insert_at = i;
            if base > start {
                self.free.insert(insert_at, (start, base - start));
                insert_at += 1;
            }
            if base + size < end {
                self.free.insert(insert_at, (base + size, end - (base + size)));
            }

            self.allocated.insert(base, AllocatedBlock { size, linear });
            self.used += size;
            return Ok(base);
        }

        Err(StratusError::OUT_OF_MEMORY)
    }

    /// Return a block to the free list, coalescing with adjacent free
    /// ranges.
    pub fn free(&mut self, offset: u64) -> Result<()> {
        let block = self
            .allocated
            .remove(&offset)
            .ok_or(StratusError::NOT_FOUND)?;
        self.used -= block.size;

        let idx = self
            .free
            .iter()
            .position(|&(off, _)| off > offset)
            .unwrap_or(self.free.len());
        self.free.insert(idx, (offset, block.size));

        // Merge with the following block, then the preceding one.
        if idx + 1 < self.free.len() {
            let (next_off, next_sz) = self.free[idx + 1];
            if offset + block.size == next_off {
                self.free[idx].1 += next_sz;
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (prev_off, prev_sz) = self.free[idx - 1];
            if prev_off + prev_sz == offset {
                self.free[idx - 1].1 += self.free[idx].1;
                self.free.remove(idx);
            }
        }

        Ok(())
    }

    /// Drop every allocation and restore the full range.
    pub fn clear(&mut self) {
        self.free = vec![(0, self.size)];
        self.allocated.clear();
        self.used = 0;
    }
}

/// One device-memory page plus its sub-allocator. Host-visible pages
/// are mapped once at creation and stay mapped for their lifetime.
pub struct PagedAllocator {
    memory: vk::DeviceMemory,
    base_ptr: *mut u8,
    block: BlockAllocator,
    allocation_id: u32,
    memory_type_index: u32,
}

unsafe impl Send for PagedAllocator {}
unsafe impl Sync for PagedAllocator {}

impl PagedAllocator {
    pub fn new(
        dev: &ash::Device,
        memory_type_index: u32,
        size: u64,
        host_visible: bool,
        allocation_id: u32,
    ) -> Result<Self> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index)
            .build();

        let memory = unsafe {
            dev.allocate_memory(&info, None).map_err(|e| {
                log::error!("[VK] Failed to allocate {} byte memory page: {:?}", size, e);
                StratusError::OUT_OF_MEMORY
            })?
        };

        let base_ptr = if host_visible {
            match unsafe { dev.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) } {
                Ok(ptr) => ptr as *mut u8,
                Err(e) => {
                    log::error!("[VK] Failed to map memory page: {:?}", e);
                    unsafe { dev.free_memory(memory, None) };
                    return Err(StratusError::FAILED);
                }
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(Self {
            memory,
            base_ptr,
            block: BlockAllocator::new(size),
            allocation_id,
            memory_type_index,
        })
    }

    /// Test-only page with no native backing, for exercising the
    /// sub-allocation and garbage-ring logic without a device.
    #[cfg(test)]
    pub fn unbacked(memory_type_index: u32, size: u64, allocation_id: u32) -> Self {
        Self {
            memory: vk::DeviceMemory::null(),
            base_ptr: std::ptr::null_mut(),
            block: BlockAllocator::new(size),
            allocation_id,
            memory_type_index,
        }
    }

    pub fn allocation_id(&self) -> u32 {
        self.allocation_id
    }

    pub fn has_space(&self, size: u64) -> bool {
        self.block.has_space(size)
    }

    pub fn allocate(
        &mut self,
        requirements: &vk::MemoryRequirements,
        granularity: u64,
        linear: bool,
    ) -> Result<VulkanMemory> {
        let offset = self.block.allocate(
            requirements.size,
            requirements.alignment,
            granularity,
            linear,
        )?;

        Ok(VulkanMemory {
            device_memory: self.memory,
            offset_bytes: offset,
            size_bytes: requirements.size,
            base_ptr: self.base_ptr,
            allocator_index: self.allocation_id,
            memory_type_index: self.memory_type_index,
        })
    }

    pub fn free(&mut self, offset: u64) -> Result<()> {
        self.block.free(offset)
    }

    pub fn clear(&mut self) {
        self.block.clear();
    }

    pub fn release(&mut self, dev: &ash::Device) {
        if self.memory != vk::DeviceMemory::null() {
            unsafe {
                if !self.base_ptr.is_null() {
                    dev.unmap_memory(self.memory);
                }
                dev.free_memory(self.memory, None);
            }
            self.memory = vk::DeviceMemory::null();
            self.base_ptr = std::ptr::null_mut();
        }
    }
}

bitflags! {
    /// Behavior selection for `AllocationManager::update`.
    pub struct AllocUpdateFlags: u32 {
        const UPDATE                = 1 << 0;
        const SET_FRAME_INDEX       = 1 << 1;
        const INCREMENT_FRAME_INDEX = 1 << 2;
        const GARBAGE_RESIZE        = 1 << 3;
        const CLEAR                 = 1 << 4;
    }
}

/// Per-frame update parameters for the allocation manager.
#[derive(Copy, Clone, Debug)]
pub struct AllocUpdateConfig {
    pub flags: AllocUpdateFlags,
    pub frame_index: u32,
    pub garbage_buffer_count: u32,
}

/// Manages device memory in pages, one list of pages per memory type,
/// with a ring of per-frame pending-free lists.
pub struct AllocationManager {
    mem_props: vk::PhysicalDeviceMemoryProperties,
    granularity: u64,
    page_size: u64,
    pages: HashMap<u32, Vec<PagedAllocator>>,
    garbage: Vec<Vec<VulkanMemory>>,
    garbage_index: usize,
    next_allocation_id: u32,
    total_allocation_size: u64,
    num_allocations: u64,
}

impl AllocationManager {
    pub fn new(
        mem_props: vk::PhysicalDeviceMemoryProperties,
        buffer_image_granularity: u64,
    ) -> Self {
        Self {
            mem_props,
            granularity: buffer_image_granularity,
            page_size: PAGE_SIZE_BYTES,
            pages: HashMap::new(),
            garbage: vec![Vec::new()],
            garbage_index: 0,
            next_allocation_id: 0,
            total_allocation_size: 0,
            num_allocations: 0,
        }
    }

    #[cfg(test)]
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn total_allocation_size(&self) -> u64 {
        self.total_allocation_size
    }

    pub fn allocate_buffer(
        &mut self,
        dev: &ash::Device,
        usage: ResourceMemoryUsage,
        requirements: &vk::MemoryRequirements,
    ) -> Result<VulkanMemory> {
        self.allocate(dev, usage, requirements, true)
    }

    pub fn allocate_image(
        &mut self,
        dev: &ash::Device,
        usage: ResourceMemoryUsage,
        requirements: &vk::MemoryRequirements,
        tiling: vk::ImageTiling,
    ) -> Result<VulkanMemory> {
        self.allocate(dev, usage, requirements, tiling == vk::ImageTiling::LINEAR)
    }

    fn allocate(
        &mut self,
        dev: &ash::Device,
        usage: ResourceMemoryUsage,
        requirements: &vk::MemoryRequirements,
        linear: bool,
    ) -> Result<VulkanMemory> {
        let mem_type =
            find_memory_type(&self.mem_props, requirements.memory_type_bits, usage)?;
        let granularity = self.granularity;

        let pages = self.pages.entry(mem_type).or_insert_with(Vec::new);

        // Worst case the block needs alignment padding plus a
        // granularity bump at the boundary.
        let worst_case = requirements.size + requirements.alignment + granularity;
        for page in pages.iter_mut() {
            if !page.has_space(worst_case) {
                continue;
            }
            if let Ok(mem) = page.allocate(requirements, granularity, linear) {
                self.total_allocation_size += mem.size_bytes;
                self.num_allocations += 1;
                return Ok(mem);
            }
        }

        // No page could take it, grow a new one.
        let page_size = self
            .page_size
            .max(requirements.size.next_power_of_two());
        let id = self.next_allocation_id;
        self.next_allocation_id += 1;

        let mut page =
            PagedAllocator::new(dev, mem_type, page_size, usage.is_host_visible(), id)?;
        let mem = page.allocate(requirements, granularity, linear)?;
        pages.push(page);

        self.total_allocation_size += mem.size_bytes;
        self.num_allocations += 1;
        Ok(mem)
    }

    /// Free a block. Unless `immediate`, the block is queued on the
    /// current frame's garbage list and reclaimed when the ring wraps
    /// back to that slot.
    pub fn free(&mut self, mem: VulkanMemory, immediate: bool) -> Result<()> {
        if mem.is_null() {
            return Err(StratusError::NULL_PTR_EXCEPT);
        }

        if immediate {
            self.free_into_page(&mem)
        } else {
            self.garbage[self.garbage_index].push(mem);
            Ok(())
        }
    }

    fn free_into_page(&mut self, mem: &VulkanMemory) -> Result<()> {
        let pages = self
            .pages
            .get_mut(&mem.memory_type_index)
            .ok_or(StratusError::NOT_FOUND)?;
        let page = pages
            .iter_mut()
            .find(|p| p.allocation_id() == mem.allocator_index)
            .ok_or(StratusError::NOT_FOUND)?;

        page.free(mem.offset_bytes)?;
        self.total_allocation_size -= mem.size_bytes;
        self.num_allocations -= 1;
        Ok(())
    }

    fn empty_garbage(&mut self, index: usize) {
        let garbage = std::mem::replace(&mut self.garbage[index], Vec::new());
        for mem in garbage {
            if let Err(e) = self.free_into_page(&mem) {
                log::error!(
                    "[VK] Failed to free garbage block at offset {}: {:?}",
                    mem.offset_bytes,
                    e
                );
            }
        }
    }

    /// Per-frame maintenance. Flags are applied in the order resize,
    /// index selection, reclaim, clear.
    pub fn update(&mut self, config: &AllocUpdateConfig) {
        if config.flags.contains(AllocUpdateFlags::GARBAGE_RESIZE)
            && config.garbage_buffer_count as usize != self.garbage.len()
        {
            log::debug!(
                "[VK] Resizing garbage ring {} -> {}",
                self.garbage.len(),
                config.garbage_buffer_count
            );
            for i in 0..self.garbage.len() {
                self.empty_garbage(i);
            }
            self.garbage
                .resize_with(config.garbage_buffer_count.max(1) as usize, Vec::new);
            if self.garbage_index >= self.garbage.len() {
                self.garbage_index = 0;
            }
        }

        let ring_len = self.garbage.len();

        if config.flags.contains(AllocUpdateFlags::SET_FRAME_INDEX) {
            if config.frame_index as usize >= ring_len {
                log::error!(
                    "[VK] Frame index {} exceeds garbage ring size {}, ignoring",
                    config.frame_index,
                    ring_len
                );
            } else {
                self.garbage_index = config.frame_index as usize;
            }
        } else if config.flags.contains(AllocUpdateFlags::INCREMENT_FRAME_INDEX) {
            self.garbage_index = (self.garbage_index + 1) % ring_len;
        }

        if config.flags.contains(AllocUpdateFlags::UPDATE) {
            self.empty_garbage(self.garbage_index);
        }

        if config.flags.contains(AllocUpdateFlags::CLEAR) {
            for g in self.garbage.iter_mut() {
                g.clear();
            }
        }
    }

    /// Reclaim everything and free the native pages. Callers must
    /// guarantee no frames are in flight.
    pub fn release(&mut self, dev: &ash::Device) {
        for i in 0..self.garbage.len() {
            self.empty_garbage(i);
        }
        for (_, pages) in self.pages.iter_mut() {
            for page in pages.iter_mut() {
                page.release(dev);
            }
        }
        self.pages.clear();
    }

    #[cfg(test)]
    fn insert_test_page(&mut self, mem_type: u32, size: u64) -> u32 {
        let id = self.next_allocation_id;
        self.next_allocation_id += 1;
        self.pages
            .entry(mem_type)
            .or_insert_with(Vec::new)
            .push(PagedAllocator::unbacked(mem_type, size, id));
        id
    }

    #[cfg(test)]
    fn allocate_from_test_page(
        &mut self,
        mem_type: u32,
        size: u64,
        align: u64,
        linear: bool,
    ) -> Result<VulkanMemory> {
        let granularity = self.granularity;
        let pages = self.pages.get_mut(&mem_type).ok_or(StratusError::NOT_FOUND)?;
        let req = vk::MemoryRequirements {
            size,
            alignment: align,
            memory_type_bits: 1 << mem_type,
        };
        for page in pages.iter_mut() {
            if let Ok(mem) = page.allocate(&req, granularity, linear) {
                self.num_allocations += 1;
                self.total_allocation_size += size;
                return Ok(mem);
            }
        }
        Err(StratusError::OUT_OF_MEMORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_respects_alignment() {
        let mut block = BlockAllocator::new(1024);
        let a = block.allocate(10, 1, 1, true).unwrap();
        assert_eq!(a, 0);
        let b = block.allocate(16, 256, 1, true).unwrap();
        assert_eq!(b, 256);
        assert_eq!(block.used_size(), 26);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut block = BlockAllocator::new(64);
        block.allocate(64, 1, 1, true).unwrap();
        assert!(matches!(
            block.allocate(1, 1, 1, true),
            Err(StratusError::OUT_OF_MEMORY)
        ));
    }

    #[test]
    fn free_coalesces_neighbors() {
        let mut block = BlockAllocator::new(256);
        let a = block.allocate(64, 1, 1, true).unwrap();
        let b = block.allocate(64, 1, 1, true).unwrap();
        let c = block.allocate(64, 1, 1, true).unwrap();
        block.free(b).unwrap();
        block.free(a).unwrap();
        block.free(c).unwrap();
        // Everything back in one piece.
        assert!(block.has_space(256));
        assert_eq!(block.used_size(), 0);
    }

    #[test]
    fn mixed_tiling_neighbors_are_separated() {
        let granularity = 1024;
        let mut block = BlockAllocator::new(64 * 1024);

        // A linear allocation followed by a non-linear one that would
        // otherwise land on the same granularity page.
        let a = block.allocate(100, 1, granularity, true).unwrap();
        assert_eq!(a, 0);
        let b = block.allocate(256, 16, granularity, false).unwrap();
        assert_eq!(b % granularity, 0);
        assert!(b >= 100);

        // Same tiling needs no bump.
        let c = block.allocate(64, 16, granularity, false).unwrap();
        assert!(c < b + 256 + granularity);
    }

    #[test]
    fn garbage_ring_defers_reclaim_until_wrap() {
        let props = vk::PhysicalDeviceMemoryProperties::default();
        let mut mgr = AllocationManager::new(props, 1).with_page_size(4096);
        mgr.insert_test_page(0, 4096);

        mgr.update(&AllocUpdateConfig {
            flags: AllocUpdateFlags::GARBAGE_RESIZE,
            frame_index: 0,
            garbage_buffer_count: 3,
        });

        let mem = mgr.allocate_from_test_page(0, 4096, 1, true).unwrap();
        // Deferred free at frame 0: the page stays full.
        mgr.update(&AllocUpdateConfig {
            flags: AllocUpdateFlags::SET_FRAME_INDEX | AllocUpdateFlags::UPDATE,
            frame_index: 0,
            garbage_buffer_count: 3,
        });
        mgr.free(mem, false).unwrap();
        assert!(mgr.allocate_from_test_page(0, 4096, 1, true).is_err());

        // Frames 1 and 2 pass, still not reclaimed.
        for i in 1..3 {
            mgr.update(&AllocUpdateConfig {
                flags: AllocUpdateFlags::SET_FRAME_INDEX | AllocUpdateFlags::UPDATE,
                frame_index: i,
                garbage_buffer_count: 3,
            });
            assert!(mgr.allocate_from_test_page(0, 4096, 1, true).is_err());
        }

        // Ring wraps to frame 0, the block is reclaimed.
        mgr.update(&AllocUpdateConfig {
            flags: AllocUpdateFlags::SET_FRAME_INDEX | AllocUpdateFlags::UPDATE,
            frame_index: 0,
            garbage_buffer_count: 3,
        });
        assert!(mgr.allocate_from_test_page(0, 4096, 1, true).is_ok());
    }

    #[test]
    fn immediate_free_reclaims_now() {
        let props = vk::PhysicalDeviceMemoryProperties::default();
        let mut mgr = AllocationManager::new(props, 1).with_page_size(4096);
        mgr.insert_test_page(0, 4096);

        let mem = mgr.allocate_from_test_page(0, 4096, 1, true).unwrap();
        mgr.free(mem, true).unwrap();
        assert!(mgr.allocate_from_test_page(0, 4096, 1, true).is_ok());
    }

    #[test]
    fn clear_discards_garbage_without_freeing() {
        let props = vk::PhysicalDeviceMemoryProperties::default();
        let mut mgr = AllocationManager::new(props, 1).with_page_size(4096);
        mgr.insert_test_page(0, 4096);

        let mem = mgr.allocate_from_test_page(0, 4096, 1, true).unwrap();
        mgr.free(mem, false).unwrap();
        mgr.update(&AllocUpdateConfig {
            flags: AllocUpdateFlags::CLEAR,
            frame_index: 0,
            garbage_buffer_count: 1,
        });
        // The garbage entry is gone but the block was never freed.
        mgr.update(&AllocUpdateConfig {
            flags: AllocUpdateFlags::UPDATE,
            frame_index: 0,
            garbage_buffer_count: 1,
        });
        assert!(mgr.allocate_from_test_page(0, 4096, 1, true).is_err());
    }

    #[test]
    fn set_frame_index_out_of_range_is_ignored() {
        let props = vk::PhysicalDeviceMemoryProperties::default();
        let mut mgr = AllocationManager::new(props, 1);
        mgr.update(&AllocUpdateConfig {
            flags: AllocUpdateFlags::SET_FRAME_INDEX,
            frame_index: 7,
            garbage_buffer_count: 1,
        });
        assert_eq!(mgr.garbage_index, 0);
    }
}
