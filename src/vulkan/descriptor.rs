// Descriptor pool bank
//
// One allocator instance per buffered frame. Each instance owns a
// stack of descriptor pools: sets are handed out from the current
// pool until the driver reports exhaustion, at which point the pool
// is retired and a fresh one takes over. Resetting an instance at
// frame begin invalidates every set it handed out at once.

use ash::vk;

use crate::{Result, StratusError};

/// Pool sizing multipliers, scaled by the chunk size when a pool is
/// created. Samplers get half a chunk, everything else a full one.
#[derive(Copy, Clone)]
pub struct DescriptorPoolSizeFactors {
    pub samplers: f32,
    pub sampled_images: f32,
    pub storage_buffers: f32,
    pub storage_images: f32,
    pub uniform_buffers: f32,
    pub input_attachments: f32,
}

impl Default for DescriptorPoolSizeFactors {
    fn default() -> Self {
        Self {
            samplers: 0.5,
            sampled_images: 1.0,
            storage_buffers: 1.0,
            storage_images: 1.0,
            uniform_buffers: 1.0,
            input_attachments: 1.0,
        }
    }
}

/// Descriptors of each type per pool.
const DESCRIPTOR_CHUNK_SIZE: f32 = 1024.0;
/// Sets per pool.
const MAX_SETS_PER_POOL: u32 = 1024;

/// A batch of descriptor sets plus the pool they came from, so an
/// individual free can find its way home.
#[derive(Clone)]
pub struct DescriptorAllocation {
    pub pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    pub layouts: Vec<vk::DescriptorSetLayout>,
}

impl DescriptorAllocation {
    pub fn invalid() -> Self {
        Self {
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            layouts: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.pool != vk::DescriptorPool::null()
    }

    /// The (layout, set) pair at `idx`.
    pub fn descriptor_set(&self, idx: usize) -> (vk::DescriptorSetLayout, vk::DescriptorSet) {
        (self.layouts[idx], self.sets[idx])
    }
}

/// Allocates descriptor sets out of a growing bank of pools.
pub struct DescriptorAllocatorInstance {
    current_pool: vk::DescriptorPool,
    available: Vec<vk::DescriptorPool>,
    used: Vec<vk::DescriptorPool>,
    flags: vk::DescriptorPoolCreateFlags,
    factors: DescriptorPoolSizeFactors,
}

impl DescriptorAllocatorInstance {
    pub fn new(flags: vk::DescriptorPoolCreateFlags) -> Self {
        Self {
            current_pool: vk::DescriptorPool::null(),
            available: Vec::new(),
            used: Vec::new(),
            flags,
            factors: DescriptorPoolSizeFactors::default(),
        }
    }

    fn create_pool(&self, dev: &ash::Device) -> Result<vk::DescriptorPool> {
        let f = &self.factors;
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: (f.samplers * DESCRIPTOR_CHUNK_SIZE) as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: (f.sampled_images * DESCRIPTOR_CHUNK_SIZE) as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: (f.storage_buffers * DESCRIPTOR_CHUNK_SIZE) as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: (f.storage_images * DESCRIPTOR_CHUNK_SIZE) as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: (f.uniform_buffers * DESCRIPTOR_CHUNK_SIZE) as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::INPUT_ATTACHMENT,
                descriptor_count: (f.input_attachments * DESCRIPTOR_CHUNK_SIZE) as u32,
            },
        ];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(MAX_SETS_PER_POOL)
            .flags(self.flags);

        unsafe {
            dev.create_descriptor_pool(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create descriptor pool: {:?}", e);
                StratusError::OUT_OF_MEMORY
            })
        }
    }

    fn grab_pool(&mut self, dev: &ash::Device) -> Result<vk::DescriptorPool> {
        match self.available.pop() {
            Some(pool) => Ok(pool),
            None => self.create_pool(dev),
        }
    }

    /// Allocate `layouts.len()` sets in one batch. A batch never
    /// spans pools: if the current pool cannot take the whole batch
    /// it is retired and the batch retries wholesale from a fresh
    /// pool.
    pub fn allocate(
        &mut self,
        dev: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<DescriptorAllocation> {
        if layouts.is_empty() {
            return Err(StratusError::INVALID_ARGS);
        }

        if self.current_pool == vk::DescriptorPool::null() {
            self.current_pool = self.grab_pool(dev)?;
        }

        for _attempt in 0..4 {
            let info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(self.current_pool)
                .set_layouts(layouts)
                .build();

            match unsafe { dev.allocate_descriptor_sets(&info) } {
                Ok(sets) => {
                    return Ok(DescriptorAllocation {
                        pool: self.current_pool,
                        sets,
                        layouts: layouts.to_vec(),
                    });
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                    // Retire the pool and try again on a fresh one.
                    self.used.push(self.current_pool);
                    self.current_pool = self.grab_pool(dev)?;
                }
                Err(e) => {
                    log::error!("[VK] Descriptor set allocation failed: {:?}", e);
                    return Err(StratusError::FAILED);
                }
            }
        }

        Err(StratusError::OUT_OF_MEMORY)
    }

    /// Return sets to their originating pool. Requires the instance
    /// to have been created with the individual-free flag.
    pub fn free(&mut self, dev: &ash::Device, allocation: &DescriptorAllocation) -> Result<()> {
        if !allocation.is_valid() {
            return Err(StratusError::INVALID_ARGS);
        }

        unsafe {
            dev.free_descriptor_sets(allocation.pool, &allocation.sets)
                .map_err(|e| {
                    log::error!("[VK] Failed to free descriptor sets: {:?}", e);
                    StratusError::FAILED
                })
        }
    }

    /// Reset every pool in the bank. Fast path that invalidates all
    /// outstanding sets at once.
    pub fn reset_pools(&mut self, dev: &ash::Device) {
        unsafe {
            if self.current_pool != vk::DescriptorPool::null() {
                let _ = dev
                    .reset_descriptor_pool(self.current_pool, vk::DescriptorPoolResetFlags::empty());
            }
            for pool in self.used.drain(..) {
                let _ = dev.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty());
                self.available.push(pool);
            }
            for pool in self.available.iter() {
                let _ = dev.reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty());
            }
        }
    }

    pub fn release(&mut self, dev: &ash::Device) {
        unsafe {
            if self.current_pool != vk::DescriptorPool::null() {
                dev.destroy_descriptor_pool(self.current_pool, None);
                self.current_pool = vk::DescriptorPool::null();
            }
            for pool in self.used.drain(..) {
                dev.destroy_descriptor_pool(pool, None);
            }
            for pool in self.available.drain(..) {
                dev.destroy_descriptor_pool(pool, None);
            }
        }
    }
}

/// The buffered bank: one allocator instance per frame in flight. The
/// context picks an instance by its current buffer index and resets
/// it on frame begin, independently of the other slots.
pub struct DescriptorAllocator {
    instances: Vec<DescriptorAllocatorInstance>,
    flags: vk::DescriptorPoolCreateFlags,
}

impl DescriptorAllocator {
    pub fn new(buffer_count: u32, flags: vk::DescriptorPoolCreateFlags) -> Self {
        let instances = (0..buffer_count.max(1))
            .map(|_| DescriptorAllocatorInstance::new(flags))
            .collect();
        Self { instances, flags }
    }

    pub fn buffer_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn instance(&mut self, buffer_index: u32) -> &mut DescriptorAllocatorInstance {
        &mut self.instances[buffer_index as usize]
    }

    /// Grow or shrink the bank without disturbing surviving slots.
    pub fn resize(&mut self, dev: &ash::Device, new_buffer_count: u32) {
        let new_count = new_buffer_count.max(1) as usize;
        while self.instances.len() > new_count {
            let mut instance = self.instances.pop().unwrap();
            instance.release(dev);
        }
        while self.instances.len() < new_count {
            self.instances
                .push(DescriptorAllocatorInstance::new(self.flags));
        }
    }

    pub fn release(&mut self, dev: &ash::Device) {
        for instance in self.instances.iter_mut() {
            instance.release(dev);
        }
        self.instances.clear();
    }
}
