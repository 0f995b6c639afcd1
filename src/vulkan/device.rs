// Vulkan logical device
//
// The device owns every child object: queues, the allocation manager,
// the descriptor pool bank, the resource/view/sampler registries, and
// the content-addressed caches. All of it is dropped before the
// native device handle goes away. Resource creation and destruction
// are thread safe; contexts are single threaded on top.

use ash::vk;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::types::*;
use crate::vulkan::adapter::VulkanAdapter;
use crate::vulkan::allocator::{AllocUpdateConfig, AllocationManager, VulkanMemory};
use crate::vulkan::commons;
use crate::vulkan::descriptor::DescriptorAllocator;
use crate::vulkan::instance::VulkanInstance;
use crate::vulkan::pipeline::PipelineCaches;
use crate::vulkan::queue::{generate_copy_resource, QueueFamily, VulkanQueue};
use crate::vulkan::renderpass::RenderPassCache;
use crate::vulkan::resource::{self, ResourceKind, VulkanResource};
use crate::vulkan::shader::ShaderCache;
use crate::vulkan::views::{VulkanResourceView, VulkanSampler};
use crate::{Result, StratusError};

/// Device limits consulted on hot paths, cached at creation.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceLimits {
    pub min_ubo_offset_alignment: u64,
    pub non_coherent_atom_size: u64,
    pub buffer_image_granularity: u64,
}

pub struct VulkanDevice {
    pub(crate) inst: Arc<VulkanInstance>,
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) dev: ash::Device,
    pub(crate) surface: Option<vk::SurfaceKHR>,
    pub(crate) limits: DeviceLimits,
    pub(crate) queue_families: Vec<QueueFamily>,

    queues: HashMap<vk::QueueFlags, VulkanQueue>,

    pub(crate) allocator: Mutex<AllocationManager>,
    pub(crate) descriptor_allocator: Mutex<DescriptorAllocator>,

    pub(crate) resources: RwLock<HashMap<ResourceId, VulkanResource>>,
    pub(crate) views: RwLock<HashMap<ResourceViewId, VulkanResourceView>>,
    pub(crate) samplers: RwLock<HashMap<SamplerId, VulkanSampler>>,

    pub(crate) shaders: RwLock<ShaderCache>,
    pub(crate) pipelines: Mutex<PipelineCaches>,
    pub(crate) set_layouts: Mutex<HashMap<u64, vk::DescriptorSetLayout>>,
    pub(crate) render_passes: Mutex<RenderPassCache>,

    // Pending coherency work for mapped writes/reads, flushed in one
    // native call per frame.
    flush_ranges: Mutex<Vec<(vk::DeviceMemory, u64, u64)>>,
    invalidate_ranges: Mutex<Vec<(vk::DeviceMemory, u64, u64)>>,
}

impl VulkanDevice {
    pub fn new(adapter: &VulkanAdapter, info: &DeviceCreateInfo) -> Result<Arc<Self>> {
        let inst = adapter.inst.clone();

        // The surface comes first; queue selection wants to know
        // which families can present to it.
        let surface = match &info.window {
            Some(window) => unsafe {
                let surf = ash_window::create_surface(
                    &inst.entry,
                    &inst.inst,
                    window.display,
                    window.window,
                    None,
                )
                .map_err(|e| {
                    log::error!("[VK] Failed to create surface: {:?}", e);
                    StratusError::FAILED
                })?;
                Some(surf)
            },
            None => None,
        };

        // Build one queue create info per family that intersects the
        // required flag set, with a queue count no larger than the
        // family allows.
        let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        let mut queue_families = Vec::new();
        let mut queue_infos = Vec::new();
        let mut priorities: Vec<Vec<f32>> = Vec::new();

        for (i, props) in adapter.queue_families.iter().enumerate() {
            if !props.queue_flags.intersects(required) {
                continue;
            }

            let supports_present = match surface {
                Some(surf) => adapter.supports_surface(i as u32, surf),
                None => false,
            };

            let mut wanted = 0u32;
            if supports_present {
                wanted += 1;
            }
            if props.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                wanted += 1;
            }
            if props.queue_flags.contains(vk::QueueFlags::COMPUTE) {
                wanted += 1;
            }
            if props.queue_flags.contains(vk::QueueFlags::TRANSFER) {
                wanted += 1;
            }
            let count = wanted.min(props.queue_count);

            priorities.push(vec![1.0; count as usize]);
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(i as u32)
                    .queue_priorities(priorities.last().unwrap())
                    .build(),
            );

            queue_families.push(QueueFamily {
                family_index: i as u32,
                max_queue_count: count,
                current_available_queue_index: 0,
                flags: props.queue_flags,
                supports_present,
            });
        }

        if queue_families.is_empty() {
            if let Some(surf) = surface {
                unsafe { inst.surface_loader.destroy_surface(surf, None) };
            }
            log::error!("[VK] No usable queue families on this adapter");
            return Err(StratusError::FAILED);
        }

        // Device extensions: swapchain only when we have a window to
        // present to; optional feature extensions when granted.
        let mut wanted_extensions: Vec<&'static std::ffi::CStr> = Vec::new();
        if surface.is_some() {
            wanted_extensions.push(ash::extensions::khr::Swapchain::name());
        }
        let granted = inst.granted_layers();
        if granted.contains(LayerFlags::RAYTRACING) {
            wanted_extensions.push(vk::KhrAccelerationStructureFn::name());
            wanted_extensions.push(vk::KhrRayTracingPipelineFn::name());
            wanted_extensions.push(vk::KhrDeferredHostOperationsFn::name());
        }
        if granted.contains(LayerFlags::MESH_SHADING) {
            wanted_extensions.push(vk::NvMeshShaderFn::name());
        }
        let extensions: Vec<&'static std::ffi::CStr> = wanted_extensions
            .into_iter()
            .filter(|want| {
                let ok = adapter.supports_extension(want);
                if !ok {
                    log::warn!("[VK] Device extension {:?} not present, dropping", want);
                }
                ok
            })
            .collect();
        let ext_ptrs: Vec<*const i8> = extensions.iter().map(|e| e.as_ptr()).collect();

        // Enable whatever the hardware reports; feature negotiation
        // beyond the layer flags is not this layer's business.
        let features = unsafe { inst.inst.get_physical_device_features(adapter.pdev) };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&ext_ptrs)
            .enabled_features(&features);

        let dev = unsafe {
            inst.inst
                .create_device(adapter.pdev, &create_info, None)
                .map_err(|e| {
                    log::error!("[VK] Failed to create device: {:?}", e);
                    if let Some(surf) = surface {
                        inst.surface_loader.destroy_surface(surf, None);
                    }
                    StratusError::FAILED
                })?
        };

        let limits = DeviceLimits {
            min_ubo_offset_alignment: adapter.limits().min_uniform_buffer_offset_alignment,
            non_coherent_atom_size: adapter.limits().non_coherent_atom_size,
            buffer_image_granularity: adapter.limits().buffer_image_granularity,
        };

        // Primary queue carries graphics, compute and transfer; a
        // second transfer queue serves one-shot uploads. Failure here
        // rolls everything back in reverse order.
        let mut queues = HashMap::new();
        let make = |families: &mut Vec<QueueFamily>,
                    flags: vk::QueueFlags,
                    need_present: bool|
         -> Result<VulkanQueue> {
            for family in families.iter_mut() {
                if !family.flags.contains(flags) {
                    continue;
                }
                if need_present && !family.supports_present {
                    continue;
                }
                let index = if family.current_available_queue_index < family.max_queue_count {
                    let idx = family.current_available_queue_index;
                    family.current_available_queue_index += 1;
                    idx
                } else {
                    // Family exhausted, share the last native queue.
                    family.max_queue_count - 1
                };
                return VulkanQueue::new(&dev, family.family_index, index, flags);
            }
            Err(StratusError::NOT_FOUND)
        };

        let primary = make(&mut queue_families, required, surface.is_some());
        let primary = match primary {
            Ok(q) => q,
            Err(e) => {
                unsafe {
                    dev.destroy_device(None);
                    if let Some(surf) = surface {
                        inst.surface_loader.destroy_surface(surf, None);
                    }
                }
                log::error!("[VK] Could not create the primary queue");
                return Err(e);
            }
        };
        queues.insert(required, primary);

        if let Ok(transfer) = make(&mut queue_families, vk::QueueFlags::TRANSFER, false) {
            queues.insert(vk::QueueFlags::TRANSFER, transfer);
        }

        let allocator = AllocationManager::new(adapter.mem_props, limits.buffer_image_granularity);
        let descriptor_allocator =
            DescriptorAllocator::new(3, vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        Ok(Arc::new(Self {
            inst,
            pdev: adapter.pdev,
            dev,
            surface,
            limits,
            queue_families,
            queues,
            allocator: Mutex::new(allocator),
            descriptor_allocator: Mutex::new(descriptor_allocator),
            resources: RwLock::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
            samplers: RwLock::new(HashMap::new()),
            shaders: RwLock::new(ShaderCache::new()),
            pipelines: Mutex::new(PipelineCaches::new()),
            set_layouts: Mutex::new(HashMap::new()),
            render_passes: Mutex::new(RenderPassCache::new()),
            flush_ranges: Mutex::new(Vec::new()),
            invalidate_ranges: Mutex::new(Vec::new()),
        }))
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn queue_families(&self) -> &[QueueFamily] {
        &self.queue_families
    }

    pub fn queue(&self, flags: vk::QueueFlags) -> Option<&VulkanQueue> {
        self.queues.get(&flags)
    }

    /// The queue backbuffer work and one-shot transitions go through.
    pub fn backbuffer_queue(&self) -> &VulkanQueue {
        self.queues
            .get(&(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER))
            .expect("primary queue always exists")
    }

    pub fn wait_idle(&self) {
        if let Err(e) = unsafe { self.dev.device_wait_idle() } {
            log::warn!("[VK] device_wait_idle failed: {:?}", e);
        }
    }

    /// Tag a native object with a debug name when marking is on.
    pub(crate) fn set_object_name(
        &self,
        object_type: vk::ObjectType,
        handle: u64,
        name: &str,
    ) {
        if !self.inst.supports_debug_marking() {
            return;
        }
        let debug = match self.inst.debug_utils() {
            Some(d) => d,
            None => return,
        };
        let name = match std::ffi::CString::new(name) {
            Ok(n) => n,
            Err(_) => return,
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { debug.debug_utils_set_object_name(self.dev.handle(), &info) } {
            log::warn!("[VK] Failed to set object name: {:?}", e);
        }
    }

    // ------------------------------------------------------------------
    // Resources

    /// Create a buffer or image, allocate and bind its memory, and
    /// transition images into their initial state.
    pub fn create_resource(
        &self,
        desc: &GraphicsResourceDescription,
        init_state: ResourceState,
    ) -> Result<ResourceId> {
        let id = resource::next_resource_id();

        let (kind, requirements) = match desc.dimension {
            ResourceDimension::Buffer => {
                let buffer = resource::create_buffer(&self.dev, desc)?;
                let reqs = unsafe { self.dev.get_buffer_memory_requirements(buffer) };
                (ResourceKind::Buffer { buffer }, reqs)
            }
            _ => {
                let format_props = unsafe {
                    self.inst
                        .inst
                        .get_physical_device_format_properties(self.pdev, commons::vk_format(desc.format))
                };
                let (image, tiling) = resource::create_image(&self.dev, &format_props, desc)?;
                let reqs = unsafe { self.dev.get_image_memory_requirements(image) };
                (
                    ResourceKind::Image {
                        image,
                        layout: vk::ImageLayout::UNDEFINED,
                        tiling,
                        swapchain_owned: false,
                    },
                    reqs,
                )
            }
        };

        let destroy_native = |kind: &ResourceKind| unsafe {
            match kind {
                ResourceKind::Buffer { buffer } => self.dev.destroy_buffer(*buffer, None),
                ResourceKind::Image { image, .. } => self.dev.destroy_image(*image, None),
            }
        };

        let memory = {
            let mut allocator = self.allocator.lock().unwrap();
            let result = match &kind {
                ResourceKind::Buffer { .. } => {
                    allocator.allocate_buffer(&self.dev, desc.memory_usage, &requirements)
                }
                ResourceKind::Image { tiling, .. } => {
                    allocator.allocate_image(&self.dev, desc.memory_usage, &requirements, *tiling)
                }
            };
            match result {
                Ok(mem) => mem,
                Err(e) => {
                    log::error!("[VK] Could not allocate memory for resource");
                    destroy_native(&kind);
                    return Err(e);
                }
            }
        };

        let bind_result = unsafe {
            match &kind {
                ResourceKind::Buffer { buffer } => {
                    self.dev
                        .bind_buffer_memory(*buffer, memory.device_memory, memory.offset_bytes)
                }
                ResourceKind::Image { image, .. } => {
                    self.dev
                        .bind_image_memory(*image, memory.device_memory, memory.offset_bytes)
                }
            }
        };
        if let Err(e) = bind_result {
            log::error!("[VK] Failed to bind resource memory: {:?}", e);
            destroy_native(&kind);
            let mut allocator = self.allocator.lock().unwrap();
            let _ = allocator.free(memory, true);
            return Err(StratusError::FAILED);
        }

        if let Some(name) = &desc.name {
            let (object_type, handle) = match &kind {
                ResourceKind::Buffer { buffer } => {
                    (vk::ObjectType::BUFFER, ash::vk::Handle::as_raw(*buffer))
                }
                ResourceKind::Image { image, .. } => {
                    (vk::ObjectType::IMAGE, ash::vk::Handle::as_raw(*image))
                }
            };
            self.set_object_name(object_type, handle, name);
        }

        let mut res = VulkanResource {
            id,
            kind,
            memory,
            state: ResourceState::Common,
            access_mask: vk::AccessFlags::empty(),
            alignment: requirements.alignment,
            desc: desc.clone(),
            views: HashMap::new(),
        };

        if !res.is_buffer() && init_state != ResourceState::Common {
            // One-time barrier on the backbuffer queue to land in the
            // requested initial state before first use.
            let range = res.make_subresource_range(init_state, 0, 0, 0, 0);
            let barrier = res.transition_image(init_state, range)?;
            self.backbuffer_queue().submit_one_shot(&self.dev, |cbuf| unsafe {
                self.dev.cmd_pipeline_barrier(
                    cbuf,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::BY_REGION,
                    &[],
                    &[],
                    &[barrier],
                );
            })?;
        } else if res.is_buffer() {
            res.state = init_state;
            res.access_mask = commons::access_mask_for_state(init_state)
                | commons::host_access_for_memory_usage(desc.memory_usage);
        }

        self.resources.write().unwrap().insert(id, res);
        Ok(id)
    }

    /// Register a swapchain image as a resource the context can
    /// transition and bind like any other.
    pub(crate) fn register_swapchain_image(
        &self,
        image: vk::Image,
        desc: &GraphicsResourceDescription,
    ) -> ResourceId {
        let id = resource::next_resource_id();
        let res = VulkanResource {
            id,
            kind: ResourceKind::Image {
                image,
                layout: vk::ImageLayout::UNDEFINED,
                tiling: vk::ImageTiling::OPTIMAL,
                swapchain_owned: true,
            },
            memory: VulkanMemory::null(),
            state: ResourceState::Common,
            access_mask: vk::AccessFlags::empty(),
            alignment: 0,
            desc: desc.clone(),
            views: HashMap::new(),
        };
        self.resources.write().unwrap().insert(id, res);
        id
    }

    /// Destroy a resource, releasing its cached views. With
    /// `immediate` false the backing memory rides the garbage ring
    /// and is reclaimed when the frame ring wraps.
    pub fn destroy_resource(&self, id: ResourceId, immediate: bool) -> Result<()> {
        let res = self
            .resources
            .write()
            .unwrap()
            .remove(&id)
            .ok_or(StratusError::NOT_FOUND)?;

        {
            let mut views = self.views.write().unwrap();
            for (_, view_id) in res.views.iter() {
                if let Some(mut view) = views.remove(view_id) {
                    view.release(&self.dev);
                }
            }
        }

        let swapchain_owned = match &res.kind {
            ResourceKind::Image {
                swapchain_owned, ..
            } => *swapchain_owned,
            _ => false,
        };

        if !swapchain_owned {
            unsafe {
                match &res.kind {
                    ResourceKind::Buffer { buffer } => self.dev.destroy_buffer(*buffer, None),
                    ResourceKind::Image { image, .. } => self.dev.destroy_image(*image, None),
                }
            }
            if !res.memory.is_null() {
                let mut allocator = self.allocator.lock().unwrap();
                allocator.free(res.memory, immediate)?;
            }
        }

        Ok(())
    }

    /// Materialize (or fetch the cached) view for a description.
    pub fn resource_as_view(
        &self,
        id: ResourceId,
        desc: &ResourceViewDescription,
    ) -> Result<ResourceViewId> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        desc.hash(&mut hasher);
        let desc_hash = hasher.finish();

        let mut resources = self.resources.write().unwrap();
        let res = resources.get_mut(&id).ok_or(StratusError::NOT_FOUND)?;

        if let Some(view_id) = res.views.get(&desc_hash) {
            return Ok(*view_id);
        }

        let view = VulkanResourceView::new(&self.dev, res, desc)?;
        let view_id = view.id;
        res.views.insert(desc_hash, view_id);
        self.views.write().unwrap().insert(view_id, view);
        Ok(view_id)
    }

    /// Map a buffer, returning a pointer to the requested range.
    pub fn map_resource(&self, id: ResourceId, range: Option<&MapRange>) -> Result<*mut u8> {
        let resources = self.resources.read().unwrap();
        let res = resources.get(&id).ok_or(StratusError::NOT_FOUND)?;
        res.map_ptr(range)
    }

    /// Record the written/read range for bulk flush or invalidate.
    /// CPU-write heaps flush, GPU-write heaps invalidate.
    pub fn unmap_resource(&self, id: ResourceId, range: Option<&MapRange>) -> Result<()> {
        let resources = self.resources.read().unwrap();
        let res = resources.get(&id).ok_or(StratusError::NOT_FOUND)?;
        let mapped = res.mapped_range(range, self.limits.non_coherent_atom_size);

        match res.desc.memory_usage {
            ResourceMemoryUsage::CpuOnly | ResourceMemoryUsage::CpuToGpu => {
                self.flush_ranges.lock().unwrap().push(mapped);
            }
            _ => {
                self.invalidate_ranges.lock().unwrap().push(mapped);
            }
        }
        Ok(())
    }

    pub fn flush_all_mapped_ranges(&self) {
        let ranges: Vec<_> = self.flush_ranges.lock().unwrap().drain(..).collect();
        if ranges.is_empty() {
            return;
        }
        let native: Vec<vk::MappedMemoryRange> = ranges
            .iter()
            .map(|(memory, offset, size)| {
                vk::MappedMemoryRange::builder()
                    .memory(*memory)
                    .offset(*offset)
                    .size(*size)
                    .build()
            })
            .collect();
        if let Err(e) = unsafe { self.dev.flush_mapped_memory_ranges(&native) } {
            log::error!("[VK] Failed to flush mapped ranges: {:?}", e);
        }
    }

    pub fn invalidate_all_mapped_ranges(&self) {
        let ranges: Vec<_> = self.invalidate_ranges.lock().unwrap().drain(..).collect();
        if ranges.is_empty() {
            return;
        }
        let native: Vec<vk::MappedMemoryRange> = ranges
            .iter()
            .map(|(memory, offset, size)| {
                vk::MappedMemoryRange::builder()
                    .memory(*memory)
                    .offset(*offset)
                    .size(*size)
                    .build()
            })
            .collect();
        if let Err(e) = unsafe { self.dev.invalidate_mapped_memory_ranges(&native) } {
            log::error!("[VK] Failed to invalidate mapped ranges: {:?}", e);
        }
    }

    // ------------------------------------------------------------------
    // Samplers, shaders, layouts

    pub fn create_sampler(&self, desc: &SamplerDescription) -> Result<SamplerId> {
        let sampler = VulkanSampler::new(&self.dev, desc)?;
        let id = sampler.id;
        self.samplers.write().unwrap().insert(id, sampler);
        Ok(id)
    }

    pub fn destroy_sampler(&self, id: SamplerId) -> Result<()> {
        let mut sampler = self
            .samplers
            .write()
            .unwrap()
            .remove(&id)
            .ok_or(StratusError::NOT_FOUND)?;
        sampler.release(&self.dev);
        Ok(())
    }

    pub fn load_shader_program(
        &self,
        program: ShaderProgramId,
        permutation: ShaderPermutationId,
        definition: &ShaderProgramDefinition,
    ) -> Result<()> {
        self.shaders
            .write()
            .unwrap()
            .load(&self.dev, program, permutation, definition)
    }

    pub fn unload_shader_program(&self, program: ShaderProgramId) -> Result<()> {
        self.shaders.write().unwrap().unload(program)
    }

    pub fn unload_all_shader_programs(&self) {
        self.shaders.write().unwrap().unload_all(&self.dev);
    }

    pub fn make_vertex_layout(&self, id: VertexInputLayoutId, layout: &VertexInputLayout) -> bool {
        self.pipelines
            .lock()
            .unwrap()
            .register_vertex_layout(id, layout.clone())
    }

    pub fn destroy_vertex_layout(&self, id: VertexInputLayoutId) -> bool {
        self.pipelines.lock().unwrap().destroy_vertex_layout(id)
    }

    /// Cache a descriptor set layout under its packed key hash.
    pub(crate) fn make_descriptor_set_layout(
        &self,
        key: u64,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let mut layouts = self.set_layouts.lock().unwrap();
        if let Some(layout) = layouts.get(&key) {
            return Ok(*layout);
        }

        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let layout = unsafe {
            self.dev.create_descriptor_set_layout(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create descriptor set layout: {:?}", e);
                StratusError::FAILED
            })?
        };

        layouts.insert(key, layout);
        Ok(layout)
    }

    // ------------------------------------------------------------------
    // Blocking copies

    /// Whole-resource copy through the transfer queue's one-shot
    /// path; blocks until the GPU is done.
    pub fn copy_resource(&self, dst: ResourceId, src: ResourceId) -> Result<()> {
        let resources = self.resources.read().unwrap();
        let dst_res = resources.get(&dst).ok_or(StratusError::NOT_FOUND)?;
        let src_res = resources.get(&src).ok_or(StratusError::NOT_FOUND)?;

        let queue = self
            .queue(vk::QueueFlags::TRANSFER)
            .unwrap_or_else(|| self.backbuffer_queue());
        queue.submit_one_shot(&self.dev, |cbuf| {
            let _ = generate_copy_resource(&self.dev, cbuf, dst_res, src_res);
        })
    }

    /// Region copy between buffers; blocks until complete.
    pub fn copy_buffer_regions(
        &self,
        dst: ResourceId,
        src: ResourceId,
        regions: &[CopyBufferRegion],
    ) -> Result<()> {
        let resources = self.resources.read().unwrap();
        let dst_res = resources.get(&dst).ok_or(StratusError::NOT_FOUND)?;
        let src_res = resources.get(&src).ok_or(StratusError::NOT_FOUND)?;

        assert!(
            dst_res.is_in_state(ResourceState::CopyDestination),
            "copy destination resource must be in the CopyDestination state"
        );
        assert!(
            src_res.is_in_state(ResourceState::CopySource),
            "copy source resource must be in the CopySource state"
        );

        let dst_buf = dst_res.buffer_handle()?;
        let src_buf = src_res.buffer_handle()?;
        let copies: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset_bytes,
                dst_offset: r.dst_offset_bytes,
                size: r.size_bytes,
            })
            .collect();

        let queue = self
            .queue(vk::QueueFlags::TRANSFER)
            .unwrap_or_else(|| self.backbuffer_queue());
        queue.submit_one_shot(&self.dev, |cbuf| unsafe {
            self.dev.cmd_copy_buffer(cbuf, src_buf, dst_buf, &copies);
        })
    }

    /// Per-frame allocator maintenance, called from context begin.
    pub(crate) fn update_allocator(&self, config: &AllocUpdateConfig) {
        self.allocator.lock().unwrap().update(config);
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.wait_idle();

        // Children go first, native device last.
        {
            let mut views = self.views.write().unwrap();
            for (_, view) in views.iter_mut() {
                view.release(&self.dev);
            }
            views.clear();
        }
        {
            let mut samplers = self.samplers.write().unwrap();
            for (_, sampler) in samplers.iter_mut() {
                sampler.release(&self.dev);
            }
            samplers.clear();
        }
        {
            let mut resources = self.resources.write().unwrap();
            for (_, res) in resources.iter_mut() {
                unsafe {
                    match &res.kind {
                        ResourceKind::Buffer { buffer } => self.dev.destroy_buffer(*buffer, None),
                        ResourceKind::Image {
                            image,
                            swapchain_owned,
                            ..
                        } => {
                            if !*swapchain_owned {
                                self.dev.destroy_image(*image, None)
                            }
                        }
                    }
                }
            }
            resources.clear();
        }

        self.shaders.write().unwrap().unload_all(&self.dev);
        self.pipelines.lock().unwrap().release(&self.dev);
        self.render_passes.lock().unwrap().release(&self.dev);
        {
            let mut layouts = self.set_layouts.lock().unwrap();
            for (_, layout) in layouts.drain() {
                unsafe { self.dev.destroy_descriptor_set_layout(layout, None) };
            }
        }
        self.descriptor_allocator.lock().unwrap().release(&self.dev);
        // Backing pages go away wholesale; individual blocks inside
        // them were either freed above or ride out with the page.
        self.allocator.lock().unwrap().release(&self.dev);

        for (_, queue) in self.queues.iter() {
            queue.release(&self.dev);
        }

        unsafe {
            if let Some(surface) = self.surface.take() {
                self.inst.surface_loader.destroy_surface(surface, None);
            }
            self.dev.destroy_device(None);
        }
    }
}
