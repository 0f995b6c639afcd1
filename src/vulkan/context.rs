// Frame recording context
//
// One context records on one thread. It owns per-frame command pools,
// semaphores and fences, a stack of bind state snapshots, and the
// pending barrier batches. Every draw or dispatch resolves the dirty
// state: batched barriers flush first, then the descriptor set and
// pipeline are looked up (or built) from their content hashes, then
// vertex/index bindings are refreshed, and only then is the command
// emitted.

use ash::vk;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::types::*;
use crate::vulkan::allocator::{AllocUpdateConfig, AllocUpdateFlags};
use crate::vulkan::commons;
use crate::vulkan::descriptor::DescriptorAllocation;
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::pipeline::{PipelineState, PipelineStructure, MAX_RENDER_TARGETS};
use crate::vulkan::queue::generate_copy_resource;
use crate::vulkan::renderpass::{AttachmentInfo, RenderPassBundle};
use crate::{Result, StratusError};

pub const MAX_VERTEX_BUFFERS: usize = 16;
pub const MAX_SRV_BINDS: usize = 64;
pub const MAX_UAV_BINDS: usize = 8;
pub const MAX_CBV_BINDS: usize = 16;
pub const MAX_SAMPLER_BINDS: usize = 16;

/// Framebuffers idle longer than this many frames get swept.
const FRAMEBUFFER_MAX_AGE: u64 = 32;

bitflags::bitflags! {
    struct ContextDirtyFlags: u32 {
        const RESOURCES      = 1 << 0;
        const PIPELINE       = 1 << 1;
        const VERTEX_BUFFERS = 1 << 2;
        const INDEX_BUFFER   = 1 << 3;
    }
}

/// Packed descriptor-set-layout key: per-kind slot counts plus the
/// aggregate stage flags. Two layouts collide exactly when all of
/// these match; binding indices come from the structure itself.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct LayoutKey {
    pub srvs: u16,
    pub uavs: u16,
    pub cbvs: u16,
    pub samplers: u16,
    pub shader_type_flags: u64,
}

impl LayoutKey {
    fn hash64(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.hash(&mut h);
        h.finish()
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct SrvBind {
    view: Option<ResourceViewId>,
    binding: u32,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct CbvBind {
    buffer: Option<ResourceId>,
    offset: u32,
    size: u32,
    binding: u32,
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct SamplerBind {
    sampler: Option<SamplerId>,
    binding: u32,
}

/// Everything bound for the next draw, in one hashable snapshot.
#[derive(Copy, Clone)]
pub(crate) struct DescriptorSetStructure {
    key: LayoutKey,
    srvs: [SrvBind; MAX_SRV_BINDS],
    uavs: [SrvBind; MAX_UAV_BINDS],
    cbvs: [CbvBind; MAX_CBV_BINDS],
    samplers: [SamplerBind; MAX_SAMPLER_BINDS],
}

impl Default for DescriptorSetStructure {
    fn default() -> Self {
        Self {
            key: LayoutKey::default(),
            srvs: [SrvBind::default(); MAX_SRV_BINDS],
            uavs: [SrvBind::default(); MAX_UAV_BINDS],
            cbvs: [CbvBind::default(); MAX_CBV_BINDS],
            samplers: [SamplerBind::default(); MAX_SAMPLER_BINDS],
        }
    }
}

impl DescriptorSetStructure {
    /// Layout key plus every occupied slot's identity. Identical
    /// binding configurations share one descriptor set for the life
    /// of the current pool generation.
    fn hash64(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.key.hash(&mut h);
        for srv in self.srvs[..self.key.srvs as usize].iter() {
            srv.view.hash(&mut h);
            srv.binding.hash(&mut h);
        }
        for uav in self.uavs[..self.key.uavs as usize].iter() {
            uav.view.hash(&mut h);
            uav.binding.hash(&mut h);
        }
        for cbv in self.cbvs[..self.key.cbvs as usize].iter() {
            cbv.buffer.hash(&mut h);
            cbv.offset.hash(&mut h);
            cbv.size.hash(&mut h);
            cbv.binding.hash(&mut h);
        }
        for sampler in self.samplers[..self.key.samplers as usize].iter() {
            sampler.sampler.hash(&mut h);
            sampler.binding.hash(&mut h);
        }
        h.finish()
    }
}

/// One stacked snapshot of pipeline + binding state.
#[derive(Copy, Clone)]
pub(crate) struct ContextState {
    pipeline: PipelineStructure,
    descriptors: DescriptorSetStructure,
    vertex_buffers: [vk::Buffer; MAX_VERTEX_BUFFERS],
    vb_offsets: [u64; MAX_VERTEX_BUFFERS],
    num_vbs: u8,
    index_buffer: vk::Buffer,
    ib_offset: u64,
    ib_type: vk::IndexType,
    dirty: ContextDirtyFlags,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            pipeline: PipelineStructure::default(),
            descriptors: DescriptorSetStructure::default(),
            vertex_buffers: [vk::Buffer::null(); MAX_VERTEX_BUFFERS],
            vb_offsets: [0; MAX_VERTEX_BUFFERS],
            num_vbs: 0,
            index_buffer: vk::Buffer::null(),
            ib_offset: 0,
            ib_type: vk::IndexType::UINT32,
            dirty: ContextDirtyFlags::empty(),
        }
    }
}

/// Pending barrier batches. Emitted as one conservative
/// ALL_COMMANDS -> ALL_COMMANDS pipeline barrier at the next draw,
/// dispatch or copy.
#[derive(Default)]
struct PendingBarriers {
    buffers: Vec<vk::BufferMemoryBarrier>,
    images: Vec<vk::ImageMemoryBarrier>,
}

// Only references vulkan handles, safe to send with the context.
unsafe impl Send for PendingBarriers {}
unsafe impl Sync for PendingBarriers {}

impl PendingBarriers {
    fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    fn clear(&mut self) {
        self.buffers.clear();
        self.images.clear();
    }
}

/// Per-frame synchronization objects. `wait_armed` tracks whether the
/// wait semaphore has a pending signal (from a swapchain acquire) so
/// headless submits do not dead-wait on it; `fence_armed` tracks
/// whether the fence has a submission behind it, so a frame aborted
/// before submit cannot deadlock the slot's next begin.
struct ContextFrame {
    wait_semaphore: vk::Semaphore,
    signal_semaphore: vk::Semaphore,
    fence: vk::Fence,
    wait_armed: bool,
    fence_armed: bool,
}

pub struct VulkanContext {
    dev: Arc<VulkanDevice>,

    buffer_count: u32,
    current_idx: u32,
    /// Monotonic frame counter for cache aging.
    frame_counter: u64,

    frames: Vec<ContextFrame>,
    command_pools: Vec<vk::CommandPool>,
    command_buffers: Vec<vk::CommandBuffer>,

    states: Vec<ContextState>,
    barriers: PendingBarriers,

    new_render_pass: RenderPassBundle,
    bound_render_pass: vk::RenderPass,
    bound_pipeline: PipelineState,

    // Shader-stage visibility accumulated from binder calls, consumed
    // when descriptor set layouts are built. Cleared each frame.
    view_access: HashMap<ResourceViewId, ShaderStage>,
    cbv_access: HashMap<ResourceId, ShaderStage>,
    sampler_access: HashMap<SamplerId, ShaderStage>,

    // Descriptor sets resolved this pool generation.
    set_cache: HashMap<u64, DescriptorAllocation>,
}

impl VulkanContext {
    pub fn new(dev: Arc<VulkanDevice>, buffer_count: u32) -> Result<Self> {
        let mut ctx = Self {
            dev,
            buffer_count: 0,
            current_idx: 0,
            frame_counter: 0,
            frames: Vec::new(),
            command_pools: Vec::new(),
            command_buffers: Vec::new(),
            states: vec![ContextState::default()],
            barriers: PendingBarriers::default(),
            new_render_pass: RenderPassBundle::default(),
            bound_render_pass: vk::RenderPass::null(),
            bound_pipeline: PipelineState::default(),
            view_access: HashMap::new(),
            cbv_access: HashMap::new(),
            sampler_access: HashMap::new(),
            set_cache: HashMap::new(),
        };
        ctx.set_frames(buffer_count.max(1))?;
        Ok(ctx)
    }

    pub fn frame_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn current_frame_index(&self) -> u32 {
        self.current_idx
    }

    pub(crate) fn current_wait_semaphore(&self) -> vk::Semaphore {
        self.frames[self.current_idx as usize].wait_semaphore
    }

    pub(crate) fn current_signal_semaphore(&self) -> vk::Semaphore {
        self.frames[self.current_idx as usize].signal_semaphore
    }

    pub(crate) fn arm_wait_semaphore(&mut self) {
        self.frames[self.current_idx as usize].wait_armed = true;
    }

    pub(crate) fn device(&self) -> &Arc<VulkanDevice> {
        &self.dev
    }

    fn current_cbuf(&self) -> vk::CommandBuffer {
        self.command_buffers[self.current_idx as usize]
    }

    fn state(&self) -> &ContextState {
        self.states.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut ContextState {
        self.states.last_mut().unwrap()
    }

    // ------------------------------------------------------------------
    // Frame resources

    fn destroy_frame_resources(&mut self) {
        let dev = &self.dev.dev;
        unsafe {
            for frame in self.frames.drain(..) {
                dev.destroy_semaphore(frame.wait_semaphore, None);
                dev.destroy_semaphore(frame.signal_semaphore, None);
                dev.destroy_fence(frame.fence, None);
            }
            for (i, pool) in self.command_pools.drain(..).enumerate() {
                if i < self.command_buffers.len() {
                    dev.free_command_buffers(pool, &[self.command_buffers[i]]);
                }
                dev.destroy_command_pool(pool, None);
            }
        }
        self.command_buffers.clear();
    }

    /// Resize the frame ring. Waits for the device to go idle first;
    /// everything per-frame is rebuilt.
    pub fn set_frames(&mut self, buffer_count: u32) -> Result<()> {
        let buffer_count = buffer_count.max(1);
        self.dev.wait_idle();
        self.destroy_frame_resources();

        let dev = &self.dev.dev;
        let family_index = self.dev.backbuffer_queue().family_index;

        for _ in 0..buffer_count {
            let sema_info = vk::SemaphoreCreateInfo::builder().build();
            // Unsignaled; begin() only waits once a submit has armed
            // the fence.
            let fence_info = vk::FenceCreateInfo::builder();

            let (wait_semaphore, signal_semaphore, fence) = unsafe {
                (
                    dev.create_semaphore(&sema_info, None)
                        .map_err(|_| StratusError::FAILED)?,
                    dev.create_semaphore(&sema_info, None)
                        .map_err(|_| StratusError::FAILED)?,
                    dev.create_fence(&fence_info, None)
                        .map_err(|_| StratusError::FAILED)?,
                )
            };
            self.frames.push(ContextFrame {
                wait_semaphore,
                signal_semaphore,
                fence,
                wait_armed: false,
                fence_armed: false,
            });

            let pool_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(family_index);
            let pool = unsafe {
                dev.create_command_pool(&pool_info, None)
                    .map_err(|_| StratusError::FAILED)?
            };
            self.command_pools.push(pool);

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cbuf = unsafe {
                dev.allocate_command_buffers(&alloc_info)
                    .map_err(|_| StratusError::FAILED)?[0]
            };
            self.command_buffers.push(cbuf);
        }

        self.buffer_count = buffer_count;
        // First begin() advances into slot 0.
        self.current_idx = buffer_count - 1;

        self.dev.update_allocator(&AllocUpdateConfig {
            flags: AllocUpdateFlags::GARBAGE_RESIZE,
            frame_index: 0,
            garbage_buffer_count: buffer_count,
        });
        self.dev
            .descriptor_allocator
            .lock()
            .unwrap()
            .resize(dev, buffer_count);

        Ok(())
    }

    // ------------------------------------------------------------------
    // Frame lifecycle

    /// Advance to the next frame slot, wait until the GPU is past its
    /// previous use, recycle its pools, and open the command buffer.
    pub fn begin(&mut self) -> Result<()> {
        self.current_idx = (self.current_idx + 1) % self.buffer_count;
        self.frame_counter += 1;

        let fence = self.frames[self.current_idx as usize].fence;
        let fence_armed = self.frames[self.current_idx as usize].fence_armed;
        unsafe {
            if fence_armed {
                self.dev
                    .dev
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(|_| StratusError::FAILED)?;
                self.dev
                    .dev
                    .reset_fences(&[fence])
                    .map_err(|_| StratusError::FAILED)?;
                self.frames[self.current_idx as usize].fence_armed = false;
            }
            self.dev
                .dev
                .reset_command_pool(
                    self.command_pools[self.current_idx as usize],
                    vk::CommandPoolResetFlags::RELEASE_RESOURCES,
                )
                .map_err(|_| StratusError::FAILED)?;
        }

        self.reset_binds();

        self.dev.update_allocator(&AllocUpdateConfig {
            flags: AllocUpdateFlags::SET_FRAME_INDEX | AllocUpdateFlags::UPDATE,
            frame_index: self.current_idx,
            garbage_buffer_count: self.buffer_count,
        });

        // Fast-path reset: every descriptor set handed out for this
        // slot is invalidated at once, along with the set cache.
        {
            let mut da = self.dev.descriptor_allocator.lock().unwrap();
            da.instance(self.current_idx).reset_pools(&self.dev.dev);
        }
        self.set_cache.clear();

        self.dev.render_passes.lock().unwrap().check_lru_cache(
            &self.dev.dev,
            self.frame_counter,
            FRAMEBUFFER_MAX_AGE,
        );

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.dev
                .dev
                .begin_command_buffer(self.current_cbuf(), &begin_info)
                .map_err(|_| StratusError::FAILED)?;
        }

        Ok(())
    }

    /// Close the command buffer and submit it, waiting on the frame's
    /// acquire semaphore (when armed) and signaling its present
    /// semaphore and fence.
    pub fn end(&mut self) -> Result<()> {
        self.end_render_pass();
        self.flush_barrier_transitions();

        let dev = &self.dev.dev;
        let cbuf = self.current_cbuf();
        unsafe {
            dev.end_command_buffer(cbuf)
                .map_err(|_| StratusError::FAILED)?;
        }

        let frame = &mut self.frames[self.current_idx as usize];
        let wait_semas: Vec<vk::Semaphore> = if frame.wait_armed {
            vec![frame.wait_semaphore]
        } else {
            Vec::new()
        };
        frame.wait_armed = false;
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semas.len()];
        let signal_semas = [frame.signal_semaphore];
        let cbufs = [cbuf];

        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas)
            .build();

        unsafe {
            dev.queue_submit(
                self.dev.backbuffer_queue().handle(),
                &[submit],
                frame.fence,
            )
            .map_err(|e| {
                log::error!("[VK] Frame submit failed: {:?}", e);
                StratusError::FAILED
            })?;
        }
        self.frames[self.current_idx as usize].fence_armed = true;

        Ok(())
    }

    /// Block until the presentation queue drains.
    pub fn wait(&self) {
        self.dev.backbuffer_queue().wait(&self.dev.dev);
    }

    fn reset_binds(&mut self) {
        self.states.clear();
        self.states.push(ContextState::default());
        self.barriers.clear();
        self.new_render_pass = RenderPassBundle::default();
        self.bound_render_pass = vk::RenderPass::null();
        self.bound_pipeline = PipelineState::default();
        self.view_access.clear();
        self.cbv_access.clear();
        self.sampler_access.clear();
    }

    // ------------------------------------------------------------------
    // State stack

    /// Push a fresh state, or a copy of the current one when
    /// inheriting.
    pub fn push_state(&mut self, flags: ContextFlags) {
        let state = if flags.contains(ContextFlags::INHERIT_PIPELINE_STATE) {
            *self.state()
        } else {
            ContextState::default()
        };
        self.states.push(state);
    }

    /// Pop the top state. The base state is permanent; popping at
    /// depth one is a no-op.
    pub fn pop_state(&mut self) {
        if self.states.len() > 1 {
            self.states.pop();
        }
    }

    // ------------------------------------------------------------------
    // Barriers and transitions

    /// Queue a state transition for `resource`. A transition into the
    /// current state is a no-op. The tracked state updates now, at
    /// record time, so later asserts see the post-transition state.
    pub fn transition(
        &mut self,
        resource: ResourceId,
        dst: ResourceState,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> Result<()> {
        let mut resources = self.dev.resources.write().unwrap();
        let res = resources.get_mut(&resource).ok_or(StratusError::NOT_FOUND)?;

        if res.is_in_state(dst) {
            return Ok(());
        }

        if res.is_buffer() {
            let barrier = res.transition_buffer(dst)?;
            self.barriers.buffers.push(barrier);
        } else {
            let range = res.make_subresource_range(dst, base_mip, mip_count, base_layer, layer_count);
            let barrier = res.transition_image(dst, range)?;
            self.barriers.images.push(barrier);
        }
        Ok(())
    }

    /// Emit the batched barriers as one conservative pipeline
    /// barrier. No-op when nothing is pending. Closes any open render
    /// pass first.
    fn flush_barrier_transitions(&mut self) {
        if self.barriers.is_empty() {
            return;
        }
        self.end_render_pass();

        unsafe {
            self.dev.dev.cmd_pipeline_barrier(
                self.current_cbuf(),
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::BY_REGION,
                &[],
                &self.barriers.buffers,
                &self.barriers.images,
            );
        }
        self.barriers.clear();
    }

    // ------------------------------------------------------------------
    // Render pass lifecycle

    fn end_render_pass(&mut self) {
        if self.bound_render_pass != vk::RenderPass::null() {
            unsafe { self.dev.dev.cmd_end_render_pass(self.current_cbuf()) };
            self.bound_render_pass = vk::RenderPass::null();
        }
    }

    /// Open the computed render pass if it differs from the one
    /// currently open.
    fn set_render_pass(&mut self) {
        assert!(
            !self.new_render_pass.is_null(),
            "no render targets bound before a render pass was required"
        );
        if self.bound_render_pass == self.new_render_pass.render_pass {
            return;
        }
        self.end_render_pass();

        let begin = vk::RenderPassBeginInfo::builder()
            .render_pass(self.new_render_pass.render_pass)
            .framebuffer(self.new_render_pass.framebuffer)
            .render_area(self.new_render_pass.render_area)
            .build();
        unsafe {
            self.dev.dev.cmd_begin_render_pass(
                self.current_cbuf(),
                &begin,
                vk::SubpassContents::INLINE,
            );
        }
        self.bound_render_pass = self.new_render_pass.render_pass;
    }

    /// Compute the render pass and framebuffer for a target set. The
    /// pass is not begun here; the next draw or clear opens it.
    pub fn bind_render_targets(
        &mut self,
        rtvs: &[ResourceViewId],
        dsv: Option<ResourceViewId>,
    ) -> Result<()> {
        assert!(
            rtvs.len() <= MAX_RENDER_TARGETS,
            "too many render targets bound"
        );

        // Lock order is resources before views, everywhere.
        let resources = self.dev.resources.read().unwrap();
        let views = self.dev.views.read().unwrap();

        let mut extent = vk::Extent2D::default();
        let mut infos = Vec::with_capacity(rtvs.len());
        for id in rtvs.iter() {
            let view = views.get(id).ok_or(StratusError::NOT_FOUND)?;
            let res = resources.get(&view.resource).ok_or(StratusError::NOT_FOUND)?;
            extent = vk::Extent2D {
                width: res.desc.width as u32,
                height: res.desc.height,
            };
            infos.push(AttachmentInfo {
                view_id: *id,
                view: view.view,
                format: view.desc.format,
                expected_layout: view.expected_layout,
            });
        }

        let ds_info = match dsv {
            Some(id) => {
                let view = views.get(&id).ok_or(StratusError::NOT_FOUND)?;
                let res = resources.get(&view.resource).ok_or(StratusError::NOT_FOUND)?;
                if infos.is_empty() {
                    extent = vk::Extent2D {
                        width: res.desc.width as u32,
                        height: res.desc.height,
                    };
                }
                Some(AttachmentInfo {
                    view_id: id,
                    view: view.view,
                    format: view.desc.format,
                    expected_layout: view.expected_layout,
                })
            }
            None => None,
        };
        drop(resources);
        drop(views);

        let bundle = self.dev.render_passes.lock().unwrap().make(
            &self.dev.dev,
            &infos,
            ds_info.as_ref(),
            extent,
            self.frame_counter,
        )?;

        self.new_render_pass = bundle;
        let state = self.state_mut();
        state.pipeline.graphics.num_render_targets = rtvs.len() as u32;
        state.pipeline.graphics.render_pass = bundle.render_pass;
        state.dirty |= ContextDirtyFlags::PIPELINE;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clears

    fn clear_rect(rect: &Rect) -> vk::ClearRect {
        vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D {
                    x: rect.x as i32,
                    y: rect.y as i32,
                },
                extent: vk::Extent2D {
                    width: rect.width as u32,
                    height: rect.height as u32,
                },
            },
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Clear one bound render target. Requires targets bound; opens
    /// the pending render pass if it is not already open.
    pub fn clear_render_target(&mut self, index: u32, color: &[f32; 4], rect: &Rect) {
        self.flush_barrier_transitions();
        self.set_render_pass();

        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: index,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: *color },
            },
        };

        unsafe {
            self.dev.dev.cmd_clear_attachments(
                self.current_cbuf(),
                &[attachment],
                &[Self::clear_rect(rect)],
            );
        }
    }

    /// Clear the bound depth-stencil attachment. On depth-only
    /// formats a requested stencil clear is silently masked off.
    pub fn clear_depth_stencil(
        &mut self,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
        rect: &Rect,
    ) {
        self.flush_barrier_transitions();
        self.set_render_pass();

        let mut aspect = vk::ImageAspectFlags::empty();
        if flags.contains(ClearFlags::DEPTH) {
            aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if flags.contains(ClearFlags::STENCIL) {
            let has_stencil = self
                .new_render_pass
                .depth_format
                .map(|f| f.has_stencil())
                .unwrap_or(false);
            if has_stencil {
                aspect |= vk::ImageAspectFlags::STENCIL;
            }
        }
        if aspect.is_empty() {
            return;
        }

        let attachment = vk::ClearAttachment {
            aspect_mask: aspect,
            color_attachment: self.new_render_pass.num_render_targets.saturating_sub(1),
            clear_value: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth,
                    stencil: stencil as u32,
                },
            },
        };

        unsafe {
            self.dev.dev.cmd_clear_attachments(
                self.current_cbuf(),
                &[attachment],
                &[Self::clear_rect(rect)],
            );
        }
    }

    // ------------------------------------------------------------------
    // Dynamic state setters

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        let native: Vec<vk::Viewport> = viewports
            .iter()
            .map(|v| vk::Viewport {
                x: v.x,
                y: v.y,
                width: v.width,
                height: v.height,
                min_depth: v.min_depth,
                max_depth: v.max_depth,
            })
            .collect();
        unsafe { self.dev.dev.cmd_set_viewport(self.current_cbuf(), 0, &native) };
    }

    pub fn set_scissors(&mut self, scissors: &[Rect]) {
        let native: Vec<vk::Rect2D> = scissors
            .iter()
            .map(|r| vk::Rect2D {
                offset: vk::Offset2D {
                    x: r.x as i32,
                    y: r.y as i32,
                },
                extent: vk::Extent2D {
                    width: r.width as u32,
                    height: r.height as u32,
                },
            })
            .collect();
        unsafe { self.dev.dev.cmd_set_scissor(self.current_cbuf(), 0, &native) };
    }

    pub fn set_topology(&mut self, topology: PrimitiveTopology) {
        let state = self.state_mut();
        state.pipeline.graphics.topology = topology;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_polygon_mode(&mut self, mode: PolygonMode) {
        let state = self.state_mut();
        state.pipeline.graphics.raster.polygon_mode = mode;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        let state = self.state_mut();
        state.pipeline.graphics.raster.cull_mode = mode;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_front_face(&mut self, face: FrontFace) {
        let state = self.state_mut();
        state.pipeline.graphics.raster.front_face = face;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_line_width(&mut self, width: f32) {
        let state = self.state_mut();
        state.pipeline.graphics.raster.line_width = width;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn enable_depth(&mut self, enable: bool) {
        let state = self.state_mut();
        state.pipeline.graphics.depth_stencil.depth_test_enable = enable;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn enable_depth_write(&mut self, enable: bool) {
        let state = self.state_mut();
        state.pipeline.graphics.depth_stencil.depth_write_enable = enable;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn enable_stencil(&mut self, enable: bool) {
        let state = self.state_mut();
        state.pipeline.graphics.depth_stencil.stencil_test_enable = enable;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_depth_compare_op(&mut self, op: CompareOp) {
        let state = self.state_mut();
        state.pipeline.graphics.depth_stencil.depth_compare_op = op;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_stencil_reference(&mut self, reference: u8) {
        let state = self.state_mut();
        state.pipeline.graphics.depth_stencil.stencil_reference = reference;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_stencil_read_mask(&mut self, mask: u8) {
        let state = self.state_mut();
        state.pipeline.graphics.depth_stencil.stencil_read_mask = mask;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_stencil_write_mask(&mut self, mask: u8) {
        let state = self.state_mut();
        state.pipeline.graphics.depth_stencil.stencil_write_mask = mask;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_blend_enable(&mut self, rt_index: u32, enable: bool) {
        let state = self.state_mut();
        state.pipeline.graphics.blend.attachments[rt_index as usize].blend_enable = enable;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_blend(
        &mut self,
        rt_index: u32,
        src_color: BlendFactor,
        dst_color: BlendFactor,
        color_op: BlendOp,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
        alpha_op: BlendOp,
    ) {
        let state = self.state_mut();
        let attachment = &mut state.pipeline.graphics.blend.attachments[rt_index as usize];
        attachment.src_color = src_color;
        attachment.dst_color = dst_color;
        attachment.color_op = color_op;
        attachment.src_alpha = src_alpha;
        attachment.dst_alpha = dst_alpha;
        attachment.alpha_op = alpha_op;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_color_write_mask(&mut self, rt_index: u32, mask: ColorComponents) {
        let state = self.state_mut();
        state.pipeline.graphics.blend.attachments[rt_index as usize].write_mask = mask;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        let state = self.state_mut();
        state.pipeline.graphics.blend.blend_constants = constants;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_blend_logic_op_enable(&mut self, enable: bool) {
        let state = self.state_mut();
        state.pipeline.graphics.blend.logic_op_enable = enable;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_blend_logic_op(&mut self, op: LogicOp) {
        let state = self.state_mut();
        state.pipeline.graphics.blend.logic_op = op;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    pub fn set_input_vertex_layout(&mut self, id: VertexInputLayoutId) {
        let state = self.state_mut();
        state.pipeline.graphics.vertex_layout = id;
        state.dirty |= ContextDirtyFlags::PIPELINE;
    }

    // ------------------------------------------------------------------
    // Geometry binds

    pub fn bind_vertex_buffers(&mut self, buffers: &[ResourceId], offsets: &[u64]) -> Result<()> {
        assert!(
            buffers.len() <= MAX_VERTEX_BUFFERS,
            "at most {} vertex buffers may be bound",
            MAX_VERTEX_BUFFERS
        );

        let resources = self.dev.resources.read().unwrap();
        let mut handles = [vk::Buffer::null(); MAX_VERTEX_BUFFERS];
        for (i, id) in buffers.iter().enumerate() {
            let res = resources.get(id).ok_or(StratusError::NOT_FOUND)?;
            handles[i] = res.buffer_handle()?;
        }
        drop(resources);

        let state = self.state_mut();
        let mut changed = state.num_vbs as usize != buffers.len();
        state.num_vbs = buffers.len() as u8;
        for i in 0..buffers.len() {
            let offset = offsets.get(i).copied().unwrap_or(0);
            if state.vertex_buffers[i] != handles[i] || state.vb_offsets[i] != offset {
                state.vertex_buffers[i] = handles[i];
                state.vb_offsets[i] = offset;
                changed = true;
            }
        }
        if changed {
            state.dirty |= ContextDirtyFlags::VERTEX_BUFFERS;
        }
        Ok(())
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: ResourceId,
        offset: u64,
        index_type: IndexType,
    ) -> Result<()> {
        let handle = {
            let resources = self.dev.resources.read().unwrap();
            resources
                .get(&buffer)
                .ok_or(StratusError::NOT_FOUND)?
                .buffer_handle()?
        };
        let ty = commons::vk_index_type(index_type);

        let state = self.state_mut();
        if state.index_buffer != handle || state.ib_offset != offset || state.ib_type != ty {
            state.index_buffer = handle;
            state.ib_offset = offset;
            state.ib_type = ty;
            state.dirty |= ContextDirtyFlags::INDEX_BUFFER;
        }
        Ok(())
    }

    /// Zero all resource binds in the current state.
    pub fn clear_resource_binds(&mut self) {
        let state = self.state_mut();
        state.descriptors = DescriptorSetStructure::default();
        state.dirty |= ContextDirtyFlags::RESOURCES;
    }

    // ------------------------------------------------------------------
    // Program binding

    /// Select the shader program for subsequent draws and return the
    /// binder used to attach resources to it. Fails when the
    /// (program, permutation) pair was never loaded.
    pub fn bind_shader_program(
        &mut self,
        program: ShaderProgramId,
        permutation: ShaderPermutationId,
    ) -> Result<ShaderProgramBinder<'_>> {
        let reflection = {
            let shaders = self.dev.shaders.read().unwrap();
            let loaded = shaders
                .get(program, permutation)
                .ok_or(StratusError::NOT_FOUND)?;
            loaded.reflection.clone()
        };

        let state = self.state_mut();
        state.pipeline.program = program;
        state.pipeline.permutation = permutation;
        state.dirty |= ContextDirtyFlags::PIPELINE;

        Ok(ShaderProgramBinder {
            ctx: self,
            reflection,
        })
    }

    // ------------------------------------------------------------------
    // Descriptor resolution

    fn make_set_layout(&self, s: &DescriptorSetStructure) -> Result<vk::DescriptorSetLayout> {
        let views = self.dev.views.read().unwrap();
        let mut bindings = Vec::new();

        for cbv in s.cbvs[..s.key.cbvs as usize].iter() {
            let buffer = match cbv.buffer {
                Some(b) => b,
                None => continue,
            };
            let stages = self
                .cbv_access
                .get(&buffer)
                .copied()
                .unwrap_or(ShaderStage::ALL);
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(cbv.binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(commons::vk_shader_stages(stages))
                    .build(),
            );
        }

        for srv in s.srvs[..s.key.srvs as usize].iter() {
            let view_id = match srv.view {
                Some(v) => v,
                None => continue,
            };
            let view = views.get(&view_id).ok_or(StratusError::NOT_FOUND)?;
            let ty = if view.is_buffer_view() {
                vk::DescriptorType::STORAGE_BUFFER
            } else {
                vk::DescriptorType::SAMPLED_IMAGE
            };
            let stages = self
                .view_access
                .get(&view_id)
                .copied()
                .unwrap_or(ShaderStage::ALL);
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(srv.binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(commons::vk_shader_stages(stages))
                    .build(),
            );
        }

        for uav in s.uavs[..s.key.uavs as usize].iter() {
            let view_id = match uav.view {
                Some(v) => v,
                None => continue,
            };
            let view = views.get(&view_id).ok_or(StratusError::NOT_FOUND)?;
            let ty = if view.is_buffer_view() {
                vk::DescriptorType::STORAGE_BUFFER
            } else {
                vk::DescriptorType::STORAGE_IMAGE
            };
            let stages = self
                .view_access
                .get(&view_id)
                .copied()
                .unwrap_or(ShaderStage::ALL);
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(uav.binding)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(commons::vk_shader_stages(stages))
                    .build(),
            );
        }

        for sampler in s.samplers[..s.key.samplers as usize].iter() {
            let sampler_id = match sampler.sampler {
                Some(s) => s,
                None => continue,
            };
            let stages = self
                .sampler_access
                .get(&sampler_id)
                .copied()
                .unwrap_or(ShaderStage::ALL);
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(sampler.binding)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(commons::vk_shader_stages(stages))
                    .build(),
            );
        }

        self.dev
            .make_descriptor_set_layout(s.key.hash64(), &bindings)
    }

    fn update_descriptor_set(
        &self,
        set: vk::DescriptorSet,
        s: &DescriptorSetStructure,
    ) -> Result<()> {
        let resources = self.dev.resources.read().unwrap();
        let views = self.dev.views.read().unwrap();

        // The info arrays are sized up front so the write entries can
        // point into them without reallocation moving anything.
        let max_infos = (s.key.cbvs + s.key.srvs + s.key.uavs + s.key.samplers) as usize;
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::with_capacity(max_infos);
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(max_infos);
        // (binding, type, index into buffer_infos or image_infos)
        enum Pending {
            Buffer(u32, vk::DescriptorType, usize),
            Image(u32, vk::DescriptorType, usize),
        }
        let mut pending = Vec::new();

        for cbv in s.cbvs[..s.key.cbvs as usize].iter() {
            let buffer = match cbv.buffer {
                Some(b) => b,
                None => continue,
            };
            let res = resources.get(&buffer).ok_or(StratusError::NOT_FOUND)?;
            assert!(
                res.is_in_state(ResourceState::ConstantBuffer),
                "constant buffer bind requires the ConstantBuffer state"
            );

            let aligned_offset = commons::align_up(
                cbv.offset as u64,
                self.dev.limits().min_ubo_offset_alignment,
            );
            buffer_infos.push(vk::DescriptorBufferInfo {
                buffer: res.buffer_handle()?,
                offset: aligned_offset,
                range: cbv.size as u64,
            });
            pending.push(Pending::Buffer(
                cbv.binding,
                vk::DescriptorType::UNIFORM_BUFFER,
                buffer_infos.len() - 1,
            ));
        }

        for srv in s.srvs[..s.key.srvs as usize].iter() {
            let view_id = match srv.view {
                Some(v) => v,
                None => continue,
            };
            let view = views.get(&view_id).ok_or(StratusError::NOT_FOUND)?;
            let res = resources.get(&view.resource).ok_or(StratusError::NOT_FOUND)?;
            assert!(
                res.is_in_state(ResourceState::ShaderResource),
                "shader resource bind requires the ShaderResource state"
            );

            if view.is_buffer_view() {
                let size = (view.desc.num_elements * view.desc.byte_stride) as u64;
                let offset = (view.desc.first_element * view.desc.byte_stride) as u64;
                buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: res.buffer_handle()?,
                    offset,
                    range: size.min(res.memory.size_bytes),
                });
                pending.push(Pending::Buffer(
                    srv.binding,
                    vk::DescriptorType::STORAGE_BUFFER,
                    buffer_infos.len() - 1,
                ));
            } else {
                image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view.view,
                    image_layout: view.expected_layout,
                });
                pending.push(Pending::Image(
                    srv.binding,
                    vk::DescriptorType::SAMPLED_IMAGE,
                    image_infos.len() - 1,
                ));
            }
        }

        for uav in s.uavs[..s.key.uavs as usize].iter() {
            let view_id = match uav.view {
                Some(v) => v,
                None => continue,
            };
            let view = views.get(&view_id).ok_or(StratusError::NOT_FOUND)?;
            let res = resources.get(&view.resource).ok_or(StratusError::NOT_FOUND)?;
            assert!(
                res.is_in_state(ResourceState::UnorderedAccess),
                "unordered access bind requires the UnorderedAccess state"
            );

            if view.is_buffer_view() {
                let size = (view.desc.num_elements * view.desc.byte_stride) as u64;
                let offset = (view.desc.first_element * view.desc.byte_stride) as u64;
                buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: res.buffer_handle()?,
                    offset,
                    range: size.min(res.memory.size_bytes),
                });
                pending.push(Pending::Buffer(
                    uav.binding,
                    vk::DescriptorType::STORAGE_BUFFER,
                    buffer_infos.len() - 1,
                ));
            } else {
                image_infos.push(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view.view,
                    image_layout: view.expected_layout,
                });
                pending.push(Pending::Image(
                    uav.binding,
                    vk::DescriptorType::STORAGE_IMAGE,
                    image_infos.len() - 1,
                ));
            }
        }

        let samplers = self.dev.samplers.read().unwrap();
        for bind in s.samplers[..s.key.samplers as usize].iter() {
            let sampler_id = match bind.sampler {
                Some(s) => s,
                None => continue,
            };
            let sampler = samplers.get(&sampler_id).ok_or(StratusError::NOT_FOUND)?;
            image_infos.push(vk::DescriptorImageInfo {
                sampler: sampler.sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            });
            pending.push(Pending::Image(
                bind.binding,
                vk::DescriptorType::SAMPLER,
                image_infos.len() - 1,
            ));
        }

        let writes: Vec<vk::WriteDescriptorSet> = pending
            .iter()
            .map(|p| match p {
                Pending::Buffer(binding, ty, idx) => vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(&buffer_infos[*idx..*idx + 1])
                    .build(),
                Pending::Image(binding, ty, idx) => vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(&image_infos[*idx..*idx + 1])
                    .build(),
            })
            .collect();

        unsafe { self.dev.dev.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    /// Resolve (or fetch) the descriptor set for the current binding
    /// snapshot. Identical snapshots within one pool generation share
    /// one set.
    fn make_descriptor_set(&mut self) -> Result<DescriptorAllocation> {
        let structure = self.state().descriptors;
        let hash = structure.hash64();

        if let Some(allocation) = self.set_cache.get(&hash) {
            return Ok(allocation.clone());
        }

        let layout = self.make_set_layout(&structure)?;
        let allocation = {
            let mut da = self.dev.descriptor_allocator.lock().unwrap();
            da.instance(self.current_idx)
                .allocate(&self.dev.dev, &[layout])?
        };
        self.update_descriptor_set(allocation.sets[0], &structure)?;
        self.set_cache.insert(hash, allocation.clone());
        Ok(allocation)
    }

    fn bind_pipeline_state(&mut self, set: &DescriptorAllocation) -> Result<()> {
        let (layout, _) = set.descriptor_set(0);
        self.state_mut().pipeline.descriptor_layout = layout;

        if !self.state().dirty.contains(ContextDirtyFlags::PIPELINE) {
            return Ok(());
        }

        let structure = self.state().pipeline;
        let pipeline_state = {
            let shaders = self.dev.shaders.read().unwrap();
            let mut pipelines = self.dev.pipelines.lock().unwrap();
            pipelines.make_pipeline(&self.dev.dev, &shaders, &structure)?
        };

        if pipeline_state.pipeline != self.bound_pipeline.pipeline {
            if pipeline_state.bind_point == vk::PipelineBindPoint::COMPUTE {
                self.end_render_pass();
            } else if !self.new_render_pass.is_null() {
                self.set_render_pass();
            }
            unsafe {
                self.dev.dev.cmd_bind_pipeline(
                    self.current_cbuf(),
                    pipeline_state.bind_point,
                    pipeline_state.pipeline,
                );
            }
            self.bound_pipeline = pipeline_state;
        }
        Ok(())
    }

    fn bind_descriptor_set(&mut self, set: &DescriptorAllocation) -> Result<()> {
        let (set_layout, vk_set) = set.descriptor_set(0);
        let pipeline_layout = {
            let mut pipelines = self.dev.pipelines.lock().unwrap();
            pipelines.make_layout(&self.dev.dev, set_layout)?
        };

        unsafe {
            self.dev.dev.cmd_bind_descriptor_sets(
                self.current_cbuf(),
                self.bound_pipeline.bind_point,
                pipeline_layout,
                0,
                &[vk_set],
                &[],
            );
        }
        Ok(())
    }

    fn bind_geometry_buffers(&mut self) {
        let state = *self.state();
        if state.dirty.contains(ContextDirtyFlags::VERTEX_BUFFERS) && state.num_vbs > 0 {
            unsafe {
                self.dev.dev.cmd_bind_vertex_buffers(
                    self.current_cbuf(),
                    0,
                    &state.vertex_buffers[..state.num_vbs as usize],
                    &state.vb_offsets[..state.num_vbs as usize],
                );
            }
        }
        if state.dirty.contains(ContextDirtyFlags::INDEX_BUFFER)
            && state.index_buffer != vk::Buffer::null()
        {
            unsafe {
                self.dev.dev.cmd_bind_index_buffer(
                    self.current_cbuf(),
                    state.index_buffer,
                    state.ib_offset,
                    state.ib_type,
                );
            }
        }
    }

    /// The per-draw state delta resolution.
    fn resolve_state(&mut self, graphics: bool) -> Result<()> {
        self.flush_barrier_transitions();

        if self
            .state()
            .dirty
            .intersects(ContextDirtyFlags::RESOURCES | ContextDirtyFlags::PIPELINE)
        {
            let set = self.make_descriptor_set()?;
            self.bind_pipeline_state(&set)?;
            self.bind_descriptor_set(&set)?;
        }

        if graphics {
            // A barrier flush may have closed the render pass with
            // the pipeline still clean; reopen before drawing.
            if self.bound_render_pass == vk::RenderPass::null() && !self.new_render_pass.is_null()
            {
                self.set_render_pass();
            }
            if self
                .state()
                .dirty
                .intersects(ContextDirtyFlags::VERTEX_BUFFERS | ContextDirtyFlags::INDEX_BUFFER)
            {
                self.bind_geometry_buffers();
            }
        }

        self.state_mut().dirty = ContextDirtyFlags::empty();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Draws and dispatches

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.resolve_state(true)?;
        unsafe {
            self.dev.dev.cmd_draw(
                self.current_cbuf(),
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
        Ok(())
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.resolve_state(true)?;
        unsafe {
            self.dev.dev.cmd_draw_indexed(
                self.current_cbuf(),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    fn indirect_buffer(&self, args: ResourceId) -> Result<vk::Buffer> {
        let resources = self.dev.resources.read().unwrap();
        let res = resources.get(&args).ok_or(StratusError::NOT_FOUND)?;
        if !res.is_buffer() {
            log::error!("[VK] Indirect argument resource must be a buffer, ignoring call");
            return Err(StratusError::INVALID_ARGS);
        }
        res.buffer_handle()
    }

    pub fn draw_instanced_indirect(
        &mut self,
        args: ResourceId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        let buffer = self.indirect_buffer(args)?;
        self.resolve_state(true)?;
        unsafe {
            self.dev
                .dev
                .cmd_draw_indirect(self.current_cbuf(), buffer, offset, draw_count, stride);
        }
        Ok(())
    }

    pub fn draw_indexed_instanced_indirect(
        &mut self,
        args: ResourceId,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        let buffer = self.indirect_buffer(args)?;
        self.resolve_state(true)?;
        unsafe {
            self.dev.dev.cmd_draw_indexed_indirect(
                self.current_cbuf(),
                buffer,
                offset,
                draw_count,
                stride,
            );
        }
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.resolve_state(false)?;
        unsafe { self.dev.dev.cmd_dispatch(self.current_cbuf(), x, y, z) };
        Ok(())
    }

    pub fn dispatch_indirect(&mut self, args: ResourceId, offset: u64) -> Result<()> {
        let buffer = self.indirect_buffer(args)?;
        self.resolve_state(false)?;
        unsafe {
            self.dev
                .dev
                .cmd_dispatch_indirect(self.current_cbuf(), buffer, offset);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Copies (recorded into this context's command stream)

    /// Record a whole-resource copy. Both resources must already be
    /// in their copy states.
    pub fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) -> Result<()> {
        self.flush_barrier_transitions();
        self.end_render_pass();

        let resources = self.dev.resources.read().unwrap();
        let dst_res = resources.get(&dst).ok_or(StratusError::NOT_FOUND)?;
        let src_res = resources.get(&src).ok_or(StratusError::NOT_FOUND)?;
        generate_copy_resource(&self.dev.dev, self.current_cbuf(), dst_res, src_res)
    }

    /// Record buffer region copies.
    pub fn copy_buffer_regions(
        &mut self,
        dst: ResourceId,
        src: ResourceId,
        regions: &[CopyBufferRegion],
    ) -> Result<()> {
        self.flush_barrier_transitions();
        self.end_render_pass();

        let resources = self.dev.resources.read().unwrap();
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

        let copies: Vec<vk::BufferCopy> = regions
            .iter()
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset_bytes,
                dst_offset: r.dst_offset_bytes,
                size: r.size_bytes,
            })
            .collect();
        unsafe {
            self.dev.dev.cmd_copy_buffer(
                self.current_cbuf(),
                src_res.buffer_handle()?,
                dst_res.buffer_handle()?,
                &copies,
            );
        }
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.dev.wait_idle();
        self.destroy_frame_resources();
    }
}

/// Returned by `bind_shader_program`; routes resource binds through
/// the program's reflection tables into the current state.
pub struct ShaderProgramBinder<'a> {
    ctx: &'a mut VulkanContext,
    reflection: Option<ShaderProgramReflection>,
}

impl<'a> ShaderProgramBinder<'a> {
    fn translate(table: Option<&Vec<u32>>, slot: u32) -> u32 {
        match table {
            Some(table) => {
                assert!(
                    (slot as usize) < table.len(),
                    "bind slot {} exceeds the program's reflection table",
                    slot
                );
                table[slot as usize]
            }
            None => slot,
        }
    }

    /// Bind a constant buffer range. When `data` is given, it is
    /// copied into the buffer at (offset, size) through the mapped
    /// path, a convenience for small per-draw uniforms.
    pub fn bind_constant_buffer(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        buffer: ResourceId,
        offset: u32,
        size: u32,
        data: Option<&[u8]>,
    ) -> Result<&mut Self> {
        assert!(
            (slot as usize) < MAX_CBV_BINDS,
            "at most {} constant buffers may be bound, slot {} is not allowed",
            MAX_CBV_BINDS,
            slot
        );
        let binding =
            Self::translate(self.reflection.as_ref().map(|r| &r.cbvs), slot);

        if let Some(data) = data {
            let range = MapRange {
                offset_bytes: offset as u64,
                size_bytes: size as u64,
            };
            let ptr = self.ctx.dev.map_resource(buffer, Some(&range))?;
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len().min(size as usize));
            }
            self.ctx.dev.unmap_resource(buffer, Some(&range))?;
        }

        *self.ctx.cbv_access.entry(buffer).or_insert(ShaderStage::empty()) |= stages;

        let state = self.ctx.state_mut();
        state.descriptors.cbvs[slot as usize] = CbvBind {
            buffer: Some(buffer),
            offset,
            size,
            binding,
        };
        state.descriptors.key.shader_type_flags |= stages.bits() as u64;
        state.descriptors.key.cbvs = state.descriptors.key.cbvs.max(slot as u16 + 1);
        state.dirty |= ContextDirtyFlags::RESOURCES;
        Ok(self)
    }

    pub fn bind_shader_resource(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        view: ResourceViewId,
    ) -> Result<&mut Self> {
        assert!(
            (slot as usize) < MAX_SRV_BINDS,
            "at most {} shader resources may be bound, slot {} is not allowed",
            MAX_SRV_BINDS,
            slot
        );
        let binding = Self::translate(self.reflection.as_ref().map(|r| &r.srvs), slot);

        *self.ctx.view_access.entry(view).or_insert(ShaderStage::empty()) |= stages;

        let state = self.ctx.state_mut();
        state.descriptors.srvs[slot as usize] = SrvBind {
            view: Some(view),
            binding,
        };
        state.descriptors.key.shader_type_flags |= stages.bits() as u64;
        state.descriptors.key.srvs = state.descriptors.key.srvs.max(slot as u16 + 1);
        state.dirty |= ContextDirtyFlags::RESOURCES;
        Ok(self)
    }

    pub fn bind_unordered_access_view(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        view: ResourceViewId,
    ) -> Result<&mut Self> {
        assert!(
            (slot as usize) < MAX_UAV_BINDS,
            "at most {} unordered access views may be bound, slot {} is not allowed",
            MAX_UAV_BINDS,
            slot
        );
        let binding = Self::translate(self.reflection.as_ref().map(|r| &r.uavs), slot);

        *self.ctx.view_access.entry(view).or_insert(ShaderStage::empty()) |= stages;

        let state = self.ctx.state_mut();
        state.descriptors.uavs[slot as usize] = SrvBind {
            view: Some(view),
            binding,
        };
        state.descriptors.key.shader_type_flags |= stages.bits() as u64;
        state.descriptors.key.uavs = state.descriptors.key.uavs.max(slot as u16 + 1);
        state.dirty |= ContextDirtyFlags::RESOURCES;
        Ok(self)
    }

    pub fn bind_sampler(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        sampler: SamplerId,
    ) -> Result<&mut Self> {
        assert!(
            (slot as usize) < MAX_SAMPLER_BINDS,
            "at most {} samplers may be bound, slot {} is not allowed",
            MAX_SAMPLER_BINDS,
            slot
        );
        let binding = Self::translate(self.reflection.as_ref().map(|r| &r.samplers), slot);

        *self
            .ctx
            .sampler_access
            .entry(sampler)
            .or_insert(ShaderStage::empty()) |= stages;

        let state = self.ctx.state_mut();
        state.descriptors.samplers[slot as usize] = SamplerBind {
            sampler: Some(sampler),
            binding,
        };
        state.descriptors.key.shader_type_flags |= stages.bits() as u64;
        state.descriptors.key.samplers = state.descriptors.key.samplers.max(slot as u16 + 1);
        state.dirty |= ContextDirtyFlags::RESOURCES;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_key_collides_only_on_counts_and_stages() {
        let a = LayoutKey {
            srvs: 2,
            uavs: 0,
            cbvs: 1,
            samplers: 1,
            shader_type_flags: ShaderStage::VERTEX.bits() as u64,
        };
        let b = a;
        assert_eq!(a.hash64(), b.hash64());

        let c = LayoutKey {
            shader_type_flags: (ShaderStage::VERTEX | ShaderStage::PIXEL).bits() as u64,
            ..a
        };
        assert_ne!(a.hash64(), c.hash64());

        let d = LayoutKey { srvs: 3, ..a };
        assert_ne!(a.hash64(), d.hash64());
    }

    #[test]
    fn descriptor_structure_hash_sees_bound_ids_and_offsets() {
        let mut a = DescriptorSetStructure::default();
        a.key.cbvs = 1;
        a.cbvs[0] = CbvBind {
            buffer: Some(42),
            offset: 0,
            size: 64,
            binding: 0,
        };

        let mut b = a;
        assert_eq!(a.hash64(), b.hash64());

        b.cbvs[0].offset = 256;
        assert_ne!(a.hash64(), b.hash64());

        let mut c = a;
        c.cbvs[0].buffer = Some(43);
        assert_ne!(a.hash64(), c.hash64());
    }

    #[test]
    fn descriptor_structure_hash_ignores_slots_past_the_counts() {
        let mut a = DescriptorSetStructure::default();
        a.key.srvs = 1;
        a.srvs[0] = SrvBind {
            view: Some(7),
            binding: 0,
        };

        let mut b = a;
        // Junk beyond the active count must not affect the key.
        b.srvs[5] = SrvBind {
            view: Some(999),
            binding: 5,
        };
        assert_eq!(a.hash64(), b.hash64());
    }

    #[test]
    fn state_defaults_are_clean() {
        let state = ContextState::default();
        assert!(state.dirty.is_empty());
        assert_eq!(state.num_vbs, 0);
        assert_eq!(state.index_buffer, vk::Buffer::null());
    }
}
