// A rendering hardware interface
//
// One API for GPU resource creation, command recording and frame
// presentation, dispatched over the active backend. The Vulkan
// backend is the one implemented here; the public objects are sum
// types so additional drivers slot in as new variants.

mod types;
pub mod vulkan;

pub use types::*;

use std::sync::Arc;

use thiserror::Error;

use vulkan::{VulkanAdapter, VulkanContext, VulkanDevice, VulkanInstance, VulkanSwapchain};

/// Everything that can go wrong at this layer. `NEEDS_UPDATE` is the
/// only non-fatal code: the swapchain wants a rebuild.
#[allow(non_camel_case_types)]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum StratusError {
    #[error("operation failed")]
    FAILED,
    #[error("null handle or pointer")]
    NULL_PTR_EXCEPT,
    #[error("invalid arguments")]
    INVALID_ARGS,
    #[error("object not found")]
    NOT_FOUND,
    #[error("not implemented for this backend")]
    NO_IMPL,
    #[error("out of memory")]
    OUT_OF_MEMORY,
    #[error("swapchain needs update")]
    NEEDS_UPDATE,
}

pub type Result<T> = std::result::Result<T, StratusError>;

/// A loaded driver session. Create one, initialize it, enumerate
/// adapters from it. Destroyed last.
pub enum Instance {
    Vulkan(Option<Arc<VulkanInstance>>),
}

impl Instance {
    /// Pick the driver. Only the Vulkan backend is wired up in this
    /// crate; the other apis answer `NO_IMPL`.
    pub fn create(api: Api) -> Result<Self> {
        match api {
            Api::Vulkan => Ok(Instance::Vulkan(None)),
            other => {
                log::warn!("No backend available for {:?}", other);
                Err(StratusError::NO_IMPL)
            }
        }
    }

    /// Load the native driver with the requested layers. Flags not
    /// supported by the installed driver are dropped with a warning.
    pub fn initialize(&mut self, app: &AppInfo, flags: LayerFlags) -> Result<()> {
        match self {
            Instance::Vulkan(slot) => {
                *slot = Some(Arc::new(VulkanInstance::new(app, flags)?));
                Ok(())
            }
        }
    }

    /// Layer flags that were actually granted.
    pub fn granted_layers(&self) -> LayerFlags {
        match self {
            Instance::Vulkan(Some(inst)) => inst.granted_layers(),
            Instance::Vulkan(None) => LayerFlags::empty(),
        }
    }

    /// Enumerate the physical devices this instance can drive.
    pub fn adapters(&self) -> Result<Vec<Adapter>> {
        match self {
            Instance::Vulkan(Some(inst)) => Ok(VulkanAdapter::enumerate(inst)?
                .into_iter()
                .map(Adapter::Vulkan)
                .collect()),
            Instance::Vulkan(None) => Err(StratusError::FAILED),
        }
    }
}

/// A read-only physical device descriptor.
pub enum Adapter {
    Vulkan(VulkanAdapter),
}

impl Adapter {
    pub fn name(&self) -> String {
        match self {
            Adapter::Vulkan(adapter) => adapter.name(),
        }
    }

    pub fn vendor_id(&self) -> u32 {
        match self {
            Adapter::Vulkan(adapter) => adapter.vendor_id(),
        }
    }

    /// Create the logical device. With a window handle in `info` a
    /// presentation surface is created and swapchain support enabled.
    pub fn create_device(&self, info: &DeviceCreateInfo) -> Result<Device> {
        match self {
            Adapter::Vulkan(adapter) => Ok(Device::Vulkan(VulkanDevice::new(adapter, info)?)),
        }
    }
}

/// The logical device. Owns all GPU objects; thread safe for
/// resource creation and destruction.
#[derive(Clone)]
pub enum Device {
    Vulkan(Arc<VulkanDevice>),
}

impl Device {
    /// A new recording context, double buffered until `set_frames`
    /// says otherwise.
    pub fn create_context(&self) -> Result<Context> {
        match self {
            Device::Vulkan(dev) => Ok(Context::Vulkan(VulkanContext::new(dev.clone(), 2)?)),
        }
    }

    pub fn create_swapchain(&self, desc: &SwapchainCreateDescription) -> Result<Swapchain> {
        match self {
            Device::Vulkan(dev) => Ok(Swapchain::Vulkan(VulkanSwapchain::new(dev.clone(), desc)?)),
        }
    }

    pub fn create_resource(
        &self,
        desc: &GraphicsResourceDescription,
        initial_state: ResourceState,
    ) -> Result<Resource> {
        match self {
            Device::Vulkan(dev) => {
                let id = dev.create_resource(desc, initial_state)?;
                Ok(Resource::Vulkan {
                    dev: dev.clone(),
                    id,
                })
            }
        }
    }

    /// Destroy a resource. With `immediate` false the backing memory
    /// rides the garbage ring for a full frame cycle before reclaim.
    pub fn destroy_resource(&self, resource: &Resource, immediate: bool) -> Result<()> {
        match (self, resource) {
            (Device::Vulkan(dev), Resource::Vulkan { id, .. }) => {
                dev.destroy_resource(*id, immediate)
            }
        }
    }

    pub fn create_sampler(&self, desc: &SamplerDescription) -> Result<Sampler> {
        match self {
            Device::Vulkan(dev) => {
                let id = dev.create_sampler(desc)?;
                Ok(Sampler::Vulkan {
                    dev: dev.clone(),
                    id,
                })
            }
        }
    }

    pub fn destroy_sampler(&self, sampler: &Sampler) -> Result<()> {
        match (self, sampler) {
            (Device::Vulkan(dev), Sampler::Vulkan { id, .. }) => dev.destroy_sampler(*id),
        }
    }

    pub fn load_shader_program(
        &self,
        program: ShaderProgramId,
        permutation: ShaderPermutationId,
        definition: &ShaderProgramDefinition,
    ) -> Result<()> {
        match self {
            Device::Vulkan(dev) => dev.load_shader_program(program, permutation, definition),
        }
    }

    pub fn unload_shader_program(&self, program: ShaderProgramId) -> Result<()> {
        match self {
            Device::Vulkan(dev) => dev.unload_shader_program(program),
        }
    }

    pub fn unload_all_shader_programs(&self) {
        match self {
            Device::Vulkan(dev) => dev.unload_all_shader_programs(),
        }
    }

    /// Register a vertex input layout under `id`. Returns false when
    /// the id is already taken.
    pub fn make_vertex_layout(&self, id: VertexInputLayoutId, layout: &VertexInputLayout) -> bool {
        match self {
            Device::Vulkan(dev) => dev.make_vertex_layout(id, layout),
        }
    }

    pub fn destroy_vertex_layout(&self, id: VertexInputLayoutId) -> bool {
        match self {
            Device::Vulkan(dev) => dev.destroy_vertex_layout(id),
        }
    }

    /// Blocking whole-resource copy through the transfer queue.
    pub fn copy_resource(&self, dst: &Resource, src: &Resource) -> Result<()> {
        match (self, dst, src) {
            (
                Device::Vulkan(dev),
                Resource::Vulkan { id: dst, .. },
                Resource::Vulkan { id: src, .. },
            ) => dev.copy_resource(*dst, *src),
        }
    }

    /// Blocking buffer region copy through the transfer queue.
    pub fn copy_buffer_regions(
        &self,
        dst: &Resource,
        src: &Resource,
        regions: &[CopyBufferRegion],
    ) -> Result<()> {
        match (self, dst, src) {
            (
                Device::Vulkan(dev),
                Resource::Vulkan { id: dst, .. },
                Resource::Vulkan { id: src, .. },
            ) => dev.copy_buffer_regions(*dst, *src, regions),
        }
    }

    pub fn wait_idle(&self) {
        match self {
            Device::Vulkan(dev) => dev.wait_idle(),
        }
    }
}

/// A stable handle to a buffer or image. Valid across frames until
/// destroyed through the device.
#[derive(Clone)]
pub enum Resource {
    Vulkan {
        dev: Arc<VulkanDevice>,
        id: ResourceId,
    },
}

impl Resource {
    pub fn id(&self) -> ResourceId {
        match self {
            Resource::Vulkan { id, .. } => *id,
        }
    }

    /// Materialize (or fetch the cached) view for a description.
    /// Identical descriptions return the same view id.
    pub fn as_view(&self, desc: &ResourceViewDescription) -> Result<ResourceViewId> {
        match self {
            Resource::Vulkan { dev, id } => dev.resource_as_view(*id, desc),
        }
    }

    /// Map a host-visible buffer. The pointer addresses the requested
    /// range within the persistently mapped backing page.
    pub fn map(&self, range: Option<&MapRange>) -> Result<*mut u8> {
        match self {
            Resource::Vulkan { dev, id } => dev.map_resource(*id, range),
        }
    }

    /// Finish a mapped access. The written (or to-be-read) range is
    /// queued for the per-frame bulk flush or invalidate.
    pub fn unmap(&self, range: Option<&MapRange>) -> Result<()> {
        match self {
            Resource::Vulkan { dev, id } => dev.unmap_resource(*id, range),
        }
    }
}

/// An immutable sampler object.
#[derive(Clone)]
pub enum Sampler {
    Vulkan {
        dev: Arc<VulkanDevice>,
        id: SamplerId,
    },
}

impl Sampler {
    pub fn id(&self) -> SamplerId {
        match self {
            Sampler::Vulkan { id, .. } => *id,
        }
    }
}

/// Bind-time helper returned by `Context::bind_shader_program`.
pub enum ShaderProgramBinder<'a> {
    Vulkan(vulkan::ShaderProgramBinder<'a>),
}

impl<'a> ShaderProgramBinder<'a> {
    pub fn bind_constant_buffer(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        buffer: &Resource,
        offset: u32,
        size: u32,
        data: Option<&[u8]>,
    ) -> Result<&mut Self> {
        match self {
            ShaderProgramBinder::Vulkan(binder) => {
                binder.bind_constant_buffer(stages, slot, buffer.id(), offset, size, data)?;
            }
        }
        Ok(self)
    }

    pub fn bind_shader_resource(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        view: ResourceViewId,
    ) -> Result<&mut Self> {
        match self {
            ShaderProgramBinder::Vulkan(binder) => {
                binder.bind_shader_resource(stages, slot, view)?;
            }
        }
        Ok(self)
    }

    pub fn bind_unordered_access_view(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        view: ResourceViewId,
    ) -> Result<&mut Self> {
        match self {
            ShaderProgramBinder::Vulkan(binder) => {
                binder.bind_unordered_access_view(stages, slot, view)?;
            }
        }
        Ok(self)
    }

    pub fn bind_sampler(
        &mut self,
        stages: ShaderStage,
        slot: u32,
        sampler: &Sampler,
    ) -> Result<&mut Self> {
        match self {
            ShaderProgramBinder::Vulkan(binder) => {
                binder.bind_sampler(stages, slot, sampler.id())?;
            }
        }
        Ok(self)
    }
}

/// A frame recording context. Single threaded; a device may host
/// several for parallel recording.
pub enum Context {
    Vulkan(VulkanContext),
}

impl Context {
    /// Open the next frame slot, blocking until the GPU is past its
    /// previous use.
    pub fn begin(&mut self) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.begin(),
        }
    }

    /// Close and submit the frame's command buffer.
    pub fn end(&mut self) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.end(),
        }
    }

    /// Drain the presentation queue.
    pub fn wait(&self) {
        match self {
            Context::Vulkan(ctx) => ctx.wait(),
        }
    }

    /// Change the frame depth. Waits for the device to go idle.
    pub fn set_frames(&mut self, buffer_count: u32) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.set_frames(buffer_count),
        }
    }

    pub fn frame_count(&self) -> u32 {
        match self {
            Context::Vulkan(ctx) => ctx.frame_count(),
        }
    }

    pub fn current_frame_index(&self) -> u32 {
        match self {
            Context::Vulkan(ctx) => ctx.current_frame_index(),
        }
    }

    pub fn push_state(&mut self, flags: ContextFlags) {
        match self {
            Context::Vulkan(ctx) => ctx.push_state(flags),
        }
    }

    pub fn pop_state(&mut self) {
        match self {
            Context::Vulkan(ctx) => ctx.pop_state(),
        }
    }

    /// Queue a resource state transition. Zero mip/layer counts cover
    /// the whole image.
    pub fn transition(
        &mut self,
        resource: &Resource,
        state: ResourceState,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.transition(
                resource.id(),
                state,
                base_mip,
                mip_count,
                base_layer,
                layer_count,
            ),
        }
    }

    pub fn copy_resource(&mut self, dst: &Resource, src: &Resource) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.copy_resource(dst.id(), src.id()),
        }
    }

    pub fn copy_buffer_regions(
        &mut self,
        dst: &Resource,
        src: &Resource,
        regions: &[CopyBufferRegion],
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.copy_buffer_regions(dst.id(), src.id(), regions),
        }
    }

    /// Select the render targets for subsequent draws. The matching
    /// render pass is computed now and begun at the next draw or
    /// clear.
    pub fn bind_render_targets(
        &mut self,
        rtvs: &[ResourceViewId],
        dsv: Option<ResourceViewId>,
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.bind_render_targets(rtvs, dsv),
        }
    }

    pub fn clear_render_target(&mut self, index: u32, color: &[f32; 4], rect: &Rect) {
        match self {
            Context::Vulkan(ctx) => ctx.clear_render_target(index, color, rect),
        }
    }

    pub fn clear_depth_stencil(
        &mut self,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
        rect: &Rect,
    ) {
        match self {
            Context::Vulkan(ctx) => ctx.clear_depth_stencil(flags, depth, stencil, rect),
        }
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        match self {
            Context::Vulkan(ctx) => ctx.set_viewports(viewports),
        }
    }

    pub fn set_scissors(&mut self, scissors: &[Rect]) {
        match self {
            Context::Vulkan(ctx) => ctx.set_scissors(scissors),
        }
    }

    pub fn set_topology(&mut self, topology: PrimitiveTopology) {
        match self {
            Context::Vulkan(ctx) => ctx.set_topology(topology),
        }
    }

    pub fn set_polygon_mode(&mut self, mode: PolygonMode) {
        match self {
            Context::Vulkan(ctx) => ctx.set_polygon_mode(mode),
        }
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) {
        match self {
            Context::Vulkan(ctx) => ctx.set_cull_mode(mode),
        }
    }

    pub fn set_front_face(&mut self, face: FrontFace) {
        match self {
            Context::Vulkan(ctx) => ctx.set_front_face(face),
        }
    }

    pub fn set_line_width(&mut self, width: f32) {
        match self {
            Context::Vulkan(ctx) => ctx.set_line_width(width),
        }
    }

    pub fn enable_depth(&mut self, enable: bool) {
        match self {
            Context::Vulkan(ctx) => ctx.enable_depth(enable),
        }
    }

    pub fn enable_depth_write(&mut self, enable: bool) {
        match self {
            Context::Vulkan(ctx) => ctx.enable_depth_write(enable),
        }
    }

    pub fn enable_stencil(&mut self, enable: bool) {
        match self {
            Context::Vulkan(ctx) => ctx.enable_stencil(enable),
        }
    }

    pub fn set_depth_compare_op(&mut self, op: CompareOp) {
        match self {
            Context::Vulkan(ctx) => ctx.set_depth_compare_op(op),
        }
    }

    pub fn set_stencil_reference(&mut self, reference: u8) {
        match self {
            Context::Vulkan(ctx) => ctx.set_stencil_reference(reference),
        }
    }

    pub fn set_stencil_read_mask(&mut self, mask: u8) {
        match self {
            Context::Vulkan(ctx) => ctx.set_stencil_read_mask(mask),
        }
    }

    pub fn set_stencil_write_mask(&mut self, mask: u8) {
        match self {
            Context::Vulkan(ctx) => ctx.set_stencil_write_mask(mask),
        }
    }

    pub fn set_blend_enable(&mut self, rt_index: u32, enable: bool) {
        match self {
            Context::Vulkan(ctx) => ctx.set_blend_enable(rt_index, enable),
        }
    }

    #[allow(clippy::too_many_arguments)]
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
        match self {
            Context::Vulkan(ctx) => ctx.set_blend(
                rt_index, src_color, dst_color, color_op, src_alpha, dst_alpha, alpha_op,
            ),
        }
    }

    pub fn set_color_write_mask(&mut self, rt_index: u32, mask: ColorComponents) {
        match self {
            Context::Vulkan(ctx) => ctx.set_color_write_mask(rt_index, mask),
        }
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        match self {
            Context::Vulkan(ctx) => ctx.set_blend_constants(constants),
        }
    }

    pub fn set_blend_logic_op_enable(&mut self, enable: bool) {
        match self {
            Context::Vulkan(ctx) => ctx.set_blend_logic_op_enable(enable),
        }
    }

    pub fn set_blend_logic_op(&mut self, op: LogicOp) {
        match self {
            Context::Vulkan(ctx) => ctx.set_blend_logic_op(op),
        }
    }

    /// Select the shader program for subsequent draws; resources are
    /// attached through the returned binder.
    pub fn bind_shader_program(
        &mut self,
        program: ShaderProgramId,
        permutation: ShaderPermutationId,
    ) -> Result<ShaderProgramBinder<'_>> {
        match self {
            Context::Vulkan(ctx) => Ok(ShaderProgramBinder::Vulkan(
                ctx.bind_shader_program(program, permutation)?,
            )),
        }
    }

    pub fn set_input_vertex_layout(&mut self, id: VertexInputLayoutId) {
        match self {
            Context::Vulkan(ctx) => ctx.set_input_vertex_layout(id),
        }
    }

    pub fn bind_vertex_buffers(&mut self, buffers: &[&Resource], offsets: &[u64]) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => {
                let ids: Vec<ResourceId> = buffers.iter().map(|b| b.id()).collect();
                ctx.bind_vertex_buffers(&ids, offsets)
            }
        }
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &Resource,
        offset: u64,
        index_type: IndexType,
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.bind_index_buffer(buffer.id(), offset, index_type),
        }
    }

    pub fn clear_resource_binds(&mut self) {
        match self {
            Context::Vulkan(ctx) => ctx.clear_resource_binds(),
        }
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => {
                ctx.draw_instanced(vertex_count, instance_count, first_vertex, first_instance)
            }
        }
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.draw_indexed_instanced(
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            ),
        }
    }

    pub fn draw_instanced_indirect(
        &mut self,
        args: &Resource,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => {
                ctx.draw_instanced_indirect(args.id(), offset, draw_count, stride)
            }
        }
    }

    pub fn draw_indexed_instanced_indirect(
        &mut self,
        args: &Resource,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => {
                ctx.draw_indexed_instanced_indirect(args.id(), offset, draw_count, stride)
            }
        }
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.dispatch(x, y, z),
        }
    }

    pub fn dispatch_indirect(&mut self, args: &Resource, offset: u64) -> Result<()> {
        match self {
            Context::Vulkan(ctx) => ctx.dispatch_indirect(args.id(), offset),
        }
    }
}

/// The presentation image set for one surface.
pub enum Swapchain {
    Vulkan(VulkanSwapchain),
}

impl Swapchain {
    /// Begin the context's frame and acquire the next image.
    /// `Err(NEEDS_UPDATE)` means the surface changed and the caller
    /// must `Context::wait` then `rebuild`.
    pub fn prepare(&mut self, context: &mut Context) -> Result<()> {
        match (self, context) {
            (Swapchain::Vulkan(swapchain), Context::Vulkan(ctx)) => swapchain.prepare(ctx),
        }
    }

    /// Present the acquired image. `Err(NEEDS_UPDATE)` demands a
    /// rebuild; everything else presented fine.
    pub fn present(&mut self, context: &mut Context, config: PresentConfig) -> Result<()> {
        match (self, context) {
            (Swapchain::Vulkan(swapchain), Context::Vulkan(ctx)) => {
                swapchain.present(ctx, config)
            }
        }
    }

    /// Rebuild after a resize. Callers wait on the context first.
    pub fn rebuild(&mut self, desc: &SwapchainCreateDescription) -> Result<()> {
        match self {
            Swapchain::Vulkan(swapchain) => swapchain.rebuild(desc),
        }
    }

    /// The wrapped backbuffer image at `idx`.
    pub fn get_frame(&self, idx: u32) -> Option<Resource> {
        match self {
            Swapchain::Vulkan(swapchain) => {
                let id = swapchain.frame(idx)?;
                Some(Resource::Vulkan {
                    dev: swapchain.device().clone(),
                    id,
                })
            }
        }
    }

    pub fn get_current_frame_index(&self) -> u32 {
        match self {
            Swapchain::Vulkan(swapchain) => swapchain.current_frame_index(),
        }
    }

    pub fn get_current_image_index(&self) -> u32 {
        match self {
            Swapchain::Vulkan(swapchain) => swapchain.current_image_index(),
        }
    }

    pub fn frame_count(&self) -> u32 {
        match self {
            Swapchain::Vulkan(swapchain) => swapchain.frame_count(),
        }
    }

    pub fn description(&self) -> SwapchainCreateDescription {
        match self {
            Swapchain::Vulkan(swapchain) => *swapchain.description(),
        }
    }
}
