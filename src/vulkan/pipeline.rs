// Pipeline state and the content-addressed pipeline caches
//
// The pipeline structure below is the cache key: every field that
// feeds pipeline creation is part of it, hashed to 64 bits. The
// render pass and descriptor set layout handles inside it are
// themselves cache results, so identical inputs hash identically.

use ash::vk;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::types::*;
use crate::vulkan::commons;
use crate::vulkan::shader::ShaderCache;
use crate::{Result, StratusError};

pub const MAX_RENDER_TARGETS: usize = 8;

/// Blend parameters of a single render target.
#[derive(Copy, Clone, Debug)]
pub struct RenderTargetBlendState {
    pub blend_enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorComponents,
}

impl Default for RenderTargetBlendState {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorComponents::ALL,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BlendState {
    pub logic_op_enable: bool,
    pub logic_op: LogicOp,
    pub blend_constants: [f32; 4],
    pub attachments: [RenderTargetBlendState; MAX_RENDER_TARGETS],
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            logic_op_enable: false,
            logic_op: LogicOp::NoOp,
            blend_constants: [0.0; 4],
            attachments: [RenderTargetBlendState::default(); MAX_RENDER_TARGETS],
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct RasterState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub line_width: f32,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            line_width: 1.0,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub stencil_test_enable: bool,
    pub stencil_reference: u8,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: CompareOp::LessOrEqual,
            stencil_test_enable: false,
            stencil_reference: 0,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
        }
    }
}

/// Graphics-only half of the pipeline key.
#[derive(Copy, Clone, Debug, Default)]
pub struct GraphicsPipelineState {
    pub vertex_layout: VertexInputLayoutId,
    pub topology: PrimitiveTopology,
    pub raster: RasterState,
    pub blend: BlendState,
    pub depth_stencil: DepthStencilState,
    pub num_render_targets: u32,
    pub render_pass: vk::RenderPass,
}

/// The full pipeline cache key. Hashed with floats taken by bit
/// pattern so two identical states collide exactly.
#[derive(Copy, Clone, Debug, Default)]
pub struct PipelineStructure {
    pub program: ShaderProgramId,
    pub permutation: ShaderPermutationId,
    pub descriptor_layout: vk::DescriptorSetLayout,
    pub graphics: GraphicsPipelineState,
}

impl PipelineStructure {
    pub fn hash64(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.program.hash(&mut h);
        self.permutation.hash(&mut h);
        self.descriptor_layout.hash(&mut h);

        let g = &self.graphics;
        g.vertex_layout.hash(&mut h);
        (g.topology as u32).hash(&mut h);
        (g.raster.polygon_mode as u32).hash(&mut h);
        (g.raster.cull_mode as u32).hash(&mut h);
        (g.raster.front_face as u32).hash(&mut h);
        g.raster.line_width.to_bits().hash(&mut h);
        g.depth_stencil.depth_test_enable.hash(&mut h);
        g.depth_stencil.depth_write_enable.hash(&mut h);
        (g.depth_stencil.depth_compare_op as u32).hash(&mut h);
        g.depth_stencil.stencil_test_enable.hash(&mut h);
        g.depth_stencil.stencil_reference.hash(&mut h);
        g.depth_stencil.stencil_read_mask.hash(&mut h);
        g.depth_stencil.stencil_write_mask.hash(&mut h);
        g.blend.logic_op_enable.hash(&mut h);
        (g.blend.logic_op as u32).hash(&mut h);
        for c in g.blend.blend_constants.iter() {
            c.to_bits().hash(&mut h);
        }
        for a in g.blend.attachments.iter() {
            a.blend_enable.hash(&mut h);
            (a.src_color as u32).hash(&mut h);
            (a.dst_color as u32).hash(&mut h);
            (a.color_op as u32).hash(&mut h);
            (a.src_alpha as u32).hash(&mut h);
            (a.dst_alpha as u32).hash(&mut h);
            (a.alpha_op as u32).hash(&mut h);
            a.write_mask.bits().hash(&mut h);
        }
        g.num_render_targets.hash(&mut h);
        g.render_pass.hash(&mut h);
        h.finish()
    }
}

/// A resolved pipeline, cheap to copy into the context.
#[derive(Copy, Clone, Debug, Default)]
pub struct PipelineState {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

/// Device-global pipeline caches, append-only for the device
/// lifetime. One pipeline layout exists per descriptor set layout.
pub struct PipelineCaches {
    pipelines: HashMap<u64, PipelineState>,
    layouts: HashMap<vk::DescriptorSetLayout, vk::PipelineLayout>,
    vertex_layouts: HashMap<VertexInputLayoutId, VertexInputLayout>,
}

impl PipelineCaches {
    pub fn new() -> Self {
        Self {
            pipelines: HashMap::new(),
            layouts: HashMap::new(),
            vertex_layouts: HashMap::new(),
        }
    }

    pub fn register_vertex_layout(
        &mut self,
        id: VertexInputLayoutId,
        layout: VertexInputLayout,
    ) -> bool {
        self.vertex_layouts.insert(id, layout).is_none()
    }

    pub fn destroy_vertex_layout(&mut self, id: VertexInputLayoutId) -> bool {
        self.vertex_layouts.remove(&id).is_some()
    }

    /// One pipeline layout per descriptor set layout.
    pub fn make_layout(
        &mut self,
        dev: &ash::Device,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<vk::PipelineLayout> {
        if let Some(layout) = self.layouts.get(&set_layout) {
            return Ok(*layout);
        }

        let set_layouts = [set_layout];
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = unsafe {
            dev.create_pipeline_layout(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create pipeline layout: {:?}", e);
                StratusError::FAILED
            })?
        };

        self.layouts.insert(set_layout, layout);
        Ok(layout)
    }

    /// Look up or build the pipeline for `structure`.
    pub fn make_pipeline(
        &mut self,
        dev: &ash::Device,
        shaders: &ShaderCache,
        structure: &PipelineStructure,
    ) -> Result<PipelineState> {
        let key = structure.hash64();
        if let Some(state) = self.pipelines.get(&key) {
            return Ok(*state);
        }

        let program = shaders
            .get(structure.program, structure.permutation)
            .ok_or(StratusError::NOT_FOUND)?;

        let layout = self.make_layout(dev, structure.descriptor_layout)?;

        let state = match program.bind_point {
            vk::PipelineBindPoint::COMPUTE => {
                let stage = program
                    .stages
                    .first()
                    .ok_or(StratusError::INVALID_ARGS)?;
                let stage_info = vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(stage.entry.as_c_str())
                    .build();

                let info = vk::ComputePipelineCreateInfo::builder()
                    .stage(stage_info)
                    .layout(layout)
                    .build();

                let pipeline = unsafe {
                    dev.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                        .map_err(|(_, e)| {
                            log::error!("[VK] Failed to create compute pipeline: {:?}", e);
                            StratusError::FAILED
                        })?[0]
                };

                PipelineState {
                    pipeline,
                    layout,
                    bind_point: vk::PipelineBindPoint::COMPUTE,
                }
            }
            _ => self.make_graphics_pipeline(dev, program, layout, structure)?,
        };

        self.pipelines.insert(key, state);
        Ok(state)
    }

    fn make_graphics_pipeline(
        &self,
        dev: &ash::Device,
        program: &crate::vulkan::shader::VulkanShaderProgram,
        layout: vk::PipelineLayout,
        structure: &PipelineStructure,
    ) -> Result<PipelineState> {
        let g = &structure.graphics;

        if g.render_pass == vk::RenderPass::null() {
            log::error!("[VK] Graphics pipeline requested without a render pass bound");
            return Err(StratusError::INVALID_ARGS);
        }

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = program
            .stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(s.stage)
                    .module(s.module)
                    .name(s.entry.as_c_str())
                    .build()
            })
            .collect();

        // Vertex input from the registered layout; an unregistered id
        // simply means no vertex attributes.
        let mut bindings = Vec::new();
        let mut attributes = Vec::new();
        if let Some(vl) = self.vertex_layouts.get(&g.vertex_layout) {
            for binding in vl.bindings.iter() {
                bindings.push(
                    vk::VertexInputBindingDescription::builder()
                        .binding(binding.binding)
                        .stride(binding.stride_bytes)
                        .input_rate(commons::vk_input_rate(binding.input_rate))
                        .build(),
                );
                for attr in binding.attributes.iter() {
                    attributes.push(
                        vk::VertexInputAttributeDescription::builder()
                            .binding(binding.binding)
                            .location(attr.location)
                            .format(commons::vk_format(attr.format))
                            .offset(attr.offset_bytes)
                            .build(),
                    );
                }
            }
        }
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes)
            .build();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(commons::vk_topology(g.topology))
            .primitive_restart_enable(false)
            .build();

        let raster = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(commons::vk_polygon_mode(g.raster.polygon_mode))
            .cull_mode(commons::vk_cull_mode(g.raster.cull_mode))
            .front_face(commons::vk_front_face(g.raster.front_face))
            .line_width(g.raster.line_width)
            .rasterizer_discard_enable(false)
            .build();

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .build();

        let stencil_op = vk::StencilOpState {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: g.depth_stencil.stencil_read_mask as u32,
            write_mask: g.depth_stencil.stencil_write_mask as u32,
            reference: g.depth_stencil.stencil_reference as u32,
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(g.depth_stencil.depth_test_enable)
            .depth_write_enable(g.depth_stencil.depth_write_enable)
            .depth_compare_op(commons::vk_compare_op(g.depth_stencil.depth_compare_op))
            .stencil_test_enable(g.depth_stencil.stencil_test_enable)
            .front(stencil_op)
            .back(stencil_op)
            .build();

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = g.blend.attachments
            [..g.num_render_targets as usize]
            .iter()
            .map(|a| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .blend_enable(a.blend_enable)
                    .src_color_blend_factor(commons::vk_blend_factor(a.src_color))
                    .dst_color_blend_factor(commons::vk_blend_factor(a.dst_color))
                    .color_blend_op(commons::vk_blend_op(a.color_op))
                    .src_alpha_blend_factor(commons::vk_blend_factor(a.src_alpha))
                    .dst_alpha_blend_factor(commons::vk_blend_factor(a.dst_alpha))
                    .alpha_blend_op(commons::vk_blend_op(a.alpha_op))
                    .color_write_mask(commons::vk_color_components(a.write_mask))
                    .build()
            })
            .collect();
        let blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(g.blend.logic_op_enable)
            .logic_op(commons::vk_logic_op(g.blend.logic_op))
            .blend_constants(g.blend.blend_constants)
            .attachments(&blend_attachments)
            .build();

        // Viewports and scissors stay dynamic, the context sets them
        // with dedicated commands.
        let viewport = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .viewport_state(&viewport)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(g.render_pass)
            .subpass(0)
            .build();

        let pipeline = unsafe {
            dev.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| {
                    log::error!("[VK] Failed to create graphics pipeline: {:?}", e);
                    StratusError::FAILED
                })?[0]
        };

        Ok(PipelineState {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    pub fn release(&mut self, dev: &ash::Device) {
        unsafe {
            for (_, state) in self.pipelines.drain() {
                dev.destroy_pipeline(state.pipeline, None);
            }
            for (_, layout) in self.layouts.drain() {
                dev.destroy_pipeline_layout(layout, None);
            }
        }
        self.vertex_layouts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_structures_hash_identically() {
        let a = PipelineStructure::default();
        let b = PipelineStructure::default();
        assert_eq!(a.hash64(), b.hash64());
    }

    #[test]
    fn blend_state_feeds_the_key() {
        let a = PipelineStructure::default();
        let mut b = PipelineStructure::default();
        b.graphics.blend.attachments[0].blend_enable = true;
        assert_ne!(a.hash64(), b.hash64());

        let mut c = PipelineStructure::default();
        c.graphics.blend.blend_constants[2] = 0.5;
        assert_ne!(a.hash64(), c.hash64());
    }

    #[test]
    fn raster_floats_hash_by_bits() {
        let a = PipelineStructure::default();
        let mut b = PipelineStructure::default();
        b.graphics.raster.line_width = 2.0;
        assert_ne!(a.hash64(), b.hash64());

        b.graphics.raster.line_width = 1.0;
        assert_eq!(a.hash64(), b.hash64());
    }

    #[test]
    fn vertex_layout_registry_rejects_nothing_twice() {
        let mut caches = PipelineCaches::new();
        assert!(caches.register_vertex_layout(7, VertexInputLayout::default()));
        assert!(!caches.register_vertex_layout(7, VertexInputLayout::default()));
        assert!(caches.destroy_vertex_layout(7));
        assert!(!caches.destroy_vertex_layout(7));
    }
}
