// Render pass and framebuffer caches
//
// Render passes are keyed by attachment formats, expected layouts and
// depth-stencil presence; attachments load and store so binding a
// target never clobbers prior contents. Framebuffers age out through
// a small LRU sweep, render passes live for the device lifetime.

use ash::vk;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::types::{ResourceFormat, ResourceViewId};
use crate::vulkan::commons;
use crate::{Result, StratusError};

/// Everything the cache needs to know about one attachment.
#[derive(Copy, Clone, Debug)]
pub struct AttachmentInfo {
    pub view_id: ResourceViewId,
    pub view: vk::ImageView,
    pub format: ResourceFormat,
    pub expected_layout: vk::ImageLayout,
}

/// A resolved render pass, its framebuffer, and the bits the context
/// needs when opening it.
#[derive(Copy, Clone, Debug, Default)]
pub struct RenderPassBundle {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub num_render_targets: u32,
    pub depth_format: Option<ResourceFormat>,
}

impl RenderPassBundle {
    pub fn is_null(&self) -> bool {
        self.render_pass == vk::RenderPass::null()
    }
}

struct FramebufferEntry {
    framebuffer: vk::Framebuffer,
    last_used_frame: u64,
}

pub struct RenderPassCache {
    passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, FramebufferEntry>,
}

fn pass_key(rts: &[AttachmentInfo], ds: Option<&AttachmentInfo>) -> u64 {
    let mut h = DefaultHasher::new();
    for rt in rts {
        rt.format.hash(&mut h);
        rt.expected_layout.hash(&mut h);
    }
    ds.is_some().hash(&mut h);
    if let Some(ds) = ds {
        ds.format.hash(&mut h);
        ds.expected_layout.hash(&mut h);
    }
    h.finish()
}

fn framebuffer_key(
    render_pass: vk::RenderPass,
    rts: &[AttachmentInfo],
    ds: Option<&AttachmentInfo>,
    extent: vk::Extent2D,
) -> u64 {
    let mut h = DefaultHasher::new();
    render_pass.hash(&mut h);
    for rt in rts {
        rt.view_id.hash(&mut h);
    }
    if let Some(ds) = ds {
        ds.view_id.hash(&mut h);
    }
    extent.width.hash(&mut h);
    extent.height.hash(&mut h);
    1u32.hash(&mut h); // layers
    h.finish()
}

impl RenderPassCache {
    pub fn new() -> Self {
        Self {
            passes: HashMap::new(),
            framebuffers: HashMap::new(),
        }
    }

    fn make_pass(
        &mut self,
        dev: &ash::Device,
        rts: &[AttachmentInfo],
        ds: Option<&AttachmentInfo>,
    ) -> Result<vk::RenderPass> {
        let key = pass_key(rts, ds);
        if let Some(pass) = self.passes.get(&key) {
            return Ok(*pass);
        }

        let mut descriptions = Vec::new();
        let mut color_refs = Vec::new();

        for (i, rt) in rts.iter().enumerate() {
            descriptions.push(
                vk::AttachmentDescription::builder()
                    .format(commons::vk_format(rt.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(rt.expected_layout)
                    .final_layout(rt.expected_layout)
                    .build(),
            );
            color_refs.push(vk::AttachmentReference {
                attachment: i as u32,
                layout: rt.expected_layout,
            });
        }

        let mut depth_ref = vk::AttachmentReference::default();
        if let Some(ds) = ds {
            descriptions.push(
                vk::AttachmentDescription::builder()
                    .format(commons::vk_format(ds.format))
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(ds.expected_layout)
                    .final_layout(ds.expected_layout)
                    .build(),
            );
            depth_ref = vk::AttachmentReference {
                attachment: rts.len() as u32,
                layout: ds.expected_layout,
            };
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if ds.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(&descriptions)
            .subpasses(&subpasses);

        let pass = unsafe {
            dev.create_render_pass(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create render pass: {:?}", e);
                StratusError::FAILED
            })?
        };

        self.passes.insert(key, pass);
        Ok(pass)
    }

    /// Resolve the (render pass, framebuffer) pair for a target set.
    /// `current_frame` stamps the framebuffer for LRU aging.
    pub fn make(
        &mut self,
        dev: &ash::Device,
        rts: &[AttachmentInfo],
        ds: Option<&AttachmentInfo>,
        extent: vk::Extent2D,
        current_frame: u64,
    ) -> Result<RenderPassBundle> {
        let render_pass = self.make_pass(dev, rts, ds)?;

        let fb_key = framebuffer_key(render_pass, rts, ds, extent);
        let framebuffer = match self.framebuffers.get_mut(&fb_key) {
            Some(entry) => {
                entry.last_used_frame = current_frame;
                entry.framebuffer
            }
            None => {
                let mut attachments: Vec<vk::ImageView> = rts.iter().map(|rt| rt.view).collect();
                if let Some(ds) = ds {
                    attachments.push(ds.view);
                }

                let info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);

                let framebuffer = unsafe {
                    dev.create_framebuffer(&info, None).map_err(|e| {
                        log::error!("[VK] Failed to create framebuffer: {:?}", e);
                        StratusError::FAILED
                    })?
                };

                self.framebuffers.insert(
                    fb_key,
                    FramebufferEntry {
                        framebuffer,
                        last_used_frame: current_frame,
                    },
                );
                framebuffer
            }
        };

        Ok(RenderPassBundle {
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            num_render_targets: rts.len() as u32,
            depth_format: ds.map(|d| d.format),
        })
    }

    /// Destroy framebuffers that have not been bound for `max_age`
    /// frames.
    pub fn check_lru_cache(&mut self, dev: &ash::Device, current_frame: u64, max_age: u64) {
        let dead: Vec<u64> = self
            .framebuffers
            .iter()
            .filter(|(_, e)| e.last_used_frame + max_age < current_frame)
            .map(|(k, _)| *k)
            .collect();

        for key in dead {
            if let Some(entry) = self.framebuffers.remove(&key) {
                unsafe { dev.destroy_framebuffer(entry.framebuffer, None) };
            }
        }
    }

    pub fn release(&mut self, dev: &ash::Device) {
        unsafe {
            for (_, entry) in self.framebuffers.drain() {
                dev.destroy_framebuffer(entry.framebuffer, None);
            }
            for (_, pass) in self.passes.drain() {
                dev.destroy_render_pass(pass, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: ResourceViewId, format: ResourceFormat) -> AttachmentInfo {
        AttachmentInfo {
            view_id: id,
            view: vk::ImageView::null(),
            format,
            expected_layout: commons::image_layout_for_state(
                crate::types::ResourceState::RenderTarget,
            ),
        }
    }

    #[test]
    fn pass_key_ignores_view_identity() {
        let a = [info(1, ResourceFormat::B8G8R8A8Unorm)];
        let b = [info(9, ResourceFormat::B8G8R8A8Unorm)];
        assert_eq!(pass_key(&a, None), pass_key(&b, None));
    }

    #[test]
    fn pass_key_sees_format_and_depth_presence() {
        let a = [info(1, ResourceFormat::B8G8R8A8Unorm)];
        let b = [info(1, ResourceFormat::R16G16B16A16Float)];
        assert_ne!(pass_key(&a, None), pass_key(&b, None));

        let ds = info(2, ResourceFormat::D32Float);
        assert_ne!(pass_key(&a, None), pass_key(&a, Some(&ds)));
    }

    #[test]
    fn framebuffer_key_sees_views_and_extent() {
        let rp = vk::RenderPass::null();
        let a = [info(1, ResourceFormat::B8G8R8A8Unorm)];
        let b = [info(2, ResourceFormat::B8G8R8A8Unorm)];
        let e1 = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let e2 = vk::Extent2D {
            width: 1200,
            height: 600,
        };
        assert_ne!(framebuffer_key(rp, &a, None, e1), framebuffer_key(rp, &b, None, e1));
        assert_ne!(framebuffer_key(rp, &a, None, e1), framebuffer_key(rp, &a, None, e2));
        assert_eq!(framebuffer_key(rp, &a, None, e1), framebuffer_key(rp, &a, None, e1));
    }
}
