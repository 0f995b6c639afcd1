// Resource views and samplers
//
// A view is a typed window onto a resource. Image views own a native
// VkImageView; buffer views only carry their element range, the
// descriptor writer reads it when binding. Both are registered on the
// device and referred to by id.

use ash::vk;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::*;
use crate::vulkan::commons;
use crate::vulkan::resource::VulkanResource;
use crate::{Result, StratusError};

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SAMPLER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_view_id() -> ResourceViewId {
    NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_sampler_id() -> SamplerId {
    NEXT_SAMPLER_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct VulkanResourceView {
    pub id: ResourceViewId,
    pub desc: ResourceViewDescription,
    pub resource: ResourceId,
    /// Null for buffer views.
    pub view: vk::ImageView,
    /// The layout the view's type expects its image in when bound.
    pub expected_layout: vk::ImageLayout,
}

impl VulkanResourceView {
    pub fn is_buffer_view(&self) -> bool {
        self.desc.dimension == ResourceViewDimension::Buffer
    }

    /// Create a view onto `resource`. Image views get a native
    /// handle; buffer views are descriptor-time only.
    pub fn new(
        dev: &ash::Device,
        resource: &VulkanResource,
        desc: &ResourceViewDescription,
    ) -> Result<Self> {
        let id = next_view_id();

        if desc.dimension == ResourceViewDimension::Buffer {
            if !resource.is_buffer() {
                log::error!("[VK] Buffer view requested on an image resource");
                return Err(StratusError::INVALID_ARGS);
            }
            return Ok(Self {
                id,
                desc: *desc,
                resource: resource.id,
                view: vk::ImageView::null(),
                expected_layout: vk::ImageLayout::UNDEFINED,
            });
        }

        if resource.is_buffer() {
            log::error!("[VK] Image view requested on a buffer resource");
            return Err(StratusError::INVALID_ARGS);
        }

        let aspect = if desc.view_type == ResourceViewType::DepthStencil {
            commons::depth_stencil_aspect(desc.format)
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let info = vk::ImageViewCreateInfo::builder()
            .image(resource.image_handle()?)
            .view_type(commons::vk_image_view_type(desc.dimension))
            .format(commons::vk_format(desc.format))
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: desc.base_mip_level,
                level_count: desc.mip_level_count,
                base_array_layer: desc.base_array_layer,
                layer_count: desc.layer_count,
            });

        let view = unsafe {
            dev.create_image_view(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create image view: {:?}", e);
                StratusError::FAILED
            })?
        };

        Ok(Self {
            id,
            desc: *desc,
            resource: resource.id,
            view,
            expected_layout: commons::expected_layout_for_view(desc.view_type),
        })
    }

    pub fn release(&mut self, dev: &ash::Device) {
        if self.view != vk::ImageView::null() {
            unsafe { dev.destroy_image_view(self.view, None) };
            self.view = vk::ImageView::null();
        }
    }
}

pub struct VulkanSampler {
    pub id: SamplerId,
    pub sampler: vk::Sampler,
    pub desc_hash: u64,
}

impl VulkanSampler {
    pub fn description_hash(&self) -> u64 {
        self.desc_hash
    }

    pub fn new(dev: &ash::Device, desc: &SamplerDescription) -> Result<Self> {
        let info = vk::SamplerCreateInfo::builder()
            .address_mode_u(commons::vk_address_mode(desc.address_mode_u))
            .address_mode_v(commons::vk_address_mode(desc.address_mode_v))
            .address_mode_w(commons::vk_address_mode(desc.address_mode_w))
            .mag_filter(commons::vk_filter(desc.mag_filter))
            .min_filter(commons::vk_filter(desc.min_filter))
            .mipmap_mode(commons::vk_mipmap_mode(desc.mip_map_mode))
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(desc.max_anisotropy > 0.0)
            .max_anisotropy(desc.max_anisotropy)
            .compare_enable(desc.compare_op != CompareOp::Never)
            .compare_op(commons::vk_compare_op(desc.compare_op))
            .border_color(commons::vk_border_color(desc.border_color))
            .unnormalized_coordinates(false);

        let sampler = unsafe {
            dev.create_sampler(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create sampler: {:?}", e);
                StratusError::FAILED
            })?
        };

        Ok(Self {
            id: next_sampler_id(),
            sampler,
            desc_hash: desc.hash_id(),
        })
    }

    pub fn release(&mut self, dev: &ash::Device) {
        if self.sampler != vk::Sampler::null() {
            unsafe { dev.destroy_sampler(self.sampler, None) };
            self.sampler = vk::Sampler::null();
        }
    }
}
