// Buffer and image resources
//
// A resource owns its native handle, its backing memory block, and
// the single tracked fact about how the GPU will next touch it (the
// resource state). Transitions are recorded as barriers by the
// context; the tracked state updates at record time so later asserts
// in the same command stream see the post-transition state.

use ash::vk;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::*;
use crate::vulkan::allocator::VulkanMemory;
use crate::vulkan::commons;
use crate::{Result, StratusError};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_resource_id() -> ResourceId {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

pub enum ResourceKind {
    Buffer {
        buffer: vk::Buffer,
    },
    Image {
        image: vk::Image,
        layout: vk::ImageLayout,
        tiling: vk::ImageTiling,
        /// Swapchain images are owned by the presentation engine;
        /// destroy must leave the native handle alone.
        swapchain_owned: bool,
    },
}

pub struct VulkanResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub memory: VulkanMemory,
    pub state: ResourceState,
    pub access_mask: vk::AccessFlags,
    pub alignment: u64,
    pub desc: GraphicsResourceDescription,
    /// Views previously materialized from this resource, keyed by
    /// description hash.
    pub views: HashMap<u64, ResourceViewId>,
}

impl VulkanResource {
    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, ResourceKind::Buffer { .. })
    }

    pub fn is_in_state(&self, state: ResourceState) -> bool {
        self.state == state
    }

    pub fn buffer_handle(&self) -> Result<vk::Buffer> {
        match &self.kind {
            ResourceKind::Buffer { buffer } => Ok(*buffer),
            _ => Err(StratusError::INVALID_ARGS),
        }
    }

    pub fn image_handle(&self) -> Result<vk::Image> {
        match &self.kind {
            ResourceKind::Image { image, .. } => Ok(*image),
            _ => Err(StratusError::INVALID_ARGS),
        }
    }

    pub fn current_layout(&self) -> vk::ImageLayout {
        match &self.kind {
            ResourceKind::Image { layout, .. } => *layout,
            _ => vk::ImageLayout::UNDEFINED,
        }
    }

    /// Subresource range for a transition into `dst`, clamped to the
    /// resource's real extents when the caller passes zero counts.
    pub fn make_subresource_range(
        &self,
        dst: ResourceState,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> vk::ImageSubresourceRange {
        let aspect = if matches!(
            dst,
            ResourceState::DepthStencilReadOnly | ResourceState::DepthStencilWrite
        ) {
            commons::depth_stencil_aspect(self.desc.format)
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let mips = if mip_count == 0 {
            self.desc.mip_levels
        } else {
            mip_count
        };
        let layers = if layer_count == 0 {
            self.desc.depth_or_array_size
        } else {
            layer_count
        };

        vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: base_mip,
            level_count: mips,
            base_array_layer: base_layer,
            layer_count: layers,
        }
    }

    /// Record-time transition of an image. Returns the barrier to
    /// batch and immediately updates the tracked state.
    pub fn transition_image(
        &mut self,
        dst: ResourceState,
        range: vk::ImageSubresourceRange,
    ) -> Result<vk::ImageMemoryBarrier> {
        let (image, old_layout) = match &self.kind {
            ResourceKind::Image { image, layout, .. } => (*image, *layout),
            _ => return Err(StratusError::INVALID_ARGS),
        };

        let new_layout = commons::image_layout_for_state(dst);
        let dst_access = commons::access_mask_for_state(dst)
            | commons::host_access_for_memory_usage(self.desc.memory_usage);

        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(self.access_mask)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(range)
            .build();

        if let ResourceKind::Image { layout, .. } = &mut self.kind {
            *layout = new_layout;
        }
        self.state = dst;
        self.access_mask = dst_access;

        Ok(barrier)
    }

    /// Record-time transition of a buffer.
    pub fn transition_buffer(&mut self, dst: ResourceState) -> Result<vk::BufferMemoryBarrier> {
        let buffer = self.buffer_handle()?;

        let dst_access = commons::access_mask_for_state(dst)
            | commons::host_access_for_memory_usage(self.desc.memory_usage);

        // Offset zero: the barrier range is relative to the buffer
        // binding, not the backing heap.
        let barrier = vk::BufferMemoryBarrier::builder()
            .buffer(buffer)
            .offset(0)
            .size(self.memory.size_bytes)
            .src_access_mask(self.access_mask)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .build();

        self.state = dst;
        self.access_mask = dst_access;

        Ok(barrier)
    }

    /// Pointer into the persistently mapped page backing this
    /// resource. Buffers on host-visible memory only.
    pub fn map_ptr(&self, range: Option<&MapRange>) -> Result<*mut u8> {
        if !self.is_buffer() {
            return Err(StratusError::INVALID_ARGS);
        }
        if self.memory.base_ptr.is_null() {
            log::error!(
                "[VK] Attempted to map resource {} on a GPU only heap",
                self.id
            );
            return Err(StratusError::INVALID_ARGS);
        }

        let mut offset = self.memory.offset_bytes;
        if let Some(range) = range {
            offset += commons::align_up(range.offset_bytes, self.alignment);
        }

        Ok(unsafe { self.memory.base_ptr.add(offset as usize) })
    }

    /// The coherency range a completed write needs flushed or
    /// invalidated, aligned up to the non-coherent atom size.
    pub fn mapped_range(
        &self,
        range: Option<&MapRange>,
        non_coherent_atom_size: u64,
    ) -> (vk::DeviceMemory, u64, u64) {
        let mut offset = self.memory.offset_bytes;
        let mut size = vk::WHOLE_SIZE;
        if let Some(range) = range {
            offset += commons::align_up(range.offset_bytes, self.alignment);
            size = commons::align_up(range.size_bytes, non_coherent_atom_size);
        }
        (self.memory.device_memory, offset, size)
    }
}

/// Create the native buffer for a description. Memory is bound by the
/// caller after allocation.
pub(crate) fn create_buffer(
    dev: &ash::Device,
    desc: &GraphicsResourceDescription,
) -> Result<vk::Buffer> {
    let info = vk::BufferCreateInfo::builder()
        .size(desc.width)
        .usage(commons::vk_buffer_usage(desc.usage))
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .build();

    unsafe {
        dev.create_buffer(&info, None).map_err(|e| {
            log::error!("[VK] Failed to create buffer: {:?}", e);
            StratusError::FAILED
        })
    }
}

/// Create the native image for a description, picking optimal tiling
/// when the format supports the needed features there, linear
/// otherwise.
pub(crate) fn create_image(
    dev: &ash::Device,
    format_props: &vk::FormatProperties,
    desc: &GraphicsResourceDescription,
) -> Result<(vk::Image, vk::ImageTiling)> {
    let format = commons::vk_format(desc.format);
    let needed = commons::vk_format_features(desc.usage);

    let tiling = if format_props.optimal_tiling_features.contains(needed) {
        vk::ImageTiling::OPTIMAL
    } else if format_props.linear_tiling_features.contains(needed) {
        vk::ImageTiling::LINEAR
    } else {
        log::error!(
            "[VK] No tiling scheme supports features {:?} for format {:?}",
            needed,
            desc.format
        );
        return Err(StratusError::INVALID_ARGS);
    };

    let (image_type, depth, layers) = match desc.dimension {
        ResourceDimension::Dim1d => (vk::ImageType::TYPE_1D, 1, desc.depth_or_array_size),
        ResourceDimension::Dim3d => (vk::ImageType::TYPE_3D, desc.depth_or_array_size, 1),
        _ => (vk::ImageType::TYPE_2D, 1, desc.depth_or_array_size),
    };

    let info = vk::ImageCreateInfo::builder()
        .image_type(image_type)
        .format(format)
        .extent(vk::Extent3D {
            width: desc.width as u32,
            height: desc.height,
            depth,
        })
        .mip_levels(desc.mip_levels)
        .array_layers(layers)
        .samples(commons::vk_sample_count(desc.samples))
        .tiling(tiling)
        .usage(commons::vk_image_usage(desc.usage))
        // Spec requires UNDEFINED or PREINITIALIZED here; the initial
        // state transition happens right after memory bind.
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .build();

    let image = unsafe {
        dev.create_image(&info, None).map_err(|e| {
            log::error!("[VK] Failed to create image: {:?}", e);
            StratusError::FAILED
        })?
    };

    Ok((image, tiling))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_resource(format: ResourceFormat) -> VulkanResource {
        VulkanResource {
            id: next_resource_id(),
            kind: ResourceKind::Image {
                image: vk::Image::null(),
                layout: vk::ImageLayout::UNDEFINED,
                tiling: vk::ImageTiling::OPTIMAL,
                swapchain_owned: false,
            },
            memory: VulkanMemory::null(),
            state: ResourceState::Common,
            access_mask: vk::AccessFlags::empty(),
            alignment: 256,
            desc: GraphicsResourceDescription {
                dimension: ResourceDimension::Dim2d,
                width: 128,
                height: 128,
                mip_levels: 4,
                depth_or_array_size: 2,
                format,
                usage: ResourceUsage::RENDER_TARGET,
                memory_usage: ResourceMemoryUsage::GpuOnly,
                ..Default::default()
            },
            views: HashMap::new(),
        }
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = next_resource_id();
        let b = next_resource_id();
        assert!(b > a);
    }

    #[test]
    fn transition_updates_tracked_state_at_record_time() {
        let mut res = image_resource(ResourceFormat::B8G8R8A8Unorm);
        let range = res.make_subresource_range(ResourceState::RenderTarget, 0, 0, 0, 0);
        let barrier = res.transition_image(ResourceState::RenderTarget, range).unwrap();

        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(res.is_in_state(ResourceState::RenderTarget));
        assert_eq!(res.current_layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn zero_counts_cover_the_whole_image() {
        let res = image_resource(ResourceFormat::B8G8R8A8Unorm);
        let range = res.make_subresource_range(ResourceState::ShaderResource, 0, 0, 0, 0);
        assert_eq!(range.level_count, 4);
        assert_eq!(range.layer_count, 2);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn depth_transition_uses_depth_aspect() {
        let res = image_resource(ResourceFormat::D32Float);
        let range = res.make_subresource_range(ResourceState::DepthStencilWrite, 0, 1, 0, 1);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);

        let res = image_resource(ResourceFormat::D24UnormS8Uint);
        let range = res.make_subresource_range(ResourceState::DepthStencilWrite, 0, 1, 0, 1);
        assert_eq!(
            range.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
