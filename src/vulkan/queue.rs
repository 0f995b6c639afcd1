// Device queues
//
// A queue pairs a (family, index) slot with a submission fence, a
// one-time-only fence, and a small internal command pool for one-shot
// transfers. Several logical queues may wrap the same native queue
// when a family runs out of slots.

use ash::vk;

use std::sync::Mutex;

use crate::types::ResourceState;
use crate::vulkan::resource::{ResourceKind, VulkanResource};
use crate::{Result, StratusError};

/// One queue family the device was created with.
#[derive(Clone, Debug)]
pub struct QueueFamily {
    pub family_index: u32,
    pub max_queue_count: u32,
    pub current_available_queue_index: u32,
    pub flags: vk::QueueFlags,
    pub supports_present: bool,
}

struct OneShot {
    pool: vk::CommandPool,
    fence: vk::Fence,
}

pub struct VulkanQueue {
    pub(crate) queue: vk::Queue,
    pub(crate) family_index: u32,
    pub(crate) queue_index: u32,
    pub(crate) flags: vk::QueueFlags,
    fence: vk::Fence,
    // One-shot submissions serialize here so resource creation can
    // transition images from any thread.
    one_shot: Mutex<OneShot>,
}

impl VulkanQueue {
    pub fn new(
        dev: &ash::Device,
        family_index: u32,
        queue_index: u32,
        flags: vk::QueueFlags,
    ) -> Result<Self> {
        let queue = unsafe { dev.get_device_queue(family_index, queue_index) };

        let fence_info = vk::FenceCreateInfo::builder().build();
        let fence = unsafe {
            dev.create_fence(&fence_info, None)
                .map_err(|_| StratusError::FAILED)?
        };
        let one_time_fence = unsafe {
            dev.create_fence(&fence_info, None).map_err(|e| {
                dev.destroy_fence(fence, None);
                log::error!("[VK] Failed to create one-shot fence: {:?}", e);
                StratusError::FAILED
            })?
        };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family_index);
        let pool = unsafe {
            dev.create_command_pool(&pool_info, None).map_err(|e| {
                dev.destroy_fence(fence, None);
                dev.destroy_fence(one_time_fence, None);
                log::error!("[VK] Failed to create one-shot command pool: {:?}", e);
                StratusError::FAILED
            })?
        };

        Ok(Self {
            queue,
            family_index,
            queue_index,
            flags,
            fence,
            one_shot: Mutex::new(OneShot {
                pool,
                fence: one_time_fence,
            }),
        })
    }

    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    pub fn family(&self) -> (u32, u32) {
        (self.family_index, self.queue_index)
    }

    pub fn flags(&self) -> vk::QueueFlags {
        self.flags
    }

    pub fn submission_fence(&self) -> vk::Fence {
        self.fence
    }

    pub fn wait(&self, dev: &ash::Device) {
        if let Err(e) = unsafe { dev.queue_wait_idle(self.queue) } {
            log::warn!("[VK] Failed to wait for queue idle: {:?}", e);
        }
    }

    /// Record and synchronously submit a burst of commands. The
    /// closure fills the command buffer; this call blocks until the
    /// GPU has executed it.
    pub fn submit_one_shot<F>(&self, dev: &ash::Device, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let one_shot = self.one_shot.lock().unwrap();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(one_shot.pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        let cbuf = unsafe {
            dev.allocate_command_buffers(&alloc_info)
                .map_err(|_| StratusError::FAILED)?[0]
        };

        let begin = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            dev.begin_command_buffer(cbuf, &begin)
                .map_err(|_| StratusError::FAILED)?;
            record(cbuf);
            dev.end_command_buffer(cbuf)
                .map_err(|_| StratusError::FAILED)?;

            let cbufs = [cbuf];
            let submit = vk::SubmitInfo::builder().command_buffers(&cbufs).build();
            dev.queue_submit(self.queue, &[submit], one_shot.fence)
                .map_err(|e| {
                    log::error!("[VK] One-shot submit failed: {:?}", e);
                    StratusError::FAILED
                })?;

            dev.wait_for_fences(&[one_shot.fence], true, u64::MAX)
                .map_err(|_| StratusError::FAILED)?;
            dev.reset_fences(&[one_shot.fence])
                .map_err(|_| StratusError::FAILED)?;
            dev.free_command_buffers(one_shot.pool, &cbufs);
        }

        Ok(())
    }

    pub fn release(&self, dev: &ash::Device) {
        self.wait(dev);
        let one_shot = self.one_shot.lock().unwrap();
        unsafe {
            dev.destroy_command_pool(one_shot.pool, None);
            dev.destroy_fence(one_shot.fence, None);
            dev.destroy_fence(self.fence, None);
        }
    }
}

/// Record copy commands between two resources, honoring their tracked
/// states. Both must already be in the copy states; callers assert.
pub fn generate_copy_resource(
    dev: &ash::Device,
    cbuf: vk::CommandBuffer,
    dst: &VulkanResource,
    src: &VulkanResource,
) -> Result<()> {
    assert!(
        dst.is_in_state(ResourceState::CopyDestination),
        "copy destination resource must be in the CopyDestination state"
    );
    assert!(
        src.is_in_state(ResourceState::CopySource),
        "copy source resource must be in the CopySource state"
    );

    match (&dst.kind, &src.kind) {
        (ResourceKind::Buffer { buffer: dst_buf }, ResourceKind::Buffer { buffer: src_buf }) => {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: src.memory.size_bytes.min(dst.memory.size_bytes),
            };
            unsafe { dev.cmd_copy_buffer(cbuf, *src_buf, *dst_buf, &[region]) };
        }
        (ResourceKind::Buffer { buffer: dst_buf }, ResourceKind::Image { image, layout, .. }) => {
            let sub = src.make_subresource_range(src.state, 0, 1, 0, 0);
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: sub.aspect_mask,
                    mip_level: sub.base_mip_level,
                    base_array_layer: sub.base_array_layer,
                    layer_count: sub.layer_count,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: src.desc.width as u32,
                    height: src.desc.height,
                    depth: 1,
                },
            };
            unsafe {
                dev.cmd_copy_image_to_buffer(cbuf, *image, *layout, *dst_buf, &[region]);
            }
        }
        (ResourceKind::Image { image, layout, .. }, ResourceKind::Buffer { buffer: src_buf }) => {
            let sub = dst.make_subresource_range(dst.state, 0, 1, 0, 0);
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: sub.aspect_mask,
                    mip_level: sub.base_mip_level,
                    base_array_layer: sub.base_array_layer,
                    layer_count: sub.layer_count,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: dst.desc.width as u32,
                    height: dst.desc.height,
                    depth: 1,
                },
            };
            unsafe {
                dev.cmd_copy_buffer_to_image(cbuf, *src_buf, *image, *layout, &[region]);
            }
        }
        (
            ResourceKind::Image {
                image: dst_image,
                layout: dst_layout,
                ..
            },
            ResourceKind::Image {
                image: src_image,
                layout: src_layout,
                ..
            },
        ) => {
            let src_sub = src.make_subresource_range(src.state, 0, 1, 0, 0);
            let dst_sub = dst.make_subresource_range(dst.state, 0, 1, 0, 0);
            let region = vk::ImageCopy {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: src_sub.aspect_mask,
                    mip_level: src_sub.base_mip_level,
                    base_array_layer: src_sub.base_array_layer,
                    layer_count: src_sub.layer_count,
                },
                src_offset: vk::Offset3D::default(),
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: dst_sub.aspect_mask,
                    mip_level: dst_sub.base_mip_level,
                    base_array_layer: dst_sub.base_array_layer,
                    layer_count: dst_sub.layer_count,
                },
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width: (src.desc.width as u32).min(dst.desc.width as u32),
                    height: src.desc.height.min(dst.desc.height),
                    depth: src
                        .desc
                        .depth_or_array_size
                        .min(dst.desc.depth_or_array_size),
                },
            };
            unsafe {
                dev.cmd_copy_image(
                    cbuf,
                    *src_image,
                    *src_layout,
                    *dst_image,
                    *dst_layout,
                    &[region],
                );
            }
        }
    }

    Ok(())
}
