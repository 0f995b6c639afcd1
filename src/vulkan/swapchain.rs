// Swapchain
//
// Owns the native swapchain and its image set, wrapped as ordinary
// image resources so the context can transition and bind them. The
// per-frame semaphores and fences live on the context; acquire and
// present only consume them.

use ash::extensions::khr;
use ash::vk;

use std::sync::Arc;

use crate::types::*;
use crate::vulkan::commons;
use crate::vulkan::context::VulkanContext;
use crate::vulkan::device::VulkanDevice;
use crate::{Result, StratusError};

pub struct VulkanSwapchain {
    dev: Arc<VulkanDevice>,
    loader: khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    desc: SwapchainCreateDescription,

    /// Swapchain images wrapped as resources, one per native image.
    images: Vec<ResourceId>,
    /// The application's frame cursor, distinct from the image index
    /// the presentation engine hands back.
    current_frame_index: u32,
    current_image_index: u32,
}

impl VulkanSwapchain {
    pub fn new(dev: Arc<VulkanDevice>, desc: &SwapchainCreateDescription) -> Result<Self> {
        let loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);
        let mut swapchain = Self {
            dev,
            loader,
            swapchain: vk::SwapchainKHR::null(),
            desc: *desc,
            images: Vec::new(),
            current_frame_index: 0,
            current_image_index: 0,
        };
        swapchain.build(*desc)?;
        Ok(swapchain)
    }

    pub fn description(&self) -> &SwapchainCreateDescription {
        &self.desc
    }

    pub(crate) fn device(&self) -> &Arc<VulkanDevice> {
        &self.dev
    }

    pub fn current_frame_index(&self) -> u32 {
        self.current_frame_index
    }

    pub fn current_image_index(&self) -> u32 {
        self.current_image_index
    }

    /// The wrapped image resource at `idx`.
    pub fn frame(&self, idx: u32) -> Option<ResourceId> {
        self.images.get(idx as usize).copied()
    }

    pub fn frame_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Create (or re-create) the native swapchain from the requested
    /// description, clamped into what the surface supports. A
    /// minimized window (zero extent) fails without touching the old
    /// swapchain; callers retry later.
    fn build(&mut self, mut desc: SwapchainCreateDescription) -> Result<()> {
        let surface = self.dev.surface.ok_or_else(|| {
            log::error!("[VK] Device has no surface, cannot build a swapchain");
            StratusError::INVALID_ARGS
        })?;

        let caps = unsafe {
            self.dev
                .inst
                .surface_loader
                .get_physical_device_surface_capabilities(self.dev.pdev, surface)
                .map_err(|_| StratusError::FAILED)?
        };

        // Clamp the requested image count and extent into the
        // surface's limits.
        let mut image_count = desc.desired_frames.max(caps.min_image_count);
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: desc
                    .render_width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: desc
                    .render_height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };
        if extent.width == 0 || extent.height == 0 {
            log::warn!("[VK] Surface reports a zero extent, refusing to build swapchain");
            return Err(StratusError::FAILED);
        }

        // Requested format if the surface carries it, first supported
        // otherwise.
        let formats = unsafe {
            self.dev
                .inst
                .surface_loader
                .get_physical_device_surface_formats(self.dev.pdev, surface)
                .map_err(|_| StratusError::FAILED)?
        };
        if formats.is_empty() {
            return Err(StratusError::FAILED);
        }
        let wanted = commons::vk_format(desc.format);
        let surface_format = formats
            .iter()
            .find(|f| f.format == wanted)
            .copied()
            .unwrap_or_else(|| {
                log::warn!(
                    "[VK] Surface does not support {:?}, using {:?}",
                    desc.format,
                    formats[0].format
                );
                formats[0]
            });

        // Buffering picks the present mode, falling back to whatever
        // the surface actually offers.
        let modes = unsafe {
            self.dev
                .inst
                .surface_loader
                .get_physical_device_surface_present_modes(self.dev.pdev, surface)
                .map_err(|_| StratusError::FAILED)?
        };
        let wanted_mode = match desc.buffering {
            FrameBuffering::Single => vk::PresentModeKHR::IMMEDIATE,
            FrameBuffering::Double => vk::PresentModeKHR::FIFO,
            FrameBuffering::Triple => vk::PresentModeKHR::MAILBOX,
        };
        let present_mode = if modes.contains(&wanted_mode) {
            wanted_mode
        } else {
            log::warn!(
                "[VK] Present mode {:?} unavailable, using {:?}",
                wanted_mode,
                modes.first().copied().unwrap_or(vk::PresentModeKHR::FIFO)
            );
            modes.first().copied().unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);

        let new_swapchain = unsafe {
            self.loader.create_swapchain(&info, None).map_err(|e| {
                log::error!("[VK] Failed to create swapchain: {:?}", e);
                StratusError::FAILED
            })?
        };

        // The old swapchain (if any) was passed as old_swapchain and
        // can be destroyed now, along with the wrappers around its
        // images. The native images belong to the swapchain.
        self.release_image_wrappers();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = new_swapchain;

        let native_images = unsafe {
            self.loader
                .get_swapchain_images(self.swapchain)
                .map_err(|_| StratusError::FAILED)?
        };

        desc.render_width = extent.width;
        desc.render_height = extent.height;
        let wrapped_format = commons::resource_format_from_vk(surface_format.format);
        for image in native_images.iter() {
            let image_desc = GraphicsResourceDescription {
                name: None,
                dimension: ResourceDimension::Dim2d,
                width: extent.width as u64,
                height: extent.height,
                depth_or_array_size: 1,
                mip_levels: 1,
                samples: 1,
                format: wrapped_format,
                usage: ResourceUsage::RENDER_TARGET | ResourceUsage::COPY_DESTINATION,
                memory_usage: ResourceMemoryUsage::GpuOnly,
            };
            self.images
                .push(self.dev.register_swapchain_image(*image, &image_desc));
        }

        self.desc = desc;
        self.current_image_index = 0;

        log::debug!(
            "[VK] Swapchain built: {}x{} x{} images, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode
        );

        Ok(())
    }

    fn release_image_wrappers(&mut self) {
        for id in self.images.drain(..) {
            // Wrapper teardown only releases the views; swapchain
            // images have no backing allocation of their own.
            if let Err(e) = self.dev.destroy_resource(id, true) {
                log::warn!("[VK] Failed to release swapchain image wrapper: {:?}", e);
            }
        }
    }

    /// Begin the context's next frame and acquire the image to render
    /// into. Returns `NEEDS_UPDATE` when the surface has gone out of
    /// date and the caller must rebuild.
    pub fn prepare(&mut self, context: &mut VulkanContext) -> Result<()> {
        context.begin()?;

        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                context.current_wait_semaphore(),
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                self.current_image_index = index;
                context.arm_wait_semaphore();
                if suboptimal {
                    log::debug!("[VK] Swapchain suboptimal at acquire");
                }
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(StratusError::NEEDS_UPDATE),
            Err(e) => {
                log::error!("[VK] Failed to acquire next swapchain image: {:?}", e);
                Err(StratusError::FAILED)
            }
        }
    }

    /// Present the acquired image, waiting on the context's render
    /// completion semaphore. `NEEDS_UPDATE` demands a rebuild.
    pub fn present(&mut self, context: &mut VulkanContext, config: PresentConfig) -> Result<()> {
        if config.contains(PresentConfig::DELAY_PRESENT) {
            // Legacy path, intentionally unsupported.
            return Err(StratusError::NO_IMPL);
        }

        // Mapped writes from this frame become visible before the
        // image goes out the door.
        self.dev.flush_all_mapped_ranges();
        self.dev.invalidate_all_mapped_ranges();

        let mut result = Ok(());
        if !config.contains(PresentConfig::SKIP_PRESENT) {
            if let Some(id) = self.frame(self.current_image_index) {
                let resources = self.dev.resources.read().unwrap();
                if let Some(res) = resources.get(&id) {
                    if !res.is_in_state(ResourceState::Present) {
                        log::warn!(
                            "[VK] Presenting image {} while not in the Present state",
                            self.current_image_index
                        );
                    }
                }
            }

            let wait_semas = [context.current_signal_semaphore()];
            let swapchains = [self.swapchain];
            let indices = [self.current_image_index];
            let info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&wait_semas)
                .swapchains(&swapchains)
                .image_indices(&indices);

            result = match unsafe {
                self.loader
                    .queue_present(self.dev.backbuffer_queue().handle(), &info)
            } {
                Ok(false) => Ok(()),
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    Err(StratusError::NEEDS_UPDATE)
                }
                Err(e) => {
                    log::error!("[VK] Present failed: {:?}", e);
                    Err(StratusError::FAILED)
                }
            };
        }

        self.current_frame_index = (self.current_frame_index + 1) % self.frame_count().max(1);
        result
    }

    /// Tear down and rebuild after a resize. The caller is expected
    /// to have waited on the context. Fails without destroying the
    /// old swapchain when the surface reports a zero extent.
    pub fn rebuild(&mut self, desc: &SwapchainCreateDescription) -> Result<()> {
        self.dev.backbuffer_queue().wait(&self.dev.dev);
        self.build(*desc)?;
        self.current_frame_index = 0;
        Ok(())
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        self.dev.wait_idle();
        self.release_image_wrappers();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
    }
}
