// Physical device adapter
//
// A read-only descriptor of one physical device, with its properties
// cached at discovery time. Capability queries for surfaces go through
// the instance's surface loader.

use ash::vk;

use std::ffi::CStr;
use std::sync::Arc;

use crate::types::ResourceMemoryUsage;
use crate::vulkan::commons::memory_properties_for_usage;
use crate::vulkan::instance::VulkanInstance;
use crate::{Result, StratusError};

/// Walk the memory type table for a type accepted by `type_bits`,
/// preferring types that carry both the required and preferred flags
/// for the usage class, falling back to required only.
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    usage: ResourceMemoryUsage,
) -> Result<u32> {
    let (required, preferred) = memory_properties_for_usage(usage);

    let candidates = || {
        props.memory_types[..props.memory_type_count as usize]
            .iter()
            .enumerate()
            .filter(|(i, _)| (type_bits >> i) & 1 == 1)
    };

    for (i, mem_type) in candidates() {
        if mem_type.property_flags.contains(required | preferred) {
            return Ok(i as u32);
        }
    }
    for (i, mem_type) in candidates() {
        if mem_type.property_flags.contains(required) {
            return Ok(i as u32);
        }
    }

    log::error!(
        "[VK] No memory type matches filter {:#x} for usage {:?}",
        type_bits,
        usage
    );
    Err(StratusError::NOT_FOUND)
}

/// One enumerated physical device with its discovery-time properties.
pub struct VulkanAdapter {
    pub(crate) inst: Arc<VulkanInstance>,
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) queue_families: Vec<vk::QueueFamilyProperties>,
    extensions: Vec<vk::ExtensionProperties>,
}

impl VulkanAdapter {
    pub fn enumerate(inst: &Arc<VulkanInstance>) -> Result<Vec<VulkanAdapter>> {
        let pdevs = inst.enumerate_physical_devices()?;
        Ok(pdevs
            .into_iter()
            .map(|pdev| {
                let properties = unsafe { inst.inst.get_physical_device_properties(pdev) };
                let mem_props =
                    unsafe { inst.inst.get_physical_device_memory_properties(pdev) };
                let queue_families = unsafe {
                    inst.inst
                        .get_physical_device_queue_family_properties(pdev)
                };
                let extensions = unsafe {
                    inst.inst
                        .enumerate_device_extension_properties(pdev)
                        .unwrap_or_default()
                };

                VulkanAdapter {
                    inst: inst.clone(),
                    pdev,
                    properties,
                    mem_props,
                    queue_families,
                    extensions,
                }
            })
            .collect())
    }

    pub fn name(&self) -> String {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        }
    }

    pub fn vendor_id(&self) -> u32 {
        self.properties.vendor_id
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.mem_props
    }

    pub fn queue_family_properties(&self) -> &[vk::QueueFamilyProperties] {
        &self.queue_families
    }

    /// Whether the device advertises the named extension.
    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|props| {
            let ext = unsafe { CStr::from_ptr(props.extension_name.as_ptr()) };
            ext == name
        })
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.inst
                .inst
                .get_physical_device_format_properties(self.pdev, format)
        }
    }

    pub fn find_memory_type(&self, type_bits: u32, usage: ResourceMemoryUsage) -> Result<u32> {
        find_memory_type(&self.mem_props, type_bits, usage)
    }

    pub fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.inst
                .surface_loader
                .get_physical_device_surface_capabilities(self.pdev, surface)
                .map_err(|_| StratusError::FAILED)
        }
    }

    pub fn surface_formats(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.inst
                .surface_loader
                .get_physical_device_surface_formats(self.pdev, surface)
                .map_err(|_| StratusError::FAILED)
        }
    }

    pub fn surface_present_modes(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.inst
                .surface_loader
                .get_physical_device_surface_present_modes(self.pdev, surface)
                .map_err(|_| StratusError::FAILED)
        }
    }

    pub fn supports_surface(&self, family_index: u32, surface: vk::SurfaceKHR) -> bool {
        unsafe {
            self.inst
                .surface_loader
                .get_physical_device_surface_support(self.pdev, family_index, surface)
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props_with(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    #[test]
    fn prefers_required_plus_preferred() {
        let props = props_with(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        // CpuOnly prefers HOST_CACHED on top of HOST_VISIBLE.
        let idx = find_memory_type(&props, 0b11, ResourceMemoryUsage::CpuOnly).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn falls_back_to_required_only() {
        let props = props_with(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        let idx = find_memory_type(&props, 0b11, ResourceMemoryUsage::CpuToGpu).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn honors_the_type_filter() {
        let props = props_with(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let idx = find_memory_type(&props, 0b10, ResourceMemoryUsage::GpuOnly).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn missing_type_is_an_error() {
        let props = props_with(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(find_memory_type(&props, 0b1, ResourceMemoryUsage::CpuOnly).is_err());
    }
}
