// Vulkan instance
//
// Holds the entry loader, the created instance, and the set of layer
// flags that were actually granted after probing the installed driver.

use ash::extensions::ext;
use ash::extensions::khr;
use ash::{vk, Entry};

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use crate::types::{AppInfo, LayerFlags};
use crate::{Result, StratusError};

// Prints any messages the validation layers hand us, prefixed with
// the vulkan channel so they are easy to grep out of app logs.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {:?}", message_types, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {:?}", message_types, message);
    } else {
        log::debug!("[VK][{:?}] {:?}", message_types, message);
    }
    vk::FALSE
}

fn filter_supported_layers(entry: &Entry, wanted: Vec<CString>) -> Vec<CString> {
    let available = entry
        .enumerate_instance_layer_properties()
        .unwrap_or_default();

    wanted
        .into_iter()
        .filter(|want| {
            let found = available.iter().any(|props| {
                let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
                name == want.as_c_str()
            });
            if !found {
                log::warn!("[VK] Layer {:?} not present, dropping", want);
            }
            found
        })
        .collect()
}

fn filter_supported_extensions(entry: &Entry, wanted: Vec<&'static CStr>) -> Vec<&'static CStr> {
    let available = entry
        .enumerate_instance_extension_properties(None)
        .unwrap_or_default();

    wanted
        .into_iter()
        .filter(|want| {
            let found = available.iter().any(|props| {
                let name = unsafe { CStr::from_ptr(props.extension_name.as_ptr()) };
                name == *want
            });
            if !found {
                log::warn!("[VK] Extension {:?} not present, dropping", want);
            }
            found
        })
        .collect()
}

/// A loaded Vulkan driver session. Created once, destroyed last.
pub struct VulkanInstance {
    /// The entry just loads function pointers from the dynamic
    /// library.
    pub(crate) entry: Entry,
    pub(crate) inst: ash::Instance,
    pub(crate) surface_loader: khr::Surface,

    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// Layer flags that survived the driver probe.
    granted: LayerFlags,
    app_name: String,
    engine_name: String,
}

impl VulkanInstance {
    /// Load the driver and create the native instance with the
    /// requested layers and extensions, dropping anything the
    /// installed driver does not carry.
    pub fn new(app: &AppInfo, flags: LayerFlags) -> Result<Self> {
        let entry = Entry::linked();

        let mut wanted_layers = Vec::new();
        if flags.intersects(LayerFlags::DEBUG_VALIDATION | LayerFlags::GPU_DEBUG_VALIDATION) {
            wanted_layers.push(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        }
        if flags.contains(LayerFlags::API_DUMP) {
            wanted_layers.push(CString::new("VK_LAYER_LUNARG_api_dump").unwrap());
        }
        let layers = filter_supported_layers(&entry, wanted_layers);

        let mut wanted_extensions: Vec<&'static CStr> = vec![
            khr::Surface::name(),
            #[cfg(target_os = "linux")]
            khr::XlibSurface::name(),
            #[cfg(target_os = "linux")]
            khr::WaylandSurface::name(),
            #[cfg(target_os = "windows")]
            khr::Win32Surface::name(),
            vk::KhrGetPhysicalDeviceProperties2Fn::name(),
        ];
        if flags.intersects(
            LayerFlags::DEBUG_VALIDATION
                | LayerFlags::GPU_DEBUG_VALIDATION
                | LayerFlags::DEBUG_MARKING,
        ) {
            wanted_extensions.push(ext::DebugUtils::name());
        }
        let extensions = filter_supported_extensions(&entry, wanted_extensions);

        // Track what actually made it through the probe.
        let mut granted = flags;
        let debug_available = extensions.contains(&ext::DebugUtils::name());
        let validation_available = layers
            .iter()
            .any(|l| l.as_c_str().to_bytes() == b"VK_LAYER_KHRONOS_validation");
        if !validation_available {
            granted.remove(LayerFlags::DEBUG_VALIDATION | LayerFlags::GPU_DEBUG_VALIDATION);
        }
        if !debug_available {
            granted.remove(LayerFlags::DEBUG_MARKING);
        }

        let layer_ptrs: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();
        let ext_ptrs: Vec<*const i8> = extensions.iter().map(|e| e.as_ptr()).collect();

        let app_name = CString::new(app.app_name.as_str()).unwrap();
        let engine_name = CString::new(app.engine_name.as_str()).unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(app.app_version)
            .engine_name(&engine_name)
            .engine_version(app.engine_version)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&ext_ptrs);

        // GPU assisted validation rides on the validation layer's
        // feature toggles.
        let gpu_features = [vk::ValidationFeatureEnableEXT::GPU_ASSISTED];
        let mut validation_features =
            vk::ValidationFeaturesEXT::builder().enabled_validation_features(&gpu_features);
        if granted.contains(LayerFlags::GPU_DEBUG_VALIDATION) {
            create_info = create_info.push_next(&mut validation_features);
        }

        let inst = unsafe {
            entry.create_instance(&create_info, None).map_err(|e| {
                log::error!("[VK] Failed to create instance: {:?}", e);
                StratusError::FAILED
            })?
        };

        let debug = if debug_available {
            let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));

            let loader = ext::DebugUtils::new(&entry, &inst);
            match unsafe { loader.create_debug_utils_messenger(&debug_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    log::warn!("[VK] Could not install debug messenger: {:?}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = khr::Surface::new(&entry, &inst);

        log::debug!(
            "[VK] Instance up for {} / {} (granted {:?})",
            app.app_name,
            app.engine_name,
            granted
        );

        Ok(Self {
            entry,
            inst,
            surface_loader,
            debug,
            granted,
            app_name: app.app_name.clone(),
            engine_name: app.engine_name.clone(),
        })
    }

    pub fn granted_layers(&self) -> LayerFlags {
        self.granted
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    pub fn supports_debug_marking(&self) -> bool {
        self.granted.contains(LayerFlags::DEBUG_MARKING) && self.debug.is_some()
    }

    pub(crate) fn debug_utils(&self) -> Option<&ext::DebugUtils> {
        self.debug.as_ref().map(|(loader, _)| loader)
    }

    /// Enumerate physical devices on this instance.
    pub fn enumerate_physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        unsafe {
            self.inst
                .enumerate_physical_devices()
                .map_err(|_| StratusError::FAILED)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
