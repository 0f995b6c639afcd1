// The Vulkan backend
//
// Everything under this module is driver-facing and unsafe-heavy.
// Nothing vulkan/ash shaped leaks to the public API in lib.rs.

pub mod adapter;
pub mod allocator;
pub mod commons;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod queue;
pub mod renderpass;
pub mod resource;
pub mod shader;
pub mod swapchain;
pub mod views;

pub use adapter::VulkanAdapter;
pub use context::{ShaderProgramBinder, VulkanContext};
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use swapchain::VulkanSwapchain;
