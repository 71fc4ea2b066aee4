// Frame core - GPU frame and resource lifecycle on Vulkan
//
// `GpuContext` owns the swapchain and every pooled GPU object, and drives
// acquire -> record -> submit -> present with N frames in flight.

pub mod backend;
pub mod config;
pub mod context;
pub mod deletion_queue;
pub mod descriptor;
pub mod rebuild;

#[cfg(test)]
mod testing;

pub use backend::{DeviceRequirements, GpuDevice, QueueKind, SurfaceWindow, Swapchain, VulkanDevice};
pub use config::Config;
pub use context::{FrameSettings, FrameState, FrameStats, GpuContext, Submission};
pub use deletion_queue::DeletionQueue;
