// Synchronization primitives
//
// Fences for GPU->CPU completion, semaphores for GPU->GPU ordering, and the
// description of one queue submission tying them together.

use std::time::Duration;

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// A semaphore plus the pipeline stage it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreStage {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

/// One batch submitted to the graphics queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// `None` submits an empty batch that only waits and signals.
    pub command_buffer: Option<vk::CommandBuffer>,
    pub wait: Option<SemaphoreStage>,
    pub signal: Option<SemaphoreStage>,
    /// Signaled when the GPU finishes this batch.
    pub fence: vk::Fence,
}

/// Vulkan timeouts are u64 nanoseconds; anything larger saturates to "forever".
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

pub fn create_fence(device: &ash::Device, signaled: bool) -> RenderResult<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED // Start signaled so the first wait returns
    } else {
        vk::FenceCreateFlags::empty()
    };
    let fence_info = vk::FenceCreateInfo::default().flags(flags);

    unsafe { device.create_fence(&fence_info, None) }.map_err(RenderError::vk("create_fence"))
}

pub fn create_semaphore(device: &ash::Device) -> RenderResult<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();

    unsafe { device.create_semaphore(&semaphore_info, None) }
        .map_err(RenderError::vk("create_semaphore"))
}
