// Backend module - the GPU seam
//
// Design: the frame core never calls ash directly. It talks to a `Gpu`, which
// is implemented by `VulkanDevice` for real and by an in-memory fake in tests.
// Handles are plain `vk::*` values either way.

pub mod device;
pub mod memory;
pub mod swapchain;
pub mod sync;
mod vulkan;

use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::deletion::Release;
use crate::error::RenderResult;

pub use device::VulkanDevice;
pub use memory::{AllocatedBuffer, AllocatedImage, ImageDesc, TargetView};
pub use swapchain::{SwapchainParts, SwapchainRequest};
pub use sync::{SemaphoreStage, Submission};

/// Result of asking the presentation engine for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// An image was acquired and the semaphore will be signaled, but the
    /// chain no longer matches the surface. Treated as stale; the pending
    /// signal still has to be waited on before the semaphore is reused.
    Suboptimal(u32),
    /// Out of date. Nothing was acquired and the semaphore is untouched.
    Stale,
}

impl AcquireOutcome {
    /// The chain must be rebuilt before the next frame.
    pub fn is_stale(self) -> bool {
        !matches!(self, AcquireOutcome::Ready(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Stale,
}

/// Device, queue, allocator and presentation operations used by the frame core.
///
/// All queue work goes to the single graphics queue chosen at bootstrap.
pub trait Gpu {
    // Synchronization
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence>;
    fn create_semaphore(&self) -> RenderResult<vk::Semaphore>;
    /// Block until `fence` signals. Exceeding `timeout` is `RenderError::Timeout`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RenderResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()>;
    fn wait_idle(&self) -> RenderResult<()>;

    // Command recording
    /// A resettable pool with one primary command buffer.
    fn create_command_context(&self) -> RenderResult<(vk::CommandPool, vk::CommandBuffer)>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    /// Begin one-time-submit recording.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    );
    /// Scaled copy of the whole color subresource of `src` into `dst`.
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    );
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    );
    fn submit(&self, submission: &Submission) -> RenderResult<()>;

    // Memory
    fn create_image(&self, desc: &ImageDesc) -> RenderResult<AllocatedImage>;
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RenderResult<AllocatedBuffer>;
    /// Copy `bytes` into a host-visible buffer.
    fn write_buffer(&self, buffer: &mut AllocatedBuffer, bytes: &[u8]) -> RenderResult<()>;

    // Presentation
    fn create_swapchain(&self, request: &SwapchainRequest) -> RenderResult<SwapchainParts>;
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome>;
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome>;

    /// Destroy one resource. The caller guarantees the GPU is done with it.
    fn release(&self, release: Release);
}
