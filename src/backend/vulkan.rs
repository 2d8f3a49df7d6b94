// Gpu implementation for the real Vulkan device

use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::memory::{AllocatedBuffer, AllocatedImage, ImageDesc};
use super::swapchain::{SwapchainParts, SwapchainRequest};
use super::sync::{self, timeout_nanos, Submission};
use super::{AcquireOutcome, Gpu, PresentOutcome, VulkanDevice};
use crate::deletion::Release;
use crate::error::{RenderError, RenderResult};

impl Gpu for VulkanDevice {
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        sync::create_fence(&self.device, signaled)
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        sync::create_semaphore(&self.device)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RenderResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, timeout_nanos(timeout))
        }
        .map_err(|result| match result {
            vk::Result::TIMEOUT => RenderError::Timeout { what: "fence" },
            result => RenderError::from_vk("wait_for_fences", result),
        })
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.map_err(RenderError::vk("reset_fences"))
    }

    fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(RenderError::vk("device_wait_idle"))
    }

    fn create_command_context(&self) -> RenderResult<(vk::CommandPool, vk::CommandBuffer)> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.graphics_queue_family)
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(RenderError::vk("create_command_pool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) if !buffers.is_empty() => Ok((pool, buffers[0])),
            Ok(_) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                Err(RenderError::from_vk(
                    "allocate_command_buffers",
                    vk::Result::ERROR_UNKNOWN,
                ))
            }
            Err(result) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                Err(RenderError::from_vk("allocate_command_buffers", result))
            }
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(RenderError::vk("reset_command_buffer"))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(RenderError::vk("begin_command_buffer"))
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(RenderError::vk("end_command_buffer"))
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) {
        let aspect_mask = if to == vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        // Coarse full-pipeline barrier. Few transitions per frame, so it's fine.
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
            .old_layout(from)
            .new_layout(to)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });

        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    ) {
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let far_corner = |extent: vk::Extent2D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };

        let region = vk::ImageBlit2::default()
            .src_offsets([vk::Offset3D::default(), far_corner(src_extent)])
            .dst_offsets([vk::Offset3D::default(), far_corner(dst_extent)])
            .src_subresource(layers)
            .dst_subresource(layers);

        let blit_info = vk::BlitImageInfo2::default()
            .src_image(src)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(dst)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .filter(vk::Filter::LINEAR)
            .regions(std::slice::from_ref(&region));

        unsafe { self.device.cmd_blit_image2(cmd, &blit_info) };
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    }

    fn submit(&self, submission: &Submission) -> RenderResult<()> {
        let command_buffers: Vec<_> = submission
            .command_buffer
            .iter()
            .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
            .collect();
        let semaphore_info = |s: &super::SemaphoreStage| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(s.semaphore)
                .stage_mask(s.stage)
                .value(1)
        };
        let waits: Vec<_> = submission.wait.iter().map(semaphore_info).collect();
        let signals: Vec<_> = submission.signal.iter().map(semaphore_info).collect();

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffers)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);

        unsafe {
            self.device
                .queue_submit2(self.graphics_queue, &[submit_info], submission.fence)
        }
        .map_err(RenderError::vk("queue_submit2"))
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<AllocatedImage> {
        self.allocate_image(desc)
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RenderResult<AllocatedBuffer> {
        self.allocate_buffer(size, usage, location)
    }

    fn write_buffer(&self, buffer: &mut AllocatedBuffer, bytes: &[u8]) -> RenderResult<()> {
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or(RenderError::NotHostVisible)?;

        if bytes.len() > mapped.len() {
            return Err(RenderError::BufferTooSmall {
                needed: bytes.len() as u64,
                size: buffer.size,
            });
        }
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> RenderResult<SwapchainParts> {
        self.build_swapchain(request)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_nanos(timeout),
                signal,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Ready(index)),
            Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                Err(RenderError::Timeout {
                    what: "swapchain image",
                })
            }
            Err(result) => Err(RenderError::from_vk("acquire_next_image", result)),
        }
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let swapchains = [swapchain];
        let image_indices = [index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.graphics_queue, &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(result) => Err(RenderError::from_vk("queue_present", result)),
        }
    }

    fn release(&self, release: Release) {
        let device = &self.device;
        unsafe {
            match release {
                Release::Image(image) => {
                    device.destroy_image_view(image.view, None);
                    if let Some(allocation) = image.allocation {
                        self.free_allocation(allocation);
                    }
                    device.destroy_image(image.image, None);
                }
                Release::Buffer(buffer) => {
                    if let Some(allocation) = buffer.allocation {
                        self.free_allocation(allocation);
                    }
                    device.destroy_buffer(buffer.buffer, None);
                }
                Release::ImageView(view) => device.destroy_image_view(view, None),
                Release::Fence(fence) => device.destroy_fence(fence, None),
                Release::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
                Release::CommandPool(pool) => device.destroy_command_pool(pool, None),
                Release::Swapchain(swapchain) => {
                    self.swapchain_loader.destroy_swapchain(swapchain, None)
                }
            }
        }
    }
}
