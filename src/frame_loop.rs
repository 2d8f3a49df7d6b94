// Frame loop - drives one frame per tick
//
// FRAME FLOW:
// 1. Poll window events (quit, resize, minimize)
// 2. Recreate the presentation chain if it went stale
// 3. Wait for the current slot's previous frame, recycle it
// 4. Record draw content into the color/depth targets
// 5. Acquire a swapchain image, blit the color target into it
// 6. Submit, present, advance the frame counter
//
// Resizes are only acted on at step 2, never while a frame is being recorded.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::backend::{
    AcquireOutcome, Gpu, PresentOutcome, SemaphoreStage, Submission, TargetView,
};
use crate::chain::PresentationChain;
use crate::deletion::{DeletionQueue, Release};
use crate::error::{RenderError, RenderResult};
use crate::frame::FramePool;
use crate::immediate::ImmediateSubmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// The chain is stale and is rebuilt at the start of the next tick.
    ResizePending,
    /// Zero-area or minimized window; no GPU work until restored.
    Minimized,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Nothing reached the screen this tick.
    Skipped,
}

/// Events collected since the previous poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowEvents {
    pub resized: bool,
    pub quit: bool,
}

/// The three facts the frame loop needs from the windowing system.
pub trait WindowSource {
    fn poll_events(&mut self) -> WindowEvents;
    fn drawable_extent(&self) -> vk::Extent2D;
    fn is_minimized(&self) -> bool;
}

/// Everything draw content may touch while a frame is being recorded.
pub struct FrameContext<'a, G: Gpu> {
    pub gpu: &'a G,
    pub cmd: vk::CommandBuffer,
    /// In `COLOR_ATTACHMENT_OPTIMAL` while `draw` runs.
    pub color: TargetView,
    /// In `DEPTH_ATTACHMENT_OPTIMAL` while `draw` runs.
    pub depth: TargetView,
    pub frame_number: u64,
    deferred: &'a mut DeletionQueue,
}

impl<G: Gpu> FrameContext<'_, G> {
    /// Release `resource` once this frame's GPU work has finished.
    pub fn defer(&mut self, resource: impl Into<Release>) {
        self.deferred.push(resource);
    }
}

/// Draw-content collaborator: the scene renderer, debug overlays, etc.
pub trait RenderContent<G: Gpu> {
    fn draw(&mut self, frame: &mut FrameContext<'_, G>) -> RenderResult<()>;

    /// Draw straight onto the swapchain image after the color target was
    /// copied in. `target` is in `COLOR_ATTACHMENT_OPTIMAL`.
    fn overlay(
        &mut self,
        _frame: &mut FrameContext<'_, G>,
        _target: TargetView,
    ) -> RenderResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSettings {
    pub frames_in_flight: usize,
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(1),
        }
    }
}

pub struct FrameLoop<G: Gpu> {
    gpu: Arc<G>,
    chain: PresentationChain<G>,
    frames: FramePool<G>,
    immediate: ImmediateSubmitter<G>,
    /// Device-lifetime objects, flushed last at shutdown.
    global: DeletionQueue,
    settings: FrameSettings,
    state: LoopState,
    torn_down: bool,
}

impl<G: Gpu> FrameLoop<G> {
    /// Build the chain, the frame slots and the immediate channel. Failure
    /// here is fatal: there is no earlier chain to fall back to.
    pub fn new(gpu: Arc<G>, extent: vk::Extent2D, settings: FrameSettings) -> RenderResult<Self> {
        if settings.frames_in_flight == 0 {
            return Err(RenderError::InvalidFramesInFlight(0));
        }
        let chain = PresentationChain::new(Arc::clone(&gpu), extent)?;
        let frames = FramePool::new(
            Arc::clone(&gpu),
            settings.frames_in_flight,
            settings.fence_timeout,
        )?;

        let mut global = DeletionQueue::new();
        let immediate = match ImmediateSubmitter::new(Arc::clone(&gpu), &mut global) {
            Ok(immediate) => immediate,
            Err(e) => {
                global.flush(&*gpu);
                return Err(e);
            }
        };

        log::info!(
            "Frame loop ready: {} frames in flight, {} swapchain images",
            frames.size(),
            chain.image_count()
        );

        Ok(Self {
            gpu,
            chain,
            frames,
            immediate,
            global,
            settings,
            state: LoopState::Running,
            torn_down: false,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn chain(&self) -> &PresentationChain<G> {
        &self.chain
    }

    pub fn frames(&self) -> &FramePool<G> {
        &self.frames
    }

    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    /// Upload `bytes` into a device-local buffer that lives until shutdown.
    pub fn upload_buffer(
        &mut self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<vk::Buffer> {
        let buffer = self.immediate.upload_buffer(bytes, usage)?;
        let handle = buffer.buffer;
        self.global.push(buffer);
        Ok(handle)
    }

    /// One iteration of the outer loop. Errors are fatal; the caller should
    /// shut down and exit.
    pub fn tick<W, C>(&mut self, window: &mut W, content: &mut C) -> RenderResult<LoopState>
    where
        W: WindowSource,
        C: RenderContent<G>,
    {
        if self.state == LoopState::Stopped {
            return Ok(self.state);
        }

        let events = window.poll_events();
        if events.quit {
            log::info!("Quit requested, shutting down");
            self.shutdown()?;
            return Ok(self.state);
        }
        if events.resized {
            self.chain.request_resize();
        }

        let extent = window.drawable_extent();
        if window.is_minimized() || extent.width == 0 || extent.height == 0 {
            if self.state != LoopState::Minimized {
                log::info!("Window minimized, pausing rendering");
                self.state = LoopState::Minimized;
            }
            return Ok(self.state);
        }
        if self.state == LoopState::Minimized {
            log::info!("Window restored");
            self.state = LoopState::Running;
        }

        if self.chain.resize_requested() || extent != self.chain.requested_extent() {
            self.state = LoopState::ResizePending;
        }
        if self.state == LoopState::ResizePending {
            match self.chain.recreate(extent) {
                Ok(()) => self.state = LoopState::Running,
                Err(e) if e.is_device_loss() => return Err(e),
                Err(e) => {
                    log::warn!("Swapchain recreation failed, retrying next frame: {}", e);
                    return Ok(self.state);
                }
            }
        }

        self.draw_frame(window, content)?;
        if self.chain.resize_requested() {
            self.state = LoopState::ResizePending;
        }
        Ok(self.state)
    }

    fn draw_frame<W, C>(&mut self, window: &W, content: &mut C) -> RenderResult<FrameOutcome>
    where
        W: WindowSource,
        C: RenderContent<G>,
    {
        self.frames.begin_frame()?;

        let (Some(color), Some(depth)) = (self.chain.color_target(), self.chain.depth_target())
        else {
            self.chain.request_resize();
            return Ok(FrameOutcome::Skipped);
        };

        let slot = self.frames.current_slot();
        let cmd = slot.command_buffer();
        let acquire_semaphore = slot.acquire_semaphore();
        let render_fence = slot.render_fence();
        let frame_number = self.frames.frame_number();
        let gpu = &*self.gpu;

        gpu.begin_command_buffer(cmd)?;
        gpu.cmd_transition_image(
            cmd,
            color.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        gpu.cmd_transition_image(
            cmd,
            depth.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        );

        let mut frame = FrameContext {
            gpu,
            cmd,
            color,
            depth,
            frame_number,
            deferred: self.frames.current_deletion_queue(),
        };
        content.draw(&mut frame)?;

        // The window may have changed size while we were recording
        if window.drawable_extent() != self.chain.requested_extent() {
            log::debug!("Drawable extent changed mid-frame, deferring to resize");
            self.chain.request_resize();
            return Ok(FrameOutcome::Skipped);
        }

        let index = match self
            .chain
            .acquire_next_image(self.settings.acquire_timeout, acquire_semaphore)?
        {
            AcquireOutcome::Ready(index) => index,
            AcquireOutcome::Suboptimal(_) => {
                self.frames.retire_acquire_semaphore()?;
                return Ok(FrameOutcome::Skipped);
            }
            AcquireOutcome::Stale => return Ok(FrameOutcome::Skipped),
        };
        let swapchain_image = self.chain.image(index);
        let present_semaphore = self.chain.present_semaphore(index);

        gpu.cmd_transition_image(
            cmd,
            color.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        gpu.cmd_transition_image(
            cmd,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        gpu.cmd_blit_image(
            cmd,
            color.image,
            swapchain_image,
            color.extent,
            self.chain.extent(),
        );

        gpu.cmd_transition_image(
            cmd,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let mut frame = FrameContext {
            gpu,
            cmd,
            color,
            depth,
            frame_number,
            deferred: self.frames.current_deletion_queue(),
        };
        content.overlay(&mut frame, self.chain.surface_target(index))?;
        gpu.cmd_transition_image(
            cmd,
            swapchain_image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        gpu.end_command_buffer(cmd)?;

        gpu.submit(&Submission {
            command_buffer: Some(cmd),
            wait: Some(SemaphoreStage {
                semaphore: acquire_semaphore,
                stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            }),
            signal: Some(SemaphoreStage {
                semaphore: present_semaphore,
                stage: vk::PipelineStageFlags2::ALL_GRAPHICS,
            }),
            fence: render_fence,
        })?;
        self.frames.mark_submitted();

        let presented = self.chain.present(index, present_semaphore)?;
        self.frames.advance();

        Ok(match presented {
            PresentOutcome::Presented => FrameOutcome::Presented,
            PresentOutcome::Stale => FrameOutcome::Skipped,
        })
    }

    /// Wait for the device, then destroy the chain, the frame slots and the
    /// device-lifetime objects, in that order. Safe to call more than once.
    ///
    /// Teardown continues even if the idle wait fails; that error is returned
    /// afterwards.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        self.state = LoopState::Stopped;

        let idle = self.gpu.wait_idle();
        if let Err(e) = &idle {
            log::error!("Device did not go idle during shutdown: {}", e);
        }

        self.chain.destroy();
        self.frames.destroy();
        self.global.flush(&*self.gpu);

        log::info!(
            "Frame loop shut down after {} frames",
            self.frames.frame_number()
        );
        idle
    }
}

impl<G: Gpu> Drop for FrameLoop<G> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Shutdown failed: {}", e);
        }
    }
}
