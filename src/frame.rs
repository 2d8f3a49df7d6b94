// Frame slots - per-frame command recording and synchronization
//
// A small ring of slots lets the CPU record frame N+1 while the GPU still
// runs frame N. A slot is only touched again after its render fence says the
// GPU is done with it.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::backend::{Gpu, SemaphoreStage, Submission};
use crate::deletion::{DeletionQueue, Guarded, Release};
use crate::error::{RenderError, RenderResult};

/// Slot used for `frame_number` in a pool of `pool_size`.
pub fn slot_index(frame_number: u64, pool_size: usize) -> usize {
    (frame_number % pool_size as u64) as usize
}

/// One frame's worth of command recording and sync objects.
#[derive(Debug)]
pub struct FrameSlot {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    /// Signaled when the swapchain image for this frame is ready.
    acquire_semaphore: vk::Semaphore,
    /// Signaled when this slot's GPU work completes.
    render_fence: vk::Fence,
    /// Released the next time this slot comes around.
    deletion_queue: DeletionQueue,
    /// A submission signaling `render_fence` is outstanding.
    submitted: bool,
}

impl FrameSlot {
    fn new<G: Gpu>(gpu: &G) -> RenderResult<Self> {
        let (pool, command_buffer) = gpu.create_command_context()?;
        let pool = Guarded::new(gpu, pool);
        // Start signaled so the first wait returns immediately
        let fence = Guarded::new(gpu, gpu.create_fence(true)?);
        let acquire = Guarded::new(gpu, gpu.create_semaphore()?);

        Ok(Self {
            command_pool: pool.keep(),
            command_buffer,
            acquire_semaphore: acquire.keep(),
            render_fence: fence.keep(),
            deletion_queue: DeletionQueue::new(),
            submitted: false,
        })
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn acquire_semaphore(&self) -> vk::Semaphore {
        self.acquire_semaphore
    }

    pub fn render_fence(&self) -> vk::Fence {
        self.render_fence
    }

    pub fn deletion_queue(&self) -> &DeletionQueue {
        &self.deletion_queue
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    fn destroy<G: Gpu>(mut self, gpu: &G) {
        self.deletion_queue.flush(gpu);
        gpu.release(Release::Semaphore(self.acquire_semaphore));
        gpu.release(Release::Fence(self.render_fence));
        gpu.release(Release::CommandPool(self.command_pool));
    }
}

/// Fixed ring of frame slots selected by a monotonically increasing counter.
pub struct FramePool<G: Gpu> {
    gpu: Arc<G>,
    slots: Vec<FrameSlot>,
    frame_number: u64,
    fence_timeout: Duration,
}

impl<G: Gpu> FramePool<G> {
    pub fn new(gpu: Arc<G>, size: usize, fence_timeout: Duration) -> RenderResult<Self> {
        if size == 0 {
            return Err(RenderError::InvalidFramesInFlight(size));
        }

        let mut pool = Self {
            gpu,
            slots: Vec::with_capacity(size),
            frame_number: 0,
            fence_timeout,
        };
        for _ in 0..size {
            let slot = FrameSlot::new(&*pool.gpu)?;
            pool.slots.push(slot);
        }

        log::debug!("Created {} frame slots", size);
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current_index(&self) -> usize {
        slot_index(self.frame_number, self.slots.len())
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current_index()]
    }

    fn current_slot_mut(&mut self) -> &mut FrameSlot {
        let index = self.current_index();
        &mut self.slots[index]
    }

    /// Make the current slot ready for recording.
    ///
    /// Blocks until the slot's previous submission (if any) has finished,
    /// then releases everything deferred on it and resets its command buffer.
    /// A fence timeout is returned as `RenderError::Timeout`.
    pub fn begin_frame(&mut self) -> RenderResult<()> {
        let gpu = Arc::clone(&self.gpu);
        let timeout = self.fence_timeout;
        let slot = self.current_slot_mut();

        if slot.submitted {
            gpu.wait_for_fence(slot.render_fence, timeout)?;
            slot.submitted = false;
        }
        gpu.reset_fence(slot.render_fence)?;
        slot.deletion_queue.flush(&*gpu);
        gpu.reset_command_buffer(slot.command_buffer)
    }

    /// Record that the current slot's fence now has work posted against it.
    pub fn mark_submitted(&mut self) {
        self.current_slot_mut().submitted = true;
    }

    /// Retire the acquire semaphore of a frame that is being dropped after a
    /// suboptimal acquire left a signal pending on it.
    ///
    /// An empty batch waits on the old semaphore and signals this slot's
    /// render fence, so the next `begin_frame` on the slot observes the wait
    /// completing before the old semaphore is released. Must be called
    /// between `begin_frame` and any submission of the slot's commands.
    pub fn retire_acquire_semaphore(&mut self) -> RenderResult<()> {
        let gpu = Arc::clone(&self.gpu);
        let fresh = Guarded::new(&*gpu, gpu.create_semaphore()?);
        let slot = self.current_slot_mut();

        gpu.submit(&Submission {
            command_buffer: None,
            wait: Some(SemaphoreStage {
                semaphore: slot.acquire_semaphore,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            }),
            signal: None,
            fence: slot.render_fence,
        })?;
        slot.submitted = true;

        let old = std::mem::replace(&mut slot.acquire_semaphore, fresh.keep());
        slot.deletion_queue.push(old);
        Ok(())
    }

    /// Release `resource` once the current slot's GPU work is known complete.
    pub fn defer(&mut self, resource: impl Into<Release>) {
        self.current_slot_mut().deletion_queue.push(resource);
    }

    pub(crate) fn current_deletion_queue(&mut self) -> &mut DeletionQueue {
        &mut self.current_slot_mut().deletion_queue
    }

    pub fn advance(&mut self) {
        self.frame_number += 1;
    }

    /// Flush every slot's deferred releases and destroy the slots. The caller
    /// must have waited for the device to go idle.
    pub fn destroy(&mut self) {
        let gpu = Arc::clone(&self.gpu);
        for slot in self.slots.drain(..) {
            slot.destroy(&*gpu);
        }
    }
}

impl<G: Gpu> Drop for FramePool<G> {
    fn drop(&mut self) {
        self.destroy();
    }
}
