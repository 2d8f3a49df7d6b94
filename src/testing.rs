// In-memory GPU for unit tests
//
// Models just enough of the device to check the frame core's protocol:
// fences are signaled or pending on a submission, command buffers and every
// resource recorded into them stay in use until the fence is observed,
// binary semaphores are signaled or not. Every call is appended to a log so
// tests can assert on ordering.
// Protocol mistakes are recorded as violations instead of panicking, so a
// test can assert `violations().is_empty()` at the end.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::backend::{
    AcquireOutcome, AllocatedBuffer, AllocatedImage, Gpu, ImageDesc, PresentOutcome, Submission,
    SwapchainParts, SwapchainRequest,
};
use crate::deletion::{Release, ResourceKind};
use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateFence(u64),
    CreateSemaphore(u64),
    WaitFence(u64),
    ResetFence(u64),
    WaitIdle,
    CreateCommandContext { pool: u64, cmd: u64 },
    ResetCommandBuffer(u64),
    BeginCommandBuffer(u64),
    EndCommandBuffer(u64),
    Transition {
        image: u64,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    Blit {
        src: u64,
        dst: u64,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    },
    CopyBuffer { src: u64, dst: u64, size: u64 },
    Submit(Submission),
    CreateImage { name: &'static str, extent: vk::Extent2D },
    CreateBuffer { size: u64, host_visible: bool },
    WriteBuffer { buffer: u64, len: usize },
    CreateSwapchain { extent: vk::Extent2D, old: u64 },
    Acquire { swapchain: u64, signal: u64 },
    Present { swapchain: u64, index: u32, wait: u64 },
    Release(ResourceKind, u64),
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    /// A submission will signal this fence.
    pending: bool,
    /// Command buffers whose completion this fence reports.
    commands: Vec<u64>,
    /// Raw handles the pending work references.
    in_use: HashSet<u64>,
}

#[derive(Debug)]
struct FakeState {
    next_handle: u64,
    fences: HashMap<u64, FenceState>,
    /// Command buffers submitted and not yet observed complete.
    in_flight: HashSet<u64>,
    /// Handles recorded into each command buffer since it was last begun.
    recorded: HashMap<u64, HashSet<u64>>,
    pool_of: HashMap<u64, u64>,
    signaled_semaphores: HashSet<u64>,
    released: HashSet<(ResourceKind, u64)>,
    log: Vec<Call>,
    violations: Vec<String>,
    image_count: u32,
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    failing_swapchains: usize,
    failing_images: usize,
    hung: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            // Keeps fake handles clear of the small raw values tests make up
            next_handle: 1000,
            fences: HashMap::new(),
            in_flight: HashSet::new(),
            recorded: HashMap::new(),
            pool_of: HashMap::new(),
            signaled_semaphores: HashSet::new(),
            released: HashSet::new(),
            log: Vec::new(),
            violations: Vec::new(),
            image_count: 3,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            failing_swapchains: 0,
            failing_images: 0,
            hung: false,
        }
    }
}

impl FakeState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    /// The GPU finishes everything tracked by `fence`.
    fn complete(&mut self, fence: u64) {
        if let Some(state) = self.fences.get_mut(&fence) {
            state.signaled = true;
            state.pending = false;
            state.in_use.clear();
            for cmd in state.commands.drain(..) {
                self.in_flight.remove(&cmd);
            }
        }
    }

    fn record(&mut self, cmd: vk::CommandBuffer, handles: &[u64]) {
        self.recorded
            .entry(cmd.as_raw())
            .or_default()
            .extend(handles.iter().copied());
    }

    /// Some fence that has not been observed still covers work using `raw`.
    fn in_use(&self, raw: u64) -> bool {
        self.fences
            .values()
            .any(|fence| fence.pending && fence.in_use.contains(&raw))
    }
}

#[derive(Debug, Default)]
pub struct FakeGpu {
    state: Mutex<FakeState>,
}

impl FakeGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<Call> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn releases(&self) -> Vec<(ResourceKind, u64)> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|call| match call {
                Call::Release(kind, raw) => Some((*kind, *raw)),
                _ => None,
            })
            .collect()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .is_some_and(|state| state.signaled)
    }

    /// Image count of every swapchain created from now on.
    pub fn set_image_count(&self, count: u32) {
        self.state.lock().image_count = count;
    }

    pub fn script_acquire(&self, outcomes: impl IntoIterator<Item = AcquireOutcome>) {
        self.state.lock().acquire_script.extend(outcomes);
    }

    pub fn script_present(&self, outcomes: impl IntoIterator<Item = PresentOutcome>) {
        self.state.lock().present_script.extend(outcomes);
    }

    /// The next `count` swapchain creations fail.
    pub fn fail_swapchains(&self, count: usize) {
        self.state.lock().failing_swapchains = count;
    }

    /// The next `count` image creations fail with out-of-memory.
    pub fn fail_images(&self, count: usize) {
        self.state.lock().failing_images = count;
    }

    /// Submitted work never completes; waits on it time out.
    pub fn hang(&self) {
        self.state.lock().hung = true;
    }
}

impl Gpu for FakeGpu {
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                ..FenceState::default()
            },
        );
        state.log.push(Call::CreateFence(raw));
        Ok(vk::Fence::from_raw(raw))
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.log.push(Call::CreateSemaphore(raw));
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: Duration) -> RenderResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        state.log.push(Call::WaitFence(raw));

        let known = state
            .fences
            .get(&raw)
            .map(|fence| (fence.signaled, fence.pending));
        let Some((signaled, pending)) = known else {
            state.violation(format!("wait on unknown fence {raw}"));
            return Err(RenderError::Timeout { what: "fence" });
        };

        if signaled {
            return Ok(());
        }
        if !pending {
            state.violation(format!("wait on fence {raw} that nothing will signal"));
            return Err(RenderError::Timeout { what: "fence" });
        }
        if state.hung {
            return Err(RenderError::Timeout { what: "fence" });
        }
        state.complete(raw);
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        state.log.push(Call::ResetFence(raw));

        let in_flight = state.fences.get(&raw).is_some_and(|fence| fence.pending);
        if in_flight {
            state.violation(format!("reset of in-flight fence {raw}"));
        }
        if let Some(fence) = state.fences.get_mut(&raw) {
            fence.signaled = false;
        }
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.log.push(Call::WaitIdle);
        if state.hung {
            return Err(RenderError::Timeout { what: "device idle" });
        }
        let fences: Vec<u64> = state.fences.keys().copied().collect();
        for fence in fences {
            let pending = state.fences.get(&fence).is_some_and(|f| f.pending);
            if pending {
                state.complete(fence);
            }
        }
        Ok(())
    }

    fn create_command_context(&self) -> RenderResult<(vk::CommandPool, vk::CommandBuffer)> {
        let mut state = self.state.lock();
        let pool = state.handle();
        let cmd = state.handle();
        state.log.push(Call::CreateCommandContext { pool, cmd });
        state.pool_of.insert(cmd, pool);
        Ok((vk::CommandPool::from_raw(pool), vk::CommandBuffer::from_raw(cmd)))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        state.log.push(Call::ResetCommandBuffer(raw));
        if state.in_flight.contains(&raw) {
            state.violation(format!("reset of command buffer {raw} while pending"));
        }
        state.recorded.remove(&raw);
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        state.log.push(Call::BeginCommandBuffer(raw));
        if state.in_flight.contains(&raw) {
            state.violation(format!("recording into pending command buffer {raw}"));
        }
        state.recorded.remove(&raw);
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        self.state
            .lock()
            .log
            .push(Call::EndCommandBuffer(cmd.as_raw()));
        Ok(())
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) {
        let mut state = self.state.lock();
        state.record(cmd, &[image.as_raw()]);
        state.log.push(Call::Transition {
            image: image.as_raw(),
            from,
            to,
        });
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    ) {
        let mut state = self.state.lock();
        state.record(cmd, &[src.as_raw(), dst.as_raw()]);
        state.log.push(Call::Blit {
            src: src.as_raw(),
            dst: dst.as_raw(),
            src_extent,
            dst_extent,
        });
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        let mut state = self.state.lock();
        state.record(cmd, &[src.as_raw(), dst.as_raw()]);
        state.log.push(Call::CopyBuffer {
            src: src.as_raw(),
            dst: dst.as_raw(),
            size,
        });
    }

    fn submit(&self, submission: &Submission) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.log.push(Call::Submit(*submission));

        let fence = submission.fence.as_raw();
        let mut in_use = HashSet::new();

        if let Some(cmd) = submission.command_buffer.map(|cmd| cmd.as_raw()) {
            if !state.in_flight.insert(cmd) {
                state.violation(format!("command buffer {cmd} submitted twice"));
            }
            in_use.insert(cmd);
            in_use.extend(state.recorded.get(&cmd).into_iter().flatten().copied());
            in_use.extend(state.pool_of.get(&cmd).copied());
        }
        if let Some(wait) = submission.wait {
            let raw = wait.semaphore.as_raw();
            if !state.signaled_semaphores.remove(&raw) {
                state.violation(format!("wait on unsignaled semaphore {raw}"));
            }
            in_use.insert(raw);
        }
        if let Some(signal) = submission.signal {
            let raw = signal.semaphore.as_raw();
            state.signaled_semaphores.insert(raw);
            in_use.insert(raw);
        }

        match state.fences.get(&fence).map(|f| f.signaled || f.pending) {
            Some(true) => state.violation(format!("submit with busy or signaled fence {fence}")),
            Some(false) => {
                if let Some(fence_state) = state.fences.get_mut(&fence) {
                    fence_state.pending = true;
                    fence_state.commands.extend(submission.command_buffer.map(|c| c.as_raw()));
                    fence_state.in_use = in_use;
                }
            }
            None => state.violation(format!("submit with unknown fence {fence}")),
        }
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<AllocatedImage> {
        let mut state = self.state.lock();
        if state.failing_images > 0 {
            state.failing_images -= 1;
            return Err(RenderError::OutOfMemory);
        }
        let image = state.handle();
        let view = state.handle();
        state.log.push(Call::CreateImage {
            name: desc.name,
            extent: desc.extent,
        });
        Ok(AllocatedImage {
            image: vk::Image::from_raw(image),
            view: vk::ImageView::from_raw(view),
            allocation: None,
            extent: vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            },
            format: desc.format,
        })
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RenderResult<AllocatedBuffer> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.log.push(Call::CreateBuffer {
            size,
            host_visible: !matches!(location, MemoryLocation::GpuOnly),
        });
        Ok(AllocatedBuffer {
            buffer: vk::Buffer::from_raw(raw),
            allocation: None,
            size,
        })
    }

    fn write_buffer(&self, buffer: &mut AllocatedBuffer, bytes: &[u8]) -> RenderResult<()> {
        if bytes.len() as u64 > buffer.size {
            return Err(RenderError::BufferTooSmall {
                needed: bytes.len() as u64,
                size: buffer.size,
            });
        }
        self.state.lock().log.push(Call::WriteBuffer {
            buffer: buffer.buffer.as_raw(),
            len: bytes.len(),
        });
        Ok(())
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> RenderResult<SwapchainParts> {
        let mut state = self.state.lock();
        state.log.push(Call::CreateSwapchain {
            extent: request.extent,
            old: request.old.as_raw(),
        });
        if state.failing_swapchains > 0 {
            state.failing_swapchains -= 1;
            return Err(RenderError::from_vk(
                "create_swapchain",
                vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR,
            ));
        }

        let handle = state.handle();
        let count = state.image_count.max(request.min_image_count);
        let images: Vec<_> = (0..count)
            .map(|_| vk::Image::from_raw(state.handle()))
            .collect();
        let views: Vec<_> = (0..count)
            .map(|_| vk::ImageView::from_raw(state.handle()))
            .collect();
        state.next_image = 0;

        Ok(SwapchainParts {
            handle: vk::SwapchainKHR::from_raw(handle),
            images,
            views,
            format: vk::Format::B8G8R8A8_UNORM,
            extent: request.extent,
            present_mode: vk::PresentModeKHR::FIFO,
        })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: Duration,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let mut state = self.state.lock();
        state.log.push(Call::Acquire {
            swapchain: swapchain.as_raw(),
            signal: signal.as_raw(),
        });
        if state.hung {
            return Err(RenderError::Timeout {
                what: "swapchain image",
            });
        }

        let outcome = match state.acquire_script.pop_front() {
            Some(outcome) => outcome,
            None => {
                let index = state.next_image % state.image_count.max(1);
                state.next_image = index + 1;
                AcquireOutcome::Ready(index)
            }
        };
        if let AcquireOutcome::Ready(_) | AcquireOutcome::Suboptimal(_) = outcome {
            if !state.signaled_semaphores.insert(signal.as_raw()) {
                state.violation(format!("acquire into signaled semaphore {}", signal.as_raw()));
            }
        }
        Ok(outcome)
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let mut state = self.state.lock();
        state.log.push(Call::Present {
            swapchain: swapchain.as_raw(),
            index,
            wait: wait.as_raw(),
        });
        if !state.signaled_semaphores.remove(&wait.as_raw()) {
            state.violation(format!("present waits on unsignaled semaphore {}", wait.as_raw()));
        }
        Ok(state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn release(&self, release: Release) {
        let raw = match &release {
            Release::Image(image) => image.image.as_raw(),
            Release::Buffer(buffer) => buffer.buffer.as_raw(),
            Release::ImageView(view) => view.as_raw(),
            Release::Fence(fence) => fence.as_raw(),
            Release::Semaphore(semaphore) => semaphore.as_raw(),
            Release::CommandPool(pool) => pool.as_raw(),
            Release::Swapchain(swapchain) => swapchain.as_raw(),
        };
        let kind = release.kind();

        let mut state = self.state.lock();
        state.log.push(Call::Release(kind, raw));
        if !state.released.insert((kind, raw)) {
            state.violation(format!("double release of {kind:?} {raw}"));
        }
        if state.in_use(raw) {
            state.violation(format!("release of {kind:?} {raw} still used by pending work"));
        }
        if kind == ResourceKind::Fence {
            let pending = state.fences.remove(&raw).is_some_and(|fence| fence.pending);
            if pending {
                state.violation(format!("release of fence {raw} with work pending"));
            }
        }
        if kind == ResourceKind::Semaphore && state.signaled_semaphores.remove(&raw) {
            state.violation(format!("release of semaphore {raw} with a signal nobody waited on"));
        }
    }
}

/// Index of the first call matching `pred`, panicking with the log if none.
pub fn position(log: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
    match log.iter().position(pred) {
        Some(index) => index,
        None => panic!("no matching call in log: {log:#?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SemaphoreStage;

    fn submit(gpu: &FakeGpu, cmd: vk::CommandBuffer, fence: vk::Fence) {
        gpu.submit(&Submission {
            command_buffer: Some(cmd),
            wait: None,
            signal: None,
            fence,
        })
        .unwrap();
    }

    #[test]
    fn releasing_what_pending_work_uses_is_a_violation() {
        let gpu = FakeGpu::new();
        let (pool, cmd) = gpu.create_command_context().unwrap();
        let fence = gpu.create_fence(false).unwrap();
        let image = gpu
            .create_image(&ImageDesc::color_target(vk::Extent2D {
                width: 4,
                height: 4,
            }))
            .unwrap();
        let raw_image = image.image.as_raw();

        gpu.begin_command_buffer(cmd).unwrap();
        gpu.cmd_transition_image(
            cmd,
            image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
        );
        gpu.end_command_buffer(cmd).unwrap();
        submit(&gpu, cmd, fence);

        gpu.release(Release::Image(image));
        gpu.release(Release::CommandPool(pool));

        let violations = gpu.violations();
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains(&raw_image.to_string()));
        assert!(violations[1].contains(&pool.as_raw().to_string()));
    }

    #[test]
    fn release_after_the_fence_is_observed_is_clean() {
        let gpu = FakeGpu::new();
        let (pool, cmd) = gpu.create_command_context().unwrap();
        let fence = gpu.create_fence(false).unwrap();
        let staging = gpu
            .create_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu)
            .unwrap();
        let target = gpu
            .create_buffer(16, vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuOnly)
            .unwrap();

        gpu.begin_command_buffer(cmd).unwrap();
        gpu.cmd_copy_buffer(cmd, staging.buffer, target.buffer, 16);
        gpu.end_command_buffer(cmd).unwrap();
        submit(&gpu, cmd, fence);
        gpu.wait_for_fence(fence, Duration::from_secs(1)).unwrap();

        gpu.release(Release::Buffer(staging));
        gpu.release(Release::Buffer(target));
        gpu.release(Release::CommandPool(pool));
        gpu.release(Release::Fence(fence));
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn unconsumed_semaphore_signal_is_a_violation() {
        let gpu = FakeGpu::new();
        let semaphore = gpu.create_semaphore().unwrap();
        let fence = gpu.create_fence(false).unwrap();
        gpu.script_acquire([AcquireOutcome::Suboptimal(0)]);
        gpu.acquire_next_image(vk::SwapchainKHR::from_raw(1), Duration::ZERO, semaphore)
            .unwrap();

        // Waited on by an empty batch, but released before its fence is seen
        gpu.submit(&Submission {
            command_buffer: None,
            wait: Some(SemaphoreStage {
                semaphore,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            }),
            signal: None,
            fence,
        })
        .unwrap();
        gpu.release(Release::Semaphore(semaphore));
        assert_eq!(gpu.violations().len(), 1);

        // Signaled and never waited on at all
        let orphan = gpu.create_semaphore().unwrap();
        gpu.acquire_next_image(vk::SwapchainKHR::from_raw(1), Duration::ZERO, orphan)
            .unwrap();
        gpu.release(Release::Semaphore(orphan));
        assert_eq!(gpu.violations().len(), 2);
    }
}
