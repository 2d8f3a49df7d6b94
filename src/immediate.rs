// Immediate submission - blocking one-off GPU work
//
// A dedicated command buffer and fence, separate from the frame slots, for
// uploads and other work that must finish before the caller continues.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::backend::{AllocatedBuffer, Gpu, Submission};
use crate::deletion::{DeletionQueue, Guarded};
use crate::error::{RenderError, RenderResult};

pub struct ImmediateSubmitter<G: Gpu> {
    gpu: Arc<G>,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl<G: Gpu> ImmediateSubmitter<G> {
    /// The pool and fence are handed to `owner`, which destroys them at shutdown.
    pub fn new(gpu: Arc<G>, owner: &mut DeletionQueue) -> RenderResult<Self> {
        let (pool, command_buffer) = gpu.create_command_context()?;
        owner.push(pool);
        let fence = gpu.create_fence(true)?;
        owner.push(fence);

        Ok(Self {
            gpu,
            command_buffer,
            fence,
        })
    }

    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Record with `record`, submit, and block until the GPU has finished.
    ///
    /// The wait is unbounded: this runs at load time where stalling the whole
    /// process is acceptable.
    pub fn submit_and_wait<F>(&mut self, record: F) -> RenderResult<()>
    where
        F: FnOnce(&G, vk::CommandBuffer) -> RenderResult<()>,
    {
        self.submit(record)?;
        self.gpu.wait_for_fence(self.fence, Duration::MAX)
    }

    fn submit<F>(&mut self, record: F) -> RenderResult<()>
    where
        F: FnOnce(&G, vk::CommandBuffer) -> RenderResult<()>,
    {
        let gpu = &*self.gpu;
        let cmd = self.command_buffer;

        gpu.reset_fence(self.fence)?;
        gpu.reset_command_buffer(cmd)?;
        gpu.begin_command_buffer(cmd)?;
        record(gpu, cmd)?;
        gpu.end_command_buffer(cmd)?;

        gpu.submit(&Submission {
            command_buffer: Some(cmd),
            wait: None,
            signal: None,
            fence: self.fence,
        })
    }

    /// Copy `bytes` into a new device-local buffer through a staging buffer.
    ///
    /// The staging buffer is released before returning, except when the copy
    /// was submitted and never observed finishing. Then both buffers are
    /// leaked, since the GPU may still be reading and writing them.
    pub fn upload_buffer(
        &mut self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<AllocatedBuffer> {
        if bytes.is_empty() {
            return Err(RenderError::EmptyUpload);
        }
        let size = bytes.len() as vk::DeviceSize;
        let gpu = Arc::clone(&self.gpu);
        let gpu = &*gpu;

        let mut staging = Guarded::new(
            gpu,
            gpu.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu)?,
        );
        gpu.write_buffer(&mut staging, bytes)?;

        let target = Guarded::new(
            gpu,
            gpu.create_buffer(
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )?,
        );

        let (src, dst) = (staging.buffer, target.buffer);
        self.submit(|gpu, cmd| {
            gpu.cmd_copy_buffer(cmd, src, dst, size);
            Ok(())
        })?;
        if let Err(e) = gpu.wait_for_fence(self.fence, Duration::MAX) {
            log::error!("Upload of {} bytes never finished, leaking its buffers: {}", size, e);
            let _ = (staging.keep(), target.keep());
            return Err(e);
        }

        log::debug!("Uploaded {} bytes", size);
        Ok(target.keep())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::ResourceKind;
    use crate::testing::{Call, FakeGpu};
    use ash::vk::Handle;

    fn submitter() -> (Arc<FakeGpu>, DeletionQueue, ImmediateSubmitter<FakeGpu>) {
        let gpu = Arc::new(FakeGpu::new());
        let mut owner = DeletionQueue::new();
        let immediate = ImmediateSubmitter::new(Arc::clone(&gpu), &mut owner).unwrap();
        (gpu, owner, immediate)
    }

    #[test]
    fn submit_and_wait_runs_the_whole_protocol() {
        let (gpu, _owner, mut immediate) = submitter();
        gpu.clear_log();
        let mut recorded = None;

        immediate
            .submit_and_wait(|_, cmd| {
                recorded = Some(cmd);
                Ok(())
            })
            .unwrap();

        let cmd = recorded.unwrap().as_raw();
        let fence = immediate.fence().as_raw();
        let log = gpu.log();
        assert!(matches!(
            log.as_slice(),
            [
                Call::ResetFence(f),
                Call::ResetCommandBuffer(c0),
                Call::BeginCommandBuffer(c1),
                Call::EndCommandBuffer(c2),
                Call::Submit(_),
                Call::WaitFence(f2),
            ] if *f == fence && *f2 == fence && *c0 == cmd && *c1 == cmd && *c2 == cmd
        ));
        assert!(gpu.fence_signaled(immediate.fence()));
    }

    #[test]
    fn sequential_submissions_never_overlap() {
        let (gpu, _owner, mut immediate) = submitter();

        immediate.submit_and_wait(|_, _| Ok(())).unwrap();
        // The second reset must find the first submission finished
        assert!(gpu.fence_signaled(immediate.fence()));
        immediate.submit_and_wait(|_, _| Ok(())).unwrap();

        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn recording_error_skips_submit() {
        let (gpu, _owner, mut immediate) = submitter();

        let result = immediate.submit_and_wait(|_, _| Err(RenderError::OutOfMemory));

        assert!(matches!(result, Err(RenderError::OutOfMemory)));
        assert!(!gpu.log().iter().any(|c| matches!(c, Call::Submit(_))));
        // Still usable afterwards
        immediate.submit_and_wait(|_, _| Ok(())).unwrap();
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn upload_copies_through_staging_and_releases_it() {
        let (gpu, _owner, mut immediate) = submitter();
        gpu.clear_log();

        let buffer = immediate
            .upload_buffer(&[1, 2, 3, 4], vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();

        let log = gpu.log();
        assert!(log.contains(&Call::CreateBuffer {
            size: 4,
            host_visible: true
        }));
        assert!(log.contains(&Call::CreateBuffer {
            size: 4,
            host_visible: false
        }));
        let staging = log
            .iter()
            .find_map(|c| match c {
                Call::WriteBuffer { buffer, len: 4 } => Some(*buffer),
                _ => None,
            })
            .unwrap();
        assert!(log.contains(&Call::CopyBuffer {
            src: staging,
            dst: buffer.buffer.as_raw(),
            size: 4
        }));
        assert_eq!(gpu.releases(), [(ResourceKind::Buffer, staging)]);
        assert_eq!(buffer.size, 4);
    }

    #[test]
    fn upload_that_never_finishes_keeps_its_buffers() {
        let (gpu, _owner, mut immediate) = submitter();
        gpu.hang();

        let result = immediate.upload_buffer(&[7; 8], vk::BufferUsageFlags::STORAGE_BUFFER);

        assert!(result.unwrap_err().is_device_loss());
        assert!(gpu.log().iter().any(|c| matches!(c, Call::CopyBuffer { .. })));
        assert!(gpu.releases().is_empty());
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn empty_upload_is_rejected() {
        let (gpu, _owner, mut immediate) = submitter();
        gpu.clear_log();

        let result = immediate.upload_buffer(&[], vk::BufferUsageFlags::INDEX_BUFFER);

        assert!(matches!(result, Err(RenderError::EmptyUpload)));
        assert!(gpu.log().is_empty());
    }

    #[test]
    fn owner_queue_holds_the_context() {
        let (gpu, mut owner, _immediate) = submitter();

        owner.flush(&*gpu);

        let kinds: Vec<_> = gpu.releases().into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, [ResourceKind::Fence, ResourceKind::CommandPool]);
    }
}
