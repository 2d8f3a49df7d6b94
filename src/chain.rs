// Presentation chain - swapchain lifecycle and render targets
//
// Owns the swapchain, its views, one present semaphore per swapchain image
// and the renderer-owned color/depth targets. Staleness is reported through
// `resize_requested`; the frame loop decides when to act on it.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::backend::{
    AcquireOutcome, AllocatedImage, Gpu, ImageDesc, PresentOutcome, SwapchainRequest, TargetView,
};
use crate::deletion::{DeletionQueue, Guarded, Release};
use crate::error::{RenderError, RenderResult};

/// Triple buffering at minimum.
pub const MIN_IMAGE_COUNT: u32 = 3;

/// Swapchain images are blit targets and may be drawn into by overlays.
pub fn chain_usage() -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST
}

/// Reject zero-area extents before they reach the device.
pub fn validate_extent(extent: vk::Extent2D) -> RenderResult<()> {
    if extent.width == 0 || extent.height == 0 {
        return Err(RenderError::InvalidExtent {
            width: extent.width,
            height: extent.height,
        });
    }
    Ok(())
}

struct RenderTargets {
    color: AllocatedImage,
    depth: AllocatedImage,
}

pub struct PresentationChain<G: Gpu> {
    gpu: Arc<G>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    /// Indexed by swapchain image, not by frame slot.
    present_semaphores: Vec<vk::Semaphore>,
    format: vk::Format,
    extent: vk::Extent2D,
    requested_extent: vk::Extent2D,
    targets: Option<RenderTargets>,
    resize_requested: bool,
}

impl<G: Gpu> PresentationChain<G> {
    /// Build the first chain. There is nothing to fall back to, so any
    /// failure here is the caller's to treat as fatal.
    pub fn new(gpu: Arc<G>, extent: vk::Extent2D) -> RenderResult<Self> {
        validate_extent(extent)?;

        let mut chain = Self {
            gpu,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            present_semaphores: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            requested_extent: extent,
            targets: None,
            resize_requested: false,
        };
        chain.build(extent)?;
        Ok(chain)
    }

    /// Tear down everything sized to the old surface and build it again at
    /// `extent`. Waits for the device to go idle first.
    ///
    /// On failure the chain is left without a swapchain and
    /// `resize_requested` stays set, so a later call can retry.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> RenderResult<()> {
        validate_extent(extent)?;
        self.gpu.wait_idle()?;

        log::debug!(
            "Recreating swapchain {}x{} -> {}x{}",
            self.extent.width,
            self.extent.height,
            extent.width,
            extent.height
        );

        self.requested_extent = extent;
        self.resize_requested = true;
        self.release_sized_resources();
        self.build(extent)?;
        self.resize_requested = false;
        Ok(())
    }

    fn build(&mut self, extent: vk::Extent2D) -> RenderResult<()> {
        let gpu = Arc::clone(&self.gpu);
        let gpu = &*gpu;

        let old = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());
        let created = gpu.create_swapchain(&SwapchainRequest {
            extent,
            min_image_count: MIN_IMAGE_COUNT,
            usage: chain_usage(),
            old,
        });
        // Retired by the create call whether or not it succeeded
        if old != vk::SwapchainKHR::null() {
            gpu.release(Release::Swapchain(old));
        }
        let parts = created?;

        let handle = Guarded::new(gpu, parts.handle);
        let views: Vec<_> = parts
            .views
            .into_iter()
            .map(|view| Guarded::new(gpu, view))
            .collect();

        let mut semaphores = Vec::with_capacity(parts.images.len());
        for _ in &parts.images {
            semaphores.push(Guarded::new(gpu, gpu.create_semaphore()?));
        }

        let color = Guarded::new(gpu, gpu.create_image(&ImageDesc::color_target(parts.extent))?);
        let depth = Guarded::new(gpu, gpu.create_image(&ImageDesc::depth_target(parts.extent))?);

        self.targets = Some(RenderTargets {
            color: color.keep(),
            depth: depth.keep(),
        });
        self.present_semaphores = semaphores.into_iter().map(Guarded::keep).collect();
        self.views = views.into_iter().map(Guarded::keep).collect();
        self.swapchain = handle.keep();
        self.images = parts.images;
        self.format = parts.format;
        self.extent = parts.extent;

        log::info!(
            "Presentation chain ready: {} images at {}x{} ({:?})",
            self.images.len(),
            self.extent.width,
            self.extent.height,
            parts.present_mode
        );
        Ok(())
    }

    /// Views, present semaphores and render targets. The swapchain handle
    /// itself survives as the retirement hint for the next build.
    fn release_sized_resources(&mut self) {
        let mut queue = DeletionQueue::new();
        for view in self.views.drain(..) {
            queue.push(view);
        }
        for semaphore in self.present_semaphores.drain(..) {
            queue.push(semaphore);
        }
        if let Some(targets) = self.targets.take() {
            queue.push(targets.color);
            queue.push(targets.depth);
        }
        self.images.clear();
        queue.flush(&*self.gpu);
    }

    /// Release everything. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.release_sized_resources();
        let swapchain = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());
        if swapchain != vk::SwapchainKHR::null() {
            self.gpu.release(Release::Swapchain(swapchain));
        }
    }

    /// Ask for the next image, signaling `signal` once it may be written.
    pub fn acquire_next_image(
        &mut self,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        if self.swapchain == vk::SwapchainKHR::null() {
            self.resize_requested = true;
            return Ok(AcquireOutcome::Stale);
        }

        let outcome = self
            .gpu
            .acquire_next_image(self.swapchain, timeout, signal)?;
        if outcome.is_stale() {
            log::debug!("Swapchain stale on acquire");
            self.resize_requested = true;
        }
        Ok(outcome)
    }

    pub fn present(&mut self, index: u32, wait: vk::Semaphore) -> RenderResult<PresentOutcome> {
        let outcome = self.gpu.present(self.swapchain, index, wait)?;
        if outcome == PresentOutcome::Stale {
            log::debug!("Swapchain stale on present");
            self.resize_requested = true;
        }
        Ok(outcome)
    }

    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    /// A swapchain and render targets exist.
    pub fn is_live(&self) -> bool {
        self.swapchain != vk::SwapchainKHR::null() && self.targets.is_some()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    pub fn present_semaphore(&self, index: u32) -> vk::Semaphore {
        self.present_semaphores[index as usize]
    }

    pub fn present_semaphores(&self) -> &[vk::Semaphore] {
        &self.present_semaphores
    }

    /// Swapchain image `index` as a draw target (for overlays).
    pub fn surface_target(&self, index: u32) -> TargetView {
        TargetView {
            image: self.images[index as usize],
            view: self.views[index as usize],
            extent: self.extent,
            format: self.format,
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Extent the swapchain was actually created with.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Extent last asked for by the window.
    pub fn requested_extent(&self) -> vk::Extent2D {
        self.requested_extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn color_target(&self) -> Option<TargetView> {
        self.targets.as_ref().map(|t| t.color.target())
    }

    pub fn depth_target(&self) -> Option<TargetView> {
        self.targets.as_ref().map(|t| t.depth.target())
    }
}

impl<G: Gpu> Drop for PresentationChain<G> {
    fn drop(&mut self) {
        self.destroy();
    }
}
