// Deletion queue - deferred, ordered teardown
//
// Every creation call records how to undo it as a `Release` record. Flushing
// runs the records newest-first so a resource always goes before the things
// it was built on. There is no reference counting anywhere in the core; this
// queue is the lifetime tracking.

use ash::vk;

use crate::backend::memory::{AllocatedBuffer, AllocatedImage};
use crate::backend::Gpu;

/// Coarse resource category, for inspecting pending releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Buffer,
    ImageView,
    Fence,
    Semaphore,
    CommandPool,
    Swapchain,
}

/// One pending release. Interpreted by `Gpu::release`.
#[derive(Debug)]
pub enum Release {
    /// Image, its view and its memory, destroyed together.
    Image(AllocatedImage),
    Buffer(AllocatedBuffer),
    ImageView(vk::ImageView),
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
    /// Destroying the pool frees its command buffers.
    CommandPool(vk::CommandPool),
    Swapchain(vk::SwapchainKHR),
}

impl Release {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Release::Image(_) => ResourceKind::Image,
            Release::Buffer(_) => ResourceKind::Buffer,
            Release::ImageView(_) => ResourceKind::ImageView,
            Release::Fence(_) => ResourceKind::Fence,
            Release::Semaphore(_) => ResourceKind::Semaphore,
            Release::CommandPool(_) => ResourceKind::CommandPool,
            Release::Swapchain(_) => ResourceKind::Swapchain,
        }
    }
}

impl From<AllocatedImage> for Release {
    fn from(image: AllocatedImage) -> Self {
        Release::Image(image)
    }
}

impl From<AllocatedBuffer> for Release {
    fn from(buffer: AllocatedBuffer) -> Self {
        Release::Buffer(buffer)
    }
}

macro_rules! release_from_handle {
    ($($handle:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$handle> for Release {
                fn from(handle: $handle) -> Self {
                    Release::$variant(handle)
                }
            }
        )*
    };
}

release_from_handle! {
    vk::ImageView => ImageView,
    vk::Fence => Fence,
    vk::Semaphore => Semaphore,
    vk::CommandPool => CommandPool,
    vk::SwapchainKHR => Swapchain,
}

/// Ordered record of release actions, flushed LIFO.
#[derive(Debug, Default)]
pub struct DeletionQueue {
    entries: Vec<Release>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, release: impl Into<Release>) {
        self.entries.push(release.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending records in insertion order.
    pub fn pending(&self) -> impl Iterator<Item = &Release> + '_ {
        self.entries.iter()
    }

    /// Release everything through the device's dispatch table.
    pub fn flush<G: Gpu + ?Sized>(&mut self, gpu: &G) {
        self.flush_with(|release| gpu.release(release));
    }

    /// Hand every record to `sink`, newest first, and empty the queue.
    ///
    /// The queue is detached before the first record is handed out, so a sink
    /// that pushes new work starts a fresh queue instead of extending this flush.
    pub fn flush_with(&mut self, mut sink: impl FnMut(Release)) {
        let entries = std::mem::take(&mut self.entries);
        if !entries.is_empty() {
            log::debug!("Flushing {} deferred releases", entries.len());
        }
        for release in entries.into_iter().rev() {
            sink(release);
        }
    }
}

/// Scoped ownership of a resource that has not been handed to a longer-lived
/// owner yet. Released through `gpu` on drop unless `keep` is called.
pub struct Guarded<'g, G: Gpu + ?Sized, T: Into<Release>> {
    gpu: &'g G,
    value: Option<T>,
}

impl<'g, G: Gpu + ?Sized, T: Into<Release>> Guarded<'g, G, T> {
    pub fn new(gpu: &'g G, value: T) -> Self {
        Self {
            gpu,
            value: Some(value),
        }
    }

    /// Take the value out; the guard no longer releases it.
    pub fn keep(mut self) -> T {
        // Only `keep` and `drop` ever take the value.
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("guarded value already taken"),
        }
    }
}

impl<G: Gpu + ?Sized, T: Into<Release>> std::ops::Deref for Guarded<'_, G, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("guarded value already taken"),
        }
    }
}

impl<G: Gpu + ?Sized, T: Into<Release>> std::ops::DerefMut for Guarded<'_, G, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("guarded value already taken"),
        }
    }
}

impl<G: Gpu + ?Sized, T: Into<Release>> Drop for Guarded<'_, G, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.gpu.release(value.into());
        }
    }
}
