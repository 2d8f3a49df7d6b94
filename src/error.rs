// Render errors
//
// Everything the frame core can fail with. Staleness of the presentation
// chain is NOT an error - see AcquireOutcome / PresentOutcome.

use ash::vk;
use thiserror::Error;

pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{op} failed: {result:?}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },

    #[error("GPU device lost")]
    DeviceLost,

    /// A bounded wait expired. Treated as a hung GPU.
    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },

    #[error("out of GPU or host memory")]
    OutOfMemory,

    #[error("allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("invalid extent {width}x{height}")]
    InvalidExtent { width: u32, height: u32 },

    #[error("surface supports usage {supported:?}, need {required:?}")]
    UnsupportedUsage {
        required: vk::ImageUsageFlags,
        supported: vk::ImageUsageFlags,
    },

    #[error("frames in flight must be at least 1, got {0}")]
    InvalidFramesInFlight(usize),

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error("buffer memory is not host visible")]
    NotHostVisible,

    #[error("{needed} bytes do not fit in a {size} byte buffer")]
    BufferTooSmall { needed: u64, size: u64 },

    #[error("nothing to upload")]
    EmptyUpload,
}

impl RenderError {
    /// Map a raw Vulkan result from operation `op`.
    pub fn from_vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
            vk::Result::TIMEOUT => RenderError::Timeout { what: op },
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                RenderError::OutOfMemory
            }
            result => RenderError::Vulkan { op, result },
        }
    }

    /// Shorthand for `.map_err(RenderError::vk("op"))`.
    pub fn vk(op: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::from_vk(op, result)
    }

    /// GPU progress can no longer be observed; nothing sensible can continue.
    pub fn is_device_loss(&self) -> bool {
        matches!(self, RenderError::DeviceLost | RenderError::Timeout { .. })
    }
}
