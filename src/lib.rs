// Frame pacing core for a Vulkan renderer
//
// ┌──────────────────────────────────────────────────────────────┐
// │  FrameLoop (state machine, one tick per outer iteration)     │
// │    ├── PresentationChain (swapchain, targets, present sync)  │
// │    ├── FramePool (per-frame commands, fences, deferrals)     │
// │    └── ImmediateSubmitter (blocking one-off uploads)         │
// │          └── DeletionQueue (ordered teardown everywhere)     │
// └──────────────────────────────────────────────────────────────┘
//
// Everything above the backend is generic over `backend::Gpu`.

pub mod backend;
pub mod chain;
pub mod clear_pass;
pub mod config;
pub mod deletion;
pub mod error;
pub mod frame;
pub mod frame_loop;
pub mod immediate;

#[cfg(test)]
mod testing;

pub use backend::{Gpu, VulkanDevice};
pub use chain::PresentationChain;
pub use deletion::{DeletionQueue, Release};
pub use error::{RenderError, RenderResult};
pub use frame::FramePool;
pub use frame_loop::{FrameLoop, FrameOutcome, FrameSettings, LoopState, RenderContent, WindowSource};
pub use immediate::ImmediateSubmitter;
