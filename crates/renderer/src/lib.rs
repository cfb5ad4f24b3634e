//! Frame pacing and renderer orchestration.
//!
//! - [`frame_sync`]: frame slots and the acquire/submit/present protocol
//! - [`Renderer`]: swapchain recreation, render target and descriptor ownership
//! - [`GpuContext`]: instance, surface and device bootstrap for a window

mod context;
pub mod frame_sync;
mod renderer;

pub use context::GpuContext;
pub use frame_sync::{AcquireOutcome, AcquiredFrame, FrameStatus, FrameSync, SubmittedFrame};
pub use renderer::{Renderer, RendererDesc};
