//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! Safe wrappers over `ash` for the pieces a frame loop needs:
//! - instance, physical device and logical device creation
//! - swapchain management with a recreation generation counter
//! - render targets and state-checked command lists
//! - descriptor layout caching, pooled set allocation and the descriptor builder
//! - pipelines, shaders, host-visible buffers and synchronization primitives
//!
//! Per-frame code talks to the GPU through the [`Driver`] trait so it can be
//! exercised against `testing::MockDriver`.

mod error;

pub mod buffer;
pub mod command;
pub mod deletion;
pub mod descriptor;
pub mod device;
pub mod driver;
pub mod handle;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod render_target;
pub mod shader;
pub mod swapchain;
pub mod sync;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use driver::Driver;
pub use error::{RhiError, RhiResult};
pub use handle::{DescriptorSetHandle, ImageIndex, LayoutHandle, SlotIndex};

pub use ash::vk;
