//! Platform layer for the vesta engine.
//!
//! - A winit window polled from the frame loop
//! - The [`WindowEvents`] queries the renderer needs for resize handling
//! - Vulkan surface creation and the instance extensions it requires

mod window;

pub use window::{Surface, Window, WindowEvents};
