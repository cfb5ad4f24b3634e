//! Window management using winit.
//!
//! The frame loop owns the event loop and polls it once per frame instead of
//! handing control to winit, so [`Window`] drives winit through
//! `pump_app_events`.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window as WinitWindow, WindowAttributes, WindowId};

use vesta_core::config::WindowConfig;
use vesta_core::{Error, Result};

/// Window-system queries the frame loop depends on.
pub trait WindowEvents {
    /// True once the user asked to close the window.
    fn should_close(&self) -> bool;

    /// Process pending events without blocking.
    fn poll_events(&mut self);

    /// Returns whether the framebuffer was resized since the last call, and
    /// clears the flag.
    fn take_framebuffer_resized(&mut self) -> bool;

    /// Current framebuffer size in pixels. Zero in either dimension while
    /// minimized.
    fn extent(&self) -> vk::Extent2D;

    /// Block until at least one event arrives.
    fn wait_events(&mut self);
}

/// RAII wrapper for a Vulkan surface.
///
/// The instance the surface was created from must outlive it.
pub struct Surface {
    handle: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
}

impl Surface {
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        // SAFETY: the handle was created by ash_window::create_surface from the
        // loader's instance, and this is the only place it is destroyed.
        unsafe {
            self.surface_loader.destroy_surface(self.handle, None);
        }
        tracing::debug!("Vulkan surface destroyed");
    }
}

/// Event state collected by the winit callbacks between polls.
struct WindowState {
    attributes: WindowAttributes,
    window: Option<Arc<WinitWindow>>,
    extent: vk::Extent2D,
    close_requested: bool,
    framebuffer_resized: bool,
    error: Option<String>,
}

impl WindowState {
    fn on_event(&mut self, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("Close requested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                let extent = vk::Extent2D {
                    width: size.width,
                    height: size.height,
                };
                if extent != self.extent {
                    tracing::debug!("Window resized: {}x{}", size.width, size.height);
                    self.extent = extent;
                    self.framebuffer_resized = true;
                }
            }
            WindowEvent::KeyboardInput { event, .. }
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape) =>
            {
                self.close_requested = true;
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                let size = window.inner_size();
                self.extent = vk::Extent2D {
                    width: size.width,
                    height: size.height,
                };
                tracing::info!("Window created: {}x{}", size.width, size.height);
                self.window = Some(Arc::new(window));
            }
            Err(e) => self.error = Some(e.to_string()),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        self.on_event(event);
    }
}

/// A window plus the event loop that feeds it.
pub struct Window {
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl Window {
    /// Upper bound on event-loop pumps spent waiting for the window to appear.
    const CREATE_ATTEMPTS: usize = 64;

    /// Opens a resizable window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Window`] if the event loop or the window cannot be created.
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new().map_err(|e| Error::Window(e.to_string()))?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let attributes = WindowAttributes::default()
            .with_title(config.title.as_str())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(true);

        let mut window = Self {
            event_loop,
            state: WindowState {
                attributes,
                window: None,
                extent: vk::Extent2D {
                    width: config.width,
                    height: config.height,
                },
                close_requested: false,
                framebuffer_resized: false,
                error: None,
            },
        };

        for _ in 0..Self::CREATE_ATTEMPTS {
            window.pump(Some(Duration::ZERO));
            if let Some(e) = window.state.error.take() {
                return Err(Error::Window(e));
            }
            if window.state.window.is_some() {
                // Creation may have queued a resize; that is not a resize of a live swapchain.
                window.state.framebuffer_resized = false;
                return Ok(window);
            }
        }

        Err(Error::Window("event loop never resumed".to_string()))
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            tracing::debug!("Event loop exited with code {}", code);
            self.state.close_requested = true;
        }
    }

    fn inner(&self) -> Result<&WinitWindow> {
        self.state
            .window
            .as_deref()
            .ok_or_else(|| Error::Window("window not created".to_string()))
    }

    /// Instance extensions needed to create a surface for this window.
    ///
    /// # Errors
    ///
    /// Returns an error if the display handle is unavailable or the window
    /// system has no Vulkan support.
    pub fn required_extensions(&self) -> Result<Vec<*const std::ffi::c_char>> {
        let display_handle = self
            .inner()?
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;

        let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
            .map_err(|e| Error::Vulkan(format!("Failed to enumerate required extensions: {}", e)))?;

        tracing::debug!(
            "Required Vulkan extensions for surface: {:?}",
            extensions
                .iter()
                // SAFETY: ash_window returns pointers to static nul-terminated names.
                .map(|&ext| unsafe { std::ffi::CStr::from_ptr(ext) })
                .collect::<Vec<_>>()
        );

        Ok(extensions.to_vec())
    }

    /// Creates a Vulkan surface for this window.
    ///
    /// # Errors
    ///
    /// Returns an error if the window handles are unavailable or surface
    /// creation fails.
    pub fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> Result<Surface> {
        let window = self.inner()?;
        let display_handle = window
            .display_handle()
            .map_err(|e| Error::Window(format!("Failed to get display handle: {}", e)))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| Error::Window(format!("Failed to get window handle: {}", e)))?;

        // SAFETY: entry and instance are valid, and the handles come from a
        // live winit window. Surface::drop destroys the result.
        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| Error::Vulkan(format!("Failed to create Vulkan surface: {}", e)))?
        };

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);
        tracing::info!("Vulkan surface created");

        Ok(Surface {
            handle,
            surface_loader,
        })
    }

    pub fn set_title(&self, title: &str) {
        if let Some(window) = &self.state.window {
            window.set_title(title);
        }
    }
}

impl WindowEvents for Window {
    fn should_close(&self) -> bool {
        self.state.close_requested
    }

    fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn take_framebuffer_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.framebuffer_resized)
    }

    fn extent(&self) -> vk::Extent2D {
        self.state.extent
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }
}
