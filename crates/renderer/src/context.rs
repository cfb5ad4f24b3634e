//! Vulkan bootstrap: instance, window surface and logical device.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::{error, info};

use vesta_platform::{Surface, Window};
use vesta_rhi::device::Device;
use vesta_rhi::instance::{Instance, InstanceDesc};
use vesta_rhi::physical_device::select_physical_device;
use vesta_rhi::{Driver, RhiError, RhiResult};

/// Owns the objects every other GPU resource hangs off.
///
/// Destruction order is device, surface, instance. Everything created from
/// the device (the [`Renderer`](crate::Renderer) included) must be dropped
/// before the context.
pub struct GpuContext {
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,
}

impl GpuContext {
    /// Creates the instance, a surface for `window` and a device that can
    /// present to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the Vulkan loader is missing, the window system
    /// cannot provide a surface, or no GPU can present to it.
    pub fn new(window: &Window, app_name: &str, validation: bool) -> RhiResult<Self> {
        let extensions = window
            .required_extensions()
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let instance = Instance::new(&InstanceDesc {
            app_name: app_name.to_string(),
            validation,
            extensions,
            ..Default::default()
        })?;

        let surface = window
            .create_surface(instance.entry(), instance.handle())
            .map_err(|e| RhiError::SurfaceError(e.to_string()))?;

        let physical_device_info =
            select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &physical_device_info, surface.handle())?;

        info!("GPU context ready on '{}'", physical_device_info.device_name());

        Ok(Self {
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The device as the [`Driver`] consumed by the frame and descriptor code.
    pub fn driver(&self) -> Arc<dyn Driver> {
        let device: Arc<Device> = Arc::clone(&self.device);
        device
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during context drop: {:?}", e);
        }
        if Arc::strong_count(&self.device) > 1 {
            error!("Device still referenced while the GPU context is dropped");
        }

        // SAFETY: each field is dropped exactly once, in dependency order,
        // and never touched again.
        unsafe {
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.instance);
        }
        info!("GPU context destroyed");
    }
}
