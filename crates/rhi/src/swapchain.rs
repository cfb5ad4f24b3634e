//! Swapchain management.
//!
//! This module handles swapchain creation, recreation, image acquisition and
//! presentation.
//!
//! # Overview
//!
//! The [`Swapchain`] is the single source of truth for the presentable
//! images. Every successful [`Swapchain::recreate`] bumps a monotonically
//! increasing [`generation`](Swapchain::generation); dependents such as the
//! render target remember the generation they were built against and rebuild
//! when it no longer matches, instead of being notified.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use vesta_rhi::Driver;
//! use vesta_rhi::swapchain::Swapchain;
//!
//! # fn example(driver: Arc<dyn Driver>) -> Result<(), vesta_rhi::RhiError> {
//! let extent = vk::Extent2D { width: 800, height: 600 };
//! let mut swapchain = Swapchain::new(driver, vk::PresentModeKHR::FIFO, extent)?;
//! let before = swapchain.generation();
//!
//! // After the window reports a resize:
//! swapchain.recreate(vk::Extent2D { width: 1024, height: 768 })?;
//! assert_eq!(swapchain.generation(), before + 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::driver::{Driver, SurfaceSupport, SwapchainDesc};
use crate::error::{RhiError, RhiResult};
use crate::handle::ImageIndex;

/// Swapchain wrapper.
pub struct Swapchain {
    driver: Arc<dyn Driver>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    requested_present_mode: vk::PresentModeKHR,
    generation: u64,
}

impl Swapchain {
    /// Creates a new swapchain.
    ///
    /// # Arguments
    ///
    /// * `driver` - The device owning the window surface
    /// * `present_mode` - Preferred present mode; FIFO is used if unsupported
    /// * `extent` - Framebuffer size, used when the surface leaves it to us
    ///
    /// # Errors
    ///
    /// Returns an error if the surface offers no formats or present modes,
    /// the extent is zero, or swapchain creation fails.
    pub fn new(
        driver: Arc<dyn Driver>,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let mut swapchain = Self {
            driver,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            surface_format: vk::SurfaceFormatKHR::default(),
            extent,
            present_mode,
            requested_present_mode: present_mode,
            generation: 0,
        };
        swapchain.build(extent)?;
        Ok(swapchain)
    }

    /// Rebuilds the swapchain for a new framebuffer size.
    ///
    /// Waits for the device to go idle first, so no in-flight frame can still
    /// reference the images being replaced. The old swapchain is handed to
    /// the driver for resource reuse and destroyed afterwards.
    ///
    /// # Errors
    ///
    /// On error the swapchain is left without images and must not be used
    /// until a later `recreate` succeeds.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        self.driver.wait_idle()?;

        info!(
            "Recreating swapchain for new size: {}x{}",
            extent.width, extent.height
        );

        self.destroy_image_views();
        self.build(extent)?;
        self.generation += 1;

        debug!("Swapchain generation is now {}", self.generation);
        Ok(())
    }

    fn build(&mut self, requested_extent: vk::Extent2D) -> RhiResult<()> {
        let support = self.driver.surface_support()?;

        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let desc = resolve_desc(
            &support,
            self.requested_present_mode,
            requested_extent,
            self.swapchain,
        );

        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::SwapchainError(
                "Cannot create a swapchain with a zero-sized extent".to_string(),
            ));
        }

        info!(
            "Creating swapchain: {}x{}, format {:?}, color space {:?}, present mode {:?}, {} images",
            desc.extent.width,
            desc.extent.height,
            desc.surface_format.format,
            desc.surface_format.color_space,
            desc.present_mode,
            desc.image_count
        );

        let new_swapchain = self.driver.create_swapchain(&desc)?;

        let old_swapchain = std::mem::replace(&mut self.swapchain, new_swapchain);
        if old_swapchain != vk::SwapchainKHR::null() {
            self.driver.destroy_swapchain(old_swapchain);
        }

        self.images = self.driver.swapchain_images(new_swapchain)?;
        self.surface_format = desc.surface_format;
        self.extent = desc.extent;
        self.present_mode = desc.present_mode;

        let mut image_views = Vec::with_capacity(self.images.len());
        for (i, &image) in self.images.iter().enumerate() {
            let view = self
                .driver
                .create_image_view(image, desc.surface_format.format)
                .map_err(|e| {
                    RhiError::SwapchainError(format!("Failed to create image view {}: {}", i, e))
                })?;
            image_views.push(view);
        }
        self.image_views = image_views;

        info!("Swapchain created with {} images", self.images.len());
        Ok(())
    }

    /// Acquires the next presentable image, signaling `semaphore` when it is ready.
    ///
    /// Returns the image index and whether the swapchain is suboptimal. The raw
    /// Vulkan result is returned on failure so `ERROR_OUT_OF_DATE_KHR` can be
    /// handled by recreation.
    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
    ) -> Result<(ImageIndex, bool), vk::Result> {
        self.driver
            .acquire_next_image(self.swapchain, semaphore, u64::MAX)
            .map(|(index, suboptimal)| (ImageIndex::new(index), suboptimal))
    }

    /// Queues `image` for presentation once `wait_semaphore` is signaled.
    ///
    /// Returns whether the swapchain is suboptimal, or the raw Vulkan result.
    pub fn present(
        &self,
        image: ImageIndex,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        self.driver
            .queue_present(self.swapchain, image.get(), wait_semaphore)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    #[inline]
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    #[inline]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Number of successful recreations since creation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn destroy_image_views(&mut self) {
        for view in self.image_views.drain(..) {
            self.driver.destroy_image_view(view);
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_image_views();

        if self.swapchain != vk::SwapchainKHR::null() {
            self.driver.destroy_swapchain(self.swapchain);
            info!(
                "Swapchain destroyed (was {}x{}, {} images)",
                self.extent.width,
                self.extent.height,
                self.images.len()
            );
        }
    }
}

fn resolve_desc(
    support: &SurfaceSupport,
    requested_present_mode: vk::PresentModeKHR,
    requested_extent: vk::Extent2D,
    old_swapchain: vk::SwapchainKHR,
) -> SwapchainDesc {
    SwapchainDesc {
        image_count: determine_image_count(&support.capabilities),
        surface_format: choose_surface_format(&support.formats),
        extent: choose_extent(&support.capabilities, requested_extent),
        present_mode: choose_present_mode(&support.present_modes, requested_present_mode),
        pre_transform: support.capabilities.current_transform,
        old_swapchain,
    }
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let srgb = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    if let Some(&format) = srgb {
        return format;
    }

    let unorm = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    if let Some(&format) = unorm {
        warn!("Using fallback surface format: B8G8R8A8_UNORM with SRGB_NONLINEAR");
        return format;
    }

    // Callers check SurfaceSupport::is_adequate first.
    let first = formats.first().copied().unwrap_or_default();
    warn!("Using first available surface format: {:?}", first.format);
    first
}

fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        return requested;
    }

    // FIFO is the only mode every implementation must support.
    warn!(
        "Present mode {:?} unsupported, falling back to FIFO",
        requested
    );
    vk::PresentModeKHR::FIFO
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;

    // max_image_count of 0 means no upper limit
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_choose_surface_format_prefers_srgb() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats);
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_choose_surface_format_fallbacks() {
        let unorm = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&unorm).format,
            vk::Format::B8G8R8A8_UNORM
        );

        let other = vec![vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            choose_surface_format(&other).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn test_choose_present_mode_honors_request() {
        let modes = vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::FIFO),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_present_mode_fallback_to_fifo() {
        let modes = vec![vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_choose_extent_uses_current() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(1920, 1080),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(4096, 4096),
            ..Default::default()
        };

        assert_eq!(choose_extent(&capabilities, extent(800, 600)), extent(1920, 1080));
    }

    #[test]
    fn test_choose_extent_clamps_to_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(100, 100),
            max_image_extent: extent(2000, 2000),
            ..Default::default()
        };

        assert_eq!(choose_extent(&capabilities, extent(3000, 3000)), extent(2000, 2000));
        assert_eq!(choose_extent(&capabilities, extent(50, 50)), extent(100, 100));
        assert_eq!(choose_extent(&capabilities, extent(800, 600)), extent(800, 600));
    }

    #[test]
    fn test_determine_image_count() {
        let capped = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capped), 2);

        let roomy = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&roomy), 3);

        let unlimited = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&unlimited), 3);
    }

    #[test]
    fn test_new_swapchain_has_views_for_every_image() {
        let mock = Arc::new(MockDriver::new());
        let swapchain =
            Swapchain::new(mock.clone(), vk::PresentModeKHR::FIFO, extent(800, 600)).unwrap();

        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.image_views().len(), 3);
        assert_eq!(swapchain.generation(), 0);
        assert_eq!(swapchain.format(), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(mock.live("image_view"), 3);
    }

    #[test]
    fn test_recreate_bumps_generation_and_replaces_resources() {
        let mock = Arc::new(MockDriver::new());
        let mut swapchain =
            Swapchain::new(mock.clone(), vk::PresentModeKHR::MAILBOX, extent(800, 600)).unwrap();
        let old_handle = swapchain.handle();

        mock.set_surface_extent(1024, 768);
        mock.set_image_count(2);
        swapchain.recreate(extent(1024, 768)).unwrap();

        assert_eq!(swapchain.generation(), 1);
        assert_ne!(swapchain.handle(), old_handle);
        assert_eq!(swapchain.extent(), extent(1024, 768));
        assert_eq!(swapchain.image_count(), 2);
        assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(mock.wait_idle_calls(), 1);
        assert_eq!(mock.live("swapchain"), 1);
        assert_eq!(mock.live("image_view"), 2);
    }

    #[test]
    fn test_zero_extent_is_rejected() {
        let mock = Arc::new(MockDriver::new());
        let mut swapchain =
            Swapchain::new(mock.clone(), vk::PresentModeKHR::FIFO, extent(800, 600)).unwrap();

        mock.set_surface_extent(0, 0);
        let result = swapchain.recreate(extent(0, 0));
        assert!(matches!(result, Err(RhiError::SwapchainError(_))));
        assert_eq!(swapchain.generation(), 0);
    }

    #[test]
    fn test_drop_releases_everything() {
        let mock = Arc::new(MockDriver::new());
        {
            let mut swapchain =
                Swapchain::new(mock.clone(), vk::PresentModeKHR::FIFO, extent(800, 600)).unwrap();
            swapchain.recreate(extent(800, 600)).unwrap();
        }
        assert_eq!(mock.total_live(), 0);
    }
}
