//! Render pass and per-image framebuffers.
//!
//! A [`RenderTarget`] owns one render pass and one framebuffer per swapchain
//! image. It records the swapchain generation it was built against; after
//! the swapchain is recreated, [`RenderTarget::is_stale`] turns true and
//! [`RenderTarget::recreate`] rebuilds the framebuffers.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::error::{RhiError, RhiResult};
use crate::handle::ImageIndex;
use crate::swapchain::Swapchain;

/// Attachments, color references and dependencies of a single-subpass
/// render pass.
#[derive(Clone, Debug)]
pub struct RenderPassDesc {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub color_refs: Vec<vk::AttachmentReference>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPassDesc {
    /// One color attachment that is cleared, stored and handed to present.
    pub fn single_color(format: vk::Format) -> Self {
        let attachment = vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        // The acquire semaphore is waited on at color output, so the layout
        // transition must not start earlier.
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        Self {
            attachments: vec![attachment],
            color_refs: vec![color_ref],
            dependencies: vec![dependency],
        }
    }

    /// Format of the first attachment, which receives the swapchain image.
    pub fn color_format(&self) -> Option<vk::Format> {
        self.attachments.first().map(|a| a.format)
    }

    fn set_color_format(&mut self, format: vk::Format) {
        if let Some(attachment) = self.attachments.first_mut() {
            attachment.format = format;
        }
    }

    fn create(&self, driver: &dyn Driver) -> RhiResult<vk::RenderPass> {
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&self.color_refs);

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&self.attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&self.dependencies);

        driver.create_render_pass(&create_info)
    }
}

/// Render pass plus framebuffers for every swapchain image.
pub struct RenderTarget {
    driver: Arc<dyn Driver>,
    desc: RenderPassDesc,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    generation: u64,
    render_pass_generation: u64,
    recreate_count: u64,
}

impl RenderTarget {
    /// Creates the render pass and framebuffers for the swapchain's images.
    ///
    /// The first attachment of `desc` is retargeted to the swapchain format.
    pub fn new(
        driver: Arc<dyn Driver>,
        swapchain: &Swapchain,
        mut desc: RenderPassDesc,
    ) -> RhiResult<Self> {
        desc.set_color_format(swapchain.format());
        let render_pass = desc.create(driver.as_ref())?;

        let mut target = Self {
            driver,
            desc,
            render_pass,
            framebuffers: Vec::new(),
            extent: swapchain.extent(),
            generation: swapchain.generation(),
            render_pass_generation: 0,
            recreate_count: 0,
        };
        target.build_framebuffers(swapchain)?;

        info!(
            "Render target created: {} framebuffers, {}x{}",
            target.framebuffers.len(),
            target.extent.width,
            target.extent.height
        );
        Ok(target)
    }

    /// Rebuilds the framebuffers against the current swapchain images.
    ///
    /// Call after [`Swapchain::recreate`] and before the next acquire. The
    /// render pass is only rebuilt if the swapchain format changed; that
    /// bumps [`render_pass_generation`](Self::render_pass_generation) and
    /// pipelines built against the old pass must be rebuilt.
    pub fn recreate(&mut self, swapchain: &Swapchain) -> RhiResult<()> {
        self.destroy_framebuffers();

        if self.desc.color_format() != Some(swapchain.format()) {
            warn!(
                "Swapchain format changed to {:?}, rebuilding render pass; \
                 pipelines using the old pass must be rebuilt",
                swapchain.format()
            );
            self.desc.set_color_format(swapchain.format());
            let render_pass = self.desc.create(self.driver.as_ref())?;
            self.driver.destroy_render_pass(self.render_pass);
            self.render_pass = render_pass;
            self.render_pass_generation += 1;
        }

        self.extent = swapchain.extent();
        self.build_framebuffers(swapchain)?;
        self.generation = swapchain.generation();
        self.recreate_count += 1;

        debug!(
            "Render target rebuilt for swapchain generation {}",
            self.generation
        );
        Ok(())
    }

    /// Whether the swapchain was recreated since this target was built.
    pub fn is_stale(&self, swapchain: &Swapchain) -> bool {
        self.generation != swapchain.generation()
    }

    /// Framebuffer wrapping the swapchain image at `image`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidHandle`] if `image` is out of range.
    pub fn framebuffer(&self, image: ImageIndex) -> RhiResult<vk::Framebuffer> {
        self.framebuffers
            .get(image.as_usize())
            .copied()
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!(
                    "{} out of range ({} framebuffers)",
                    image,
                    self.framebuffers.len()
                ))
            })
    }

    #[inline]
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// The whole framebuffer area.
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    /// Swapchain generation the framebuffers were built against.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Incremented each time the render pass is replaced. Pipelines compare
    /// it with the value they were built against.
    pub fn render_pass_generation(&self) -> u64 {
        self.render_pass_generation
    }

    /// Number of successful [`recreate`](Self::recreate) calls.
    pub fn recreate_count(&self) -> u64 {
        self.recreate_count
    }

    fn build_framebuffers(&mut self, swapchain: &Swapchain) -> RhiResult<()> {
        let mut framebuffers = Vec::with_capacity(swapchain.image_views().len());
        for &view in swapchain.image_views() {
            match self
                .driver
                .create_framebuffer(self.render_pass, &[view], swapchain.extent())
            {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    for framebuffer in framebuffers {
                        self.driver.destroy_framebuffer(framebuffer);
                    }
                    return Err(e);
                }
            }
        }
        self.framebuffers = framebuffers;
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.driver.destroy_framebuffer(framebuffer);
        }
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        self.destroy_framebuffers();
        self.driver.destroy_render_pass(self.render_pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    fn setup() -> (Arc<MockDriver>, Swapchain) {
        let mock = Arc::new(MockDriver::new());
        let swapchain = Swapchain::new(
            mock.clone(),
            vk::PresentModeKHR::FIFO,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        )
        .unwrap();
        (mock, swapchain)
    }

    #[test]
    fn test_single_color_desc() {
        let desc = RenderPassDesc::single_color(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(desc.attachments.len(), 1);
        assert_eq!(desc.attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(desc.attachments[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(desc.attachments[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            desc.attachments[0].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(desc.dependencies[0].src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(desc.dependencies[0].dst_subpass, 0);
        assert_eq!(desc.color_format(), Some(vk::Format::B8G8R8A8_SRGB));
    }

    #[test]
    fn test_one_framebuffer_per_image() {
        let (mock, swapchain) = setup();
        let target = RenderTarget::new(
            mock.clone(),
            &swapchain,
            RenderPassDesc::single_color(swapchain.format()),
        )
        .unwrap();

        assert_eq!(target.framebuffer_count(), swapchain.image_count() as usize);
        assert_eq!(mock.live("framebuffer"), 3);
        assert!(target.framebuffer(ImageIndex::new(2)).is_ok());
        assert!(matches!(
            target.framebuffer(ImageIndex::new(3)),
            Err(RhiError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_stale_after_swapchain_recreate() {
        let (mock, mut swapchain) = setup();
        let mut target = RenderTarget::new(
            mock.clone(),
            &swapchain,
            RenderPassDesc::single_color(swapchain.format()),
        )
        .unwrap();
        assert!(!target.is_stale(&swapchain));

        mock.set_surface_extent(1024, 768);
        mock.set_image_count(4);
        swapchain
            .recreate(vk::Extent2D {
                width: 1024,
                height: 768,
            })
            .unwrap();
        assert!(target.is_stale(&swapchain));

        let render_pass = target.render_pass();
        target.recreate(&swapchain).unwrap();
        assert!(!target.is_stale(&swapchain));
        assert_eq!(target.recreate_count(), 1);
        assert_eq!(target.framebuffer_count(), 4);
        assert_eq!(mock.live("framebuffer"), 4);
        assert_eq!(target.extent().width, 1024);
        // Same format, so the render pass survives.
        assert_eq!(target.render_pass(), render_pass);
        assert_eq!(target.render_pass_generation(), 0);
    }

    #[test]
    fn test_format_change_replaces_render_pass() {
        let (mock, mut swapchain) = setup();
        let mut target = RenderTarget::new(
            mock.clone(),
            &swapchain,
            RenderPassDesc::single_color(swapchain.format()),
        )
        .unwrap();
        let old_pass = target.render_pass();

        mock.set_surface_formats(vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }]);
        swapchain
            .recreate(vk::Extent2D {
                width: 800,
                height: 600,
            })
            .unwrap();
        target.recreate(&swapchain).unwrap();

        assert_ne!(target.render_pass(), old_pass);
        assert_eq!(target.render_pass_generation(), 1);
        assert_eq!(mock.live("render_pass"), 1);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (mock, swapchain) = setup();
        {
            let _target = RenderTarget::new(
                mock.clone(),
                &swapchain,
                RenderPassDesc::single_color(swapchain.format()),
            )
            .unwrap();
        }
        assert_eq!(mock.live("framebuffer"), 0);
        assert_eq!(mock.live("render_pass"), 0);
    }
}
