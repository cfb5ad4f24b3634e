//! Frame loop orchestration.
//!
//! [`Renderer`] owns the device-scoped rendering state (swapchain, render
//! target, frame slots, descriptor layout cache and descriptor allocator)
//! and decides when the swapchain is rebuilt:
//!
//! - before an acquire, when the window reported a resize or the previous
//!   present said the swapchain is out of date or suboptimal
//! - right after an acquire that reported out-of-date, in which case the
//!   frame is skipped
//!
//! While the window is minimized, recreation blocks on window events until
//! the framebuffer has a non-zero size again.

use std::sync::Arc;

use tracing::{debug, error, info};

use vesta_core::EngineConfig;
use vesta_core::config::{DescriptorConfig, GrowthKind as GrowthKindConfig, PresentModeConfig};
use vesta_platform::WindowEvents;
use vesta_rhi::command::{CommandList, RecordState};
use vesta_rhi::descriptor::{
    DescriptorAllocatorPool, DescriptorKind, GrowthKind, GrowthPolicy, LayoutCache,
};
use vesta_rhi::render_target::{RenderPassDesc, RenderTarget};
use vesta_rhi::swapchain::Swapchain;
use vesta_rhi::{Driver, RhiResult, vk};

use crate::frame_sync::{AcquireOutcome, AcquiredFrame, FrameStatus, FrameSync};

/// Renderer settings resolved from the engine configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RendererDesc {
    pub frames_in_flight: usize,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub growth: GrowthPolicy,
}

impl Default for RendererDesc {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RendererDesc {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            frames_in_flight: config.renderer.frames_in_flight as usize,
            present_mode: present_mode(config.renderer.present_mode),
            clear_color: config.renderer.clear_color,
            growth: growth_policy(&config.descriptors),
        }
    }
}

fn present_mode(mode: PresentModeConfig) -> vk::PresentModeKHR {
    match mode {
        PresentModeConfig::Fifo => vk::PresentModeKHR::FIFO,
        PresentModeConfig::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModeConfig::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

fn growth_policy(config: &DescriptorConfig) -> GrowthPolicy {
    let ratios = &config.pool_ratios;
    GrowthPolicy {
        kind: match config.growth {
            GrowthKindConfig::Fixed => GrowthKind::Fixed,
            GrowthKindConfig::Doubling => GrowthKind::Doubling,
        },
        initial_sets: config.initial_sets,
        max_sets_per_pool: config.max_sets_per_pool,
        max_pools: config.max_pools,
        ratios: vec![
            (DescriptorKind::UniformBuffer, ratios.uniform_buffer),
            (DescriptorKind::StorageBuffer, ratios.storage_buffer),
            (
                DescriptorKind::UniformBufferDynamic,
                ratios.uniform_buffer_dynamic,
            ),
            (
                DescriptorKind::StorageBufferDynamic,
                ratios.storage_buffer_dynamic,
            ),
            (
                DescriptorKind::CombinedImageSampler,
                ratios.combined_image_sampler,
            ),
            (DescriptorKind::SampledImage, ratios.sampled_image),
            (DescriptorKind::StorageImage, ratios.storage_image),
            (DescriptorKind::Sampler, ratios.sampler),
        ],
    }
}

/// Device-scoped rendering state and the per-frame driver.
///
/// Field order is drop order: frame slots and render target before the
/// swapchain, descriptors before the driver reference.
pub struct Renderer {
    frames: FrameSync,
    render_target: RenderTarget,
    swapchain: Swapchain,
    descriptor_allocator: DescriptorAllocatorPool,
    layout_cache: LayoutCache,
    driver: Arc<dyn Driver>,
    clear_color: [f32; 4],
    needs_recreate: bool,
}

impl Renderer {
    /// Creates the swapchain, render target and frame slots for a window of
    /// `extent` pixels.
    ///
    /// # Errors
    ///
    /// Returns an error if `frames_in_flight` is out of range or any GPU
    /// object cannot be created.
    pub fn new(
        driver: Arc<dyn Driver>,
        extent: vk::Extent2D,
        desc: &RendererDesc,
    ) -> RhiResult<Self> {
        info!(
            "Initializing renderer ({}x{}, {} frames in flight)",
            extent.width, extent.height, desc.frames_in_flight
        );

        let frames = FrameSync::new(driver.clone(), desc.frames_in_flight)?;
        let swapchain = Swapchain::new(driver.clone(), desc.present_mode, extent)?;
        let render_target = RenderTarget::new(
            driver.clone(),
            &swapchain,
            RenderPassDesc::single_color(swapchain.format()),
        )?;

        info!(
            "Renderer initialized: {} swapchain images, present mode {:?}",
            swapchain.image_count(),
            swapchain.present_mode()
        );

        Ok(Self {
            frames,
            render_target,
            swapchain,
            descriptor_allocator: DescriptorAllocatorPool::new(driver.clone(), desc.growth.clone()),
            layout_cache: LayoutCache::new(driver.clone()),
            driver,
            clear_color: desc.clear_color,
            needs_recreate: false,
        })
    }

    /// Starts a frame: recreates the swapchain if needed, acquires an image
    /// and begins recording into the slot's command list.
    ///
    /// Returns `None` when no frame can be rendered this iteration: the
    /// swapchain was out of date (and has been recreated), or the window is
    /// closing while minimized.
    ///
    /// # Errors
    ///
    /// Returns any failure other than the recoverable swapchain statuses.
    pub fn begin_frame(
        &mut self,
        window: &mut dyn WindowEvents,
    ) -> RhiResult<Option<AcquiredFrame>> {
        if window.take_framebuffer_resized() {
            self.needs_recreate = true;
        }
        if self.needs_recreate || self.render_target.is_stale(&self.swapchain) {
            self.recreate(window)?;
            if self.needs_recreate {
                return Ok(None);
            }
        }

        match self.frames.acquire_next_image(&self.swapchain)? {
            AcquireOutcome::OutOfDate => {
                self.needs_recreate = true;
                self.recreate(window)?;
                Ok(None)
            }
            AcquireOutcome::Ready(frame) => {
                if frame.is_suboptimal() {
                    self.needs_recreate = true;
                }
                self.frames.command_list(&frame).begin_record()?;
                Ok(Some(frame))
            }
        }
    }

    /// Opens the render pass on the acquired image with the configured clear
    /// color and binds `pipeline`.
    pub fn begin_render_pass(
        &mut self,
        frame: &AcquiredFrame,
        pipeline: vk::Pipeline,
    ) -> RhiResult<&mut CommandList> {
        let clear = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let list = self.frames.command_list(frame);
        list.begin_render_pass(&self.render_target, pipeline, frame.image(), &clear)?;
        Ok(list)
    }

    /// The acquired frame's command list, for recording outside the helpers.
    pub fn command_list(&mut self, frame: &AcquiredFrame) -> &mut CommandList {
        self.frames.command_list(frame)
    }

    /// Ends recording, submits and presents the frame.
    ///
    /// A non-success status schedules recreation before the next acquire.
    pub fn end_frame(&mut self, frame: AcquiredFrame) -> RhiResult<FrameStatus> {
        let list = self.frames.command_list(&frame);
        if list.state() == RecordState::InRenderPass {
            list.end_render_pass()?;
        }
        list.end_record()?;

        let submitted = self.frames.submit_frame(frame)?;
        let status = self.frames.present_frame(&self.swapchain, submitted)?;
        if status.needs_recreate() {
            self.needs_recreate = true;
        }
        Ok(status)
    }

    /// Rebuilds the swapchain and render target for the window's current
    /// size, waiting out a minimized window first.
    ///
    /// Leaves recreation pending if the window is asked to close while
    /// minimized.
    pub fn recreate(&mut self, window: &mut dyn WindowEvents) -> RhiResult<()> {
        let mut extent = window.extent();
        while extent.width == 0 || extent.height == 0 {
            if window.should_close() {
                debug!("Window closed while minimized, skipping recreation");
                return Ok(());
            }
            window.wait_events();
            extent = window.extent();
        }

        self.swapchain.recreate(extent)?;
        self.frames.flush_deferred();
        self.render_target.recreate(&self.swapchain)?;
        // Any resize reported while we were recreating is already covered.
        window.take_framebuffer_resized();
        self.needs_recreate = false;

        info!(
            "Swapchain recreated at {}x{} (generation {})",
            self.swapchain.extent().width,
            self.swapchain.extent().height,
            self.swapchain.generation()
        );
        Ok(())
    }

    /// Layout cache and descriptor allocator, for building descriptor sets.
    pub fn descriptors(&mut self) -> (&mut LayoutCache, &mut DescriptorAllocatorPool) {
        (&mut self.layout_cache, &mut self.descriptor_allocator)
    }

    /// Waits for the device, then resets every descriptor pool.
    ///
    /// All descriptor set handles allocated so far become stale.
    pub fn reset_descriptor_pools(&mut self) -> RhiResult<()> {
        self.frames.wait_idle()?;
        self.descriptor_allocator.reset_pools()
    }

    /// Schedules `destroy` to run once the GPU can no longer be using
    /// anything recorded before this call.
    pub fn defer_destroy(&mut self, destroy: impl FnOnce(&dyn Driver) + Send + 'static) {
        self.frames.defer_destroy(destroy);
    }

    /// Waits for all GPU work and runs every deferred destroy.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.frames.wait_idle()
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    #[inline]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    #[inline]
    pub fn render_target(&self) -> &RenderTarget {
        &self.render_target
    }

    #[inline]
    pub fn frames(&self) -> &FrameSync {
        &self.frames
    }

    #[inline]
    pub fn layout_cache(&self) -> &LayoutCache {
        &self.layout_cache
    }

    #[inline]
    pub fn descriptor_allocator(&self) -> &DescriptorAllocatorPool {
        &self.descriptor_allocator
    }

    /// True when the next [`begin_frame`](Self::begin_frame) will recreate
    /// the swapchain first.
    #[inline]
    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.frames.wait_idle() {
            error!(
                "Failed to wait for device idle during renderer drop: {:?}",
                e
            );
        }
        info!("Renderer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_from_default_config() {
        let desc = RendererDesc::default();
        assert_eq!(desc.frames_in_flight, 2);
        assert_eq!(desc.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(desc.growth, GrowthPolicy::default());
    }

    #[test]
    fn test_desc_from_config_overrides() {
        let config = EngineConfig::from_toml(
            r#"
            [renderer]
            frames_in_flight = 3
            present_mode = "immediate"

            [descriptors]
            growth = "fixed"
            initial_sets = 8
            max_sets_per_pool = 8
            max_pools = 2
            "#,
        )
        .unwrap();

        let desc = RendererDesc::from_config(&config);
        assert_eq!(desc.frames_in_flight, 3);
        assert_eq!(desc.present_mode, vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(desc.growth.kind, GrowthKind::Fixed);
        assert_eq!(desc.growth.sets_for_pool(5), 8);
        assert_eq!(desc.growth.max_pools, 2);
    }
}
