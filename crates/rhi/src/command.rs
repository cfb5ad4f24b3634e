//! Command pool and command list management.
//!
//! # Overview
//!
//! - [`CommandPool`] owns a `VkCommandPool` on the graphics queue family and
//!   allocates command lists from it
//! - [`CommandList`] wraps one primary command buffer and tracks its
//!   recording state, rejecting out-of-order calls
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use vesta_rhi::{Driver, ImageIndex};
//! use vesta_rhi::command::CommandPool;
//! use vesta_rhi::render_target::RenderTarget;
//!
//! # fn example(
//! #     driver: Arc<dyn Driver>,
//! #     target: &RenderTarget,
//! #     pipeline: vk::Pipeline,
//! #     image: ImageIndex,
//! # ) -> Result<(), vesta_rhi::RhiError> {
//! let pool = CommandPool::new(driver)?;
//! let mut lists = pool.allocate_lists(1)?;
//! let list = &mut lists[0];
//!
//! let clear = vk::ClearValue {
//!     color: vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 1.0] },
//! };
//! list.begin_record()?;
//! list.begin_render_pass(target, pipeline, image, &[clear])?;
//! list.draw(3, 1, 0, 0);
//! list.end_render_pass()?;
//! list.end_record()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::driver::Driver;
use crate::error::{RhiError, RhiResult};
use crate::handle::{DescriptorSetHandle, ImageIndex};
use crate::render_target::RenderTarget;

/// Command pool on the graphics queue family.
///
/// Created with `RESET_COMMAND_BUFFER`, so lists can be re-recorded one by
/// one. Dropping the pool frees every list allocated from it; lists must not
/// outlive their pool.
pub struct CommandPool {
    driver: Arc<dyn Driver>,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Creates a resettable command pool.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(driver: Arc<dyn Driver>) -> RhiResult<Self> {
        let pool = driver.create_command_pool()?;
        debug!("Command pool created");
        Ok(Self { driver, pool })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocates `count` primary command lists.
    pub fn allocate_lists(&self, count: u32) -> RhiResult<Vec<CommandList>> {
        let buffers = self.driver.allocate_command_buffers(self.pool, count)?;
        Ok(buffers
            .into_iter()
            .map(|buffer| CommandList::from_handle(self.driver.clone(), buffer))
            .collect())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.driver.destroy_command_pool(self.pool);
    }
}

/// Recording state of a [`CommandList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    /// Allocated or reset, nothing recorded.
    Initial,
    Recording,
    /// Recording, with a render pass open.
    InRenderPass,
    /// Recording finished; ready to submit.
    Executable,
}

/// A primary command buffer with guarded recording.
///
/// [`begin_record`](Self::begin_record), [`end_record`](Self::end_record)
/// and the render pass bracket return [`RhiError::InvalidState`] when called
/// out of order. The draw-time helpers assume a recording list and are not
/// checked in release builds.
pub struct CommandList {
    driver: Arc<dyn Driver>,
    buffer: vk::CommandBuffer,
    state: RecordState,
}

impl CommandList {
    /// Wraps a command buffer allocated elsewhere.
    pub fn from_handle(driver: Arc<dyn Driver>, buffer: vk::CommandBuffer) -> Self {
        Self {
            driver,
            buffer,
            state: RecordState::Initial,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    #[inline]
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Whether recording has finished and the list can be submitted.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.state == RecordState::Executable
    }

    fn is_recording(&self) -> bool {
        matches!(
            self.state,
            RecordState::Recording | RecordState::InRenderPass
        )
    }

    fn expect_state(&self, expected: RecordState, operation: &str) -> RhiResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RhiError::InvalidState(format!(
                "{} requires {:?}, command list is {:?}",
                operation, expected, self.state
            )))
        }
    }

    // =========================================================================
    // Recording lifecycle
    // =========================================================================

    /// Resets the buffer and begins one-time-submit recording.
    ///
    /// The caller must know the GPU is done with the previous recording,
    /// normally by waiting on the owning frame slot's fence.
    pub fn begin_record(&mut self) -> RhiResult<()> {
        if self.is_recording() {
            return Err(RhiError::InvalidState(format!(
                "begin_record while {:?}",
                self.state
            )));
        }
        self.driver.reset_command_buffer(self.buffer)?;
        self.driver
            .begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.state = RecordState::Recording;
        Ok(())
    }

    /// Finishes recording.
    pub fn end_record(&mut self) -> RhiResult<()> {
        self.expect_state(RecordState::Recording, "end_record")?;
        self.driver.end_command_buffer(self.buffer)?;
        self.state = RecordState::Executable;
        Ok(())
    }

    // =========================================================================
    // Render pass
    // =========================================================================

    /// Opens the target's render pass on the framebuffer of `image`.
    ///
    /// Also binds `pipeline` and sets the viewport and scissor to the whole
    /// target, since pipelines keep both as dynamic state.
    pub fn begin_render_pass(
        &mut self,
        target: &RenderTarget,
        pipeline: vk::Pipeline,
        image: ImageIndex,
        clear_values: &[vk::ClearValue],
    ) -> RhiResult<()> {
        self.expect_state(RecordState::Recording, "begin_render_pass")?;
        let framebuffer = target.framebuffer(image)?;

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(target.render_pass())
            .framebuffer(framebuffer)
            .render_area(target.render_area())
            .clear_values(clear_values);

        self.driver.cmd_begin_render_pass(self.buffer, &begin_info);
        self.state = RecordState::InRenderPass;

        self.bind_pipeline(pipeline);
        let extent = target.extent();
        self.set_viewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        self.set_scissor(target.render_area());
        Ok(())
    }

    /// Closes the open render pass.
    pub fn end_render_pass(&mut self) -> RhiResult<()> {
        self.expect_state(RecordState::InRenderPass, "end_render_pass")?;
        self.driver.cmd_end_render_pass(self.buffer);
        self.state = RecordState::Recording;
        Ok(())
    }

    // =========================================================================
    // Draw-time helpers
    // =========================================================================

    /// Binds a graphics pipeline.
    pub fn bind_pipeline(&self, pipeline: vk::Pipeline) {
        debug_assert!(self.is_recording(), "bind_pipeline outside recording");
        self.driver
            .cmd_bind_pipeline(self.buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
    }

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        debug_assert!(self.is_recording(), "set_viewport outside recording");
        self.driver.cmd_set_viewport(self.buffer, &[viewport]);
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        debug_assert!(self.is_recording(), "set_scissor outside recording");
        self.driver.cmd_set_scissor(self.buffer, &[scissor]);
    }

    /// Binds descriptor sets for graphics, starting at set `first_set`.
    pub fn bind_descriptor_sets(
        &self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        debug_assert!(self.is_recording(), "bind_descriptor_sets outside recording");
        let raw: Vec<vk::DescriptorSet> = sets.iter().map(|set| set.raw()).collect();
        self.driver.cmd_bind_descriptor_sets(
            self.buffer,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            first_set,
            &raw,
        );
    }

    /// Updates push constant data.
    ///
    /// # Arguments
    ///
    /// * `layout` - Pipeline layout declaring the push constant range
    /// * `stages` - Shader stages that read the range
    /// * `offset` - Byte offset into the range
    /// * `data` - Plain-old-data value to upload
    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &T,
    ) {
        debug_assert!(self.is_recording(), "push_constants outside recording");
        self.driver.cmd_push_constants(
            self.buffer,
            layout,
            stages,
            offset,
            bytemuck::bytes_of(data),
        );
    }

    pub fn bind_vertex_buffers(
        &self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        debug_assert!(self.is_recording(), "bind_vertex_buffers outside recording");
        self.driver
            .cmd_bind_vertex_buffers(self.buffer, first_binding, buffers, offsets);
    }

    /// Issues a non-indexed draw. Must be inside a render pass.
    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        debug_assert!(
            self.state == RecordState::InRenderPass,
            "draw outside render pass"
        );
        self.driver.cmd_draw(
            self.buffer,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_target::RenderPassDesc;
    use crate::swapchain::Swapchain;
    use crate::testing::{MockDriver, RecordedCommand};
    use ash::vk::Handle;

    fn list(mock: &Arc<MockDriver>) -> (CommandPool, CommandList) {
        let pool = CommandPool::new(mock.clone()).unwrap();
        let list = pool.allocate_lists(1).unwrap().remove(0);
        (pool, list)
    }

    #[test]
    fn test_command_list_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandList>();
        assert_send::<CommandPool>();
    }

    #[test]
    fn test_record_lifecycle() {
        let mock = Arc::new(MockDriver::new());
        let (_pool, mut list) = list(&mock);
        assert_eq!(list.state(), RecordState::Initial);

        list.begin_record().unwrap();
        assert_eq!(list.state(), RecordState::Recording);
        list.end_record().unwrap();
        assert!(list.is_executable());

        // Re-recording an executed list is allowed.
        list.begin_record().unwrap();
        list.end_record().unwrap();
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let mock = Arc::new(MockDriver::new());
        let (_pool, mut list) = list(&mock);

        assert!(matches!(list.end_record(), Err(RhiError::InvalidState(_))));
        assert!(matches!(list.end_render_pass(), Err(RhiError::InvalidState(_))));

        list.begin_record().unwrap();
        assert!(matches!(list.begin_record(), Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_render_pass_uses_image_framebuffer() {
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
        let target = RenderTarget::new(
            mock.clone(),
            &swapchain,
            RenderPassDesc::single_color(swapchain.format()),
        )
        .unwrap();
        let (_pool, mut list) = list(&mock);
        let pipeline = vk::Pipeline::from_raw(0x99);
        let image = ImageIndex::new(1);

        list.begin_record().unwrap();
        list.begin_render_pass(&target, pipeline, image, &[]).unwrap();
        // Ending recording with an open pass is an error.
        assert!(matches!(list.end_record(), Err(RhiError::InvalidState(_))));
        list.draw(3, 1, 0, 0);
        list.end_render_pass().unwrap();
        list.end_record().unwrap();

        let commands = mock.commands();
        assert_eq!(
            commands[0],
            RecordedCommand::BeginRenderPass {
                command_buffer: list.handle(),
                render_pass: target.render_pass(),
                framebuffer: target.framebuffer(image).unwrap(),
            }
        );
        assert!(commands.contains(&RecordedCommand::BindPipeline {
            command_buffer: list.handle(),
            pipeline,
        }));
        assert!(commands.contains(&RecordedCommand::Draw {
            command_buffer: list.handle(),
            vertex_count: 3,
        }));
    }

    #[test]
    fn test_push_constants_size() {
        let mock = Arc::new(MockDriver::new());
        let (_pool, mut list) = list(&mock);
        list.begin_record().unwrap();
        list.push_constants(
            vk::PipelineLayout::null(),
            vk::ShaderStageFlags::VERTEX,
            0,
            &[1.0f32, 0.5, 0.25, 1.0],
        );
        assert_eq!(
            mock.commands(),
            vec![RecordedCommand::PushConstants {
                command_buffer: list.handle(),
                size: 16,
            }]
        );
    }
}
