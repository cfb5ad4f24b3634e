//! A scripted, GPU-less [`Driver`] for tests.
//!
//! `MockDriver` mints handles from a counter, keeps just enough state to
//! behave like a device (fence signal state, pool capacity, swapchain
//! images) and records every call a test may want to assert on.
//!
//! The GPU is modelled as infinitely fast: a submitted fence is signaled
//! immediately. Waiting on an unsignaled fence that nothing will signal
//! returns `ERROR_TIMEOUT` instead of hanging, which turns a deadlocked frame
//! protocol into a test failure.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use ash::vk::{self, Handle};

use crate::driver::{Driver, FrameSubmit, SurfaceSupport, SwapchainDesc};
use crate::error::{RhiError, RhiResult};

/// A command recorded into a command buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCommand {
    BeginRenderPass {
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass {
        command_buffer: vk::CommandBuffer,
    },
    BindPipeline {
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        command_buffer: vk::CommandBuffer,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        command_buffer: vk::CommandBuffer,
        size: usize,
    },
    Draw {
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
    },
}

/// A present call as observed by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentCall {
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphore: vk::Semaphore,
}

#[derive(Debug)]
struct PoolState {
    max_sets: u32,
    allocated: u32,
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    live: HashMap<&'static str, i64>,

    fences: HashMap<vk::Fence, bool>,
    fence_waits: u64,
    wait_idle_calls: u64,

    surface_extent: vk::Extent2D,
    surface_formats: Vec<vk::SurfaceFormatKHR>,
    image_count: u32,
    swapchains_created: u64,
    swapchain_images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: HashMap<vk::SwapchainKHR, u32>,
    acquire_script: VecDeque<Result<(u32, bool), vk::Result>>,
    present_script: VecDeque<Result<bool, vk::Result>>,
    acquire_calls: u64,
    presents: Vec<PresentCall>,

    submits: Vec<FrameSubmit>,
    fail_next_submit: Option<vk::Result>,
    fail_next_pool_reset: Option<vk::Result>,

    pools: HashMap<vk::DescriptorPool, PoolState>,
    pool_capacity_cap: Option<u32>,
    pools_created: u64,
    layouts_created: u64,
    descriptor_writes: u64,

    recording: HashMap<vk::CommandBuffer, bool>,
    commands: Vec<RecordedCommand>,
}

/// GPU-less [`Driver`] implementation with scripted results.
#[derive(Debug)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A mock with an 800x600 surface and three swapchain images.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_handle: 0x1000,
                live: HashMap::new(),
                fences: HashMap::new(),
                fence_waits: 0,
                wait_idle_calls: 0,
                surface_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                surface_formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                image_count: 3,
                swapchains_created: 0,
                swapchain_images: HashMap::new(),
                next_image: HashMap::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                acquire_calls: 0,
                presents: Vec::new(),
                submits: Vec::new(),
                fail_next_submit: None,
                fail_next_pool_reset: None,
                pools: HashMap::new(),
                pool_capacity_cap: None,
                pools_created: 0,
                layouts_created: 0,
                descriptor_writes: 0,
                recording: HashMap::new(),
                commands: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread may poison the lock; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Scripting =====

    /// Queue a result for an upcoming acquire. Unscripted acquires cycle
    /// through the swapchain images and succeed.
    pub fn push_acquire_result(&self, result: Result<(u32, bool), vk::Result>) {
        self.state().acquire_script.push_back(result);
    }

    /// Queue a result for an upcoming present. Unscripted presents succeed.
    pub fn push_present_result(&self, result: Result<bool, vk::Result>) {
        self.state().present_script.push_back(result);
    }

    /// Make the next queue submission fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state().fail_next_submit = Some(result);
    }

    /// Make the next descriptor pool reset fail with `result`.
    pub fn fail_next_pool_reset(&self, result: vk::Result) {
        self.state().fail_next_pool_reset = Some(result);
    }

    /// Limit every descriptor pool to at most `cap` sets, regardless of the
    /// `max_sets` it was created with.
    pub fn cap_pool_capacity(&self, cap: u32) {
        self.state().pool_capacity_cap = Some(cap);
    }

    /// Change the extent the surface reports, as a window resize would.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state().surface_extent = vk::Extent2D { width, height };
    }

    /// Replace the formats the surface reports.
    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state().surface_formats = formats;
    }

    /// Number of images the next swapchain will have.
    pub fn set_image_count(&self, count: u32) {
        self.state().image_count = count;
    }

    // ===== Observation =====

    pub fn acquire_calls(&self) -> u64 {
        self.state().acquire_calls
    }

    pub fn submits(&self) -> Vec<FrameSubmit> {
        self.state().submits.clone()
    }

    pub fn presents(&self) -> Vec<PresentCall> {
        self.state().presents.clone()
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state().commands.clone()
    }

    pub fn wait_idle_calls(&self) -> u64 {
        self.state().wait_idle_calls
    }

    pub fn fence_waits(&self) -> u64 {
        self.state().fence_waits
    }

    pub fn swapchains_created(&self) -> u64 {
        self.state().swapchains_created
    }

    pub fn pools_created(&self) -> u64 {
        self.state().pools_created
    }

    pub fn layouts_created(&self) -> u64 {
        self.state().layouts_created
    }

    pub fn descriptor_writes(&self) -> u64 {
        self.state().descriptor_writes
    }

    /// Mark `fence` signaled, as if the GPU finished the work it guards.
    pub fn signal_fence(&self, fence: vk::Fence) {
        if let Some(signaled) = self.state().fences.get_mut(&fence) {
            *signaled = true;
        }
    }

    /// Whether `fence` is currently signaled.
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence).copied().unwrap_or(false)
    }

    /// Created-minus-destroyed count for an object kind, e.g. `"framebuffer"`.
    pub fn live(&self, kind: &str) -> i64 {
        self.state().live.get(kind).copied().unwrap_or(0)
    }

    /// Sum of live objects across every kind.
    pub fn total_live(&self) -> i64 {
        self.state().live.values().sum()
    }
}

impl MockState {
    fn mint<H: Handle>(&mut self, kind: &'static str) -> H {
        self.next_handle += 1;
        *self.live.entry(kind).or_insert(0) += 1;
        H::from_raw(self.next_handle)
    }

    fn release(&mut self, kind: &'static str) {
        *self.live.entry(kind).or_insert(0) -= 1;
    }
}

impl Driver for MockDriver {
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(self.state().mint("semaphore"))
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.state().release("semaphore");
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state();
        let fence = state.mint("fence");
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        state.fences.remove(&fence);
        state.release("fence");
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> RhiResult<()> {
        let mut state = self.state();
        state.fence_waits += 1;
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(RhiError::VulkanError(vk::Result::TIMEOUT)),
            None => Err(RhiError::InvalidHandle(format!("unknown fence {:?}", fence))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.state();
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(RhiError::InvalidHandle(format!("unknown fence {:?}", fence))),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(self.state().fences.get(&fence).copied().unwrap_or(false))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state();
        state.wait_idle_calls += 1;
        Ok(())
    }

    fn submit(&self, submit: &FrameSubmit) -> RhiResult<()> {
        let mut state = self.state();
        if let Some(error) = state.fail_next_submit.take() {
            return Err(RhiError::VulkanError(error));
        }
        if state.recording.get(&submit.command_buffer) == Some(&true) {
            return Err(RhiError::InvalidState(
                "submitted a command buffer that is still recording".to_string(),
            ));
        }
        state.submits.push(*submit);
        if let Some(signaled) = state.fences.get_mut(&submit.fence) {
            *signaled = true;
        }
        Ok(())
    }

    fn surface_support(&self) -> RhiResult<SurfaceSupport> {
        let state = self.state();
        Ok(SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: state.surface_extent,
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 8192,
                    height: 8192,
                },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: state.surface_formats.clone(),
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        })
    }

    fn create_swapchain(&self, _desc: &SwapchainDesc) -> RhiResult<vk::SwapchainKHR> {
        let mut state = self.state();
        let swapchain: vk::SwapchainKHR = state.mint("swapchain");
        let count = state.image_count;
        let images: Vec<vk::Image> = (0..count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        state.swapchain_images.insert(swapchain, images);
        state.next_image.insert(swapchain, 0);
        state.swapchains_created += 1;
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        self.state()
            .swapchain_images
            .get(&swapchain)
            .cloned()
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown swapchain {:?}", swapchain)))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        state.swapchain_images.remove(&swapchain);
        state.next_image.remove(&swapchain);
        state.release("swapchain");
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _semaphore: vk::Semaphore,
        _timeout: u64,
    ) -> Result<(u32, bool), vk::Result> {
        let mut state = self.state();
        state.acquire_calls += 1;
        if let Some(result) = state.acquire_script.pop_front() {
            return result;
        }
        let count = state
            .swapchain_images
            .get(&swapchain)
            .map(|images| images.len() as u32)
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let next = state.next_image.entry(swapchain).or_insert(0);
        let index = *next;
        *next = (index + 1) % count;
        Ok((index, false))
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let mut state = self.state();
        state.presents.push(PresentCall {
            swapchain,
            image_index,
            wait_semaphore,
        });
        state.present_script.pop_front().unwrap_or(Ok(false))
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
    ) -> RhiResult<vk::ImageView> {
        Ok(self.state().mint("image_view"))
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.state().release("image_view");
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let mut state = self.state();
        state.layouts_created += 1;
        Ok(state.mint("descriptor_set_layout"))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state().release("descriptor_set_layout");
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<vk::DescriptorPool> {
        let mut state = self.state();
        let pool = state.mint("descriptor_pool");
        let max_sets = match state.pool_capacity_cap {
            Some(cap) => max_sets.min(cap),
            None => max_sets,
        };
        state.pools.insert(
            pool,
            PoolState {
                max_sets,
                allocated: 0,
            },
        );
        state.pools_created += 1;
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state();
        state.pools.remove(&pool);
        state.release("descriptor_pool");
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        let mut state = self.state();
        if let Some(error) = state.fail_next_pool_reset.take() {
            return Err(RhiError::VulkanError(error));
        }
        match state.pools.get_mut(&pool) {
            Some(pool_state) => {
                pool_state.allocated = 0;
                Ok(())
            }
            None => Err(RhiError::InvalidHandle(format!("unknown pool {:?}", pool))),
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let mut state = self.state();
        let pool_state = state
            .pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if pool_state.allocated >= pool_state.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        pool_state.allocated += 1;
        // Derived from the pool and slot so a reset pool hands out the same
        // raw values again, like a real driver may.
        Ok(vk::DescriptorSet::from_raw(
            (pool.as_raw() << 16) | u64::from(pool_state.allocated),
        ))
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        self.state().descriptor_writes += writes.len() as u64;
    }

    fn create_render_pass(
        &self,
        _info: &vk::RenderPassCreateInfo<'_>,
    ) -> RhiResult<vk::RenderPass> {
        Ok(self.state().mint("render_pass"))
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
        self.state().release("render_pass");
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        Ok(self.state().mint("framebuffer"))
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.state().release("framebuffer");
    }

    fn create_command_pool(&self) -> RhiResult<vk::CommandPool> {
        Ok(self.state().mint("command_pool"))
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {
        self.state().release("command_pool");
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state();
        let buffers = (0..count)
            .map(|_| {
                state.next_handle += 1;
                vk::CommandBuffer::from_raw(state.next_handle)
            })
            .collect();
        Ok(buffers)
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        self.state().recording.insert(command_buffer, true);
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.state().recording.insert(command_buffer, false);
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.state().recording.remove(&command_buffer);
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    ) {
        self.state().commands.push(RecordedCommand::BeginRenderPass {
            command_buffer,
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
        });
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.state()
            .commands
            .push(RecordedCommand::EndRenderPass { command_buffer });
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state().commands.push(RecordedCommand::BindPipeline {
            command_buffer,
            pipeline,
        });
    }

    fn cmd_set_viewport(&self, _command_buffer: vk::CommandBuffer, _viewports: &[vk::Viewport]) {}

    fn cmd_set_scissor(&self, _command_buffer: vk::CommandBuffer, _scissors: &[vk::Rect2D]) {}

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state()
            .commands
            .push(RecordedCommand::BindDescriptorSets {
                command_buffer,
                sets: sets.to_vec(),
            });
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        _offset: u32,
        data: &[u8],
    ) {
        self.state().commands.push(RecordedCommand::PushConstants {
            command_buffer,
            size: data.len(),
        });
    }

    fn cmd_bind_vertex_buffers(
        &self,
        _command_buffer: vk::CommandBuffer,
        _first_binding: u32,
        _buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.state().commands.push(RecordedCommand::Draw {
            command_buffer,
            vertex_count,
        });
    }
}
