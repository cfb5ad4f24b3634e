//! Frame loop behavior against the scripted mock driver.

use std::sync::Arc;

use vesta_platform::WindowEvents;
use vesta_renderer::{FrameStatus, Renderer, RendererDesc};
use vesta_rhi::descriptor::{BufferBinding, DescriptorBuilder, DescriptorKind, GrowthPolicy};
use vesta_rhi::testing::{MockDriver, RecordedCommand};
use vesta_rhi::vk::{self, Handle};
use vesta_rhi::{Driver, RhiError, SlotIndex};

/// Window stand-in. `wait_events` restores the extent in `restore_to`, as if
/// the user un-minimized the window.
struct FakeWindow {
    mock: Arc<MockDriver>,
    extent: vk::Extent2D,
    resized: bool,
    close: bool,
    restore_to: Option<vk::Extent2D>,
    waits: u32,
}

impl FakeWindow {
    fn new(mock: Arc<MockDriver>) -> Self {
        Self {
            mock,
            extent: extent(800, 600),
            resized: false,
            close: false,
            restore_to: None,
            waits: 0,
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.extent = extent(width, height);
        self.resized = true;
        self.mock.set_surface_extent(width, height);
    }
}

impl WindowEvents for FakeWindow {
    fn should_close(&self) -> bool {
        self.close
    }

    fn poll_events(&mut self) {}

    fn take_framebuffer_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        match self.restore_to.take() {
            Some(restored) => {
                self.extent = restored;
                self.mock.set_surface_extent(restored.width, restored.height);
            }
            None => self.close = true,
        }
    }
}

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

fn desc(frames_in_flight: usize) -> RendererDesc {
    RendererDesc {
        frames_in_flight,
        ..RendererDesc::default()
    }
}

fn setup(frames_in_flight: usize) -> (Arc<MockDriver>, FakeWindow, Renderer) {
    let mock = Arc::new(MockDriver::new());
    let window = FakeWindow::new(mock.clone());
    let renderer = Renderer::new(mock.clone(), window.extent(), &desc(frames_in_flight)).unwrap();
    (mock, window, renderer)
}

/// One loop iteration: returns the slot used and the present status, or
/// `None` if the frame was skipped.
fn cycle(renderer: &mut Renderer, window: &mut FakeWindow) -> Option<(SlotIndex, FrameStatus)> {
    let frame = renderer.begin_frame(window).unwrap()?;
    let slot = frame.slot();
    let list = renderer
        .begin_render_pass(&frame, vk::Pipeline::from_raw(0xbeef))
        .unwrap();
    list.draw(3, 1, 0, 0);
    let status = renderer.end_frame(frame).unwrap();
    Some((slot, status))
}

fn uniform_set() -> DescriptorBuilder {
    DescriptorBuilder::new().bind_buffer(
        0,
        DescriptorKind::UniformBuffer,
        vk::ShaderStageFlags::VERTEX,
        BufferBinding::whole(vk::Buffer::from_raw(0x5151)),
    )
}

#[test]
fn test_scenario_a_steady_state() {
    let (mock, mut window, mut renderer) = setup(2);

    let results: Vec<_> = (0..3)
        .map(|_| cycle(&mut renderer, &mut window).unwrap())
        .collect();

    let slots: Vec<usize> = results.iter().map(|(slot, _)| slot.get()).collect();
    assert_eq!(slots, vec![0, 1, 0]);
    assert!(results.iter().all(|(_, status)| *status == FrameStatus::Success));
    assert_eq!(mock.submits().len(), 3);
    assert_eq!(mock.presents().len(), 3);
    assert_eq!(renderer.render_target().recreate_count(), 0);
}

#[test]
fn test_scenario_b_out_of_date_acquire() {
    let (mock, mut window, mut renderer) = setup(2);

    assert!(cycle(&mut renderer, &mut window).is_some());

    mock.push_acquire_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    assert!(cycle(&mut renderer, &mut window).is_none());
    assert_eq!(renderer.render_target().recreate_count(), 1);
    assert_eq!(renderer.swapchain().generation(), 1);
    assert_eq!(mock.submits().len(), 1);
    assert_eq!(mock.presents().len(), 1);

    let (slot, status) = cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(status, FrameStatus::Success);
    // The skipped frame did not consume a slot.
    assert_eq!(slot, SlotIndex::new(1));
    assert_eq!(mock.submits().len(), 2);
    assert_eq!(
        mock.presents()[1].swapchain,
        renderer.swapchain().handle()
    );
    assert_eq!(renderer.render_target().recreate_count(), 1);
}

#[test]
fn test_no_submit_or_present_after_out_of_date() {
    let (mock, mut window, mut renderer) = setup(3);

    for _ in 0..4 {
        mock.push_acquire_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert!(cycle(&mut renderer, &mut window).is_none());
    }

    assert_eq!(mock.acquire_calls(), 4);
    assert!(mock.submits().is_empty());
    assert!(mock.presents().is_empty());
    assert!(mock.commands().is_empty());
    assert_eq!(renderer.frames().current_slot(), SlotIndex::new(0));
}

#[test]
fn test_slot_rotation_returns_after_f_cycles() {
    for frames_in_flight in 1..=3 {
        let (_mock, mut window, mut renderer) = setup(frames_in_flight);
        let start = renderer.frames().current_slot();

        for _ in 0..frames_in_flight {
            cycle(&mut renderer, &mut window).unwrap();
        }
        assert_eq!(renderer.frames().current_slot(), start);
    }
}

#[test]
fn test_present_out_of_date_recreates_before_next_acquire() {
    let (mock, mut window, mut renderer) = setup(2);
    mock.push_present_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

    let (_, status) = cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(status, FrameStatus::OutOfDate);
    assert!(renderer.needs_recreate());
    assert_eq!(renderer.render_target().recreate_count(), 0);

    let (slot, status) = cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(status, FrameStatus::Success);
    // Rotation is not reset by recreation.
    assert_eq!(slot, SlotIndex::new(1));
    assert_eq!(renderer.render_target().recreate_count(), 1);
    assert!(mock.wait_idle_calls() >= 1);
}

#[test]
fn test_suboptimal_present_is_reported_and_recreated() {
    let (mock, mut window, mut renderer) = setup(2);
    mock.push_present_result(Ok(true));

    let (_, status) = cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(status, FrameStatus::Suboptimal);

    cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(renderer.swapchain().generation(), 1);
}

#[test]
fn test_resize_rebuilds_framebuffers_at_new_extent() {
    let (mock, mut window, mut renderer) = setup(2);
    cycle(&mut renderer, &mut window).unwrap();

    window.resize(1024, 768);
    cycle(&mut renderer, &mut window).unwrap();

    assert_eq!(renderer.swapchain().extent(), extent(1024, 768));
    assert_eq!(renderer.render_target().extent(), extent(1024, 768));
    assert!(!renderer.render_target().is_stale(renderer.swapchain()));
    assert_eq!(
        mock.live("framebuffer") as u32,
        renderer.swapchain().image_count()
    );
}

#[test]
fn test_minimized_window_waits_for_events() {
    let (_mock, mut window, mut renderer) = setup(2);
    cycle(&mut renderer, &mut window).unwrap();

    window.extent = extent(0, 0);
    window.resized = true;
    window.restore_to = Some(extent(640, 480));

    let (_, status) = cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(status, FrameStatus::Success);
    assert_eq!(window.waits, 1);
    assert_eq!(renderer.swapchain().extent(), extent(640, 480));
}

#[test]
fn test_close_while_minimized_skips_frame() {
    let (mock, mut window, mut renderer) = setup(2);
    window.extent = extent(0, 0);
    window.resized = true;

    assert!(cycle(&mut renderer, &mut window).is_none());
    assert!(window.should_close());
    assert!(renderer.needs_recreate());
    assert!(mock.submits().is_empty());
}

#[test]
fn test_recorded_pass_uses_acquired_image_framebuffer() {
    let (mock, mut window, mut renderer) = setup(2);
    mock.push_acquire_result(Ok((2, false)));

    cycle(&mut renderer, &mut window).unwrap();

    let expected = renderer
        .render_target()
        .framebuffer(vesta_rhi::ImageIndex::new(2))
        .unwrap();
    let begin = mock
        .commands()
        .into_iter()
        .find_map(|command| match command {
            RecordedCommand::BeginRenderPass { framebuffer, .. } => Some(framebuffer),
            _ => None,
        })
        .unwrap();
    assert_eq!(begin, expected);
    assert_eq!(mock.presents()[0].image_index, 2);
}

#[test]
fn test_scenario_c_builds_share_layout() {
    let (mock, _window, mut renderer) = setup(2);
    let (cache, allocator) = renderer.descriptors();

    let (set_a, layout_a) = uniform_set().build(cache, allocator).unwrap();
    let (set_b, layout_b) = uniform_set().build(cache, allocator).unwrap();

    assert_ne!(set_a, set_b);
    assert_eq!(layout_a, layout_b);
    assert_eq!(mock.layouts_created(), 1);
    assert_eq!(renderer.layout_cache().len(), 1);
}

#[test]
fn test_scenario_d_reset_never_aliases() {
    let (_mock, _window, mut renderer) = setup(2);

    let before: Vec<_> = {
        let (cache, allocator) = renderer.descriptors();
        (0..4)
            .map(|_| uniform_set().build(cache, allocator).unwrap().0)
            .collect()
    };

    renderer.reset_descriptor_pools().unwrap();

    let (cache, allocator) = renderer.descriptors();
    let after: Vec<_> = (0..4)
        .map(|_| uniform_set().build(cache, allocator).unwrap().0)
        .collect();

    for old in &before {
        assert!(!after.contains(old));
        assert!(!renderer.descriptor_allocator().is_current(*old));
    }
    // The driver recycled the raw handles; only the epoch tells them apart.
    assert_eq!(before[0].raw(), after[0].raw());
}

#[test]
fn test_descriptor_growth_happens_once_per_overflow() {
    let mock = Arc::new(MockDriver::new());
    mock.cap_pool_capacity(2);
    let window = FakeWindow::new(mock.clone());
    let small_pools = RendererDesc {
        growth: GrowthPolicy::fixed(2).with_max_pools(2),
        ..desc(2)
    };
    let mut renderer = Renderer::new(mock.clone(), window.extent(), &small_pools).unwrap();
    let (cache, allocator) = renderer.descriptors();

    uniform_set().build(cache, allocator).unwrap();
    uniform_set().build(cache, allocator).unwrap();
    assert_eq!(allocator.growth_events(), 0);

    // Third set overflows the first pool: exactly one growth.
    uniform_set().build(cache, allocator).unwrap();
    assert_eq!(allocator.growth_events(), 1);
    assert_eq!(allocator.pool_count(), 2);

    uniform_set().build(cache, allocator).unwrap();
    let result = uniform_set().build(cache, allocator);
    assert!(matches!(result, Err(RhiError::DescriptorPoolExhausted(_))));
    assert_eq!(allocator.pool_count(), 2);
}

#[test]
fn test_destroy_deferred_after_end_frame_outlives_that_frame() {
    let (mock, mut window, mut renderer) = setup(2);
    let layout = mock.create_descriptor_set_layout(&[]).unwrap();

    let (slot, _) = cycle(&mut renderer, &mut window).unwrap();
    let fence = renderer.frames().slot(slot).in_flight_fence().handle();
    mock.reset_fence(fence).unwrap();
    renderer.defer_destroy(move |driver| driver.destroy_descriptor_set_layout(layout));

    cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(mock.live("descriptor_set_layout"), 1);

    mock.signal_fence(fence);
    cycle(&mut renderer, &mut window).unwrap();
    assert_eq!(mock.live("descriptor_set_layout"), 0);
}

#[test]
fn test_drop_releases_everything() {
    let (mock, mut window, mut renderer) = setup(3);
    cycle(&mut renderer, &mut window).unwrap();
    {
        let (cache, allocator) = renderer.descriptors();
        uniform_set().build(cache, allocator).unwrap();
    }
    drop(renderer);
    assert_eq!(mock.total_live(), 0);
}
