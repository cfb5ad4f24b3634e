//! Frame pacing and synchronization.
//!
//! [`FrameSync`] owns `F` frame slots (frames in flight). Each slot has a
//! command list, an "image available" and a "render finished" semaphore, and
//! an in-flight fence. A frame moves through three calls:
//!
//! ```text
//! acquire_next_image  wait slot fence, acquire image, reset fence
//!         |           (OutOfDate: fence untouched, no token)
//!    AcquiredFrame    record into the slot's command list
//!         |
//! submit_frame        wait image-available, signal render-finished + fence
//!         |
//!   SubmittedFrame
//!         |
//! present_frame       wait render-finished, advance to the next slot
//! ```
//!
//! The tokens are move-only, so a frame can be submitted and presented at
//! most once and never without a successful acquire.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vesta_rhi::Driver;
//! use vesta_rhi::swapchain::Swapchain;
//! use vesta_renderer::frame_sync::{AcquireOutcome, FrameStatus, FrameSync};
//!
//! # fn example(driver: Arc<dyn Driver>, swapchain: &Swapchain) -> Result<(), vesta_rhi::RhiError> {
//! let mut frames = FrameSync::new(driver, 2)?;
//!
//! let AcquireOutcome::Ready(frame) = frames.acquire_next_image(swapchain)? else {
//!     // recreate the swapchain and try again
//!     return Ok(());
//! };
//! let list = frames.command_list(&frame);
//! list.begin_record()?;
//! // record...
//! list.end_record()?;
//!
//! let submitted = frames.submit_frame(frame)?;
//! if frames.present_frame(swapchain, submitted)? != FrameStatus::Success {
//!     // recreate before the next acquire
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use vesta_core::config::MAX_FRAMES_IN_FLIGHT;
use vesta_rhi::command::{CommandList, CommandPool};
use vesta_rhi::deletion::DeletionQueue;
use vesta_rhi::driver::FrameSubmit;
use vesta_rhi::swapchain::Swapchain;
use vesta_rhi::sync::{Fence, Semaphore};
use vesta_rhi::{Driver, ImageIndex, RhiError, RhiResult, SlotIndex, vk};

/// Where a slot is in the frame protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Free to acquire once its fence signals.
    Idle,
    Acquiring,
    /// Holds an acquired image; commands are being recorded.
    Recording,
    /// Work submitted, waiting to be presented.
    Submitted,
    Presenting,
}

/// Per-slot resources.
pub struct FrameSlot {
    command_list: CommandList,
    image_available: Semaphore,
    render_finished: Semaphore,
    in_flight: Fence,
    state: SlotState,
}

impl FrameSlot {
    fn new(driver: &Arc<dyn Driver>, command_list: CommandList) -> RhiResult<Self> {
        Ok(Self {
            command_list,
            image_available: Semaphore::new(driver.clone())?,
            render_finished: Semaphore::new(driver.clone())?,
            // Signaled so the first wait on the slot returns immediately.
            in_flight: Fence::new(driver.clone(), true)?,
            state: SlotState::Idle,
        })
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    #[inline]
    pub fn in_flight_fence(&self) -> &Fence {
        &self.in_flight
    }

    #[inline]
    pub fn image_available(&self) -> &Semaphore {
        &self.image_available
    }

    #[inline]
    pub fn render_finished(&self) -> &Semaphore {
        &self.render_finished
    }
}

/// Proof of a successful acquire. Consumed by [`FrameSync::submit_frame`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an acquired frame must be submitted or the slot stays blocked"]
pub struct AcquiredFrame {
    slot: SlotIndex,
    image: ImageIndex,
    suboptimal: bool,
}

impl AcquiredFrame {
    #[inline]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    #[inline]
    pub fn image(&self) -> ImageIndex {
        self.image
    }

    /// The swapchain still works but no longer matches the surface exactly.
    #[inline]
    pub fn is_suboptimal(&self) -> bool {
        self.suboptimal
    }
}

/// Proof of a successful submit. Consumed by [`FrameSync::present_frame`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a submitted frame must be presented"]
pub struct SubmittedFrame {
    slot: SlotIndex,
    image: ImageIndex,
}

impl SubmittedFrame {
    #[inline]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    #[inline]
    pub fn image(&self) -> ImageIndex {
        self.image
    }
}

/// Result of [`FrameSync::acquire_next_image`].
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(AcquiredFrame),
    /// The swapchain must be recreated before anything can be rendered.
    OutOfDate,
}

/// Result of [`FrameSync::present_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Success,
    /// Presented, but the swapchain should be recreated.
    Suboptimal,
    /// Not presented; the swapchain must be recreated.
    OutOfDate,
}

impl FrameStatus {
    #[inline]
    pub fn needs_recreate(self) -> bool {
        self != FrameStatus::Success
    }
}

/// Rotating frame slots and the acquire/submit/present protocol.
pub struct FrameSync {
    driver: Arc<dyn Driver>,
    slots: Vec<FrameSlot>,
    current: SlotIndex,
    deletion_queue: DeletionQueue,
    frames_presented: u64,
    // Last field: the slots' command lists are freed with the pool.
    command_pool: CommandPool,
}

impl FrameSync {
    /// Creates `frames_in_flight` slots.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if `frames_in_flight` is outside
    /// `1..=MAX_FRAMES_IN_FLIGHT`, or a driver error if slot creation fails.
    pub fn new(driver: Arc<dyn Driver>, frames_in_flight: usize) -> RhiResult<Self> {
        if frames_in_flight == 0 || frames_in_flight > MAX_FRAMES_IN_FLIGHT as usize {
            return Err(RhiError::InvalidState(format!(
                "frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, frames_in_flight
            )));
        }

        let command_pool = CommandPool::new(driver.clone())?;
        let lists = command_pool.allocate_lists(frames_in_flight as u32)?;

        let mut slots = Vec::with_capacity(frames_in_flight);
        for (i, list) in lists.into_iter().enumerate() {
            slots.push(FrameSlot::new(&driver, list)?);
            debug!("Created frame slot {}", i);
        }

        info!("Frame sync created with {} frames in flight", frames_in_flight);

        Ok(Self {
            deletion_queue: DeletionQueue::new(driver.clone(), frames_in_flight),
            driver,
            slots,
            current: SlotIndex::new(0),
            frames_presented: 0,
            command_pool,
        })
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// The slot the next acquire will use.
    #[inline]
    pub fn current_slot(&self) -> SlotIndex {
        self.current
    }

    #[inline]
    pub fn slot(&self, slot: SlotIndex) -> &FrameSlot {
        &self.slots[slot.get()]
    }

    #[inline]
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Waits for the current slot, then acquires the next swapchain image.
    ///
    /// The slot's fence is reset only once an image was actually acquired;
    /// on `OutOfDate` it stays signaled so the retry after recreation does
    /// not wait forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence wait fails, the slot is still holding an
    /// unsubmitted frame, or acquire fails with anything but out-of-date.
    pub fn acquire_next_image(&mut self, swapchain: &Swapchain) -> RhiResult<AcquireOutcome> {
        let index = self.current;
        let slot = &mut self.slots[index.get()];
        if slot.state != SlotState::Idle {
            return Err(RhiError::InvalidState(format!(
                "acquire on {} while it is {:?}",
                index, slot.state
            )));
        }

        slot.in_flight.wait()?;
        self.deletion_queue.flush_slot(index);

        slot.state = SlotState::Acquiring;
        match swapchain.acquire_next_image(slot.image_available.handle()) {
            Ok((image, suboptimal)) => {
                slot.in_flight.reset()?;
                slot.state = SlotState::Recording;
                if suboptimal {
                    debug!("Swapchain suboptimal during acquire");
                }
                Ok(AcquireOutcome::Ready(AcquiredFrame {
                    slot: index,
                    image,
                    suboptimal,
                }))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                slot.state = SlotState::Idle;
                warn!("Swapchain out of date during acquire");
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(e) => {
                slot.state = SlotState::Idle;
                Err(e.into())
            }
        }
    }

    /// The command list of the acquired frame's slot.
    pub fn command_list(&mut self, frame: &AcquiredFrame) -> &mut CommandList {
        &mut self.slots[frame.slot.get()].command_list
    }

    /// Submits the frame's recorded command list to the graphics queue.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the command list is not
    /// executable, or the driver error if the submission is rejected.
    pub fn submit_frame(&mut self, frame: AcquiredFrame) -> RhiResult<SubmittedFrame> {
        let slot = &mut self.slots[frame.slot.get()];
        if slot.state != SlotState::Recording {
            return Err(RhiError::InvalidState(format!(
                "submit on {} while it is {:?}",
                frame.slot, slot.state
            )));
        }
        if !slot.command_list.is_executable() {
            return Err(RhiError::InvalidState(format!(
                "submit on {} with command list {:?}",
                frame.slot,
                slot.command_list.state()
            )));
        }

        self.driver.submit(&FrameSubmit {
            command_buffer: slot.command_list.handle(),
            wait_semaphore: slot.image_available.handle(),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: slot.render_finished.handle(),
            fence: slot.in_flight.handle(),
        })?;
        slot.state = SlotState::Submitted;

        Ok(SubmittedFrame {
            slot: frame.slot,
            image: frame.image,
        })
    }

    /// Presents the frame and advances to the next slot.
    ///
    /// The slot advances whatever the outcome, including errors, so
    /// recreation never disturbs the rotation.
    ///
    /// # Errors
    ///
    /// Returns an error for any present failure other than out-of-date.
    pub fn present_frame(
        &mut self,
        swapchain: &Swapchain,
        frame: SubmittedFrame,
    ) -> RhiResult<FrameStatus> {
        let slot = &mut self.slots[frame.slot.get()];
        slot.state = SlotState::Presenting;

        let result = swapchain.present(frame.image, slot.render_finished.handle());
        slot.state = SlotState::Idle;
        self.current = self.current.next(self.slots.len());

        match result {
            Ok(false) => {
                self.frames_presented += 1;
                Ok(FrameStatus::Success)
            }
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                self.frames_presented += 1;
                warn!("Swapchain suboptimal during present");
                Ok(FrameStatus::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                warn!("Swapchain out of date during present");
                Ok(FrameStatus::OutOfDate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Defers `destroy` until the GPU is done with anything recorded so far.
    ///
    /// The action waits on the fence of the slot holding the newest work:
    /// the current slot while it has a frame in hand, otherwise the slot
    /// that submitted last. Fences on the graphics queue signal in
    /// submission order, so that one fence covers every earlier frame too.
    pub fn defer_destroy(&mut self, destroy: impl FnOnce(&dyn Driver) + Send + 'static) {
        self.deletion_queue.push(self.newest_work_slot(), destroy);
    }

    fn newest_work_slot(&self) -> SlotIndex {
        if self.slots[self.current.get()].state != SlotState::Idle {
            return self.current;
        }
        let count = self.slots.len();
        SlotIndex::new((self.current.get() + count - 1) % count)
    }

    #[inline]
    pub fn pending_destroys(&self) -> usize {
        self.deletion_queue.len()
    }

    /// Waits for the device to go idle and runs every deferred destroy.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        self.driver.wait_idle()?;
        self.deletion_queue.flush_all();
        Ok(())
    }

    /// Runs every deferred destroy. The device must already be idle.
    pub(crate) fn flush_deferred(&mut self) {
        self.deletion_queue.flush_all();
    }

    #[inline]
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesta_rhi::testing::MockDriver;

    fn setup(frames: usize) -> (Arc<MockDriver>, Swapchain, FrameSync) {
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
        let frames = FrameSync::new(mock.clone(), frames).unwrap();
        (mock, swapchain, frames)
    }

    fn record(frames: &mut FrameSync, frame: &AcquiredFrame) {
        let list = frames.command_list(frame);
        list.begin_record().unwrap();
        list.end_record().unwrap();
    }

    fn ready(outcome: AcquireOutcome) -> AcquiredFrame {
        match outcome {
            AcquireOutcome::Ready(frame) => frame,
            AcquireOutcome::OutOfDate => panic!("unexpected OutOfDate"),
        }
    }

    #[test]
    fn test_rejects_bad_frame_counts() {
        let mock = Arc::new(MockDriver::new());
        assert!(matches!(
            FrameSync::new(mock.clone(), 0),
            Err(RhiError::InvalidState(_))
        ));
        assert!(matches!(
            FrameSync::new(mock.clone(), MAX_FRAMES_IN_FLIGHT as usize + 1),
            Err(RhiError::InvalidState(_))
        ));
        assert_eq!(mock.total_live(), 0);
    }

    #[test]
    fn test_full_cycle_signals_and_waits() {
        let (mock, swapchain, mut frames) = setup(2);
        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        assert_eq!(frame.slot(), SlotIndex::new(0));
        assert_eq!(frames.slot(frame.slot()).state(), SlotState::Recording);
        assert!(!frames.slot(frame.slot()).in_flight_fence().is_signaled());

        record(&mut frames, &frame);
        let image = frame.image();
        let submitted = frames.submit_frame(frame).unwrap();

        let submit = mock.submits()[0];
        let slot = frames.slot(SlotIndex::new(0));
        assert_eq!(submit.wait_semaphore, slot.image_available().handle());
        assert_eq!(submit.signal_semaphore, slot.render_finished().handle());
        assert_eq!(submit.fence, slot.in_flight_fence().handle());
        assert_eq!(
            submit.wait_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );

        let status = frames.present_frame(&swapchain, submitted).unwrap();
        assert_eq!(status, FrameStatus::Success);
        let present = mock.presents()[0];
        assert_eq!(present.image_index, image.get());
        assert_eq!(
            present.wait_semaphore,
            frames.slot(SlotIndex::new(0)).render_finished().handle()
        );
        assert_eq!(frames.current_slot(), SlotIndex::new(1));
        assert_eq!(frames.frames_presented(), 1);
    }

    #[test]
    fn test_out_of_date_acquire_keeps_fence_signaled() {
        let (mock, swapchain, mut frames) = setup(2);
        mock.push_acquire_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        let outcome = frames.acquire_next_image(&swapchain).unwrap();
        assert_eq!(outcome, AcquireOutcome::OutOfDate);

        let slot = frames.slot(SlotIndex::new(0));
        assert_eq!(slot.state(), SlotState::Idle);
        assert!(slot.in_flight_fence().is_signaled());
        assert_eq!(frames.current_slot(), SlotIndex::new(0));

        // The retry must not deadlock on the fence.
        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        assert_eq!(frame.slot(), SlotIndex::new(0));
        record(&mut frames, &frame);
        let submitted = frames.submit_frame(frame).unwrap();
        frames.present_frame(&swapchain, submitted).unwrap();
    }

    #[test]
    fn test_other_acquire_errors_propagate() {
        let (mock, swapchain, mut frames) = setup(2);
        mock.push_acquire_result(Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(
            frames.acquire_next_image(&swapchain),
            Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(frames.slot(SlotIndex::new(0)).state(), SlotState::Idle);
    }

    #[test]
    fn test_submit_requires_executable_list() {
        let (mock, swapchain, mut frames) = setup(2);
        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        frames.command_list(&frame).begin_record().unwrap();

        assert!(matches!(
            frames.submit_frame(frame),
            Err(RhiError::InvalidState(_))
        ));
        assert!(mock.submits().is_empty());
    }

    #[test]
    fn test_acquire_while_holding_frame_is_rejected() {
        let (_mock, swapchain, mut frames) = setup(1);
        let _frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        assert!(matches!(
            frames.acquire_next_image(&swapchain),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_present_statuses_and_rotation() {
        let (mock, swapchain, mut frames) = setup(3);
        mock.push_present_result(Ok(true));
        mock.push_present_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
            record(&mut frames, &frame);
            let submitted = frames.submit_frame(frame).unwrap();
            statuses.push(frames.present_frame(&swapchain, submitted).unwrap());
        }

        assert_eq!(
            statuses,
            vec![
                FrameStatus::Suboptimal,
                FrameStatus::OutOfDate,
                FrameStatus::Success
            ]
        );
        assert!(statuses[0].needs_recreate());
        assert!(!statuses[2].needs_recreate());
        assert_eq!(frames.current_slot(), SlotIndex::new(0));
        assert_eq!(frames.frames_presented(), 2);
    }

    #[test]
    fn test_present_error_still_rotates() {
        let (mock, swapchain, mut frames) = setup(2);
        mock.push_present_result(Err(vk::Result::ERROR_SURFACE_LOST_KHR));

        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        record(&mut frames, &frame);
        let submitted = frames.submit_frame(frame).unwrap();
        assert!(frames.present_frame(&swapchain, submitted).is_err());
        assert_eq!(frames.current_slot(), SlotIndex::new(1));
    }

    #[test]
    fn test_deferred_destroy_runs_after_slot_fence() {
        let (mock, swapchain, mut frames) = setup(2);
        let layout = mock.create_descriptor_set_layout(&[]).unwrap();
        assert_eq!(mock.live("descriptor_set_layout"), 1);

        // Retired while slot 0 is recording, so it waits for slot 0's fence.
        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        frames.defer_destroy(move |driver| driver.destroy_descriptor_set_layout(layout));
        assert_eq!(frames.pending_destroys(), 1);
        record(&mut frames, &frame);
        let submitted = frames.submit_frame(frame).unwrap();
        frames.present_frame(&swapchain, submitted).unwrap();

        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        assert_eq!(frame.slot(), SlotIndex::new(1));
        record(&mut frames, &frame);
        let submitted = frames.submit_frame(frame).unwrap();
        frames.present_frame(&swapchain, submitted).unwrap();
        assert_eq!(mock.live("descriptor_set_layout"), 1);

        let _frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        assert_eq!(mock.live("descriptor_set_layout"), 0);
        assert_eq!(frames.pending_destroys(), 0);
    }

    #[test]
    fn test_destroy_deferred_between_frames_waits_for_last_submit() {
        let (mock, swapchain, mut frames) = setup(2);
        let layout = mock.create_descriptor_set_layout(&[]).unwrap();

        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        record(&mut frames, &frame);
        let submitted = frames.submit_frame(frame).unwrap();
        frames.present_frame(&swapchain, submitted).unwrap();

        // Slot 0's frame is still executing on the GPU.
        let slot0_fence = frames.slot(SlotIndex::new(0)).in_flight_fence().handle();
        mock.reset_fence(slot0_fence).unwrap();

        frames.defer_destroy(move |driver| driver.destroy_descriptor_set_layout(layout));

        let frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        assert_eq!(frame.slot(), SlotIndex::new(1));
        assert_eq!(mock.live("descriptor_set_layout"), 1);
        record(&mut frames, &frame);
        let submitted = frames.submit_frame(frame).unwrap();
        frames.present_frame(&swapchain, submitted).unwrap();
        assert_eq!(mock.live("descriptor_set_layout"), 1);

        mock.signal_fence(slot0_fence);
        let _frame = ready(frames.acquire_next_image(&swapchain).unwrap());
        assert_eq!(mock.live("descriptor_set_layout"), 0);
        assert_eq!(frames.pending_destroys(), 0);
    }

    #[test]
    fn test_wait_idle_flushes_deferred() {
        let (mock, _swapchain, mut frames) = setup(2);
        let layout = mock.create_descriptor_set_layout(&[]).unwrap();
        frames.defer_destroy(move |driver| driver.destroy_descriptor_set_layout(layout));

        frames.wait_idle().unwrap();
        assert_eq!(mock.live("descriptor_set_layout"), 0);
        assert!(mock.wait_idle_calls() >= 1);
    }

    #[test]
    fn test_drop_releases_slot_objects() {
        let (mock, swapchain, frames) = setup(3);
        assert_eq!(mock.live("semaphore"), 6);
        assert_eq!(mock.live("fence"), 3);
        drop(frames);
        drop(swapchain);
        assert_eq!(mock.total_live(), 0);
    }
}
