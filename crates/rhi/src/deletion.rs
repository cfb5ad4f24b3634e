//! Deferred destruction of GPU objects.
//!
//! An object replaced while a frame that uses it may still be executing
//! cannot be destroyed right away. [`DeletionQueue`] keeps the destroy action
//! tagged with the frame slot that last recorded it, and runs it once that
//! slot's fence has been observed signaled.

use std::sync::Arc;

use tracing::debug;

use crate::driver::Driver;
use crate::handle::SlotIndex;

type DeleteFn = Box<dyn FnOnce(&dyn Driver) + Send>;

/// Destroy actions bucketed by frame slot.
pub struct DeletionQueue {
    driver: Arc<dyn Driver>,
    slots: Vec<Vec<DeleteFn>>,
}

impl DeletionQueue {
    pub fn new(driver: Arc<dyn Driver>, frames_in_flight: usize) -> Self {
        Self {
            driver,
            slots: (0..frames_in_flight.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    /// Defers `destroy` until `slot`'s next fence observation.
    pub fn push(&mut self, slot: SlotIndex, destroy: impl FnOnce(&dyn Driver) + Send + 'static) {
        let index = slot.get() % self.slots.len();
        self.slots[index].push(Box::new(destroy));
    }

    /// Runs every action deferred on `slot`.
    ///
    /// Call right after waiting on the slot's fence.
    pub fn flush_slot(&mut self, slot: SlotIndex) {
        let index = slot.get() % self.slots.len();
        let pending = std::mem::take(&mut self.slots[index]);
        if !pending.is_empty() {
            debug!("Running {} deferred destroys for {}", pending.len(), slot);
        }
        for destroy in pending {
            destroy(self.driver.as_ref());
        }
    }

    /// Runs every pending action. The device must be idle.
    pub fn flush_all(&mut self) {
        for index in 0..self.slots.len() {
            self.flush_slot(SlotIndex::new(index));
        }
    }

    /// Number of pending actions across all slots.
    pub fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        // Owners wait for the device to go idle before dropping the queue.
        self.flush_all();
    }
}
