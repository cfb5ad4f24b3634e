//! Synchronization primitives.
//!
//! This module provides RAII wrappers for Vulkan synchronization objects:
//! - [`Semaphore`] - GPU-to-GPU ordering between queue operations
//! - [`Fence`] - GPU-to-CPU completion signal the host can wait on
//!
//! Both are created through a [`Driver`] and destroyed with it when dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vesta_rhi::Driver;
//! use vesta_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(driver: Arc<dyn Driver>) -> Result<(), vesta_rhi::RhiError> {
//! let image_available = Semaphore::new(driver.clone())?;
//!
//! // Signaled so the first wait on a fresh frame slot returns immediately
//! let in_flight = Fence::new(driver, true)?;
//! in_flight.wait()?;
//! in_flight.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::driver::Driver;
use crate::error::RhiResult;

/// Semaphore wrapper.
///
/// Used to order the acquire, render and present steps of a frame on the GPU
/// timeline. Created unsignaled.
pub struct Semaphore {
    driver: Arc<dyn Driver>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new unsignaled semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(driver: Arc<dyn Driver>) -> RhiResult<Self> {
        let semaphore = driver.create_semaphore()?;
        debug!("Created semaphore");
        Ok(Self { driver, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.driver.destroy_semaphore(self.semaphore);
    }
}

/// Fence wrapper.
///
/// A frame slot's fence is signaled by the GPU when the slot's submission
/// completes; the host waits on it before reusing the slot's command buffer.
pub struct Fence {
    driver: Arc<dyn Driver>,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `driver` - The device the fence belongs to
    /// * `signaled` - Create the fence already signaled, for fences that are
    ///   waited on before anything could have signaled them
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(driver: Arc<dyn Driver>, signaled: bool) -> RhiResult<Self> {
        let fence = driver.create_fence(signaled)?;
        debug!(
            "Created fence ({})",
            if signaled { "signaled" } else { "unsignaled" }
        );
        Ok(Self { driver, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled.
    ///
    /// The timeout is the driver's: there is no caller-configurable bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails (device lost, timeout).
    pub fn wait(&self) -> RhiResult<()> {
        self.driver.wait_for_fence(self.fence, u64::MAX)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be pending on any queue submission.
    pub fn reset(&self) -> RhiResult<()> {
        self.driver.reset_fence(self.fence)
    }

    /// Non-blocking check of the fence state.
    pub fn is_signaled(&self) -> bool {
        matches!(self.driver.fence_signaled(self.fence), Ok(true))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.driver.destroy_fence(self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    #[test]
    fn test_semaphore_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
    }

    #[test]
    fn test_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Fence>();
    }

    #[test]
    fn test_fence_signal_lifecycle() {
        let mock = Arc::new(MockDriver::new());
        let fence = Fence::new(mock.clone(), true).unwrap();
        assert!(fence.is_signaled());
        fence.wait().unwrap();

        fence.reset().unwrap();
        assert!(!fence.is_signaled());
        // Nothing was submitted, so the mock reports a timeout instead of hanging.
        assert!(fence.wait().is_err());
    }

    #[test]
    fn test_drop_destroys_objects() {
        let mock = Arc::new(MockDriver::new());
        {
            let _semaphore = Semaphore::new(mock.clone()).unwrap();
            let _fence = Fence::new(mock.clone(), false).unwrap();
            assert_eq!(mock.live("semaphore"), 1);
            assert_eq!(mock.live("fence"), 1);
        }
        assert_eq!(mock.total_live(), 0);
    }
}
