//! Growable descriptor set allocation.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use super::DescriptorKind;
use crate::driver::Driver;
use crate::error::{RhiError, RhiResult};
use crate::handle::{DescriptorSetHandle, LayoutHandle};

/// How the size of successive pools evolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GrowthKind {
    /// Every pool holds `initial_sets` sets.
    Fixed,
    /// Each new pool holds twice the sets of the previous one, up to
    /// `max_sets_per_pool`.
    #[default]
    Doubling,
}

/// Sizing rules for the pools of a [`DescriptorAllocatorPool`].
#[derive(Clone, Debug, PartialEq)]
pub struct GrowthPolicy {
    pub kind: GrowthKind,
    /// Set capacity of the first pool.
    pub initial_sets: u32,
    /// Upper bound on the set capacity of any single pool.
    pub max_sets_per_pool: u32,
    /// Upper bound on the number of pools the allocator will create.
    pub max_pools: u32,
    /// Descriptors of each kind reserved per set of pool capacity.
    pub ratios: Vec<(DescriptorKind, f32)>,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            kind: GrowthKind::Doubling,
            initial_sets: 64,
            max_sets_per_pool: 4096,
            max_pools: 32,
            ratios: Self::default_ratios(),
        }
    }
}

impl GrowthPolicy {
    /// Pools of `sets` sets each.
    pub fn fixed(sets: u32) -> Self {
        Self {
            kind: GrowthKind::Fixed,
            initial_sets: sets,
            max_sets_per_pool: sets,
            ..Self::default()
        }
    }

    /// Pools starting at `initial_sets` and doubling up to `max_sets_per_pool`.
    pub fn doubling(initial_sets: u32, max_sets_per_pool: u32) -> Self {
        Self {
            kind: GrowthKind::Doubling,
            initial_sets,
            max_sets_per_pool,
            ..Self::default()
        }
    }

    pub fn with_max_pools(mut self, max_pools: u32) -> Self {
        self.max_pools = max_pools;
        self
    }

    pub fn with_ratios(mut self, ratios: Vec<(DescriptorKind, f32)>) -> Self {
        self.ratios = ratios;
        self
    }

    pub fn default_ratios() -> Vec<(DescriptorKind, f32)> {
        vec![
            (DescriptorKind::UniformBuffer, 2.0),
            (DescriptorKind::StorageBuffer, 2.0),
            (DescriptorKind::UniformBufferDynamic, 1.0),
            (DescriptorKind::StorageBufferDynamic, 1.0),
            (DescriptorKind::CombinedImageSampler, 4.0),
            (DescriptorKind::SampledImage, 4.0),
            (DescriptorKind::StorageImage, 1.0),
            (DescriptorKind::Sampler, 0.5),
        ]
    }

    /// Set capacity of the pool created after `pools_created` others.
    pub fn sets_for_pool(&self, pools_created: u32) -> u32 {
        let sets = match self.kind {
            GrowthKind::Fixed => self.initial_sets,
            GrowthKind::Doubling => {
                let factor = 1u32.checked_shl(pools_created).unwrap_or(u32::MAX);
                self.initial_sets.saturating_mul(factor)
            }
        };
        sets.min(self.max_sets_per_pool).max(1)
    }

    /// Per-kind descriptor counts for a pool of `sets` sets.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        self.ratios
            .iter()
            .filter(|(_, ratio)| *ratio > 0.0)
            .map(|&(kind, ratio)| {
                let count = (ratio * sets as f32).ceil().max(1.0) as u32;
                vk::DescriptorPoolSize::default()
                    .ty(kind.to_vk())
                    .descriptor_count(count)
            })
            .collect()
    }
}

fn is_pool_exhausted(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL
    )
}

/// Device-scoped descriptor set allocator over a growable list of pools.
///
/// Allocation goes to the active pool. When it reports exhaustion or
/// fragmentation the pool is retired, one new pool is brought in and the
/// allocation is retried exactly once. A second failure is
/// [`RhiError::DescriptorPoolExhausted`].
///
/// Sets are never freed individually. [`reset_pools`](Self::reset_pools)
/// invalidates every set handed out so far and keeps the pools for reuse.
pub struct DescriptorAllocatorPool {
    driver: Arc<dyn Driver>,
    policy: GrowthPolicy,
    active: Option<vk::DescriptorPool>,
    retired: Vec<vk::DescriptorPool>,
    free: Vec<vk::DescriptorPool>,
    pools_created: u32,
    growth_events: u64,
    epoch: u64,
}

impl DescriptorAllocatorPool {
    /// Creates an allocator. No pool is created until the first allocation.
    pub fn new(driver: Arc<dyn Driver>, policy: GrowthPolicy) -> Self {
        Self {
            driver,
            policy,
            active: None,
            retired: Vec::new(),
            free: Vec::new(),
            pools_created: 0,
            growth_events: 0,
            epoch: 0,
        }
    }

    /// Allocates one descriptor set with the given layout.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DescriptorPoolExhausted`] if the set does not fit
    /// even after growing once, or if the pool limit is reached. Other driver
    /// failures are passed through.
    pub fn allocate(&mut self, layout: LayoutHandle) -> RhiResult<DescriptorSetHandle> {
        let pool = match self.active {
            Some(pool) => pool,
            None => self.activate_next_pool()?,
        };

        match self.driver.allocate_descriptor_set(pool, layout.raw()) {
            Ok(raw) => return Ok(DescriptorSetHandle::new(raw, layout, self.epoch)),
            Err(result) if is_pool_exhausted(result) => {
                debug!("Descriptor pool {:?} exhausted ({:?}), growing", pool, result);
            }
            Err(result) => return Err(result.into()),
        }

        self.retired.push(pool);
        self.active = None;
        let pool = self.activate_next_pool()?;
        self.growth_events += 1;

        match self.driver.allocate_descriptor_set(pool, layout.raw()) {
            Ok(raw) => Ok(DescriptorSetHandle::new(raw, layout, self.epoch)),
            Err(result) if is_pool_exhausted(result) => {
                warn!("Descriptor allocation failed after growing: {:?}", result);
                Err(RhiError::DescriptorPoolExhausted(format!(
                    "allocation failed in a fresh pool ({:?})",
                    result
                )))
            }
            Err(result) => Err(result.into()),
        }
    }

    /// Resets every pool, invalidating all sets allocated so far.
    ///
    /// Must only be called once the GPU no longer uses any of those sets.
    /// Handles allocated before the reset report `false` from
    /// [`is_current`](Self::is_current) afterwards.
    ///
    /// # Errors
    ///
    /// Returns the driver error if a pool fails to reset. Pools that were not
    /// reset stay in use and are still destroyed on drop; the epoch has
    /// already advanced, so earlier handles are stale either way.
    pub fn reset_pools(&mut self) -> RhiResult<()> {
        self.epoch += 1;
        if let Some(pool) = self.active {
            self.driver.reset_descriptor_pool(pool)?;
            self.active = None;
            self.free.push(pool);
        }
        while let Some(&pool) = self.retired.last() {
            self.driver.reset_descriptor_pool(pool)?;
            self.retired.pop();
            self.free.push(pool);
        }
        debug!(
            "Reset descriptor pools (epoch {}, {} pools kept)",
            self.epoch,
            self.free.len()
        );
        Ok(())
    }

    /// Whether `set` was allocated since the last reset.
    pub fn is_current(&self, set: DescriptorSetHandle) -> bool {
        set.epoch() == self.epoch
    }

    /// Number of times an exhausted pool was replaced during allocation.
    pub fn growth_events(&self) -> u64 {
        self.growth_events
    }

    /// Number of pools created over the allocator's lifetime.
    pub fn pool_count(&self) -> u32 {
        self.pools_created
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn policy(&self) -> &GrowthPolicy {
        &self.policy
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn activate_next_pool(&mut self) -> RhiResult<vk::DescriptorPool> {
        let pool = match self.free.pop() {
            Some(pool) => pool,
            None => self.create_pool()?,
        };
        self.active = Some(pool);
        Ok(pool)
    }

    fn create_pool(&mut self) -> RhiResult<vk::DescriptorPool> {
        if self.pools_created >= self.policy.max_pools {
            return Err(RhiError::DescriptorPoolExhausted(format!(
                "pool limit of {} reached",
                self.policy.max_pools
            )));
        }

        let sets = self.policy.sets_for_pool(self.pools_created);
        let sizes = self.policy.pool_sizes(sets);
        let pool = self.driver.create_descriptor_pool(sets, &sizes)?;
        self.pools_created += 1;

        debug!(
            "Created descriptor pool #{} with {} sets",
            self.pools_created, sets
        );
        Ok(pool)
    }
}

impl Drop for DescriptorAllocatorPool {
    fn drop(&mut self) {
        let pools = self
            .active
            .take()
            .into_iter()
            .chain(self.retired.drain(..))
            .chain(self.free.drain(..));
        for pool in pools {
            self.driver.destroy_descriptor_pool(pool);
        }
    }
}
