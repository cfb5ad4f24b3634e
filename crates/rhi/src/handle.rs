//! Typed indices and handles.
//!
//! Frame slots and swapchain images are both small integers, but they index
//! unrelated arrays whose lengths may differ. They get separate types so a
//! framebuffer can never be looked up by slot or a fence by image.

use std::fmt;

use ash::vk;

/// Index of a frame-in-flight slot, in `[0, frames_in_flight)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// The slot after this one, wrapping at `frames_in_flight`.
    #[inline]
    pub fn next(self, frames_in_flight: usize) -> Self {
        Self((self.0 + 1) % frames_in_flight)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Index of a presentable swapchain image, as returned by acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageIndex(u32);

impl ImageIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ImageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image {}", self.0)
    }
}

/// A descriptor set layout owned by a [`LayoutCache`](crate::descriptor::LayoutCache).
///
/// Equality is identity of the underlying Vulkan object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutHandle(vk::DescriptorSetLayout);

impl LayoutHandle {
    pub(crate) fn new(raw: vk::DescriptorSetLayout) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> vk::DescriptorSetLayout {
        self.0
    }
}

/// A descriptor set allocated from a
/// [`DescriptorAllocatorPool`](crate::descriptor::DescriptorAllocatorPool).
///
/// The handle remembers the allocator epoch it was allocated in. Resetting
/// the pools starts a new epoch, so a handle from before a reset never
/// compares equal to one from after it, even if the driver recycles the
/// raw `VkDescriptorSet` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle {
    raw: vk::DescriptorSet,
    layout: LayoutHandle,
    epoch: u64,
}

impl DescriptorSetHandle {
    pub(crate) fn new(raw: vk::DescriptorSet, layout: LayoutHandle, epoch: u64) -> Self {
        Self { raw, layout, epoch }
    }

    #[inline]
    pub fn raw(self) -> vk::DescriptorSet {
        self.raw
    }

    #[inline]
    pub fn layout(self) -> LayoutHandle {
        self.layout
    }

    #[inline]
    pub fn epoch(self) -> u64 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_slot_rotation_wraps() {
        let slot = SlotIndex::new(0);
        let slot = slot.next(2);
        assert_eq!(slot.get(), 1);
        let slot = slot.next(2);
        assert_eq!(slot.get(), 0);
    }

    #[test]
    fn test_single_slot_rotation() {
        assert_eq!(SlotIndex::new(0).next(1), SlotIndex::new(0));
    }

    #[test]
    fn test_set_handles_differ_across_epochs() {
        let layout = LayoutHandle::new(vk::DescriptorSetLayout::from_raw(1));
        let raw = vk::DescriptorSet::from_raw(42);
        let before = DescriptorSetHandle::new(raw, layout, 0);
        let after = DescriptorSetHandle::new(raw, layout, 1);
        assert_ne!(before, after);
        assert_eq!(before.raw(), after.raw());
    }
}
