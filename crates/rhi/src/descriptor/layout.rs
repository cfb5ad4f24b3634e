//! Descriptor set layout deduplication.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use super::DescriptorKind;
use crate::driver::Driver;
use crate::error::{RhiError, RhiResult};
use crate::handle::LayoutHandle;

/// One binding slot of a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingDesc {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: vk::ShaderStageFlags,
    pub count: u32,
}

impl BindingDesc {
    /// A single-descriptor binding.
    pub fn new(binding: u32, kind: DescriptorKind, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind,
            stages,
            count: 1,
        }
    }

    /// Sets the array size of the binding.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn to_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.kind.to_vk())
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

/// The structural identity of a descriptor set layout.
///
/// Bindings are kept sorted by index, so two descriptions listing the same
/// bindings in a different order are equal and hash alike. Binding indices
/// are unique within a description.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindingSetDescription {
    bindings: Vec<BindingDesc>,
}

impl BindingSetDescription {
    /// Builds a description from bindings in any order.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DuplicateBinding`] if two bindings share an index.
    pub fn new(bindings: impl IntoIterator<Item = BindingDesc>) -> RhiResult<Self> {
        let mut bindings: Vec<BindingDesc> = bindings.into_iter().collect();
        bindings.sort_by_key(|b| b.binding);
        if let Some(pair) = bindings.windows(2).find(|w| w[0].binding == w[1].binding) {
            return Err(RhiError::DuplicateBinding(pair[0].binding));
        }
        Ok(Self { bindings })
    }

    /// Bindings in ascending index order.
    pub fn bindings(&self) -> &[BindingDesc] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn get(&self, binding: u32) -> Option<&BindingDesc> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .ok()
            .map(|i| &self.bindings[i])
    }
}

/// Device-scoped cache of descriptor set layouts.
///
/// Lookups hash the description and then compare it field by field, so two
/// structurally different descriptions never share a layout even if their
/// hashes collide. Layouts live until the cache is dropped.
pub struct LayoutCache {
    driver: Arc<dyn Driver>,
    layouts: HashMap<BindingSetDescription, LayoutHandle>,
}

impl LayoutCache {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            layouts: HashMap::new(),
        }
    }

    /// Returns the layout for `desc`, creating it on first request.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails. Nothing is cached in that case.
    pub fn get_or_create(&mut self, desc: &BindingSetDescription) -> RhiResult<LayoutHandle> {
        if let Some(&handle) = self.layouts.get(desc) {
            return Ok(handle);
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding<'static>> =
            desc.bindings().iter().map(BindingDesc::to_vk).collect();
        let raw = self.driver.create_descriptor_set_layout(&bindings)?;
        let handle = LayoutHandle::new(raw);
        self.layouts.insert(desc.clone(), handle);

        debug!(
            "Created descriptor set layout with {} bindings ({} cached)",
            desc.len(),
            self.layouts.len()
        );
        Ok(handle)
    }

    /// Number of distinct layouts created so far.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

impl Drop for LayoutCache {
    fn drop(&mut self) {
        for (_, handle) in self.layouts.drain() {
            self.driver.destroy_descriptor_set_layout(handle.raw());
        }
    }
}
