//! Fluent assembly of one descriptor set.

use ash::vk;

use super::{
    BindingDesc, BindingSetDescription, DescriptorAllocatorPool, DescriptorKind, LayoutCache,
};
use crate::error::{RhiError, RhiResult};
use crate::handle::{DescriptorSetHandle, LayoutHandle};

/// A buffer range bound to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub range: vk::DeviceSize,
}

impl BufferBinding {
    pub fn new(buffer: vk::Buffer, offset: vk::DeviceSize, range: vk::DeviceSize) -> Self {
        Self {
            buffer,
            offset,
            range,
        }
    }

    /// The whole buffer.
    pub fn whole(buffer: vk::Buffer) -> Self {
        Self::new(buffer, 0, vk::WHOLE_SIZE)
    }
}

/// An image (and/or sampler) bound to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBinding {
    pub sampler: vk::Sampler,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
}

impl ImageBinding {
    /// A view read by shaders, with an optional sampler.
    pub fn sampled(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self {
            sampler,
            view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// A view written by shaders as a storage image.
    pub fn storage(view: vk::ImageView) -> Self {
        Self {
            sampler: vk::Sampler::null(),
            view,
            layout: vk::ImageLayout::GENERAL,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Resource {
    Buffer(BufferBinding),
    Image(ImageBinding),
    DescribedBuffer,
    DescribedImage,
}

impl Resource {
    fn is_described(self) -> bool {
        matches!(self, Resource::DescribedBuffer | Resource::DescribedImage)
    }
}

/// Assembles a binding set, then resolves it to a layout and a set.
///
/// The builder is consumed by value: each `bind_*` call returns it back, and
/// [`build`](Self::build) or [`build_layout_only`](Self::build_layout_only)
/// finish it. Mistakes made while binding (a repeated index, a buffer given
/// for an image kind) are reported by the finishing call.
///
/// ```no_run
/// # use ash::vk;
/// # use vesta_rhi::descriptor::{DescriptorBuilder, DescriptorKind, LayoutCache};
/// # fn example(cache: &mut LayoutCache) -> Result<(), vesta_rhi::RhiError> {
/// let layout = DescriptorBuilder::new()
///     .describe_buffer(0, DescriptorKind::UniformBuffer, vk::ShaderStageFlags::VERTEX)
///     .build_layout_only(cache)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct DescriptorBuilder {
    bindings: Vec<(BindingDesc, Resource)>,
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a buffer range at `index`.
    pub fn bind_buffer(
        self,
        index: u32,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
        buffer: BufferBinding,
    ) -> Self {
        self.push(index, kind, stages, Resource::Buffer(buffer))
    }

    /// Binds an image at `index`.
    pub fn bind_image(
        self,
        index: u32,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
        image: ImageBinding,
    ) -> Self {
        self.push(index, kind, stages, Resource::Image(image))
    }

    /// Declares a buffer binding without a resource, for layout-only builds.
    pub fn describe_buffer(
        self,
        index: u32,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.push(index, kind, stages, Resource::DescribedBuffer)
    }

    /// Declares an image binding without a resource, for layout-only builds.
    pub fn describe_image(
        self,
        index: u32,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.push(index, kind, stages, Resource::DescribedImage)
    }

    fn push(
        mut self,
        index: u32,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
        resource: Resource,
    ) -> Self {
        self.bindings
            .push((BindingDesc::new(index, kind, stages), resource));
        self
    }

    /// The binding set this builder describes.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::DuplicateBinding`] if an index was bound twice,
    /// or [`RhiError::InvalidState`] if a resource does not match its kind.
    pub fn description(&self) -> RhiResult<BindingSetDescription> {
        for (desc, resource) in &self.bindings {
            let matches_kind = match resource {
                Resource::Buffer(_) | Resource::DescribedBuffer => desc.kind.is_buffer(),
                Resource::Image(_) | Resource::DescribedImage => desc.kind.is_image(),
            };
            if !matches_kind {
                return Err(RhiError::InvalidState(format!(
                    "binding {} of kind {:?} given the wrong resource type",
                    desc.binding, desc.kind
                )));
            }
        }
        BindingSetDescription::new(self.bindings.iter().map(|(desc, _)| *desc))
    }

    /// Resolves only the layout, through the cache. No set is allocated.
    pub fn build_layout_only(self, cache: &mut LayoutCache) -> RhiResult<LayoutHandle> {
        let description = self.description()?;
        cache.get_or_create(&description)
    }

    /// Resolves the layout, allocates a fresh set and writes every binding.
    ///
    /// Each call allocates a new set, even for an identical builder.
    ///
    /// # Errors
    ///
    /// Fails like [`description`](Self::description), if a binding was only
    /// described, or if layout creation or allocation fails. Nothing is
    /// written when an error is returned.
    pub fn build(
        self,
        cache: &mut LayoutCache,
        allocator: &mut DescriptorAllocatorPool,
    ) -> RhiResult<(DescriptorSetHandle, LayoutHandle)> {
        let description = self.description()?;
        if let Some((desc, _)) = self
            .bindings
            .iter()
            .find(|(_, resource)| resource.is_described())
        {
            return Err(RhiError::InvalidState(format!(
                "binding {} has no resource; use build_layout_only for layouts",
                desc.binding
            )));
        }

        let layout = cache.get_or_create(&description)?;
        let set = allocator.allocate(layout)?;

        let buffer_infos: Vec<(u32, DescriptorKind, vk::DescriptorBufferInfo)> = self
            .bindings
            .iter()
            .filter_map(|(desc, resource)| match resource {
                Resource::Buffer(b) => Some((
                    desc.binding,
                    desc.kind,
                    super::buffer_info(b.buffer, b.offset, b.range),
                )),
                _ => None,
            })
            .collect();
        let image_infos: Vec<(u32, DescriptorKind, vk::DescriptorImageInfo)> = self
            .bindings
            .iter()
            .filter_map(|(desc, resource)| match resource {
                Resource::Image(i) => Some((
                    desc.binding,
                    desc.kind,
                    super::image_info(i.sampler, i.view, i.layout),
                )),
                _ => None,
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet<'_>> = buffer_infos
            .iter()
            .map(|(binding, kind, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set.raw())
                    .dst_binding(*binding)
                    .descriptor_type(kind.to_vk())
                    .buffer_info(std::slice::from_ref(info))
            })
            .chain(image_infos.iter().map(|(binding, kind, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set.raw())
                    .dst_binding(*binding)
                    .descriptor_type(kind.to_vk())
                    .image_info(std::slice::from_ref(info))
            }))
            .collect();

        if !writes.is_empty() {
            allocator.driver().update_descriptor_sets(&writes);
        }

        Ok((set, layout))
    }
}
