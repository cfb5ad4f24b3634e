//! Descriptor set management for shader resource binding.
//!
//! - [`LayoutCache`] deduplicates descriptor set layouts: structurally equal
//!   binding sets share one layout object.
//! - [`DescriptorAllocatorPool`] hands out descriptor sets from a growable
//!   list of pools and resets them all at once.
//! - [`DescriptorBuilder`] assembles one binding set by value and resolves it
//!   through the two above.
//!
//! The cache and the allocator are device-scoped objects passed explicitly
//! to every builder. Neither is safe for concurrent mutation; the render
//! thread owns them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use vesta_rhi::Driver;
//! use vesta_rhi::descriptor::{
//!     BufferBinding, DescriptorAllocatorPool, DescriptorBuilder, DescriptorKind, GrowthPolicy,
//!     LayoutCache,
//! };
//!
//! # fn example(driver: Arc<dyn Driver>, uniforms: vk::Buffer) -> Result<(), vesta_rhi::RhiError> {
//! let mut cache = LayoutCache::new(driver.clone());
//! let mut allocator = DescriptorAllocatorPool::new(driver, GrowthPolicy::default());
//!
//! let (set, layout) = DescriptorBuilder::new()
//!     .bind_buffer(
//!         0,
//!         DescriptorKind::UniformBuffer,
//!         vk::ShaderStageFlags::VERTEX,
//!         BufferBinding::whole(uniforms),
//!     )
//!     .build(&mut cache, &mut allocator)?;
//! # Ok(())
//! # }
//! ```

mod allocator;
mod builder;
mod layout;

pub use allocator::{DescriptorAllocatorPool, GrowthKind, GrowthPolicy};
pub use builder::{BufferBinding, DescriptorBuilder, ImageBinding};
pub use layout::{BindingDesc, BindingSetDescription, LayoutCache};

use ash::vk;

/// The kind of resource a binding exposes to shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    Sampler,
}

impl DescriptorKind {
    pub const ALL: [DescriptorKind; 8] = [
        DescriptorKind::UniformBuffer,
        DescriptorKind::StorageBuffer,
        DescriptorKind::UniformBufferDynamic,
        DescriptorKind::StorageBufferDynamic,
        DescriptorKind::CombinedImageSampler,
        DescriptorKind::SampledImage,
        DescriptorKind::StorageImage,
        DescriptorKind::Sampler,
    ];

    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            DescriptorKind::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        }
    }

    /// Whether bindings of this kind are written with buffer infos.
    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            DescriptorKind::UniformBuffer
                | DescriptorKind::StorageBuffer
                | DescriptorKind::UniformBufferDynamic
                | DescriptorKind::StorageBufferDynamic
        )
    }

    /// Whether bindings of this kind are written with image infos.
    pub fn is_image(self) -> bool {
        !self.is_buffer()
    }
}

/// Creates a descriptor buffer info.
#[inline]
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range)
}

/// Creates a descriptor image info.
#[inline]
pub fn image_info(
    sampler: vk::Sampler,
    image_view: vk::ImageView,
    image_layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(image_layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_to_vk() {
        assert_eq!(
            DescriptorKind::UniformBuffer.to_vk(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            DescriptorKind::StorageBufferDynamic.to_vk(),
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
        );
        assert_eq!(
            DescriptorKind::CombinedImageSampler.to_vk(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(DescriptorKind::Sampler.to_vk(), vk::DescriptorType::SAMPLER);
    }

    #[test]
    fn test_kind_buffer_image_split() {
        let buffers = DescriptorKind::ALL.iter().filter(|k| k.is_buffer()).count();
        let images = DescriptorKind::ALL.iter().filter(|k| k.is_image()).count();
        assert_eq!(buffers, 4);
        assert_eq!(images, 4);
        assert!(DescriptorKind::StorageImage.is_image());
    }

    #[test]
    fn test_buffer_info_helper() {
        let info = buffer_info(vk::Buffer::null(), 64, 128);
        assert_eq!(info.buffer, vk::Buffer::null());
        assert_eq!(info.offset, 64);
        assert_eq!(info.range, 128);
    }

    #[test]
    fn test_image_info_helper() {
        let info = image_info(
            vk::Sampler::null(),
            vk::ImageView::null(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(info.sampler, vk::Sampler::null());
        assert_eq!(info.image_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}
