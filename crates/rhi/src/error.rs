//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No GPU offers graphics + present queues and the swapchain extension
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// SPIR-V loading or shader module error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface query error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// A handle or index that does not refer to a live object
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Descriptor allocation failed even after growing the pool set
    #[error("Descriptor pools exhausted: {0}")]
    DescriptorPoolExhausted(String),

    /// The same binding index was declared twice in one descriptor builder
    #[error("Duplicate descriptor binding index {0}")]
    DuplicateBinding(u32),

    /// An operation was called in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
