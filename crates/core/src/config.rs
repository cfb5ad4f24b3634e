//! Engine configuration loaded from TOML.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a runnable configuration:
//!
//! ```toml
//! [window]
//! title = "vesta"
//! width = 800
//! height = 600
//!
//! [renderer]
//! frames_in_flight = 2
//! present_mode = "fifo"
//!
//! [descriptors]
//! growth = "doubling"
//! initial_sets = 64
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Upper bound on frames in flight; more only adds latency.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub renderer: RendererConfig,
    pub descriptors: DescriptorConfig,
    pub shaders: ShaderConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vesta".to_string(),
            width: 800,
            height: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeConfig {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    pub frames_in_flight: u32,
    pub present_mode: PresentModeConfig,
    pub validation: bool,
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            present_mode: PresentModeConfig::Fifo,
            validation: cfg!(debug_assertions),
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrowthKind {
    /// Every new pool has `initial_sets` capacity.
    Fixed,
    /// Each new pool doubles the previous capacity, up to `max_sets_per_pool`.
    #[default]
    Doubling,
}

/// Descriptor kinds a pool reserves room for, as multipliers of the pool's set count.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolRatios {
    pub uniform_buffer: f32,
    pub storage_buffer: f32,
    pub uniform_buffer_dynamic: f32,
    pub storage_buffer_dynamic: f32,
    pub combined_image_sampler: f32,
    pub sampled_image: f32,
    pub storage_image: f32,
    pub sampler: f32,
}

impl Default for PoolRatios {
    fn default() -> Self {
        Self {
            uniform_buffer: 2.0,
            storage_buffer: 2.0,
            uniform_buffer_dynamic: 1.0,
            storage_buffer_dynamic: 1.0,
            combined_image_sampler: 4.0,
            sampled_image: 4.0,
            storage_image: 1.0,
            sampler: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DescriptorConfig {
    pub growth: GrowthKind,
    pub initial_sets: u32,
    pub max_sets_per_pool: u32,
    pub max_pools: u32,
    pub pool_ratios: PoolRatios,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            growth: GrowthKind::Doubling,
            initial_sets: 64,
            max_sets_per_pool: 4096,
            max_pools: 32,
            pool_ratios: PoolRatios::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path`, or defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// fails [`EngineConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let config = Self::from_toml(&text)?;
                tracing::info!("Loaded configuration from {}", path.display());
                config
            }
            None => {
                tracing::debug!("No configuration file given, using defaults");
                Self::default()
            }
        };
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the renderer at runtime.
    pub fn validate(&self) -> Result<()> {
        let frames = self.renderer.frames_in_flight;
        if frames == 0 || frames > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, frames
            )));
        }

        let descriptors = &self.descriptors;
        if descriptors.initial_sets == 0 {
            return Err(Error::Config("initial_sets must be non-zero".to_string()));
        }
        if descriptors.max_sets_per_pool < descriptors.initial_sets {
            return Err(Error::Config(format!(
                "max_sets_per_pool ({}) is smaller than initial_sets ({})",
                descriptors.max_sets_per_pool, descriptors.initial_sets
            )));
        }
        if descriptors.max_pools == 0 {
            return Err(Error::Config("max_pools must be non-zero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.renderer.frames_in_flight, 2);
        assert_eq!(config.renderer.present_mode, PresentModeConfig::Fifo);
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml(
            r#"
            [renderer]
            frames_in_flight = 3
            present_mode = "mailbox"

            [descriptors]
            growth = "fixed"
            initial_sets = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.renderer.frames_in_flight, 3);
        assert_eq!(config.renderer.present_mode, PresentModeConfig::Mailbox);
        assert_eq!(config.descriptors.growth, GrowthKind::Fixed);
        assert_eq!(config.descriptors.initial_sets, 16);
        assert_eq!(config.descriptors.max_pools, 32);
        assert_eq!(config.window.title, "vesta");
    }

    #[test]
    fn test_rejects_zero_frames_in_flight() {
        let result = EngineConfig::from_toml("[renderer]\nframes_in_flight = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_too_many_frames_in_flight() {
        let result = EngineConfig::from_toml("[renderer]\nframes_in_flight = 4\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_pool_cap_below_initial() {
        let result = EngineConfig::from_toml(
            "[descriptors]\ninitial_sets = 128\nmax_sets_per_pool = 64\n",
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_present_mode_is_parse_error() {
        let result = EngineConfig::from_toml("[renderer]\npresent_mode = \"vsync\"\n");
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }

    #[test]
    fn test_load_without_path_uses_defaults() {
        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = EngineConfig::load(Some(Path::new("/nonexistent/vesta.toml")));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
