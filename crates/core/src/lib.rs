//! Core utilities for the vesta engine.
//!
//! This crate provides foundational types and utilities used across the engine:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Configuration loading
//! - Fatal-error termination at the application boundary

pub mod config;
mod error;
mod fatal;
mod logging;
mod timer;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use fatal::{FATAL_EXIT_CODE, OrFatal, fatal};
pub use logging::init_logging;
pub use timer::FrameTimer;
