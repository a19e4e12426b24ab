//! Core types shared across nanoalign crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Pipeline configuration with TOML support
//! - Compute device resolution

pub mod config;
pub mod device;
pub mod error;

pub use config::{
    EvalConfig, IntervalStrategy, MetricsFormat, ModelSourceConfig, OutputConfig, PipelineConfig,
    PpoConfig, RewardConfig, SftConfig,
};
pub use device::resolve_device;
pub use error::{AlignError, IoResultExt, Result};
