//! Core utilities for the renderer.
//!
//! This crate provides foundational types and utilities used across the renderer:
//! - Error types and result aliases
//! - Logging initialization
//! - Timer utilities
//! - Configuration loading and the variable registry

mod config;
mod error;
mod logging;
mod timer;
mod vars;

pub use config::{AssetConfig, Config, RendererConfig};
pub use error::{Error, Result};
pub use logging::{init_logging, init_logging_with};
pub use timer::{ScopedTimer, Timer};
pub use vars::{VarFlags, VarRegistry, VarValue};
