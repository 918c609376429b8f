//! Core infrastructure layer for the Lumen display stack.
//!
//! This crate provides the foundational pieces shared by the buffer queue
//! and the compositor: geometry primitives ([`types::geometry`]),
//! configuration loading ([`config`]), logging initialization ([`logging`])
//! and the common error types ([`error`]).

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::CompositorConfig;
pub use error::{ConfigError, CoreError};
pub use types::geometry::{Rect, Region};
