//! Shared value types for the Lumen display stack.

pub mod geometry;

pub use geometry::{Rect, Region};
