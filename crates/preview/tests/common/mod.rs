//! Shared test utilities for preview integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated dispatchers over temp directories
//! - `ConfigBuilder` for creating configurations programmatically
//! - Scripted renderers that stand in for soffice, ImageMagick and the encoder

pub mod builders;
pub mod harness;
pub mod renderers;

pub use builders::*;
pub use harness::{wait_until, InProgressCounter, TestHarness, UnwritableStorage};
pub use renderers::*;
