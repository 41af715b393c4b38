//! Shared test utilities for carnet integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against a file-backed database
//! - Builders and renderers for seeding drivers and forcing failures

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
