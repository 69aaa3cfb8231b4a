//! Common utilities for conflux
//!
//! This crate provides the error type shared by the conflux crates.

pub mod error;

pub use error::{ConfluxError, Result};
