//! The `utils` module provides a collection of utility functions and common
//! definitions used across `switchyard`.
//!
//! This module centralizes the error taxonomy, logging setup, metric counters
//! and the command-handler map consumed by external control surfaces.

pub mod commands;
pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Error, Result};
