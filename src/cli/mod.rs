//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running an edit from a requests file
//! - Inspecting the sparsity schedule

pub mod commands;
pub mod handlers;

pub use handlers::{handle_edit, handle_schedule};
