//! modelvault library
//!
//! A Rust library for acquiring large model artifacts over HTTP with
//! chunked, resumable, concurrent transfers, streaming integrity
//! verification, and content-addressed storage with disk-space management.

pub mod app;
pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};
