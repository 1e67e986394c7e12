//! Test harness for the Stratum GPU resource layer.
//!
//! Provides headless device fixtures and end-to-end scenario tests.

pub mod harness;
#[cfg(test)]
mod scenarios;

pub use harness::{compare_images, pattern, TestDevice};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] stratum_gpu::GpuError),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("Validation failed: {0:?}")]
    Violations(Vec<String>),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;
