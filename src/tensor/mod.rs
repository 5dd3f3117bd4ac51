//! Dense CPU tensors and spatial resampling.

pub mod core;
pub mod resample;

// Re-export main types for convenience
pub use self::core::{spatial3, Shape, Tensor};
pub use resample::{resample, resize, resize_sample, Interpolation, ResampleCache};
