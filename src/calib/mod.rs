//! Calibration data contract
//!
//! - `sample`: calibration samples (token or vision+text) and the
//!   per-sample block invocation arguments
//! - `source`: first-block input capture against a model
//! - `cache`: the single-writer cache the blockwise loop swaps per block

mod cache;
mod sample;
mod source;

pub use cache::BlockInputCache;
pub use sample::{BlockArgs, CalibSample};
pub use source::CalibrationSource;
