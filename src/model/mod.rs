//! Reference model collaborator
//!
//! A small decoder-style transformer exposing the uniform surface the
//! blockwise core needs: an ordered block list, per-block forward
//! invocation, named sub-modules with swappable weight representations,
//! and a prefix that produces first-block inputs from calibration samples.

mod block;
mod linear;
mod transformer;

pub use block::{Block, SUB_MODULE_NAMES};
pub use linear::{Linear, WeightRepr};
pub use transformer::{Transformer, TransformerConfig};
