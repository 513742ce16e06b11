//! comprimir: blockwise post-training compression for transformer models
//!
//! The crate implements the calibrate-transform-replay loop: capture the
//! inputs of the first block from a calibration set, then walk the blocks
//! in order, computing compression parameters for each block against the
//! outputs of the already-transformed blocks before it. Only one block's
//! activations are live at a time.
//!
//! # Example
//!
//! ```rust
//! use comprimir::{
//!     BlockwiseOptimizer, CalibSample, CalibrationSource, CompressSpec, DeployMode,
//!     Transformer, TransformerConfig, TransformRegistry,
//! };
//!
//! let model = Transformer::new_seeded(TransformerConfig::tiny(2), 0).unwrap();
//! let samples = (0..4)
//!     .map(|i| CalibSample::Tokens(vec![i, 1, 2, 3]))
//!     .collect();
//!
//! let mut source = CalibrationSource::new(samples).unwrap();
//! source.capture_first_block_input(&model).unwrap();
//!
//! let spec = CompressSpec::for_method("rtn");
//! let transform = TransformRegistry::with_builtins().build(&spec).unwrap();
//!
//! let mut optimizer =
//!     BlockwiseOptimizer::new(model, source.take_first_block_input().unwrap(), transform)
//!         .unwrap();
//! optimizer.run_block_loop().unwrap();
//! optimizer.deploy(DeployMode::RealQuant).unwrap();
//! ```

pub mod blockwise;
pub mod calib;
pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod quant;
pub mod tensor;
pub mod transform;

pub use blockwise::{BlockContext, BlockwiseOptimizer, ConsoleReporter, DeployMode, LoopCallback};
pub use calib::{BlockArgs, BlockInputCache, CalibSample, CalibrationSource};
pub use config::{CompressSpec, FallbackPolicy};
pub use error::{Error, Result};
pub use export::{save_model, ExportFormat, ModelState};
pub use model::{Block, Linear, Transformer, TransformerConfig};
pub use quant::{Granularity, PackedTensor, QuantMode, QuantParams};
pub use tensor::Tensor;
pub use transform::{BlockTransform, TransformParams, TransformRegistry};
