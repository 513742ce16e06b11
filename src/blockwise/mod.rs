//! Blockwise compression: loop driver, deployment, observation hooks

mod callback;
mod optimizer;

pub use callback::{BlockContext, ConsoleReporter, LoopCallback};
pub use optimizer::{BlockwiseOptimizer, DeployMode};
