//! Observation hooks for the block loop
//!
//! Callbacks see loop progress but cannot steer it: the block sequence is
//! fixed by the model, so the hooks carry no control-flow return value.
//!
//! # Example
//!
//! ```rust
//! use comprimir::blockwise::{BlockContext, LoopCallback};
//!
//! struct FallbackCounter(usize);
//!
//! impl LoopCallback for FallbackCounter {
//!     fn on_block_end(&mut self, ctx: &BlockContext) {
//!         self.0 += ctx.num_fallbacks;
//!     }
//! }
//! ```

/// Loop state passed to callbacks
#[derive(Clone, Debug)]
pub struct BlockContext {
    /// Current block (0-indexed)
    pub block_index: usize,
    /// Total blocks in the model
    pub num_blocks: usize,
    /// Transform method name
    pub method: String,
    /// Identity fallbacks recorded for the current block
    pub num_fallbacks: usize,
    /// Cached input entries (constant across blocks)
    pub cache_entries: usize,
    /// Approximate bytes held by the activation cache
    pub cache_bytes: usize,
    /// Seconds since the loop started
    pub elapsed_secs: f64,
}

/// Trait for block-loop observers
///
/// All methods have default no-op implementations, so an observer only
/// implements the events it cares about.
pub trait LoopCallback {
    /// Called once before the first block
    fn on_loop_begin(&mut self, _ctx: &BlockContext) {}

    /// Called before each block's transform
    fn on_block_begin(&mut self, _ctx: &BlockContext) {}

    /// Called after each block's transform and replay
    fn on_block_end(&mut self, _ctx: &BlockContext) {}

    /// Called once after the last block
    fn on_loop_end(&mut self, _ctx: &BlockContext) {}

    /// Observer name for diagnostics
    fn name(&self) -> &str {
        "LoopCallback"
    }
}

/// Prints per-block progress to stdout
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl LoopCallback for ConsoleReporter {
    fn on_loop_begin(&mut self, ctx: &BlockContext) {
        println!(
            "compress[{}]: {} blocks, {} calibration samples",
            ctx.method, ctx.num_blocks, ctx.cache_entries
        );
    }

    fn on_block_end(&mut self, ctx: &BlockContext) {
        println!(
            "compress[{}]: block {}/{} done, {} fallbacks, cache {:.1} KiB, {:.2}s",
            ctx.method,
            ctx.block_index + 1,
            ctx.num_blocks,
            ctx.num_fallbacks,
            ctx.cache_bytes as f64 / 1024.0,
            ctx.elapsed_secs
        );
    }

    fn on_loop_end(&mut self, ctx: &BlockContext) {
        println!(
            "compress[{}]: finished {} blocks in {:.2}s",
            ctx.method, ctx.num_blocks, ctx.elapsed_secs
        );
    }

    fn name(&self) -> &str {
        "ConsoleReporter"
    }
}
