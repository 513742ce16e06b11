//! The blockwise compression loop and deployment
//!
//! Blocks are processed strictly in model order. For block `i` the loop
//! applies the transform against the cached inputs, replays those inputs
//! through the now-transformed block, and swaps the cache to the outputs.
//! Block `i + 1` therefore calibrates against the signal it will actually
//! see at inference time, and only one block's activations are ever live.

use crate::blockwise::{BlockContext, LoopCallback};
use crate::calib::{BlockArgs, BlockInputCache};
use crate::config::CompressSpec;
use crate::error::{Error, Result};
use crate::model::{Linear, Transformer};
use crate::quant::{fake_quantized, PackedTensor, QuantMode};
use crate::tensor::Tensor;
use crate::transform::{
    rotate_weights, BlockTransform, ModuleRecord, ModuleTransform, TransformParams,
    TransformRegistry,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

/// How transform parameters are materialized into the model
///
/// Deployment is a pure function of the recorded original weights, the
/// transform parameters, and the mode. Switching modes is idempotent and
/// reversible, with one caveat: [`DeployMode::RealQuant`] stores group
/// scales in f16, so its forward output differs slightly from the f32
/// fake-quantized simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Original float weights, transforms recorded but not applied
    OriginalFloat,
    /// f32 weights carrying the simulated transform
    FakeQuant,
    /// Packed reduced-precision storage where the grid supports it
    /// (symmetric, 4 or 8 bits); other grids keep the f32 simulation
    RealQuant,
    /// Rotations applied at full precision, ready for training
    TrainRotate,
}

impl DeployMode {
    /// Stable name for serialized metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::OriginalFloat => "original_float",
            DeployMode::FakeQuant => "fake_quant",
            DeployMode::RealQuant => "real_quant",
            DeployMode::TrainRotate => "train_rotate",
        }
    }
}

/// Drives one compression run over a model
pub struct BlockwiseOptimizer {
    model: Transformer,
    cache: BlockInputCache,
    transform: Box<dyn BlockTransform>,
    params: Vec<Option<TransformParams>>,
    callbacks: Vec<Box<dyn LoopCallback>>,
    activation_budget_bytes: Option<usize>,
    mode: DeployMode,
    completed: bool,
}

impl BlockwiseOptimizer {
    /// Create from a model, the captured first-block inputs, and a transform
    pub fn new(
        model: Transformer,
        first_block_inputs: Vec<BlockArgs>,
        transform: Box<dyn BlockTransform>,
    ) -> Result<Self> {
        let cache = BlockInputCache::new(first_block_inputs)?;
        let num_blocks = model.num_blocks();
        Ok(Self {
            model,
            cache,
            transform,
            params: vec![None; num_blocks],
            callbacks: Vec::new(),
            activation_budget_bytes: None,
            mode: DeployMode::OriginalFloat,
            completed: false,
        })
    }

    /// Build from a spec: transform resolved through the registry, the
    /// activation budget wired from `spec.activation_budget_bytes`
    pub fn from_spec(
        model: Transformer,
        first_block_inputs: Vec<BlockArgs>,
        registry: &TransformRegistry,
        spec: &CompressSpec,
    ) -> Result<Self> {
        let transform = registry.build(spec)?;
        Ok(Self::new(model, first_block_inputs, transform)?
            .with_activation_budget(spec.activation_budget_bytes))
    }

    /// Cap the bytes the activation cache may hold per block
    pub fn with_activation_budget(mut self, bytes: Option<usize>) -> Self {
        self.activation_budget_bytes = bytes;
        self
    }

    /// Register a loop observer
    pub fn add_callback(&mut self, callback: Box<dyn LoopCallback>) {
        self.callbacks.push(callback);
    }

    /// The model in its current deployment state
    pub fn model(&self) -> &Transformer {
        &self.model
    }

    /// Current deployment mode
    pub fn mode(&self) -> DeployMode {
        self.mode
    }

    /// Recorded parameters per block, `None` until the loop has run
    pub fn block_params(&self, block_index: usize) -> Option<&TransformParams> {
        self.params.get(block_index).and_then(Option::as_ref)
    }

    fn check_budget(&self, block_index: usize, stage: &str) -> Result<usize> {
        let cache_bytes = self.cache.approx_bytes();
        if let Some(budget) = self.activation_budget_bytes {
            if cache_bytes > budget {
                return Err(Error::ResourceExhaustion(format!(
                    "activation cache holds {cache_bytes} bytes {stage} block \
                     {block_index}, budget is {budget}"
                )));
            }
        }
        Ok(cache_bytes)
    }

    /// Run the transform over every block, in order
    ///
    /// After this the model holds the simulated transform (the state the
    /// downstream blocks calibrated against), every block has recorded
    /// parameters, and [`Self::mode`] reports the transform's
    /// calibration-time representation. The loop runs at most once per
    /// optimizer.
    pub fn run_block_loop(&mut self) -> Result<()> {
        if self.completed {
            return Err(Error::Config(
                "block loop has already run for this optimizer".into(),
            ));
        }

        let start = Instant::now();
        let num_blocks = self.model.num_blocks();
        let mut ctx = BlockContext {
            block_index: 0,
            num_blocks,
            method: self.transform.name().to_string(),
            num_fallbacks: 0,
            cache_entries: self.cache.len(),
            cache_bytes: self.cache.approx_bytes(),
            elapsed_secs: 0.0,
        };
        for cb in &mut self.callbacks {
            cb.on_loop_begin(&ctx);
        }

        for block_index in 0..num_blocks {
            let cache_bytes = self.check_budget(block_index, "entering")?;

            ctx.block_index = block_index;
            ctx.cache_bytes = cache_bytes;
            ctx.elapsed_secs = start.elapsed().as_secs_f64();
            for cb in &mut self.callbacks {
                cb.on_block_begin(&ctx);
            }

            let params =
                self.transform
                    .apply(self.model.block_mut(block_index), self.cache.get(), block_index)?;
            ctx.num_fallbacks = params.num_fallbacks();
            self.params[block_index] = Some(params);

            // Replay through the transformed block; the swap drops the
            // previous generation of activations.
            let block = self.model.block(block_index);
            let next: Vec<BlockArgs> = self
                .cache
                .get()
                .iter()
                .map(|args| Ok(args.with_hidden(block.forward(args)?)))
                .collect::<Result<_>>()?;
            self.cache.set(next)?;
            self.check_budget(block_index, "after replaying")?;

            ctx.cache_bytes = self.cache.approx_bytes();
            ctx.elapsed_secs = start.elapsed().as_secs_f64();
            for cb in &mut self.callbacks {
                cb.on_block_end(&ctx);
            }
        }

        self.completed = true;
        self.mode = self.transform.calibration_mode();
        ctx.elapsed_secs = start.elapsed().as_secs_f64();
        for cb in &mut self.callbacks {
            cb.on_loop_end(&ctx);
        }
        Ok(())
    }

    /// Materialize every block's parameters under the given mode
    ///
    /// Fails without touching the model if any block has no parameters.
    pub fn deploy(&mut self, mode: DeployMode) -> Result<()> {
        if let Some(missing) = self.params.iter().position(Option::is_none) {
            return Err(Error::Deploy(format!(
                "block {missing} has no transform parameters; run the block loop first"
            )));
        }

        for (block_index, params) in self.params.iter().enumerate() {
            let params = params.as_ref().ok_or_else(|| {
                Error::Deploy(format!("block {block_index} has no transform parameters"))
            })?;
            let block = self.model.block_mut(block_index);
            for (name, record) in params.modules() {
                let module = block.sub_module_mut(name).ok_or_else(|| {
                    Error::Deploy(format!("block {block_index} has no sub-module '{name}'"))
                })?;
                materialize(module, record, mode)?;
            }
        }

        self.mode = mode;
        Ok(())
    }

    /// Handles to every trainable parameter created by the transforms
    ///
    /// The handles share gradient storage with the recorded parameters, so
    /// an outer training loop can accumulate into them directly.
    pub fn get_trainable_params(&self) -> Vec<Tensor> {
        self.params
            .iter()
            .flatten()
            .flat_map(TransformParams::modules)
            .filter_map(|(_, record)| match &record.transform {
                ModuleTransform::Rotate { rotation, .. } if rotation.requires_grad() => {
                    Some(rotation.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Write the model in its current deployment state to disk
    ///
    /// The format is chosen by file extension (json, yaml, safetensors).
    pub fn save_model(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::export::save_model(&self.model, self.mode, path.as_ref())
    }
}

fn materialize(module: &mut Linear, record: &ModuleRecord, mode: DeployMode) -> Result<()> {
    let (rows, _) = record.shape;
    match (mode, &record.transform) {
        (DeployMode::OriginalFloat, _) => module.set_float(record.original.clone()),

        (DeployMode::TrainRotate, ModuleTransform::Rotate { rotation, .. }) => {
            let r = rotation.data().to_vec();
            module.set_float(rotate_weights(&r, &record.original, record.shape)?)
        }
        (DeployMode::TrainRotate, _) => module.set_float(record.original.clone()),

        (DeployMode::FakeQuant | DeployMode::RealQuant, transform) => match transform {
            ModuleTransform::Quant { weight, .. } => {
                if mode == DeployMode::RealQuant
                    && weight.mode == QuantMode::Symmetric
                    && (weight.bits == 4 || weight.bits == 8)
                {
                    let group = weight.group_len(record.original.len(), rows);
                    module.set_packed(PackedTensor::pack(&record.original, weight.bits, group)?)
                } else {
                    // Packed storage is symmetric max-abs at 4 or 8 bits.
                    // Asymmetric grids would lose their zero points in that
                    // layout, and other widths have no packed layout at all;
                    // both keep the f32 simulation.
                    module.set_float(fake_quantized(&record.original, rows, weight))
                }
            }
            ModuleTransform::Sparse { mask, .. } => {
                let mut weights = record.original.clone();
                for (v, keep) in weights.iter_mut().zip(mask.iter()) {
                    if !keep {
                        *v = 0.0;
                    }
                }
                module.set_float(weights)
            }
            ModuleTransform::Rotate { rotation, .. } => {
                let r = rotation.data().to_vec();
                module.set_float(rotate_weights(&r, &record.original, record.shape)?)
            }
            ModuleTransform::Identity { .. } => module.set_float(record.original.clone()),
        },
    }
}
