//! Weight pruning to a target sparsity
//!
//! Two importance metrics: plain magnitude |w|, and activation-weighted
//! |w|·‖x_j‖ where ‖x_j‖ is the RMS norm of input feature j observed over
//! the cached block inputs. The activation-weighted metric makes the mask
//! depend on the realistic forward signal of the preceding blocks.

use crate::calib::BlockArgs;
use crate::config::{CompressSpec, FallbackPolicy, SparsityMetric};
use crate::error::{Error, Result};
use crate::model::{Block, SUB_MODULE_NAMES};
use crate::transform::{
    resolve_fallback, BlockTransform, ModuleRecord, ModuleTransform, TransformParams,
};
use std::collections::BTreeMap;

/// Magnitude / activation-weighted pruning
#[derive(Clone, Debug)]
pub struct MagnitudePrune {
    sparsity: f32,
    metric: SparsityMetric,
    fallback: FallbackPolicy,
}

impl MagnitudePrune {
    /// Build from a validated spec
    pub fn from_spec(spec: &CompressSpec) -> Self {
        Self {
            sparsity: spec.sparse.sparsity,
            metric: spec.sparse.metric,
            fallback: spec.fallback,
        }
    }

    fn compute_mask(
        &self,
        weights: &[f32],
        shape: (usize, usize),
        col_norms: Option<&[f32]>,
    ) -> Result<(Vec<bool>, f32)> {
        let (_, cols) = shape;
        let importance: Vec<f32> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let col = i % cols;
                let norm = col_norms.map_or(1.0, |n| n[col]);
                w.abs() * norm
            })
            .collect();

        if importance.iter().all(|&v| v <= 0.0) {
            return Err(Error::DegenerateStats(
                "all-zero importance scores".into(),
            ));
        }

        let num_pruned = (self.sparsity * weights.len() as f32).floor() as usize;
        let mut order: Vec<usize> = (0..weights.len()).collect();
        order.sort_by(|&a, &b| importance[a].total_cmp(&importance[b]));

        let mut mask = vec![true; weights.len()];
        for &idx in order.iter().take(num_pruned) {
            mask[idx] = false;
        }

        let achieved = num_pruned as f32 / weights.len() as f32;
        Ok((mask, achieved))
    }
}

impl BlockTransform for MagnitudePrune {
    fn name(&self) -> &str {
        "sparsify"
    }

    fn apply(
        &self,
        block: &mut Block,
        inputs: &[BlockArgs],
        block_index: usize,
    ) -> Result<TransformParams> {
        let col_norms = if self.metric == SparsityMetric::ActivationWeighted {
            Some(collect_col_norms(block, inputs)?)
        } else {
            None
        };

        let mut params = TransformParams::new(block_index, self.name());

        for name in SUB_MODULE_NAMES {
            let module = block.sub_module(name).expect("known name");
            let original = module.weight_values();
            let shape = module.shape();
            let norms = col_norms.as_ref().map(|m| m[name].as_slice());

            let transform = match self.compute_mask(&original, shape, norms) {
                Ok((mask, sparsity)) => {
                    block
                        .sub_module_mut(name)
                        .expect("known name")
                        .map_float_weights(|w| {
                            for (v, keep) in w.iter_mut().zip(mask.iter()) {
                                if !keep {
                                    *v = 0.0;
                                }
                            }
                        })?;
                    ModuleTransform::Sparse { mask, sparsity }
                }
                Err(err) => resolve_fallback(self.fallback, block_index, name, err)?,
            };

            params.insert(
                name,
                ModuleRecord {
                    transform,
                    original,
                    shape,
                },
            );
        }

        Ok(params)
    }
}

/// RMS norm of each input feature per sub-module, over all cached entries
fn collect_col_norms(
    block: &Block,
    inputs: &[BlockArgs],
) -> Result<BTreeMap<&'static str, Vec<f32>>> {
    let mut sums: BTreeMap<&'static str, (Vec<f64>, usize)> = BTreeMap::new();

    for args in inputs {
        let (_, taps) = block.forward_collect(args)?;
        for (name, tap) in taps {
            let entry = sums
                .entry(name)
                .or_insert_with(|| (vec![0.0; tap.ncols()], 0));
            for row in tap.rows() {
                for (j, &v) in row.iter().enumerate() {
                    entry.0[j] += (v as f64) * (v as f64);
                }
                entry.1 += 1;
            }
        }
    }

    Ok(sums
        .into_iter()
        .map(|(name, (sq, count))| {
            let norms = sq
                .into_iter()
                .map(|s| ((s / count.max(1) as f64).sqrt()) as f32)
                .collect();
            (name, norms)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::CalibSample;
    use crate::model::{Transformer, TransformerConfig};

    fn block_and_inputs() -> (Transformer, Vec<BlockArgs>) {
        let model = Transformer::new_seeded(TransformerConfig::tiny(1), 17).unwrap();
        let inputs: Vec<BlockArgs> = (0..4)
            .map(|i| {
                model
                    .prefix_forward(&CalibSample::Tokens(vec![i, 2, 4, 6]), 0)
                    .unwrap()
            })
            .collect();
        (model, inputs)
    }

    #[test]
    fn test_target_sparsity_achieved() {
        let (mut model, inputs) = block_and_inputs();
        let mut spec = CompressSpec::for_method("sparsify");
        spec.sparse.sparsity = 0.5;
        let prune = MagnitudePrune::from_spec(&spec);

        prune.apply(model.block_mut(0), &inputs, 0).unwrap();

        let weights = model.block(0).sub_module("attn.q_proj").unwrap().weight_values();
        let zeros = weights.iter().filter(|&&w| w == 0.0).count();
        assert_eq!(zeros, weights.len() / 2);
    }

    #[test]
    fn test_keeps_largest_magnitudes() {
        let (mut model, inputs) = block_and_inputs();
        let mut spec = CompressSpec::for_method("sparsify");
        spec.sparse.sparsity = 0.25;
        let prune = MagnitudePrune::from_spec(&spec);

        let before = model.block(0).sub_module("attn.q_proj").unwrap().weight_values();
        let mut sorted: Vec<f32> = before.iter().map(|w| w.abs()).collect();
        sorted.sort_by(f32::total_cmp);
        let threshold = sorted[before.len() / 4];

        prune.apply(model.block_mut(0), &inputs, 0).unwrap();
        let after = model.block(0).sub_module("attn.q_proj").unwrap().weight_values();

        for (b, a) in before.iter().zip(after.iter()) {
            if b.abs() > threshold {
                assert_eq!(a, b, "large weight {b} must survive pruning");
            }
        }
    }

    #[test]
    fn test_mask_matches_zeroed_weights() {
        let (mut model, inputs) = block_and_inputs();
        let prune = MagnitudePrune::from_spec(&CompressSpec::for_method("sparsify"));
        let params = prune.apply(model.block_mut(0), &inputs, 0).unwrap();

        let weights = model.block(0).sub_module("mlp.down_proj").unwrap().weight_values();
        match &params.get("mlp.down_proj").unwrap().transform {
            ModuleTransform::Sparse { mask, .. } => {
                for (w, keep) in weights.iter().zip(mask.iter()) {
                    if !keep {
                        assert_eq!(*w, 0.0);
                    }
                }
            }
            other => panic!("expected sparse record, got {other:?}"),
        }
    }

    #[test]
    fn test_activation_weighted_differs_from_magnitude() {
        let mut spec = CompressSpec::for_method("sparsify");
        spec.sparse.metric = SparsityMetric::ActivationWeighted;
        let act = MagnitudePrune::from_spec(&spec);
        let mag = MagnitudePrune::from_spec(&CompressSpec::for_method("sparsify"));

        let (mut model_a, inputs) = block_and_inputs();
        let params_a = act.apply(model_a.block_mut(0), &inputs, 0).unwrap();
        let (mut model_b, inputs_b) = block_and_inputs();
        let params_b = mag.apply(model_b.block_mut(0), &inputs_b, 0).unwrap();

        let mask = |p: &TransformParams, name: &str| match &p.get(name).unwrap().transform {
            ModuleTransform::Sparse { mask, .. } => mask.clone(),
            _ => panic!("expected sparse record"),
        };

        // At least one sub-module's mask should differ between metrics
        let differs = SUB_MODULE_NAMES
            .iter()
            .any(|&name| mask(&params_a, name) != mask(&params_b, name));
        assert!(differs);
    }

    #[test]
    fn test_all_zero_weights_fall_back() {
        let (mut model, inputs) = block_and_inputs();
        model
            .block_mut(0)
            .sub_module_mut("attn.v_proj")
            .unwrap()
            .map_float_weights(|w| w.fill(0.0))
            .unwrap();

        let prune = MagnitudePrune::from_spec(&CompressSpec::for_method("sparsify"));
        let params = prune.apply(model.block_mut(0), &inputs, 0).unwrap();
        assert_eq!(params.num_fallbacks(), 1);
    }
}
