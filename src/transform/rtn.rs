//! Round-to-nearest quantization with activation-range calibration
//!
//! Weights get a per-group integer grid from their own ranges and the block
//! is rewritten to the fake-quantized representation first; each
//! sub-module's input activations are then observed under that simulated
//! forward signal, so activation grids match what the block produces after
//! deployment. Downstream blocks likewise calibrate against quantized
//! upstream output.

use crate::calib::BlockArgs;
use crate::config::{CompressSpec, FallbackPolicy};
use crate::error::{Error, Result};
use crate::model::{Block, SUB_MODULE_NAMES};
use crate::quant::{
    calibrate_weights, fake_quantized, scale_zero_point, Granularity, QuantMode, QuantParams,
    RangeCalibrator,
};
use crate::transform::{
    resolve_fallback, BlockTransform, ModuleRecord, ModuleTransform, TransformParams,
};
use std::collections::BTreeMap;

/// Deterministic rounding-based quantizer
#[derive(Clone, Debug)]
pub struct RtnQuant {
    bits: u8,
    mode: QuantMode,
    granularity: Granularity,
    act_bits: Option<u8>,
    fallback: FallbackPolicy,
}

/// Outcome of the weight pass for one sub-module
enum WeightPass {
    Simulated(QuantParams),
    Fallback(ModuleTransform),
}

impl RtnQuant {
    /// Build from a validated spec
    pub fn from_spec(spec: &CompressSpec) -> Self {
        Self {
            bits: spec.quant.bits,
            mode: spec.quant.mode,
            granularity: spec.quant.granularity,
            act_bits: spec.quant.act_bits,
            fallback: spec.fallback,
        }
    }

    /// Override the weight bit width
    pub fn with_bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }

    fn activation_grid(&self, cal: &RangeCalibrator, bits: u8) -> Result<QuantParams> {
        let (min_val, max_val) = cal.bounds()?;
        let (scale, zero_point) = scale_zero_point(min_val, max_val, bits, self.mode)?;
        Ok(QuantParams {
            scales: vec![scale],
            zero_points: if self.mode == QuantMode::Asymmetric {
                vec![zero_point]
            } else {
                Vec::new()
            },
            granularity: Granularity::PerTensor,
            mode: self.mode,
            bits,
        })
    }
}

impl BlockTransform for RtnQuant {
    fn name(&self) -> &str {
        "rtn"
    }

    fn apply(
        &self,
        block: &mut Block,
        inputs: &[BlockArgs],
        block_index: usize,
    ) -> Result<TransformParams> {
        // Weight pass: calibrate and simulate every sub-module. A module
        // with degenerate weight statistics resolves through the fallback
        // policy and keeps its original weights.
        let mut staged: Vec<(&'static str, Vec<f32>, (usize, usize), WeightPass)> =
            Vec::with_capacity(SUB_MODULE_NAMES.len());
        for name in SUB_MODULE_NAMES {
            let module = block.sub_module(name).expect("known name");
            let original = module.weight_values();
            let shape = module.shape();

            let outcome =
                match calibrate_weights(&original, shape.0, self.granularity, self.bits, self.mode)
                {
                    Ok(weight) => {
                        let simulated = fake_quantized(&original, shape.0, &weight);
                        block
                            .sub_module_mut(name)
                            .expect("known name")
                            .set_float(simulated)?;
                        WeightPass::Simulated(weight)
                    }
                    Err(err) => WeightPass::Fallback(resolve_fallback(
                        self.fallback,
                        block_index,
                        name,
                        err,
                    )?),
                };
            staged.push((name, original, shape, outcome));
        }

        // Activation pass: the block now carries its simulated weights, so
        // each sub-module's observed input matches the deployed signal.
        let mut act_cals: BTreeMap<&str, RangeCalibrator> = SUB_MODULE_NAMES
            .iter()
            .map(|name| (*name, RangeCalibrator::min_max()))
            .collect();
        if self.act_bits.is_some() {
            for args in inputs {
                let (_, taps) = block.forward_collect(args)?;
                for (name, tap) in taps {
                    let cal = act_cals.get_mut(name).expect("known name");
                    match tap.as_slice() {
                        Some(slice) => cal.observe(slice),
                        None => {
                            let flat: Vec<f32> = tap.iter().cloned().collect();
                            cal.observe(&flat);
                        }
                    }
                }
            }
        }

        let mut params = TransformParams::new(block_index, self.name());
        for (name, original, shape, outcome) in staged {
            let transform = match outcome {
                WeightPass::Simulated(weight) => {
                    let activation = match self.act_bits {
                        Some(bits) => match self.activation_grid(&act_cals[name], bits) {
                            Ok(grid) => Some(grid),
                            // The weight grid is still valid; a degenerate
                            // activation range drops only the activation
                            // grid, unless the policy says abort.
                            Err(Error::DegenerateStats(reason)) => match self.fallback {
                                FallbackPolicy::IdentityFallback => None,
                                FallbackPolicy::Abort => {
                                    return Err(Error::Calibration {
                                        block: block_index,
                                        module: name.to_string(),
                                        reason,
                                    })
                                }
                            },
                            Err(other) => return Err(other),
                        },
                        None => None,
                    };
                    ModuleTransform::Quant { weight, activation }
                }
                WeightPass::Fallback(transform) => transform,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::CalibSample;
    use crate::model::{Transformer, TransformerConfig};

    fn block_and_inputs() -> (Transformer, Vec<BlockArgs>) {
        let model = Transformer::new_seeded(TransformerConfig::tiny(1), 21).unwrap();
        let inputs: Vec<BlockArgs> = (0..4)
            .map(|i| {
                model
                    .prefix_forward(&CalibSample::Tokens(vec![i, i + 1, i + 2, 3]), 0)
                    .unwrap()
            })
            .collect();
        (model, inputs)
    }

    #[test]
    fn test_apply_records_every_sub_module() {
        let (mut model, inputs) = block_and_inputs();
        let rtn = RtnQuant::from_spec(&CompressSpec::for_method("rtn"));

        let params = rtn.apply(model.block_mut(0), &inputs, 0).unwrap();
        assert_eq!(params.num_modules(), SUB_MODULE_NAMES.len());
        assert_eq!(params.num_fallbacks(), 0);
        assert_eq!(params.method, "rtn");

        for (_, record) in params.modules() {
            assert!(matches!(
                record.transform,
                ModuleTransform::Quant {
                    activation: Some(_),
                    ..
                }
            ));
            assert_eq!(record.original.len(), record.shape.0 * record.shape.1);
        }
    }

    #[test]
    fn test_apply_mutates_weights_to_simulation() {
        let (mut model, inputs) = block_and_inputs();
        let before = model.block(0).sub_module("attn.q_proj").unwrap().weight_values();

        let mut spec = CompressSpec::for_method("rtn");
        spec.quant.bits = 4;
        let rtn = RtnQuant::from_spec(&spec);
        rtn.apply(model.block_mut(0), &inputs, 0).unwrap();

        let after = model.block(0).sub_module("attn.q_proj").unwrap().weight_values();
        assert_ne!(before, after, "4-bit simulation must change weights");
    }

    #[test]
    fn test_zero_weights_fall_back_to_identity() {
        let (mut model, inputs) = block_and_inputs();
        model
            .block_mut(0)
            .sub_module_mut("mlp.up_proj")
            .unwrap()
            .map_float_weights(|w| w.fill(0.0))
            .unwrap();

        let rtn = RtnQuant::from_spec(&CompressSpec::for_method("rtn"));
        let params = rtn.apply(model.block_mut(0), &inputs, 0).unwrap();

        // Only the zeroed module itself falls back. Its zero output makes
        // the down projection's input degenerate too, but that costs only
        // the activation grid; the weight grid survives.
        assert_eq!(params.num_fallbacks(), 1);
        assert!(params.get("mlp.up_proj").unwrap().transform.is_fallback());
        assert!(matches!(
            params.get("mlp.down_proj").unwrap().transform,
            ModuleTransform::Quant {
                activation: None,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_weights_abort_under_abort_policy() {
        let (mut model, inputs) = block_and_inputs();
        model
            .block_mut(0)
            .sub_module_mut("mlp.up_proj")
            .unwrap()
            .map_float_weights(|w| w.fill(0.0))
            .unwrap();

        let mut spec = CompressSpec::for_method("rtn");
        spec.fallback = FallbackPolicy::Abort;
        let rtn = RtnQuant::from_spec(&spec);

        let err = rtn.apply(model.block_mut(0), &inputs, 3).unwrap_err();
        match err {
            Error::Calibration { block, module, .. } => {
                assert_eq!(block, 3);
                assert_eq!(module, "mlp.up_proj");
            }
            other => panic!("expected Calibration error, got {other:?}"),
        }
    }

    #[test]
    fn test_activation_params_depend_on_inputs() {
        let (mut model, inputs) = block_and_inputs();
        let rtn = RtnQuant::from_spec(&CompressSpec::for_method("rtn"));
        let params_a = rtn.apply(model.block_mut(0), &inputs, 0).unwrap();

        // Same block, scaled inputs: activation scales must differ
        let (mut model_b, inputs_b) = block_and_inputs();
        let scaled: Vec<BlockArgs> = inputs_b
            .iter()
            .map(|a| a.with_hidden(&a.hidden * 3.0))
            .collect();
        let params_b = rtn.apply(model_b.block_mut(0), &scaled, 0).unwrap();

        let act_scale = |p: &TransformParams| match &p.get("attn.q_proj").unwrap().transform {
            ModuleTransform::Quant {
                activation: Some(a),
                ..
            } => a.scales[0],
            _ => panic!("expected quant record"),
        };
        assert_ne!(act_scale(&params_a), act_scale(&params_b));
    }

    #[test]
    fn test_activation_grids_see_simulated_weights() {
        // The down projection's input flows through this block's own
        // quantized projections, so a coarser weight grid must move its
        // activation scale.
        let act_scale = |bits: u8| -> f32 {
            let (mut model, inputs) = block_and_inputs();
            let rtn = RtnQuant::from_spec(&CompressSpec::for_method("rtn")).with_bits(bits);
            let params = rtn.apply(model.block_mut(0), &inputs, 0).unwrap();
            match &params.get("mlp.down_proj").unwrap().transform {
                ModuleTransform::Quant {
                    activation: Some(a),
                    ..
                } => a.scales[0],
                _ => panic!("expected quant record"),
            }
        };
        assert_ne!(act_scale(2), act_scale(8));
    }
}
