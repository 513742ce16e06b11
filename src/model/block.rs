//! Transformer block: named sub-modules and forward computation
//!
//! One block = RMS-norm → self-attention → residual → RMS-norm → MLP →
//! residual. The six linear projections are the transformable sub-modules;
//! normalization gains stay in full precision.

use crate::calib::BlockArgs;
use crate::error::{Error, Result};
use crate::model::Linear;
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::Rng;

/// Names of the transformable sub-modules, in forward order
pub const SUB_MODULE_NAMES: [&str; 6] = [
    "attn.q_proj",
    "attn.k_proj",
    "attn.v_proj",
    "attn.o_proj",
    "mlp.up_proj",
    "mlp.down_proj",
];

const NORM_EPS: f32 = 1e-6;

/// One repeating structural unit of the model
#[derive(Clone, Debug)]
pub struct Block {
    hidden: usize,
    attn_norm: Vec<f32>,
    mlp_norm: Vec<f32>,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Block {
    /// Random-initialized block
    pub fn new_seeded(hidden: usize, mlp_hidden: usize, rng: &mut StdRng) -> Result<Self> {
        let mut init = |rows: usize, cols: usize| -> Vec<f32> {
            let scale = 1.0 / (cols as f32).sqrt();
            (0..rows * cols)
                .map(|_| rng.random_range(-scale..scale))
                .collect()
        };

        Ok(Self {
            hidden,
            attn_norm: vec![1.0; hidden],
            mlp_norm: vec![1.0; hidden],
            q_proj: Linear::new(init(hidden, hidden), hidden, hidden)?,
            k_proj: Linear::new(init(hidden, hidden), hidden, hidden)?,
            v_proj: Linear::new(init(hidden, hidden), hidden, hidden)?,
            o_proj: Linear::new(init(hidden, hidden), hidden, hidden)?,
            up_proj: Linear::new(init(mlp_hidden, hidden), mlp_hidden, hidden)?,
            down_proj: Linear::new(init(hidden, mlp_hidden), hidden, mlp_hidden)?,
        })
    }

    /// Hidden dimension
    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Named access to a sub-module
    pub fn sub_module(&self, name: &str) -> Option<&Linear> {
        match name {
            "attn.q_proj" => Some(&self.q_proj),
            "attn.k_proj" => Some(&self.k_proj),
            "attn.v_proj" => Some(&self.v_proj),
            "attn.o_proj" => Some(&self.o_proj),
            "mlp.up_proj" => Some(&self.up_proj),
            "mlp.down_proj" => Some(&self.down_proj),
            _ => None,
        }
    }

    /// Named mutable access to a sub-module
    pub fn sub_module_mut(&mut self, name: &str) -> Option<&mut Linear> {
        match name {
            "attn.q_proj" => Some(&mut self.q_proj),
            "attn.k_proj" => Some(&mut self.k_proj),
            "attn.v_proj" => Some(&mut self.v_proj),
            "attn.o_proj" => Some(&mut self.o_proj),
            "mlp.up_proj" => Some(&mut self.up_proj),
            "mlp.down_proj" => Some(&mut self.down_proj),
            _ => None,
        }
    }

    /// All sub-modules in forward order
    pub fn sub_modules(&self) -> impl Iterator<Item = (&'static str, &Linear)> {
        SUB_MODULE_NAMES
            .iter()
            .map(|name| (*name, self.sub_module(name).expect("known name")))
    }

    /// Run the block on one sample's arguments
    pub fn forward(&self, args: &BlockArgs) -> Result<Array2<f32>> {
        self.run(args, None)
    }

    /// Run the block while recording the input tensor of every sub-module
    ///
    /// This is the hook point for activation-aware transforms: each linear's
    /// actual input under the current (already transformed) upstream signal.
    pub fn forward_collect(
        &self,
        args: &BlockArgs,
    ) -> Result<(Array2<f32>, Vec<(&'static str, Array2<f32>)>)> {
        let mut taps = Vec::with_capacity(SUB_MODULE_NAMES.len());
        let out = self.run(args, Some(&mut taps))?;
        Ok((out, taps))
    }

    fn run(
        &self,
        args: &BlockArgs,
        mut taps: Option<&mut Vec<(&'static str, Array2<f32>)>>,
    ) -> Result<Array2<f32>> {
        let x = &args.hidden;
        if x.ncols() != self.hidden {
            return Err(Error::ShapeMismatch {
                expected: vec![x.nrows(), self.hidden],
                got: vec![x.nrows(), x.ncols()],
            });
        }

        // Attention
        let h = rms_norm(&x.view(), &self.attn_norm);
        if let Some(t) = taps.as_deref_mut() {
            t.push(("attn.q_proj", h.clone()));
            t.push(("attn.k_proj", h.clone()));
            t.push(("attn.v_proj", h.clone()));
        }
        let q = self.q_proj.forward(&h.view())?;
        let k = self.k_proj.forward(&h.view())?;
        let v = self.v_proj.forward(&h.view())?;

        let mut scores = q.dot(&k.t()) / (self.hidden as f32).sqrt();
        if let Some(mask) = &args.attention_mask {
            if mask.shape() != scores.shape() {
                return Err(Error::ShapeMismatch {
                    expected: scores.shape().to_vec(),
                    got: mask.shape().to_vec(),
                });
            }
            scores += mask;
        }
        softmax_rows(&mut scores);
        let ctx = scores.dot(&v);

        if let Some(t) = taps.as_deref_mut() {
            t.push(("attn.o_proj", ctx.clone()));
        }
        let attn_out = self.o_proj.forward(&ctx.view())?;
        let x1 = x + &attn_out;

        // MLP
        let h2 = rms_norm(&x1.view(), &self.mlp_norm);
        if let Some(t) = taps.as_deref_mut() {
            t.push(("mlp.up_proj", h2.clone()));
        }
        let mut m = self.up_proj.forward(&h2.view())?;
        m.mapv_inplace(|v| v.max(0.0));
        if let Some(t) = taps.as_deref_mut() {
            t.push(("mlp.down_proj", m.clone()));
        }
        let mlp_out = self.down_proj.forward(&m.view())?;

        Ok(x1 + &mlp_out)
    }
}

/// RMS normalization per sequence position with a learned gain
fn rms_norm(x: &ArrayView2<'_, f32>, gain: &[f32]) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let ms = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
        let inv = 1.0 / (ms + NORM_EPS).sqrt();
        for (v, g) in row.iter_mut().zip(gain.iter()) {
            *v *= inv * g;
        }
    }
    out
}

/// In-place row-wise softmax, stable against -inf mask entries
fn softmax_rows(scores: &mut Array2<f32>) {
    for mut row in scores.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        if sum > 0.0 {
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;

    fn test_block(hidden: usize) -> Block {
        let mut rng = StdRng::seed_from_u64(7);
        Block::new_seeded(hidden, hidden * 2, &mut rng).unwrap()
    }

    fn test_args(seq: usize, hidden: usize) -> BlockArgs {
        BlockArgs::causal(Array2::from_shape_fn((seq, hidden), |(i, j)| {
            ((i * hidden + j) as f32 * 0.13).sin()
        }))
    }

    #[test]
    fn test_forward_preserves_shape() {
        let block = test_block(8);
        let args = test_args(4, 8);
        let out = block.forward(&args).unwrap();
        assert_eq!(out.shape(), &[4, 8]);
    }

    #[test]
    fn test_forward_deterministic() {
        let block = test_block(8);
        let args = test_args(4, 8);
        let a = block.forward(&args).unwrap();
        let b = block.forward(&args).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_causal_mask_blocks_future() {
        // Changing a later position must not affect earlier outputs
        let block = test_block(8);
        let args = test_args(4, 8);

        let mut changed = args.clone();
        changed.hidden[[3, 0]] += 10.0;

        let a = block.forward(&args).unwrap();
        let b = block.forward(&changed).unwrap();

        for j in 0..8 {
            assert!((a[[0, j]] - b[[0, j]]).abs() < 1e-6);
            assert!((a[[2, j]] - b[[2, j]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_sub_module_names_resolve() {
        let mut block = test_block(8);
        for name in SUB_MODULE_NAMES {
            assert!(block.sub_module(name).is_some());
            assert!(block.sub_module_mut(name).is_some());
        }
        assert!(block.sub_module("attn.missing").is_none());
    }

    #[test]
    fn test_forward_collect_taps_all_modules() {
        let block = test_block(8);
        let args = test_args(4, 8);
        let (out, taps) = block.forward_collect(&args).unwrap();

        assert_eq!(out, block.forward(&args).unwrap());
        assert_eq!(taps.len(), SUB_MODULE_NAMES.len());
        for ((name, tap), expected) in taps.iter().zip(SUB_MODULE_NAMES.iter()) {
            assert_eq!(name, expected);
            let (_, in_features) = block.sub_module(name).unwrap().shape();
            assert_eq!(tap.ncols(), in_features);
        }
    }

    #[test]
    fn test_wrong_hidden_dim_rejected() {
        let block = test_block(8);
        let args = test_args(4, 6);
        assert!(block.forward(&args).is_err());
    }
}
