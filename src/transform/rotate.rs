//! Rotation preparation for train-time compression
//!
//! Inserts a random orthogonal matrix in front of each projection writing
//! into the residual stream. The matrices are seeded per block and per
//! module, recorded as trainable tensors, and later refined by an outer
//! training loop through [`crate::blockwise::BlockwiseOptimizer::get_trainable_params`].

use crate::blockwise::DeployMode;
use crate::calib::BlockArgs;
use crate::config::CompressSpec;
use crate::error::{Error, Result};
use crate::model::Block;
use crate::tensor::Tensor;
use crate::transform::{BlockTransform, ModuleRecord, ModuleTransform, TransformParams};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The projections that write back into the residual stream
const ROTATED_MODULES: [&str; 2] = ["attn.o_proj", "mlp.down_proj"];

/// Seeded orthogonal-rotation preparation
#[derive(Clone, Debug)]
pub struct RotatePrep {
    seed: u64,
}

impl RotatePrep {
    /// Build from a validated spec
    pub fn from_spec(spec: &CompressSpec) -> Self {
        Self {
            seed: spec.rotate.seed,
        }
    }
}

impl BlockTransform for RotatePrep {
    fn name(&self) -> &str {
        "rotate"
    }

    fn calibration_mode(&self) -> DeployMode {
        DeployMode::TrainRotate
    }

    fn apply(
        &self,
        block: &mut Block,
        _inputs: &[BlockArgs],
        block_index: usize,
    ) -> Result<TransformParams> {
        let dim = block.hidden();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(block_index as u64));
        let mut params = TransformParams::new(block_index, self.name());

        for name in ROTATED_MODULES {
            let module = block.sub_module(name).expect("known name");
            let original = module.weight_values();
            let shape = module.shape();

            let rotation = orthogonal_matrix(dim, &mut rng)?;
            let rotated = rotate_weights(&rotation, &original, shape)?;
            block
                .sub_module_mut(name)
                .expect("known name")
                .set_float(rotated)?;

            params.insert(
                name,
                ModuleRecord {
                    transform: ModuleTransform::Rotate {
                        rotation: Tensor::from_vec(rotation, true),
                        dim,
                    },
                    original,
                    shape,
                },
            );
        }

        Ok(params)
    }
}

/// Left-multiply flat row-major weights by a rotation, `R · W`
pub(crate) fn rotate_weights(
    rotation: &[f32],
    weights: &[f32],
    shape: (usize, usize),
) -> Result<Vec<f32>> {
    let (rows, cols) = shape;
    if rotation.len() != rows * rows || weights.len() != rows * cols {
        return Err(Error::ShapeMismatch {
            expected: vec![rows, cols],
            got: vec![rotation.len(), weights.len()],
        });
    }
    let r = ArrayView2::from_shape((rows, rows), rotation)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let w = ArrayView2::from_shape((rows, cols), weights)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let rotated: Array2<f32> = r.dot(&w);
    Ok(rotated.into_iter().collect())
}

/// Random orthogonal matrix by Gram-Schmidt, flat row-major
fn orthogonal_matrix(dim: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
    let mut rows: Vec<Vec<f32>> = (0..dim)
        .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();

    for i in 0..dim {
        for j in 0..i {
            let dot: f32 = rows[i].iter().zip(rows[j].iter()).map(|(a, b)| a * b).sum();
            for k in 0..dim {
                rows[i][k] -= dot * rows[j][k];
            }
        }
        let norm: f32 = rows[i].iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-6 {
            return Err(Error::DegenerateStats(format!(
                "rotation basis collapsed at row {i}"
            )));
        }
        for v in rows[i].iter_mut() {
            *v /= norm;
        }
    }

    Ok(rows.into_iter().flatten().collect())
}
