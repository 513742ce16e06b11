//! Linear sub-module with a switchable weight representation
//!
//! The weight lives either as float (original, fake-quantized, or rotated,
//! all f32) or as a packed reduced-precision tensor. The input/output shape
//! contract is identical for every representation.

use crate::error::{Error, Result};
use crate::quant::PackedTensor;
use crate::tensor::Tensor;
use ndarray::{Array2, ArrayView2};

/// Currently materialized weight storage
#[derive(Clone, Debug)]
pub enum WeightRepr {
    /// f32 weights (original, fake-quantized, or rotated)
    Float(Tensor),
    /// Packed reduced-precision weights
    Packed(PackedTensor),
}

/// A bias-free linear projection, `out_features × in_features` row-major
#[derive(Clone, Debug)]
pub struct Linear {
    out_features: usize,
    in_features: usize,
    repr: WeightRepr,
}

impl Linear {
    /// Create from flat row-major weights
    pub fn new(weight: Vec<f32>, out_features: usize, in_features: usize) -> Result<Self> {
        if weight.len() != out_features * in_features {
            return Err(Error::ShapeMismatch {
                expected: vec![out_features, in_features],
                got: vec![weight.len()],
            });
        }
        Ok(Self {
            out_features,
            in_features,
            repr: WeightRepr::Float(Tensor::from_vec(weight, false)),
        })
    }

    /// (out_features, in_features)
    pub fn shape(&self) -> (usize, usize) {
        (self.out_features, self.in_features)
    }

    /// Number of weight elements
    pub fn num_weights(&self) -> usize {
        self.out_features * self.in_features
    }

    /// Whether the packed representation is active
    pub fn is_packed(&self) -> bool {
        matches!(self.repr, WeightRepr::Packed(_))
    }

    /// Current representation
    pub fn repr(&self) -> &WeightRepr {
        &self.repr
    }

    /// Dequantized copy of the current weights
    pub fn weight_values(&self) -> Vec<f32> {
        match &self.repr {
            WeightRepr::Float(t) => t.data().to_vec(),
            WeightRepr::Packed(p) => p.dequantize(),
        }
    }

    /// Replace with f32 weights
    pub fn set_float(&mut self, weight: Vec<f32>) -> Result<()> {
        if weight.len() != self.num_weights() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.num_weights()],
                got: vec![weight.len()],
            });
        }
        self.repr = WeightRepr::Float(Tensor::from_vec(weight, false));
        Ok(())
    }

    /// Replace with a packed representation
    pub fn set_packed(&mut self, packed: PackedTensor) -> Result<()> {
        if packed.len != self.num_weights() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.num_weights()],
                got: vec![packed.len],
            });
        }
        self.repr = WeightRepr::Packed(packed);
        Ok(())
    }

    /// Mutate the float weights in place
    ///
    /// Fails if the packed representation is active.
    pub fn map_float_weights(&mut self, f: impl FnOnce(&mut [f32])) -> Result<()> {
        match &mut self.repr {
            WeightRepr::Float(t) => {
                let slice = t.data_mut().as_slice_mut().ok_or_else(|| {
                    Error::Serialization("non-contiguous weight buffer".into())
                })?;
                f(slice);
                Ok(())
            }
            WeightRepr::Packed(_) => Err(Error::Deploy(
                "cannot mutate packed weights in place".into(),
            )),
        }
    }

    /// Forward: `x` is seq × in_features, output is seq × out_features
    pub fn forward(&self, x: &ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.in_features {
            return Err(Error::ShapeMismatch {
                expected: vec![x.nrows(), self.in_features],
                got: vec![x.nrows(), x.ncols()],
            });
        }
        match &self.repr {
            WeightRepr::Float(t) => {
                let w = self.weight_view(t)?;
                Ok(x.dot(&w.t()))
            }
            WeightRepr::Packed(p) => {
                let values = p.dequantize();
                let w = Array2::from_shape_vec((self.out_features, self.in_features), values)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Ok(x.dot(&w.t()))
            }
        }
    }

    fn weight_view<'a>(&self, t: &'a Tensor) -> Result<ArrayView2<'a, f32>> {
        let slice = t
            .data()
            .as_slice()
            .ok_or_else(|| Error::Serialization("non-contiguous weight buffer".into()))?;
        ArrayView2::from_shape((self.out_features, self.in_features), slice).map_err(|_| {
            Error::ShapeMismatch {
                expected: vec![self.out_features, self.in_features],
                got: vec![slice.len()],
            }
        })
    }
}
