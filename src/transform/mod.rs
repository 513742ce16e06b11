//! Per-block transform algorithms
//!
//! A [`BlockTransform`] computes transformation parameters for one block
//! from its cached inputs and rewrites the block's sub-modules in place.
//! Variants are resolved by name through an explicit [`TransformRegistry`]
//! constructed at startup, with no global lookup tables.

mod rotate;
mod rtn;
mod sparsify;

pub use rotate::RotatePrep;
pub use rtn::RtnQuant;
pub use sparsify::MagnitudePrune;

pub(crate) use rotate::rotate_weights;

use crate::blockwise::DeployMode;
use crate::calib::BlockArgs;
use crate::config::{CompressSpec, FallbackPolicy};
use crate::error::{Error, Result};
use crate::model::Block;
use crate::quant::QuantParams;
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// Per-sub-module transformation parameters
#[derive(Clone, Debug)]
pub enum ModuleTransform {
    /// Quantization: weight grid plus optional activation grid
    Quant {
        /// Weight quantization parameters
        weight: QuantParams,
        /// Input-activation quantization parameters, calibrated from the
        /// cached block inputs
        activation: Option<QuantParams>,
    },
    /// Pruning mask (true = kept weight)
    Sparse {
        /// One flag per weight element
        mask: Vec<bool>,
        /// Achieved sparsity
        sparsity: f32,
    },
    /// Trainable rotation applied to the module's output space
    Rotate {
        /// Flat row-major rotation matrix, marked trainable
        rotation: Tensor,
        /// Rotation dimension
        dim: usize,
    },
    /// Identity fallback: the sub-module keeps its original weights
    Identity {
        /// Why calibration fell back
        reason: String,
    },
}

impl ModuleTransform {
    /// Whether this record is an identity fallback
    pub fn is_fallback(&self) -> bool {
        matches!(self, ModuleTransform::Identity { .. })
    }
}

/// Transform parameters plus the original-weight snapshot for one sub-module
///
/// The snapshot makes deployment a pure function of
/// (original weights, parameters, mode).
#[derive(Clone, Debug)]
pub struct ModuleRecord {
    /// The computed transform
    pub transform: ModuleTransform,
    /// Original float weights at `apply` time
    pub original: Vec<f32>,
    /// (out_features, in_features)
    pub shape: (usize, usize),
}

/// All transform parameters computed for one block
#[derive(Clone, Debug)]
pub struct TransformParams {
    /// Index of the block these parameters belong to
    pub block_index: usize,
    /// Name of the algorithm that produced them
    pub method: String,
    modules: BTreeMap<String, ModuleRecord>,
}

impl TransformParams {
    /// Empty parameter set for a block
    pub fn new(block_index: usize, method: impl Into<String>) -> Self {
        Self {
            block_index,
            method: method.into(),
            modules: BTreeMap::new(),
        }
    }

    /// Record a sub-module's parameters
    pub fn insert(&mut self, name: impl Into<String>, record: ModuleRecord) {
        self.modules.insert(name.into(), record);
    }

    /// Parameters for a sub-module
    pub fn get(&self, name: &str) -> Option<&ModuleRecord> {
        self.modules.get(name)
    }

    /// All recorded sub-modules, in deterministic order
    pub fn modules(&self) -> impl Iterator<Item = (&String, &ModuleRecord)> {
        self.modules.iter()
    }

    /// Number of recorded sub-modules
    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// Number of identity fallbacks among the records
    pub fn num_fallbacks(&self) -> usize {
        self.modules
            .values()
            .filter(|r| r.transform.is_fallback())
            .count()
    }
}

/// A per-block transform algorithm
///
/// `apply` is called exactly once per block, in block order. The cached
/// inputs reflect the current state of all preceding blocks, so calibration
/// always sees the realistic forward signal.
pub trait BlockTransform {
    /// Registry name of this algorithm
    fn name(&self) -> &str;

    /// The weight representation `apply` leaves the block in
    ///
    /// The loop tags the model with this mode once it completes, so the
    /// reported deployment state matches the materialized weights.
    fn calibration_mode(&self) -> DeployMode {
        DeployMode::FakeQuant
    }

    /// Compute parameters for `block` and rewrite it in place
    fn apply(
        &self,
        block: &mut Block,
        inputs: &[BlockArgs],
        block_index: usize,
    ) -> Result<TransformParams>;
}

/// Resolve a degenerate-statistics failure according to the fallback policy
///
/// Returns an identity record (and the fallback reason) or escalates to a
/// fatal calibration error attributed to the failing block and sub-module.
pub(crate) fn resolve_fallback(
    policy: FallbackPolicy,
    block_index: usize,
    module: &str,
    err: Error,
) -> Result<ModuleTransform> {
    let reason = match err {
        Error::DegenerateStats(reason) => reason,
        other => return Err(other),
    };
    match policy {
        FallbackPolicy::IdentityFallback => Ok(ModuleTransform::Identity { reason }),
        FallbackPolicy::Abort => Err(Error::Calibration {
            block: block_index,
            module: module.to_string(),
            reason,
        }),
    }
}

/// Builder for a transform algorithm from a validated spec
pub type TransformBuilder = fn(&CompressSpec) -> Result<Box<dyn BlockTransform>>;

/// Explicit name → builder lookup table
///
/// Constructed once at process start and passed by reference to whatever
/// needs method resolution.
pub struct TransformRegistry {
    builders: BTreeMap<String, TransformBuilder>,
}

impl TransformRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    /// Registry with the built-in algorithms
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("rtn", |spec| Ok(Box::new(RtnQuant::from_spec(spec))));
        registry.register("sparsify", |spec| {
            Ok(Box::new(MagnitudePrune::from_spec(spec)))
        });
        registry.register("rotate", |spec| Ok(Box::new(RotatePrep::from_spec(spec))));
        registry
    }

    /// Register a builder under a method name
    pub fn register(&mut self, name: impl Into<String>, builder: TransformBuilder) {
        self.builders.insert(name.into(), builder);
    }

    /// Registered method names
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.builders.keys()
    }

    /// Build the algorithm named by `spec.method`
    pub fn build(&self, spec: &CompressSpec) -> Result<Box<dyn BlockTransform>> {
        spec.validate()?;
        let builder = self.builders.get(&spec.method).ok_or_else(|| {
            Error::Config(format!(
                "unknown transform method '{}' (registered: {})",
                spec.method,
                self.builders
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        builder(spec)
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve() {
        let registry = TransformRegistry::with_builtins();
        for method in ["rtn", "sparsify", "rotate"] {
            let spec = CompressSpec::for_method(method);
            let transform = registry.build(&spec).unwrap();
            assert_eq!(transform.name(), method);
        }
    }

    #[test]
    fn test_unknown_method_is_config_error() {
        let registry = TransformRegistry::with_builtins();
        let spec = CompressSpec::for_method("gptq");
        assert!(matches!(registry.build(&spec), Err(Error::Config(_))));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = TransformRegistry::new();
        registry.register("custom-rtn", |spec| Ok(Box::new(RtnQuant::from_spec(spec))));
        let spec = CompressSpec::for_method("custom-rtn");
        assert!(registry.build(&spec).is_ok());
    }

    #[test]
    fn test_fallback_policy_resolution() {
        let err = Error::DegenerateStats("zero-range values".into());
        let resolved = resolve_fallback(FallbackPolicy::IdentityFallback, 0, "m", err).unwrap();
        assert!(resolved.is_fallback());

        let err = Error::DegenerateStats("zero-range values".into());
        let fatal = resolve_fallback(FallbackPolicy::Abort, 2, "mlp.up_proj", err).unwrap_err();
        assert!(matches!(
            fatal,
            Error::Calibration { block: 2, .. }
        ));
    }

    #[test]
    fn test_num_fallbacks_counts_identity() {
        let mut params = TransformParams::new(0, "rtn");
        params.insert(
            "a",
            ModuleRecord {
                transform: ModuleTransform::Identity {
                    reason: "zero-range".into(),
                },
                original: vec![0.0; 4],
                shape: (2, 2),
            },
        );
        params.insert(
            "b",
            ModuleRecord {
                transform: ModuleTransform::Sparse {
                    mask: vec![true; 4],
                    sparsity: 0.0,
                },
                original: vec![1.0; 4],
                shape: (2, 2),
            },
        );
        assert_eq!(params.num_fallbacks(), 1);
        assert_eq!(params.num_modules(), 2);
    }
}
