//! Declarative compression configuration
//!
//! Mirrors the YAML sections of a compression run (`quant`, `sparse`,
//! `rotate`, `calib`) as serde structs with defaults. Loading plumbing
//! beyond [`CompressSpec::from_yaml_str`] is the caller's concern.

use crate::error::{Error, Result};
use crate::quant::{Granularity, QuantMode};
use serde::{Deserialize, Serialize};

/// Complete specification of a compression run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressSpec {
    /// Transform method name, resolved through the registry
    /// (built-ins: "rtn", "sparsify", "rotate")
    pub method: String,

    /// Quantization settings
    #[serde(default)]
    pub quant: QuantSpec,

    /// Sparsification settings
    #[serde(default)]
    pub sparse: SparseSpec,

    /// Rotation / training-preparation settings
    #[serde(default)]
    pub rotate: RotateSpec,

    /// Calibration data settings
    #[serde(default)]
    pub calib: CalibSpec,

    /// Policy for sub-modules whose statistics are degenerate
    #[serde(default)]
    pub fallback: FallbackPolicy,

    /// Optional cap on cached-activation bytes per block replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_budget_bytes: Option<usize>,
}

impl CompressSpec {
    /// Spec for a method with all defaults
    pub fn for_method(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            quant: QuantSpec::default(),
            sparse: SparseSpec::default(),
            rotate: RotateSpec::default(),
            calib: CalibSpec::default(),
            fallback: FallbackPolicy::default(),
            activation_budget_bytes: None,
        }
    }

    /// Parse and validate a YAML spec
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let spec: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid YAML: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if self.method.is_empty() {
            return Err(Error::Config("method must not be empty".into()));
        }
        if !(2..=8).contains(&self.quant.bits) {
            return Err(Error::Config(format!(
                "quant.bits must be in 2..=8, got {}",
                self.quant.bits
            )));
        }
        if let Some(act_bits) = self.quant.act_bits {
            if !(2..=8).contains(&act_bits) {
                return Err(Error::Config(format!(
                    "quant.act_bits must be in 2..=8, got {act_bits}"
                )));
            }
        }
        if let Granularity::PerGroup(g) = self.quant.granularity {
            if g == 0 {
                return Err(Error::Config("quant group size must be positive".into()));
            }
        }
        if !(0.0..1.0).contains(&self.sparse.sparsity) {
            return Err(Error::Config(format!(
                "sparse.sparsity must be in [0, 1), got {}",
                self.sparse.sparsity
            )));
        }
        if self.calib.num_samples == 0 {
            return Err(Error::Config("calib.num_samples must be positive".into()));
        }
        Ok(())
    }
}

/// Quantization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantSpec {
    /// Weight bit width
    pub bits: u8,
    /// Symmetric or asymmetric grid
    #[serde(default)]
    pub mode: QuantMode,
    /// Scale granularity for weights
    #[serde(default)]
    pub granularity: Granularity,
    /// Activation bit width (None disables activation calibration)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act_bits: Option<u8>,
}

impl Default for QuantSpec {
    fn default() -> Self {
        Self {
            bits: 8,
            mode: QuantMode::Symmetric,
            granularity: Granularity::PerChannel,
            act_bits: Some(8),
        }
    }
}

/// Sparsification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseSpec {
    /// Target fraction of zeroed weights per sub-module
    pub sparsity: f32,
    /// Importance metric for choosing pruned weights
    #[serde(default)]
    pub metric: SparsityMetric,
}

impl Default for SparseSpec {
    fn default() -> Self {
        Self {
            sparsity: 0.5,
            metric: SparsityMetric::default(),
        }
    }
}

/// Importance metric for pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SparsityMetric {
    /// |w|
    #[default]
    Magnitude,
    /// |w| weighted by the input activation norm of the weight's column
    ActivationWeighted,
}

/// Rotation / training-preparation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateSpec {
    /// Seed for the orthogonal initialization
    pub seed: u64,
}

impl Default for RotateSpec {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

/// Calibration data settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibSpec {
    /// Number of calibration samples
    pub num_samples: usize,
    /// Sequence length per sample
    pub seq_len: usize,
}

impl Default for CalibSpec {
    fn default() -> Self {
        Self {
            num_samples: 128,
            seq_len: 512,
        }
    }
}

/// Policy for a sub-module whose transform cannot be computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Keep the sub-module's original weights and record an identity
    /// transform; the run continues
    #[default]
    IdentityFallback,
    /// Abort the whole run with a calibration error
    Abort,
}
