//! Calibration samples and block invocation arguments

use ndarray::{Array2, ArrayView2};

/// One element of the calibration dataset
///
/// Immutable once captured; consumed by every block in sequence.
#[derive(Clone, Debug)]
pub enum CalibSample {
    /// Token ids, shape [1, seq_len]
    Tokens(Vec<u32>),
    /// Multi-modal sample: pre-projected patch features plus token ids
    VisionText {
        /// Patch features, num_patches × hidden
        patches: Array2<f32>,
        /// Token ids appended after the patches
        tokens: Vec<u32>,
    },
}

impl CalibSample {
    /// Total sequence positions this sample occupies after the prefix
    pub fn seq_len(&self) -> usize {
        match self {
            CalibSample::Tokens(t) => t.len(),
            CalibSample::VisionText { patches, tokens } => patches.nrows() + tokens.len(),
        }
    }
}

/// Arguments sufficient to invoke one block's forward computation
/// for one calibration sample
#[derive(Clone, Debug)]
pub struct BlockArgs {
    /// Hidden states, seq_len × hidden
    pub hidden: Array2<f32>,
    /// Additive attention mask, seq_len × seq_len (None = no masking)
    pub attention_mask: Option<Array2<f32>>,
    /// Position ids for each sequence position
    pub position_ids: Vec<usize>,
}

impl BlockArgs {
    /// New args with a causal mask over `seq_len` positions
    pub fn causal(hidden: Array2<f32>) -> Self {
        let seq_len = hidden.nrows();
        Self {
            hidden,
            attention_mask: Some(causal_mask(seq_len)),
            position_ids: (0..seq_len).collect(),
        }
    }

    /// Replace the hidden states, keeping shared kwargs
    pub fn with_hidden(&self, hidden: Array2<f32>) -> Self {
        Self {
            hidden,
            attention_mask: self.attention_mask.clone(),
            position_ids: self.position_ids.clone(),
        }
    }

    /// View of the hidden states
    pub fn hidden_view(&self) -> ArrayView2<'_, f32> {
        self.hidden.view()
    }

    /// Approximate resident bytes of this entry
    pub fn approx_bytes(&self) -> usize {
        let mask = self
            .attention_mask
            .as_ref()
            .map_or(0, |m| m.len() * std::mem::size_of::<f32>());
        self.hidden.len() * std::mem::size_of::<f32>()
            + mask
            + self.position_ids.len() * std::mem::size_of::<usize>()
    }
}

/// Additive causal mask: 0 on and below the diagonal, -inf above
pub fn causal_mask(seq_len: usize) -> Array2<f32> {
    Array2::from_shape_fn((seq_len, seq_len), |(i, j)| {
        if j <= i {
            0.0
        } else {
            f32::NEG_INFINITY
        }
    })
}
