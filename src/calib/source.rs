//! Calibration source: first-block input capture
//!
//! Runs every calibration sample through the model's prefix and records the
//! exact arguments block zero would receive. Any per-sample failure aborts
//! the whole capture; downstream blocks assume a complete, consistently
//! shaped input set.

use crate::calib::{BlockArgs, CalibSample};
use crate::error::{Error, Result};
use crate::model::Transformer;

/// Holds the calibration samples and, after capture, the first block's inputs
#[derive(Debug)]
pub struct CalibrationSource {
    samples: Vec<CalibSample>,
    captured: Option<Vec<BlockArgs>>,
}

impl CalibrationSource {
    /// Create from an ordered, non-empty sample collection
    pub fn new(samples: Vec<CalibSample>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::Capture {
                sample: 0,
                reason: "calibration dataset is empty".into(),
            });
        }
        Ok(Self {
            samples,
            captured: None,
        })
    }

    /// Number of calibration samples
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Capture block-zero inputs for every sample
    ///
    /// Fatal on the first failing sample; a partial capture is never kept.
    pub fn capture_first_block_input(&mut self, model: &Transformer) -> Result<&[BlockArgs]> {
        let mut captured = Vec::with_capacity(self.samples.len());
        for (idx, sample) in self.samples.iter().enumerate() {
            captured.push(model.prefix_forward(sample, idx)?);
        }
        self.captured = Some(captured);
        Ok(self.captured.as_deref().expect("just captured"))
    }

    /// Retrieve the captured inputs
    pub fn get_first_block_input(&self) -> Result<Vec<BlockArgs>> {
        self.captured.clone().ok_or_else(|| Error::Capture {
            sample: 0,
            reason: "capture_first_block_input has not been run".into(),
        })
    }

    /// Take ownership of the captured inputs, leaving the source empty
    pub fn take_first_block_input(&mut self) -> Result<Vec<BlockArgs>> {
        self.captured.take().ok_or_else(|| Error::Capture {
            sample: 0,
            reason: "capture_first_block_input has not been run".into(),
        })
    }
}
