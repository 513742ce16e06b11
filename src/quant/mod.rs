//! Quantization math for the blockwise compression core
//!
//! - `calibrate`: range calibration (min-max, percentile, moving average)
//! - `fake`: quantize→dequantize simulation in f32
//! - `pack`: packed reduced-precision storage (4/8-bit, f16 group scales)
//!
//! All three operate on the same group decomposition of a flat weight
//! buffer, so simulated and packed representations stay comparable.

mod calibrate;
mod fake;
mod pack;

pub use calibrate::{calibrate_weights, scale_zero_point, RangeCalibrator, RangeMethod};
pub use fake::{fake_quantize_in_place, fake_quantized};
pub use pack::PackedTensor;

use serde::{Deserialize, Serialize};

/// Quantization granularity options
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Single scale/zero-point for the entire tensor
    #[default]
    PerTensor,
    /// Separate scale/zero-point per output channel (row of the weight matrix)
    PerChannel,
    /// Separate scale/zero-point per group of n contiguous elements
    PerGroup(usize),
}

/// Quantization mode: symmetric or asymmetric
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuantMode {
    /// Zero-point = 0, range = [-max_abs, max_abs]
    #[default]
    Symmetric,
    /// Zero-point != 0, range = [min, max]
    Asymmetric,
}

/// Integer range for a bit width under a quantization mode
pub fn quant_range(bits: u8, mode: QuantMode) -> (i32, i32) {
    match mode {
        QuantMode::Symmetric => {
            let qmax = (1i32 << (bits - 1)) - 1;
            (-qmax, qmax)
        }
        QuantMode::Asymmetric => (0, (1i32 << bits) - 1),
    }
}

/// Quantization parameters for one flat weight buffer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuantParams {
    /// Scale factor per group
    pub scales: Vec<f32>,
    /// Zero point per group (empty for symmetric quantization)
    pub zero_points: Vec<i32>,
    /// Group decomposition used
    pub granularity: Granularity,
    /// Symmetric or asymmetric
    pub mode: QuantMode,
    /// Bit width
    pub bits: u8,
}

impl QuantParams {
    /// Number of scale/zero-point groups
    pub fn num_groups(&self) -> usize {
        self.scales.len()
    }

    /// Check if asymmetric quantization
    pub fn is_asymmetric(&self) -> bool {
        self.mode == QuantMode::Asymmetric
    }

    /// Zero point for a group (0 under symmetric quantization)
    pub fn zero_point(&self, group: usize) -> i32 {
        self.zero_points.get(group).copied().unwrap_or(0)
    }

    /// Effective group length for a buffer of `len` elements with `rows`
    /// output channels
    pub fn group_len(&self, len: usize, rows: usize) -> usize {
        group_len(self.granularity, len, rows)
    }
}

/// Element count per group for a flat row-major `rows × (len/rows)` buffer
pub fn group_len(granularity: Granularity, len: usize, rows: usize) -> usize {
    match granularity {
        Granularity::PerTensor => len.max(1),
        Granularity::PerChannel => {
            if rows == 0 {
                len.max(1)
            } else {
                (len / rows).max(1)
            }
        }
        Granularity::PerGroup(g) => g.max(1),
    }
}

/// Contiguous group ranges covering a flat buffer
pub fn group_ranges(
    granularity: Granularity,
    len: usize,
    rows: usize,
) -> impl Iterator<Item = (usize, usize)> {
    let g = group_len(granularity, len, rows);
    (0..len.div_ceil(g)).map(move |i| (i * g, ((i + 1) * g).min(len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quant_range_symmetric() {
        assert_eq!(quant_range(8, QuantMode::Symmetric), (-127, 127));
        assert_eq!(quant_range(4, QuantMode::Symmetric), (-7, 7));
    }

    #[test]
    fn test_quant_range_asymmetric() {
        assert_eq!(quant_range(8, QuantMode::Asymmetric), (0, 255));
        assert_eq!(quant_range(4, QuantMode::Asymmetric), (0, 15));
    }

    #[test]
    fn test_group_len_per_channel() {
        // 4 rows of 8 elements each
        assert_eq!(group_len(Granularity::PerChannel, 32, 4), 8);
        assert_eq!(group_len(Granularity::PerTensor, 32, 4), 32);
        assert_eq!(group_len(Granularity::PerGroup(16), 32, 4), 16);
    }

    proptest! {
        /// Group ranges must tile the buffer exactly, in order, no overlap
        #[test]
        fn prop_group_ranges_tile(len in 1usize..512, g in 1usize..64) {
            let ranges: Vec<_> =
                group_ranges(Granularity::PerGroup(g), len, 1).collect();

            prop_assert_eq!(ranges[0].0, 0);
            prop_assert_eq!(ranges[ranges.len() - 1].1, len);
            for w in ranges.windows(2) {
                prop_assert_eq!(w[0].1, w[1].0);
            }
        }
    }
}
