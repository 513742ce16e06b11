//! Range calibration for quantization parameters
//!
//! Determines scale and zero-point from observed values:
//! - Min-Max: full range of observed values
//! - Percentile: robust to outliers
//! - Moving Average: smoothed over multiple batches
//!
//! Degenerate statistics (no data, NaN bounds, zero range) are reported as
//! [`Error::DegenerateStats`] rather than clamped away; the transform layer
//! decides between identity fallback and abort.

use crate::error::{Error, Result};
use crate::quant::{group_ranges, quant_range, Granularity, QuantMode, QuantParams};

/// Range estimation method
#[derive(Clone, Debug, PartialEq, Default)]
pub enum RangeMethod {
    /// Exact min/max of all observed values
    #[default]
    MinMax,
    /// Percentile bounds over collected samples
    Percentile {
        /// Lower percentile (e.g., 0.01 for 0.01%)
        lower: f32,
        /// Upper percentile (e.g., 99.99 for 99.99%)
        upper: f32,
    },
    /// Exponentially smoothed min/max over batches
    MovingAverage {
        /// Smoothing factor (0 = keep old, 1 = fully use new value)
        momentum: f32,
    },
}

/// Streaming range calibrator
///
/// Observes batches of values and produces (min, max) bounds according to
/// the configured method.
#[derive(Clone, Debug)]
pub struct RangeCalibrator {
    method: RangeMethod,
    running_min: Option<f32>,
    running_max: Option<f32>,
    samples: Vec<f32>,
    max_samples: usize,
    num_batches: usize,
}

impl RangeCalibrator {
    /// Create a calibrator with the given method
    pub fn new(method: RangeMethod) -> Self {
        let max_samples = match method {
            RangeMethod::Percentile { .. } => 16384,
            _ => 0,
        };
        Self {
            method,
            running_min: None,
            running_max: None,
            samples: Vec::new(),
            max_samples,
            num_batches: 0,
        }
    }

    /// Min-max calibrator
    pub fn min_max() -> Self {
        Self::new(RangeMethod::MinMax)
    }

    /// Observe a batch of values
    pub fn observe(&mut self, data: &[f32]) {
        if data.is_empty() {
            return;
        }

        let batch_min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let batch_max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

        match self.method {
            RangeMethod::MinMax | RangeMethod::Percentile { .. } => {
                self.running_min = Some(
                    self.running_min
                        .map(|m| m.min(batch_min))
                        .unwrap_or(batch_min),
                );
                self.running_max = Some(
                    self.running_max
                        .map(|m| m.max(batch_max))
                        .unwrap_or(batch_max),
                );
            }
            RangeMethod::MovingAverage { momentum } => {
                self.running_min = Some(
                    self.running_min
                        .map(|m| m * (1.0 - momentum) + batch_min * momentum)
                        .unwrap_or(batch_min),
                );
                self.running_max = Some(
                    self.running_max
                        .map(|m| m * (1.0 - momentum) + batch_max * momentum)
                        .unwrap_or(batch_max),
                );
            }
        }

        if matches!(self.method, RangeMethod::Percentile { .. })
            && self.samples.len() < self.max_samples
        {
            let remaining = self.max_samples - self.samples.len();
            self.samples.extend(data.iter().take(remaining).cloned());
        }

        self.num_batches += 1;
    }

    /// Number of batches observed
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    /// Check if any data has been observed
    pub fn has_data(&self) -> bool {
        self.num_batches > 0
    }

    /// Compute (min, max) bounds
    pub fn bounds(&self) -> Result<(f32, f32)> {
        let (min_val, max_val) = match self.method {
            RangeMethod::MinMax | RangeMethod::MovingAverage { .. } => (
                self.running_min
                    .ok_or_else(|| Error::DegenerateStats("no data observed".into()))?,
                self.running_max
                    .ok_or_else(|| Error::DegenerateStats("no data observed".into()))?,
            ),
            RangeMethod::Percentile { lower, upper } => self.percentile_bounds(lower, upper)?,
        };

        if !min_val.is_finite() || !max_val.is_finite() {
            return Err(Error::DegenerateStats(format!(
                "non-finite bounds ({min_val}, {max_val})"
            )));
        }
        Ok((min_val, max_val))
    }

    fn percentile_bounds(&self, lower: f32, upper: f32) -> Result<(f32, f32)> {
        if self.samples.is_empty() {
            return Err(Error::DegenerateStats("no data observed".into()));
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let lower_idx = (((lower / 100.0) * n as f32) as usize).min(n - 1);
        let upper_idx = (((upper / 100.0) * n as f32) as usize).min(n - 1);

        Ok((sorted[lower_idx], sorted[upper_idx]))
    }
}

/// Compute (scale, zero_point) from bounds
///
/// Fails with [`Error::DegenerateStats`] when the observed range collapses
/// to zero; an all-zero activation or weight buffer cannot define a scale.
pub fn scale_zero_point(
    min_val: f32,
    max_val: f32,
    bits: u8,
    mode: QuantMode,
) -> Result<(f32, i32)> {
    let (qmin, qmax) = quant_range(bits, mode);

    match mode {
        QuantMode::Symmetric => {
            let max_abs = min_val.abs().max(max_val.abs());
            if max_abs < 1e-30 {
                return Err(Error::DegenerateStats("zero-range values".into()));
            }
            Ok((max_abs / qmax as f32, 0))
        }
        QuantMode::Asymmetric => {
            let range = max_val - min_val;
            if range < 1e-30 {
                return Err(Error::DegenerateStats("zero-range values".into()));
            }
            let scale = range / (qmax - qmin) as f32;
            let zero_point = ((qmin as f32) - min_val / scale).round() as i32;
            Ok((scale, zero_point.clamp(qmin, qmax)))
        }
    }
}

/// Calibrate per-group quantization parameters for a flat weight buffer
///
/// `rows` is the number of output channels (for per-channel grouping of a
/// row-major `rows × cols` matrix).
pub fn calibrate_weights(
    values: &[f32],
    rows: usize,
    granularity: Granularity,
    bits: u8,
    mode: QuantMode,
) -> Result<QuantParams> {
    if values.is_empty() {
        return Err(Error::DegenerateStats("empty weight buffer".into()));
    }

    let mut scales = Vec::new();
    let mut zero_points = Vec::new();

    for (start, end) in group_ranges(granularity, values.len(), rows) {
        let group = &values[start..end];
        let min_val = group.iter().cloned().fold(f32::INFINITY, f32::min);
        let max_val = group.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let (scale, zp) = scale_zero_point(min_val, max_val, bits, mode)?;
        scales.push(scale);
        if mode == QuantMode::Asymmetric {
            zero_points.push(zp);
        }
    }

    Ok(QuantParams {
        scales,
        zero_points,
        granularity,
        mode,
        bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// Min-max calibration captures the full observed range
        #[test]
        fn prop_min_max_captures_range(
            data in prop::collection::vec(-100.0f32..100.0, 10..100),
        ) {
            let mut cal = RangeCalibrator::min_max();
            cal.observe(&data);
            let (min_val, max_val) = cal.bounds().unwrap();

            let actual_min = data.iter().cloned().fold(f32::INFINITY, f32::min);
            let actual_max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

            prop_assert!((min_val - actual_min).abs() < 1e-5);
            prop_assert!((max_val - actual_max).abs() < 1e-5);
        }

        /// Symmetric calibration always yields zero_point = 0 and a positive scale
        #[test]
        fn prop_symmetric_scale(
            data in prop::collection::vec(-10.0f32..10.0, 10..50),
            bits in 4u8..9,
        ) {
            prop_assume!(data.iter().any(|v| v.abs() > 1e-3));
            let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

            let (scale, zp) = scale_zero_point(min, max, bits, QuantMode::Symmetric).unwrap();
            prop_assert_eq!(zp, 0);
            prop_assert!(scale > 0.0 && scale < 1e10);
        }

        /// Percentile bounds stay within the actual data range
        #[test]
        fn prop_percentile_within_range(
            data in prop::collection::vec(-10.0f32..10.0, 100..500),
        ) {
            let mut cal = RangeCalibrator::new(RangeMethod::Percentile {
                lower: 1.0,
                upper: 99.0,
            });
            cal.observe(&data);
            let (min_val, max_val) = cal.bounds().unwrap();

            let actual_min = data.iter().cloned().fold(f32::INFINITY, f32::min);
            let actual_max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

            prop_assert!(min_val >= actual_min - 1e-5);
            prop_assert!(max_val <= actual_max + 1e-5);
        }

        /// Per-group weight calibration produces one scale per group
        #[test]
        fn prop_group_count(len in 1usize..256, g in 1usize..64) {
            let values: Vec<f32> = (0..len).map(|i| i as f32 + 1.0).collect();
            let params = calibrate_weights(
                &values, 1, Granularity::PerGroup(g), 8, QuantMode::Symmetric,
            ).unwrap();
            prop_assert_eq!(params.num_groups(), len.div_ceil(g));
        }
    }

    #[test]
    fn test_min_max_multi_batch() {
        let mut cal = RangeCalibrator::min_max();
        cal.observe(&[0.0, 1.0, -2.0]);
        cal.observe(&[1.5, 3.0]);

        let (min_val, max_val) = cal.bounds().unwrap();
        assert_abs_diff_eq!(min_val, -2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(max_val, 3.0, epsilon = 1e-6);
        assert_eq!(cal.num_batches(), 2);
    }

    #[test]
    fn test_moving_average_smooths() {
        let mut cal = RangeCalibrator::new(RangeMethod::MovingAverage { momentum: 0.5 });
        cal.observe(&[-1.0, 1.0]);
        cal.observe(&[-2.0, 2.0]);

        // -1*0.5 + -2*0.5 = -1.5
        let (min_val, max_val) = cal.bounds().unwrap();
        assert_abs_diff_eq!(min_val, -1.5, epsilon = 1e-5);
        assert_abs_diff_eq!(max_val, 1.5, epsilon = 1e-5);
    }

    #[test]
    fn test_percentile_ignores_outliers() {
        let mut data: Vec<f32> = (0..100).map(|i| i as f32 * 0.1).collect();
        data.push(1000.0);
        data.push(-1000.0);

        let mut cal = RangeCalibrator::new(RangeMethod::Percentile {
            lower: 1.0,
            upper: 99.0,
        });
        cal.observe(&data);
        let (min_val, max_val) = cal.bounds().unwrap();

        assert!(min_val > -100.0, "should ignore negative outlier");
        assert!(max_val < 100.0, "should ignore positive outlier");
    }

    #[test]
    fn test_percentile_extreme_bounds_do_not_panic() {
        let mut cal = RangeCalibrator::new(RangeMethod::Percentile {
            lower: 100.0,
            upper: 100.0,
        });
        cal.observe(&[1.0, 2.0, 3.0]);

        let (min_val, max_val) = cal.bounds().unwrap();
        assert_abs_diff_eq!(min_val, 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(max_val, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_no_data_is_degenerate() {
        let cal = RangeCalibrator::min_max();
        assert!(matches!(cal.bounds(), Err(Error::DegenerateStats(_))));
    }

    #[test]
    fn test_zero_range_is_degenerate() {
        let err = scale_zero_point(0.0, 0.0, 8, QuantMode::Symmetric);
        assert!(matches!(err, Err(Error::DegenerateStats(_))));

        let err = scale_zero_point(5.0, 5.0, 8, QuantMode::Asymmetric);
        assert!(matches!(err, Err(Error::DegenerateStats(_))));
    }

    #[test]
    fn test_asymmetric_zero_point_clamped() {
        let (scale, zp) = scale_zero_point(0.0, 4.0, 8, QuantMode::Asymmetric).unwrap();
        assert!(scale > 0.0);
        assert!((0..=255).contains(&zp));
    }

    #[test]
    fn test_per_channel_scales() {
        // Two rows with very different magnitudes
        let values = vec![0.1, -0.1, 0.1, -0.1, 10.0, -10.0, 10.0, -10.0];
        let params = calibrate_weights(
            &values,
            2,
            Granularity::PerChannel,
            8,
            QuantMode::Symmetric,
        )
        .unwrap();

        assert_eq!(params.num_groups(), 2);
        assert!(params.scales[1] > params.scales[0] * 10.0);
    }
}
