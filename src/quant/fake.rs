//! Fake quantization: quantize→dequantize simulation in f32
//!
//! Applies the integer grid defined by [`QuantParams`] while keeping the
//! values in floating point, so accuracy can be evaluated without packing.

use crate::quant::{group_ranges, quant_range, QuantParams};

/// Fake-quantize a flat buffer in place
///
/// `rows` is the output-channel count used for per-channel grouping.
pub fn fake_quantize_in_place(values: &mut [f32], rows: usize, params: &QuantParams) {
    let (qmin, qmax) = quant_range(params.bits, params.mode);

    for (group, (start, end)) in group_ranges(params.granularity, values.len(), rows).enumerate() {
        let scale = params.scales[group];
        let zp = params.zero_point(group);

        for v in &mut values[start..end] {
            let q = (*v / scale + zp as f32)
                .round()
                .clamp(qmin as f32, qmax as f32) as i32;
            *v = (q - zp) as f32 * scale;
        }
    }
}

/// Fake-quantize into a new buffer
pub fn fake_quantized(values: &[f32], rows: usize, params: &QuantParams) -> Vec<f32> {
    let mut out = values.to_vec();
    fake_quantize_in_place(&mut out, rows, params);
    out
}
