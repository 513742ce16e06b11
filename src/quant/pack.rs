//! Packed reduced-precision weight storage
//!
//! Group-wise symmetric quantization with f16 group scales:
//! - 4-bit: two values per byte, group of 32 → 16 data bytes + 2 scale bytes
//! - 8-bit: one signed byte per value, group of 32 → 32 data bytes + 2 scale bytes
//!
//! Storing scales as f16 is what makes the packed representation lossy
//! relative to the f32 fake-quantized simulation (simulate-vs-pack
//! distinction); the loss is confined to this module.

use crate::error::{Error, Result};
use half::f16;
use serde::{Deserialize, Serialize};

/// Default group size, matching llama.cpp-style block formats
pub const DEFAULT_GROUP_SIZE: usize = 32;

/// A packed, reduced-precision tensor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackedTensor {
    /// Bit width (4 or 8)
    pub bits: u8,
    /// Elements per scale group
    pub group_size: usize,
    /// Per-group scale factors (f16)
    pub scales: Vec<f16>,
    /// Packed integer data
    pub data: Vec<u8>,
    /// Original number of elements
    pub len: usize,
}

impl PackedTensor {
    /// Pack f32 values with symmetric group-wise quantization
    pub fn pack(values: &[f32], bits: u8, group_size: usize) -> Result<Self> {
        if bits != 4 && bits != 8 {
            return Err(Error::Config(format!(
                "packed storage supports 4 or 8 bits, got {bits}"
            )));
        }
        let group_size = group_size.max(1);
        let num_groups = values.len().div_ceil(group_size);
        let qmax = ((1i32 << (bits - 1)) - 1) as f32;

        let mut scales = Vec::with_capacity(num_groups);
        let mut data = Vec::with_capacity(packed_bytes(values.len(), bits, group_size));

        for g in 0..num_groups {
            let start = g * group_size;
            let end = (start + group_size).min(values.len());
            let group = &values[start..end];

            let max_abs = group.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            let scale = if max_abs < 1e-10 { 1e-10 } else { max_abs / qmax };
            let scale = f16::from_f32(scale);
            scales.push(scale);
            let scale = scale.to_f32();

            if bits == 4 {
                let mut byte = 0u8;
                for i in 0..group_size {
                    let val = if start + i < end { group[i] } else { 0.0 };
                    let q = ((val / scale).round().clamp(-7.0, 7.0) as i8) & 0x0F;
                    if i % 2 == 0 {
                        byte = (q as u8) & 0x0F;
                    } else {
                        byte |= ((q as u8) & 0x0F) << 4;
                        data.push(byte);
                    }
                }
                if group_size % 2 == 1 {
                    data.push(byte);
                }
            } else {
                for &val in group {
                    let q = (val / scale).round().clamp(-127.0, 127.0) as i8;
                    data.push(q as u8);
                }
                data.extend(std::iter::repeat_n(0u8, group_size - group.len()));
            }
        }

        Ok(Self {
            bits,
            group_size,
            scales,
            data,
            len: values.len(),
        })
    }

    /// Dequantize back to f32
    pub fn dequantize(&self) -> Vec<f32> {
        let mut result = Vec::with_capacity(self.len);
        let bytes_per_group = if self.bits == 4 {
            self.group_size.div_ceil(2)
        } else {
            self.group_size
        };

        for i in 0..self.len {
            let group = i / self.group_size;
            let offset = i % self.group_size;
            let scale = self.scales[group].to_f32();

            let q = if self.bits == 4 {
                let byte = self.data[group * bytes_per_group + offset / 2];
                let nibble = if offset % 2 == 0 {
                    byte & 0x0F
                } else {
                    (byte >> 4) & 0x0F
                };
                // Sign extend from 4 bits
                if nibble & 0x08 != 0 {
                    (nibble | 0xF0) as i8
                } else {
                    nibble as i8
                }
            } else {
                self.data[group * bytes_per_group + offset] as i8
            };

            result.push(q as f32 * scale);
        }

        result
    }

    /// Number of scale groups
    pub fn num_groups(&self) -> usize {
        self.scales.len()
    }

    /// Packed memory footprint in bytes (data + f16 scales)
    pub fn memory_bytes(&self) -> usize {
        self.data.len() + self.scales.len() * 2
    }

    /// Compression ratio vs f32 storage
    pub fn compression_ratio(&self) -> f32 {
        (self.len * 4) as f32 / self.memory_bytes() as f32
    }
}

fn packed_bytes(len: usize, bits: u8, group_size: usize) -> usize {
    let groups = len.div_ceil(group_size);
    if bits == 4 {
        groups * group_size.div_ceil(2)
    } else {
        groups * group_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(200))]

        /// 4-bit round-trip error is bounded by the group scale
        #[test]
        fn prop_q4_round_trip(
            values in prop::collection::vec(-10.0f32..10.0, 32..128),
        ) {
            let packed = PackedTensor::pack(&values, 4, DEFAULT_GROUP_SIZE).unwrap();
            let deq = packed.dequantize();

            prop_assert_eq!(deq.len(), values.len());
            for (i, (&orig, &d)) in values.iter().zip(deq.iter()).enumerate() {
                let scale = packed.scales[i / DEFAULT_GROUP_SIZE].to_f32();
                prop_assert!((orig - d).abs() <= scale * 1.5);
            }
        }

        /// 8-bit round-trip error is bounded by the group scale
        #[test]
        fn prop_q8_round_trip(
            values in prop::collection::vec(-10.0f32..10.0, 32..128),
        ) {
            let packed = PackedTensor::pack(&values, 8, DEFAULT_GROUP_SIZE).unwrap();
            let deq = packed.dequantize();

            prop_assert_eq!(deq.len(), values.len());
            for (i, (&orig, &d)) in values.iter().zip(deq.iter()).enumerate() {
                let scale = packed.scales[i / DEFAULT_GROUP_SIZE].to_f32();
                prop_assert!((orig - d).abs() <= scale * 1.1);
            }
        }

        /// Group count matches the buffer length
        #[test]
        fn prop_group_count(len in 1usize..512) {
            let values = vec![1.0f32; len];
            let packed = PackedTensor::pack(&values, 4, DEFAULT_GROUP_SIZE).unwrap();
            prop_assert_eq!(packed.num_groups(), len.div_ceil(DEFAULT_GROUP_SIZE));
        }

        /// Packing is deterministic: same input, same bytes
        #[test]
        fn prop_pack_deterministic(
            values in prop::collection::vec(-10.0f32..10.0, 16..96),
        ) {
            let a = PackedTensor::pack(&values, 4, DEFAULT_GROUP_SIZE).unwrap();
            let b = PackedTensor::pack(&values, 4, DEFAULT_GROUP_SIZE).unwrap();
            prop_assert_eq!(a.data, b.data);
            prop_assert_eq!(a.scales, b.scales);
        }
    }

    #[test]
    fn test_rejects_unsupported_bits() {
        let values = vec![1.0f32; 8];
        assert!(PackedTensor::pack(&values, 3, 32).is_err());
        assert!(PackedTensor::pack(&values, 16, 32).is_err());
    }

    #[test]
    fn test_q4_compression_ratio() {
        let values = vec![1.0f32; 1024];
        let packed = PackedTensor::pack(&values, 4, DEFAULT_GROUP_SIZE).unwrap();

        // 32 groups × (16 data + 2 scale) = 576 bytes vs 4096
        assert_eq!(packed.memory_bytes(), 32 * 18);
        assert!(packed.compression_ratio() > 7.0);
    }

    #[test]
    fn test_q8_compression_ratio() {
        let values = vec![1.0f32; 1024];
        let packed = PackedTensor::pack(&values, 8, DEFAULT_GROUP_SIZE).unwrap();

        assert_eq!(packed.memory_bytes(), 32 * 34);
        assert!(packed.compression_ratio() > 3.5);
    }

    #[test]
    fn test_zeros_round_trip() {
        let values = vec![0.0f32; 64];
        let packed = PackedTensor::pack(&values, 4, DEFAULT_GROUP_SIZE).unwrap();
        for v in packed.dequantize() {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_partial_group() {
        let values = vec![1.0, -2.0, 3.0];
        let packed = PackedTensor::pack(&values, 8, DEFAULT_GROUP_SIZE).unwrap();
        let deq = packed.dequantize();
        assert_eq!(deq.len(), 3);
        for (orig, d) in values.iter().zip(deq.iter()) {
            assert!((orig - d).abs() < 0.05);
        }
    }

    #[test]
    fn test_q8_better_than_q4() {
        let values: Vec<f32> = (0..128).map(|i| (i as f32 * 0.1).sin()).collect();
        let err = |bits| -> f32 {
            let packed = PackedTensor::pack(&values, bits, DEFAULT_GROUP_SIZE).unwrap();
            values
                .iter()
                .zip(packed.dequantize().iter())
                .map(|(a, b)| (a - b).abs())
                .sum()
        };
        assert!(err(8) < err(4));
    }
}
