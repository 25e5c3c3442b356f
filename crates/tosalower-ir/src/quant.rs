//! Quantization parameters attached to quantized values.
//!
//! A [`QuantArgs`] describes the affine mapping `real = (q - zero_point) * scale`
//! either for a whole tensor (one pair) or per channel along `axis`.

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::IrError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantArgs {
    pub scales: Vec<f64>,
    pub zero_points: Vec<i64>,
    /// Channel axis for per-channel parameters, `None` for per-tensor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<usize>,
    pub qmin: i64,
    pub qmax: i64,
    pub dtype: DType,
}

impl QuantArgs {
    pub fn per_tensor(scale: f64, zero_point: i64, qmin: i64, qmax: i64, dtype: DType) -> Self {
        QuantArgs {
            scales: vec![scale],
            zero_points: vec![zero_point],
            axis: None,
            qmin,
            qmax,
            dtype,
        }
    }

    pub fn per_channel(
        scales: Vec<f64>,
        zero_points: Vec<i64>,
        axis: usize,
        qmin: i64,
        qmax: i64,
        dtype: DType,
    ) -> Result<Self, IrError> {
        if scales.is_empty() {
            return Err(IrError::InvalidQuantization {
                reason: "per-channel quantization needs at least one scale".to_string(),
            });
        }
        if scales.len() != zero_points.len() {
            return Err(IrError::InvalidQuantization {
                reason: format!(
                    "{} scales but {} zero points",
                    scales.len(),
                    zero_points.len()
                ),
            });
        }
        Ok(QuantArgs {
            scales,
            zero_points,
            axis: Some(axis),
            qmin,
            qmax,
            dtype,
        })
    }

    /// Symmetric int8 per-tensor parameters, the common case in tests.
    pub fn int8(scale: f64, zero_point: i64) -> Self {
        QuantArgs::per_tensor(scale, zero_point, -128, 127, DType::Int8)
    }

    pub fn is_per_channel(&self) -> bool {
        self.axis.is_some()
    }

    pub fn scale_per_tensor(&self) -> Result<f64, IrError> {
        match (self.axis, self.scales.as_slice()) {
            (None, [scale]) => Ok(*scale),
            _ => Err(IrError::PerChannelQuantization {
                what: "scale".to_string(),
            }),
        }
    }

    pub fn zp_per_tensor(&self) -> Result<i64, IrError> {
        match (self.axis, self.zero_points.as_slice()) {
            (None, [zp]) => Ok(*zp),
            _ => Err(IrError::PerChannelQuantization {
                what: "zero point".to_string(),
            }),
        }
    }

    pub fn scale_per_channel(&self) -> &[f64] {
        &self.scales
    }

    /// Quantize a real value with per-tensor parameters, clamped to `[qmin, qmax]`.
    pub fn quantize(&self, value: f64) -> Result<i64, IrError> {
        let scale = self.scale_per_tensor()?;
        let zp = self.zp_per_tensor()?;
        Ok(quantize_with(value, scale, zp, self.qmin, self.qmax))
    }

    pub fn dequantize(&self, value: i64) -> Result<f64, IrError> {
        let scale = self.scale_per_tensor()?;
        let zp = self.zp_per_tensor()?;
        Ok((value - zp) as f64 * scale)
    }

    /// Quantize a value belonging to channel `channel` (per-tensor params ignore it).
    pub fn quantize_channel(&self, value: f64, channel: usize) -> i64 {
        let slot = if self.scales.len() == 1 { 0 } else { channel };
        let scale = self.scales.get(slot).copied().unwrap_or(1.0);
        let zp = self.zero_points.get(slot).copied().unwrap_or(0);
        quantize_with(value, scale, zp, self.qmin, self.qmax)
    }
}

/// Round-half-to-even quantization, matching the reference quantizer.
pub fn quantize_with(value: f64, scale: f64, zero_point: i64, qmin: i64, qmax: i64) -> i64 {
    let scaled = value / scale;
    let rounded = round_half_even(scaled) as i64;
    (rounded + zero_point).clamp(qmin, qmax)
}

pub fn round_half_even(value: f64) -> f64 {
    let floor = value.floor();
    let diff = value - floor;
    if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if floor % 2.0 == 0.0 {
        floor
    } else {
        floor + 1.0
    }
}
