//! Canonical operator names used as node targets.
//!
//! Names follow the `<namespace>.<op>.<overload>` form of the capture
//! dialect. Argument layouts are listed next to the less obvious ones.

/// Core tensor operators.
pub mod aten {
    /// `(input, weight, bias|None, stride, padding, dilation, transposed, output_padding, groups)`
    pub const CONVOLUTION: &str = "aten.convolution.default";
    /// `(input, weight, bias|None)`
    pub const LINEAR: &str = "aten.linear.default";
    pub const MM: &str = "aten.mm.default";
    pub const BMM: &str = "aten.bmm.default";

    pub const ADD: &str = "aten.add.Tensor";
    pub const ADD_SCALAR: &str = "aten.add.Scalar";
    pub const SUB: &str = "aten.sub.Tensor";
    pub const SUB_SCALAR: &str = "aten.sub.Scalar";
    pub const MUL: &str = "aten.mul.Tensor";
    pub const MUL_SCALAR: &str = "aten.mul.Scalar";
    pub const DIV: &str = "aten.div.Tensor";
    pub const DIV_SCALAR: &str = "aten.div.Scalar";
    /// `(input, exponent: Int|Float)`
    pub const POW_SCALAR: &str = "aten.pow.Tensor_Scalar";
    pub const MAXIMUM: &str = "aten.maximum.default";
    pub const MINIMUM: &str = "aten.minimum.default";

    pub const ABS: &str = "aten.abs.default";
    pub const NEG: &str = "aten.neg.default";
    pub const EXP: &str = "aten.exp.default";
    pub const LOG: &str = "aten.log.default";
    pub const RECIPROCAL: &str = "aten.reciprocal.default";
    pub const RSQRT: &str = "aten.rsqrt.default";
    pub const SQRT: &str = "aten.sqrt.default";
    pub const SIGMOID: &str = "aten.sigmoid.default";
    pub const TANH: &str = "aten.tanh.default";
    pub const ERF: &str = "aten.erf.default";
    pub const FLOOR: &str = "aten.floor.default";
    pub const CEIL: &str = "aten.ceil.default";
    pub const ROUND: &str = "aten.round.default";
    pub const SIGN: &str = "aten.sign.default";
    pub const SINH: &str = "aten.sinh.default";

    pub const RELU: &str = "aten.relu.default";
    /// `(input, min, max)`
    pub const HARDTANH: &str = "aten.hardtanh.default";
    /// `(input, negative_slope)`
    pub const LEAKY_RELU: &str = "aten.leaky_relu.default";
    /// `(input, approximate: Str)`
    pub const GELU: &str = "aten.gelu.default";
    pub const SILU: &str = "aten.silu.default";
    /// `(input, min|None, max|None)`
    pub const CLAMP: &str = "aten.clamp.default";
    /// `(condition, self, other)`
    pub const WHERE: &str = "aten.where.self";

    pub const EQ: &str = "aten.eq.Tensor";
    pub const EQ_SCALAR: &str = "aten.eq.Scalar";
    pub const NE: &str = "aten.ne.Tensor";
    pub const NE_SCALAR: &str = "aten.ne.Scalar";
    pub const GT: &str = "aten.gt.Tensor";
    pub const GT_SCALAR: &str = "aten.gt.Scalar";
    pub const GE: &str = "aten.ge.Tensor";
    pub const GE_SCALAR: &str = "aten.ge.Scalar";
    pub const LT: &str = "aten.lt.Tensor";
    pub const LT_SCALAR: &str = "aten.lt.Scalar";
    pub const LE: &str = "aten.le.Tensor";
    pub const LE_SCALAR: &str = "aten.le.Scalar";

    pub const LOGICAL_AND: &str = "aten.logical_and.default";
    pub const LOGICAL_OR: &str = "aten.logical_or.default";
    pub const LOGICAL_XOR: &str = "aten.logical_xor.default";
    pub const LOGICAL_NOT: &str = "aten.logical_not.default";
    pub const BITWISE_AND: &str = "aten.bitwise_and.Tensor";
    pub const BITWISE_OR: &str = "aten.bitwise_or.Tensor";
    pub const BITWISE_XOR: &str = "aten.bitwise_xor.Tensor";
    pub const BITWISE_NOT: &str = "aten.bitwise_not.default";
    pub const LSHIFT: &str = "aten.bitwise_left_shift.Tensor";
    pub const RSHIFT: &str = "aten.bitwise_right_shift.Tensor";

    pub const ANY: &str = "aten.any.default";
    /// `(input, dim: Int, keepdim)`
    pub const ANY_DIM: &str = "aten.any.dim";
    /// `(input, dims: Ints, keepdim)`
    pub const ANY_DIMS: &str = "aten.any.dims";
    /// `(input, dims: Ints, keepdim)`
    pub const SUM: &str = "aten.sum.dim_IntList";
    /// `(input, dims: Ints, keepdim)`
    pub const MEAN_DIM: &str = "aten.mean.dim";
    /// `(input, dims: Ints, correction: Int, keepdim)`
    pub const VAR: &str = "aten.var.correction";
    /// `(input, dims: Ints, keepdim)`
    pub const AMAX: &str = "aten.amax.default";
    pub const AMIN: &str = "aten.amin.default";
    /// `(input, dim: Int, keepdim)`, outputs `(values, indices)`
    pub const MAX_DIM: &str = "aten.max.dim";
    pub const MIN_DIM: &str = "aten.min.dim";

    /// `(input, dim: Int, half_to_float: Bool)`
    pub const SOFTMAX: &str = "aten._softmax.default";
    /// `(input, normalized_shape: Ints, weight|None, bias|None, eps)`
    pub const LAYER_NORM: &str = "aten.layer_norm.default";
    /// `(input, weight|None, bias|None, running_mean, running_var, momentum, eps)`
    pub const BATCH_NORM: &str = "aten._native_batch_norm_legit_no_training.default";
    /// `(input, ord: Float, dims: Ints, keepdim)`
    pub const LINALG_VECTOR_NORM: &str = "aten.linalg_vector_norm.default";

    /// `(input, shape: Ints)`
    pub const VIEW: &str = "aten.view_copy.default";
    /// `(input, perm: Ints)`
    pub const PERMUTE: &str = "aten.permute_copy.default";
    /// `(input, dims: Ints)`
    pub const SQUEEZE: &str = "aten.squeeze_copy.dims";
    /// `(input, dim: Int)`
    pub const UNSQUEEZE: &str = "aten.unsqueeze_copy.default";
    /// `(input, dim: Int, index: Int)`
    pub const SELECT: &str = "aten.select_copy.int";
    /// `(input, dim, start, end, step)`
    pub const SLICE: &str = "aten.slice_copy.Tensor";
    /// `(input, split_sizes: Ints, dim: Int)`, one output per split
    pub const SPLIT: &str = "aten.split_with_sizes_copy.default";
    /// `(tensors: Values, dim: Int)`
    pub const CAT: &str = "aten.cat.default";
    /// `(input, size: Ints)`
    pub const EXPAND: &str = "aten.expand_copy.default";
    /// `(input, multiples: Ints)`
    pub const REPEAT: &str = "aten.repeat.default";
    pub const CLONE: &str = "aten.clone.default";
    /// `(size: Ints, fill_value, dtype)`
    pub const FULL: &str = "aten.full.default";
    /// `(input, fill_value, dtype|None)`
    pub const FULL_LIKE: &str = "aten.full_like.default";
    /// `(input, dtype)`
    pub const TO_COPY: &str = "aten._to_copy.default";
    /// `(input, pad: Ints, value)`
    pub const CONSTANT_PAD_ND: &str = "aten.constant_pad_nd.default";

    /// `(input, kernel: Ints, stride: Ints, padding: Ints, ceil_mode, count_include_pad,
    /// divisor_override|None)`
    pub const AVG_POOL2D: &str = "aten.avg_pool2d.default";
    /// `(input, output_size: Ints)`
    pub const ADAPTIVE_AVG_POOL2D: &str = "aten.adaptive_avg_pool2d.default";
    /// `(input, kernel: Ints, stride: Ints, padding: Ints, dilation: Ints, ceil_mode)`
    pub const MAX_POOL2D: &str = "aten.max_pool2d.default";
    /// Same arguments as [`MAX_POOL2D`], outputs `(values, indices)`.
    pub const MAX_POOL2D_WITH_INDICES: &str = "aten.max_pool2d_with_indices.default";
}

/// Quantize/dequantize boundary operators inserted by the quantizer.
pub mod quantized {
    /// `(input, scale: Float, zero_point: Int, qmin: Int, qmax: Int, dtype)`
    pub const QUANTIZE_PER_TENSOR: &str = "quantized_decomposed.quantize_per_tensor.default";
    pub const DEQUANTIZE_PER_TENSOR: &str = "quantized_decomposed.dequantize_per_tensor.default";
    /// `(input, scales: Floats, zero_points: Ints, axis: Int, qmin: Int, qmax: Int, dtype)`
    pub const QUANTIZE_PER_CHANNEL: &str = "quantized_decomposed.quantize_per_channel.default";
    pub const DEQUANTIZE_PER_CHANNEL: &str = "quantized_decomposed.dequantize_per_channel.default";

    pub fn is_quantize(target: &str) -> bool {
        target == QUANTIZE_PER_TENSOR || target == QUANTIZE_PER_CHANNEL
    }

    pub fn is_dequantize(target: &str) -> bool {
        target == DEQUANTIZE_PER_TENSOR || target == DEQUANTIZE_PER_CHANNEL
    }
}

/// Backend operators created during legalization.
pub mod tosa {
    /// `(input, output_dtype, scales: Floats, input_zp: Int, output_zp: Int)`
    pub const RESCALE: &str = "tosa._rescale.default";
    /// `(input, table: Value)`
    pub const TABLE: &str = "tosa._table.default";
}

/// Operator name without namespace and overload: `aten.add.Tensor` → `add`.
pub fn short_name(target: &str) -> &str {
    let mut parts = target.split('.');
    match (parts.next(), parts.next()) {
        (Some(_), Some(op)) => op,
        (Some(only), None) => only,
        _ => target,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(short_name(aten::ADD), "add");
        assert_eq!(short_name(tosa::RESCALE), "_rescale");
        assert_eq!(short_name("getitem"), "getitem");
    }

    #[test]
    fn test_quantize_predicates() {
        assert!(quantized::is_quantize(quantized::QUANTIZE_PER_CHANNEL));
        assert!(!quantized::is_quantize(quantized::DEQUANTIZE_PER_TENSOR));
        assert!(quantized::is_dequantize(quantized::DEQUANTIZE_PER_TENSOR));
    }
}
