//! Operator attributes of the emitted TOSA program.

use serde::{Deserialize, Serialize};

use super::TosaDType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundingMode {
    SingleRound,
    DoubleRound,
    InexactRound,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Attribute {
    #[default]
    None,
    Conv {
        /// `[top, bottom, left, right]`
        pad: Vec<i64>,
        stride: Vec<i64>,
        dilation: Vec<i64>,
        /// Zero points as attributes (0.80 dialect); `None` when passed as operands.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_zp: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight_zp: Option<i64>,
        /// Accumulator type (1.0 dialect).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acc_type: Option<TosaDType>,
        #[serde(default)]
        local_bound: bool,
    },
    Pool {
        kernel: Vec<i64>,
        stride: Vec<i64>,
        pad: Vec<i64>,
        #[serde(default)]
        input_zp: i64,
        #[serde(default)]
        output_zp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acc_type: Option<TosaDType>,
    },
    Rescale {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_zp: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_zp: Option<i64>,
        /// Multiplier/shift as attributes (0.80 dialect); empty when passed as operands.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        multiplier: Vec<i32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        shift: Vec<i32>,
        scale32: bool,
        rounding_mode: RoundingMode,
        per_channel: bool,
        #[serde(default)]
        input_unsigned: bool,
        #[serde(default)]
        output_unsigned: bool,
    },
    Clamp {
        min_int: i64,
        max_int: i64,
        min_fp: f64,
        max_fp: f64,
    },
    Reshape {
        new_shape: Vec<i64>,
    },
    Transpose {
        perms: Vec<i64>,
    },
    Slice {
        start: Vec<i64>,
        size: Vec<i64>,
    },
    Axis {
        axis: i64,
    },
    Tile {
        multiples: Vec<i64>,
    },
    Pad {
        /// `[before_0, after_0, before_1, after_1, ...]`
        padding: Vec<i64>,
        pad_const_int: i64,
        pad_const_fp: f64,
    },
    Mul {
        shift: i32,
    },
    MatMul {
        a_zp: i64,
        b_zp: i64,
    },
    ArithmeticRightShift {
        round: bool,
    },
}
