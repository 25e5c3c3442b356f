//! Element data types of graph values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor flowing through the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float16,
    BFloat16,
    Float32,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::Float16 | DType::BFloat16 | DType::Float32)
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64
        )
    }

    pub fn bits(self) -> u32 {
        match self {
            DType::Bool => 1,
            DType::Int8 => 8,
            DType::Int16 | DType::Float16 | DType::BFloat16 => 16,
            DType::Int32 | DType::Float32 => 32,
            DType::Int64 => 64,
        }
    }

    /// Smallest representable value of an integer type.
    pub fn int_min(self) -> Option<i64> {
        match self {
            DType::Int8 => Some(i8::MIN as i64),
            DType::Int16 => Some(i16::MIN as i64),
            DType::Int32 => Some(i32::MIN as i64),
            DType::Int64 => Some(i64::MIN),
            DType::Bool => Some(0),
            _ => None,
        }
    }

    /// Largest representable value of an integer type.
    pub fn int_max(self) -> Option<i64> {
        match self {
            DType::Int8 => Some(i8::MAX as i64),
            DType::Int16 => Some(i16::MAX as i64),
            DType::Int32 => Some(i32::MAX as i64),
            DType::Int64 => Some(i64::MAX),
            DType::Bool => Some(1),
            _ => None,
        }
    }

    /// Result type when two operands of a binary op meet.
    ///
    /// Floats win over integers, wider types win over narrower ones.
    pub fn promote(self, other: DType) -> DType {
        fn rank(d: DType) -> u32 {
            match d {
                DType::Bool => 0,
                DType::Int8 => 1,
                DType::Int16 => 2,
                DType::Int32 => 3,
                DType::Int64 => 4,
                DType::BFloat16 => 5,
                DType::Float16 => 6,
                DType::Float32 => 7,
            }
        }
        if rank(self) >= rank(other) {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote() {
        assert_eq!(DType::Int8.promote(DType::Float32), DType::Float32);
        assert_eq!(DType::Int32.promote(DType::Int8), DType::Int32);
        assert_eq!(DType::Bool.promote(DType::Bool), DType::Bool);
    }

    #[test]
    fn test_int_range() {
        assert_eq!(DType::Int8.int_min(), Some(-128));
        assert_eq!(DType::Int8.int_max(), Some(127));
        assert_eq!(DType::Float32.int_max(), None);
    }
}
