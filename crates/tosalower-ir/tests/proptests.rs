//! Property-based tests for the tosalower IR
//!
//! Invariants of spec parsing, tensor data movement and quantization that
//! should hold for all inputs.

use proptest::prelude::*;
use tosalower_ir::{
    quant::quantize_with, tensor::numel, DType, Extension, Profile, QuantArgs, TensorData,
    TosaSpecification, TosaVersion,
};

// ===== Strategies =====

fn arb_spec() -> impl Strategy<Value = TosaSpecification> {
    let legacy = (prop_oneof![Just(Profile::BaseInference), Just(Profile::MainInference)])
        .prop_map(|p| TosaSpecification::new(TosaVersion::V0_80, p));
    let current = (
        1u32..3,
        0u32..3,
        0u32..2,
        prop_oneof![Just(Profile::Integer), Just(Profile::FloatingPoint)],
    )
        .prop_map(|(major, minor, patch, p)| {
            TosaSpecification::new(TosaVersion::new(major, minor, patch), p)
        });
    (
        prop_oneof![legacy, current],
        prop::collection::btree_set(0usize..Extension::ALL.len(), 0..4),
    )
        .prop_map(|(mut spec, exts)| {
            for i in exts {
                spec = spec.with_extension(Extension::ALL[i]);
            }
            spec
        })
}

fn arb_shape() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..4, 1..4)
}

// ===== Properties =====

proptest! {
    #[test]
    fn prop_spec_string_round_trip(spec in arb_spec()) {
        let text = spec.to_string();
        let parsed: TosaSpecification = text.parse().unwrap();
        prop_assert_eq!(&parsed, &spec);
        prop_assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn prop_garbage_never_parses(text in "[a-z0-9+.]{0,12}") {
        // Lowercase text can never carry the mandatory "TOSA-" prefix.
        prop_assert!(text.parse::<TosaSpecification>().is_err());
    }

    #[test]
    fn prop_permute_twice_with_inverse_is_identity(shape in arb_shape(), seed in any::<u64>()) {
        let rank = shape.len();
        let mut perm: Vec<usize> = (0..rank).collect();
        // Deterministic shuffle from the seed.
        let mut s = seed;
        for i in (1..rank).rev() {
            s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            perm.swap(i, (s >> 33) as usize % (i + 1));
        }
        let mut inverse = vec![0; rank];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }

        let data = TensorData::from_i64(
            DType::Int32,
            shape.clone(),
            (0..numel(&shape) as i64).collect(),
        ).unwrap();
        let back = data.permute(&perm).unwrap().permute(&inverse).unwrap();
        prop_assert_eq!(back, data);
    }

    #[test]
    fn prop_quantize_stays_in_range(
        value in -1e6f64..1e6,
        scale in 1e-4f64..10.0,
        zp in -20i64..20,
    ) {
        let q = quantize_with(value, scale, zp, -128, 127);
        prop_assert!((-128..=127).contains(&q));
    }

    #[test]
    fn prop_dequantize_quantize_error_is_bounded(q in -128i64..=127, scale in 1e-3f64..1.0) {
        let args = QuantArgs::int8(scale, 0);
        let real = args.dequantize(q).unwrap();
        prop_assert_eq!(args.quantize(real).unwrap(), q);
    }
}
