//! Property-based tests for INT8 quantization
//!
//! These tests use proptest to verify quantization properties.

use comprobar::quantize::{
    dequantize, fake_quant, quantize_i8, Int8Weight, ScalePair, QUANT_MAX_BOUND,
};
use proptest::prelude::*;

/// Non-degenerate activation rows
fn activations(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-100.0f32..100.0, len).prop_filter("not all zero", |v| {
        v.iter().any(|x| x.abs() > 1e-3)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Calibrated fake quantization never leaves [-127, 127]
    #[test]
    fn test_fake_quant_bounded(x in activations(1..256)) {
        let scales = ScalePair::from_activations(&x);
        for q in fake_quant(&x, scales.in_scale) {
            prop_assert!(q.abs() <= f64::from(QUANT_MAX_BOUND));
            prop_assert_eq!(q, q.round());
        }
    }

    /// The int8 kernel quantizer agrees with the reference fake quantizer
    #[test]
    fn test_quantize_i8_matches_fake_quant(x in activations(1..256)) {
        let scales = ScalePair::from_activations(&x);
        let reference = fake_quant(&x, scales.in_scale);
        let kernel = quantize_i8(&x, scales.in_scale);
        for (r, k) in reference.iter().zip(&kernel) {
            prop_assert_eq!(*r, f64::from(*k));
        }
    }

    /// Fake quantization is deterministic
    #[test]
    fn test_fake_quant_deterministic(x in activations(1..64), scale in 1e-3f32..10.0) {
        prop_assert_eq!(fake_quant(&x, scale), fake_quant(&x, scale));
    }

    /// Quantize, integer matmul, dequantize reconstructs `x · W / 127`
    /// within the rounding error bound
    #[test]
    fn test_round_trip_matmul(
        x in activations(8..9),
        w in prop::collection::vec(-64i8..64, 8 * 4),
    ) {
        let weight = Int8Weight::new(w.clone(), 8, 4).unwrap();
        let scales = ScalePair::from_activations(&x);
        let acc = weight.matvec(&quantize_i8(&x, scales.in_scale)).unwrap();

        for (o, &a) in acc.iter().enumerate() {
            let row = weight.row(o);
            let exact: f32 = x
                .iter()
                .zip(row)
                .map(|(&xi, &wi)| xi * f32::from(wi) / QUANT_MAX_BOUND)
                .sum();
            // each quantized input is off by at most half a step
            let weight_l1: f32 = row.iter().map(|&wi| f32::from(wi).abs()).sum();
            let bound = 0.5 * weight_l1 * scales.out_scale + 1e-3 * (1.0 + exact.abs());
            #[allow(clippy::cast_precision_loss)]
            let approx = dequantize(a as f32, scales.out_scale);
            prop_assert!(
                (approx - exact).abs() <= bound,
                "row {}: {} vs {} (bound {})", o, approx, exact, bound
            );
        }
    }
}

#[test]
fn test_zero_activations_use_fallback_scale() {
    let scales = ScalePair::from_activations(&[0.0; 16]);
    assert_eq!(scales.in_scale, 1.0);
    assert_eq!(scales.out_scale, 0.0);
    assert!(fake_quant(&[0.0; 4], scales.in_scale).iter().all(|&q| q == 0.0));
}

#[test]
fn test_round_half_away_from_zero() {
    // 127 * 0.5 = 63.5, 127 * 1.5 = 190.5; no clipping
    let q = fake_quant(&[0.5, -0.5, 1.5], 1.0);
    assert_eq!(q, vec![64.0, -64.0, 191.0]);
}
