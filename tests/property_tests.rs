//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use model_serve::container::ExpansionLimits;
use model_serve::input::PredictionInput;
use model_serve::{ArtifactSafetyScanner, InputSchema, ModelFormat, RiskLevel, ServeConfig};
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn scanner() -> &'static ArtifactSafetyScanner {
    static SCANNER: OnceLock<ArtifactSafetyScanner> = OnceLock::new();
    SCANNER.get_or_init(|| {
        ArtifactSafetyScanner::new(ExpansionLimits {
            max_bytes: 1 << 20,
            max_ratio: 50,
        })
        .expect("marker automaton builds")
    })
}

fn arb_format() -> impl Strategy<Value = ModelFormat> {
    prop_oneof![
        Just(ModelFormat::Onnx),
        Just(ModelFormat::Tensorflow),
        Just(ModelFormat::Pickle),
        Just(ModelFormat::Joblib),
        Just(ModelFormat::Pytorch),
    ]
}

/// Globals that must always make a pickle unsafe
fn arb_denied_global() -> impl Strategy<Value = (String, String)> {
    prop_oneof![
        (
            prop::sample::select(vec!["os", "posix", "subprocess", "socket", "shutil", "runpy"]),
            "[a-z_]{1,12}"
        )
            .prop_map(|(m, n)| (m.to_string(), n)),
        prop::sample::select(vec!["eval", "exec", "compile", "__import__", "getattr", "open"])
            .prop_map(|n| ("builtins".to_string(), n.to_string())),
    ]
}

// =============================================================================
// Safety scanner
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Arbitrary bytes never panic the scanner and get a consistent verdict
    #[test]
    fn test_scan_is_total_and_consistent(
        format in arb_format(),
        bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let first = scanner().assess_format(format, &bytes);
        let second = scanner().assess_format(format, &bytes);
        prop_assert_eq!(&first, &second);

        if first.is_safe {
            prop_assert!(first.is_valid);
        }
        if !first.is_valid {
            prop_assert_eq!(first.risk_level, RiskLevel::High);
            prop_assert!(!first.is_safe);
        }
        if !first.is_safe {
            prop_assert!(!first.findings.is_empty());
        }
    }

    /// A call through a denied global is never accepted
    #[test]
    fn test_denied_global_is_unsafe((module, name) in arb_denied_global()) {
        let payload = format!("c{}\n{}\n(S'x'\ntR.", module, name);
        let assessment = scanner().assess_format(ModelFormat::Pickle, payload.as_bytes());
        prop_assert!(!assessment.is_safe);
        prop_assert_eq!(assessment.risk_level, RiskLevel::High);
    }

    /// Extension detection is case-insensitive and ignores the stem
    #[test]
    fn test_format_from_any_stem(stem in "[A-Za-z0-9_][A-Za-z0-9_ .-]{0,19}") {
        for (ext, format) in [
            ("onnx", ModelFormat::Onnx),
            ("PKL", ModelFormat::Pickle),
            ("Joblib", ModelFormat::Joblib),
            ("pt", ModelFormat::Pytorch),
            ("pb", ModelFormat::Tensorflow),
        ] {
            let name = format!("{}.{}", stem, ext);
            prop_assert_eq!(ModelFormat::from_filename(&name).ok(), Some(format));
        }
    }
}

// =============================================================================
// Prediction input
// =============================================================================

proptest! {
    /// Named rows are laid out in schema order whatever order the client used
    #[test]
    fn test_named_rows_follow_schema_order(
        features in prop::collection::btree_map("[a-z]{1,8}", -1.0e6f64..1.0e6, 1..8),
    ) {
        let body: Map<String, Value> = features
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        let input = PredictionInput::parse(&Value::Object(body)).unwrap();

        let mut names: Vec<String> = features.keys().cloned().collect();
        names.reverse();
        let matrix = input.to_matrix(Some(&InputSchema::named(names.clone()))).unwrap();

        prop_assert_eq!(matrix.n_rows(), 1);
        let expected: Vec<f64> = names.iter().map(|n| features[n]).collect();
        prop_assert_eq!(matrix.row(0), expected.as_slice());
    }

    /// Positional batches keep their shape; a wrong width is rejected
    #[test]
    fn test_positional_batches(
        width in 1usize..6,
        rows in 1usize..6,
        seed in -100.0f64..100.0,
    ) {
        let batch: Vec<Value> = (0..rows)
            .map(|r| Value::from((0..width).map(|c| seed + (r * width + c) as f64).collect::<Vec<_>>()))
            .collect();
        let input = PredictionInput::parse(&Value::Array(batch)).unwrap();
        prop_assert_eq!(input.len(), rows);

        let matrix = input.to_matrix(Some(&InputSchema::width_only(width))).unwrap();
        prop_assert_eq!(matrix.n_rows(), rows);
        prop_assert_eq!(matrix.n_cols(), width);

        let err = input.to_matrix(Some(&InputSchema::width_only(width + 1))).unwrap_err();
        prop_assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}

// =============================================================================
// Configuration
// =============================================================================

proptest! {
    /// Config survives a TOML round trip
    #[test]
    fn test_config_toml_roundtrip(
        api_port in 1024u16..60000,
        max_resident_models in 1usize..64,
        max_upload_bytes in 1usize..(1 << 30),
        predict_timeout_secs in 1u64..600,
        allow_anonymous_predictions in any::<bool>(),
    ) {
        let config = ServeConfig {
            api_port,
            max_resident_models,
            max_upload_bytes,
            predict_timeout_secs,
            allow_anonymous_predictions,
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: ServeConfig = toml::from_str(&text).unwrap();

        prop_assert_eq!(parsed.api_port, api_port);
        prop_assert_eq!(parsed.max_resident_models, max_resident_models);
        prop_assert_eq!(parsed.max_upload_bytes, max_upload_bytes);
        prop_assert_eq!(parsed.predict_timeout_secs, predict_timeout_secs);
        prop_assert_eq!(parsed.allow_anonymous_predictions, allow_anonymous_predictions);
        prop_assert_eq!(parsed.data_dir, config.data_dir);
    }
}
