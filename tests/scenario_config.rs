//! Scenario files: loading, validation and running through the CLI layer

use std::io::Write;

use clap::Parser;
use comprobar::cli::{run, Args};
use comprobar::dtype::{DType, Precision};
use comprobar::fused::CpuFusedInt8;
use comprobar::inference::CacheMode;
use comprobar::scenario::{load_scenarios, run_matrix, run_scenario, ScenarioOutcome};
use comprobar::target::ExecutionTarget;
use comprobar::ComprobarError;
use tempfile::NamedTempFile;

const MATRIX: &str = r#"[
  {
    "name": "tiny_decode_fp16",
    "transformer": {
      "num_heads": 2,
      "head_dim": 8,
      "layers": 2,
      "query_length": 1,
      "cache_length": 4,
      "precision": "fp16",
      "cache_mode": "decode",
      "pre_layer_norm": false
    },
    "seed": 5
  },
  {
    "name": "tiny_generate_bool_mask",
    "transformer": {
      "num_heads": 2,
      "head_dim": 8,
      "query_length": 2,
      "cache_length": 2,
      "cache_mode": "generate",
      "attn_mask_type": "bool"
    }
  }
]"#;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_scenarios_fills_defaults() {
    let file = write_temp(MATRIX);
    let scenarios = load_scenarios(file.path()).unwrap();
    assert_eq!(scenarios.len(), 2);

    let decode = &scenarios[0];
    assert_eq!(decode.seed, Some(5));
    assert_eq!(decode.transformer.precision, Precision::Fp16);
    assert_eq!(decode.transformer.cache_mode, CacheMode::Decode);
    assert_eq!(decode.transformer.batch_size, 1);
    assert_eq!(decode.transformer.attn_mask_type, DType::F64);

    let generate = &scenarios[1];
    assert_eq!(generate.seed, None);
    assert_eq!(generate.transformer.layers, 3);
    assert_eq!(generate.transformer.attn_mask_type, DType::Bool);
}

#[test]
fn test_loaded_scenarios_pass() {
    let file = write_temp(MATRIX);
    let scenarios = load_scenarios(file.path()).unwrap();
    let results = run_matrix(
        &scenarios,
        None,
        &CpuFusedInt8::new(),
        &ExecutionTarget::cpu(),
        0,
    )
    .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].outcome, ScenarioOutcome::Passed { compared: 1 });
    assert_eq!(results[1].outcome, ScenarioOutcome::Passed { compared: 2 });
}

#[test]
fn test_rejects_duplicate_names() {
    let file = write_temp(r#"[{"name": "a"}, {"name": "a"}]"#);
    assert!(matches!(
        load_scenarios(file.path()).unwrap_err(),
        ComprobarError::InvalidConfig { .. }
    ));
}

#[test]
fn test_rejects_inconsistent_generation() {
    let file = write_temp(
        r#"[{"name": "g", "transformer": {"cache_mode": "generate", "query_length": 2}}]"#,
    );
    assert!(load_scenarios(file.path()).is_err());
}

#[test]
fn test_rejects_malformed_json() {
    let file = write_temp("[{\"name\": ");
    assert!(matches!(
        load_scenarios(file.path()).unwrap_err(),
        ComprobarError::Json(_)
    ));
    assert!(matches!(
        load_scenarios("/nonexistent/scenarios.json").unwrap_err(),
        ComprobarError::Io(_)
    ));
}

#[test]
fn test_unsupported_mask_dtype_errors_before_running() {
    let file = write_temp(
        r#"[{"name": "m", "transformer": {"num_heads": 2, "head_dim": 8, "attn_mask_type": "float32"}}]"#,
    );
    let scenarios = load_scenarios(file.path()).unwrap();
    let err = run_scenario(
        &scenarios[0],
        &CpuFusedInt8::new(),
        &ExecutionTarget::cpu(),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, ComprobarError::UnsupportedMaskDtype(DType::F32)));
}

#[test]
fn test_cli_runs_scenario_file() {
    let file = write_temp(MATRIX);
    let path = file.path().to_str().unwrap();
    let args = Args::try_parse_from([
        "comprobar",
        "run",
        "--scenarios",
        path,
        "--filter",
        "decode",
    ])
    .unwrap();
    let result = run(&args).unwrap();
    assert!(result.success);
    assert!(result.message.contains("tiny_decode_fp16"));
    assert!(!result.message.contains("tiny_generate_bool_mask"));
    assert!(result.message.ends_with("1 run, 0 failed"));
}
