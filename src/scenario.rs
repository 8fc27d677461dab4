//! Scenario matrix and runners
//!
//! A scenario is data: a name, a [`TransformerConfig`] and an optional seed.
//! [`run_scenario`] expands one record into a differential run of the
//! reference simulator against a [`FusedTransformerKernel`] and classifies
//! the result as passed, failed or skipped.
//!
//! ```no_run
//! use comprobar::fused::CpuFusedInt8;
//! use comprobar::scenario::{run_scenario, ScenarioConfig};
//! use comprobar::target::ExecutionTarget;
//!
//! let target = ExecutionTarget::detect().unwrap();
//! for scenario in ScenarioConfig::builtin() {
//!     let outcome = run_scenario(&scenario, &CpuFusedInt8::new(), &target, 0).unwrap();
//!     println!("{}: {outcome}", scenario.name);
//! }
//! ```
//!
//! Gradient cases run the same way through [`run_gradient_case`].

use std::cell::OnceCell;
use std::fmt;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compare::{DifferentialCheck, MismatchReport, Outputs, Tolerance};
use crate::dtype::Precision;
use crate::error::{ComprobarError, Result};
use crate::fused::{FusedPlan, FusedTransformerKernel};
use crate::grad::{add_with_grads, GradPath};
use crate::inference::CacheMode;
use crate::reference::ReferenceTransformer;
use crate::target::ExecutionTarget;
use crate::tensor::Tensor;
use crate::transformer::{LayerScales, TransformerConfig, TransformerInputs};

/// Default seed when neither the scenario nor the caller picks one
pub const DEFAULT_SEED: u64 = 0;

/// One fused-transformer scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Unique name
    pub name: String,
    /// Stack configuration; missing fields take their defaults
    #[serde(default)]
    pub transformer: TransformerConfig,
    /// Overrides the run seed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl ScenarioConfig {
    /// Create a scenario
    #[must_use]
    pub fn new(name: impl Into<String>, transformer: TransformerConfig) -> Self {
        Self {
            name: name.into(),
            transformer,
            seed: None,
        }
    }

    /// The eleven built-in variants
    ///
    /// All use one query token, 16 heads of width 64 and 3 layers. Decode
    /// variants attend over one cached position; generation variants record
    /// one position.
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        use CacheMode::{Decode, Generate, None as NoCache};
        use Precision::{Fp16, Fp32};

        let base = TransformerConfig::default();
        let variant = |name: &str, precision, cache_mode, pre_layer_norm| {
            Self::new(
                name,
                TransformerConfig {
                    precision,
                    cache_mode,
                    pre_layer_norm,
                    ..base.clone()
                },
            )
        };
        vec![
            variant("base", Fp32, NoCache, true),
            variant("fp16", Fp16, NoCache, true),
            variant("cache_kv", Fp32, Decode, true),
            variant("cache_kv_fp16", Fp16, Decode, true),
            variant("gen_cache_kv", Fp32, Generate, true),
            variant("gen_cache_kv_fp16", Fp16, Generate, true),
            variant("post_layer_norm_fp16", Fp16, NoCache, false),
            variant("cache_kv_post_layer_norm", Fp32, Decode, false),
            variant("cache_kv_post_layer_norm_fp16", Fp16, Decode, false),
            variant("gen_cache_kv_post_layer_norm", Fp32, Generate, false),
            variant("gen_cache_kv_post_layer_norm_fp16", Fp16, Generate, false),
        ]
    }

    /// Seed for this scenario
    #[must_use]
    pub fn seed_or(&self, default: u64) -> u64 {
        self.seed.unwrap_or(default)
    }
}

/// Load a JSON array of scenarios
///
/// # Errors
///
/// Returns [`ComprobarError::Io`] or [`ComprobarError::Json`] if the file
/// cannot be read or parsed, and [`ComprobarError::InvalidConfig`] if two
/// scenarios share a name or a config is inconsistent.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<ScenarioConfig>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let scenarios: Vec<ScenarioConfig> = serde_json::from_str(&text)?;
    for (i, s) in scenarios.iter().enumerate() {
        if scenarios[..i].iter().any(|o| o.name == s.name) {
            return Err(ComprobarError::invalid_config(format!(
                "duplicate scenario name '{}'",
                s.name
            )));
        }
        s.transformer.validate()?;
    }
    debug!(path = %path.as_ref().display(), count = scenarios.len(), "loaded scenarios");
    Ok(scenarios)
}

/// How a scenario ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScenarioOutcome {
    /// Every output agreed
    Passed {
        /// Number of compared tensors
        compared: usize,
    },
    /// An output was out of tolerance
    Failed {
        /// First failed comparison
        report: Box<MismatchReport>,
    },
    /// The target cannot run the kernel
    Skipped {
        /// Why
        reason: String,
    },
}

impl ScenarioOutcome {
    /// Whether the outcome counts as a failure
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn from_check(result: Result<usize>) -> Result<Self> {
        match result {
            Ok(compared) => Ok(Self::Passed { compared }),
            Err(ComprobarError::Mismatch(report)) => Ok(Self::Failed { report }),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed { compared } => write!(f, "passed ({compared} outputs)"),
            Self::Failed { report } => write!(f, "FAILED\n{report}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// Named outcome, as printed by the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    /// Scenario or case name
    pub name: String,
    /// Outcome
    #[serde(flatten)]
    pub outcome: ScenarioOutcome,
}

/// Run one scenario against `kernel`
///
/// The reference runs first and calibrates the scales; the fused kernel is
/// fed the same inputs and the frozen scales. The final activations are
/// compared, and in the generation stage so is the layer-0 cache.
///
/// # Errors
///
/// Returns configuration and shape errors; numerical disagreement is a
/// [`ScenarioOutcome::Failed`], not an error.
pub fn run_scenario(
    scenario: &ScenarioConfig,
    kernel: &dyn FusedTransformerKernel,
    target: &ExecutionTarget,
    default_seed: u64,
) -> Result<ScenarioOutcome> {
    if let Some(reason) = kernel.requirements().skip_reason(target) {
        warn!(scenario = %scenario.name, %reason, "skipped");
        return Ok(ScenarioOutcome::Skipped { reason });
    }

    let config = &scenario.transformer;
    let seed = scenario.seed_or(default_seed);
    let inputs = TransformerInputs::generate(config, seed)?;
    let reference = ReferenceTransformer::new(config)?;
    let tolerance = target.fused_tolerance(config.precision);
    let check = DifferentialCheck::new(&scenario.name, tolerance);
    let scales: OnceCell<Vec<LayerScales>> = OnceCell::new();

    debug!(
        scenario = %scenario.name,
        kernel = kernel.name(),
        seed,
        %tolerance,
        "running"
    );

    let result = check.run(
        || {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = reference.forward(&inputs, &mut rng)?;
            let mut outputs: Outputs = vec![("out".to_string(), out.output)];
            if config.cache_mode == CacheMode::Generate {
                if let Some(cache) = out.cache_kvs.into_iter().next() {
                    outputs.push(("cache_kv".to_string(), cache));
                }
            }
            let _ = scales.set(out.scales);
            Ok(outputs)
        },
        || {
            let scales = scales
                .get()
                .ok_or_else(|| ComprobarError::invalid_config("reference produced no scales"))?;
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = FusedPlan::build(config, &inputs, scales)?;
            let fused = plan.run(kernel, &inputs.query, &mut rng)?;
            let mut outputs: Outputs = vec![("out".to_string(), fused.output)];
            if config.cache_mode == CacheMode::Generate {
                if let Some(cache) = fused.caches.first() {
                    outputs.push(("cache_kv".to_string(), cache.to_dense(config.cache_length)?));
                }
            }
            Ok(outputs)
        },
    );

    let outcome = ScenarioOutcome::from_check(result)?;
    match &outcome {
        ScenarioOutcome::Failed { report } => {
            warn!(scenario = %scenario.name, mismatched = report.mismatched, "failed");
        },
        _ => info!(scenario = %scenario.name, %outcome, "done"),
    }
    Ok(outcome)
}

/// Run every scenario whose name contains `filter`
///
/// # Errors
///
/// Stops at the first scenario that errors (as opposed to failing).
pub fn run_matrix(
    scenarios: &[ScenarioConfig],
    filter: Option<&str>,
    kernel: &dyn FusedTransformerKernel,
    target: &ExecutionTarget,
    default_seed: u64,
) -> Result<Vec<ScenarioResult>> {
    scenarios
        .iter()
        .filter(|s| filter.map_or(true, |f| s.name.contains(f)))
        .map(|s| {
            Ok(ScenarioResult {
                name: s.name.clone(),
                outcome: run_scenario(s, kernel, target, default_seed)?,
            })
        })
        .collect()
}

/// One composite-vs-direct gradient case for `x + y`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradientCase {
    /// Case name
    pub name: String,
    /// Shape of the first operand
    pub x_shape: Vec<usize>,
    /// Shape of the second operand
    pub y_shape: Vec<usize>,
}

impl GradientCase {
    /// Create a case
    #[must_use]
    pub fn new(name: impl Into<String>, x_shape: &[usize], y_shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            x_shape: x_shape.to_vec(),
            y_shape: y_shape.to_vec(),
        }
    }

    /// The five built-in operand pairs
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        vec![
            Self::new("add_same_shape", &[2, 3, 4], &[2, 3, 4]),
            Self::new("add_broadcast_lead", &[2, 3, 3, 4], &[3, 1, 4]),
            Self::new("add_broadcast_mid", &[2, 3, 3, 4], &[2, 3, 1, 4]),
            Self::new("add_broadcast_mid_repeat", &[2, 3, 3, 4], &[2, 3, 1, 4]),
            Self::new("add_broadcast_tail", &[2, 3, 3, 4], &[2, 3, 1, 1]),
        ]
    }
}

fn uniform(rng: &mut StdRng, shape: &[usize]) -> Result<Tensor<f32>> {
    let n = shape.iter().product();
    Tensor::from_vec(shape.to_vec(), (0..n).map(|_| rng.gen::<f32>()).collect())
}

/// Compare composite and direct gradients of `x + y`
///
/// Operands are drawn uniformly from `[0, 1)`; the composite path is the
/// candidate and the direct kernel the reference, at `rtol = 1e-6, atol = 0`.
///
/// # Errors
///
/// Returns a shape error if the operand shapes do not broadcast.
pub fn run_gradient_case(case: &GradientCase, seed: u64) -> Result<ScenarioOutcome> {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = uniform(&mut rng, &case.x_shape)?;
    let y = uniform(&mut rng, &case.y_shape)?;

    let grads = |path: GradPath| -> Result<Outputs> {
        let (_, g) = add_with_grads(&x, &y, path)?;
        Ok(vec![("dx".to_string(), g.dx), ("dy".to_string(), g.dy)])
    };
    let check = DifferentialCheck::new(&case.name, Tolerance::GRADIENT);
    let outcome = ScenarioOutcome::from_check(check.run(
        || grads(GradPath::Direct),
        || grads(GradPath::Composite),
    ))?;
    info!(case = %case.name, %outcome, "gradient case");
    Ok(outcome)
}
