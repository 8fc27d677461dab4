//! Command-line interface
//!
//! Argument parsing and command bodies live here so they can be tested; the
//! `comprobar` binary only parses, dispatches and prints.

use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::Result;
use crate::fused::CpuFusedInt8;
use crate::scenario::{
    load_scenarios, run_gradient_case, run_matrix, GradientCase, ScenarioConfig, ScenarioResult,
    DEFAULT_SEED,
};
use crate::target::ExecutionTarget;

/// comprobar: differential checks for INT8 fused transformer kernels
#[derive(Parser, Debug, Clone)]
#[command(name = "comprobar")]
#[command(version)]
#[command(about = "Differential checks for INT8 fused transformer kernels", long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Output as JSON (machine-readable)
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List scenarios
    List(MatrixArgs),
    /// Run the fused transformer scenario matrix
    Run(RunArgs),
    /// Run the composite-vs-direct gradient cases
    Grad(GradArgs),
}

/// Where scenarios come from
#[derive(Parser, Debug, Clone, Default)]
pub struct MatrixArgs {
    /// JSON file with a scenario array (default: built-in matrix)
    #[arg(long)]
    pub scenarios: Option<PathBuf>,
}

impl MatrixArgs {
    fn load(&self) -> Result<Vec<ScenarioConfig>> {
        match &self.scenarios {
            Some(path) => load_scenarios(path),
            None => Ok(ScenarioConfig::builtin()),
        }
    }
}

/// Arguments for `run`
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Scenario source
    #[command(flatten)]
    pub matrix: MatrixArgs,

    /// Only run scenarios whose name contains this string
    #[arg(long)]
    pub filter: Option<String>,

    /// Seed for scenarios that do not set one
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

/// Arguments for `grad`
#[derive(Parser, Debug, Clone)]
pub struct GradArgs {
    /// Seed for the random operands
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

/// Result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Whether every check passed (skips count as passing)
    pub success: bool,
    /// Text to print
    pub message: String,
}

/// Run a parsed command
///
/// # Errors
///
/// Returns an error if scenarios cannot be loaded or a run errors (as
/// opposed to failing a comparison).
pub fn run(args: &Args) -> Result<CommandResult> {
    match &args.command {
        Command::List(m) => run_list(m, args.json),
        Command::Run(r) => run_scenarios(r, args.json),
        Command::Grad(g) => run_grad(g, args.json),
    }
}

fn run_list(args: &MatrixArgs, json: bool) -> Result<CommandResult> {
    let scenarios = args.load()?;
    let message = if json {
        serde_json::to_string_pretty(&scenarios)?
    } else {
        let mut out = String::new();
        for s in &scenarios {
            let t = &s.transformer;
            let _ = writeln!(
                out,
                "{:<36} {} {:?} layers={} heads={}x{} pre_ln={}",
                s.name,
                t.precision,
                t.cache_mode,
                t.layers,
                t.num_heads,
                t.head_dim,
                t.pre_layer_norm
            );
        }
        out
    };
    Ok(CommandResult {
        success: true,
        message,
    })
}

fn summarize(results: &[ScenarioResult], json: bool) -> Result<CommandResult> {
    let success = results.iter().all(|r| !r.outcome.is_failure());
    let message = if json {
        serde_json::to_string_pretty(results)?
    } else {
        let mut out = String::new();
        for r in results {
            let _ = writeln!(out, "{:<36} {}", r.name, r.outcome);
        }
        let failed = results.iter().filter(|r| r.outcome.is_failure()).count();
        let _ = write!(out, "{} run, {failed} failed", results.len());
        out
    };
    Ok(CommandResult { success, message })
}

fn run_scenarios(args: &RunArgs, json: bool) -> Result<CommandResult> {
    let scenarios = args.matrix.load()?;
    let target = ExecutionTarget::detect()?;
    let results = run_matrix(
        &scenarios,
        args.filter.as_deref(),
        &CpuFusedInt8::new(),
        &target,
        args.seed,
    )?;
    summarize(&results, json)
}

fn run_grad(args: &GradArgs, json: bool) -> Result<CommandResult> {
    let results = GradientCase::builtin()
        .iter()
        .map(|case| {
            Ok(ScenarioResult {
                name: case.name.clone(),
                outcome: run_gradient_case(case, args.seed)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    summarize(&results, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_args() {
        let args = Args::try_parse_from([
            "comprobar", "run", "--filter", "fp16", "--seed", "9", "--json",
        ])
        .unwrap();
        assert!(args.json);
        let Command::Run(run) = args.command else {
            panic!("expected run")
        };
        assert_eq!(run.filter.as_deref(), Some("fp16"));
        assert_eq!(run.seed, 9);
        assert!(run.matrix.scenarios.is_none());
    }

    #[test]
    fn test_list_builtin() {
        let args = Args::try_parse_from(["comprobar", "list"]).unwrap();
        let result = run(&args).unwrap();
        assert!(result.success);
        assert_eq!(result.message.lines().count(), 11);
        assert!(result.message.contains("gen_cache_kv_post_layer_norm_fp16"));
    }

    #[test]
    fn test_grad_command() {
        let args = Args::try_parse_from(["comprobar", "grad", "--json"]).unwrap();
        let result = run(&args).unwrap();
        assert!(result.success);
        let parsed: serde_json::Value = serde_json::from_str(&result.message).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 5);
        assert_eq!(parsed[0]["status"], "passed");
    }

    #[test]
    fn test_rejects_unknown_command() {
        assert!(Args::try_parse_from(["comprobar", "serve"]).is_err());
    }
}
