//! # Comprobar
//!
//! Reference oracle and differential test harness for INT8 fused transformer
//! kernels.
//!
//! Comprobar (Spanish: "to verify") recomputes a quantized multi-layer
//! transformer step by step, calibrates its quantization scales, and checks a
//! fused kernel against it element by element. It also checks composite
//! (primitive-op) gradient rules against dedicated gradient kernels.
//!
//! ## Example
//!
//! ```rust
//! use comprobar::fused::CpuFusedInt8;
//! use comprobar::scenario::{run_scenario, ScenarioConfig, ScenarioOutcome};
//! use comprobar::target::ExecutionTarget;
//! use comprobar::TransformerConfig;
//!
//! let scenario = ScenarioConfig::new(
//!     "small",
//!     TransformerConfig { num_heads: 2, head_dim: 8, ..TransformerConfig::default() },
//! );
//! let outcome = run_scenario(&scenario, &CpuFusedInt8::new(), &ExecutionTarget::cpu(), 7).unwrap();
//! assert!(matches!(outcome, ScenarioOutcome::Passed { .. }));
//! ```
//!
//! ## Architecture
//!
//! - [`tensor`], [`dtype`]: owned row-major arrays and storage precisions
//! - [`quantize`], [`layers`], [`inference`]: primitive kernels
//! - [`reference`]: the unfused simulator
//! - [`fused`]: the fused kernel seam and its CPU backend
//! - [`grad`]: composite and direct gradient rules
//! - [`compare`], [`scenario`], [`target`]: the differential driver

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for shape arithmetic
#![allow(clippy::cast_possible_truncation)] // accumulators are range checked
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // exact parity is asserted in tests
#![allow(clippy::many_single_char_names)]

pub mod cli;
pub mod compare;
pub mod dtype;
pub mod error;
pub mod fused;
pub mod grad;
pub mod inference;
pub mod layers;
pub mod mask;
pub mod quantize;
pub mod reference;
pub mod scenario;
pub mod target;
pub mod tensor;
pub mod transformer;

pub use error::{ComprobarError, Result};
pub use tensor::Tensor;
pub use transformer::TransformerConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
