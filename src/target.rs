//! Execution target detection and capability gating
//!
//! The fused INT8 kernel needs tensor-core class hardware when it runs on an
//! accelerator: compute capability 8.0 or newer and a runtime of at least
//! 11.2 (`11020`). The in-tree CPU backend declares
//! [`KernelRequirements::NONE`] and runs on every target.
//!
//! ## Detection
//!
//! | Variable | Meaning | Example |
//! |----------|---------|---------|
//! | `COMPROBAR_DEVICE` | `cpu` or a GPU name | `NVIDIA A100-SXM4-40GB` |
//! | `COMPROBAR_COMPUTE_CAPABILITY` | `major.minor` | `8.0` |
//! | `COMPROBAR_RUNTIME_VERSION` | integer runtime version | `11080` |
//!
//! ## Usage
//!
//! ```
//! use comprobar::target::{ExecutionTarget, KernelRequirements};
//!
//! let target = ExecutionTarget::cpu();
//! assert!(KernelRequirements::INT8_TENSOR_CORE.skip_reason(&target).is_none());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compare::Tolerance;
use crate::dtype::Precision;
use crate::error::{ComprobarError, Result};

/// Environment variable naming the device
pub const ENV_DEVICE: &str = "COMPROBAR_DEVICE";
/// Environment variable holding `major.minor` compute capability
pub const ENV_COMPUTE_CAPABILITY: &str = "COMPROBAR_COMPUTE_CAPABILITY";
/// Environment variable holding the integer runtime version
pub const ENV_RUNTIME_VERSION: &str = "COMPROBAR_RUNTIME_VERSION";

/// Accelerator compute capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputeCapability {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl ComputeCapability {
    /// Create a capability
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `major.minor` (or a bare `major`)
    ///
    /// # Errors
    ///
    /// Returns [`ComprobarError::InvalidConfig`] for malformed input.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || ComprobarError::invalid_config(format!("invalid compute capability '{s}'"));
        let mut parts = s.trim().splitn(2, '.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(bad)?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Where scenarios execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutionTarget {
    /// Host CPU
    Cpu,
    /// Accelerator
    Gpu {
        /// Device name as reported by the driver
        name: String,
        /// Compute capability
        compute_capability: ComputeCapability,
        /// Runtime version, e.g. `11080`
        runtime_version: u32,
    },
}

impl Default for ExecutionTarget {
    fn default() -> Self {
        Self::Cpu
    }
}

impl ExecutionTarget {
    /// Host CPU target
    #[must_use]
    pub const fn cpu() -> Self {
        Self::Cpu
    }

    /// Detect the target from the environment
    ///
    /// Detection heuristics:
    /// - `COMPROBAR_DEVICE` unset, empty or `cpu`: CPU
    /// - otherwise a GPU with capability and runtime version read from
    ///   `COMPROBAR_COMPUTE_CAPABILITY` / `COMPROBAR_RUNTIME_VERSION`
    ///   (missing values read as `0`)
    ///
    /// # Errors
    ///
    /// Returns [`ComprobarError::InvalidConfig`] if a variable is malformed.
    pub fn detect() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Detect from an arbitrary key/value source
    ///
    /// # Errors
    ///
    /// Returns [`ComprobarError::InvalidConfig`] if a value is malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device = lookup(ENV_DEVICE).unwrap_or_default();
        let device = device.trim();
        if device.is_empty() || device.eq_ignore_ascii_case("cpu") {
            debug!("execution target: cpu");
            return Ok(Self::Cpu);
        }

        let compute_capability = match lookup(ENV_COMPUTE_CAPABILITY) {
            Some(v) => ComputeCapability::parse(&v)?,
            None => ComputeCapability::new(0, 0),
        };
        let runtime_version = match lookup(ENV_RUNTIME_VERSION) {
            Some(v) => v.trim().parse().map_err(|_| {
                ComprobarError::invalid_config(format!("invalid runtime version '{v}'"))
            })?,
            None => 0,
        };
        debug!(device, %compute_capability, runtime_version, "execution target: gpu");
        Ok(Self::Gpu {
            name: device.to_string(),
            compute_capability,
            runtime_version,
        })
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu { name, .. } => name,
        }
    }

    /// Whether the device is a V100-class accelerator
    #[must_use]
    pub fn is_v100(&self) -> bool {
        matches!(self, Self::Gpu { name, .. } if name.contains("V100"))
    }

    /// Comparison tolerance for fused-kernel outputs
    ///
    /// fp16 always uses `atol = 1e-1`; fp32 uses `1e-4` on V100-class devices
    /// and `1e-2` elsewhere.
    #[must_use]
    pub fn fused_tolerance(&self, precision: Precision) -> Tolerance {
        match precision {
            Precision::Fp16 => Tolerance::FUSED_FP16,
            Precision::Fp32 if self.is_v100() => Tolerance::FUSED_V100,
            Precision::Fp32 => Tolerance::FUSED_FP32,
        }
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu {
                name,
                compute_capability,
                runtime_version,
            } => write!(f, "{name} (sm {compute_capability}, runtime {runtime_version})"),
        }
    }
}

/// What a kernel needs from an accelerator target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRequirements {
    /// Minimum compute capability
    pub min_compute_capability: ComputeCapability,
    /// Minimum runtime version
    pub min_runtime_version: u32,
}

impl KernelRequirements {
    /// Host kernels: accepted on every target
    pub const NONE: Self = Self {
        min_compute_capability: ComputeCapability::new(0, 0),
        min_runtime_version: 0,
    };

    /// INT8 tensor-core kernels: sm 8.0+, runtime 11.2+
    pub const INT8_TENSOR_CORE: Self = Self {
        min_compute_capability: ComputeCapability::new(8, 0),
        min_runtime_version: 11020,
    };

    /// Why `target` cannot run the kernel, if it cannot
    ///
    /// CPU targets are always accepted.
    #[must_use]
    pub fn skip_reason(&self, target: &ExecutionTarget) -> Option<String> {
        let ExecutionTarget::Gpu {
            name,
            compute_capability,
            runtime_version,
        } = target
        else {
            return None;
        };
        if *runtime_version < self.min_runtime_version {
            return Some(format!(
                "{name}: runtime version {runtime_version} < {}",
                self.min_runtime_version
            ));
        }
        if *compute_capability < self.min_compute_capability {
            return Some(format!(
                "{name}: compute capability {compute_capability} < {}",
                self.min_compute_capability
            ));
        }
        None
    }
}
