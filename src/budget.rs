//! VRAM budget parsing and resolution

use crate::error::{ProbeError, Result};
use crate::gpu::GpuInfo;
use crate::units::{format_size, parse_size};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Budget as requested by the operator
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum VramBudget {
    /// All VRAM currently free on the first available device
    #[default]
    AllFree,
    /// Fixed ceiling in bytes
    Bytes(u64),
    /// Fraction in (0, 1] of the first device's free VRAM
    Ratio(f64),
}

impl FromStr for VramBudget {
    type Err = ProbeError;

    /// `auto`, a byte size (`8GiB`, `8589934592`), a ratio (`0.9`) or a percentage (`90%`)
    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let lowered = raw.to_ascii_lowercase();
        if lowered.is_empty() || lowered == "auto" || lowered == "all" {
            return Ok(Self::AllFree);
        }

        if let Some(pct) = lowered.strip_suffix('%') {
            let pct: f64 = pct
                .trim()
                .parse()
                .map_err(|_| ProbeError::Config(format!("invalid VRAM percentage '{}'", raw)))?;
            return Self::ratio(pct / 100.0, raw);
        }

        let is_bare_number = lowered.chars().all(|c| c.is_ascii_digit() || c == '.');
        if is_bare_number && lowered.contains('.') {
            let ratio: f64 = lowered
                .parse()
                .map_err(|_| ProbeError::Config(format!("invalid VRAM ratio '{}'", raw)))?;
            return Self::ratio(ratio, raw);
        }

        match parse_size(&lowered) {
            Some(0) => Err(ProbeError::Config("VRAM budget cannot be zero".into())),
            Some(bytes) => Ok(Self::Bytes(bytes)),
            None => Err(ProbeError::Config(format!(
                "invalid VRAM budget '{}': expected bytes, a size like 8GiB, a ratio or 'auto'",
                raw
            ))),
        }
    }
}

impl VramBudget {
    fn ratio(value: f64, raw: &str) -> Result<Self> {
        if value > 0.0 && value <= 1.0 {
            Ok(Self::Ratio(value))
        } else {
            Err(ProbeError::Config(format!(
                "VRAM ratio '{}' must be in (0, 1]",
                raw
            )))
        }
    }

    /// Turn the request into a concrete ceiling for this run
    ///
    /// `AllFree` without a detectable GPU resolves to no ceiling: only the
    /// fully-resident check applies then. A ratio needs a device to be a ratio of.
    pub fn resolve(&self, gpus: &GpuInfo) -> Result<ResolvedBudget> {
        match *self {
            VramBudget::Bytes(bytes) => Ok(ResolvedBudget::bytes(bytes)),
            VramBudget::AllFree => match gpus.first() {
                Some(device) => Ok(ResolvedBudget {
                    limit: Some(device.free_bytes),
                    source: BudgetSource::FreeOnDevice(device.index),
                }),
                None => {
                    tracing::warn!(
                        "No GPU detected; probing without a VRAM ceiling (residency check only)"
                    );
                    Ok(ResolvedBudget::unbounded())
                }
            },
            VramBudget::Ratio(ratio) => {
                let device = gpus.first().ok_or_else(|| {
                    ProbeError::Config(
                        "a ratio budget needs a detectable GPU; pass an absolute size instead"
                            .into(),
                    )
                })?;
                Ok(ResolvedBudget {
                    limit: Some((device.free_bytes as f64 * ratio).floor() as u64),
                    source: BudgetSource::RatioOfDevice(device.index),
                })
            }
        }
    }
}

/// Where a resolved ceiling came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetSource {
    Explicit,
    FreeOnDevice(u32),
    RatioOfDevice(u32),
    Unbounded,
}

/// Ceiling in force for a run, passed explicitly into the engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedBudget {
    pub limit: Option<u64>,
    pub source: BudgetSource,
}

impl ResolvedBudget {
    pub fn bytes(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            source: BudgetSource::Explicit,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            limit: None,
            source: BudgetSource::Unbounded,
        }
    }

    /// A reading exactly at the ceiling is admitted
    pub fn admits(&self, vram_bytes: u64) -> bool {
        self.limit.is_none_or(|limit| vram_bytes <= limit)
    }
}

impl fmt::Display for ResolvedBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.limit, self.source) {
            (None, _) => write!(f, "unbounded"),
            (Some(limit), BudgetSource::FreeOnDevice(idx)) => {
                write!(f, "{} (free on GPU {})", format_size(limit), idx)
            }
            (Some(limit), BudgetSource::RatioOfDevice(idx)) => {
                write!(f, "{} (share of GPU {})", format_size(limit), idx)
            }
            (Some(limit), _) => write!(f, "{}", format_size(limit)),
        }
    }
}
