//! Calculation parameters.
//!
//! Job-file parsing lives outside this crate; callers build a [`DisaggConfig`]
//! directly and may let operators tune the resource knobs through environment
//! variables (see [`DisaggConfig::with_env_overrides`]).

use std::ops::Range;

use crate::assemble::Marginal;
use crate::error::{DisaggError, Result};
use crate::runtime::memory_override_bytes;

/// How contributions are accumulated, both in the hazard curves and in the
/// disaggregation matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulationMode {
    /// Cells hold `-ln P(no exceedance)` (rate x poe x time for Poissonian
    /// ruptures); normalized with `1 - exp(-c)` before renormalizing.
    #[default]
    Rates,
    /// Cells hold raw joint probabilities `1 - P(no exceedance)`;
    /// normalized by direct renormalization.
    Probabilities,
}

/// Intensity measure types and their levels, concatenated on one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ImtLevels {
    names: Vec<String>,
    levels: Vec<f64>,
    offsets: Vec<usize>,
}

impl ImtLevels {
    pub fn new(pairs: Vec<(String, Vec<f64>)>) -> Result<Self> {
        if pairs.is_empty() {
            return Err(DisaggError::config("at least one IMT is required"));
        }
        let mut names = Vec::with_capacity(pairs.len());
        let mut levels = Vec::new();
        let mut offsets = Vec::with_capacity(pairs.len() + 1);
        offsets.push(0);
        for (name, imls) in pairs {
            if names.contains(&name) {
                return Err(DisaggError::config(format!("IMT {name} given twice")));
            }
            if imls.is_empty() {
                return Err(DisaggError::config(format!("IMT {name} has no levels")));
            }
            if imls.iter().any(|&l| !(l > 0.0) || !l.is_finite()) {
                return Err(DisaggError::config(format!(
                    "IMT {name} has non-positive levels"
                )));
            }
            if imls.windows(2).any(|w| w[1] <= w[0]) {
                return Err(DisaggError::config(format!(
                    "levels of IMT {name} are not strictly increasing"
                )));
            }
            levels.extend_from_slice(&imls);
            offsets.push(levels.len());
            names.push(name);
        }
        Ok(Self {
            names,
            levels,
            offsets,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Length of the concatenated level axis.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, m: usize) -> &str {
        &self.names[m]
    }

    #[inline]
    pub fn range(&self, m: usize) -> Range<usize> {
        self.offsets[m]..self.offsets[m + 1]
    }

    pub fn levels(&self, m: usize) -> &[f64] {
        &self.levels[self.range(m)]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinWidths {
    pub mag: f64,
    pub dist: f64,
    /// Longitude and latitude width, in decimal degrees.
    pub coord: f64,
    pub num_epsilon_bins: usize,
}

impl Default for BinWidths {
    fn default() -> Self {
        Self {
            mag: 0.5,
            dist: 10.0,
            coord: 0.5,
            num_epsilon_bins: 4,
        }
    }
}

/// Maximum source-to-site distance, optionally per tectonic region type.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationDistance {
    pub default: f64,
    pub by_trt: Vec<(String, f64)>,
}

impl IntegrationDistance {
    pub fn uniform(default: f64) -> Self {
        Self {
            default,
            by_trt: Vec::new(),
        }
    }

    pub fn get(&self, trt: &str) -> f64 {
        self.by_trt
            .iter()
            .find(|(t, _)| t == trt)
            .map(|&(_, d)| d)
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone)]
pub struct DisaggConfig {
    pub imtls: ImtLevels,
    pub poes_disagg: Vec<f64>,
    pub investigation_time: f64,
    pub truncation_level: f64,
    pub widths: BinWidths,
    pub maximum_distance: IntegrationDistance,
    pub accumulation: AccumulationMode,
    pub max_sites_disagg: usize,
    /// Ceiling on the number of 6-D cells of any single site's matrix.
    pub max_disagg_bins: u64,
    /// Per-task budget, in weighted rupture count (ruptures x affected sites).
    pub max_task_weight: f64,
    /// Multiplier applied to the estimated footprint before comparing it with
    /// the available memory.
    pub memory_safety_margin: f64,
    /// Assume this much memory is available instead of asking the kernel.
    pub available_memory: Option<u64>,
    pub marginals: Vec<Marginal>,
    /// Relative tolerance between the seed poe and the poe recovered from the
    /// collapsed matrix before a warning is logged.
    pub poe_tolerance: f64,
    pub show_progress: bool,
}

impl DisaggConfig {
    pub fn new(imtls: ImtLevels, poes_disagg: Vec<f64>) -> Self {
        Self {
            imtls,
            poes_disagg,
            investigation_time: 50.0,
            truncation_level: 3.0,
            widths: BinWidths::default(),
            maximum_distance: IntegrationDistance::uniform(200.0),
            accumulation: AccumulationMode::default(),
            max_sites_disagg: 10,
            max_disagg_bins: 10_000_000,
            max_task_weight: 100_000.0,
            memory_safety_margin: 2.0,
            available_memory: None,
            marginals: Marginal::ALL.to_vec(),
            poe_tolerance: 0.1,
            show_progress: true,
        }
    }

    /// Apply `DISAGG_*` environment overrides for the operator-facing knobs.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply the `DISAGG_*` overrides found through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(w) = positive_f64(lookup("DISAGG_MAX_TASK_WEIGHT")) {
            self.max_task_weight = w;
        }
        if let Some(m) = positive_f64(lookup("DISAGG_MEMORY_MARGIN")) {
            self.memory_safety_margin = m;
        }
        if let Some(bytes) = memory_override_bytes(&lookup) {
            self.available_memory = Some(bytes);
        }
        if lookup("DISAGG_PROGRESS").as_deref() == Some("0") {
            self.show_progress = false;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poes_disagg.is_empty() {
            return Err(DisaggError::config("poes_disagg is empty"));
        }
        if let Some(poe) = self.poes_disagg.iter().find(|&&p| !(p > 0.0 && p < 1.0)) {
            return Err(DisaggError::config(format!(
                "poes_disagg must lie in (0, 1), got {poe}"
            )));
        }
        if !(self.investigation_time > 0.0) {
            return Err(DisaggError::config("investigation_time must be positive"));
        }
        if !(self.truncation_level > 0.0) {
            return Err(DisaggError::config(
                "disaggregation requires a positive truncation_level",
            ));
        }
        let w = &self.widths;
        if !(w.mag > 0.0 && w.dist > 0.0 && w.coord > 0.0) {
            return Err(DisaggError::config("bin widths must be positive"));
        }
        if w.num_epsilon_bins == 0 {
            return Err(DisaggError::config("num_epsilon_bins must be at least 1"));
        }
        if !(self.maximum_distance.default > 0.0)
            || self.maximum_distance.by_trt.iter().any(|(_, d)| !(*d > 0.0))
        {
            return Err(DisaggError::config("maximum_distance must be positive"));
        }
        if !(self.max_task_weight > 0.0) {
            return Err(DisaggError::config("max_task_weight must be positive"));
        }
        if !(self.memory_safety_margin >= 1.0) {
            return Err(DisaggError::config("memory_safety_margin must be >= 1"));
        }
        if self.max_sites_disagg == 0 || self.max_disagg_bins == 0 {
            return Err(DisaggError::config("site and bin ceilings must be positive"));
        }
        Ok(())
    }
}

fn positive_f64(raw: Option<String>) -> Option<f64> {
    raw?.trim().parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0)
}
