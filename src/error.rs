//! Error taxonomy for the disaggregation core.
//!
//! Every variant is fatal: a computation either completes with normalized
//! matrices or returns one of these. Far-away ruptures and zero-hazard sites
//! are not errors and never surface here.

use thiserror::Error;

/// Coarse classification used by callers to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or inconsistent configuration; the operator must change the job.
    Configuration,
    /// The computation would not fit in memory.
    Resource,
    /// A combination of features the engine refuses to compute.
    Unsupported,
    /// Failure reported by a collaborator (inputs, ground-motion model, store).
    Collaborator,
}

#[derive(Error, Debug)]
pub enum DisaggError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("{num_sites} sites exceed max_sites_disagg={limit}")]
    TooManySites { num_sites: usize, limit: usize },

    #[error(
        "the disaggregation matrix for site #{sid} has {cells} cells (shape {shape:?}), \
         above the ceiling of {ceiling}; use coarser bin widths"
    )]
    TooManyBins {
        sid: u32,
        cells: u64,
        shape: [usize; 6],
        ceiling: u64,
    },

    #[error(
        "the disaggregation PoE {poe} is greater than the maximum PoE {max_poe} \
         for site #{sid}, realization #{rlz}, IMT={imt}"
    )]
    PoeTooLarge {
        sid: u32,
        poe: f64,
        max_poe: f64,
        rlz: usize,
        imt: String,
    },

    #[error(
        "estimated disaggregation footprint {estimated} bytes x margin {margin} \
         exceeds the {available} bytes of available memory; coarsen the bins"
    )]
    Memory {
        estimated: u64,
        available: u64,
        margin: f64,
    },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl DisaggError {
    pub fn config(message: impl Into<String>) -> Self {
        DisaggError::Config(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        DisaggError::Invalid(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DisaggError::Config(_)
            | DisaggError::Invalid(_)
            | DisaggError::TooManySites { .. }
            | DisaggError::TooManyBins { .. }
            | DisaggError::PoeTooLarge { .. } => ErrorCategory::Configuration,
            DisaggError::Memory { .. } => ErrorCategory::Resource,
            DisaggError::NotImplemented(_) => ErrorCategory::Unsupported,
            DisaggError::Collaborator(_) => ErrorCategory::Collaborator,
        }
    }
}

pub type Result<T, E = DisaggError> = std::result::Result<T, E>;
