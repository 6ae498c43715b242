//! Seismic hazard disaggregation core.
//!
//! Hazard curves are computed per rupture group, seeded IMLs are interpolated
//! at the requested probabilities, and every contributing rupture is binned by
//! tectonic region, magnitude, distance, location and epsilon. The work is
//! split by group and magnitude bin, run on the rayon pool and reduced into one
//! matrix per `(site, realization)`. See [`scheduler::run`].

pub mod assemble;
pub mod binning;
pub mod config;
pub mod disagg;
pub mod error;
pub mod inputs;
pub mod pmap;
pub mod realizations;
pub mod rupture;
pub mod runtime;
pub mod scheduler;
pub mod site;
pub mod store;

pub use assemble::{DisaggOutput, Marginal, PoeCheck, RlzKey, SiteResult};
pub use binning::{BinEdges, build_bin_edges};
pub use config::{AccumulationMode, BinWidths, DisaggConfig, ImtLevels, IntegrationDistance};
pub use disagg::{DisaggMatrix, Disaggregator};
pub use error::{DisaggError, ErrorCategory, Result};
pub use inputs::{GroundMotionModel, HazardInputs, InMemoryInputs};
pub use pmap::{ProbabilityMap, RateMap};
pub use realizations::RealizationWeights;
pub use rupture::{RuptureContext, RuptureGroup, RuptureOccurrence};
pub use scheduler::run;
pub use site::{Site, SiteCollection};
pub use store::{ArrayStore, NpzStore, StoreMode, StoredArray, persist};
