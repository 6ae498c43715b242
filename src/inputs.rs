//! Interfaces consumed from collaborators outside this crate.

use anyhow::{Context, Result, bail};
use ndarray::Array2;

use crate::rupture::{RuptureContext, RuptureGroup};
use crate::site::{Site, SiteCollection};

/// Source of sites and rupture contexts.
pub trait HazardInputs: Sync {
    fn get_site_collection(&self) -> Result<SiteCollection>;

    fn group_ids(&self) -> Vec<u16>;

    fn get_rupture_contexts(&self, grp_id: u16) -> Result<RuptureGroup>;
}

/// Ground-motion evaluation, treated as a black box.
///
/// `rlz` selects the ground-motion branch of the realization being computed.
pub trait GroundMotionModel: Sync {
    /// Conditional probabilities of exceeding each of `imls`, shaped
    /// `(ctxs.len(), imls.len())`.
    fn hazard_poes(
        &self,
        ctxs: &[&RuptureContext],
        site: &Site,
        imt: &str,
        imls: &[f64],
        truncation_level: f64,
        rlz: usize,
    ) -> Result<Array2<f64>>;

    /// Conditional probability of exceeding `iml` with the residual falling in
    /// each epsilon bin, shaped `(ctxs.len(), n_epsilons)`.
    #[allow(clippy::too_many_arguments)]
    fn evaluate_exceedance(
        &self,
        ctxs: &[&RuptureContext],
        site: &Site,
        imt: &str,
        iml: f64,
        truncation_level: f64,
        n_epsilons: usize,
        rlz: usize,
    ) -> Result<Array2<f64>>;
}

/// Checks a collaborator-produced array before it reaches the kernels.
pub(crate) fn check_poes(arr: &Array2<f64>, rows: usize, cols: usize, what: &str) -> Result<()> {
    if arr.dim() != (rows, cols) {
        bail!(
            "{what} returned shape {:?}, expected ({rows}, {cols})",
            arr.dim()
        );
    }
    if let Some(bad) = arr.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        bail!("{what} returned probability {bad} outside [0, 1]");
    }
    Ok(())
}

/// Inputs held in memory, for embedding the engine in a larger service.
#[derive(Debug, Clone)]
pub struct InMemoryInputs {
    pub sites: Vec<Site>,
    pub groups: Vec<RuptureGroup>,
}

impl HazardInputs for InMemoryInputs {
    fn get_site_collection(&self) -> Result<SiteCollection> {
        SiteCollection::new(self.sites.clone()).context("building site collection")
    }

    fn group_ids(&self) -> Vec<u16> {
        self.groups.iter().map(|g| g.grp_id).collect()
    }

    fn get_rupture_contexts(&self, grp_id: u16) -> Result<RuptureGroup> {
        self.groups
            .iter()
            .find(|g| g.grp_id == grp_id)
            .cloned()
            .with_context(|| format!("unknown group #{grp_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_and_range_are_checked() {
        let ok = Array2::from_elem((2, 3), 0.5);
        assert!(check_poes(&ok, 2, 3, "model").is_ok());
        assert!(check_poes(&ok, 3, 2, "model").is_err());
        let bad = Array2::from_elem((1, 1), 1.5);
        assert!(check_poes(&bad, 1, 1, "model").is_err());
    }
}
