//! Rupture records as handed over by the source-model collaborator.

use std::collections::BTreeMap;

use crate::error::{DisaggError, Result};

/// Temporal occurrence model of a single rupture.
#[derive(Debug, Clone, PartialEq)]
pub enum RuptureOccurrence {
    /// Annual occurrence rate of a Poissonian rupture.
    Poissonian { rate: f64 },
    /// `probs_occur[k]` is the probability of exactly `k` occurrences in the
    /// investigation time.
    NonParametric { probs_occur: Vec<f64> },
}

impl RuptureOccurrence {
    /// Probability that the rupture causes no exceedance in `time_span`,
    /// given the conditional probability `poe` of exceedance per occurrence.
    #[inline]
    pub fn probability_no_exceedance(&self, poe: f64, time_span: f64) -> f64 {
        match self {
            RuptureOccurrence::Poissonian { rate } => (-rate * time_span * poe).exp(),
            RuptureOccurrence::NonParametric { probs_occur } => {
                let survive = 1.0 - poe;
                let mut pow = 1.0;
                let mut acc = 0.0;
                for &p in probs_occur {
                    acc += p * pow;
                    pow *= survive;
                }
                acc
            }
        }
    }

    /// `-ln P(no exceedance)`; exact `rate * poe * time_span` for Poissonian.
    #[inline]
    pub fn exceedance_rate_contribution(&self, poe: f64, time_span: f64) -> f64 {
        match self {
            RuptureOccurrence::Poissonian { rate } => rate * time_span * poe,
            RuptureOccurrence::NonParametric { .. } => {
                -self
                    .probability_no_exceedance(poe, time_span)
                    .max(f64::MIN_POSITIVE)
                    .ln()
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            RuptureOccurrence::Poissonian { rate } if !(rate.is_finite() && *rate >= 0.0) => {
                Err(format!("invalid occurrence rate {rate}"))
            }
            RuptureOccurrence::NonParametric { probs_occur } => {
                if probs_occur.is_empty() {
                    return Err("empty occurrence-probability vector".into());
                }
                if probs_occur.iter().any(|p| !(0.0..=1.0).contains(p)) {
                    return Err("occurrence probabilities outside [0, 1]".into());
                }
                let total: f64 = probs_occur.iter().sum();
                if (total - 1.0).abs() > 1e-6 {
                    return Err(format!("occurrence probabilities sum to {total}"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// One rupture together with its geometry relative to every site it reaches.
///
/// The per-site columns are parallel and ordered by `sids`.
#[derive(Debug, Clone)]
pub struct RuptureContext {
    pub src_id: u32,
    pub rup_id: u32,
    pub mag: f64,
    pub occurrence: RuptureOccurrence,
    /// Rupture weight inside a rupture-mutex group; 1 otherwise.
    pub weight: f64,
    pub sids: Vec<u32>,
    /// Joyner-Boore distance in km.
    pub dists: Vec<f64>,
    /// Closest point of the rupture surface to each site.
    pub lons: Vec<f64>,
    pub lats: Vec<f64>,
}

impl RuptureContext {
    pub fn new(src_id: u32, rup_id: u32, mag: f64, occurrence: RuptureOccurrence) -> Self {
        Self {
            src_id,
            rup_id,
            mag,
            occurrence,
            weight: 1.0,
            sids: Vec::new(),
            dists: Vec::new(),
            lons: Vec::new(),
            lats: Vec::new(),
        }
    }

    /// Attach the geometry seen from site `sid`, keeping the columns sorted.
    pub fn with_site(mut self, sid: u32, dist: f64, lon: f64, lat: f64) -> Self {
        let pos = self.sids.partition_point(|&s| s < sid);
        self.sids.insert(pos, sid);
        self.dists.insert(pos, dist);
        self.lons.insert(pos, lon);
        self.lats.insert(pos, lat);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Column of `sid` when it lies within `max_dist`, `None` for a far-away
    /// rupture.
    #[inline]
    pub fn site_position(&self, sid: u32, max_dist: f64) -> Option<usize> {
        let k = self.sids.binary_search(&sid).ok()?;
        (self.dists[k] <= max_dist).then_some(k)
    }

    /// Number of sites within `max_dist`; the rupture's scheduling weight.
    pub fn num_close_sites(&self, max_dist: f64) -> usize {
        self.dists.iter().filter(|&&d| d <= max_dist).count()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let n = self.sids.len();
        if self.dists.len() != n || self.lons.len() != n || self.lats.len() != n {
            return Err("per-site columns have mismatched lengths".into());
        }
        if self.sids.windows(2).any(|w| w[1] <= w[0]) {
            return Err("site ids are not strictly increasing".into());
        }
        if !self.mag.is_finite() || self.dists.iter().any(|d| !(d.is_finite() && *d >= 0.0)) {
            return Err("non-finite magnitude or distance".into());
        }
        if !(self.weight.is_finite() && self.weight >= 0.0) {
            return Err(format!("invalid rupture weight {}", self.weight));
        }
        self.occurrence.validate()
    }
}

/// All ruptures of one tectonic-region group.
#[derive(Debug, Clone)]
pub struct RuptureGroup {
    pub grp_id: u16,
    pub trt: String,
    /// At most one rupture of the group can occur.
    pub rup_mutex: bool,
    /// At most one source of the group can occur.
    pub src_mutex: bool,
    /// Source weights, used by source-mutex groups.
    pub src_weights: BTreeMap<u32, f64>,
    pub contexts: Vec<RuptureContext>,
}

impl RuptureGroup {
    pub fn independent(grp_id: u16, trt: impl Into<String>, contexts: Vec<RuptureContext>) -> Self {
        Self {
            grp_id,
            trt: trt.into(),
            rup_mutex: false,
            src_mutex: false,
            src_weights: BTreeMap::new(),
            contexts,
        }
    }

    #[inline]
    pub fn is_independent(&self) -> bool {
        !self.rup_mutex && !self.src_mutex
    }

    /// Fail fast on interdependence combinations the kernels cannot express.
    pub fn check_supported(&self) -> Result<()> {
        if self.rup_mutex && self.src_mutex {
            return Err(DisaggError::NotImplemented(format!(
                "group #{} ({}) is both rupture-mutex and source-mutex",
                self.grp_id, self.trt
            )));
        }
        Ok(())
    }

    pub fn src_weight(&self, src_id: u32) -> f64 {
        self.src_weights.get(&src_id).copied().unwrap_or(0.0)
    }

    pub fn validate(&self) -> Result<()> {
        self.check_supported()?;
        for ctx in &self.contexts {
            ctx.validate().map_err(|msg| {
                DisaggError::invalid(format!(
                    "group #{} source {} rupture {}: {msg}",
                    self.grp_id, ctx.src_id, ctx.rup_id
                ))
            })?;
            if self.src_mutex && !self.src_weights.contains_key(&ctx.src_id) {
                return Err(DisaggError::invalid(format!(
                    "source-mutex group #{} has no weight for source {}",
                    self.grp_id, ctx.src_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poissonian_no_exceedance_matches_rate() {
        let occ = RuptureOccurrence::Poissonian { rate: 0.01 };
        let pne = occ.probability_no_exceedance(0.5, 50.0);
        assert!((pne - (-0.25f64).exp()).abs() < 1e-15);
        assert!((occ.exceedance_rate_contribution(0.5, 50.0) - 0.25).abs() < 1e-15);
    }

    #[test]
    fn nonparametric_no_exceedance_sums_powers() {
        let occ = RuptureOccurrence::NonParametric {
            probs_occur: vec![0.7, 0.2, 0.1],
        };
        // 0.7 + 0.2 * 0.6 + 0.1 * 0.36
        let expected = 0.7 + 0.12 + 0.036;
        assert!((occ.probability_no_exceedance(0.4, 1.0) - expected).abs() < 1e-12);
        let rate = occ.exceedance_rate_contribution(0.4, 1.0);
        assert!(((-rate).exp() - expected).abs() < 1e-12);
    }

    #[test]
    fn far_away_site_has_no_position() {
        let ctx = RuptureContext::new(1, 1, 6.0, RuptureOccurrence::Poissonian { rate: 1e-3 })
            .with_site(4, 250.0, 0.0, 0.0)
            .with_site(2, 20.0, 0.0, 0.0);
        assert_eq!(ctx.sids, vec![2, 4]);
        assert_eq!(ctx.site_position(2, 200.0), Some(0));
        assert_eq!(ctx.site_position(4, 200.0), None);
        assert_eq!(ctx.site_position(9, 200.0), None);
        assert_eq!(ctx.num_close_sites(200.0), 1);
    }

    #[test]
    fn double_mutex_is_not_implemented() {
        let mut grp = RuptureGroup::independent(0, "Active", vec![]);
        grp.rup_mutex = true;
        grp.src_mutex = true;
        assert!(matches!(
            grp.check_supported(),
            Err(DisaggError::NotImplemented(_))
        ));
    }
}
