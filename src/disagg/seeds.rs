//! Disaggregation seeds: the IML interpolated from each hazard curve at each
//! requested poe.

use ndarray::{Array2, Array4};
use tracing::{info, warn};

use crate::config::DisaggConfig;
use crate::error::{DisaggError, Result};
use crate::pmap::curves::{HazardCurves, iml_for_poe};
use crate::site::SiteCollection;

#[derive(Debug, Clone)]
pub struct DisaggSeeds {
    /// `(site, rlz, imt, poe)`.
    pub imls: Array4<f64>,
    /// `(site, rlz)`; false for zero-hazard pairs.
    pub active: Array2<bool>,
}

impl DisaggSeeds {
    pub fn is_site_active(&self, pos: usize) -> bool {
        self.active.row(pos).iter().any(|&a| a)
    }

    pub fn active_rlzs(&self, pos: usize) -> Vec<usize> {
        self.active
            .row(pos)
            .iter()
            .enumerate()
            .filter_map(|(r, &a)| a.then_some(r))
            .collect()
    }

    pub fn num_active_sites(&self) -> usize {
        (0..self.active.nrows())
            .filter(|&pos| self.is_site_active(pos))
            .count()
    }
}

pub fn compute_seeds(
    curves: &HazardCurves,
    sites: &SiteCollection,
    cfg: &DisaggConfig,
) -> Result<DisaggSeeds> {
    let n_sites = sites.len();
    let n_rlz = curves.num_rlzs();
    let n_imt = cfg.imtls.len();
    let n_poe = cfg.poes_disagg.len();
    let mut imls = Array4::zeros((n_sites, n_rlz, n_imt, n_poe));
    let mut active = Array2::from_elem((n_sites, n_rlz), false);

    for (pos, site) in sites.iter().enumerate() {
        for rlz in 0..n_rlz {
            let zero = (0..n_imt).all(|m| {
                curves
                    .curve(pos, cfg.imtls.range(m), rlz)
                    .iter()
                    .all(|&p| p == 0.0)
            });
            if zero {
                info!(sid = site.sid, rlz, "hazard curve is all zeros; skipping");
                continue;
            }
            for m in 0..n_imt {
                let curve = curves.curve(pos, cfg.imtls.range(m), rlz);
                let max_poe = curve[0];
                for (p, &poe) in cfg.poes_disagg.iter().enumerate() {
                    if poe > max_poe {
                        return Err(DisaggError::PoeTooLarge {
                            sid: site.sid,
                            poe,
                            max_poe,
                            rlz,
                            imt: cfg.imtls.name(m).to_string(),
                        });
                    }
                    imls[[pos, rlz, m, p]] = iml_for_poe(cfg.imtls.levels(m), curve, poe)?;
                }
            }
            active[[pos, rlz]] = true;
        }
    }
    let skipped = n_sites - (0..n_sites).filter(|&pos| active.row(pos).iter().any(|&a| a)).count();
    if skipped > 0 {
        warn!(skipped, "sites with zero hazard are excluded from the disaggregation");
    }
    Ok(DisaggSeeds { imls, active })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImtLevels;
    use crate::site::Site;
    use ndarray::Array3;

    fn fixture(poes: Array3<f64>) -> (HazardCurves, SiteCollection, DisaggConfig) {
        let sites = SiteCollection::new(vec![Site::new(0, 0.0, 0.0), Site::new(1, 1.0, 1.0)]).unwrap();
        let imtls = ImtLevels::new(vec![("PGA".into(), vec![0.1, 0.2, 0.4])]).unwrap();
        let cfg = DisaggConfig::new(imtls, vec![0.2]);
        let curves = HazardCurves {
            sids: vec![0, 1],
            poes,
        };
        (curves, sites, cfg)
    }

    #[test]
    fn zero_hazard_site_is_inactive() {
        let mut poes = Array3::zeros((2, 3, 1));
        for (k, v) in [0.5, 0.3, 0.1].into_iter().enumerate() {
            poes[[0, k, 0]] = v;
        }
        let (curves, sites, cfg) = fixture(poes);
        let seeds = compute_seeds(&curves, &sites, &cfg).unwrap();
        assert!(seeds.is_site_active(0));
        assert!(!seeds.is_site_active(1));
        assert_eq!(seeds.num_active_sites(), 1);
        assert!((seeds.imls[[0, 0, 0, 0]] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn poe_above_curve_maximum_is_diagnosed() {
        let mut poes = Array3::zeros((2, 3, 1));
        for pos in 0..2 {
            for (k, v) in [0.05, 0.02, 0.01].into_iter().enumerate() {
                poes[[pos, k, 0]] = v;
            }
        }
        let (curves, sites, cfg) = fixture(poes);
        let err = compute_seeds(&curves, &sites, &cfg).unwrap_err();
        match err {
            DisaggError::PoeTooLarge { sid, max_poe, rlz, ref imt, .. } => {
                assert_eq!((sid, rlz, imt.as_str()), (0, 0, "PGA"));
                assert_eq!(max_poe, 0.05);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
