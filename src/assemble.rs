//! Normalization, marginal projections, realization means and the
//! recovered-poe check.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{ArrayD, Axis};
use tracing::{info, warn};

use crate::binning::BinEdges;
use crate::config::{AccumulationMode, DisaggConfig};
use crate::disagg::{AXES, DisaggMatrix, DisaggSeeds};
use crate::error::Result;
use crate::realizations::RealizationWeights;
use crate::scheduler::TaskReport;
use crate::site::SiteCollection;

/// A projection of the 8-D matrix obtained by summing out the other bin axes.
/// The `imt` and `poe` axes are always kept, last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Marginal {
    Mag,
    Dist,
    Trt,
    MagDist,
    MagDistEps,
    LonLat,
    MagLonLat,
    LonLatTrt,
}

impl Marginal {
    pub const ALL: [Marginal; 8] = [
        Marginal::Mag,
        Marginal::Dist,
        Marginal::Trt,
        Marginal::MagDist,
        Marginal::MagDistEps,
        Marginal::LonLat,
        Marginal::MagLonLat,
        Marginal::LonLatTrt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Marginal::Mag => "Mag",
            Marginal::Dist => "Dist",
            Marginal::Trt => "TRT",
            Marginal::MagDist => "Mag_Dist",
            Marginal::MagDistEps => "Mag_Dist_Eps",
            Marginal::LonLat => "Lon_Lat",
            Marginal::MagLonLat => "Mag_Lon_Lat",
            Marginal::LonLatTrt => "Lon_Lat_TRT",
        }
    }

    /// Kept matrix axes, in output order.
    pub fn axes(self) -> &'static [usize] {
        match self {
            Marginal::Mag => &[1],
            Marginal::Dist => &[2],
            Marginal::Trt => &[0],
            Marginal::MagDist => &[1, 2],
            Marginal::MagDistEps => &[1, 2, 5],
            Marginal::LonLat => &[3, 4],
            Marginal::MagLonLat => &[1, 3, 4],
            Marginal::LonLatTrt => &[3, 4, 0],
        }
    }

    pub fn dims(self) -> Vec<String> {
        self.axes()
            .iter()
            .map(|&a| AXES[a])
            .chain(["imt", "poe"])
            .map(String::from)
            .collect()
    }

    pub fn project(self, matrix: &DisaggMatrix) -> Result<ArrayD<f64>> {
        let keep = self.axes();
        let mut arr = matrix.to_array()?;
        for d in (0..6).rev() {
            if !keep.contains(&d) {
                arr = arr.sum_axis(Axis(d));
            }
        }
        // summing leaves the kept axes in ascending order
        let mut perm: Vec<usize> = keep
            .iter()
            .map(|&k| keep.iter().filter(|&&o| o < k).count())
            .collect();
        perm.extend([keep.len(), keep.len() + 1]);
        Ok(arr.permuted_axes(perm))
    }
}

impl fmt::Display for Marginal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RlzKey {
    Realization(usize),
    Mean,
}

impl fmt::Display for RlzKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RlzKey::Realization(r) => write!(f, "rlz-{r:03}"),
            RlzKey::Mean => f.write_str("mean"),
        }
    }
}

/// Seed poe against the poe recovered by collapsing the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct PoeCheck {
    pub imt: String,
    pub poe: f64,
    pub computed_poe: f64,
    pub rel_diff: f64,
}

#[derive(Debug, Clone)]
pub struct SiteResult {
    /// Normalized: every `(imt, poe)` slice sums to 1.
    pub matrix: DisaggMatrix,
    pub pmfs: BTreeMap<Marginal, ArrayD<f64>>,
    pub qc: Vec<PoeCheck>,
}

#[derive(Debug, Clone)]
pub struct DisaggOutput {
    pub sids: Vec<u32>,
    pub imts: Vec<String>,
    pub poes: Vec<f64>,
    /// `None` when no site has any hazard and nothing was binned.
    pub edges: Option<BinEdges>,
    pub results: BTreeMap<(u32, RlzKey), SiteResult>,
    pub task_reports: Vec<TaskReport>,
}

impl DisaggOutput {
    pub fn get(&self, sid: u32, key: RlzKey) -> Option<&SiteResult> {
        self.results.get(&(sid, key))
    }
}

/// Per-`(imt, poe)` sums, indexed `imt * n_poe + poe`.
fn slice_sums(matrix: &DisaggMatrix) -> Vec<f64> {
    let block = matrix.block_len();
    let mut sums = vec![0.0; block];
    for cell in matrix.data().chunks_exact(block) {
        for (s, v) in sums.iter_mut().zip(cell) {
            *s += v;
        }
    }
    sums
}

/// Probability of exceedance recovered from the raw accumulated matrix.
fn recovered_poes(matrix: &DisaggMatrix, mode: AccumulationMode) -> Vec<f64> {
    match mode {
        AccumulationMode::Rates => slice_sums(matrix)
            .into_iter()
            .map(|c| -(-c).exp_m1())
            .collect(),
        AccumulationMode::Probabilities => {
            let block = matrix.block_len();
            let mut pne = vec![1.0; block];
            for cell in matrix.data().chunks_exact(block) {
                for (q, c) in pne.iter_mut().zip(cell) {
                    *q *= 1.0 - c;
                }
            }
            pne.into_iter().map(|q| 1.0 - q).collect()
        }
    }
}

fn poe_checks(recovered: &[f64], cfg: &DisaggConfig, sid: u32, key: RlzKey) -> Vec<PoeCheck> {
    let n_poe = cfg.poes_disagg.len();
    let mut checks = Vec::with_capacity(recovered.len());
    for m in 0..cfg.imtls.len() {
        for (p, &poe) in cfg.poes_disagg.iter().enumerate() {
            let computed_poe = recovered[m * n_poe + p];
            let rel_diff = (computed_poe - poe).abs() / poe;
            if rel_diff > cfg.poe_tolerance {
                warn!(
                    sid,
                    rlz = %key,
                    imt = cfg.imtls.name(m),
                    poe,
                    computed_poe,
                    "disaggregation poe differs from the poe recovered from the matrix"
                );
            }
            checks.push(PoeCheck {
                imt: cfg.imtls.name(m).to_string(),
                poe,
                computed_poe,
                rel_diff,
            });
        }
    }
    checks
}

/// Turn accumulated contributions into probabilities that sum to 1 over every
/// `(imt, poe)` slice. `None` when some slice holds no hazard.
pub fn normalize(mut matrix: DisaggMatrix, mode: AccumulationMode) -> Option<DisaggMatrix> {
    if mode == AccumulationMode::Rates {
        for c in matrix.data_mut() {
            *c = -(-*c).exp_m1();
        }
    }
    let sums = slice_sums(&matrix);
    if sums.iter().any(|&s| !(s > 0.0 && s.is_finite())) {
        return None;
    }
    let block = matrix.block_len();
    for cell in matrix.data_mut().chunks_exact_mut(block) {
        for (c, s) in cell.iter_mut().zip(&sums) {
            *c /= s;
        }
    }
    Some(matrix)
}

fn site_result(matrix: DisaggMatrix, qc: Vec<PoeCheck>, cfg: &DisaggConfig) -> Result<SiteResult> {
    let mut pmfs = BTreeMap::new();
    for &marginal in &cfg.marginals {
        pmfs.insert(marginal, marginal.project(&matrix)?);
    }
    Ok(SiteResult { matrix, pmfs, qc })
}

/// Normalize the reduced matrices, project the marginals and add a weighted
/// mean per site whenever there is more than one realization. Realizations
/// without a usable matrix are left out of the mean and the remaining
/// weights are renormalized.
pub fn assemble(
    mut finals: Vec<Option<DisaggMatrix>>,
    sites: &SiteCollection,
    seeds: &DisaggSeeds,
    weights: &RealizationWeights,
    cfg: &DisaggConfig,
) -> Result<BTreeMap<(u32, RlzKey), SiteResult>> {
    let n_rlz = weights.len();
    let mut results = BTreeMap::new();

    for (pos, site) in sites.iter().enumerate() {
        let mut normalized: Vec<(usize, DisaggMatrix, Vec<PoeCheck>)> = Vec::new();
        for rlz in 0..n_rlz {
            let Some(raw) = finals[pos * n_rlz + rlz].take() else {
                if seeds.active[[pos, rlz]] {
                    warn!(sid = site.sid, rlz, "no rupture contributed to the disaggregation");
                }
                continue;
            };
            let key = RlzKey::Realization(rlz);
            let qc = poe_checks(&recovered_poes(&raw, cfg.accumulation), cfg, site.sid, key);
            match normalize(raw, cfg.accumulation) {
                Some(matrix) => normalized.push((rlz, matrix, qc)),
                None => warn!(
                    sid = site.sid,
                    rlz, "zero hazard in some (imt, poe) slice; excluded from the output"
                ),
            }
        }
        if normalized.is_empty() {
            info!(sid = site.sid, "site has no disaggregation output");
            continue;
        }

        if n_rlz > 1 {
            let total: f64 = normalized.iter().map(|(r, _, _)| weights.weight(*r)).sum();
            let mut mean = DisaggMatrix::zeros(*normalized[0].1.shape());
            let mut mean_qc = normalized[0].2.clone();
            for q in &mut mean_qc {
                q.computed_poe = 0.0;
            }
            for (rlz, matrix, qc) in &normalized {
                let w = weights.weight(*rlz) / total;
                mean.add_scaled(matrix, w)?;
                for (acc, q) in mean_qc.iter_mut().zip(qc) {
                    acc.computed_poe += w * q.computed_poe;
                }
            }
            for q in &mut mean_qc {
                q.rel_diff = (q.computed_poe - q.poe).abs() / q.poe;
            }
            results.insert((site.sid, RlzKey::Mean), site_result(mean, mean_qc, cfg)?);
        }
        for (rlz, matrix, qc) in normalized {
            results.insert(
                (site.sid, RlzKey::Realization(rlz)),
                site_result(matrix, qc, cfg)?,
            );
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_with(values: &[([usize; 8], f64)]) -> DisaggMatrix {
        let mut m = DisaggMatrix::zeros([2, 2, 1, 1, 1, 2, 1, 1]);
        for &(idx, v) in values {
            let off = m.offset(idx);
            m.data_mut()[off] = v;
        }
        m
    }

    #[test]
    fn normalized_slices_sum_to_one_in_both_modes() {
        let raw = matrix_with(&[
            ([0, 0, 0, 0, 0, 0, 0, 0], 0.02),
            ([0, 1, 0, 0, 0, 1, 0, 0], 0.01),
            ([1, 1, 0, 0, 0, 0, 0, 0], 0.03),
        ]);
        for mode in [AccumulationMode::Rates, AccumulationMode::Probabilities] {
            let m = normalize(raw.clone(), mode).unwrap();
            assert!((m.sum() - 1.0).abs() < 1e-12);
        }
        let zero = DisaggMatrix::zeros([1, 1, 1, 1, 1, 1, 1, 1]);
        assert!(normalize(zero, AccumulationMode::Rates).is_none());
    }

    #[test]
    fn marginals_sum_like_the_matrix() {
        let raw = matrix_with(&[
            ([0, 0, 0, 0, 0, 0, 0, 0], 0.2),
            ([0, 1, 0, 0, 0, 1, 0, 0], 0.3),
            ([1, 1, 0, 0, 0, 0, 0, 0], 0.5),
        ]);
        let m = normalize(raw, AccumulationMode::Probabilities).unwrap();
        for marginal in Marginal::ALL {
            let pmf = marginal.project(&m).unwrap();
            assert_eq!(pmf.ndim(), marginal.axes().len() + 2);
            assert!((pmf.sum() - 1.0).abs() < 1e-12, "{marginal}");
        }
        let mag = Marginal::Mag.project(&m).unwrap();
        assert!((mag[&[1, 0, 0][..]] - 0.8).abs() < 1e-12);
        let by_trt = Marginal::LonLatTrt.project(&m).unwrap();
        assert_eq!(by_trt.shape(), &[1, 1, 2, 1, 1]);
        assert!((by_trt[&[0, 0, 1, 0, 0][..]] - 0.5).abs() < 1e-12);
        assert_eq!(Marginal::LonLatTrt.dims(), vec!["lon", "lat", "trt", "imt", "poe"]);
    }

    #[test]
    fn recovered_poe_inverts_rate_accumulation() {
        let rate = 0.1053605156578263; // -ln(0.9)
        let raw = matrix_with(&[([0, 0, 0, 0, 0, 0, 0, 0], rate / 2.0), ([1, 0, 0, 0, 0, 1, 0, 0], rate / 2.0)]);
        let poes = recovered_poes(&raw, AccumulationMode::Rates);
        assert!((poes[0] - 0.1).abs() < 1e-12);
        let probs = matrix_with(&[([0, 0, 0, 0, 0, 0, 0, 0], 0.5), ([1, 0, 0, 0, 0, 1, 0, 0], 0.5)]);
        assert!((recovered_poes(&probs, AccumulationMode::Probabilities)[0] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn mean_survives_a_dropped_realization() {
        use crate::config::ImtLevels;
        use crate::site::Site;
        use ndarray::{Array2, Array4};

        let imtls = ImtLevels::new(vec![("PGA".into(), vec![0.1, 0.2])]).unwrap();
        let mut cfg = DisaggConfig::new(imtls, vec![0.1]);
        cfg.accumulation = AccumulationMode::Probabilities;
        let sites = SiteCollection::new(vec![Site::new(3, 0.0, 0.0)]).unwrap();
        let seeds = DisaggSeeds {
            imls: Array4::from_elem((1, 2, 1, 1), 0.15),
            active: Array2::from_shape_vec((1, 2), vec![true, false]).unwrap(),
        };
        let weights = RealizationWeights::new(vec![0.3, 0.7]).unwrap();
        let raw = matrix_with(&[([0, 0, 0, 0, 0, 0, 0, 0], 0.06), ([1, 1, 0, 0, 0, 1, 0, 0], 0.04)]);
        let results = assemble(vec![Some(raw), None], &sites, &seeds, &weights, &cfg).unwrap();

        let only = &results[&(3, RlzKey::Realization(0))];
        let mean = &results[&(3, RlzKey::Mean)];
        assert!(!results.contains_key(&(3, RlzKey::Realization(1))));
        assert_eq!(mean.matrix, only.matrix);
        assert!((mean.matrix.sum() - 1.0).abs() < 1e-12);
        assert!((mean.qc[0].computed_poe - only.qc[0].computed_poe).abs() < 1e-15);
    }

    #[test]
    fn mean_is_listed_after_realizations() {
        assert!(RlzKey::Realization(7) < RlzKey::Mean);
        assert_eq!(RlzKey::Realization(2).to_string(), "rlz-002");
    }
}
