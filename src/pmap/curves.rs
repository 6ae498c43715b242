//! Hazard curves from rupture groups, the input of the seed interpolation.

use ahash::AHashMap;
use ndarray::{Array3, ArrayView1, s};
use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::debug;

use super::{ExceedanceMap, NoExceedance, ProbabilityMap, RateMap};
use crate::config::{AccumulationMode, DisaggConfig};
use crate::error::{DisaggError, Result};
use crate::inputs::{GroundMotionModel, check_poes};
use crate::rupture::{RuptureContext, RuptureGroup};
use crate::site::SiteCollection;

/// Exceedance probabilities shaped `(site, level, rlz)` over the
/// concatenated level axis.
#[derive(Debug, Clone)]
pub struct HazardCurves {
    pub sids: Vec<u32>,
    pub poes: Array3<f64>,
}

impl HazardCurves {
    pub fn from_pmap(pmap: ProbabilityMap<NoExceedance>) -> Self {
        let sids = pmap.sids().to_vec();
        Self {
            sids,
            poes: pmap.into_exceedance().into_array(),
        }
    }

    pub fn num_rlzs(&self) -> usize {
        self.poes.dim().2
    }

    /// Curve of one site, realization and level range.
    pub fn curve(&self, pos: usize, levels: std::ops::Range<usize>, rlz: usize) -> ArrayView1<'_, f64> {
        self.poes.slice(s![pos, levels, rlz])
    }
}

/// Calls `f(site_idx, rlz, level_start, ctx, poes)` for every rupture close
/// to every site, once per IMT.
fn for_each_rupture_poes<F>(
    ctxs: &[&RuptureContext],
    max_dist: f64,
    sites: &SiteCollection,
    model: &dyn GroundMotionModel,
    cfg: &DisaggConfig,
    n_rlz: usize,
    mut f: F,
) -> Result<()>
where
    F: FnMut(usize, usize, usize, &RuptureContext, ArrayView1<'_, f64>),
{
    let mut close: Vec<&RuptureContext> = Vec::with_capacity(ctxs.len());
    for (pos, site) in sites.iter().enumerate() {
        close.clear();
        close.extend(
            ctxs.iter()
                .copied()
                .filter(|c| c.site_position(site.sid, max_dist).is_some()),
        );
        if close.is_empty() {
            continue;
        }
        for rlz in 0..n_rlz {
            for m in 0..cfg.imtls.len() {
                let imls = cfg.imtls.levels(m);
                let poes = model.hazard_poes(
                    &close,
                    site,
                    cfg.imtls.name(m),
                    imls,
                    cfg.truncation_level,
                    rlz,
                )?;
                check_poes(&poes, close.len(), imls.len(), "hazard_poes")?;
                let start = cfg.imtls.range(m).start;
                for (ctx, row) in close.iter().zip(poes.rows()) {
                    f(pos, rlz, start, *ctx, row);
                }
            }
        }
    }
    Ok(())
}

/// No-exceedance map of a single group over every site, level and
/// realization.
pub fn pmap_from_group(
    group: &RuptureGroup,
    sites: &SiteCollection,
    model: &dyn GroundMotionModel,
    cfg: &DisaggConfig,
    n_rlz: usize,
) -> Result<ProbabilityMap<NoExceedance>> {
    group.check_supported()?;
    let t = cfg.investigation_time;
    let max_dist = cfg.maximum_distance.get(&group.trt);
    let n_levels = cfg.imtls.num_levels();
    let sids = sites.sids();
    let all: Vec<&RuptureContext> = group.contexts.iter().collect();

    if group.rup_mutex {
        let mut emap = ExceedanceMap::build(sids, n_levels, n_rlz);
        for_each_rupture_poes(&all, max_dist, sites, model, cfg, n_rlz, |idx, rlz, start, ctx, poes| {
            emap.update_mutex(idx, rlz, start, poes, &ctx.occurrence, t, ctx.weight)
        })?;
        return Ok(emap.into_no_exceedance());
    }

    if group.src_mutex {
        let mut by_source: AHashMap<u32, SmallVec<[usize; 8]>> = AHashMap::new();
        for (i, ctx) in group.contexts.iter().enumerate() {
            by_source.entry(ctx.src_id).or_default().push(i);
        }
        let mut emap = ExceedanceMap::build(sids, n_levels, n_rlz);
        for (src_id, idxs) in by_source {
            let ctxs: Vec<&RuptureContext> = idxs.iter().map(|&i| &group.contexts[i]).collect();
            let mut src_map = ProbabilityMap::<NoExceedance>::build(sids, n_levels, n_rlz);
            for_each_rupture_poes(&ctxs, max_dist, sites, model, cfg, n_rlz, |idx, rlz, start, ctx, poes| {
                src_map.update_indep(idx, rlz, start, poes, &ctx.occurrence, t)
            })?;
            emap.add_weighted_complement(&src_map, group.src_weight(src_id))?;
        }
        return Ok(emap.into_no_exceedance());
    }

    match cfg.accumulation {
        AccumulationMode::Rates => {
            let mut rmap = RateMap::build(sids, n_levels, n_rlz);
            for_each_rupture_poes(&all, max_dist, sites, model, cfg, n_rlz, |idx, rlz, start, ctx, poes| {
                rmap.update_rates(idx, rlz, start, poes, &ctx.occurrence, t)
            })?;
            Ok(rmap.into_no_exceedance(t))
        }
        AccumulationMode::Probabilities => {
            let mut pmap = ProbabilityMap::<NoExceedance>::build(sids, n_levels, n_rlz);
            for_each_rupture_poes(&all, max_dist, sites, model, cfg, n_rlz, |idx, rlz, start, ctx, poes| {
                pmap.update_indep(idx, rlz, start, poes, &ctx.occurrence, t)
            })?;
            Ok(pmap)
        }
    }
}

/// Hazard curves of every site: groups run in parallel and are composed as
/// independent events.
pub fn compute_hazard_curves(
    groups: &[RuptureGroup],
    sites: &SiteCollection,
    model: &dyn GroundMotionModel,
    cfg: &DisaggConfig,
    n_rlz: usize,
) -> Result<HazardCurves> {
    let maps: Vec<ProbabilityMap<NoExceedance>> = groups
        .par_iter()
        .map(|g| pmap_from_group(g, sites, model, cfg, n_rlz))
        .collect::<Result<_>>()?;

    let mut total = ProbabilityMap::<NoExceedance>::build(sites.sids(), cfg.imtls.num_levels(), n_rlz);
    for (grp, pmap) in groups.iter().zip(&maps) {
        total.compose(pmap)?;
        debug!(grp_id = grp.grp_id, trt = %grp.trt, "composed group hazard");
    }
    Ok(HazardCurves::from_pmap(total))
}

/// IML at which a decreasing hazard curve reaches `poe`, by linear
/// interpolation; poes outside the curve clamp to the end levels.
pub fn iml_for_poe(imls: &[f64], curve: ArrayView1<'_, f64>, poe: f64) -> Result<f64> {
    let n = imls.len();
    if n == 0 || curve.len() != n {
        return Err(DisaggError::invalid("curve and levels differ in length"));
    }
    if poe >= curve[0] {
        return Ok(imls[0]);
    }
    if poe <= curve[n - 1] {
        return Ok(imls[n - 1]);
    }
    for i in 0..n - 1 {
        let (hi, lo) = (curve[i], curve[i + 1]);
        if poe <= hi && poe >= lo {
            if hi == lo {
                return Ok(imls[i]);
            }
            let frac = (hi - poe) / (hi - lo);
            return Ok(imls[i] + frac * (imls[i + 1] - imls[i]));
        }
    }
    Err(DisaggError::invalid(format!(
        "hazard curve is not monotonic around poe {poe}"
    )))
}
