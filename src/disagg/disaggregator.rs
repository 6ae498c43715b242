//! Assignment of rupture contributions to matrix cells.

use ahash::AHashMap;
use ndarray::ArrayView4;
use smallvec::SmallVec;

use super::matrix::DisaggMatrix;
use crate::binning::BinEdges;
use crate::config::{AccumulationMode, DisaggConfig};
use crate::error::{DisaggError, Result};
use crate::rupture::{RuptureContext, RuptureGroup, RuptureOccurrence};
use crate::site::Site;

/// Counters of one `disaggregate` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisaggStats {
    pub accumulated: usize,
    pub far_away: usize,
    pub out_of_range: usize,
}

impl DisaggStats {
    pub fn absorb(&mut self, other: DisaggStats) {
        self.accumulated += other.accumulated;
        self.far_away += other.far_away;
        self.out_of_range += other.out_of_range;
    }
}

/// Per-site binning of rupture contributions into an 8-D matrix.
///
/// Independent ruptures are added straight into the matrix. Mutex groups
/// accumulate weighted exceedance probabilities into a sparse scratch keyed by
/// matrix offset, folded into the matrix once the group is done.
#[derive(Debug, Clone, Copy)]
pub struct Disaggregator<'a> {
    edges: &'a BinEdges,
    mode: AccumulationMode,
    time_span: f64,
}

impl<'a> Disaggregator<'a> {
    pub fn new(edges: &'a BinEdges, cfg: &DisaggConfig) -> Self {
        Self {
            edges,
            mode: cfg.accumulation,
            time_span: cfg.investigation_time,
        }
    }

    /// `[trt, mag, dist, lon, lat]` bins of a rupture seen from the site at
    /// column `k` of its context.
    #[inline]
    fn locate(&self, trt: usize, site_idx: usize, ctx: &RuptureContext, k: usize) -> Option<[usize; 5]> {
        Some([
            trt,
            self.edges.mag_bin(ctx.mag)?,
            self.edges.dist_bin(ctx.dists[k])?,
            self.edges.lon_bin(site_idx, ctx.lons[k])?,
            self.edges.lat_bin(site_idx, ctx.lats[k])?,
        ])
    }

    #[inline]
    fn independent_term(&self, occurrence: &RuptureOccurrence, poe: f64) -> f64 {
        match self.mode {
            AccumulationMode::Rates => occurrence.exceedance_rate_contribution(poe, self.time_span),
            AccumulationMode::Probabilities => {
                1.0 - occurrence.probability_no_exceedance(poe, self.time_span)
            }
        }
    }

    #[inline]
    fn fold_probability(&self, p: f64) -> f64 {
        match self.mode {
            AccumulationMode::Rates => -(1.0 - p).max(f64::MIN_POSITIVE).ln(),
            AccumulationMode::Probabilities => p,
        }
    }

    /// Accumulate the contributions of `ctxs` into `out`.
    ///
    /// `exceedance[[i, e, m, p]]` is the conditional probability that rupture
    /// `ctxs[i]` exceeds the seed IML of `(imt m, poe p)` with its residual in
    /// epsilon bin `e`. `out` must be shaped for `site_idx`, except that it may
    /// cover only a window of the magnitude bins; ruptures outside that window
    /// are counted as out of range.
    #[allow(clippy::too_many_arguments)]
    pub fn disaggregate(
        &self,
        group: &RuptureGroup,
        ctxs: &[&RuptureContext],
        site_idx: usize,
        site: &Site,
        max_dist: f64,
        exceedance: ArrayView4<'_, f64>,
        out: &mut DisaggMatrix,
    ) -> Result<DisaggStats> {
        group.check_supported()?;
        let (n_ctx, n_eps, n_imt, n_poe) = exceedance.dim();
        let shape = out.shape();
        let bins = self.edges.shape(site_idx);
        let window = out.mag_range();
        if n_ctx != ctxs.len()
            || n_eps != self.edges.num_eps()
            || n_imt != shape[6]
            || n_poe != shape[7]
            || shape[0] != bins[0]
            || shape[2..6] != bins[2..]
            || window.end > bins[1]
        {
            return Err(DisaggError::invalid(format!(
                "exceedance shape {:?} does not fit matrix shape {:?} for site #{}",
                exceedance.dim(),
                shape,
                site.sid
            )));
        }
        let trt = self.edges.trt_index(&group.trt).ok_or_else(|| {
            DisaggError::invalid(format!("TRT {} has no bin", group.trt))
        })?;
        let block = out.block_len();

        let mut stats = DisaggStats::default();
        // matrix offset of each rupture's (eps = 0, imt = 0, poe = 0) entry
        let mut cells: Vec<Option<usize>> = Vec::with_capacity(n_ctx);
        for ctx in ctxs {
            let Some(k) = ctx.site_position(site.sid, max_dist) else {
                stats.far_away += 1;
                cells.push(None);
                continue;
            };
            match self.locate(trt, site_idx, ctx, k) {
                Some([t, m, d, lo, la]) if window.contains(&m) => {
                    cells.push(Some(out.cell_offset([t, m, d, lo, la, 0])));
                    stats.accumulated += 1;
                }
                _ => {
                    stats.out_of_range += 1;
                    cells.push(None);
                }
            }
        }

        if group.is_independent() {
            let data = out.data_mut();
            for (i, ctx) in ctxs.iter().enumerate() {
                let Some(base) = cells[i] else { continue };
                for e in 0..n_eps {
                    let cell = &mut data[base + e * block..base + (e + 1) * block];
                    for m in 0..n_imt {
                        for p in 0..n_poe {
                            let poe = exceedance[[i, e, m, p]];
                            cell[m * n_poe + p] += self.independent_term(&ctx.occurrence, poe);
                        }
                    }
                }
            }
            return Ok(stats);
        }

        let mut scratch: AHashMap<usize, f64> = AHashMap::new();
        if group.rup_mutex {
            for (i, ctx) in ctxs.iter().enumerate() {
                let Some(base) = cells[i] else { continue };
                for e in 0..n_eps {
                    for m in 0..n_imt {
                        for p in 0..n_poe {
                            let pne = ctx
                                .occurrence
                                .probability_no_exceedance(exceedance[[i, e, m, p]], self.time_span);
                            let off = base + e * block + m * n_poe + p;
                            *scratch.entry(off).or_insert(0.0) += ctx.weight * (1.0 - pne);
                        }
                    }
                }
            }
        } else {
            let mut by_source: AHashMap<u32, SmallVec<[usize; 8]>> = AHashMap::new();
            for (i, ctx) in ctxs.iter().enumerate() {
                if cells[i].is_some() {
                    by_source.entry(ctx.src_id).or_default().push(i);
                }
            }
            let mut src_pne: AHashMap<usize, f64> = AHashMap::new();
            for (src_id, members) in by_source {
                src_pne.clear();
                for &i in &members {
                    let Some(base) = cells[i] else { continue };
                    let occ = &ctxs[i].occurrence;
                    for e in 0..n_eps {
                        for m in 0..n_imt {
                            for p in 0..n_poe {
                                let pne = occ
                                    .probability_no_exceedance(exceedance[[i, e, m, p]], self.time_span);
                                let off = base + e * block + m * n_poe + p;
                                *src_pne.entry(off).or_insert(1.0) *= pne;
                            }
                        }
                    }
                }
                let weight = group.src_weight(src_id);
                for (&off, &pne) in &src_pne {
                    *scratch.entry(off).or_insert(0.0) += weight * (1.0 - pne);
                }
            }
        }

        let data = out.data_mut();
        for (off, p) in scratch {
            data[off] += self.fold_probability(p);
        }
        Ok(stats)
    }
}
