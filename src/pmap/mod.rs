//! Dense hazard accumulators indexed by `(site, level, column)`.
//!
//! The column axis holds one entry per realization. What a value means is
//! fixed by the map's kind:
//!
//! * [`NoExceedance`]: probability of no exceedance, identity 1, combined by
//!   multiplication (independent ruptures and groups);
//! * [`Exceedance`]: weighted probability of exceedance, identity 0, combined
//!   by addition (mutually exclusive ruptures or sources);
//! * [`Rate`]: exceedance rate, identity 0, combined by addition.
//!
//! All kernels are commutative and associative, so chunked results can be
//! merged in any order.

pub mod curves;

use std::marker::PhantomData;

use ndarray::{Array3, ArrayView1, Zip, s};

use crate::error::{DisaggError, Result};
use crate::rupture::RuptureOccurrence;

pub trait MapKind: Copy + Send + Sync + 'static {
    const IDENTITY: f64;
    const LABEL: &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct NoExceedance;

#[derive(Debug, Clone, Copy)]
pub struct Exceedance;

#[derive(Debug, Clone, Copy)]
pub struct Rate;

impl MapKind for NoExceedance {
    const IDENTITY: f64 = 1.0;
    const LABEL: &'static str = "no-exceedance";
}

impl MapKind for Exceedance {
    const IDENTITY: f64 = 0.0;
    const LABEL: &'static str = "exceedance";
}

impl MapKind for Rate {
    const IDENTITY: f64 = 0.0;
    const LABEL: &'static str = "rate";
}

#[derive(Debug, Clone)]
pub struct ProbabilityMap<K: MapKind = NoExceedance> {
    sids: Vec<u32>,
    array: Array3<f64>,
    _kind: PhantomData<K>,
}

pub type RateMap = ProbabilityMap<Rate>;
pub type ExceedanceMap = ProbabilityMap<Exceedance>;

impl<K: MapKind> ProbabilityMap<K> {
    /// A map over `sids` filled with the kind's identity value.
    pub fn build(sids: &[u32], num_levels: usize, num_columns: usize) -> Self {
        Self {
            sids: sids.to_vec(),
            array: Array3::from_elem((sids.len(), num_levels, num_columns), K::IDENTITY),
            _kind: PhantomData,
        }
    }

    pub fn sids(&self) -> &[u32] {
        &self.sids
    }

    pub fn num_levels(&self) -> usize {
        self.array.dim().1
    }

    pub fn num_columns(&self) -> usize {
        self.array.dim().2
    }

    pub fn array(&self) -> &Array3<f64> {
        &self.array
    }

    pub fn into_array(self) -> Array3<f64> {
        self.array
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.sids != other.sids || self.array.dim() != other.array.dim() {
            return Err(DisaggError::invalid(format!(
                "cannot combine {} maps with shapes {:?} and {:?}",
                K::LABEL,
                self.array.dim(),
                other.array.dim()
            )));
        }
        Ok(())
    }

    fn map_into<T: MapKind>(self, f: impl Fn(f64) -> f64) -> ProbabilityMap<T> {
        ProbabilityMap {
            sids: self.sids,
            array: self.array.mapv_into(f),
            _kind: PhantomData,
        }
    }
}

impl ProbabilityMap<NoExceedance> {
    /// Independent ruptures: `P <- P * pne(poe)` for every level of `poes`,
    /// starting at level `start`.
    #[inline]
    pub fn update_indep(
        &mut self,
        idx: usize,
        col: usize,
        start: usize,
        poes: ArrayView1<'_, f64>,
        occurrence: &RuptureOccurrence,
        time_span: f64,
    ) {
        let mut row = self
            .array
            .slice_mut(s![idx, start..start + poes.len(), col]);
        for (p, &poe) in row.iter_mut().zip(poes.iter()) {
            *p *= occurrence.probability_no_exceedance(poe, time_span);
        }
    }

    /// Independent union with another map over the same sites.
    pub fn compose(&mut self, other: &Self) -> Result<()> {
        self.check_compatible(other)?;
        Zip::from(&mut self.array)
            .and(&other.array)
            .for_each(|a, &b| *a *= b);
        Ok(())
    }

    pub fn into_exceedance(self) -> ExceedanceMap {
        self.map_into(|p| 1.0 - p)
    }
}

impl ProbabilityMap<Exceedance> {
    /// Mutually exclusive ruptures: `accum <- accum + w * (1 - pne(poe))`.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn update_mutex(
        &mut self,
        idx: usize,
        col: usize,
        start: usize,
        poes: ArrayView1<'_, f64>,
        occurrence: &RuptureOccurrence,
        time_span: f64,
        weight: f64,
    ) {
        let mut row = self
            .array
            .slice_mut(s![idx, start..start + poes.len(), col]);
        for (p, &poe) in row.iter_mut().zip(poes.iter()) {
            *p += weight * (1.0 - occurrence.probability_no_exceedance(poe, time_span));
        }
    }

    /// Mutually exclusive sources: `accum <- accum + w * (1 - P_src)`.
    pub fn add_weighted_complement(
        &mut self,
        src: &ProbabilityMap<NoExceedance>,
        weight: f64,
    ) -> Result<()> {
        if self.sids != src.sids || self.array.dim() != src.array.dim() {
            return Err(DisaggError::invalid(
                "source map does not match the group map",
            ));
        }
        Zip::from(&mut self.array)
            .and(&src.array)
            .for_each(|a, &pne| *a += weight * (1.0 - pne));
        Ok(())
    }

    pub fn into_no_exceedance(self) -> ProbabilityMap<NoExceedance> {
        self.map_into(|p| (1.0 - p).clamp(0.0, 1.0))
    }
}

impl ProbabilityMap<Rate> {
    /// `rate <- rate - ln pne(poe) / time_span`; the plain `rate * poe` for
    /// Poissonian ruptures.
    #[inline]
    pub fn update_rates(
        &mut self,
        idx: usize,
        col: usize,
        start: usize,
        poes: ArrayView1<'_, f64>,
        occurrence: &RuptureOccurrence,
        time_span: f64,
    ) {
        let mut row = self
            .array
            .slice_mut(s![idx, start..start + poes.len(), col]);
        for (r, &poe) in row.iter_mut().zip(poes.iter()) {
            *r += occurrence.exceedance_rate_contribution(poe, time_span) / time_span;
        }
    }

    pub fn into_no_exceedance(self, time_span: f64) -> ProbabilityMap<NoExceedance> {
        self.map_into(|r| (-r * time_span).exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const T: f64 = 1.0;

    fn poisson(rate: f64) -> RuptureOccurrence {
        RuptureOccurrence::Poissonian { rate }
    }

    fn chunk_map(seed: usize) -> ProbabilityMap {
        let mut pmap = ProbabilityMap::build(&[0, 3, 7], 3, 2);
        for idx in 0..3 {
            for col in 0..2 {
                let x = ((seed * 7 + idx * 3 + col) % 11) as f64 / 20.0;
                let poes = array![x, x / 2.0, x / 4.0];
                pmap.update_indep(idx, col, 0, poes.view(), &poisson(0.3 + x), T);
            }
        }
        pmap
    }

    #[test]
    fn identity_values_by_kind() {
        let p: ProbabilityMap = ProbabilityMap::build(&[1, 2], 4, 1);
        assert!(p.array().iter().all(|&v| v == 1.0));
        let r = RateMap::build(&[1, 2], 4, 1);
        assert!(r.array().iter().all(|&v| v == 0.0));
        assert_eq!(p.sids(), &[1, 2]);
        assert_eq!((p.num_levels(), p.num_columns()), (4, 1));
    }

    #[test]
    fn composition_is_order_independent() {
        let chunks: Vec<ProbabilityMap> = (0..4).map(chunk_map).collect();
        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
        let mut results = Vec::new();
        for order in orders {
            let mut acc: ProbabilityMap = ProbabilityMap::build(&[0, 3, 7], 3, 2);
            for i in order {
                acc.compose(&chunks[i]).unwrap();
            }
            results.push(acc.into_array());
        }
        for r in &results[1..] {
            for (a, b) in r.iter().zip(results[0].iter()) {
                assert!((a - b).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn rate_and_probability_kernels_agree_for_poissonian() {
        let occ = poisson(0.02);
        let poes = array![0.9, 0.5, 0.1];
        let mut pmap: ProbabilityMap = ProbabilityMap::build(&[0], 3, 1);
        let mut rmap = RateMap::build(&[0], 3, 1);
        for _ in 0..3 {
            pmap.update_indep(0, 0, 0, poes.view(), &occ, 50.0);
            rmap.update_rates(0, 0, 0, poes.view(), &occ, 50.0);
        }
        let from_rates = rmap.into_no_exceedance(50.0);
        for (a, b) in pmap.array().iter().zip(from_rates.array().iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn mutex_kernel_weights_exceedance() {
        let nonparam = RuptureOccurrence::NonParametric {
            probs_occur: vec![0.0, 1.0],
        };
        let mut emap = ExceedanceMap::build(&[0], 2, 1);
        emap.update_mutex(0, 0, 0, array![0.5, 0.2].view(), &nonparam, T, 0.6);
        emap.update_mutex(0, 0, 0, array![1.0, 0.4].view(), &nonparam, T, 0.4);
        let got = emap.array();
        assert!((got[[0, 0, 0]] - (0.6 * 0.5 + 0.4 * 1.0)).abs() < 1e-12);
        assert!((got[[0, 1, 0]] - (0.6 * 0.2 + 0.4 * 0.4)).abs() < 1e-12);
        let pne = emap.into_no_exceedance();
        assert!((pne.array()[[0, 0, 0]] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn mismatched_maps_do_not_combine() {
        let mut a: ProbabilityMap = ProbabilityMap::build(&[0, 1], 2, 1);
        let b: ProbabilityMap = ProbabilityMap::build(&[0, 2], 2, 1);
        assert!(a.compose(&b).is_err());
    }

    #[test]
    fn kernels_write_only_their_level_range() {
        let mut pmap: ProbabilityMap = ProbabilityMap::build(&[0], 5, 2);
        pmap.update_indep(0, 1, 3, array![0.5, 0.5].view(), &poisson(1.0), T);
        let arr = pmap.array();
        assert!(arr.slice(s![0, 0..3, ..]).iter().all(|&v| v == 1.0));
        assert!(arr.slice(s![0, 3..5, 0]).iter().all(|&v| v == 1.0));
        assert!(arr.slice(s![0, 3..5, 1]).iter().all(|&v| v < 1.0));
    }
}
