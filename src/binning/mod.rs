//! Histogram edges for magnitude, distance, location, epsilon and TRT.

pub mod geo;

use itertools::Itertools;
use tracing::debug;

use crate::config::DisaggConfig;
use crate::error::{DisaggError, Result};
use crate::rupture::RuptureGroup;
use crate::site::SiteCollection;

use geo::{lat_bin_count, lat_edges, lon_bin_count, lon_edges, spherical_bounding_box, unwrap_lon};

/// Edges shared read-only by every worker.
///
/// Longitude and latitude edges are per site, indexed by site position in the
/// [`SiteCollection`]. Longitude edges are unwrapped from the western edge and
/// may exceed 180 when a site's extent crosses the date line.
#[derive(Debug, Clone, PartialEq)]
pub struct BinEdges {
    pub mag: Vec<f64>,
    pub dist: Vec<f64>,
    pub lon: Vec<Vec<f64>>,
    pub lat: Vec<Vec<f64>>,
    pub eps: Vec<f64>,
    pub trts: Vec<String>,
}

/// Index of the bin holding `x`: bins are `[e_i, e_{i+1})`, the last one also
/// holds its right edge. Values outside the edges (and NaN) have no bin.
#[inline]
pub fn locate(edges: &[f64], x: f64) -> Option<usize> {
    let n = edges.len();
    if n < 2 || !(x >= edges[0]) || x > edges[n - 1] {
        return None;
    }
    if x == edges[n - 1] {
        return Some(n - 2);
    }
    Some(edges.partition_point(|&e| e <= x) - 1)
}

/// `ceil((max - min) / width) + 1`, the bin count of [`fixed_step_edges`].
pub fn fixed_step_count(min: f64, max: f64, width: f64) -> f64 {
    ((max - min) / width).ceil() + 1.0
}

/// `fixed_step_count` bins of `width`, starting at the multiple of `width`
/// just below `min`.
pub fn fixed_step_edges(min: f64, max: f64, width: f64) -> Vec<f64> {
    let k0 = (min / width).floor() as i64;
    let n_bins = fixed_step_count(min, max, width) as i64;
    (k0..=k0 + n_bins).map(|k| k as f64 * width).collect()
}

/// Exact integer value of a bin count, `None` when it is not representable.
fn bin_count(n: f64) -> Option<u64> {
    (n.is_finite() && n >= 0.0 && n < u64::MAX as f64).then_some(n as u64)
}

/// `n` equal epsilon bins spanning `[-truncation_level, truncation_level]`.
pub fn epsilon_edges(truncation_level: f64, n: usize) -> Vec<f64> {
    let step = 2.0 * truncation_level / n as f64;
    (0..=n)
        .map(|i| {
            if i == n {
                truncation_level
            } else {
                -truncation_level + i as f64 * step
            }
        })
        .collect()
}

impl BinEdges {
    #[inline]
    pub fn num_mag(&self) -> usize {
        self.mag.len() - 1
    }

    #[inline]
    pub fn num_dist(&self) -> usize {
        self.dist.len() - 1
    }

    #[inline]
    pub fn num_eps(&self) -> usize {
        self.eps.len() - 1
    }

    #[inline]
    pub fn num_trt(&self) -> usize {
        self.trts.len()
    }

    /// `(trt, mag, dist, lon, lat, eps)` bin counts for one site.
    pub fn shape(&self, site_idx: usize) -> [usize; 6] {
        [
            self.num_trt(),
            self.num_mag(),
            self.num_dist(),
            self.lon[site_idx].len() - 1,
            self.lat[site_idx].len() - 1,
            self.num_eps(),
        ]
    }

    pub fn cells(&self, site_idx: usize) -> u64 {
        self.shape(site_idx).iter().map(|&n| n as u64).product()
    }

    pub fn trt_index(&self, trt: &str) -> Option<usize> {
        self.trts.binary_search_by(|t| t.as_str().cmp(trt)).ok()
    }

    #[inline]
    pub fn mag_bin(&self, mag: f64) -> Option<usize> {
        locate(&self.mag, mag)
    }

    #[inline]
    pub fn dist_bin(&self, dist: f64) -> Option<usize> {
        locate(&self.dist, dist)
    }

    #[inline]
    pub fn lon_bin(&self, site_idx: usize, lon: f64) -> Option<usize> {
        let edges = &self.lon[site_idx];
        locate(edges, unwrap_lon(edges[0], lon))
    }

    #[inline]
    pub fn lat_bin(&self, site_idx: usize, lat: f64) -> Option<usize> {
        locate(&self.lat[site_idx], lat)
    }
}

/// Compute bin edges from every (rupture, site) pair within the integration
/// distance.
///
/// Fails before any matrix is allocated when a site's matrix would exceed
/// `max_disagg_bins` cells.
pub fn build_bin_edges(
    sites: &SiteCollection,
    groups: &[RuptureGroup],
    cfg: &DisaggConfig,
) -> Result<BinEdges> {
    let widths = &cfg.widths;
    let (mut mag_lo, mut mag_hi) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut dist_lo, mut dist_hi) = (f64::INFINITY, f64::NEG_INFINITY);
    let mut lons: Vec<Vec<f64>> = vec![Vec::new(); sites.len()];
    let mut lats: Vec<Vec<f64>> = vec![Vec::new(); sites.len()];

    for grp in groups {
        let max_dist = cfg.maximum_distance.get(&grp.trt);
        for ctx in &grp.contexts {
            for (k, &sid) in ctx.sids.iter().enumerate() {
                if ctx.dists[k] > max_dist {
                    continue;
                }
                let Some(pos) = sites.position(sid) else {
                    continue;
                };
                mag_lo = mag_lo.min(ctx.mag);
                mag_hi = mag_hi.max(ctx.mag);
                dist_lo = dist_lo.min(ctx.dists[k]);
                dist_hi = dist_hi.max(ctx.dists[k]);
                lons[pos].push(ctx.lons[k]);
                lats[pos].push(ctx.lats[k]);
            }
        }
    }
    if mag_lo > mag_hi {
        return Err(DisaggError::invalid(
            "no rupture lies within the integration distance of any site",
        ));
    }

    let boxes: Vec<(f64, f64, f64, f64)> = sites
        .iter()
        .enumerate()
        .map(|(pos, site)| {
            spherical_bounding_box(&lons[pos], &lats[pos])
                .unwrap_or((site.lon, site.lon, site.lat, site.lat))
        })
        .collect();
    let trts: Vec<String> = groups.iter().map(|g| g.trt.clone()).sorted().dedup().collect();

    // the ceiling is checked on the counts alone, before any edge is built
    let n_mag = fixed_step_count(mag_lo, mag_hi, widths.mag);
    let n_dist = fixed_step_count(dist_lo, dist_hi, widths.dist);
    for (pos, site) in sites.iter().enumerate() {
        let (west, east, north, south) = boxes[pos];
        let counts = [
            trts.len() as f64,
            n_mag,
            n_dist,
            lon_bin_count(west, east, widths.coord),
            lat_bin_count(south, north, widths.coord),
            widths.num_epsilon_bins as f64,
        ];
        let cells = counts
            .iter()
            .try_fold(1u64, |acc, &n| bin_count(n).and_then(|n| acc.checked_mul(n)));
        if cells.is_none_or(|c| c > cfg.max_disagg_bins) {
            return Err(DisaggError::TooManyBins {
                sid: site.sid,
                cells: cells.unwrap_or(u64::MAX),
                shape: counts.map(|n| {
                    bin_count(n).map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX))
                }),
                ceiling: cfg.max_disagg_bins,
            });
        }
    }

    let (lon, lat) = boxes
        .iter()
        .map(|&(west, east, north, south)| {
            (
                lon_edges(west, east, widths.coord),
                lat_edges(south, north, widths.coord),
            )
        })
        .unzip();
    let edges = BinEdges {
        mag: fixed_step_edges(mag_lo, mag_hi, widths.mag),
        dist: fixed_step_edges(dist_lo, dist_hi, widths.dist),
        lon,
        lat,
        eps: epsilon_edges(cfg.truncation_level, widths.num_epsilon_bins),
        trts,
    };
    for (pos, site) in sites.iter().enumerate() {
        debug!(sid = site.sid, shape = ?edges.shape(pos), "disaggregation bins");
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BinWidths, ImtLevels, IntegrationDistance};
    use crate::rupture::{RuptureContext, RuptureOccurrence};
    use crate::site::Site;

    fn poisson() -> RuptureOccurrence {
        RuptureOccurrence::Poissonian { rate: 1e-3 }
    }

    fn cfg(widths: BinWidths) -> DisaggConfig {
        let imtls = ImtLevels::new(vec![("PGA".into(), vec![0.1, 0.2])]).unwrap();
        let mut cfg = DisaggConfig::new(imtls, vec![0.1]);
        cfg.widths = widths;
        cfg.maximum_distance = IntegrationDistance::uniform(100.0);
        cfg
    }

    #[test]
    fn locate_is_half_open_with_closed_last_bin() {
        let edges = [5.0, 6.0, 7.0];
        assert_eq!(locate(&edges, 5.0), Some(0));
        assert_eq!(locate(&edges, 5.999), Some(0));
        assert_eq!(locate(&edges, 6.0), Some(1));
        assert_eq!(locate(&edges, 7.0), Some(1));
        assert_eq!(locate(&edges, 7.01), None);
        assert_eq!(locate(&edges, 4.99), None);
        assert_eq!(locate(&edges, f64::NAN), None);
    }

    #[test]
    fn fixed_step_count_matches_formula() {
        for &(min, max, width) in &[(5.0, 6.0, 1.0), (10.0, 50.0, 10.0), (5.2, 6.5, 0.5), (0.0, 0.0, 2.0)] {
            let edges = fixed_step_edges(min, max, width);
            let expected = ((max - min) / width).ceil() as usize + 1;
            assert_eq!(edges.len() - 1, expected, "min={min} max={max} width={width}");
            assert!(edges.windows(2).all(|w| w[1] > w[0]));
            assert!(edges[0] <= min && *edges.last().unwrap() > max);
        }
    }

    #[test]
    fn epsilon_edges_split_truncation_range() {
        let eps = epsilon_edges(3.0, 6);
        assert_eq!(eps.len(), 7);
        assert_eq!(eps[0], -3.0);
        assert_eq!(eps[6], 3.0);
        assert!((eps[3]).abs() < 1e-12);
    }

    #[test]
    fn edges_from_population_skip_far_ruptures() {
        let sites = SiteCollection::new(vec![Site::new(0, 0.0, 0.0), Site::new(1, 10.0, 10.0)]).unwrap();
        let near = RuptureContext::new(0, 0, 5.0, poisson()).with_site(0, 10.0, 0.1, 0.2);
        let other = RuptureContext::new(0, 1, 6.0, poisson()).with_site(0, 50.0, 0.4, 0.3);
        let far = RuptureContext::new(1, 2, 8.0, poisson()).with_site(1, 500.0, 12.0, 12.0);
        let groups = vec![
            RuptureGroup::independent(0, "Active", vec![near, other]),
            RuptureGroup::independent(1, "Stable", vec![far]),
        ];
        let edges = build_bin_edges(
            &sites,
            &groups,
            &cfg(BinWidths {
                mag: 1.0,
                dist: 10.0,
                coord: 0.5,
                num_epsilon_bins: 2,
            }),
        )
        .unwrap();
        assert_eq!(edges.mag, vec![5.0, 6.0, 7.0]);
        assert_eq!(edges.dist, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        assert_eq!(edges.trts, vec!["Active".to_string(), "Stable".to_string()]);
        assert_eq!(edges.lon[0], vec![0.0, 0.5]);
        assert_eq!(edges.lat[0], vec![0.0, 0.5]);
        // the second site only sees a far rupture: degenerate box on the site
        assert_eq!(edges.lon[1], vec![10.0, 10.5]);
        assert_eq!(edges.shape(0), [2, 2, 5, 1, 1, 2]);
        assert_eq!(edges.mag_bin(6.0), Some(1));
        assert_eq!(edges.trt_index("Stable"), Some(1));
    }

    #[test]
    fn bin_ceiling_fails_before_allocation() {
        let sites = SiteCollection::new(vec![Site::new(0, 0.0, 0.0)]).unwrap();
        let a = RuptureContext::new(0, 0, 4.0, poisson()).with_site(0, 0.0, -1.0, -1.0);
        let b = RuptureContext::new(0, 1, 8.0, poisson()).with_site(0, 99.0, 1.0, 1.0);
        let groups = vec![RuptureGroup::independent(0, "Active", vec![a, b])];
        let mut c = cfg(BinWidths {
            mag: 0.01,
            dist: 0.1,
            coord: 0.01,
            num_epsilon_bins: 10,
        });
        c.max_disagg_bins = 1_000_000;
        let err = build_bin_edges(&sites, &groups, &c).unwrap_err();
        assert!(matches!(err, DisaggError::TooManyBins { sid: 0, .. }));
    }

    #[test]
    fn tiny_width_is_refused_from_counts_alone() {
        let sites = SiteCollection::new(vec![Site::new(0, 0.0, 0.0)]).unwrap();
        let a = RuptureContext::new(0, 0, 5.0, poisson()).with_site(0, 0.0, 0.1, 0.1);
        let b = RuptureContext::new(0, 1, 6.0, poisson()).with_site(0, 100.0, 0.2, 0.2);
        let groups = vec![RuptureGroup::independent(0, "Active", vec![a, b])];
        let mut c = cfg(BinWidths {
            mag: 0.5,
            dist: 1e-9,
            coord: 0.5,
            num_epsilon_bins: 4,
        });
        assert!(c.validate().is_ok());
        // building these distance edges would need close to a terabyte
        let err = build_bin_edges(&sites, &groups, &c).unwrap_err();
        match err {
            DisaggError::TooManyBins { cells, shape, .. } => {
                assert!(shape[2] > 99_999_999_000);
                assert!(cells > c.max_disagg_bins);
            }
            other => panic!("unexpected error {other}"),
        }

        c.widths.dist = 1e-300;
        let err = build_bin_edges(&sites, &groups, &c).unwrap_err();
        assert!(matches!(err, DisaggError::TooManyBins { cells: u64::MAX, .. }));
    }
}
