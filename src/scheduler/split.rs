//! Task splitting and admission control.

use std::cmp::Reverse;
use std::ops::Range;

use tracing::{debug, warn};

use crate::binning::BinEdges;
use crate::config::DisaggConfig;
use crate::disagg::DisaggSeeds;
use crate::error::{DisaggError, Result};
use crate::rupture::RuptureGroup;

/// A chunk of ruptures handed to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub grp_idx: usize,
    /// Set when the group had to be split by magnitude bin.
    pub mag_bin: Option<usize>,
    /// Magnitude bins the task's ruptures fall in; partial matrices cover
    /// only this window.
    pub mag_range: Range<usize>,
    /// Indices into the group's contexts.
    pub ctx_idx: Vec<usize>,
    /// Ruptures weighted by the number of sites they reach.
    pub weight: f64,
}

fn rupture_weight(grp: &RuptureGroup, i: usize, max_dist: f64) -> f64 {
    grp.contexts[i].num_close_sites(max_dist).max(1) as f64
}

/// Split every group into tasks: one per group, or one per populated
/// magnitude bin when the group exceeds `max_task_weight`. Heaviest first.
pub fn split_tasks(groups: &[RuptureGroup], edges: &BinEdges, cfg: &DisaggConfig) -> Vec<Task> {
    let mut tasks = Vec::new();
    for (grp_idx, grp) in groups.iter().enumerate() {
        let max_dist = cfg.maximum_distance.get(&grp.trt);
        let contributing: Vec<usize> = (0..grp.contexts.len())
            .filter(|&i| grp.contexts[i].num_close_sites(max_dist) > 0)
            .collect();
        if contributing.is_empty() {
            debug!(grp_id = grp.grp_id, "group has no rupture within range; no task");
            continue;
        }
        let weight: f64 = contributing
            .iter()
            .map(|&i| rupture_weight(grp, i, max_dist))
            .sum();
        if weight <= cfg.max_task_weight {
            let (lo, hi) = contributing
                .iter()
                .filter_map(|&i| edges.mag_bin(grp.contexts[i].mag))
                .fold((usize::MAX, 0), |(lo, hi), b| (lo.min(b), hi.max(b + 1)));
            tasks.push(Task {
                grp_idx,
                mag_bin: None,
                mag_range: if lo < hi { lo..hi } else { 0..0 },
                ctx_idx: contributing,
                weight,
            });
            continue;
        }

        let mut by_mag: Vec<Task> = (0..edges.num_mag())
            .map(|b| Task {
                grp_idx,
                mag_bin: Some(b),
                mag_range: b..b + 1,
                ctx_idx: Vec::new(),
                weight: 0.0,
            })
            .collect();
        for i in contributing {
            // ruptures outside the magnitude edges contribute nothing
            let Some(b) = edges.mag_bin(grp.contexts[i].mag) else {
                continue;
            };
            by_mag[b].ctx_idx.push(i);
            by_mag[b].weight += rupture_weight(grp, i, max_dist);
        }
        for task in by_mag.into_iter().filter(|t| !t.ctx_idx.is_empty()) {
            if task.weight > cfg.max_task_weight {
                warn!(
                    grp_id = grp.grp_id,
                    mag_bin = ?task.mag_bin,
                    weight = task.weight,
                    budget = cfg.max_task_weight,
                    "magnitude-bin task still above the weight budget"
                );
            }
            tasks.push(task);
        }
    }
    tasks.sort_by_key(|t| Reverse(t.weight as u64));
    tasks
}

/// Bytes of one full set of matrices: every active site, every realization.
pub fn estimate_matrix_bytes(edges: &BinEdges, seeds: &DisaggSeeds, cfg: &DisaggConfig) -> u64 {
    window_bytes(edges, seeds, cfg, edges.num_mag())
}

/// Bytes of the partial matrices one task can hold, restricted to its
/// magnitude window.
pub fn estimate_task_bytes(task: &Task, edges: &BinEdges, seeds: &DisaggSeeds, cfg: &DisaggConfig) -> u64 {
    window_bytes(edges, seeds, cfg, task.mag_range.len())
}

/// Peak footprint: the reduced matrices plus the partials of the `batch`
/// largest tasks, which may be alive at the same time before a merge.
pub fn estimate_peak_bytes(
    tasks: &[Task],
    batch: usize,
    edges: &BinEdges,
    seeds: &DisaggSeeds,
    cfg: &DisaggConfig,
) -> u64 {
    let mut per_task: Vec<u64> = tasks
        .iter()
        .map(|t| estimate_task_bytes(t, edges, seeds, cfg))
        .collect();
    per_task.sort_unstable_by_key(|&b| Reverse(b));
    per_task
        .into_iter()
        .take(batch)
        .fold(estimate_matrix_bytes(edges, seeds, cfg), u64::saturating_add)
}

fn window_bytes(edges: &BinEdges, seeds: &DisaggSeeds, cfg: &DisaggConfig, n_mag: usize) -> u64 {
    let n_rlz = seeds.active.ncols() as u64;
    let per_cell = n_rlz * cfg.imtls.len() as u64 * cfg.poes_disagg.len() as u64 * 8;
    let full_mag = edges.num_mag().max(1) as u64;
    (0..seeds.active.nrows())
        .filter(|&pos| seeds.is_site_active(pos))
        .map(|pos| {
            (edges.cells(pos) / full_mag * n_mag as u64).saturating_mul(per_cell)
        })
        .fold(0u64, u64::saturating_add)
}

/// Refuse to start when `estimated * margin` exceeds the available memory.
pub fn preflight(estimated: u64, available: u64, margin: f64) -> Result<()> {
    if estimated as f64 * margin > available as f64 {
        return Err(DisaggError::Memory {
            estimated,
            available,
            margin,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImtLevels;
    use crate::rupture::{RuptureContext, RuptureOccurrence};
    use ndarray::{Array2, Array4};

    fn edges() -> BinEdges {
        BinEdges {
            mag: vec![5.0, 6.0, 7.0],
            dist: vec![0.0, 100.0],
            lon: vec![vec![0.0, 1.0], vec![0.0, 1.0, 2.0]],
            lat: vec![vec![0.0, 1.0], vec![0.0, 1.0]],
            eps: vec![-3.0, 3.0],
            trts: vec!["Active".into()],
        }
    }

    fn group(mags: &[f64]) -> RuptureGroup {
        let ctxs = mags
            .iter()
            .enumerate()
            .map(|(i, &mag)| {
                RuptureContext::new(0, i as u32, mag, RuptureOccurrence::Poissonian { rate: 1e-3 })
                    .with_site(0, 10.0, 0.5, 0.5)
                    .with_site(1, 20.0, 0.5, 0.5)
            })
            .collect();
        RuptureGroup::independent(0, "Active", ctxs)
    }

    fn cfg(budget: f64) -> DisaggConfig {
        let imtls = ImtLevels::new(vec![("PGA".into(), vec![0.1])]).unwrap();
        let mut cfg = DisaggConfig::new(imtls, vec![0.1, 0.02]);
        cfg.max_task_weight = budget;
        cfg
    }

    #[test]
    fn small_group_is_one_task() {
        let tasks = split_tasks(&[group(&[5.1, 6.2, 6.4])], &edges(), &cfg(100.0));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].mag_bin, None);
        assert_eq!(tasks[0].mag_range, 0..2);
        assert_eq!(tasks[0].weight, 6.0);

        let narrow = split_tasks(&[group(&[6.2, 6.4])], &edges(), &cfg(100.0));
        assert_eq!(narrow[0].mag_range, 1..2);
    }

    #[test]
    fn heavy_group_splits_by_magnitude_heaviest_first() {
        let tasks = split_tasks(&[group(&[5.1, 6.2, 6.4])], &edges(), &cfg(5.0));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].mag_bin, Some(1));
        assert_eq!(tasks[0].mag_range, 1..2);
        assert_eq!(tasks[0].ctx_idx, vec![1, 2]);
        assert_eq!(tasks[1].mag_bin, Some(0));
        assert_eq!(tasks[1].weight, 2.0);
    }

    #[test]
    fn footprint_counts_active_sites_only() {
        let seeds = DisaggSeeds {
            imls: Array4::zeros((2, 3, 1, 2)),
            active: Array2::from_shape_vec((2, 3), vec![true, false, false, false, false, false]).unwrap(),
        };
        // site 0: 1 * 2 * 1 * 1 * 1 * 1 cells x 3 rlz x 1 imt x 2 poe x 8 bytes
        assert_eq!(estimate_matrix_bytes(&edges(), &seeds, &cfg(1.0)), 2 * 3 * 2 * 8);
    }

    #[test]
    fn peak_adds_the_largest_in_flight_partials() {
        let seeds = DisaggSeeds {
            imls: Array4::zeros((2, 1, 1, 2)),
            active: Array2::from_shape_vec((2, 1), vec![true, true]).unwrap(),
        };
        let c = cfg(5.0);
        let tasks = split_tasks(&[group(&[5.1, 6.2, 6.4])], &edges(), &c);
        // site 0: 2 cells, site 1: 4 cells; 1 rlz x 1 imt x 2 poe x 8 bytes
        let full = estimate_matrix_bytes(&edges(), &seeds, &c);
        assert_eq!(full, (2 + 4) * 16);
        // each task covers one of the two magnitude bins
        assert_eq!(estimate_task_bytes(&tasks[0], &edges(), &seeds, &c), full / 2);
        assert_eq!(estimate_peak_bytes(&tasks, 1, &edges(), &seeds, &c), full + full / 2);
        assert_eq!(estimate_peak_bytes(&tasks, 8, &edges(), &seeds, &c), 2 * full);
    }

    #[test]
    fn preflight_applies_margin() {
        assert!(preflight(400, 1000, 2.0).is_ok());
        let err = preflight(600, 1000, 2.0).unwrap_err();
        assert!(matches!(err, DisaggError::Memory { estimated: 600, .. }));
    }
}
